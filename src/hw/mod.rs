//! Hardware-facing collaborator interfaces
//!
//! The two I/O boundaries of the core: the fan controller and the
//! temperature source. Real transports live outside this crate; `sim`
//! provides a software backend for tests and dry runs.

pub mod controller;
pub mod probe;
pub mod sim;
pub mod telemetry;

pub use controller::{ControllerCapabilities, FanController, FanReading};
pub use probe::probe_controllers;
pub use telemetry::{select_cpu_gpu, SensorReading, TemperatureSource};
