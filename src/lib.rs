//! Fan control core library
//!
//! Temperature-driven fan control for laptops with firmware-managed fan
//! controllers.
//!
//! # Features
//!
//! - **Fan Curves**: Piecewise-linear temperature/speed curves with
//!   hysteresis, ramping, and a raise-only safety clamp
//! - **Thermal Protection**: Debounced warning/emergency override with
//!   snapshot-and-restore of the prior fan state
//! - **Control Loop**: Adaptive-interval async loop with failsafe
//!   behavior on persistent hardware errors
//! - **Verification**: Closed-loop apply-and-measure with statistical
//!   tolerance checks and full-range calibration sweeps
//!
//! # Module Structure
//!
//! - `hw/` - Hardware interfaces (controller trait, probing, telemetry,
//!   simulated backend)
//! - `data/` - Data types and validation
//! - `engine/` - Curve engine, protection, and the control loop
//! - `verify/` - Closed-loop verification and calibration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fanctl_core::data::{CurvePoint, FanCurve};
//! use fanctl_core::engine::{ControlConfig, FanControlService};
//! use fanctl_core::hw::sim::SimulatedFan;
//! use fanctl_core::hw::{FanController, TemperatureSource};
//!
//! # async fn demo() -> fanctl_core::Result<()> {
//! let backend = Arc::new(SimulatedFan::builder().build());
//! let service = Arc::new(FanControlService::new(
//!     Arc::clone(&backend) as Arc<dyn FanController>,
//!     Arc::clone(&backend) as Arc<dyn TemperatureSource>,
//!     ControlConfig::default(),
//! ));
//!
//! service.set_unified_curve(FanCurve::new(vec![
//!     CurvePoint { temperature_c: 40, fan_percent: 20 },
//!     CurvePoint { temperature_c: 90, fan_percent: 100 },
//! ])?);
//!
//! service.run().await;
//! # Ok(())
//! # }
//! ```

// Grouped modules
pub mod data;
pub mod engine;
pub mod hw;
pub mod verify;

// Standalone modules
pub mod constants;
pub mod error;
pub mod events;
pub mod retry;

// Re-export primary types from data/
pub use data::{
    ActiveCurve, CurvePoint, FanCurve, FanMode, FanPreset, HysteresisSettings, ThermalSample,
};

// Re-export validation functions from data/
pub use data::{validate_curve_points, validate_percentage};

// Re-export engine entry points
pub use engine::{ControlConfig, FanControlService, ProtectionState, Severity};

// Re-export hardware interfaces
pub use hw::{ControllerCapabilities, FanController, FanReading, SensorReading, TemperatureSource};

// Re-export verification entry points
pub use verify::{
    CancelHandle, FanApplyResult, FanCalibrationResult, FanVerifier, VerificationConfig,
    VerificationRating,
};

pub use error::{FanCtlError, Result};
pub use events::ControlEvent;
