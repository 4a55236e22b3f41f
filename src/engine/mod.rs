//! Control engine modules
//!
//! Pure decision logic (curve evaluation, clamping, hysteresis, thermal
//! protection) plus the async control loop that drives hardware with it.

pub mod clamp;
pub mod control;
pub mod curve;
pub mod hysteresis;
pub mod protection;

pub use clamp::clamp_for_temperature;
pub use control::{ControlConfig, FanControlService};
pub use curve::evaluate;
pub use hysteresis::{plan_ramp, Decision, HysteresisController};
pub use protection::{
    PriorFanState, ProtectionConfig, ProtectionDecision, ProtectionState, RestoreAction, Severity,
    ThermalProtection,
};
