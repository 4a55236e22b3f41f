//! Data types and validation

pub mod types;
pub mod validation;

pub use types::{
    ActiveCurve, CurvePoint, FanCurve, FanMode, FanPreset, HysteresisSettings, ThermalSample,
};
pub use validation::{validate_curve_points, validate_percentage, MAX_CURVE_POINTS};
