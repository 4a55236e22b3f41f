//! Core data types for fanctl-core

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::constants::thermal;
use crate::data::validation::validate_curve_points;
use crate::error::Result;

/// A point on a fan curve
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct CurvePoint {
    pub temperature_c: i32,
    /// Fan duty in percent, 0-100
    pub fan_percent: u8,
}

/// Validated, immutable piecewise-linear temperature→fan-percent mapping.
///
/// Invariants (enforced at construction, never afterwards):
/// - at least 2 points
/// - temperatures non-decreasing
/// - all percents in 0-100
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(try_from = "Vec<CurvePoint>", into = "Vec<CurvePoint>")]
pub struct FanCurve {
    points: Vec<CurvePoint>,
}

impl FanCurve {
    /// Build a curve, rejecting (not partially applying) any invariant violation.
    pub fn new(points: Vec<CurvePoint>) -> Result<Self> {
        validate_curve_points(&points)?;
        Ok(Self { points })
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }
}

impl TryFrom<Vec<CurvePoint>> for FanCurve {
    type Error = crate::error::FanCtlError;

    fn try_from(points: Vec<CurvePoint>) -> Result<Self> {
        Self::new(points)
    }
}

impl From<FanCurve> for Vec<CurvePoint> {
    fn from(curve: FanCurve) -> Self {
        curve.points
    }
}

/// One CPU/GPU temperature reading, produced every control-loop tick.
/// Retained in a bounded rolling window for display.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct ThermalSample {
    /// Milliseconds since Unix epoch
    pub timestamp_ms: u64,
    pub cpu_celsius: f32,
    pub gpu_celsius: f32,
}

impl ThermalSample {
    pub fn now(cpu_celsius: f32, gpu_celsius: f32) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { timestamp_ms, cpu_celsius, gpu_celsius }
    }

    /// Hottest of the two sensors; missing sensors report 0.0 and lose
    pub fn max_celsius(&self) -> f32 {
        self.cpu_celsius.max(self.gpu_celsius)
    }
}

/// Oscillation-suppression settings, supplied by configuration.
///
/// Mutated only by the owning service; read by the control loop.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct HysteresisSettings {
    pub enabled: bool,
    /// Temperature must move at least this far from the last commit before
    /// a new speed may be applied (°C)
    pub dead_zone_c: f32,
    /// Delay before committing a speed increase (seconds)
    pub ramp_up_delay_s: f32,
    /// Delay before committing a speed decrease (seconds)
    pub ramp_down_delay_s: f32,
    pub thermal_protection_enabled: bool,
    /// Clamped to [75, 95] on normalization
    pub thermal_protection_threshold_c: f32,
}

impl HysteresisSettings {
    /// Clamp out-of-range values into their documented bounds.
    pub fn normalized(mut self) -> Self {
        self.dead_zone_c = self.dead_zone_c.max(0.0);
        self.ramp_up_delay_s = self.ramp_up_delay_s.max(0.0);
        self.ramp_down_delay_s = self.ramp_down_delay_s.max(0.0);
        self.thermal_protection_threshold_c = self
            .thermal_protection_threshold_c
            .clamp(thermal::THRESHOLD_MIN_C, thermal::THRESHOLD_MAX_C);
        self
    }
}

impl Default for HysteresisSettings {
    fn default() -> Self {
        use crate::constants::hysteresis as hy;
        Self {
            enabled: true,
            dead_zone_c: hy::DEFAULT_DEAD_ZONE_C,
            ramp_up_delay_s: hy::DEFAULT_RAMP_UP_DELAY.as_secs_f32(),
            ramp_down_delay_s: hy::DEFAULT_RAMP_DOWN_DELAY.as_secs_f32(),
            thermal_protection_enabled: true,
            thermal_protection_threshold_c: thermal::WARNING_THRESHOLD_C,
        }
    }
}

/// Fan operating mode carried by a preset
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FanMode {
    /// Hardware/firmware automatic control
    Auto,
    /// Firmware quiet policy
    Quiet,
    /// Maximum cooling
    Max,
    /// User-defined curve
    Custom,
}

impl FanMode {
    /// Modes where firmware decides the speed; these get the warm-floor
    /// treatment when restored by thermal protection release.
    pub fn is_automatic(&self) -> bool {
        matches!(self, FanMode::Auto | FanMode::Quiet)
    }
}

/// Named fan preset supplied by the configuration store
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FanPreset {
    pub name: String,
    pub mode: FanMode,
    pub curve: Option<FanCurve>,
}

impl FanPreset {
    pub fn auto() -> Self {
        Self { name: "Auto".to_string(), mode: FanMode::Auto, curve: None }
    }

    pub fn max() -> Self {
        Self { name: "Max".to_string(), mode: FanMode::Max, curve: None }
    }

    pub fn quiet() -> Self {
        Self {
            name: "Quiet".to_string(),
            mode: FanMode::Quiet,
            curve: FanCurve::new(crate::constants::default_curve::quiet()).ok(),
        }
    }

    pub fn balanced() -> Self {
        Self {
            name: "Balanced".to_string(),
            mode: FanMode::Custom,
            curve: FanCurve::new(crate::constants::default_curve::balanced()).ok(),
        }
    }

    pub fn performance() -> Self {
        Self {
            name: "Performance".to_string(),
            mode: FanMode::Custom,
            curve: FanCurve::new(crate::constants::default_curve::performance()).ok(),
        }
    }

    /// The presets shipped by default, in display order
    pub fn builtin() -> Vec<Self> {
        vec![Self::auto(), Self::quiet(), Self::balanced(), Self::performance(), Self::max()]
    }
}

/// Which curve configuration is currently driving the fans.
///
/// Variants are mutually exclusive; switching modes clears the other.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ActiveCurve {
    #[default]
    None,
    /// One curve applied to max(cpu, gpu)
    Unified(FanCurve),
    /// CPU and GPU curves evaluated separately
    Independent { cpu: FanCurve, gpu: FanCurve },
}

impl ActiveCurve {
    pub fn is_none(&self) -> bool {
        matches!(self, ActiveCurve::None)
    }
}
