//! Constants and configuration defaults for fanctl-core
//!
//! Centralizes all magic numbers and tuning defaults. These are defaults,
//! not protocol guarantees: every threshold here is also a field on a
//! config struct that a host may override (or feed from calibration data).

use std::time::Duration;

/// Thermal protection defaults
pub mod thermal {
    /// Temperature at which protection activates after the debounce (°C)
    pub const WARNING_THRESHOLD_C: f32 = 90.0;

    /// Temperature at which protection activates immediately (°C)
    pub const EMERGENCY_THRESHOLD_C: f32 = 95.0;

    /// Release line is `warning - RELEASE_HYSTERESIS_C`
    pub const RELEASE_HYSTERESIS_C: f32 = 10.0;

    /// Temperature must hold above the warning threshold this long to activate
    pub const ACTIVATION_DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(5);

    /// Temperature must hold below the release line this long to release
    pub const RELEASE_DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(15);

    /// Fan floor while protection is active at the warning level (%)
    pub const WARNING_FLOOR_PERCENT: u8 = 85;

    /// Below this temperature a released system may idle back to BIOS control (°C)
    pub const SAFE_RELEASE_TEMP_C: f32 = 65.0;

    /// Minimum fan percent imposed on release while still warm
    pub const RELEASE_MIN_PERCENT: u8 = 40;

    /// User-configurable protection threshold is clamped to this range (°C)
    pub const THRESHOLD_MIN_C: f32 = 75.0;
    pub const THRESHOLD_MAX_C: f32 = 95.0;
}

/// Safety clamp stages: temperature floor pairs, checked highest first.
/// At or above 95 °C the clamp forces 100% unconditionally.
pub mod clamp {
    pub const EMERGENCY_TEMP_C: f32 = 95.0;
    pub const STAGES: &[(f32, u8)] = &[(90.0, 80), (85.0, 60), (80.0, 40)];
}

/// Control loop timing
pub mod timing {
    use super::Duration;

    /// Poll interval while temperatures are changing
    pub const FAST_POLL: Duration = Duration::from_secs(1);

    /// Poll interval while temperatures are stable
    pub const SLOW_POLL: Duration = Duration::from_secs(3);

    /// Both CPU and GPU deltas below this count as "stable" (°C)
    pub const STABILITY_THRESHOLD_C: f32 = 3.0;

    /// Minimum interval between ordinary curve re-applies
    pub const CURVE_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

    /// Re-issue the current speed this often even when nothing changed,
    /// to defeat firmware that silently reclaims fan control
    pub const FORCE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

    /// Consecutive tick failures before the loop gives up entirely
    pub const MAX_CONSECUTIVE_ERRORS: u32 = 60;

    /// Rolling telemetry window capacity (samples)
    pub const SAMPLE_WINDOW: usize = 120;
}

/// Hysteresis and ramp defaults
pub mod hysteresis {
    use super::Duration;

    pub const DEFAULT_DEAD_ZONE_C: f32 = 3.0;
    pub const DEFAULT_RAMP_UP_DELAY: Duration = Duration::from_secs(2);
    pub const DEFAULT_RAMP_DOWN_DELAY: Duration = Duration::from_secs(8);

    /// Total time a smoothed ramp takes to reach its target
    pub const RAMP_DURATION: Duration = Duration::from_secs(3);

    /// Interval between ramp steps
    pub const RAMP_STEP_INTERVAL: Duration = Duration::from_millis(500);
}

/// Hardware write retry policy (transient driver failures)
pub mod retry {
    use super::Duration;

    pub const WRITE_ATTEMPTS: u32 = 3;
    pub const WRITE_DELAY: Duration = Duration::from_millis(250);
}

/// Closed-loop verification defaults
pub mod verify {
    use super::Duration;

    /// Fans have mechanical inertia; wait this long before sampling
    pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

    pub const SAMPLE_COUNT: usize = 5;
    pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

    /// Relative tolerance on |measured - expected|
    pub const TOLERANCE: f64 = 0.15;

    /// Extra measurement attempts after a failed verification
    pub const RETRIES: u32 = 2;
    pub const RETRY_DELAY: Duration = Duration::from_secs(1);

    /// A fan commanded to 0% passes when RPM is below this
    pub const STOPPED_RPM_THRESHOLD: u32 = 1000;

    /// Model-agnostic linear percent→RPM ceiling, pending calibration
    pub const EXPECTED_MAX_RPM: u32 = 5500;

    /// Enhanced verification: extra cycles with longer settle and more samples
    pub const ENHANCED_CYCLES: u32 = 2;
    pub const ENHANCED_SETTLE_DELAY: Duration = Duration::from_secs(4);
    pub const ENHANCED_SAMPLE_COUNT: usize = 8;
    pub const ENHANCED_TOLERANCE: f64 = 0.25;

    /// Delay before an auto-revert re-applies the previous speed
    pub const REVERT_DELAY: Duration = Duration::from_secs(1);

    /// Calibration point ladder (percent targets, applied in order)
    pub const CALIBRATION_LADDER: &[u8] = &[0, 20, 40, 60, 80, 100];

    /// Thermal/mechanical stabilization wait between calibration points
    pub const CALIBRATION_SETTLE: Duration = Duration::from_secs(5);
}

/// Built-in default curves
pub mod default_curve {
    use crate::data::CurvePoint;

    pub fn quiet() -> Vec<CurvePoint> {
        vec![
            CurvePoint { temperature_c: 45, fan_percent: 0 },
            CurvePoint { temperature_c: 60, fan_percent: 25 },
            CurvePoint { temperature_c: 75, fan_percent: 50 },
            CurvePoint { temperature_c: 90, fan_percent: 100 },
        ]
    }

    pub fn balanced() -> Vec<CurvePoint> {
        vec![
            CurvePoint { temperature_c: 40, fan_percent: 20 },
            CurvePoint { temperature_c: 60, fan_percent: 45 },
            CurvePoint { temperature_c: 75, fan_percent: 70 },
            CurvePoint { temperature_c: 85, fan_percent: 100 },
        ]
    }

    pub fn performance() -> Vec<CurvePoint> {
        vec![
            CurvePoint { temperature_c: 30, fan_percent: 30 },
            CurvePoint { temperature_c: 50, fan_percent: 55 },
            CurvePoint { temperature_c: 65, fan_percent: 80 },
            CurvePoint { temperature_c: 80, fan_percent: 100 },
        ]
    }
}
