//! Safety clamp
//!
//! Raise-only floor on curve output keyed to staged danger thresholds.
//! This runs on every tick whether or not hysteresis is enabled; thermal
//! protection (which can override the curve entirely) sits above it.

use tracing::warn;

use crate::constants::clamp;

/// Clamp a requested percent against the current temperature.
///
/// At or above 95 °C the result is 100 regardless of the request.
/// Otherwise staged floors apply: ≥90 → ≥80%, ≥85 → ≥60%, ≥80 → ≥40%.
/// The clamp only ever raises values.
pub fn clamp_for_temperature(percent: u8, temperature_c: f32) -> u8 {
    if temperature_c >= clamp::EMERGENCY_TEMP_C {
        if percent < 100 {
            warn!(
                requested = percent,
                temperature = temperature_c,
                "emergency override: forcing 100% fan"
            );
        }
        return 100;
    }

    for &(stage_temp, floor) in clamp::STAGES {
        if temperature_c >= stage_temp {
            return percent.max(floor);
        }
    }

    percent
}
