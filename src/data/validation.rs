//! Input validation for curves and percentages
//!
//! Invariant violations are rejected synchronously, before any hardware
//! I/O: a malformed curve never partially applies.

use crate::data::CurvePoint;
use crate::error::{FanCtlError, Result};

/// Maximum number of points a curve may carry
pub const MAX_CURVE_POINTS: usize = 32;

/// Validates that a percentage is within 0-100
pub fn validate_percentage(value: u16) -> Result<u8> {
    if value > 100 {
        return Err(FanCtlError::InvalidPercentage { value });
    }
    Ok(value as u8)
}

/// Validates curve points for consistency.
///
/// Requires at least two points, non-decreasing temperatures, and all
/// percents in 0-100.
pub fn validate_curve_points(points: &[CurvePoint]) -> Result<()> {
    if points.len() < 2 {
        return Err(FanCtlError::InvalidCurve(format!(
            "curve needs at least 2 points, got {}",
            points.len()
        )));
    }

    if points.len() > MAX_CURVE_POINTS {
        return Err(FanCtlError::InvalidCurve(format!(
            "curve exceeds maximum of {} points",
            MAX_CURVE_POINTS
        )));
    }

    for (index, point) in points.iter().enumerate() {
        if point.fan_percent > 100 {
            return Err(FanCtlError::InvalidCurve(format!(
                "point {} has fan percent {} (must be 0-100)",
                index, point.fan_percent
            )));
        }
    }

    for window in points.windows(2) {
        if window[1].temperature_c < window[0].temperature_c {
            return Err(FanCtlError::InvalidCurve(format!(
                "temperatures must be non-decreasing ({}°C followed by {}°C)",
                window[0].temperature_c, window[1].temperature_c
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(temperature_c: i32, fan_percent: u8) -> CurvePoint {
        CurvePoint { temperature_c, fan_percent }
    }

    #[test]
    fn test_validate_percentage() {
        assert!(validate_percentage(0).is_ok());
        assert!(validate_percentage(100).is_ok());
        assert!(validate_percentage(101).is_err());
        assert!(validate_percentage(150).is_err());
    }

    #[test]
    fn rejects_non_monotonic_temperature() {
        assert!(validate_curve_points(&[pt(50, 40), pt(40, 60)]).is_err());
    }

    #[test]
    fn rejects_out_of_range_percent() {
        assert!(validate_curve_points(&[pt(10, 150), pt(20, 50)]).is_err());
    }

    #[test]
    fn accepts_monotonic_curve() {
        assert!(validate_curve_points(&[pt(40, 20), pt(60, 60), pt(90, 100)]).is_ok());
        // Equal temperatures are allowed (degenerate segment)
        assert!(validate_curve_points(&[pt(40, 20), pt(40, 60)]).is_ok());
    }
}
