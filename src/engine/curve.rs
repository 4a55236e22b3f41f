//! Fan curve evaluation
//!
//! Pure piecewise-linear interpolation over a validated [`FanCurve`].
//! State (hysteresis, ramping) lives in [`crate::engine::hysteresis`];
//! this module only maps a temperature to a raw target percent.

use crate::data::FanCurve;

const FLOAT_EPSILON: f32 = 1e-6;

/// Evaluate a curve at the given temperature.
///
/// - Below the first point: that point's percent.
/// - Above the last point: that point's percent (curves never imply a
///   speed reduction above their top).
/// - Between points: linear interpolation on the bracketing segment.
/// - Degenerate segments (zero temperature delta) use the lower point.
pub fn evaluate(curve: &FanCurve, temperature_c: f32) -> u8 {
    let points = curve.points();

    // Validated curves always have >= 2 points, but stay safe
    let first = match points.first() {
        Some(p) => p,
        None => return 100,
    };
    let last = match points.last() {
        Some(p) => p,
        None => return 100,
    };

    if temperature_c <= first.temperature_c as f32 {
        return first.fan_percent;
    }
    if temperature_c >= last.temperature_c as f32 {
        return last.fan_percent;
    }

    for window in points.windows(2) {
        let lower = &window[0];
        let upper = &window[1];
        let lo_temp = lower.temperature_c as f32;
        let hi_temp = upper.temperature_c as f32;

        if temperature_c >= lo_temp && temperature_c <= hi_temp {
            let temp_range = hi_temp - lo_temp;
            if temp_range.abs() < FLOAT_EPSILON {
                return lower.fan_percent;
            }

            let ratio = (temperature_c - lo_temp) / temp_range;
            let fan_range = upper.fan_percent as f32 - lower.fan_percent as f32;
            let value = lower.fan_percent as f32 + ratio * fan_range;
            return value.round().clamp(0.0, 100.0) as u8;
        }
    }

    // Unreachable for a validated curve; fail toward full cooling
    100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CurvePoint;

    fn curve(points: &[(i32, u8)]) -> FanCurve {
        FanCurve::new(
            points
                .iter()
                .map(|&(temperature_c, fan_percent)| CurvePoint { temperature_c, fan_percent })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn interpolates_between_points() {
        let c = curve(&[(40, 20), (60, 60), (90, 100)]);
        assert_eq!(evaluate(&c, 50.0), 40);
        assert_eq!(evaluate(&c, 75.0), 80);
    }

    #[test]
    fn clamps_to_endpoints() {
        let c = curve(&[(40, 20), (60, 60), (90, 100)]);
        assert_eq!(evaluate(&c, 30.0), 20);
        assert_eq!(evaluate(&c, 40.0), 20);
        assert_eq!(evaluate(&c, 100.0), 100);
        assert_eq!(evaluate(&c, 90.0), 100);
    }

    #[test]
    fn degenerate_segment_uses_lower_point() {
        let c = curve(&[(40, 20), (60, 40), (60, 80), (90, 100)]);
        assert_eq!(evaluate(&c, 60.0), 40);
    }

    #[test]
    fn monotonic_curve_gives_monotonic_output() {
        let c = curve(&[(30, 10), (50, 35), (70, 70), (95, 100)]);
        let mut last = 0u8;
        for t in 0..120 {
            let v = evaluate(&c, t as f32);
            assert!(v >= last, "output dropped at {}°C: {} < {}", t, v, last);
            last = v;
        }
    }
}
