//! Calibration sweep across the fan's whole operating range
//!
//! Steps the fan through a ladder of speed points, letting it stabilize
//! at each, and records measured RPM against the linear expectation. The
//! sweep always visits every ladder point regardless of earlier
//! failures; only cancellation cuts it short.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::events::ControlEvent;

use super::result::VerificationRating;
use super::FanVerifier;

/// One measured point of the calibration ladder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanCalibrationPoint {
    pub requested_percent: u8,
    pub measured_rpm: u32,
    pub rpm_min: u32,
    pub rpm_max: u32,
    /// Per-point quality score, 0-100
    pub score: f64,
    pub passed: bool,
}

/// Full sweep outcome. `cancelled` means the sweep was cut short and
/// `points` holds only what was measured before the cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanCalibrationResult {
    pub fan_index: usize,
    pub points: Vec<FanCalibrationPoint>,
    pub overall_score: f64,
    pub rating: VerificationRating,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl FanVerifier {
    /// Run the calibration sweep for one fan. The caller is expected to
    /// restore the previous fan state afterwards; the sweep itself leaves
    /// the fan at the last ladder point it reached.
    pub async fn calibrate_fan(&self, fan_index: usize) -> FanCalibrationResult {
        let start = Instant::now();
        let ladder = self.config().calibration_ladder.clone();
        let mut points = Vec::with_capacity(ladder.len());
        let mut cancelled = false;

        info!(fan_index, ?ladder, "starting calibration sweep");

        for &percent in &ladder {
            if self.is_cancelled() {
                cancelled = true;
                break;
            }
            points.push(self.calibrate_point(fan_index, percent).await);
        }

        let overall_score = if points.is_empty() {
            0.0
        } else {
            points.iter().map(|p| p.score).sum::<f64>() / points.len() as f64
        };
        let rating = VerificationRating::from_score(overall_score, !cancelled);

        let result = FanCalibrationResult {
            fan_index,
            points,
            overall_score,
            rating,
            cancelled,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            fan_index,
            overall_score,
            rating = %result.rating,
            cancelled,
            "calibration sweep finished"
        );
        self.emit(ControlEvent::CalibrationCompleted { result: result.clone() });
        result
    }

    /// Measure one ladder point through the full verification protocol,
    /// standard cycle plus lenient re-measurement cycles, with the longer
    /// calibration settle. Failures produce a zero-score point; the sweep
    /// moves on either way. Reverting is the sweep's job, not the point's.
    async fn calibrate_point(&self, fan_index: usize, percent: u8) -> FanCalibrationPoint {
        let (result, stats, extra_cycles) = self
            .apply_with_cycles(fan_index, percent, self.config().calibration_settle)
            .await;

        if let Some(msg) = &result.error_message {
            warn!(fan_index, percent, error = %msg, "calibration point did not verify");
        } else if extra_cycles > 0 {
            info!(fan_index, percent, extra_cycles, "calibration point settled late");
        }

        let (rpm_min, rpm_max) = stats.map(|s| (s.min, s.max)).unwrap_or((0, 0));
        FanCalibrationPoint {
            requested_percent: percent,
            measured_rpm: result.rpm_after,
            rpm_min,
            rpm_max,
            score: result.verification_score(),
            passed: result.verification_passed,
        }
    }
}
