//! Apply-and-verify result model
//!
//! A result object is created fresh per verified apply and never mutated
//! after return. Scores are derived metrics: accuracy against the
//! expected RPM (0-50), sample stability (0-30) and response relative to
//! the starting point (0-20).

use serde::{Deserialize, Serialize};

/// Discrete quality rating derived from the 0-100 verification score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationRating {
    Excellent,
    Good,
    Fair,
    Poor,
    Failed,
}

impl VerificationRating {
    pub fn from_score(score: f64, passed: bool) -> Self {
        if !passed {
            return Self::Failed;
        }
        if score >= 90.0 {
            Self::Excellent
        } else if score >= 75.0 {
            Self::Good
        } else if score >= 60.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

impl std::fmt::Display for VerificationRating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of one apply-and-verify call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanApplyResult {
    pub fan_index: usize,
    pub requested_percent: u8,
    /// Controller-specific level actually programmed
    pub applied_level: u8,
    pub rpm_before: u32,
    /// Mean of the verification samples
    pub rpm_after: u32,
    pub expected_rpm: u32,
    /// Whether the hardware write itself succeeded
    pub write_succeeded: bool,
    pub verification_passed: bool,
    pub std_deviation: f64,
    pub sample_count: usize,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

impl FanApplyResult {
    /// Absolute deviation from the expected RPM, in percent of expected
    pub fn deviation_percent(&self) -> f64 {
        if self.expected_rpm == 0 {
            return 0.0;
        }
        let expected = self.expected_rpm as f64;
        ((self.rpm_after as f64 - expected).abs() / expected) * 100.0
    }

    /// Composite 0-100 score: accuracy 0-50, stability 0-30, response 0-20
    pub fn verification_score(&self) -> f64 {
        if !self.write_succeeded {
            return 0.0;
        }

        // Accuracy: full marks at zero deviation, none at >= 50% deviation.
        // Stopped-fan targets have no meaningful expected RPM; pass/fail
        // carries the whole accuracy component.
        let accuracy = if self.expected_rpm == 0 {
            if self.verification_passed {
                50.0
            } else {
                0.0
            }
        } else {
            let dev_fraction = self.deviation_percent() / 100.0;
            50.0 * (1.0 - (dev_fraction / 0.5).min(1.0))
        };

        // Stability: coefficient of variation of the samples, 20% CV or
        // worse scores zero
        let stability = if self.rpm_after == 0 {
            if self.std_deviation == 0.0 {
                30.0
            } else {
                0.0
            }
        } else {
            let cv = self.std_deviation / self.rpm_after as f64;
            30.0 * (1.0 - (cv / 0.2).min(1.0))
        };

        // Response: how far the fan moved relative to how far it needed to
        let needed = (self.expected_rpm as f64 - self.rpm_before as f64).abs();
        let response = if needed < 1.0 {
            20.0
        } else {
            let moved = (self.rpm_after as f64 - self.rpm_before as f64).abs();
            20.0 * (moved / needed).clamp(0.0, 1.0)
        };

        (accuracy + stability + response).clamp(0.0, 100.0)
    }

    pub fn rating(&self) -> VerificationRating {
        VerificationRating::from_score(self.verification_score(), self.verification_passed)
    }
}
