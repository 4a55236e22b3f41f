//! Closed-loop verification engine
//!
//! Apply-then-measure: command a speed, wait out mechanical inertia,
//! sample the actual RPM and statistically validate it against the
//! expected value. Failures are reported as structured results, never
//! panics; persistent failures can auto-revert to the previous state.
//!
//! The engine owns no persistent state beyond its own counters and talks
//! to hardware only through the [`FanController`] and telemetry
//! interfaces, so it can run concurrently with the control loop.

pub mod calibration;
pub mod result;

pub use calibration::{FanCalibrationPoint, FanCalibrationResult};
pub use result::{FanApplyResult, VerificationRating};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::constants::{retry as retry_const, verify as verify_const};
use crate::error::{FanCtlError, Result};
use crate::events::ControlEvent;
use crate::hw::FanController;
use crate::retry::retry_with_delay;

/// Tunables for the verification protocol. The expected-RPM model is a
/// plain linear 0→0, 100→`expected_max_rpm` assumption pending real
/// calibration data; hosts should feed calibrated values back in here.
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub settle_delay: Duration,
    pub sample_count: usize,
    pub sample_interval: Duration,
    /// Relative tolerance on |measured - expected|
    pub tolerance: f64,
    /// Re-measurement attempts after a failed verification
    pub retries: u32,
    pub retry_delay: Duration,
    /// A 0% request passes when measured RPM is below this
    pub stopped_rpm_threshold: u32,
    pub expected_max_rpm: u32,
    /// Transient hardware write retry policy
    pub write_attempts: u32,
    pub write_delay: Duration,
    pub enhanced_cycles: u32,
    pub enhanced_settle_delay: Duration,
    pub enhanced_sample_count: usize,
    pub enhanced_tolerance: f64,
    pub auto_revert: bool,
    pub revert_delay: Duration,
    pub calibration_ladder: Vec<u8>,
    pub calibration_settle: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            settle_delay: verify_const::SETTLE_DELAY,
            sample_count: verify_const::SAMPLE_COUNT,
            sample_interval: verify_const::SAMPLE_INTERVAL,
            tolerance: verify_const::TOLERANCE,
            retries: verify_const::RETRIES,
            retry_delay: verify_const::RETRY_DELAY,
            stopped_rpm_threshold: verify_const::STOPPED_RPM_THRESHOLD,
            expected_max_rpm: verify_const::EXPECTED_MAX_RPM,
            write_attempts: retry_const::WRITE_ATTEMPTS,
            write_delay: retry_const::WRITE_DELAY,
            enhanced_cycles: verify_const::ENHANCED_CYCLES,
            enhanced_settle_delay: verify_const::ENHANCED_SETTLE_DELAY,
            enhanced_sample_count: verify_const::ENHANCED_SAMPLE_COUNT,
            enhanced_tolerance: verify_const::ENHANCED_TOLERANCE,
            auto_revert: true,
            revert_delay: verify_const::REVERT_DELAY,
            calibration_ladder: verify_const::CALIBRATION_LADDER.to_vec(),
            calibration_settle: verify_const::CALIBRATION_SETTLE,
        }
    }
}

/// Outcome of the enhanced protocol: the final result plus how hard the
/// engine had to work and whether an auto-revert ran.
#[derive(Debug, Clone)]
pub struct EnhancedApplyOutcome {
    pub result: FanApplyResult,
    pub extra_cycles: u32,
    pub revert: Option<RevertOutcome>,
}

/// Whether the auto-revert to the previous percent took effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevertOutcome {
    pub target_percent: u8,
    pub succeeded: bool,
}

/// Cancels in-flight verifier work from another task; waking any delay
/// the verifier is currently sleeping in.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Parameters for one measurement cycle
struct CycleParams {
    settle: Duration,
    samples: usize,
    tolerance: f64,
    /// Restore automatic hardware control if verification ultimately fails
    restore_on_failure: bool,
}

/// Statistics from one sampling pass
struct RpmStats {
    mean: f64,
    std_dev: f64,
    count: usize,
    min: u32,
    max: u32,
}

/// Closed-loop verification engine for one controller
pub struct FanVerifier {
    controller: Arc<dyn FanController>,
    config: VerificationConfig,
    cancel: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    events: Option<broadcast::Sender<ControlEvent>>,
}

impl FanVerifier {
    pub fn new(controller: Arc<dyn FanController>, config: VerificationConfig) -> Self {
        Self {
            controller,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            cancel_notify: Arc::new(Notify::new()),
            events: None,
        }
    }

    /// Attach an event channel; verification and calibration results are
    /// broadcast on completion.
    pub fn with_events(mut self, events: broadcast::Sender<ControlEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Handle for cancelling in-flight operations from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { flag: Arc::clone(&self.cancel), notify: Arc::clone(&self.cancel_notify) }
    }

    /// Request cooperative cancellation; in-flight delays abort promptly
    /// and hardware stays at its last successfully-applied state.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    /// Clear a previous cancellation before starting new work
    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Sleep that a concurrent [`cancel`](Self::cancel) wakes immediately.
    /// Returns true when cancellation was requested.
    async fn cancelled_during(&self, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return self.is_cancelled(),
                _ = self.cancel_notify.notified() => {}
            }
        }
    }

    fn emit(&self, event: ControlEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Fans the capability report promises; anything else is rejected
    /// before hardware is touched.
    fn fan_count(&self) -> usize {
        if self.controller.capabilities().dual_fan {
            2
        } else {
            1
        }
    }

    /// Linear percent→RPM expectation (0% → 0, 100% → ceiling)
    fn expected_rpm(&self, percent: u8) -> u32 {
        (percent as u64 * self.config.expected_max_rpm as u64 / 100) as u32
    }

    fn tolerance_ok(&self, requested: u8, mean: f64, expected: u32, tolerance: f64) -> bool {
        if requested == 0 {
            return mean < self.config.stopped_rpm_threshold as f64;
        }
        (mean - expected as f64).abs() <= expected as f64 * tolerance
    }

    async fn read_rpm(&self, fan_index: usize) -> Result<u32> {
        let readings = self.controller.read_fan_speeds().await?;
        readings
            .get(fan_index)
            .map(|r| r.rpm)
            .ok_or(FanCtlError::FanNotFound { index: fan_index, available: readings.len() })
    }

    /// Sample RPM `count` times. Cancellation aborts between samples and
    /// wakes the inter-sample delays.
    async fn sample_rpm(
        &self,
        fan_index: usize,
        count: usize,
        interval: Duration,
    ) -> Result<RpmStats> {
        let count = count.max(1);
        let mut samples = Vec::with_capacity(count);

        for i in 0..count {
            if self.is_cancelled() {
                return Err(FanCtlError::Cancelled);
            }
            samples.push(self.read_rpm(fan_index).await?);
            if i + 1 < count && self.cancelled_during(interval).await {
                return Err(FanCtlError::Cancelled);
            }
        }

        let n = samples.len();
        let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n as f64;
        let variance =
            samples.iter().map(|&s| (s as f64 - mean).powi(2)).sum::<f64>() / n as f64;
        Ok(RpmStats {
            mean,
            std_dev: variance.sqrt(),
            count: n,
            min: samples.iter().copied().min().unwrap_or(0),
            max: samples.iter().copied().max().unwrap_or(0),
        })
    }

    /// Issue the hardware write with bounded retry. 100% prefers the
    /// dedicated max-cooling path when the backend has one, since linear
    /// level mapping is sometimes capped below true maximum by firmware.
    async fn issue_write(&self, percent: u8) -> Result<u8> {
        let cfg = &self.config;
        if percent == 100 && self.controller.capabilities().max_command {
            retry_with_delay(cfg.write_attempts, cfg.write_delay, || {
                self.controller.apply_max_cooling()
            })
            .await?;
        } else {
            retry_with_delay(cfg.write_attempts, cfg.write_delay, || {
                self.controller.set_fan_speed(percent)
            })
            .await?;
        }
        Ok(self.controller.level_for_percent(percent))
    }

    /// Apply a speed and verify it took effect. Always returns a result
    /// object; failures are folded into its fields.
    pub async fn apply_and_verify(&self, fan_index: usize, percent: u8) -> FanApplyResult {
        let params = CycleParams {
            settle: self.config.settle_delay,
            samples: self.config.sample_count,
            tolerance: self.config.tolerance,
            restore_on_failure: true,
        };
        let (result, _) = self.apply_and_verify_cycle(fan_index, percent, &params).await;
        self.emit(ControlEvent::VerificationCompleted { result: result.clone() });
        result
    }

    async fn apply_and_verify_cycle(
        &self,
        fan_index: usize,
        percent: u8,
        params: &CycleParams,
    ) -> (FanApplyResult, Option<RpmStats>) {
        let start = Instant::now();
        let cfg = &self.config;
        let expected_rpm = self.expected_rpm(percent);

        let mut result = FanApplyResult {
            fan_index,
            requested_percent: percent,
            applied_level: self.controller.level_for_percent(percent),
            rpm_before: 0,
            rpm_after: 0,
            expected_rpm,
            write_succeeded: false,
            verification_passed: false,
            std_deviation: 0.0,
            sample_count: 0,
            duration_ms: 0,
            error_message: None,
        };

        // Reject bad indices synchronously, before any hardware I/O
        let fan_count = self.fan_count();
        if fan_index >= fan_count {
            let err = FanCtlError::FanNotFound { index: fan_index, available: fan_count };
            result.error_message = Some(err.to_string());
            return (result, None);
        }

        result.rpm_before = self.read_rpm(fan_index).await.unwrap_or(0);

        match self.issue_write(percent).await {
            Ok(level) => {
                result.write_succeeded = true;
                result.applied_level = level;
            }
            Err(e) => {
                // Terminal for this attempt: no measurement without a write
                warn!(fan_index, percent, error = %e, "hardware write failed");
                result.error_message = Some(format!("hardware write failed: {}", e));
                result.duration_ms = start.elapsed().as_millis() as u64;
                return (result, None);
            }
        }

        let mut cancelled = false;
        let mut last_stats = None;
        let attempts = cfg.retries + 1;

        for attempt in 0..attempts {
            if self.is_cancelled() {
                cancelled = true;
                break;
            }

            if attempt > 0 {
                if self.cancelled_during(cfg.retry_delay).await {
                    cancelled = true;
                    break;
                }
                // Firmware may have silently reverted the level; command it
                // again before re-measuring
                if let Err(e) = self.issue_write(percent).await {
                    result.error_message = Some(format!("hardware write failed: {}", e));
                    continue;
                }
            }

            if self.cancelled_during(params.settle).await {
                cancelled = true;
                break;
            }

            match self.sample_rpm(fan_index, params.samples, cfg.sample_interval).await {
                Ok(stats) => {
                    result.rpm_after = stats.mean.round() as u32;
                    result.std_deviation = stats.std_dev;
                    result.sample_count = stats.count;
                    let passed =
                        self.tolerance_ok(percent, stats.mean, expected_rpm, params.tolerance);
                    let mean = stats.mean;
                    last_stats = Some(stats);

                    if passed {
                        result.verification_passed = true;
                        result.error_message = None;
                        debug!(fan_index, percent, mean, attempt, "verification passed");
                        break;
                    }

                    result.error_message = Some(format!(
                        "measured {:.0} RPM, expected {} RPM ±{:.0}%",
                        mean,
                        expected_rpm,
                        params.tolerance * 100.0
                    ));
                }
                Err(e) if e.is_cancelled() => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    result.error_message = Some(format!("rpm sampling failed: {}", e));
                }
            }
        }

        if cancelled {
            result.error_message = Some("verification cancelled".to_string());
        }

        if !result.verification_passed && !cancelled && params.restore_on_failure {
            warn!(
                fan_index,
                percent,
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "verification failed after retries; restoring automatic control"
            );
            if let Err(e) = self.controller.restore_auto_control().await {
                warn!(error = %e, "failed to restore automatic control");
            }
            if let Some(msg) = result.error_message.as_mut() {
                msg.push_str(
                    "; automatic hardware control restored, check for firmware speed caps \
                     or a stuck fan",
                );
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        (result, last_stats)
    }

    /// Full verification protocol for one target: the standard cycle plus
    /// up to `enhanced_cycles` longer-settle, lenient-tolerance cycles.
    /// No restore, no revert, no events; callers layer those on.
    async fn apply_with_cycles(
        &self,
        fan_index: usize,
        percent: u8,
        settle: Duration,
    ) -> (FanApplyResult, Option<RpmStats>, u32) {
        let standard = CycleParams {
            settle,
            samples: self.config.sample_count,
            tolerance: self.config.tolerance,
            restore_on_failure: false,
        };

        let (mut result, mut stats) =
            self.apply_and_verify_cycle(fan_index, percent, &standard).await;
        let mut extra_cycles = 0;

        if !result.verification_passed && result.write_succeeded {
            let lenient = CycleParams {
                settle: self.config.enhanced_settle_delay,
                samples: self.config.enhanced_sample_count,
                tolerance: self.config.enhanced_tolerance,
                restore_on_failure: false,
            };

            for cycle in 1..=self.config.enhanced_cycles {
                if self.is_cancelled() {
                    break;
                }
                info!(fan_index, percent, cycle, "verification failed, running enhanced cycle");
                extra_cycles += 1;
                let (r, s) = self.apply_and_verify_cycle(fan_index, percent, &lenient).await;
                result = r;
                if s.is_some() {
                    stats = s;
                }
                if result.verification_passed {
                    break;
                }
            }
        }

        (result, stats, extra_cycles)
    }

    /// Verified apply with up to two extra longer-settle, larger-sample,
    /// lenient-tolerance cycles, and optional auto-revert to
    /// `previous_percent` when everything fails.
    pub async fn apply_with_enhanced_verification(
        &self,
        fan_index: usize,
        percent: u8,
        previous_percent: Option<u8>,
    ) -> EnhancedApplyOutcome {
        let (result, _, extra_cycles) =
            self.apply_with_cycles(fan_index, percent, self.config.settle_delay).await;

        let mut revert = None;
        if !result.verification_passed && !self.is_cancelled() {
            if let (true, Some(previous)) = (self.config.auto_revert, previous_percent) {
                info!(fan_index, percent, previous, "auto-reverting to previous speed");
                if !self.cancelled_during(self.config.revert_delay).await {
                    let standard = CycleParams {
                        settle: self.config.settle_delay,
                        samples: self.config.sample_count,
                        tolerance: self.config.tolerance,
                        restore_on_failure: false,
                    };
                    let (revert_result, _) =
                        self.apply_and_verify_cycle(fan_index, previous, &standard).await;
                    revert = Some(RevertOutcome {
                        target_percent: previous,
                        succeeded: revert_result.verification_passed,
                    });
                }
            } else {
                warn!(fan_index, percent, "enhanced verification failed; restoring automatic control");
                if let Err(e) = self.controller.restore_auto_control().await {
                    warn!(error = %e, "failed to restore automatic control");
                }
            }
        }

        self.emit(ControlEvent::VerificationCompleted { result: result.clone() });
        EnhancedApplyOutcome { result, extra_cycles, revert }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{SimCommand, SimulatedFan};

    fn fast_config() -> VerificationConfig {
        VerificationConfig {
            settle_delay: Duration::from_millis(50),
            sample_interval: Duration::from_millis(10),
            retry_delay: Duration::from_millis(50),
            write_delay: Duration::from_millis(10),
            enhanced_settle_delay: Duration::from_millis(100),
            revert_delay: Duration::from_millis(20),
            calibration_settle: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn verifier(sim: &Arc<SimulatedFan>) -> FanVerifier {
        FanVerifier::new(Arc::clone(sim) as Arc<dyn FanController>, fast_config())
    }

    #[tokio::test(start_paused = true)]
    async fn accurate_fan_passes() {
        let sim = Arc::new(SimulatedFan::builder().rpm_ceiling(5500).max_command(false).build());
        let v = verifier(&sim);

        // Linear model: 50% -> 2750 RPM exactly
        let result = v.apply_and_verify(0, 50).await;
        assert!(result.write_succeeded);
        assert!(result.verification_passed);
        assert_eq!(result.expected_rpm, 2750);
        assert_eq!(result.rpm_after, 2750);
        assert_eq!(result.rating(), VerificationRating::Excellent);
    }

    #[tokio::test(start_paused = true)]
    async fn tolerance_boundaries_at_fifty_percent() {
        let sim = Arc::new(SimulatedFan::builder().rpm_ceiling(5500).build());
        let v = verifier(&sim);

        // 2800 RPM vs expected 2750 with 15% tolerance: passes
        sim.set_fixed_rpm(0, Some(2800));
        let result = v.apply_and_verify(0, 50).await;
        assert!(result.verification_passed);

        // 3300 RPM: deviation 550 > 412.5, fails through all retries
        sim.set_fixed_rpm(0, Some(3300));
        let result = v.apply_and_verify(0, 50).await;
        assert!(!result.verification_passed);
        assert!(result.error_message.is_some());
        // Safety fallback kicked in
        assert!(sim.history().contains(&SimCommand::RestoreAuto));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_fan_rule_ignores_expected_rpm() {
        let sim = Arc::new(SimulatedFan::builder().build());
        let v = verifier(&sim);

        sim.set_fixed_rpm(0, Some(150));
        let result = v.apply_and_verify(0, 0).await;
        assert!(result.verification_passed);

        sim.set_fixed_rpm(0, Some(1200));
        let result = v.apply_and_verify(0, 0).await;
        assert!(!result.verification_passed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_write_failure_is_absorbed() {
        let sim = Arc::new(SimulatedFan::builder().rpm_ceiling(5500).max_command(false).build());
        let v = verifier(&sim);

        sim.fail_next_writes(2);
        let result = v.apply_and_verify(0, 40).await;
        assert!(result.write_succeeded);
        assert!(result.verification_passed);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_write_failure_is_terminal() {
        let sim = Arc::new(SimulatedFan::builder().build());
        let v = verifier(&sim);

        sim.fail_next_writes(10);
        let result = v.apply_and_verify(0, 40).await;
        assert!(!result.write_succeeded);
        assert!(!result.verification_passed);
        assert_eq!(result.rating(), VerificationRating::Failed);
        assert!(result.error_message.unwrap().contains("write failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn hundred_percent_prefers_max_command() {
        let sim = Arc::new(SimulatedFan::builder().rpm_ceiling(5500).build());
        let v = verifier(&sim);

        let result = v.apply_and_verify(0, 100).await;
        assert!(result.verification_passed);
        assert!(sim.history().contains(&SimCommand::MaxCooling));
        assert!(!sim.history().contains(&SimCommand::SetSpeed(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn enhanced_verification_auto_reverts() {
        let sim = Arc::new(SimulatedFan::builder().rpm_ceiling(5500).max_command(false).build());
        let v = verifier(&sim);

        // Fan stuck at 3600 RPM: 50% (expected 2750) fails even with the
        // lenient tolerance, but reverting to 65% (expected 3575) verifies.
        sim.set_fixed_rpm(0, Some(3600));
        let outcome = v.apply_with_enhanced_verification(0, 50, Some(65)).await;
        assert!(!outcome.result.verification_passed);
        assert_eq!(outcome.extra_cycles, 2);
        let revert = outcome.revert.expect("auto-revert should have run");
        assert_eq!(revert.target_percent, 65);
        assert!(revert.succeeded);
        assert_eq!(sim.fan_percent(0), Some(65));
    }

    #[tokio::test(start_paused = true)]
    async fn enhanced_verification_stops_early_on_success() {
        let sim = Arc::new(SimulatedFan::builder().rpm_ceiling(5500).max_command(false).build());
        let v = verifier(&sim);

        let outcome = v.apply_with_enhanced_verification(0, 70, Some(30)).await;
        assert!(outcome.result.verification_passed);
        assert_eq!(outcome.extra_cycles, 0);
        assert!(outcome.revert.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_fan_index_rejected_before_any_write() {
        let sim = Arc::new(SimulatedFan::builder().fans(1).dual_fan(false).build());
        let v = verifier(&sim);

        let result = v.apply_and_verify(5, 50).await;
        assert!(!result.write_succeeded);
        assert!(!result.verification_passed);
        assert!(result.error_message.unwrap().contains("not found"));
        // No hardware command was ever issued
        assert_eq!(sim.write_count(), 0);
        assert!(sim.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_wakes_inflight_settle_delay() {
        let sim = Arc::new(SimulatedFan::builder().rpm_ceiling(5500).max_command(false).build());
        let config = VerificationConfig {
            settle_delay: Duration::from_secs(600),
            ..fast_config()
        };
        let v = Arc::new(FanVerifier::new(
            Arc::clone(&sim) as Arc<dyn FanController>,
            config,
        ));

        let task = {
            let v = Arc::clone(&v);
            tokio::spawn(async move { v.apply_and_verify(0, 50).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        v.cancel();

        // Far less than the 600 s settle: cancellation must wake the sleep
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("cancellation did not wake the in-flight delay")
            .unwrap();
        assert!(!result.verification_passed);
        assert!(result.error_message.unwrap().contains("cancelled"));
        // Hardware keeps the last applied value; no auto-restore on cancel
        assert!(!sim.history().contains(&SimCommand::RestoreAuto));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_handle_works_across_tasks() {
        let sim = Arc::new(SimulatedFan::builder().rpm_ceiling(5500).max_command(false).build());
        let config = VerificationConfig {
            settle_delay: Duration::from_secs(600),
            ..fast_config()
        };
        let v = Arc::new(FanVerifier::new(
            Arc::clone(&sim) as Arc<dyn FanController>,
            config,
        ));
        let handle = v.cancel_handle();

        let task = {
            let v = Arc::clone(&v);
            tokio::spawn(async move { v.apply_and_verify(0, 50).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("cancel handle did not wake the in-flight delay")
            .unwrap();
        assert!(result.error_message.unwrap().contains("cancelled"));
    }
}
