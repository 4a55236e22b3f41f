//! Hysteresis and ramp control
//!
//! Stateful deadzone + delayed-commit logic that keeps small temperature
//! noise from thrashing the fan, plus the step plan for smoothing a commit
//! into a gradual ramp. Timing is driven by explicit `Instant`s handed in
//! by the caller so the logic stays deterministic under test.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::data::HysteresisSettings;

/// Whether a proposed target should be applied this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Commit this percent to hardware now
    Apply(u8),
    /// Suppress the update for now
    Hold,
}

#[derive(Debug, Clone, Copy)]
struct PendingTarget {
    target: u8,
    since: Instant,
}

/// Deadzone + delayed-commit controller for one fan channel.
///
/// Tracks the temperature at the last committed change and a pending
/// target with the time it was first proposed. Increases and decreases
/// carry separate commit delays.
#[derive(Debug)]
pub struct HysteresisController {
    settings: HysteresisSettings,
    last_commit_temp: Option<f32>,
    pending: Option<PendingTarget>,
}

impl HysteresisController {
    pub fn new(settings: HysteresisSettings) -> Self {
        Self {
            settings: settings.normalized(),
            last_commit_temp: None,
            pending: None,
        }
    }

    /// Replace settings; any pending commit restarts under the new rules.
    pub fn set_settings(&mut self, settings: HysteresisSettings) {
        self.settings = settings.normalized();
        self.pending = None;
    }

    pub fn settings(&self) -> &HysteresisSettings {
        &self.settings
    }

    /// Decide whether `target` should be committed now.
    ///
    /// `last_applied` is the percent the hardware currently runs at (None
    /// if nothing was ever applied); `force` bypasses all suppression
    /// (used for force-refresh and immediate-apply requests).
    pub fn decide(
        &mut self,
        target: u8,
        last_applied: Option<u8>,
        temperature_c: f32,
        now: Instant,
        force: bool,
    ) -> Decision {
        let applied = match last_applied {
            Some(p) if self.settings.enabled && !force => p,
            _ => return self.commit(target, temperature_c),
        };

        if target == applied {
            // Already where we want to be; drop any stale pending target
            self.pending = None;
            return Decision::Hold;
        }

        // Deadzone: temperature has not moved enough since the last commit.
        // The pending timer is deliberately left untouched.
        if let Some(last_temp) = self.last_commit_temp {
            if (temperature_c - last_temp).abs() < self.settings.dead_zone_c {
                debug!(
                    target,
                    applied,
                    delta = (temperature_c - last_temp).abs(),
                    dead_zone = self.settings.dead_zone_c,
                    "hysteresis: within deadzone, holding"
                );
                return Decision::Hold;
            }
        }

        match self.pending {
            Some(pending) if pending.target == target => {
                let delay = if target > applied {
                    Duration::from_secs_f32(self.settings.ramp_up_delay_s)
                } else {
                    Duration::from_secs_f32(self.settings.ramp_down_delay_s)
                };

                if now.duration_since(pending.since) >= delay {
                    debug!(target, applied, ?delay, "hysteresis: commit timer elapsed");
                    self.commit(target, temperature_c)
                } else {
                    Decision::Hold
                }
            }
            _ => {
                // New (or changed) target: start the commit timer
                self.pending = Some(PendingTarget { target, since: now });
                Decision::Hold
            }
        }
    }

    fn commit(&mut self, target: u8, temperature_c: f32) -> Decision {
        self.pending = None;
        self.last_commit_temp = Some(temperature_c);
        Decision::Apply(target)
    }

    /// Forget all history (used when the active curve changes)
    pub fn reset(&mut self) {
        self.last_commit_temp = None;
        self.pending = None;
    }
}

/// Plan a smoothed ramp from the currently applied percent to a target.
///
/// Produces the intermediate percents (ending exactly at `to`) for
/// `duration / step_interval` equal steps, minimum one step. The executor
/// issues one hardware write per step and records each intermediate value
/// as applied, so a newer target can interrupt the ramp cleanly.
pub fn plan_ramp(from: u8, to: u8, duration: Duration, step_interval: Duration) -> Vec<u8> {
    if from == to {
        return vec![to];
    }

    let steps = if step_interval.is_zero() {
        1
    } else {
        ((duration.as_millis() / step_interval.as_millis().max(1)) as u32).max(1)
    };

    let from_f = from as f32;
    let span = to as f32 - from_f;

    (1..=steps)
        .map(|i| (from_f + span * i as f32 / steps as f32).round() as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dead_zone_c: f32, up_s: f32, down_s: f32) -> HysteresisSettings {
        HysteresisSettings {
            enabled: true,
            dead_zone_c,
            ramp_up_delay_s: up_s,
            ramp_down_delay_s: down_s,
            ..Default::default()
        }
    }

    #[test]
    fn applies_immediately_when_disabled_or_unprimed() {
        let mut hc = HysteresisController::new(HysteresisSettings {
            enabled: false,
            ..Default::default()
        });
        let t0 = Instant::now();
        assert_eq!(hc.decide(60, Some(40), 70.0, t0, false), Decision::Apply(60));

        let mut hc = HysteresisController::new(settings(3.0, 2.0, 8.0));
        assert_eq!(hc.decide(60, None, 70.0, t0, false), Decision::Apply(60));
    }

    #[test]
    fn force_bypasses_suppression() {
        let mut hc = HysteresisController::new(settings(3.0, 2.0, 8.0));
        let t0 = Instant::now();
        assert_eq!(hc.decide(50, Some(50), 60.0, t0, true), Decision::Apply(50));
        assert_eq!(hc.decide(55, Some(50), 60.5, t0, true), Decision::Apply(55));
    }

    #[test]
    fn deadzone_suppresses_small_oscillation() {
        let mut hc = HysteresisController::new(settings(3.0, 0.0, 0.0));
        let t0 = Instant::now();

        // Prime: first decide commits and records the commit temperature
        assert_eq!(hc.decide(40, None, 60.0, t0, false), Decision::Apply(40));

        // Temperature oscillates within ±2°C of the commit point; raw
        // targets differ but nothing is applied.
        for (offset, target) in [(1.5f32, 45u8), (-2.0, 35), (2.0, 44), (-1.0, 38)] {
            let d = hc.decide(target, Some(40), 60.0 + offset, t0 + Duration::from_secs(30), false);
            assert_eq!(d, Decision::Hold);
        }

        // Moving past the deadzone allows the change through (zero delays)
        let d = hc.decide(50, Some(40), 64.0, t0 + Duration::from_secs(31), false);
        // First proposal starts the timer; zero delay commits on the next look
        assert_eq!(d, Decision::Hold);
        let d = hc.decide(50, Some(40), 64.0, t0 + Duration::from_secs(31), false);
        assert_eq!(d, Decision::Apply(50));
    }

    #[test]
    fn commit_delays_split_by_direction() {
        let mut hc = HysteresisController::new(settings(0.0, 2.0, 8.0));
        let t0 = Instant::now();
        assert_eq!(hc.decide(40, None, 50.0, t0, false), Decision::Apply(40));

        // Increase: pending starts, commits after 2s
        assert_eq!(hc.decide(60, Some(40), 60.0, t0, false), Decision::Hold);
        assert_eq!(
            hc.decide(60, Some(40), 60.0, t0 + Duration::from_millis(1900), false),
            Decision::Hold
        );
        assert_eq!(
            hc.decide(60, Some(40), 60.0, t0 + Duration::from_millis(2100), false),
            Decision::Apply(60)
        );

        // Decrease: needs the longer 8s delay
        let t1 = t0 + Duration::from_secs(10);
        assert_eq!(hc.decide(30, Some(60), 45.0, t1, false), Decision::Hold);
        assert_eq!(
            hc.decide(30, Some(60), 45.0, t1 + Duration::from_secs(3), false),
            Decision::Hold
        );
        assert_eq!(
            hc.decide(30, Some(60), 45.0, t1 + Duration::from_secs(8), false),
            Decision::Apply(30)
        );
    }

    #[test]
    fn changed_target_restarts_timer() {
        let mut hc = HysteresisController::new(settings(0.0, 2.0, 2.0));
        let t0 = Instant::now();
        assert_eq!(hc.decide(40, None, 50.0, t0, false), Decision::Apply(40));

        assert_eq!(hc.decide(60, Some(40), 60.0, t0, false), Decision::Hold);
        // Target changes before the delay elapses; timer restarts
        assert_eq!(
            hc.decide(70, Some(40), 65.0, t0 + Duration::from_secs(1), false),
            Decision::Hold
        );
        assert_eq!(
            hc.decide(70, Some(40), 65.0, t0 + Duration::from_secs(2), false),
            Decision::Hold
        );
        assert_eq!(
            hc.decide(70, Some(40), 65.0, t0 + Duration::from_secs(3), false),
            Decision::Apply(70)
        );
    }

    #[test]
    fn ramp_plan_equal_steps() {
        let plan = plan_ramp(20, 80, Duration::from_secs(3), Duration::from_millis(500));
        assert_eq!(plan.len(), 6);
        assert_eq!(plan, vec![30, 40, 50, 60, 70, 80]);
        assert_eq!(*plan.last().unwrap(), 80);

        // Minimum one step
        let plan = plan_ramp(20, 80, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(plan, vec![80]);

        // Downward ramps work too
        let plan = plan_ramp(80, 20, Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(plan, vec![60, 40, 20]);

        // No-op ramp still lands on the target
        assert_eq!(plan_ramp(50, 50, Duration::from_secs(3), Duration::from_secs(1)), vec![50]);
    }
}
