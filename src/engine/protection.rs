//! Thermal-protection state machine
//!
//! Consumes live temperature and overrides curve output when the machine
//! gets dangerously hot. Activation at the warning threshold is debounced
//! (the condition must hold for a minimum duration); emergency activation
//! is immediate. Release requires the temperature to hold below the
//! release line, and restores what the user actually had before the
//! override, with a minimum fan floor while the machine is still warm.
//!
//! Timing comes in as explicit `Instant`s so every transition is
//! deterministic under test.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::thermal;
use crate::data::{FanMode, FanPreset};

/// Why protection is (or became) active
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Above the warning threshold, sustained
    Warning,
    /// Above the emergency threshold
    Emergency,
}

/// Protection state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionState {
    Normal,
    /// Above the warning threshold, waiting out the activation debounce
    SustainedAboveThreshold { since: Instant },
    Active { severity: Severity },
    /// Active, below the release line, waiting out the release debounce
    SustainedBelowRelease { severity: Severity, since: Instant },
}

/// Snapshot of the pre-override state, taken once on activation.
///
/// This is the only record of "what the user actually had", used to
/// restore it on release instead of a generic default.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorFanState {
    pub mode: FanMode,
    pub preset: Option<FanPreset>,
    pub applied_percent: Option<u8>,
}

impl PriorFanState {
    /// Placeholder for a system with no known prior state
    pub fn unknown() -> Self {
        Self { mode: FanMode::Auto, preset: None, applied_percent: None }
    }
}

/// Tunable thresholds; all empirically derived defaults, not guarantees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectionConfig {
    pub warning_threshold_c: f32,
    pub emergency_threshold_c: f32,
    /// Release line is `warning_threshold_c - release_hysteresis_c`
    pub release_hysteresis_c: f32,
    pub activation_debounce: Duration,
    pub release_debounce: Duration,
    /// Fan floor while active at warning severity (%)
    pub warning_floor_percent: u8,
    /// Released systems at or above this temperature keep a fan floor (°C)
    pub safe_release_temp_c: f32,
    /// The floor imposed on release while still warm (%)
    pub release_min_percent: u8,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            warning_threshold_c: thermal::WARNING_THRESHOLD_C,
            emergency_threshold_c: thermal::EMERGENCY_THRESHOLD_C,
            release_hysteresis_c: thermal::RELEASE_HYSTERESIS_C,
            activation_debounce: thermal::ACTIVATION_DEBOUNCE,
            release_debounce: thermal::RELEASE_DEBOUNCE,
            warning_floor_percent: thermal::WARNING_FLOOR_PERCENT,
            safe_release_temp_c: thermal::SAFE_RELEASE_TEMP_C,
            release_min_percent: thermal::RELEASE_MIN_PERCENT,
        }
    }
}

impl ProtectionConfig {
    /// Config with a user-selected warning threshold (clamped upstream)
    pub fn with_warning_threshold(threshold_c: f32) -> Self {
        Self {
            warning_threshold_c: threshold_c,
            emergency_threshold_c: thermal::EMERGENCY_THRESHOLD_C.max(threshold_c),
            ..Default::default()
        }
    }
}

/// What the control loop must do after feeding a temperature in
#[derive(Debug, Clone, PartialEq)]
pub enum ProtectionDecision {
    /// Not active; run ordinary curve control
    Inactive,
    /// Protection just engaged (or escalated); command this percent now
    Activated { severity: Severity, percent: u8 },
    /// Still active; keep commanding this percent, skip curve control
    Override { severity: Severity, percent: u8 },
    /// Just released; execute this restore action
    Released { restore: RestoreAction, temperature_c: f32 },
}

/// Restore policy computed at release time
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreAction {
    /// Prior mode was max cooling
    MaxCooling,
    /// Reapply the snapshotted preset; `floor` is the warm-floor minimum
    /// to impose afterwards (None when the machine has cooled off)
    Preset { preset: FanPreset, floor: Option<u8> },
    /// Restore the last numeric percent (warm floor already folded in)
    Percent { percent: u8 },
    /// No prior state and genuinely cool: hand control back to firmware
    AutoControl,
    /// No prior state but still warm: impose the minimum floor
    Floor { percent: u8 },
}

/// Debounced thermal-protection state machine for one fan subsystem
#[derive(Debug)]
pub struct ThermalProtection {
    config: ProtectionConfig,
    state: ProtectionState,
    snapshot: Option<PriorFanState>,
}

impl ThermalProtection {
    pub fn new(config: ProtectionConfig) -> Self {
        Self { config, state: ProtectionState::Normal, snapshot: None }
    }

    pub fn state(&self) -> ProtectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ProtectionState::Active { .. } | ProtectionState::SustainedBelowRelease { .. }
        )
    }

    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    /// Swap config; safe mid-flight, existing debounce timers keep running.
    pub fn set_config(&mut self, config: ProtectionConfig) {
        self.config = config;
    }

    /// Feed one temperature reading.
    ///
    /// `current` describes the fan state the control side holds right now;
    /// it is snapshotted once on activation and ignored while active.
    pub fn update(
        &mut self,
        temperature_c: f32,
        now: Instant,
        current: &PriorFanState,
    ) -> ProtectionDecision {
        let cfg = self.config;
        let release_line = cfg.warning_threshold_c - cfg.release_hysteresis_c;

        match self.state {
            ProtectionState::Normal => {
                if temperature_c >= cfg.emergency_threshold_c {
                    // Safety-critical: no debounce on emergency entry
                    self.activate(Severity::Emergency, temperature_c, Duration::ZERO, current)
                } else if temperature_c >= cfg.warning_threshold_c {
                    self.state = ProtectionState::SustainedAboveThreshold { since: now };
                    ProtectionDecision::Inactive
                } else {
                    ProtectionDecision::Inactive
                }
            }

            ProtectionState::SustainedAboveThreshold { since } => {
                if temperature_c >= cfg.emergency_threshold_c {
                    self.activate(
                        Severity::Emergency,
                        temperature_c,
                        now.duration_since(since),
                        current,
                    )
                } else if temperature_c < cfg.warning_threshold_c {
                    self.state = ProtectionState::Normal;
                    ProtectionDecision::Inactive
                } else if now.duration_since(since) >= cfg.activation_debounce {
                    self.activate(
                        Severity::Warning,
                        temperature_c,
                        now.duration_since(since),
                        current,
                    )
                } else {
                    ProtectionDecision::Inactive
                }
            }

            ProtectionState::Active { severity } => {
                if severity == Severity::Warning && temperature_c >= cfg.emergency_threshold_c {
                    // Escalation keeps the original snapshot
                    return self.activate(
                        Severity::Emergency,
                        temperature_c,
                        Duration::ZERO,
                        current,
                    );
                }

                if temperature_c < release_line {
                    self.state = ProtectionState::SustainedBelowRelease { severity, since: now };
                }

                ProtectionDecision::Override {
                    severity,
                    percent: self.override_percent(severity, temperature_c),
                }
            }

            ProtectionState::SustainedBelowRelease { severity, since } => {
                if severity == Severity::Warning && temperature_c >= cfg.emergency_threshold_c {
                    return self.activate(
                        Severity::Emergency,
                        temperature_c,
                        Duration::ZERO,
                        current,
                    );
                }

                if temperature_c >= release_line {
                    // Warmed back up before the debounce ran out
                    self.state = ProtectionState::Active { severity };
                    return ProtectionDecision::Override {
                        severity,
                        percent: self.override_percent(severity, temperature_c),
                    };
                }

                if now.duration_since(since) >= cfg.release_debounce {
                    let held = now.duration_since(since);
                    let restore = self.restore_action(temperature_c);
                    info!(
                        temperature = temperature_c,
                        held_below_secs = held.as_secs_f32(),
                        ?restore,
                        "thermal protection released"
                    );
                    self.state = ProtectionState::Normal;
                    self.snapshot = None;
                    ProtectionDecision::Released { restore, temperature_c }
                } else {
                    ProtectionDecision::Override {
                        severity,
                        percent: self.override_percent(severity, temperature_c),
                    }
                }
            }
        }
    }

    fn activate(
        &mut self,
        severity: Severity,
        temperature_c: f32,
        debounced_for: Duration,
        current: &PriorFanState,
    ) -> ProtectionDecision {
        // One-shot: escalation and re-entry keep the original snapshot
        if self.snapshot.is_none() {
            self.snapshot = Some(current.clone());
        }
        self.state = ProtectionState::Active { severity };
        warn!(
            ?severity,
            temperature = temperature_c,
            debounced_secs = debounced_for.as_secs_f32(),
            "thermal protection activated"
        );
        ProtectionDecision::Activated {
            severity,
            percent: self.override_percent(severity, temperature_c),
        }
    }

    /// Fan percent commanded while active.
    ///
    /// Emergency is always 100. Warning scales from the floor toward 100
    /// proportionally to how far above the warning threshold the
    /// temperature sits, and never drops below what was commanded before
    /// protection engaged (protection only escalates).
    fn override_percent(&self, severity: Severity, temperature_c: f32) -> u8 {
        if severity == Severity::Emergency {
            return 100;
        }

        let cfg = &self.config;
        let floor = cfg.warning_floor_percent;
        let span = cfg.emergency_threshold_c - cfg.warning_threshold_c;
        let scaled = if span <= f32::EPSILON {
            100
        } else {
            let ratio =
                ((temperature_c - cfg.warning_threshold_c) / span).clamp(0.0, 1.0);
            (floor as f32 + ratio * (100.0 - floor as f32)).round() as u8
        };

        let prior = self
            .snapshot
            .as_ref()
            .and_then(|s| s.applied_percent)
            .unwrap_or(0);

        scaled.max(floor).max(prior).min(100)
    }

    fn restore_action(&self, temperature_c: f32) -> RestoreAction {
        let cfg = &self.config;
        let warm = temperature_c >= cfg.safe_release_temp_c;

        let snapshot = match &self.snapshot {
            Some(s) => s,
            None => {
                return if warm {
                    RestoreAction::Floor { percent: cfg.release_min_percent }
                } else {
                    RestoreAction::AutoControl
                };
            }
        };

        if snapshot.mode == FanMode::Max {
            return RestoreAction::MaxCooling;
        }

        if let Some(preset) = &snapshot.preset {
            // Automatic policies may idle the fan to zero right after
            // release and re-trigger protection moments later; keep a
            // floor under them while the machine is still warm.
            let floor =
                (warm && preset.mode.is_automatic()).then_some(cfg.release_min_percent);
            return RestoreAction::Preset { preset: preset.clone(), floor };
        }

        if let Some(percent) = snapshot.applied_percent {
            let percent = if warm { percent.max(cfg.release_min_percent) } else { percent };
            return RestoreAction::Percent { percent };
        }

        if warm {
            RestoreAction::Floor { percent: cfg.release_min_percent }
        } else {
            RestoreAction::AutoControl
        }
    }
}
