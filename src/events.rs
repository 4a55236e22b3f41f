//! Event surface emitted by the core
//!
//! UI and automation layers subscribe through a tokio broadcast channel.
//! Events are fire-and-forget; a lagging subscriber drops old events
//! rather than stalling the control loop.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::engine::protection::Severity;
use crate::verify::{FanApplyResult, FanCalibrationResult};

/// Broadcast channel capacity; slow consumers lose the oldest events
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications emitted by the control loop and verification engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlEvent {
    PresetApplied {
        name: String,
    },
    ThermalProtectionActivated {
        severity: Severity,
        temperature_c: f32,
    },
    ThermalProtectionReleased {
        temperature_c: f32,
    },
    VerificationCompleted {
        result: FanApplyResult,
    },
    CalibrationCompleted {
        result: FanCalibrationResult,
    },
    /// The control loop gave up after sustained tick failures. The fans
    /// were left commanded to maximum cooling; the service must be
    /// restarted before it drives them again.
    ControlLoopStopped {
        consecutive_errors: u32,
    },
}

/// Create the event channel used by the core components
pub fn channel() -> broadcast::Sender<ControlEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
