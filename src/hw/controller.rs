//! Hardware fan-controller contract
//!
//! The core consumes this interface and never implements the transport
//! itself (WMI BIOS, EC-direct, proxy daemons all live behind it). Every
//! call may fail and must be treated as transient by callers. The
//! implementation is expected to serialize conflicting writes internally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::data::FanPreset;
use crate::error::Result;

/// One fan's measured speed
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FanReading {
    pub name: String,
    pub rpm: u32,
}

/// Capability tags a backend reports at probe time.
///
/// The core widens behavior on these instead of inspecting backend types:
/// a backend without `dual_fan` gets a single shared speed, one without
/// `readback` skips telemetry, one without `max_command` gets 100% via the
/// linear level path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerCapabilities {
    /// Independent CPU/GPU fan channels
    pub dual_fan: bool,
    /// Can report actual fan RPM
    pub readback: bool,
    /// Has a dedicated max-cooling command (linear level mapping is
    /// sometimes capped below true maximum by firmware)
    pub max_command: bool,
}

/// Fan controller backend.
///
/// Percent arguments are 0-100; mapping to a controller-specific level is
/// the backend's business ([`FanController::level_for_percent`] exposes
/// the mapping so results can report the applied level).
#[async_trait]
pub trait FanController: Send + Sync {
    /// Short identifier for logs and capability displays
    fn backend_name(&self) -> &str;

    fn capabilities(&self) -> ControllerCapabilities;

    /// Whether the backend initialized and can accept commands
    async fn is_available(&self) -> bool;

    /// Controller-specific level the backend will program for a percent.
    /// Default is the identity mapping.
    fn level_for_percent(&self, percent: u8) -> u8 {
        percent
    }

    /// Drive all fans at one speed
    async fn set_fan_speed(&self, percent: u8) -> Result<()>;

    /// Drive CPU and GPU fans separately (requires `dual_fan`)
    async fn set_fan_speeds(&self, cpu_percent: u8, gpu_percent: u8) -> Result<()>;

    /// Measured speeds, one entry per fan (requires `readback`)
    async fn read_fan_speeds(&self) -> Result<Vec<FanReading>>;

    async fn apply_preset(&self, preset: &FanPreset) -> Result<()>;

    async fn apply_max_cooling(&self) -> Result<()>;

    async fn apply_auto_mode(&self) -> Result<()>;

    async fn apply_quiet_mode(&self) -> Result<()>;

    /// Hand fan management back to firmware
    async fn restore_auto_control(&self) -> Result<()>;

    async fn reset_to_defaults(&self) -> Result<()>;

    /// Confirm a max-cooling command actually took effect
    async fn verify_max_applied(&self) -> Result<(bool, String)>;
}
