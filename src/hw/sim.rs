//! Simulated fan backend
//!
//! A software model of a dual-fan laptop: linear percent→RPM response with
//! optional bias and per-fan fixed readings, scripted temperatures, and
//! injectable write failures. Backs the test suite and doubles as a
//! dry-run backend for hosts that want to exercise policy without
//! touching hardware.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::data::FanPreset;
use crate::error::{FanCtlError, Result};
use crate::hw::{ControllerCapabilities, FanController, FanReading, SensorReading, TemperatureSource};

/// Every command the simulator accepted, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCommand {
    SetSpeed(u8),
    SetSpeeds(u8, u8),
    Preset(String),
    MaxCooling,
    AutoMode,
    QuietMode,
    RestoreAuto,
    ResetDefaults,
}

#[derive(Debug)]
struct SimState {
    fan_percents: Vec<u8>,
    /// Fixed RPM override per fan (wins over the linear model)
    fixed_rpm: Vec<Option<u32>>,
    cpu_celsius: f32,
    gpu_celsius: f32,
    history: Vec<SimCommand>,
    /// Next N writes fail with a transient error
    failing_writes: u32,
    write_count: u32,
}

/// Builder for [`SimulatedFan`]
pub struct SimulatedFanBuilder {
    name: String,
    available: bool,
    caps: ControllerCapabilities,
    fans: usize,
    rpm_ceiling: u32,
    rpm_bias: i32,
}

impl SimulatedFanBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn dual_fan(mut self, dual_fan: bool) -> Self {
        self.caps.dual_fan = dual_fan;
        self
    }

    pub fn max_command(mut self, max_command: bool) -> Self {
        self.caps.max_command = max_command;
        self
    }

    pub fn fans(mut self, fans: usize) -> Self {
        self.fans = fans.max(1);
        self
    }

    pub fn rpm_ceiling(mut self, rpm_ceiling: u32) -> Self {
        self.rpm_ceiling = rpm_ceiling;
        self
    }

    /// Constant RPM offset on top of the linear model (models firmware
    /// that never quite hits the commanded speed)
    pub fn rpm_bias(mut self, rpm_bias: i32) -> Self {
        self.rpm_bias = rpm_bias;
        self
    }

    pub fn build(self) -> SimulatedFan {
        SimulatedFan {
            name: self.name,
            available: self.available,
            caps: self.caps,
            rpm_ceiling: self.rpm_ceiling,
            rpm_bias: self.rpm_bias,
            state: Mutex::new(SimState {
                fan_percents: vec![0; self.fans],
                fixed_rpm: vec![None; self.fans],
                cpu_celsius: 40.0,
                gpu_celsius: 40.0,
                history: Vec::new(),
                failing_writes: 0,
                write_count: 0,
            }),
        }
    }
}

/// Simulated dual-fan controller + temperature source
pub struct SimulatedFan {
    name: String,
    available: bool,
    caps: ControllerCapabilities,
    rpm_ceiling: u32,
    rpm_bias: i32,
    state: Mutex<SimState>,
}

impl SimulatedFan {
    pub fn builder() -> SimulatedFanBuilder {
        SimulatedFanBuilder {
            name: "sim".to_string(),
            available: true,
            caps: ControllerCapabilities { dual_fan: true, readback: true, max_command: true },
            fans: 2,
            rpm_ceiling: 5500,
            rpm_bias: 0,
        }
    }

    /// Change the reported temperatures (used by tests driving scenarios)
    pub fn set_temperatures(&self, cpu_celsius: f32, gpu_celsius: f32) {
        let mut s = self.state.lock();
        s.cpu_celsius = cpu_celsius;
        s.gpu_celsius = gpu_celsius;
    }

    /// Force a fan's reported RPM regardless of its commanded percent
    pub fn set_fixed_rpm(&self, fan_index: usize, rpm: Option<u32>) {
        let mut s = self.state.lock();
        if let Some(slot) = s.fixed_rpm.get_mut(fan_index) {
            *slot = rpm;
        }
    }

    /// Make the next `count` write commands fail
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().failing_writes = count;
    }

    /// All accepted commands, in order
    pub fn history(&self) -> Vec<SimCommand> {
        self.state.lock().history.clone()
    }

    /// Current commanded percent of one fan
    pub fn fan_percent(&self, fan_index: usize) -> Option<u8> {
        self.state.lock().fan_percents.get(fan_index).copied()
    }

    /// Total write commands attempted (including failed ones)
    pub fn write_count(&self) -> u32 {
        self.state.lock().write_count
    }

    fn rpm_for(&self, fan_index: usize, state: &SimState) -> u32 {
        if let Some(Some(fixed)) = state.fixed_rpm.get(fan_index) {
            return *fixed;
        }
        let percent = state.fan_percents.get(fan_index).copied().unwrap_or(0);
        let linear = (percent as u64 * self.rpm_ceiling as u64 / 100) as i64;
        if percent == 0 {
            0
        } else {
            (linear + self.rpm_bias as i64).max(0) as u32
        }
    }

    fn check_write(&self, state: &mut SimState) -> Result<()> {
        state.write_count += 1;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(FanCtlError::write("simulated transient failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl FanController for SimulatedFan {
    fn backend_name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ControllerCapabilities {
        self.caps
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn set_fan_speed(&self, percent: u8) -> Result<()> {
        let mut s = self.state.lock();
        self.check_write(&mut s)?;
        for fan in s.fan_percents.iter_mut() {
            *fan = percent;
        }
        s.history.push(SimCommand::SetSpeed(percent));
        Ok(())
    }

    async fn set_fan_speeds(&self, cpu_percent: u8, gpu_percent: u8) -> Result<()> {
        let mut s = self.state.lock();
        self.check_write(&mut s)?;
        if let Some(fan) = s.fan_percents.get_mut(0) {
            *fan = cpu_percent;
        }
        if let Some(fan) = s.fan_percents.get_mut(1) {
            *fan = gpu_percent;
        }
        s.history.push(SimCommand::SetSpeeds(cpu_percent, gpu_percent));
        Ok(())
    }

    async fn read_fan_speeds(&self) -> Result<Vec<FanReading>> {
        let s = self.state.lock();
        Ok((0..s.fan_percents.len())
            .map(|i| FanReading {
                name: if i == 0 { "CPU Fan".to_string() } else { format!("Fan {}", i + 1) },
                rpm: self.rpm_for(i, &s),
            })
            .collect())
    }

    async fn apply_preset(&self, preset: &FanPreset) -> Result<()> {
        let mut s = self.state.lock();
        self.check_write(&mut s)?;
        s.history.push(SimCommand::Preset(preset.name.clone()));
        Ok(())
    }

    async fn apply_max_cooling(&self) -> Result<()> {
        let mut s = self.state.lock();
        self.check_write(&mut s)?;
        for fan in s.fan_percents.iter_mut() {
            *fan = 100;
        }
        s.history.push(SimCommand::MaxCooling);
        Ok(())
    }

    async fn apply_auto_mode(&self) -> Result<()> {
        let mut s = self.state.lock();
        self.check_write(&mut s)?;
        s.history.push(SimCommand::AutoMode);
        Ok(())
    }

    async fn apply_quiet_mode(&self) -> Result<()> {
        let mut s = self.state.lock();
        self.check_write(&mut s)?;
        s.history.push(SimCommand::QuietMode);
        Ok(())
    }

    async fn restore_auto_control(&self) -> Result<()> {
        let mut s = self.state.lock();
        self.check_write(&mut s)?;
        s.history.push(SimCommand::RestoreAuto);
        Ok(())
    }

    async fn reset_to_defaults(&self) -> Result<()> {
        let mut s = self.state.lock();
        self.check_write(&mut s)?;
        for fan in s.fan_percents.iter_mut() {
            *fan = 0;
        }
        s.history.push(SimCommand::ResetDefaults);
        Ok(())
    }

    async fn verify_max_applied(&self) -> Result<(bool, String)> {
        let s = self.state.lock();
        let all_max = s.fan_percents.iter().all(|&p| p == 100);
        Ok((all_max, format!("fan percents: {:?}", s.fan_percents)))
    }
}

#[async_trait]
impl TemperatureSource for SimulatedFan {
    async fn read_temperatures(&self) -> Result<Vec<SensorReading>> {
        let s = self.state.lock();
        Ok(vec![
            SensorReading { label: "CPU".to_string(), celsius: s.cpu_celsius },
            SensorReading { label: "GPU".to_string(), celsius: s.gpu_celsius },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn linear_rpm_model() {
        let sim = SimulatedFan::builder().rpm_ceiling(5000).build();
        sim.set_fan_speed(50).await.unwrap();
        let readings = sim.read_fan_speeds().await.unwrap();
        assert_eq!(readings[0].rpm, 2500);

        sim.set_fan_speed(0).await.unwrap();
        assert_eq!(sim.read_fan_speeds().await.unwrap()[0].rpm, 0);
    }

    #[tokio::test]
    async fn failure_injection_is_transient() {
        let sim = SimulatedFan::builder().build();
        sim.fail_next_writes(2);
        assert!(sim.set_fan_speed(30).await.is_err());
        assert!(sim.set_fan_speed(30).await.is_err());
        assert!(sim.set_fan_speed(30).await.is_ok());
        assert_eq!(sim.fan_percent(0), Some(30));
    }

    #[tokio::test]
    async fn fixed_rpm_overrides_model() {
        let sim = SimulatedFan::builder().build();
        sim.set_fan_speed(50).await.unwrap();
        sim.set_fixed_rpm(0, Some(3300));
        let readings = sim.read_fan_speeds().await.unwrap();
        assert_eq!(readings[0].rpm, 3300);
    }
}
