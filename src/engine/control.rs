//! Continuous fan control loop
//!
//! Reads temperatures, evaluates the active curve, and commands fan
//! speeds through a [`FanController`]. Thermal protection is checked
//! before curve control on every tick and wins every conflict.
//!
//! # Safety properties
//! - Protection overrides and the safety clamp can only raise speeds
//! - Individual tick failures never stop the loop; persistent failure
//!   commands maximum cooling as a failsafe
//! - The current speed is re-issued periodically to defeat firmware
//!   that silently reclaims fan control

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

use crate::constants::{hysteresis as hyst_const, retry as retry_const, thermal, timing};
use crate::data::{ActiveCurve, FanCurve, FanMode, FanPreset, HysteresisSettings, ThermalSample};
use crate::error::Result;
use crate::events::{self, ControlEvent};
use crate::hw::{select_cpu_gpu, FanController, TemperatureSource};
use crate::retry::retry_with_delay;

use super::clamp::clamp_for_temperature;
use super::curve;
use super::hysteresis::{plan_ramp, Decision, HysteresisController};
use super::protection::{
    PriorFanState, ProtectionConfig, ProtectionDecision, ProtectionState, RestoreAction,
    ThermalProtection,
};

/// Loop timing and retry tunables
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub fast_poll: Duration,
    pub slow_poll: Duration,
    /// Temperature delta below which polling slows down (°C)
    pub stability_threshold_c: f32,
    /// Minimum interval between ordinary curve re-applies
    pub curve_update_interval: Duration,
    /// Re-issue the current speed this often even when unchanged
    pub force_refresh_interval: Duration,
    pub max_consecutive_errors: u32,
    /// Rolling telemetry window capacity
    pub sample_window: usize,
    pub ramp_duration: Duration,
    pub ramp_step_interval: Duration,
    pub write_attempts: u32,
    pub write_delay: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            fast_poll: timing::FAST_POLL,
            slow_poll: timing::SLOW_POLL,
            stability_threshold_c: timing::STABILITY_THRESHOLD_C,
            curve_update_interval: timing::CURVE_UPDATE_INTERVAL,
            force_refresh_interval: timing::FORCE_REFRESH_INTERVAL,
            max_consecutive_errors: timing::MAX_CONSECUTIVE_ERRORS,
            sample_window: timing::SAMPLE_WINDOW,
            ramp_duration: hyst_const::RAMP_DURATION,
            ramp_step_interval: hyst_const::RAMP_STEP_INTERVAL,
            write_attempts: retry_const::WRITE_ATTEMPTS,
            write_delay: retry_const::WRITE_DELAY,
        }
    }
}

/// Mutable loop state, guarded by a parking_lot mutex that is never held
/// across an await point.
struct ControlState {
    curve: ActiveCurve,
    settings: HysteresisSettings,
    cpu_hysteresis: HysteresisController,
    gpu_hysteresis: HysteresisController,
    protection: ThermalProtection,
    mode: FanMode,
    preset: Option<FanPreset>,
    /// Last percent commanded to the CPU fan (or all fans when unified)
    last_applied: Option<u8>,
    last_applied_gpu: Option<u8>,
    /// User boost adjustment added to every curve output
    heat_offset_percent: i8,
    last_curve_apply: Option<Instant>,
    last_refresh: Option<Instant>,
    immediate_apply: bool,
    /// Bumped to supersede any in-flight ramp task
    ramp_generation: u64,
    samples: VecDeque<ThermalSample>,
    /// Most recent RPM read-back, telemetry only (never drives decisions)
    last_rpms: Vec<crate::hw::FanReading>,
    /// CPU and GPU temperatures from the previous tick
    last_temps: Option<(f32, f32)>,
    poll_fast: bool,
}

impl ControlState {
    fn new(settings: HysteresisSettings) -> Self {
        let settings = settings.normalized();
        let protection_cfg =
            ProtectionConfig::with_warning_threshold(clamp_threshold(
                settings.thermal_protection_threshold_c,
            ));
        Self {
            curve: ActiveCurve::None,
            cpu_hysteresis: HysteresisController::new(settings.clone()),
            gpu_hysteresis: HysteresisController::new(settings.clone()),
            protection: ThermalProtection::new(protection_cfg),
            settings,
            mode: FanMode::Auto,
            preset: None,
            last_applied: None,
            last_applied_gpu: None,
            heat_offset_percent: 0,
            last_curve_apply: None,
            last_refresh: None,
            immediate_apply: true,
            ramp_generation: 0,
            samples: VecDeque::with_capacity(timing::SAMPLE_WINDOW),
            last_rpms: Vec::new(),
            last_temps: None,
            poll_fast: true,
        }
    }
}

fn clamp_threshold(threshold_c: f32) -> f32 {
    threshold_c.clamp(thermal::THRESHOLD_MIN_C, thermal::THRESHOLD_MAX_C)
}

fn offset_percent(percent: u8, offset: i8) -> u8 {
    (percent as i16 + offset as i16).clamp(0, 100) as u8
}

/// What one tick decided to do, computed under the state lock and
/// executed after it is released.
enum TickAction {
    Nothing,
    Protection(ProtectionDecision),
    Write(WritePlan),
}

struct WritePlan {
    cpu: u8,
    /// Present only for independent dual-fan writes
    gpu: Option<u8>,
    /// Previous applied values, for ramp planning
    from: Option<u8>,
    from_gpu: Option<u8>,
    /// Skip ramping and write directly (force refresh)
    direct: bool,
}

/// The continuous control service. Clone-free: share it behind an `Arc`.
pub struct FanControlService {
    controller: Arc<dyn FanController>,
    temperatures: Arc<dyn TemperatureSource>,
    config: ControlConfig,
    state: Arc<Mutex<ControlState>>,
    events: broadcast::Sender<ControlEvent>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl FanControlService {
    pub fn new(
        controller: Arc<dyn FanController>,
        temperatures: Arc<dyn TemperatureSource>,
        config: ControlConfig,
    ) -> Self {
        Self {
            controller,
            temperatures,
            config,
            state: Arc::new(Mutex::new(ControlState::new(HysteresisSettings::default()))),
            events: events::channel(),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Sender handle, for wiring other components onto the same channel
    pub fn event_sender(&self) -> broadcast::Sender<ControlEvent> {
        self.events.clone()
    }

    pub fn protection_state(&self) -> ProtectionState {
        self.state.lock().protection.state()
    }

    pub fn last_applied(&self) -> Option<u8> {
        self.state.lock().last_applied
    }

    /// Rolling temperature history, oldest first
    pub fn samples(&self) -> Vec<ThermalSample> {
        self.state.lock().samples.iter().cloned().collect()
    }

    /// Most recent RPM read-back (empty until the first tick, or when the
    /// backend lacks read-back)
    pub fn fan_readings(&self) -> Vec<crate::hw::FanReading> {
        self.state.lock().last_rpms.clone()
    }

    pub fn hysteresis_settings(&self) -> HysteresisSettings {
        self.state.lock().settings.clone()
    }

    pub fn set_unified_curve(&self, curve: FanCurve) {
        let mut st = self.state.lock();
        st.curve = ActiveCurve::Unified(curve);
        st.mode = FanMode::Custom;
        st.cpu_hysteresis.reset();
        st.gpu_hysteresis.reset();
        st.immediate_apply = true;
        drop(st);
        self.wake.notify_one();
    }

    pub fn set_independent_curves(&self, cpu: FanCurve, gpu: FanCurve) {
        let mut st = self.state.lock();
        st.curve = ActiveCurve::Independent { cpu, gpu };
        st.mode = FanMode::Custom;
        st.cpu_hysteresis.reset();
        st.gpu_hysteresis.reset();
        st.immediate_apply = true;
        drop(st);
        self.wake.notify_one();
    }

    /// Stop curve control; the hardware keeps whatever was last applied
    pub fn clear_curve(&self) {
        let mut st = self.state.lock();
        st.curve = ActiveCurve::None;
        st.cpu_hysteresis.reset();
        st.gpu_hysteresis.reset();
    }

    pub fn set_hysteresis_settings(&self, settings: HysteresisSettings) {
        let settings = settings.normalized();
        let mut st = self.state.lock();
        st.cpu_hysteresis.set_settings(settings.clone());
        st.gpu_hysteresis.set_settings(settings.clone());
        st.protection.set_config(ProtectionConfig::with_warning_threshold(clamp_threshold(
            settings.thermal_protection_threshold_c,
        )));
        st.settings = settings;
        st.immediate_apply = true;
        drop(st);
        self.wake.notify_one();
    }

    /// Boost adjustment added to every curve output before clamping
    pub fn set_heat_offset(&self, offset_percent: i8) {
        let mut st = self.state.lock();
        st.heat_offset_percent = offset_percent;
        st.immediate_apply = true;
        drop(st);
        self.wake.notify_one();
    }

    /// Re-evaluate and apply on the next tick, skipping all suppression
    pub fn request_immediate_apply(&self) {
        self.state.lock().immediate_apply = true;
        self.wake.notify_one();
    }

    /// Apply a preset through the backend and adopt its curve (if any)
    /// for subsequent loop control.
    pub async fn apply_preset(&self, preset: FanPreset) -> Result<()> {
        retry_with_delay(self.config.write_attempts, self.config.write_delay, || {
            self.controller.apply_preset(&preset)
        })
        .await?;

        {
            let mut st = self.state.lock();
            st.mode = preset.mode;
            st.curve = match &preset.curve {
                Some(curve) => ActiveCurve::Unified(curve.clone()),
                None => ActiveCurve::None,
            };
            st.preset = Some(preset.clone());
            st.cpu_hysteresis.reset();
            st.gpu_hysteresis.reset();
            st.last_applied = None;
            st.last_applied_gpu = None;
            st.immediate_apply = true;
            st.ramp_generation += 1;
        }

        info!(preset = %preset.name, mode = ?preset.mode, "preset applied");
        let _ = self.events.send(ControlEvent::PresetApplied { name: preset.name });
        self.wake.notify_one();
        Ok(())
    }

    /// Signal the loop to exit; in-flight ramps are superseded
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.state.lock().ramp_generation += 1;
        self.wake.notify_one();
    }

    /// Run until [`stop`](Self::stop) is called or tick failures hit the
    /// consecutive-error bound. Sustained failure commands maximum cooling
    /// as a failsafe and stops the loop; a [`ControlEvent::ControlLoopStopped`]
    /// event tells hosts the service is no longer driving the fans.
    pub async fn run(&self) {
        info!(backend = self.controller.backend_name(), "fan control loop starting");
        let mut consecutive_errors: u32 = 0;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("fan control loop shutting down");
                break;
            }

            match self.tick().await {
                Ok(()) => {
                    if consecutive_errors > 0 {
                        debug!(consecutive_errors, "control loop recovered");
                        consecutive_errors = 0;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(consecutive_errors, error = %e, "control tick failed");
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        error!(
                            consecutive_errors,
                            "persistent control failures; commanding maximum cooling and stopping"
                        );
                        if let Err(e) = self.controller.apply_max_cooling().await {
                            error!(error = %e, "failsafe max cooling also failed");
                        }
                        self.shutdown.store(true, Ordering::SeqCst);
                        let _ = self
                            .events
                            .send(ControlEvent::ControlLoopStopped { consecutive_errors });
                        break;
                    }
                }
            }

            let poll = self.poll_interval();
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.wake.notified() => {
                    debug!("control loop woken early");
                }
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        let st = self.state.lock();
        if st.poll_fast || st.protection.is_active() {
            self.config.fast_poll
        } else {
            self.config.slow_poll
        }
    }

    async fn tick(&self) -> Result<()> {
        let now = tokio::time::Instant::now().into_std();
        let readings = self.temperatures.read_temperatures().await?;
        let (cpu, gpu) = select_cpu_gpu(&readings);
        let sample = ThermalSample::now(cpu, gpu);
        let hottest = sample.max_celsius();
        let caps = self.controller.capabilities();
        let dual_fan = caps.dual_fan;

        // Telemetry only; decisions never consume RPM
        let rpms = if caps.readback {
            self.controller.read_fan_speeds().await.unwrap_or_default()
        } else {
            Vec::new()
        };

        let action = {
            let mut st = self.state.lock();

            st.samples.push_back(sample);
            while st.samples.len() > self.config.sample_window {
                st.samples.pop_front();
            }
            if !rpms.is_empty() {
                st.last_rpms = rpms;
            }
            // Stable only when BOTH sensors sit still; the hottest reading
            // alone can stay flat while the other sensor ramps underneath it
            st.poll_fast = match st.last_temps {
                Some((prev_cpu, prev_gpu)) => {
                    let threshold = self.config.stability_threshold_c;
                    (cpu - prev_cpu).abs() >= threshold || (gpu - prev_gpu).abs() >= threshold
                }
                None => true,
            };
            st.last_temps = Some((cpu, gpu));

            let decision = if st.settings.thermal_protection_enabled {
                let prior = PriorFanState {
                    mode: st.mode,
                    preset: st.preset.clone(),
                    applied_percent: st.last_applied,
                };
                st.protection.update(hottest, now, &prior)
            } else {
                ProtectionDecision::Inactive
            };

            match decision {
                ProtectionDecision::Inactive => self.plan_curve(&mut st, cpu, gpu, now, dual_fan),
                other => {
                    // Protection owns the hardware; kill any in-flight ramp
                    st.ramp_generation += 1;
                    TickAction::Protection(other)
                }
            }
        };

        match action {
            TickAction::Nothing => Ok(()),
            TickAction::Protection(decision) => self.execute_protection(decision, now).await,
            TickAction::Write(plan) => self.execute_write(plan).await,
        }
    }

    /// Curve control planning; runs under the state lock.
    fn plan_curve(
        &self,
        st: &mut ControlState,
        cpu: f32,
        gpu: f32,
        now: Instant,
        dual_fan: bool,
    ) -> TickAction {
        if st.curve.is_none() {
            return TickAction::Nothing;
        }

        let cfg = &self.config;
        let force = st.immediate_apply
            || st.last_refresh.map_or(true, |t| now - t >= cfg.force_refresh_interval);
        let due = force
            || st.last_curve_apply.map_or(true, |t| now - t >= cfg.curve_update_interval);
        if !due {
            return TickAction::Nothing;
        }

        st.immediate_apply = false;
        st.last_curve_apply = Some(now);
        if force {
            st.last_refresh = Some(now);
        }

        let offset = st.heat_offset_percent;
        let hottest = cpu.max(gpu);

        let plan = match &st.curve {
            ActiveCurve::Unified(curve) => {
                let target =
                    clamp_for_temperature(offset_percent(curve::evaluate(curve, hottest), offset), hottest);
                match st.cpu_hysteresis.decide(target, st.last_applied, hottest, now, force) {
                    Decision::Hold => return TickAction::Nothing,
                    Decision::Apply(percent) => WritePlan {
                        cpu: percent,
                        gpu: None,
                        from: st.last_applied,
                        from_gpu: None,
                        direct: force,
                    },
                }
            }
            ActiveCurve::Independent { cpu: cpu_curve, gpu: gpu_curve } => {
                let cpu_target =
                    clamp_for_temperature(offset_percent(curve::evaluate(cpu_curve, cpu), offset), cpu);
                let gpu_target =
                    clamp_for_temperature(offset_percent(curve::evaluate(gpu_curve, gpu), offset), gpu);

                if !dual_fan {
                    // Single-channel hardware: the hotter demand wins
                    let target = cpu_target.max(gpu_target);
                    match st.cpu_hysteresis.decide(target, st.last_applied, hottest, now, force) {
                        Decision::Hold => return TickAction::Nothing,
                        Decision::Apply(percent) => WritePlan {
                            cpu: percent,
                            gpu: None,
                            from: st.last_applied,
                            from_gpu: None,
                            direct: force,
                        },
                    }
                } else {
                    let cpu_decision =
                        st.cpu_hysteresis.decide(cpu_target, st.last_applied, cpu, now, force);
                    let gpu_decision =
                        st.gpu_hysteresis.decide(gpu_target, st.last_applied_gpu, gpu, now, force);
                    match (cpu_decision, gpu_decision) {
                        (Decision::Hold, Decision::Hold) => return TickAction::Nothing,
                        (cpu_d, gpu_d) => {
                            // A holding channel keeps its current speed
                            let cpu_next = match cpu_d {
                                Decision::Apply(p) => p,
                                Decision::Hold => st.last_applied.unwrap_or(cpu_target),
                            };
                            let gpu_next = match gpu_d {
                                Decision::Apply(p) => p,
                                Decision::Hold => st.last_applied_gpu.unwrap_or(gpu_target),
                            };
                            WritePlan {
                                cpu: cpu_next,
                                gpu: Some(gpu_next),
                                from: st.last_applied,
                                from_gpu: st.last_applied_gpu,
                                direct: force,
                            }
                        }
                    }
                }
            }
            ActiveCurve::None => return TickAction::Nothing,
        };

        TickAction::Write(plan)
    }

    async fn execute_protection(&self, decision: ProtectionDecision, now: Instant) -> Result<()> {
        match decision {
            ProtectionDecision::Inactive => Ok(()),
            ProtectionDecision::Activated { severity, percent } => {
                let temperature_c = self
                    .state
                    .lock()
                    .last_temps
                    .map(|(c, g)| c.max(g))
                    .unwrap_or(0.0);
                warn!(?severity, percent, temperature_c, "thermal protection engaged");
                self.write_percent(percent).await?;
                self.record_applied(percent, Some(percent), now);
                let _ = self
                    .events
                    .send(ControlEvent::ThermalProtectionActivated { severity, temperature_c });
                Ok(())
            }
            ProtectionDecision::Override { percent, .. } => {
                let (changed, refresh_due) = {
                    let st = self.state.lock();
                    let refresh_due = st
                        .last_refresh
                        .map_or(true, |t| now - t >= self.config.force_refresh_interval);
                    (st.last_applied != Some(percent), refresh_due)
                };
                if changed || refresh_due {
                    self.write_percent(percent).await?;
                    self.record_applied(percent, Some(percent), now);
                    self.state.lock().last_refresh = Some(now);
                }
                Ok(())
            }
            ProtectionDecision::Released { restore, temperature_c } => {
                info!(temperature_c, "thermal protection released");
                self.execute_restore(restore).await?;
                let _ = self.events.send(ControlEvent::ThermalProtectionReleased { temperature_c });
                Ok(())
            }
        }
    }

    async fn execute_restore(&self, restore: RestoreAction) -> Result<()> {
        let cfg = &self.config;
        match restore {
            RestoreAction::MaxCooling => {
                retry_with_delay(cfg.write_attempts, cfg.write_delay, || {
                    self.controller.apply_max_cooling()
                })
                .await?;
                self.record_applied(100, Some(100), tokio::time::Instant::now().into_std());
            }
            RestoreAction::Preset { preset, floor } => {
                retry_with_delay(cfg.write_attempts, cfg.write_delay, || {
                    self.controller.apply_preset(&preset)
                })
                .await?;
                if let Some(floor) = floor {
                    // Preset restored but the machine is still warm: start
                    // from the floor instead of whatever the preset idles at
                    retry_with_delay(cfg.write_attempts, cfg.write_delay, || {
                        self.controller.set_fan_speed(floor)
                    })
                    .await?;
                    self.record_applied(floor, Some(floor), tokio::time::Instant::now().into_std());
                }
                let mut st = self.state.lock();
                st.mode = preset.mode;
                st.preset = Some(preset);
                st.immediate_apply = true;
            }
            RestoreAction::Percent { percent } => {
                self.write_percent(percent).await?;
                self.record_applied(percent, Some(percent), tokio::time::Instant::now().into_std());
                self.state.lock().immediate_apply = true;
            }
            RestoreAction::AutoControl => {
                retry_with_delay(cfg.write_attempts, cfg.write_delay, || {
                    self.controller.restore_auto_control()
                })
                .await?;
                let mut st = self.state.lock();
                st.last_applied = None;
                st.last_applied_gpu = None;
                st.immediate_apply = true;
            }
            RestoreAction::Floor { percent } => {
                self.write_percent(percent).await?;
                self.record_applied(percent, Some(percent), tokio::time::Instant::now().into_std());
                self.state.lock().immediate_apply = true;
            }
        }
        Ok(())
    }

    async fn execute_write(&self, plan: WritePlan) -> Result<()> {
        let ramp_wanted = !plan.direct
            && self.state.lock().settings.enabled
            && plan.from.is_some()
            && (plan.from != Some(plan.cpu) || plan.from_gpu != plan.gpu);

        if ramp_wanted {
            self.spawn_ramp(&plan);
            return Ok(());
        }

        let cfg = &self.config;
        match plan.gpu {
            Some(gpu) => {
                retry_with_delay(cfg.write_attempts, cfg.write_delay, || {
                    self.controller.set_fan_speeds(plan.cpu, gpu)
                })
                .await?;
                self.record_applied(plan.cpu, Some(gpu), tokio::time::Instant::now().into_std());
            }
            None => {
                self.write_percent(plan.cpu).await?;
                self.record_applied(plan.cpu, Some(plan.cpu), tokio::time::Instant::now().into_std());
            }
        }
        debug!(cpu = plan.cpu, gpu = ?plan.gpu, "fan speed committed");
        Ok(())
    }

    /// Spawn a detached ramp task stepping toward the plan's targets.
    /// A newer ramp, a protection event, or shutdown supersedes it.
    fn spawn_ramp(&self, plan: &WritePlan) {
        let generation = {
            let mut st = self.state.lock();
            st.ramp_generation += 1;
            st.ramp_generation
        };

        let from_cpu = plan.from.unwrap_or(plan.cpu);
        let cpu_steps = plan_ramp(from_cpu, plan.cpu, self.config.ramp_duration, self.config.ramp_step_interval);
        let gpu_steps = plan.gpu.map(|to| {
            plan_ramp(
                plan.from_gpu.unwrap_or(to),
                to,
                self.config.ramp_duration,
                self.config.ramp_step_interval,
            )
        });

        let controller = Arc::clone(&self.controller);
        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);
        let step_interval = self.config.ramp_step_interval;
        let cpu_target = plan.cpu;
        let gpu_target = plan.gpu;

        tokio::spawn(async move {
            let len = cpu_steps.len().max(gpu_steps.as_ref().map_or(0, Vec::len));
            for i in 0..len {
                if shutdown.load(Ordering::SeqCst)
                    || state.lock().ramp_generation != generation
                {
                    debug!("ramp superseded");
                    return;
                }

                let cpu = cpu_steps.get(i).copied().unwrap_or(cpu_target);
                let write = match gpu_target {
                    Some(target) => {
                        let gpu = gpu_steps
                            .as_ref()
                            .and_then(|s| s.get(i).copied())
                            .unwrap_or(target);
                        controller.set_fan_speeds(cpu, gpu).await.map(|()| (cpu, Some(gpu)))
                    }
                    None => controller.set_fan_speed(cpu).await.map(|()| (cpu, Some(cpu))),
                };

                match write {
                    Ok((cpu, gpu)) => {
                        let mut st = state.lock();
                        st.last_applied = Some(cpu);
                        st.last_applied_gpu = gpu;
                    }
                    Err(e) => {
                        // Next force refresh corrects whatever we left behind
                        warn!(error = %e, "ramp step failed, abandoning ramp");
                        return;
                    }
                }

                if i + 1 < len {
                    tokio::time::sleep(step_interval).await;
                }
            }
        });
    }

    /// Single write honoring the dedicated max-cooling command
    async fn write_percent(&self, percent: u8) -> Result<()> {
        let cfg = &self.config;
        if percent == 100 && self.controller.capabilities().max_command {
            retry_with_delay(cfg.write_attempts, cfg.write_delay, || {
                self.controller.apply_max_cooling()
            })
            .await
        } else {
            retry_with_delay(cfg.write_attempts, cfg.write_delay, || {
                self.controller.set_fan_speed(percent)
            })
            .await
        }
    }

    fn record_applied(&self, cpu: u8, gpu: Option<u8>, now: Instant) {
        let mut st = self.state.lock();
        st.last_applied = Some(cpu);
        if gpu.is_some() {
            st.last_applied_gpu = gpu;
        }
        st.last_curve_apply = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CurvePoint;
    use crate::hw::sim::{SimCommand, SimulatedFan};

    fn test_curve() -> FanCurve {
        FanCurve::new(vec![
            CurvePoint { temperature_c: 40, fan_percent: 20 },
            CurvePoint { temperature_c: 60, fan_percent: 60 },
            CurvePoint { temperature_c: 90, fan_percent: 100 },
        ])
        .unwrap()
    }

    fn service(sim: &Arc<SimulatedFan>) -> Arc<FanControlService> {
        Arc::new(FanControlService::new(
            Arc::clone(sim) as Arc<dyn FanController>,
            Arc::clone(sim) as Arc<dyn TemperatureSource>,
            ControlConfig::default(),
        ))
    }

    async fn run_for(svc: &Arc<FanControlService>, duration: Duration) {
        let runner = {
            let svc = Arc::clone(svc);
            tokio::spawn(async move { svc.run().await })
        };
        tokio::time::sleep(duration).await;
        svc.stop();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn curve_output_reaches_hardware() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(60.0, 45.0);
        let svc = service(&sim);
        svc.set_unified_curve(test_curve());

        run_for(&svc, Duration::from_secs(2)).await;

        // 60 °C on the curve is exactly 60%
        assert_eq!(sim.fan_percent(0), Some(60));
        assert_eq!(svc.last_applied(), Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn hotter_sensor_drives_unified_curve() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(45.0, 60.0);
        let svc = service(&sim);
        svc.set_unified_curve(test_curve());

        run_for(&svc, Duration::from_secs(2)).await;

        assert_eq!(sim.fan_percent(0), Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_protection_prevails_over_curve() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(96.0, 50.0);
        let svc = service(&sim);
        svc.set_unified_curve(test_curve());
        let mut events = svc.subscribe();

        run_for(&svc, Duration::from_secs(2)).await;

        assert_eq!(sim.fan_percent(0), Some(100));
        // Emergency path uses the dedicated max-cooling command
        assert!(sim.history().contains(&SimCommand::MaxCooling));
        let event = events.try_recv().unwrap();
        assert!(matches!(
            event,
            ControlEvent::ThermalProtectionActivated { severity: super::super::protection::Severity::Emergency, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn warm_release_imposes_floor() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(96.0, 50.0);
        let svc = service(&sim);

        let runner = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run().await })
        };

        // Engage emergency protection, then cool to a warm-but-safe level
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(svc.protection_state(), ProtectionState::Active { .. }));
        sim.set_temperatures(70.0, 50.0);

        // Release needs the full 15 s debounce
        tokio::time::sleep(Duration::from_secs(20)).await;
        svc.stop();
        runner.await.unwrap();

        assert_eq!(svc.protection_state(), ProtectionState::Normal);
        // 70 °C is above the safe-release temperature; a 40% floor applies
        assert_eq!(sim.fan_percent(0), Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_protection_leaves_curve_in_charge() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(96.0, 50.0);
        let svc = service(&sim);
        svc.set_unified_curve(test_curve());
        svc.set_hysteresis_settings(HysteresisSettings {
            thermal_protection_enabled: false,
            ..HysteresisSettings::default()
        });

        run_for(&svc, Duration::from_secs(2)).await;

        // Curve says 100% at 96 °C anyway, but via the state machine the
        // protection must never have engaged
        assert_eq!(svc.protection_state(), ProtectionState::Normal);
        assert_eq!(sim.fan_percent(0), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn independent_curves_write_both_channels() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(60.0, 40.0);
        let svc = service(&sim);
        svc.set_independent_curves(test_curve(), test_curve());

        run_for(&svc, Duration::from_secs(2)).await;

        assert_eq!(sim.fan_percent(0), Some(60));
        assert_eq!(sim.fan_percent(1), Some(20));
    }

    #[tokio::test(start_paused = true)]
    async fn single_channel_hardware_takes_hotter_demand() {
        let sim = Arc::new(SimulatedFan::builder().dual_fan(false).build());
        sim.set_temperatures(40.0, 60.0);
        let svc = service(&sim);
        svc.set_independent_curves(test_curve(), test_curve());

        run_for(&svc, Duration::from_secs(2)).await;

        // GPU demands 60%, CPU only 20%; the hotter demand wins
        assert_eq!(sim.fan_percent(0), Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn heat_offset_raises_curve_output() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(60.0, 45.0);
        let svc = service(&sim);
        svc.set_heat_offset(10);
        svc.set_unified_curve(test_curve());

        run_for(&svc, Duration::from_secs(2)).await;

        assert_eq!(sim.fan_percent(0), Some(70));
    }

    #[tokio::test(start_paused = true)]
    async fn preset_application_emits_event() {
        let sim = Arc::new(SimulatedFan::builder().build());
        let svc = service(&sim);
        let mut events = svc.subscribe();

        svc.apply_preset(FanPreset::max()).await.unwrap();

        assert!(matches!(
            sim.history().last(),
            Some(SimCommand::Preset(name)) if name == &FanPreset::max().name
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            ControlEvent::PresetApplied { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn read_failures_do_not_stop_the_loop() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(60.0, 45.0);
        let svc = service(&sim);
        svc.set_unified_curve(test_curve());

        // Transient write failures are retried inside the tick
        sim.fail_next_writes(1);
        run_for(&svc, Duration::from_secs(5)).await;

        assert_eq!(sim.fan_percent(0), Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn rpm_readback_feeds_telemetry() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(60.0, 45.0);
        let svc = service(&sim);
        svc.set_unified_curve(test_curve());

        run_for(&svc, Duration::from_secs(5)).await;

        let readings = svc.fan_readings();
        assert_eq!(readings.len(), 2);
        // 60% on a 5500 RPM ceiling
        assert_eq!(readings[0].rpm, 3300);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_window_is_bounded() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(50.0, 45.0);
        let svc = Arc::new(FanControlService::new(
            Arc::clone(&sim) as Arc<dyn FanController>,
            Arc::clone(&sim) as Arc<dyn TemperatureSource>,
            ControlConfig { sample_window: 5, ..ControlConfig::default() },
        ));

        run_for(&svc, Duration::from_secs(30)).await;

        assert!(svc.samples().len() <= 5);
        assert!(!svc.samples().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_failure_stops_the_loop_after_failsafe() {
        let sim = Arc::new(SimulatedFan::builder().build());
        // Emergency heat forces a write attempt on every tick
        sim.set_temperatures(96.0, 50.0);
        let svc = Arc::new(FanControlService::new(
            Arc::clone(&sim) as Arc<dyn FanController>,
            Arc::clone(&sim) as Arc<dyn TemperatureSource>,
            ControlConfig { max_consecutive_errors: 3, ..ControlConfig::default() },
        ));
        let mut events = svc.subscribe();
        sim.fail_next_writes(u32::MAX);

        let runner = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run().await })
        };

        // Far longer than three failing ticks need; without the terminal
        // stop the task would still be running here
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(runner.is_finished());
        runner.await.unwrap();

        let mut stopped = None;
        while let Ok(event) = events.try_recv() {
            if let ControlEvent::ControlLoopStopped { consecutive_errors } = event {
                stopped = Some(consecutive_errors);
            }
        }
        assert_eq!(stopped, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn ramping_cooler_sensor_keeps_polling_fast() {
        let sim = Arc::new(SimulatedFan::builder().build());
        sim.set_temperatures(50.0, 80.0);
        let svc = service(&sim);

        let runner = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run().await })
        };

        // GPU pinned at 80 °C keeps the hottest reading flat while the
        // CPU climbs 4 °C per second underneath it; the loop must notice
        // the climb and stay on the fast poll interval
        for i in 1..=10u32 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            sim.set_temperatures(50.0 + 4.0 * i as f32, 80.0);
        }
        svc.stop();
        runner.await.unwrap();

        // Fast polling yields roughly one sample per second; slow polling
        // over the same window would collect only a third of that
        assert!(svc.samples().len() >= 9, "got {} samples", svc.samples().len());
    }
}
