use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use crate::domain::{
    BoostWindow, DeviceCommandSink, DeviceId, DeviceState, DeviceStateProvider, Mode,
};
use crate::error::ProviderError;

/// Minimum surplus an ECO diversion needs before it starts charging
const ECO_START_W: f64 = 1400.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedDevice {
    pub mode: Mode,
    pub soc_percent: Option<f64>,
    pub capacity_kwh: f64,
    pub surplus_w: f64,
    pub windows: Vec<BoostWindow>,
}

impl SimulatedDevice {
    fn boost_rate_at(&self, now: DateTime<FixedOffset>) -> Option<f64> {
        self.windows
            .iter()
            .find(|w| w.start <= now && now < w.end())
            .map(|w| w.rate_kw)
    }

    /// Charging power for the current mode
    fn power_kw(&self, now: DateTime<FixedOffset>, fast_rate_kw: f64) -> f64 {
        if let Some(rate) = self.boost_rate_at(now) {
            return rate;
        }
        match self.mode {
            Mode::Stop => 0.0,
            Mode::Fast | Mode::Boost => fast_rate_kw,
            Mode::Eco if self.surplus_w >= ECO_START_W => (self.surplus_w / 1000.0).min(fast_rate_kw),
            Mode::Eco => 0.0,
        }
    }
}

/// Every command received, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SiteCommand {
    SetMode(DeviceId, Mode),
    Install(DeviceId, Vec<BoostWindow>),
    Clear(DeviceId),
}

struct SiteState {
    devices: BTreeMap<DeviceId, SimulatedDevice>,
    rng: StdRng,
    step: chrono::Duration,
    fast_rate_kw: f64,
    max_timers: usize,
    failures_left: u32,
    commands: Vec<SiteCommand>,
}

/// In-memory site: each poll advances the simulation by one step, SOC follows the
/// charging power and the surplus wanders randomly
pub struct SimulatedSite {
    state: Mutex<SiteState>,
}

impl SimulatedSite {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(SiteState {
                devices: BTreeMap::new(),
                rng: StdRng::seed_from_u64(seed),
                step: chrono::Duration::minutes(1),
                fast_rate_kw: 7.2,
                max_timers: 4,
                failures_left: 0,
                commands: Vec::new(),
            }),
        }
    }

    pub fn with_device(
        self,
        id: impl Into<DeviceId>,
        capacity_kwh: f64,
        soc_percent: Option<f64>,
        surplus_w: f64,
    ) -> Self {
        self.state.lock().devices.insert(
            id.into(),
            SimulatedDevice {
                mode: Mode::Eco,
                soc_percent,
                capacity_kwh,
                surplus_w,
                windows: Vec::new(),
            },
        );
        self
    }

    pub fn with_step(self, step: chrono::Duration) -> Self {
        self.state.lock().step = step;
        self
    }

    /// The next `count` polls fail with a transient error
    pub fn inject_failures(&self, count: u32) {
        self.state.lock().failures_left = count;
    }

    pub fn set_surplus(&self, id: &DeviceId, surplus_w: f64) {
        if let Some(device) = self.state.lock().devices.get_mut(id) {
            device.surplus_w = surplus_w;
        }
    }

    pub fn device(&self, id: &DeviceId) -> Option<SimulatedDevice> {
        self.state.lock().devices.get(id).cloned()
    }

    pub fn commands(&self) -> Vec<SiteCommand> {
        self.state.lock().commands.clone()
    }

    fn advance(state: &mut SiteState, now: DateTime<FixedOffset>) {
        let hours = state.step.num_seconds() as f64 / 3600.0;
        let fast_rate_kw = state.fast_rate_kw;
        for device in state.devices.values_mut() {
            let power_kw = device.power_kw(now, fast_rate_kw);
            if let Some(soc) = device.soc_percent.as_mut() {
                *soc = (*soc + power_kw * hours / device.capacity_kwh * 100.0).min(100.0);
            }
            let drift: f64 = state.rng.gen_range(-250.0..250.0);
            device.surplus_w = (device.surplus_w + drift).clamp(-3000.0, 6000.0);
            device.windows.retain(|w| w.end() > now);
        }
    }

    fn unknown(device: &DeviceId) -> ProviderError {
        ProviderError::CommandRejected {
            device: device.clone(),
            reason: "unknown device".to_string(),
        }
    }
}

#[async_trait]
impl DeviceStateProvider for SimulatedSite {
    async fn fetch(&self) -> Result<Vec<DeviceState>, ProviderError> {
        let mut state = self.state.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(ProviderError::Transient("simulated outage".to_string()));
        }

        let now = Local::now().fixed_offset();
        Self::advance(&mut state, now);
        Ok(state
            .devices
            .iter()
            .map(|(id, device)| DeviceState {
                device_id: id.clone(),
                current_mode: if device.boost_rate_at(now).is_some() {
                    Mode::Boost
                } else {
                    device.mode
                },
                surplus_w: device.surplus_w,
                soc_percent: device.soc_percent,
            })
            .collect())
    }
}

#[async_trait]
impl DeviceCommandSink for SimulatedSite {
    async fn set_mode(&self, device: &DeviceId, mode: Mode) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        let sim = state.devices.get_mut(device).ok_or_else(|| Self::unknown(device))?;
        sim.mode = mode;
        state.commands.push(SiteCommand::SetMode(device.clone(), mode));
        Ok(())
    }

    async fn install_windows(
        &self,
        device: &DeviceId,
        windows: &[BoostWindow],
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        let max_timers = state.max_timers;
        let sim = state.devices.get_mut(device).ok_or_else(|| Self::unknown(device))?;
        if sim.windows.len() + windows.len() > max_timers {
            return Err(ProviderError::CommandRejected {
                device: device.clone(),
                reason: format!("only {max_timers} boost timers available"),
            });
        }
        sim.windows.extend_from_slice(windows);
        sim.windows.sort_by_key(|w| w.start);
        state
            .commands
            .push(SiteCommand::Install(device.clone(), windows.to_vec()));
        Ok(())
    }

    async fn clear_windows(&self, device: &DeviceId) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        let sim = state.devices.get_mut(device).ok_or_else(|| Self::unknown(device))?;
        sim.windows.clear();
        state.commands.push(SiteCommand::Clear(device.clone()));
        Ok(())
    }
}
