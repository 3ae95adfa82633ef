use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use super::{Duration, Thresholds};
use crate::error::OrderError;

/// A timed forced-charge session. Created per scheduling run and superseded, never
/// mutated, by the next run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostWindow {
    pub start: DateTime<FixedOffset>,
    pub duration: Duration,
    pub rate_kw: f64,
}

impl BoostWindow {
    pub fn end(&self) -> DateTime<FixedOffset> {
        self.start + self.duration.inner()
    }

    pub fn energy_kwh(&self) -> f64 {
        self.duration.as_hours_f64() * self.rate_kw
    }

    pub fn is_running(&self, now: DateTime<FixedOffset>) -> bool {
        self.start < now && now < self.end()
    }

    /// Energy the window still delivers after `now`
    pub fn remaining_energy_kwh(&self, now: DateTime<FixedOffset>) -> f64 {
        let secs = (self.end() - self.start.max(now)).num_seconds().max(0);
        secs as f64 / 3600.0 * self.rate_kw
    }
}

/// What a device should be given by the next scheduling run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostRequest {
    /// Net energy to deliver; zero or less only clears existing windows
    pub energy_target_kwh: f64,
    pub complete_by: Option<DateTime<FixedOffset>>,
    /// Falls back to the configured default device rate
    pub rate_kw: Option<f64>,
    pub clear_existing: bool,
}

impl BoostRequest {
    pub fn new(energy_target_kwh: f64) -> Self {
        Self {
            energy_target_kwh,
            complete_by: None,
            rate_kw: None,
            clear_existing: true,
        }
    }

    /// A request that only removes installed windows
    pub fn clear() -> Self {
        Self::new(0.0)
    }

    /// Energy needed to lift the vehicle from `current_soc` to `target_soc`
    pub fn to_reach_soc(thresholds: &Thresholds, current_soc: f64, target_soc: f64) -> Self {
        Self::new(thresholds.energy_for_soc(current_soc, target_soc))
    }

    pub fn complete_by(mut self, t: DateTime<FixedOffset>) -> Self {
        self.complete_by = Some(t);
        self
    }

    pub fn at_rate(mut self, rate_kw: f64) -> Self {
        self.rate_kw = Some(rate_kw);
        self
    }

    pub fn keep_existing(mut self) -> Self {
        self.clear_existing = false;
        self
    }

    pub fn is_noop(&self) -> bool {
        self.energy_target_kwh <= 0.0
    }
}

/// The available slots could not deliver the requested energy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialFulfillment {
    pub target_kwh: f64,
    pub delivered_kwh: f64,
    pub shortfall_kwh: f64,
}

/// Result of one scheduling run for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostPlan {
    /// Sorted by start time, adjacent same-rate slots merged
    pub windows: Vec<BoostWindow>,
    pub delivered_kwh: f64,
    /// Pence
    pub estimated_cost: f64,
    pub shortfall: Option<PartialFulfillment>,
    /// The windows replace whatever is installed rather than adding to it
    pub replace_existing: bool,
}

impl BoostPlan {
    pub fn empty(replace_existing: bool) -> Self {
        Self {
            windows: Vec::new(),
            delivered_kwh: 0.0,
            estimated_cost: 0.0,
            shortfall: None,
            replace_existing,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.shortfall.is_none()
    }
}

/// How much a standing boost should deliver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostTarget {
    EnergyKwh(f64),
    /// Charge up to this SOC; skipped while no vehicle reports a SOC
    TargetSoc(f64),
}

/// A boost configured to recur every day, finishing by a fixed local hour
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StandingBoost {
    pub target: BoostTarget,
    pub rate_kw: Option<f64>,
    pub finish_by_hour: u32,
    pub clear_existing: bool,
}

/// Next occurrence of `hour`:00 strictly after `now`, in `now`'s offset
pub fn next_hour_after(now: DateTime<FixedOffset>, hour: u32) -> Option<DateTime<FixedOffset>> {
    let candidate = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)?
        .and_local_timezone(*now.offset())
        .single()?;
    if candidate <= now {
        Some(candidate + chrono::Duration::days(1))
    } else {
        Some(candidate)
    }
}

impl StandingBoost {
    pub fn deadline_after(&self, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        next_hour_after(now, self.finish_by_hour)
    }

    pub fn resolve(
        &self,
        now: DateTime<FixedOffset>,
        thresholds: &Thresholds,
        soc_percent: Option<f64>,
    ) -> Option<BoostRequest> {
        let complete_by = self.deadline_after(now)?;
        let mut request = match self.target {
            BoostTarget::EnergyKwh(kwh) => BoostRequest::new(kwh),
            BoostTarget::TargetSoc(target) => {
                BoostRequest::to_reach_soc(thresholds, soc_percent?, target)
            }
        }
        .complete_by(complete_by);
        if let Some(rate_kw) = self.rate_kw {
            request = request.at_rate(rate_kw);
        }
        if !self.clear_existing {
            request = request.keep_existing();
        }
        Some(request)
    }
}

/// A one-off boost as asked for by a user, before it is resolved against the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoostOrder {
    pub energy_kwh: Option<f64>,
    pub target_soc: Option<f64>,
    pub rate_kw: Option<f64>,
    /// Finish by the next occurrence of this hour
    pub by_hour: Option<u32>,
    /// Explicit deadline, takes precedence over `by_hour`
    pub complete_by: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub keep_existing: bool,
}

impl BoostOrder {
    pub fn resolve(
        &self,
        now: DateTime<FixedOffset>,
        thresholds: &Thresholds,
        soc_percent: Option<f64>,
    ) -> Result<BoostRequest, OrderError> {
        let mut request = match (self.energy_kwh, self.target_soc) {
            (Some(kwh), None) => BoostRequest::new(kwh),
            (None, Some(target)) => {
                let soc = soc_percent.ok_or(OrderError::NoVehicleSoc)?;
                BoostRequest::to_reach_soc(thresholds, soc, target)
            }
            (Some(_), Some(_)) => return Err(OrderError::AmbiguousTarget),
            (None, None) => return Err(OrderError::MissingTarget),
        };

        let deadline = match (self.complete_by, self.by_hour) {
            (Some(t), _) => Some(t),
            (None, Some(hour)) => Some(next_hour_after(now, hour).ok_or(OrderError::InvalidHour(hour))?),
            (None, None) => None,
        };
        if let Some(t) = deadline {
            request = request.complete_by(t);
        }
        if let Some(rate_kw) = self.rate_kw {
            request = request.at_rate(rate_kw);
        }
        if self.keep_existing {
            request = request.keep_existing();
        }
        Ok(request)
    }
}
