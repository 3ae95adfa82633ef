use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::health::{DeviceHealth, HealthTracker};
use crate::domain::{BoostPlan, BoostRequest, BoostWindow, DeviceId, DeviceState, Mode};

/// Per-device records plus the on-demand boost requests waiting for the next boost tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
    pub pending: BTreeMap<DeviceId, BoostRequest>,
}

/// Everything the loop remembers about one device between ticks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub health: HealthTracker,
    pub last_state: Option<DeviceState>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Mode most recently commanded, or first reported
    pub last_applied: Option<Mode>,
    /// Windows believed to be installed on the device, sorted by start
    pub installed: Vec<BoostWindow>,
    pub last_plan: Option<BoostPlan>,
    /// Energy from finished windows counted against the standing boost
    pub standing_progress: Option<StandingProgress>,
    /// Set after an on-demand boost is applied; the standing boost leaves the
    /// device alone until then
    pub standing_paused_until: Option<DateTime<FixedOffset>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StandingProgress {
    pub deadline: DateTime<FixedOffset>,
    pub delivered_kwh: f64,
}

impl DeviceRecord {
    pub fn health(&self) -> DeviceHealth {
        self.health.state
    }

    /// Drop windows that have already finished and return them
    pub fn prune_windows(&mut self, now: DateTime<FixedOffset>) -> Vec<BoostWindow> {
        let (live, finished): (Vec<_>, Vec<_>) = std::mem::take(&mut self.installed)
            .into_iter()
            .partition(|w| w.end() > now);
        self.installed = live;
        finished
    }

    /// Count energy delivered towards the standing boost due at `deadline`. Progress
    /// towards an earlier deadline is discarded.
    pub fn credit_standing(&mut self, deadline: DateTime<FixedOffset>, kwh: f64) {
        match &mut self.standing_progress {
            Some(progress) if progress.deadline == deadline => progress.delivered_kwh += kwh,
            _ => {
                self.standing_progress = Some(StandingProgress {
                    deadline,
                    delivered_kwh: kwh,
                })
            }
        }
    }

    /// Progress already made towards the standing boost due at `deadline`
    pub fn standing_delivered(&self, deadline: DateTime<FixedOffset>) -> f64 {
        self.standing_progress
            .filter(|p| p.deadline == deadline)
            .map_or(0.0, |p| p.delivered_kwh)
    }

    /// Back to UNKNOWN. Installed windows are kept since the device still holds them.
    pub fn reset(&mut self) {
        self.health.reset();
        self.last_state = None;
        self.last_applied = None;
        self.last_error = None;
    }
}
