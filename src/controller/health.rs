use serde::{Deserialize, Serialize};
use strum::Display;

/// Synchronisation state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum DeviceHealth {
    /// Never successfully polled
    #[default]
    Unknown,
    Synced,
    /// Last poll failed, the last known decision is retained
    Stale,
    /// Too many consecutive failures, commands suppressed until reset
    Failed,
}

/// Tracks consecutive poll failures and drives the health state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HealthTracker {
    pub state: DeviceHealth,
    pub consecutive_failures: u32,
}

impl HealthTracker {
    pub fn record_success(&mut self) -> DeviceHealth {
        if self.state != DeviceHealth::Failed {
            self.state = DeviceHealth::Synced;
            self.consecutive_failures = 0;
        }
        self.state
    }

    pub fn record_failure(&mut self, failure_limit: u32) -> DeviceHealth {
        if self.state == DeviceHealth::Failed {
            return self.state;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state = if self.consecutive_failures >= failure_limit.max(1) {
            DeviceHealth::Failed
        } else if self.state == DeviceHealth::Unknown {
            DeviceHealth::Unknown
        } else {
            DeviceHealth::Stale
        };
        self.state
    }

    /// Administrative reset, the only way out of FAILED
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn can_command(&self) -> bool {
        self.state != DeviceHealth::Failed
    }
}
