use serde::{Deserialize, Serialize};

use crate::domain::Duration;

/// Energy tolerance when deciding whether a target has been met
pub const DEFAULT_EPSILON_KWH: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConstraints {
    /// Charge rate used when a request does not name one
    pub default_rate_kw: f64,
    /// Number of boost timers the device offers, `None` for unlimited
    pub max_windows: Option<usize>,
    /// Longest single timer the device accepts
    pub max_window: Option<Duration>,
    pub epsilon_kwh: f64,
}

impl Default for SchedulerConstraints {
    fn default() -> Self {
        Self {
            default_rate_kw: 7.2,
            max_windows: Some(4),
            max_window: Some(Duration::hours(8)),
            epsilon_kwh: DEFAULT_EPSILON_KWH,
        }
    }
}

impl SchedulerConstraints {
    /// No timer limits, only the default rate
    pub fn unbounded(default_rate_kw: f64) -> Self {
        Self {
            default_rate_kw,
            max_windows: None,
            max_window: None,
            epsilon_kwh: DEFAULT_EPSILON_KWH,
        }
    }

    pub(crate) fn fits_window(&self, duration: Duration) -> bool {
        self.max_window.map_or(true, |max| duration <= max)
    }

    pub(crate) fn has_free_window(&self, used: usize) -> bool {
        self.max_windows.map_or(true, |max| used < max)
    }
}
