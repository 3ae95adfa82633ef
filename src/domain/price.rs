use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use super::{Duration, PriceRegion};
use crate::error::ProviderError;

/// One fixed-length tariff interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSlot {
    pub start: DateTime<FixedOffset>,
    pub duration: Duration,
    /// Pence per kWh, may be negative
    pub unit_price: f64,
}

impl PriceSlot {
    pub fn new(start: DateTime<FixedOffset>, duration: Duration, unit_price: f64) -> Self {
        Self {
            start,
            duration,
            unit_price,
        }
    }

    pub fn end(&self) -> DateTime<FixedOffset> {
        self.start + self.duration.inner()
    }
}

/// Supplies the published price slots for a region. May return fewer slots than the
/// full horizon when the next day has not been published yet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceScheduleProvider: Send + Sync {
    async fn fetch(&self, region: PriceRegion) -> Result<Vec<PriceSlot>, ProviderError>;
}
