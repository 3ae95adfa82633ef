pub mod agile;
pub mod simulated;

pub use agile::*;
pub use simulated::*;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::PriceScheduleProvider;

/// Where unit prices come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    #[default]
    Agile,
    Simulated,
}

/// Build the configured price provider
pub fn build_price_provider(
    source: PriceSource,
    base_url: &str,
    product_code: &str,
    http_timeout: Duration,
    cache_ttl: Duration,
) -> anyhow::Result<Arc<dyn PriceScheduleProvider>> {
    Ok(match source {
        PriceSource::Agile => Arc::new(AgilePriceProvider::new(
            base_url,
            product_code,
            http_timeout,
            cache_ttl,
        )?),
        PriceSource::Simulated => Arc::new(SimulatedPriceProvider::default()),
    })
}
