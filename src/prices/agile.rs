use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::{self, PriceRegion, PriceScheduleProvider, PriceSlot};
use crate::error::ProviderError;

pub const DEFAULT_BASE_URL: &str = "https://api.octopus.energy";
pub const DEFAULT_PRODUCT_CODE: &str = "AGILE-18-02-21";
const DEFAULT_MAX_PAGES: usize = 5;

type CachedSlots = Option<(DateTime<Utc>, PriceRegion, Vec<PriceSlot>)>;

/// Octopus Agile half-hourly unit rates
#[derive(Clone)]
pub struct AgilePriceProvider {
    base_url: String,
    product_code: String,
    client: reqwest::Client,
    cache: Arc<RwLock<CachedSlots>>,
    ttl: Duration,
    max_pages: usize,
}

impl AgilePriceProvider {
    pub fn new(
        base_url: &str,
        product_code: &str,
        timeout: Duration,
        ttl: Duration,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("energy-diverter/0.1"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            product_code: product_code.to_string(),
            client,
            cache: Arc::new(RwLock::new(None)),
            ttl,
            max_pages: DEFAULT_MAX_PAGES,
        })
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn tariff_code(&self, region: PriceRegion) -> String {
        format!("E-1R-{}-{}", self.product_code, region)
    }

    fn rates_url(&self, region: PriceRegion) -> String {
        format!(
            "{}/v1/products/{}/electricity-tariffs/{}/standard-unit-rates",
            self.base_url,
            self.product_code,
            self.tariff_code(region)
        )
    }

    async fn cached(&self, region: PriceRegion) -> Option<Vec<PriceSlot>> {
        let cache = self.cache.read().await;
        let (fetched_at, cached_region, slots) = cache.as_ref()?;
        let age = Utc::now() - *fetched_at;
        (*cached_region == region && age.num_seconds() < self.ttl.as_secs() as i64)
            .then(|| slots.clone())
    }

    /// All published slots starting at or after `from`, oldest first
    pub async fn fetch_from(
        &self,
        region: PriceRegion,
        from: DateTime<Utc>,
    ) -> Result<Vec<PriceSlot>, ProviderError> {
        let mut url = reqwest::Url::parse(&self.rates_url(region))
            .map_err(|e| ProviderError::Malformed(format!("invalid price url: {e}")))?;
        url.query_pairs_mut().append_pair(
            "period_from",
            &from.to_rfc3339_opts(SecondsFormat::Secs, true),
        );

        let mut slots = Vec::new();
        let mut next = Some(url.to_string());
        let mut pages = 0;
        while let Some(page_url) = next.take() {
            if pages == self.max_pages {
                warn!(pages, "unit rate pagination limit reached");
                break;
            }
            pages += 1;

            let resp = self
                .client
                .get(&page_url)
                .send()
                .await
                .map_err(ProviderError::from_transport)?;
            let status = resp.status();
            let body = resp.text().await.map_err(ProviderError::from_transport)?;
            if !status.is_success() {
                return Err(ProviderError::from_status(status, &body, None));
            }

            let page: RatesPage = serde_json::from_str(&body)
                .map_err(|e| ProviderError::Malformed(format!("unit rates: {e}")))?;
            for raw in page.results {
                match raw.into_slot() {
                    Some(slot) => slots.push(slot),
                    None => debug!("skipping open-ended unit rate"),
                }
            }
            next = page.next;
        }

        slots.sort_by_key(|s| s.start);
        slots.dedup_by_key(|s| s.start);
        debug!(%region, slots = slots.len(), pages, "fetched agile unit rates");
        Ok(slots)
    }
}

#[async_trait]
impl PriceScheduleProvider for AgilePriceProvider {
    async fn fetch(&self, region: PriceRegion) -> Result<Vec<PriceSlot>, ProviderError> {
        if let Some(slots) = self.cached(region).await {
            return Ok(slots);
        }

        // Include the slot already in progress
        let from = Utc::now() - chrono::Duration::minutes(30);
        let slots = self.fetch_from(region, from).await?;

        let mut cache = self.cache.write().await;
        *cache = Some((Utc::now(), region, slots.clone()));
        Ok(slots)
    }
}

#[derive(Debug, Deserialize)]
struct RatesPage {
    next: Option<String>,
    results: Vec<RawRate>,
}

#[derive(Debug, Deserialize)]
struct RawRate {
    value_inc_vat: f64,
    valid_from: DateTime<FixedOffset>,
    valid_to: Option<DateTime<FixedOffset>>,
}

impl RawRate {
    fn into_slot(self) -> Option<PriceSlot> {
        let length = self.valid_to? - self.valid_from;
        (length > chrono::Duration::zero()).then(|| {
            PriceSlot::new(self.valid_from, domain::Duration(length), self.value_inc_vat)
        })
    }
}
