use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::domain::{
    BoostWindow, DeviceCommandSink, DeviceId, DeviceState, DeviceStateProvider, Mode,
};
use crate::error::ProviderError;

/// JSON-over-HTTP bridge to the site's diversion devices
#[derive(Clone)]
pub struct GatewayClient {
    base_url: Url,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("energy-diverter/0.1"));
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url: Url::parse(base_url)?,
            client,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ProviderError::Malformed(format!("gateway url cannot be a base: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
        device: Option<&DeviceId>,
    ) -> Result<String, ProviderError> {
        debug!(%method, %url, "gateway request");
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request.send().await.map_err(ProviderError::from_transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(ProviderError::from_transport)?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status, &text, device));
        }
        Ok(text)
    }
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    devices: Vec<RawDevice>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    id: DeviceId,
    mode: Mode,
    surplus_w: f64,
    #[serde(default)]
    soc_percent: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ModeBody {
    mode: Mode,
}

#[derive(Debug, Serialize)]
struct BoostBody {
    windows: Vec<RawWindow>,
}

#[derive(Debug, Serialize)]
struct RawWindow {
    /// RFC 3339 with the local offset
    start: String,
    duration_minutes: i64,
    rate_kw: f64,
}

impl From<&BoostWindow> for RawWindow {
    fn from(w: &BoostWindow) -> Self {
        Self {
            start: w.start.to_rfc3339(),
            duration_minutes: w.duration.as_minutes(),
            rate_kw: w.rate_kw,
        }
    }
}

#[async_trait]
impl DeviceStateProvider for GatewayClient {
    async fn fetch(&self) -> Result<Vec<DeviceState>, ProviderError> {
        let body = self
            .send::<()>(Method::GET, self.url(&["devices"])?, None, None)
            .await?;
        let parsed: DevicesResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Malformed(format!("device list: {e}")))?;

        parsed
            .devices
            .into_iter()
            .map(|d| {
                if !d.surplus_w.is_finite() || d.soc_percent.is_some_and(|s| !(0.0..=100.0).contains(&s)) {
                    return Err(ProviderError::Malformed(format!(
                        "device {}: implausible reading",
                        d.id
                    )));
                }
                Ok(DeviceState {
                    device_id: d.id,
                    current_mode: d.mode,
                    surplus_w: d.surplus_w,
                    soc_percent: d.soc_percent,
                })
            })
            .collect()
    }
}

#[async_trait]
impl DeviceCommandSink for GatewayClient {
    async fn set_mode(&self, device: &DeviceId, mode: Mode) -> Result<(), ProviderError> {
        let url = self.url(&["devices", device.as_str(), "mode"])?;
        self.send(Method::PUT, url, Some(&ModeBody { mode }), Some(device))
            .await
            .map(|_| ())
    }

    async fn install_windows(
        &self,
        device: &DeviceId,
        windows: &[BoostWindow],
    ) -> Result<(), ProviderError> {
        let url = self.url(&["devices", device.as_str(), "boost"])?;
        let body = BoostBody {
            windows: windows.iter().map(RawWindow::from).collect(),
        };
        self.send(Method::PUT, url, Some(&body), Some(device))
            .await
            .map(|_| ())
    }

    async fn clear_windows(&self, device: &DeviceId) -> Result<(), ProviderError> {
        let url = self.url(&["devices", device.as_str(), "boost"])?;
        self.send::<()>(Method::DELETE, url, None, Some(device))
            .await
            .map(|_| ())
    }
}
