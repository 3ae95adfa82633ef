use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{GatewayClient, SimulatedSite};
use crate::controller::ManagedDevice;
use crate::domain::{DeviceCommandSink, DeviceStateProvider};

/// Which device adapter to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// In-memory devices for development and dry runs
    #[default]
    Simulated,
    /// Real devices behind the HTTP gateway
    Gateway,
}

/// State provider and command sink backed by the same adapter
#[derive(Clone)]
pub struct DeviceAdapters {
    pub states: Arc<dyn DeviceStateProvider>,
    pub commands: Arc<dyn DeviceCommandSink>,
}

/// Factory for creating device adapters
pub struct DeviceFactory {
    mode: HardwareMode,
    gateway_url: Option<String>,
    gateway_token: Option<String>,
    timeout: Duration,
}

impl DeviceFactory {
    pub fn new(mode: HardwareMode) -> Self {
        Self {
            mode,
            gateway_url: None,
            gateway_token: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_gateway(mut self, url: impl Into<String>, token: Option<String>) -> Self {
        self.gateway_url = Some(url.into());
        self.gateway_token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn create(&self, devices: &[ManagedDevice]) -> anyhow::Result<DeviceAdapters> {
        match self.mode {
            HardwareMode::Simulated => {
                let site = devices.iter().fold(SimulatedSite::new(0x5eed), |site, d| {
                    site.with_device(d.id.clone(), d.thresholds.capacity_kwh, Some(50.0), 1500.0)
                });
                tracing::info!(devices = devices.len(), "using simulated site");
                let site = Arc::new(site);
                Ok(DeviceAdapters {
                    states: site.clone(),
                    commands: site,
                })
            }
            HardwareMode::Gateway => {
                let url = self
                    .gateway_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("hardware.gateway_url is required in gateway mode"))?;
                let client = Arc::new(GatewayClient::new(
                    url,
                    self.gateway_token.as_deref(),
                    self.timeout,
                )?);
                tracing::info!(%url, "using device gateway");
                Ok(DeviceAdapters {
                    states: client.clone(),
                    commands: client,
                })
            }
        }
    }
}

impl Default for DeviceFactory {
    fn default() -> Self {
        Self::new(HardwareMode::Simulated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceId, Thresholds};

    fn devices() -> Vec<ManagedDevice> {
        vec![ManagedDevice::new("zappi-1", Thresholds::disabled(40.0))]
    }

    #[tokio::test]
    async fn test_simulated_site_knows_configured_devices() {
        let adapters = DeviceFactory::default().create(&devices()).unwrap();
        let states = adapters.states.fetch().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].device_id, DeviceId::new("zappi-1"));
    }

    #[test]
    fn test_gateway_mode_requires_url() {
        assert!(DeviceFactory::new(HardwareMode::Gateway)
            .create(&devices())
            .is_err());
        assert!(DeviceFactory::new(HardwareMode::Gateway)
            .with_gateway("http://127.0.0.1:8090", None)
            .create(&devices())
            .is_ok());
    }
}
