use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use validator::Validate;

use crate::controller::{LoopSettings, ManagedDevice, ModeDecisionEngine, RetryPolicy};
use crate::domain::{BoostTarget, DeviceId, Duration, PriceRegion, StandingBoost, Thresholds};
use crate::error::ConfigError;
use crate::hardware::HardwareMode;
use crate::optimizer::{SchedulerConstraints, DEFAULT_EPSILON_KWH};
use crate::prices::{PriceSource, DEFAULT_BASE_URL, DEFAULT_PRODUCT_CODE};
use crate::repo::DEFAULT_STATE_PATH;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "DIVERTER__";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
    #[serde(default)]
    #[validate(nested)]
    pub prices: PricesConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    #[validate(nested)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ControllerConfig {
    #[validate(range(min = 1))]
    pub poll_interval_seconds: u64,
    #[validate(range(min = 60))]
    pub boost_interval_seconds: u64,
    #[validate(range(min = 1))]
    pub tick_timeout_seconds: u64,
    #[validate(range(min = 1))]
    pub call_timeout_seconds: u64,
    /// Consecutive poll failures before a device is marked FAILED
    #[validate(range(min = 1, max = 100))]
    pub failure_limit: u32,
    pub export_threshold_w: f64,
    #[validate(range(min = 0.1, max = 50.0))]
    pub default_rate_kw: f64,
    #[validate(range(min = 1, max = 48))]
    pub max_boost_windows: Option<usize>,
    #[validate(range(min = 30, max = 1440))]
    pub max_window_minutes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RetryConfig {
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PricesConfig {
    pub provider: PriceSource,
    pub region: PriceRegion,
    #[validate(url)]
    pub base_url: String,
    pub product_code: String,
    #[validate(range(min = 1))]
    pub http_timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
}

impl Default for PricesConfig {
    fn default() -> Self {
        Self {
            provider: PriceSource::Agile,
            region: PriceRegion::F,
            base_url: DEFAULT_BASE_URL.to_string(),
            product_code: DEFAULT_PRODUCT_CODE.to_string(),
            http_timeout_seconds: 10,
            cache_ttl_seconds: 900,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub mode: HardwareMode,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_seconds: 30,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STATE_PATH),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DeviceConfig {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(range(min = 0.0, max = 100.0))]
    pub charge_below: Option<f64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub stop_at: Option<f64>,
    #[validate(range(min = 0.1))]
    pub capacity_kwh: f64,
    /// Lower values claim site surplus first
    #[serde(default)]
    pub priority: u32,
    /// Draw in FAST mode, defaults to `controller.default_rate_kw`
    #[validate(range(min = 0.1, max = 50.0))]
    pub fast_draw_kw: Option<f64>,
    #[validate(nested)]
    pub boost: Option<StandingBoostConfig>,
}

/// Daily boost, given either as energy or as a target SOC
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StandingBoostConfig {
    #[validate(range(min = 0.0))]
    pub energy_kwh: Option<f64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub target_soc: Option<f64>,
    #[validate(range(min = 0.1, max = 50.0))]
    pub rate_kw: Option<f64>,
    #[validate(range(max = 23))]
    pub finish_by_hour: u32,
    #[serde(default = "default_true")]
    pub clear_existing: bool,
}

fn default_true() -> bool {
    true
}

impl DeviceConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            charge_below: self.charge_below,
            stop_at: self.stop_at,
            capacity_kwh: self.capacity_kwh,
        }
    }

    fn standing_boost(&self) -> Result<Option<StandingBoost>, ConfigError> {
        let Some(boost) = &self.boost else {
            return Ok(None);
        };
        let target = match (boost.energy_kwh, boost.target_soc) {
            (Some(kwh), None) => BoostTarget::EnergyKwh(kwh),
            (None, Some(soc)) => BoostTarget::TargetSoc(soc),
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "device {}: boost needs exactly one of energy_kwh or target_soc",
                    self.id
                )))
            }
        };
        Ok(Some(StandingBoost {
            target,
            rate_kw: boost.rate_kw,
            finish_by_hour: boost.finish_by_hour,
            clear_existing: boost.clear_existing,
        }))
    }

    pub fn managed(&self) -> Result<ManagedDevice, ConfigError> {
        Ok(ManagedDevice {
            id: DeviceId::new(self.id.clone()),
            thresholds: self.thresholds(),
            standing_boost: self.standing_boost()?,
            priority: self.priority,
            fast_draw_kw: self.fast_draw_kw,
        })
    }
}

impl Config {
    /// TOML file merged with `DIVERTER__` environment variables, then validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
            .with_context(|| format!("invalid configuration ({})", path.display()))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Field ranges plus the cross-field rules the decision logic relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        <Self as Validate>::validate(self)?;

        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.id.clone()));
            }
            device.thresholds().validate(&device.id)?;
            device.standing_boost()?;
        }

        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must not be below retry.initial_delay_ms".to_string(),
            ));
        }
        if self.hardware.mode == HardwareMode::Gateway && self.hardware.gateway_url.is_none() {
            return Err(ConfigError::Invalid(
                "hardware.gateway_url is required in gateway mode".to_string(),
            ));
        }
        if self.server.enabled && self.auth.token.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Invalid(
                "auth.token is required when the HTTP server is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn managed_devices(&self) -> Result<Vec<ManagedDevice>, ConfigError> {
        self.devices.iter().map(DeviceConfig::managed).collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: StdDuration::from_millis(self.retry.initial_delay_ms),
            max_delay: StdDuration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        let c = &self.controller;
        LoopSettings {
            region: self.prices.region,
            poll_interval: StdDuration::from_secs(c.poll_interval_seconds),
            boost_interval: StdDuration::from_secs(c.boost_interval_seconds),
            tick_timeout: StdDuration::from_secs(c.tick_timeout_seconds),
            call_timeout: StdDuration::from_secs(c.call_timeout_seconds),
            failure_limit: c.failure_limit,
            retry: self.retry_policy(),
        }
    }

    pub fn scheduler_constraints(&self) -> SchedulerConstraints {
        SchedulerConstraints {
            default_rate_kw: self.controller.default_rate_kw,
            max_windows: self.controller.max_boost_windows,
            max_window: self.controller.max_window_minutes.map(Duration::minutes),
            epsilon_kwh: DEFAULT_EPSILON_KWH,
        }
    }

    pub fn engine(&self) -> ModeDecisionEngine {
        ModeDecisionEngine::new(self.controller.export_threshold_w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [controller]
        poll_interval_seconds = 60
        boost_interval_seconds = 1800
        tick_timeout_seconds = 30
        call_timeout_seconds = 10
        failure_limit = 3
        export_threshold_w = 500.0
        default_rate_kw = 7.2
        max_boost_windows = 4
        max_window_minutes = 480

        [prices]
        provider = "simulated"
        region = "C"
        base_url = "https://api.octopus.energy"
        product_code = "AGILE-18-02-21"
        http_timeout_seconds = 10
        cache_ttl_seconds = 900
    "#;

    fn parse(devices: &str) -> Result<Config> {
        Config::from_figment(Figment::from(Toml::string(&format!("{BASE}\n{devices}"))))
    }

    #[test]
    fn test_valid_config() {
        let cfg = parse(
            r#"
            [[devices]]
            id = "zappi-1"
            charge_below = 20.0
            stop_at = 80.0
            capacity_kwh = 40.0

            [devices.boost]
            target_soc = 80.0
            finish_by_hour = 7
            "#,
        )
        .unwrap();

        assert_eq!(cfg.prices.region, PriceRegion::C);
        assert_eq!(cfg.prices.provider, PriceSource::Simulated);
        assert_eq!(cfg.hardware.mode, HardwareMode::Simulated);
        let devices = cfg.managed_devices().unwrap();
        let boost = devices[0].standing_boost.unwrap();
        assert_eq!(boost.target, BoostTarget::TargetSoc(80.0));
        assert!(boost.clear_existing);
        assert_eq!(cfg.scheduler_constraints().max_window, Some(Duration::hours(8)));
        assert_eq!(cfg.loop_settings().failure_limit, 3);
    }

    #[test]
    fn test_threshold_order_rejected_at_load() {
        let err = parse(
            r#"
            [[devices]]
            id = "zappi-1"
            charge_below = 90.0
            stop_at = 80.0
            capacity_kwh = 40.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("charge_below"));
    }

    #[test]
    fn test_duplicate_and_missing_devices_rejected() {
        assert!(parse("").is_err());
        let err = parse(
            r#"
            [[devices]]
            id = "zappi-1"
            capacity_kwh = 40.0
            [[devices]]
            id = "zappi-1"
            capacity_kwh = 40.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_device_priority_and_fast_draw() {
        let cfg = parse(
            r#"
            [[devices]]
            id = "zappi-1"
            capacity_kwh = 40.0
            [[devices]]
            id = "eddi-1"
            capacity_kwh = 10.0
            priority = 2
            fast_draw_kw = 3.0
            "#,
        )
        .unwrap();
        let devices = cfg.managed_devices().unwrap();
        assert_eq!((devices[0].priority, devices[0].fast_draw_kw), (0, None));
        assert_eq!((devices[1].priority, devices[1].fast_draw_kw), (2, Some(3.0)));

        assert!(parse(
            r#"
            [[devices]]
            id = "eddi-1"
            capacity_kwh = 10.0
            fast_draw_kw = 0.0
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_out_of_range_soc_rejected() {
        assert!(parse(
            r#"
            [[devices]]
            id = "zappi-1"
            stop_at = 180.0
            capacity_kwh = 40.0
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_boost_needs_one_target() {
        assert!(parse(
            r#"
            [[devices]]
            id = "zappi-1"
            capacity_kwh = 40.0
            [devices.boost]
            energy_kwh = 10.0
            target_soc = 80.0
            finish_by_hour = 7
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_enabled_server_needs_token() {
        assert!(parse(
            r#"
            [server]
            enabled = true
            host = "0.0.0.0"
            port = 8080

            [[devices]]
            id = "zappi-1"
            capacity_kwh = 40.0
            "#,
        )
        .is_err());
    }

    #[test]
    fn test_shipped_default_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");
        let cfg = Config::from_figment(Figment::from(Toml::file(path))).unwrap();
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.prices.provider, PriceSource::Agile);
        assert!(!cfg.server.enabled);
        assert_eq!(cfg.loop_settings().failure_limit, 3);
    }
}
