use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{BoostWindow, DeviceId, Mode};
use crate::error::{ConfigError, ProviderError};

/// Snapshot of one diversion device, read once per poll cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub current_mode: Mode,
    /// Site surplus in watts; positive means power is being exported
    pub surplus_w: f64,
    /// EV state of charge, absent when no vehicle is connected
    pub soc_percent: Option<f64>,
}

/// Battery protection thresholds for one device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Below this SOC the device is held in ECO
    pub charge_below: Option<f64>,
    /// At or above this SOC the device is stopped
    pub stop_at: Option<f64>,
    /// Energy needed to go from 0% to 100% SOC
    pub capacity_kwh: f64,
}

impl Thresholds {
    pub fn disabled(capacity_kwh: f64) -> Self {
        Self {
            charge_below: None,
            stop_at: None,
            capacity_kwh,
        }
    }

    /// Reject threshold pairs that would make the decision rules contradict each other
    pub fn validate(&self, device: &str) -> Result<(), ConfigError> {
        if let (Some(charge_below), Some(stop_at)) = (self.charge_below, self.stop_at) {
            if charge_below >= stop_at {
                return Err(ConfigError::ThresholdOrder {
                    device: device.to_string(),
                    charge_below,
                    stop_at,
                });
            }
        }
        if !(self.capacity_kwh.is_finite() && self.capacity_kwh > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "device {device}: capacity_kwh must be positive"
            )));
        }
        Ok(())
    }

    /// Energy needed to move from `from_soc` to `to_soc`, zero if already there
    pub fn energy_for_soc(&self, from_soc: f64, to_soc: f64) -> f64 {
        (self.capacity_kwh * (to_soc - from_soc) / 100.0).max(0.0)
    }
}

/// Supplies the current power-flow snapshot for every known device
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceStateProvider: Send + Sync {
    async fn fetch(&self) -> Result<Vec<DeviceState>, ProviderError>;
}

/// Accepts mode changes and boost timers. Re-sending the same command must be harmless.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceCommandSink: Send + Sync {
    async fn set_mode(&self, device: &DeviceId, mode: Mode) -> Result<(), ProviderError>;
    /// Adds to the windows already on the device
    async fn install_windows(
        &self,
        device: &DeviceId,
        windows: &[BoostWindow],
    ) -> Result<(), ProviderError>;
    async fn clear_windows(&self, device: &DeviceId) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_order_rejected() {
        let t = Thresholds {
            charge_below: Some(80.0),
            stop_at: Some(80.0),
            capacity_kwh: 40.0,
        };
        assert!(matches!(
            t.validate("zappi"),
            Err(ConfigError::ThresholdOrder { .. })
        ));

        let t = Thresholds {
            charge_below: Some(20.0),
            stop_at: Some(80.0),
            capacity_kwh: 40.0,
        };
        assert!(t.validate("zappi").is_ok());
        assert!(Thresholds::disabled(40.0).validate("zappi").is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(Thresholds::disabled(0.0).validate("zappi").is_err());
    }

    #[test]
    fn test_energy_for_soc() {
        let t = Thresholds::disabled(26.0);
        assert!((t.energy_for_soc(50.0, 80.0) - 7.8).abs() < 1e-9);
        assert_eq!(t.energy_for_soc(90.0, 80.0), 0.0);
    }
}
