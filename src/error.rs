use std::time::Duration;
use thiserror::Error;

use crate::domain::DeviceId;

/// Errors raised by the external collaborators (device state, prices, command sink)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Credentials rejected: {0}")]
    Auth(String),
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Command rejected by {device}: {reason}")]
    CommandRejected { device: DeviceId, reason: String },
}

impl ProviderError {
    /// Network failures and timeouts are worth another attempt, nothing else is
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth(_))
    }

    /// Classify a reqwest transport error
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Transient(err.to_string())
        }
    }

    /// Classify a non-success HTTP status. `device` is set for command endpoints.
    pub fn from_status(status: reqwest::StatusCode, body: &str, device: Option<&DeviceId>) -> Self {
        use reqwest::StatusCode;
        match (status, device) {
            (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
                ProviderError::Auth(format!("HTTP {status}"))
            }
            (StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY, Some(device)) => {
                ProviderError::CommandRejected {
                    device: device.clone(),
                    reason: format!("HTTP {status}: {body}"),
                }
            }
            (s, _) if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                ProviderError::Transient(format!("HTTP {status}: {body}"))
            }
            _ => ProviderError::Malformed(format!("unexpected HTTP {status}: {body}")),
        }
    }
}

/// Configuration rejected at load time
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Device {device}: charge_below ({charge_below}%) must be below stop_at ({stop_at}%)")]
    ThresholdOrder {
        device: String,
        charge_below: f64,
        stop_at: f64,
    },
    #[error("Duplicate device id: {0}")]
    DuplicateDevice(String),
    #[error("No devices configured")]
    NoDevices,
    #[error("Invalid value: {0}")]
    Invalid(String),
    #[error("Validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// A boost order that cannot be turned into a request
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrderError {
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),
    #[error("Give either an energy amount or a target SOC, not both")]
    AmbiguousTarget,
    #[error("Give an energy amount or a target SOC")]
    MissingTarget,
    #[error("No vehicle SOC known for this device")]
    NoVehicleSoc,
    #[error("Invalid hour: {0}")]
    InvalidHour(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Transient("reset".into()).is_retryable());
        assert!(ProviderError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!ProviderError::Auth("bad key".into()).is_retryable());
        assert!(!ProviderError::Malformed("missing field".into()).is_retryable());
    }

    #[test]
    fn test_status_classification() {
        let device = DeviceId::new("zappi-1");
        assert!(ProviderError::from_status(StatusCode::UNAUTHORIZED, "", None).is_auth());
        assert!(ProviderError::from_status(StatusCode::BAD_GATEWAY, "", None).is_retryable());
        assert!(matches!(
            ProviderError::from_status(StatusCode::CONFLICT, "busy", Some(&device)),
            ProviderError::CommandRejected { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::NOT_FOUND, "", None),
            ProviderError::Malformed(_)
        ));
    }
}
