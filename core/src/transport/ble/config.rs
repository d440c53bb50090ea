/// Link configuration shared by the peripheral and central roles

use crate::transport::abstraction::LinkError;
use crate::transport::ble::framing::STATUS_SIZE;
use crate::transport::ble::gatt::{DEFAULT_MTU, GATT_SERVICE_UUID};
use crate::transport::ble::queue::DEFAULT_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Default service registration retry budget
pub const DEFAULT_REGISTRATION_RETRIES: u32 = 3;

/// Default reassembly timeout in milliseconds
pub const DEFAULT_REASSEMBLY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Local name put in advertisements
    pub device_name: String,
    /// Primary service UUID
    pub service_uuid: Uuid,
    /// Characteristic operation limit in bytes (status byte included)
    pub mtu: usize,
    /// Maximum queued outbound chunks per connection
    pub queue_capacity: usize,
    /// Idle time after which a partial message is discarded
    pub reassembly_timeout_ms: u64,
    /// Restarts attempted after a service registration failure
    pub registration_retries: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: "blelink".to_string(),
            service_uuid: GATT_SERVICE_UUID,
            mtu: DEFAULT_MTU,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reassembly_timeout_ms: DEFAULT_REASSEMBLY_TIMEOUT_MS,
            registration_retries: DEFAULT_REGISTRATION_RETRIES,
        }
    }
}

impl LinkConfig {
    /// Set the advertised device name
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the MTU size
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the queue capacity in chunks
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the reassembly timeout
    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the registration retry budget
    pub fn with_registration_retries(mut self, retries: u32) -> Self {
        self.registration_retries = retries;
        self
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    /// Payload bytes per chunk
    pub fn max_chunk_size(&self) -> usize {
        self.mtu.saturating_sub(STATUS_SIZE)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.mtu <= STATUS_SIZE {
            return Err(LinkError::InvalidConfig(format!(
                "mtu {} leaves no room for payload",
                self.mtu
            )));
        }
        if self.queue_capacity == 0 {
            return Err(LinkError::InvalidConfig(
                "queue capacity must be greater than zero".to_string(),
            ));
        }
        if self.reassembly_timeout_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "reassembly timeout must be greater than zero".to_string(),
            ));
        }
        if self.device_name.is_empty() {
            return Err(LinkError::InvalidConfig(
                "device name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.mtu, 20);
        assert_eq!(config.max_chunk_size(), 19);
        assert_eq!(config.queue_capacity, 1_000_000);
        assert_eq!(config.reassembly_timeout(), Duration::from_secs(5));
        assert_eq!(config.registration_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = LinkConfig::default()
            .with_device_name("lock")
            .with_mtu(185)
            .with_queue_capacity(16)
            .with_reassembly_timeout(Duration::from_millis(250))
            .with_registration_retries(1);

        assert_eq!(config.device_name, "lock");
        assert_eq!(config.max_chunk_size(), 184);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.reassembly_timeout_ms, 250);
        assert_eq!(config.registration_retries, 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(LinkConfig::default().with_mtu(1).validate().is_err());
        assert!(LinkConfig::default().with_queue_capacity(0).validate().is_err());
        assert!(LinkConfig::default()
            .with_reassembly_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(LinkConfig::default().with_device_name("").validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: LinkConfig = serde_json::from_str(r#"{"mtu": 64}"#).unwrap();
        assert_eq!(config.mtu, 64);
        assert_eq!(config.registration_retries, 3);
    }
}
