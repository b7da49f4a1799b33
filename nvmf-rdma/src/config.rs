//! Queue pair and pool configuration

use crate::error::{NvmfError, Result};
use crate::pool::ByteOrder;
use crate::wire::private_data::QueueId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue pair parameters, fixed at connect time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePairConfig {
    /// Logical queue id; 0 is the admin queue
    pub queue_id: u16,
    /// Submission queue depth `N`; also the number of command identifiers
    pub submission_queue_size: u16,
    /// Extra SGL descriptors a command capsule can carry
    pub additional_sgls: u32,
    pub in_capsule_data_offset: u32,
    pub in_capsule_data_size: u32,
    /// Largest send posted inline
    pub max_inline_size: u32,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for QueuePairConfig {
    fn default() -> Self {
        Self {
            queue_id: QueueId::ADMIN.0,
            submission_queue_size: 32,
            additional_sgls: 0,
            in_capsule_data_offset: 0,
            in_capsule_data_size: 0,
            max_inline_size: 0,
            connect_timeout: Duration::from_millis(2000),
        }
    }
}

impl QueuePairConfig {
    pub fn validate(&self) -> Result<()> {
        if self.submission_queue_size < 2 {
            return Err(NvmfError::invalid_argument(format!(
                "submission queue size {} below minimum of 2",
                self.submission_queue_size
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(NvmfError::invalid_argument("connect timeout must be non-zero"));
        }
        // surfaces the overflow check
        crate::wire::sqe::command_capsule_size(
            self.additional_sgls,
            self.in_capsule_data_offset,
            self.in_capsule_data_size,
        )?;
        Ok(())
    }

    pub fn queue_id(&self) -> QueueId {
        QueueId(self.queue_id)
    }
}

/// Memory pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub elements_per_region: usize,
    /// Hard cap on registered regions
    pub regions: usize,
    pub byte_order: ByteOrder,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            elements_per_region: 128,
            regions: 128,
            byte_order: ByteOrder::LittleEndian,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.elements_per_region < 1 {
            return Err(NvmfError::invalid_argument("elements per region must be at least 1"));
        }
        if self.regions < 1 {
            return Err(NvmfError::invalid_argument("region count must be at least 1"));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_pair_config_default() {
        let config = QueuePairConfig::default();
        assert_eq!(config.queue_id, 0);
        assert_eq!(config.submission_queue_size, 32);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_pair_config_rejects_small_queue() {
        let config = QueuePairConfig {
            submission_queue_size: 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NvmfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_queue_pair_config_capsule_overflow() {
        let config = QueuePairConfig {
            in_capsule_data_offset: u32::MAX,
            in_capsule_data_size: u32::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_pair_config_json() {
        let config: QueuePairConfig = serde_json::from_str(
            r#"{"queue_id": 1, "submission_queue_size": 128, "connect_timeout": 500}"#,
        )
        .unwrap();
        assert_eq!(config.queue_id(), QueueId(1));
        assert_eq!(config.submission_queue_size, 128);
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.additional_sgls, 0);
    }

    #[test]
    fn test_pool_config() {
        let config = PoolConfig::default();
        assert_eq!(config.elements_per_region, 128);
        assert_eq!(config.regions, 128);
        assert!(config.validate().is_ok());

        let config: PoolConfig =
            serde_json::from_str(r#"{"regions": 2, "byte_order": "big_endian"}"#).unwrap();
        assert_eq!(config.byte_order, ByteOrder::BigEndian);
        assert_eq!(config.elements_per_region, 128);

        let bad = PoolConfig {
            regions: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
