//! Configuration layer.
//!
//! All durations are written as milliseconds in JSON.
//!
//! ```json
//! {
//!   "batch": { "max_concurrency": 8 },
//!   "latest": { "default_timeout_ms": 500 },
//!   "retry": {
//!     "max_retries": 5,
//!     "interval_ms": 200,
//!     "interval_multiplier": 2.0,
//!     "max_interval_ms": 2000
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::batch::BatchConfig;
use crate::error::ShuttleError;
use crate::latest::LatestConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuttleConfig {
    pub batch: BatchConfig,
    pub latest: LatestConfig,
    pub retry: RetryPolicy,
}

impl ShuttleConfig {
    /// Parse and validate a JSON document. Missing sections fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self, ShuttleError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ShuttleError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ShuttleError> {
        if self.batch.max_concurrency == 0 {
            return Err(ShuttleError::InvalidConfig(
                "batch.max_concurrency must be at least 1".to_string(),
            ));
        }
        self.retry.validate()
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn as_millis(value: &Duration) -> u64 {
        u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(as_millis(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&super::millis::as_millis(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
