// ── Runtime connection configuration ──
//
// These types describe *how* to reach the backing store. They never touch
// disk: `mongate-config` (or the caller) builds them and hands them in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options forwarded to the driver when a connection is first opened.
///
/// Only the first `Client::connect` for a given URI uses its options;
/// later calls return the existing `Database` untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// How long the driver may spend establishing the initial connection.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Application name reported to the server, if any.
    pub app_name: Option<String>,
    /// Upper bound on pooled connections (driver default when `None`).
    pub max_pool_size: Option<u32>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            app_name: None,
            max_pool_size: None,
        }
    }
}

/// Options used when a collection binds to its native handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Ask the driver to cast string `_id`s to native ids.
    #[serde(default)]
    pub cast_ids: bool,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
