// ── Cache tuning ──
//
// Runtime knobs for the store and its queries. Built by the embedder (or
// by `ontowatch-config`) and handed to `ObservableClient::new`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long an unreferenced cache key survives before eviction.
    #[serde(with = "duration_millis")]
    pub keep_alive: Duration,
    /// How often the garbage collector sweeps expired keys.
    #[serde(with = "duration_millis")]
    pub gc_interval: Duration,
    /// A `Normal` observe skips the network if the entry was fetched this recently.
    #[serde(with = "duration_millis")]
    pub dedupe_interval: Duration,
    /// Page size used when a list doesn't ask for one.
    pub default_page_size: Option<u32>,
    /// Number of recent commits kept for diagnostics.
    pub history_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            gc_interval: Duration::from_secs(1),
            dedupe_interval: Duration::from_secs(2),
            default_page_size: None,
            history_capacity: 64,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
