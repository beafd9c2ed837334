/// `config.rs` — engine configuration
///
/// Every field has a default, so a host can pass `EngineConfig::default()` or
/// a partial JSON document.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scripting::{detached::DetachedConfig, sandbox::TrustLevel};

pub const DEFAULT_SCRIPT_NAMESPACE: &str = "lifecycle.script";
pub const DEFAULT_INDEX_EXTERNAL_ID: &str = "lifecycle.scripting.configuration";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix joined with `.` to a script id to form its external id.
    pub script_namespace: String,
    /// External id of the published script index.
    pub index_external_id: String,
    pub trust_level: TrustLevel,
    pub script_cache: CacheConfig,
    pub index_cache: CacheConfig,
    pub detached: DetachedConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            script_namespace: DEFAULT_SCRIPT_NAMESPACE.to_string(),
            index_external_id: DEFAULT_INDEX_EXTERNAL_ID.to_string(),
            trust_level: TrustLevel::default(),
            script_cache: CacheConfig {
                max_entries: 1000,
                ttl_ms: 5_000,
            },
            index_cache: CacheConfig {
                max_entries: 1,
                ttl_ms: 5_000,
            },
            detached: DetachedConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// External id under which the script `script_id` is published.
    pub fn script_external_id(&self, script_id: &str) -> String {
        format!("{}.{}", self.script_namespace, script_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Access TTL for the script cache, refresh interval for the index cache.
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_ms: 5_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_published_layout() {
        let config = EngineConfig::default();
        assert_eq!(config.script_external_id("set-partition"), "lifecycle.script.set-partition");
        assert_eq!(config.index_external_id, "lifecycle.scripting.configuration");
        assert_eq!(config.script_cache.max_entries, 1000);
        assert_eq!(config.index_cache.max_entries, 1);
        assert_eq!(config.index_cache.ttl(), Duration::from_secs(5));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(
            r#"{ "script_namespace": "com.example.script", "trust_level": "elevated",
                 "detached": { "workers": 4 } }"#,
        )
        .unwrap();
        assert_eq!(config.script_external_id("a"), "com.example.script.a");
        assert_eq!(config.trust_level, TrustLevel::Elevated);
        assert_eq!(config.detached.workers, 4);
        assert_eq!(config.detached.queue_capacity, 64);
        assert_eq!(config.index_external_id, DEFAULT_INDEX_EXTERNAL_ID);
    }

    #[test]
    fn rejects_unknown_trust_levels() {
        assert!(EngineConfig::from_json(r#"{ "trust_level": "root" }"#).is_err());
    }
}
