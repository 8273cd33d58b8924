use crate::error::{Result, SkilletError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Configuration for a searcher core.
///
/// Every field has a default; `from_env()` reads `SKILLET_*` environment
/// variables, and `load`/`save` persist the config as JSON next to the core's
/// data the same way index settings are stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Bound on concurrently open-but-unregistered searchers. Opens past
    /// this bound block until a registration completes.
    pub max_warming_searchers: usize,

    /// Register the very first searcher of a core before its first-searcher
    /// listeners have run, so the core serves (cold) traffic immediately.
    pub use_cold_searcher: bool,

    /// When false, searchers built from an unchanged reader always get a
    /// fresh (empty) cache state instead of reusing the current one.
    pub caching_enabled: bool,

    /// Capacity of each searcher cache.
    pub cache_capacity: usize,

    /// How many most-recently-used entries to replay from the previous
    /// searcher's caches during warm-up.
    pub autowarm_count: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            max_warming_searchers: 2,
            use_cold_searcher: false,
            caching_enabled: true,
            cache_capacity: 512,
            autowarm_count: 16,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let defaults = CoreConfig::default();
        CoreConfig {
            max_warming_searchers: env::var("SKILLET_MAX_WARMING_SEARCHERS")
                .ok()
                .and_then(|s| s.parse().ok())
                // zero blocks every open forever; treat it like a bad value
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_warming_searchers),
            use_cold_searcher: env::var("SKILLET_USE_COLD_SEARCHER")
                .ok()
                .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.use_cold_searcher),
            caching_enabled: env::var("SKILLET_CACHING_ENABLED")
                .ok()
                .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.caching_enabled),
            cache_capacity: env::var("SKILLET_CACHE_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cache_capacity),
            autowarm_count: env::var("SKILLET_AUTOWARM_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.autowarm_count),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoreConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_warming_searchers == 0 {
            return Err(SkilletError::Config(
                "max_warming_searchers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
