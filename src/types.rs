use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which queue a searcher belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearcherKind {
    /// Full-service searcher: warmed caches, registered for ordinary queries.
    Main,
    /// Low-latency get-by-id searcher; never registered, possibly uncached.
    Realtime,
}

impl SearcherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearcherKind::Main => "main",
            SearcherKind::Realtime => "realtime",
        }
    }
}

impl std::fmt::Display for SearcherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time description of a searcher, for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct SearcherStats {
    pub name: String,
    pub kind: SearcherKind,
    pub generation: u64,
    pub open_time: DateTime<Utc>,
    pub registered_time: Option<DateTime<Utc>>,
    pub caches: Vec<CacheStats>,
}

/// Counters for a single searcher cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub warmed_entries: u64,
}
