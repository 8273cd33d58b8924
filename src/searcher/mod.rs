pub mod cache;
pub mod events;
pub mod lifecycle;
pub mod metrics;
pub mod reader;
pub mod refcount;

use crate::error::Result;
use crate::types::{SearcherKind, SearcherStats};
use cache::{CacheSpec, QueryCache};
use chrono::{DateTime, Utc};
use reader::SnapshotReader;
use refcount::{Close, RefCounted};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Shared handle to a reference-counted searcher.
pub type SearcherRef = Arc<RefCounted<Searcher>>;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// One immutable, consistent view of the index: a snapshot reader plus the
/// caches built over it.
///
/// A searcher has no state machine of its own — open/warm/register/retire
/// transitions live in [`lifecycle::SearcherCore`]. Once constructed, its
/// reader never changes; queries that hold a [`SearcherRef`] keep the same
/// consistent view until they release it.
pub struct Searcher {
    name: String,
    id: Uuid,
    kind: SearcherKind,
    /// Strictly increasing per-process open order, used to compare "newer".
    serial: u64,
    reader: Arc<dyn SnapshotReader>,
    /// False when this searcher shares a reader owned by an earlier one
    /// (fresh-cache wrapper over an unchanged snapshot).
    close_reader: bool,
    /// Hold on the searcher that owns `reader`, when sharing it. Released on
    /// close, so the owner cannot close the reader out from under us.
    reader_owner: Option<SearcherRef>,
    caches: Vec<Arc<QueryCache>>,
    open_time: DateTime<Utc>,
    registered_time: OnceLock<DateTime<Utc>>,
}

impl Searcher {
    pub(crate) fn new(
        core_name: &str,
        kind: SearcherKind,
        reader: Arc<dyn SnapshotReader>,
        close_reader: bool,
        reader_owner: Option<SearcherRef>,
        cache_specs: &[CacheSpec],
        caching_enabled: bool,
    ) -> Self {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::SeqCst);
        let caches = if caching_enabled {
            cache_specs
                .iter()
                .map(|spec| Arc::new(QueryCache::from_spec(spec)))
                .collect()
        } else {
            Vec::new()
        };
        Searcher {
            name: format!("{}[{}-gen{}]", core_name, kind, reader.generation()),
            id: Uuid::new_v4(),
            kind,
            serial,
            reader,
            close_reader,
            reader_owner,
            caches,
            open_time: Utc::now(),
            registered_time: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> SearcherKind {
        self.kind
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn generation(&self) -> u64 {
        self.reader.generation()
    }

    pub fn reader(&self) -> &Arc<dyn SnapshotReader> {
        &self.reader
    }

    pub fn open_time(&self) -> DateTime<Utc> {
        self.open_time
    }

    pub fn registered_time(&self) -> Option<DateTime<Utc>> {
        self.registered_time.get().copied()
    }

    pub fn cache(&self, name: &str) -> Option<&Arc<QueryCache>> {
        self.caches.iter().find(|c| c.name() == name)
    }

    pub fn caches(&self) -> &[Arc<QueryCache>] {
        &self.caches
    }

    /// Best-effort cache priming from the searcher being replaced.
    ///
    /// Each of this searcher's caches replays the hottest keys of the prior
    /// searcher's cache of the same name. Failures are logged and swallowed:
    /// a failed warm must never prevent registration — it only means cold
    /// caches.
    pub fn warm(&self, prior: &Searcher) {
        for cache in &self.caches {
            let Some(prior_cache) = prior.cache(cache.name()) else {
                continue;
            };
            match cache.warm_from(prior_cache, self.reader.as_ref()) {
                Ok(warmed) => {
                    tracing::debug!(searcher = %self.name, cache = %cache.name(), warmed, "autowarm complete");
                }
                Err(e) => {
                    tracing::warn!(searcher = %self.name, cache = %cache.name(), "autowarm failed: {}", e);
                }
            }
        }
    }

    /// Activate this searcher for serving: record the registration time and
    /// switch its caches live. Must not fail — registration-adjacent
    /// bookkeeping (waking waiters) happens regardless in the core.
    pub(crate) fn register(&self) {
        let _ = self.registered_time.set(Utc::now());
        for cache in &self.caches {
            cache.mark_live();
        }
        tracing::info!(searcher = %self.name, reader = %self.reader.describe(), "searcher registered");
    }

    pub fn stats(&self) -> SearcherStats {
        SearcherStats {
            name: self.name.clone(),
            kind: self.kind,
            generation: self.generation(),
            open_time: self.open_time,
            registered_time: self.registered_time(),
            caches: self.caches.iter().map(|c| c.stats()).collect(),
        }
    }
}

impl Close for Searcher {
    fn close(&self) -> Result<()> {
        tracing::debug!(searcher = %self.name, "closing searcher");
        for cache in &self.caches {
            cache.clear();
        }
        if self.close_reader {
            self.reader.close()?;
        }
        if let Some(owner) = &self.reader_owner {
            owner.decref();
        }
        Ok(())
    }
}

/// RAII hold on a searcher: increfs on construction is the caller's job,
/// decref happens on drop — including error and panic exit paths.
pub struct SearcherGuard {
    searcher: SearcherRef,
}

impl SearcherGuard {
    /// Take ownership of one refcount hold on `searcher`.
    pub fn new(searcher: SearcherRef) -> Self {
        SearcherGuard { searcher }
    }

    pub fn searcher_ref(&self) -> &SearcherRef {
        &self.searcher
    }
}

impl std::ops::Deref for SearcherGuard {
    type Target = Searcher;

    fn deref(&self) -> &Searcher {
        self.searcher.get()
    }
}

impl Drop for SearcherGuard {
    fn drop(&mut self) {
        self.searcher.decref();
    }
}
