//! # Skillet
//!
//! A searcher lifecycle core for embedded search engines: generational
//! reference counting, background cache warming, and atomic registration of
//! immutable index snapshots.
//!
//! Skillet sits between a storage layer that produces point-in-time readers
//! and the request handlers that query them. It guarantees that every query
//! runs against one consistent snapshot for its whole lifetime, that a new
//! snapshot is only served once its caches are warm, and that retired
//! snapshots are physically closed exactly once, after the last in-flight
//! query lets go.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use skillet::{CoreBuilder, GenerationFactory, ReaderFactory};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> skillet::Result<()> {
//! let factory = Arc::new(GenerationFactory::new());
//! let core = CoreBuilder::new("products", Arc::clone(&factory) as Arc<dyn ReaderFactory>).build();
//!
//! // Queries hold one refcount on a registered searcher for their lifetime
//! let searcher = core.get_searcher(false, true, false).await?.unwrap();
//! println!("serving generation {}", searcher.get().generation());
//! searcher.decref();
//!
//! // After a commit, open/warm/register a new searcher and wait for it
//! factory.bump();
//! core.reopen_searcher().await?;
//!
//! core.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! The storage boundary is the [`ReaderFactory`] trait; bring your own
//! implementation, or use [`GenerationFactory`] (in-memory) and
//! [`DirectoryFactory`] (marker-file backed) for embedding and tests.

pub mod config;
pub mod error;
pub mod searcher;
pub mod types;

pub use config::CoreConfig;
pub use error::{Result, SkilletError};
pub use searcher::cache::{CacheRegenerator, CacheSpec, QueryCache};
pub use searcher::events::SearcherListener;
pub use searcher::lifecycle::{CoreBuilder, SearcherCore};
pub use searcher::metrics::{MetricsSnapshot, SearcherMetrics};
pub use searcher::reader::{
    DirectoryFactory, GenerationFactory, ReaderFactory, Reopen, SnapshotReader,
};
pub use searcher::refcount::{Close, RefCounted};
pub use searcher::{Searcher, SearcherGuard, SearcherRef};
pub use types::{CacheStats, SearcherKind, SearcherStats};

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Call once at startup if the embedding application does not configure its
/// own subscriber; a second call is a no-op.
pub fn init_from_env() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
