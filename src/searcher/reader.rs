//! The reader-factory boundary: how the core obtains immutable snapshots.
//!
//! The on-disk index format is an external collaborator. The core only needs
//! to open a snapshot, reopen-if-changed against a previous one, and close
//! it; everything else (segments, codecs, queries) lives behind
//! [`SnapshotReader`].

use crate::error::{Result, SkilletError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// An immutable, point-in-time view over index data.
///
/// A reader never mutates after open. `close` releases whatever OS resources
/// back the snapshot (file descriptors, mmaps); it is called at most once by
/// the owning searcher.
pub trait SnapshotReader: Send + Sync {
    /// Monotonically increasing commit generation this snapshot reflects.
    fn generation(&self) -> u64;

    fn close(&self) -> Result<()>;

    fn describe(&self) -> String {
        format!("reader@gen{}", self.generation())
    }
}

/// Outcome of a reopen attempt.
///
/// "Unchanged" is distinct from "new reader" so the lifecycle manager can
/// short-circuit warm-up when nothing changed underneath.
pub enum Reopen {
    Unchanged,
    Changed(Arc<dyn SnapshotReader>),
}

/// Opens and reopens snapshots. May block on I/O; only ever called from the
/// admission-controlled open path, never on the query hot path.
pub trait ReaderFactory: Send + Sync {
    /// Build a fresh snapshot. `from_writer` requests a view of the writer's
    /// uncommitted state where the storage layer supports it.
    fn open_fresh(&self, from_writer: bool) -> Result<Arc<dyn SnapshotReader>>;

    /// Reopen against `current`, sharing unchanged segments where possible.
    fn reopen(&self, current: &Arc<dyn SnapshotReader>, from_writer: bool) -> Result<Reopen>;
}

// ============================================================
// In-memory factory
// ============================================================

struct GenerationReader {
    generation: u64,
    closed: AtomicBool,
    open_readers: Arc<AtomicUsize>,
}

impl SnapshotReader for GenerationReader {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open_readers.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// In-memory [`ReaderFactory`] keyed by a commit generation counter.
///
/// `bump()` simulates a commit; `reopen` reports `Unchanged` while the
/// generation matches the current reader. Useful for embedding the core in
/// tests and for storage layers that track their own commit points.
#[derive(Default)]
pub struct GenerationFactory {
    generation: AtomicU64,
    open_readers: Arc<AtomicUsize>,
    opens: AtomicUsize,
}

impl GenerationFactory {
    pub fn new() -> Self {
        GenerationFactory::default()
    }

    /// Record a commit: the next reopen will produce a changed reader.
    pub fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Number of readers opened and not yet closed. Zero after a clean
    /// shutdown — anything else is a leaked snapshot.
    pub fn open_readers(&self) -> usize {
        self.open_readers.load(Ordering::SeqCst)
    }

    /// Total readers ever opened.
    pub fn total_opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn open_at(&self, generation: u64) -> Arc<dyn SnapshotReader> {
        self.open_readers.fetch_add(1, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Arc::new(GenerationReader {
            generation,
            closed: AtomicBool::new(false),
            open_readers: Arc::clone(&self.open_readers),
        })
    }
}

impl ReaderFactory for GenerationFactory {
    fn open_fresh(&self, _from_writer: bool) -> Result<Arc<dyn SnapshotReader>> {
        Ok(self.open_at(self.generation()))
    }

    fn reopen(&self, current: &Arc<dyn SnapshotReader>, _from_writer: bool) -> Result<Reopen> {
        let latest = self.generation();
        if current.generation() == latest {
            return Ok(Reopen::Unchanged);
        }
        Ok(Reopen::Changed(self.open_at(latest)))
    }
}

// ============================================================
// Directory-backed factory
// ============================================================

struct DirectoryReader {
    generation: u64,
    path: PathBuf,
    closed: AtomicBool,
}

impl SnapshotReader for DirectoryReader {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}@gen{}", self.path.display(), self.generation)
    }
}

/// [`ReaderFactory`] backed by a directory with a `generation` marker file.
///
/// `commit()` advances the marker, standing in for the storage layer's commit
/// path. Open failures (missing directory, unreadable marker) surface as
/// transient open errors to the caller of `get_searcher`.
pub struct DirectoryFactory {
    dir: PathBuf,
}

impl DirectoryFactory {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            return Err(SkilletError::OpenFailed(format!(
                "no such directory: {}",
                dir.display()
            )));
        }
        Ok(DirectoryFactory { dir })
    }

    fn marker(&self) -> PathBuf {
        self.dir.join("generation")
    }

    fn read_generation(&self) -> Result<u64> {
        let marker = self.marker();
        if !marker.exists() {
            return Ok(0);
        }
        std::fs::read_to_string(&marker)?
            .trim()
            .parse()
            .map_err(|e| SkilletError::OpenFailed(format!("bad generation marker: {}", e)))
    }

    /// Advance the commit generation on disk and return it.
    pub fn commit(&self) -> Result<u64> {
        let next = self.read_generation()? + 1;
        std::fs::write(self.marker(), next.to_string())?;
        Ok(next)
    }
}

impl ReaderFactory for DirectoryFactory {
    fn open_fresh(&self, _from_writer: bool) -> Result<Arc<dyn SnapshotReader>> {
        if !self.dir.exists() {
            return Err(SkilletError::OpenFailed(format!(
                "directory vanished: {}",
                self.dir.display()
            )));
        }
        Ok(Arc::new(DirectoryReader {
            generation: self.read_generation()?,
            path: self.dir.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn reopen(&self, current: &Arc<dyn SnapshotReader>, from_writer: bool) -> Result<Reopen> {
        let latest = self.read_generation()?;
        if current.generation() == latest {
            return Ok(Reopen::Unchanged);
        }
        self.open_fresh(from_writer).map(Reopen::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_factory_reopen_unchanged_until_bump() {
        let factory = GenerationFactory::new();
        let reader = factory.open_fresh(false).unwrap();
        assert!(matches!(
            factory.reopen(&reader, false).unwrap(),
            Reopen::Unchanged
        ));

        factory.bump();
        match factory.reopen(&reader, false).unwrap() {
            Reopen::Changed(new_reader) => assert_eq!(new_reader.generation(), 1),
            Reopen::Unchanged => panic!("expected a changed reader after bump"),
        }
    }

    #[test]
    fn generation_factory_tracks_open_readers() {
        let factory = GenerationFactory::new();
        let reader = factory.open_fresh(false).unwrap();
        assert_eq!(factory.open_readers(), 1);
        reader.close().unwrap();
        reader.close().unwrap(); // second close must not double-decrement
        assert_eq!(factory.open_readers(), 0);
    }

    #[test]
    fn directory_factory_commit_advances_generation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let factory = DirectoryFactory::open(tmp.path()).unwrap();

        let reader = factory.open_fresh(false).unwrap();
        assert_eq!(reader.generation(), 0);
        assert!(matches!(
            factory.reopen(&reader, false).unwrap(),
            Reopen::Unchanged
        ));

        factory.commit().unwrap();
        match factory.reopen(&reader, false).unwrap() {
            Reopen::Changed(new_reader) => assert_eq!(new_reader.generation(), 1),
            Reopen::Unchanged => panic!("expected a changed reader after commit"),
        }
    }

    #[test]
    fn directory_factory_missing_dir_is_an_open_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(matches!(
            DirectoryFactory::open(&missing),
            Err(SkilletError::OpenFailed(_))
        ));
    }
}
