//! Shared fixtures for the lifecycle integration tests.

#![allow(dead_code)]

use skillet::{
    CoreBuilder, CoreConfig, GenerationFactory, ReaderFactory, Reopen, Result, SearcherCore,
    SearcherListener, SearcherRef, SkilletError, SnapshotReader,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Counts listener invocations and remembers the generations it saw.
#[derive(Default)]
pub struct CountingListener {
    pub first_calls: AtomicUsize,
    pub new_calls: AtomicUsize,
    pub seen: Mutex<Vec<(u64, u64)>>,
}

impl SearcherListener for CountingListener {
    fn on_first_searcher(&self, _new: &SearcherRef) {
        self.first_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn on_new_searcher(&self, new: &SearcherRef, previous: &SearcherRef) {
        self.new_calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((new.get().generation(), previous.get().generation()));
    }
}

/// Panics on every callback; registration must survive it.
pub struct PanickingListener;

impl SearcherListener for PanickingListener {
    fn on_first_searcher(&self, _new: &SearcherRef) {
        panic!("first-searcher listener blew up");
    }

    fn on_new_searcher(&self, _new: &SearcherRef, _previous: &SearcherRef) {
        panic!("new-searcher listener blew up");
    }
}

/// Factory whose opens block until the test releases the gate. Lets a test
/// park an open mid-flight and close the core underneath it. Only usable on
/// a multi-thread runtime.
pub struct GatedFactory {
    inner: GenerationFactory,
    open_gate: Mutex<bool>,
    released: Condvar,
    entered: AtomicUsize,
}

impl GatedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(GatedFactory {
            inner: GenerationFactory::new(),
            open_gate: Mutex::new(false),
            released: Condvar::new(),
            entered: AtomicUsize::new(0),
        })
    }

    pub fn inner(&self) -> &GenerationFactory {
        &self.inner
    }

    /// How many opens have started (whether or not still parked).
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        *self.open_gate.lock().unwrap() = true;
        self.released.notify_all();
    }

    fn park(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open_gate.lock().unwrap();
        while !*open {
            open = self.released.wait(open).unwrap();
        }
    }
}

impl ReaderFactory for GatedFactory {
    fn open_fresh(&self, from_writer: bool) -> Result<Arc<dyn SnapshotReader>> {
        self.park();
        self.inner.open_fresh(from_writer)
    }

    fn reopen(&self, current: &Arc<dyn SnapshotReader>, from_writer: bool) -> Result<Reopen> {
        self.park();
        self.inner.reopen(current, from_writer)
    }
}

/// Fails the first `failures` opens, then behaves like [`GenerationFactory`].
pub struct FailingFactory {
    inner: GenerationFactory,
    failures_left: AtomicUsize,
}

impl FailingFactory {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(FailingFactory {
            inner: GenerationFactory::new(),
            failures_left: AtomicUsize::new(failures),
        })
    }

    pub fn inner(&self) -> &GenerationFactory {
        &self.inner
    }

    fn maybe_fail(&self) -> Result<()> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(SkilletError::OpenFailed("injected failure".into()));
        }
        Ok(())
    }
}

impl ReaderFactory for FailingFactory {
    fn open_fresh(&self, from_writer: bool) -> Result<Arc<dyn SnapshotReader>> {
        self.maybe_fail()?;
        self.inner.open_fresh(from_writer)
    }

    fn reopen(&self, current: &Arc<dyn SnapshotReader>, from_writer: bool) -> Result<Reopen> {
        self.maybe_fail()?;
        self.inner.reopen(current, from_writer)
    }
}

pub fn build_core(factory: Arc<dyn ReaderFactory>) -> Arc<SearcherCore> {
    CoreBuilder::new("test-core", factory).build()
}

pub fn build_core_with(factory: Arc<dyn ReaderFactory>, config: CoreConfig) -> Arc<SearcherCore> {
    CoreBuilder::new("test-core", factory).config(config).build()
}

/// Poll until `predicate` holds or ~2 s elapse. The event task runs
/// asynchronously, so tests observe registration by polling.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..400 {
        if predicate() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}
