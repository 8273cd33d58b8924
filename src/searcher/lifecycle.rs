//! The searcher registry and open/warm/register/retire state machine.
//!
//! Lock ordering is strict: `realtime_lock` may be held while acquiring
//! `open_lock`, and `open_lock` may be held while acquiring `state`; never
//! the reverse. `state` is a plain mutex guarding the hot path — it is never
//! held across an await point and no I/O happens under it. Refcounts are
//! only dropped to zero outside `state`, because the zero-hook re-enters it
//! to unlink the searcher from the tracking queues.

use crate::config::CoreConfig;
use crate::error::{Result, SkilletError};
use crate::searcher::cache::CacheSpec;
use crate::searcher::events::{EventExecutor, SearcherEvent, SearcherListener};
use crate::searcher::metrics::SearcherMetrics;
use crate::searcher::reader::{ReaderFactory, Reopen};
use crate::searcher::refcount::RefCounted;
use crate::searcher::{Searcher, SearcherGuard, SearcherRef};
use crate::types::{SearcherKind, SearcherStats};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;

struct CoreState {
    /// The searcher returned to ordinary callers. Always the newest fully
    /// warmed and registered one, never a still-warming one.
    registered: Option<SearcherRef>,
    /// Fastest-path snapshot; swapped on every open, registered or not.
    realtime: Option<SearcherRef>,
    /// Searchers currently being opened or warmed, bounded by
    /// `max_warming_searchers`.
    on_deck: usize,
    /// Recently opened searchers, most-recent-first. Tracking only — queue
    /// membership holds no refcount; entries unlink themselves at zero.
    normal_queue: VecDeque<SearcherRef>,
    realtime_queue: VecDeque<SearcherRef>,
}

enum Plan {
    Ready(Option<SearcherRef>),
    WaitRegistration,
    WaitAdmission,
    Open { overlap: usize },
}

/// Builder for a [`SearcherCore`].
///
/// `build()` spawns the core's event task and therefore must run inside a
/// tokio runtime.
pub struct CoreBuilder {
    name: String,
    config: CoreConfig,
    factory: Arc<dyn ReaderFactory>,
    cache_specs: Vec<CacheSpec>,
    listeners: Vec<Arc<dyn SearcherListener>>,
}

impl CoreBuilder {
    pub fn new(name: impl Into<String>, factory: Arc<dyn ReaderFactory>) -> Self {
        CoreBuilder {
            name: name.into(),
            config: CoreConfig::default(),
            factory,
            cache_specs: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, spec: CacheSpec) -> Self {
        self.cache_specs.push(spec);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SearcherListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Arc<SearcherCore> {
        let mut config = self.config;
        if config.max_warming_searchers == 0 {
            // zero would make admission block every caller forever
            tracing::warn!(
                core = %self.name,
                "max_warming_searchers of 0 is not usable, raising it to 1"
            );
            config.max_warming_searchers = 1;
        }
        let mut cache_specs = self.cache_specs;
        if cache_specs.is_empty() {
            cache_specs.push(CacheSpec::new(
                "results",
                config.cache_capacity,
                config.autowarm_count,
            ));
        }
        Arc::new_cyclic(|weak: &Weak<SearcherCore>| SearcherCore {
            name: self.name,
            config,
            factory: self.factory,
            cache_specs,
            listeners: self.listeners,
            metrics: Arc::new(SearcherMetrics::new()),
            state: Mutex::new(CoreState {
                registered: None,
                realtime: None,
                on_deck: 0,
                normal_queue: VecDeque::new(),
                realtime_queue: VecDeque::new(),
            }),
            wakeups: watch::channel(0u64).0,
            open_lock: tokio::sync::Mutex::new(()),
            realtime_lock: tokio::sync::Mutex::new(()),
            executor: EventExecutor::new(weak.clone()),
            self_weak: weak.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// The core server object for one logical index: owns the registered and
/// realtime searcher slots, the on-deck admission counter, and the tracking
/// queues, and drives every searcher through
/// open → warm → register → retire → close.
///
/// Create one with [`CoreBuilder`]; it is `Send + Sync` and designed to be
/// shared behind the `Arc` the builder returns.
pub struct SearcherCore {
    name: String,
    config: CoreConfig,
    factory: Arc<dyn ReaderFactory>,
    cache_specs: Vec<CacheSpec>,
    listeners: Vec<Arc<dyn SearcherListener>>,
    metrics: Arc<SearcherMetrics>,
    state: Mutex<CoreState>,
    /// Registration epoch; bumped on every registration, failure, and
    /// admission backoff so blocked callers re-check their predicate.
    wakeups: watch::Sender<u64>,
    /// Serializes the reopen decision (which may do I/O) away from the
    /// hot-path state mutex.
    open_lock: tokio::sync::Mutex<()>,
    /// Serializes realtime slow-path opens; distinct from `open_lock`.
    realtime_lock: tokio::sync::Mutex<()>,
    executor: EventExecutor,
    self_weak: Weak<SearcherCore>,
    closed: AtomicBool,
}

impl SearcherCore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SearcherMetrics {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of searchers currently opened but not yet registered.
    pub fn on_deck(&self) -> usize {
        self.state.lock().unwrap().on_deck
    }

    /// Generation of the currently registered searcher, if any.
    pub fn registered_generation(&self) -> Option<u64> {
        let st = self.state.lock().unwrap();
        st.registered.as_ref().map(|r| r.get().generation())
    }

    pub fn registered_stats(&self) -> Option<SearcherStats> {
        let st = self.state.lock().unwrap();
        st.registered.as_ref().map(|r| r.get().stats())
    }

    /// How many searchers the tracking queues currently hold (leak probe).
    pub fn tracked_searchers(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.normal_queue.len() + st.realtime_queue.len()
    }

    pub(crate) fn listeners(&self) -> &[Arc<dyn SearcherListener>] {
        &self.listeners
    }

    fn closed_error(&self) -> SkilletError {
        SkilletError::CoreClosed(self.name.clone())
    }

    fn wake_waiters(&self) {
        self.wakeups.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    // ============================================================
    // Primary entry points
    // ============================================================

    /// Get a reference-counted searcher.
    ///
    /// With `force_new = false` and a registered searcher present this is
    /// the lock-minimal hot path: incref and return. With none registered
    /// the caller blocks until a concurrent open registers one. With
    /// `force_new = true` a new snapshot is opened (subject to the
    /// `max_warming_searchers` admission bound), scheduled for warm-up and
    /// registration, and returned immediately — it becomes the registered
    /// searcher only once warmed.
    ///
    /// When `return_searcher` is false, no hold is taken and `Ok(None)` is
    /// returned. `update_handler_reopens` requests a writer-backed reopen
    /// from the factory.
    ///
    /// The caller owns one refcount hold on the returned searcher and must
    /// `decref()` it (or wrap it in a [`SearcherGuard`]).
    pub async fn get_searcher(
        &self,
        force_new: bool,
        return_searcher: bool,
        update_handler_reopens: bool,
    ) -> Result<Option<SearcherRef>> {
        self.get_searcher_with_deadline(force_new, return_searcher, update_handler_reopens, None)
            .await
    }

    /// [`SearcherCore::get_searcher`] with a bound on how long the caller is
    /// willing to block waiting for a registration or an admission slot.
    /// Expiry surfaces as [`SkilletError::WaitTimeout`]; on-deck bookkeeping
    /// is unaffected (a waiter owns no bookkeeping until admitted).
    pub async fn get_searcher_with_deadline(
        &self,
        force_new: bool,
        return_searcher: bool,
        update_handler_reopens: bool,
        wait_limit: Option<Duration>,
    ) -> Result<Option<SearcherRef>> {
        let start = Instant::now();
        let mut wakeups = self.wakeups.subscribe();
        let mut admission_warned = false;

        loop {
            if self.is_closed() {
                return Err(self.closed_error());
            }

            let plan = {
                let mut st = self.state.lock().unwrap();
                if !force_new {
                    if let Some(registered) = &st.registered {
                        if return_searcher {
                            registered.incref();
                            Plan::Ready(Some(Arc::clone(registered)))
                        } else {
                            Plan::Ready(None)
                        }
                    } else if st.on_deck > 0 {
                        // an open is already in flight; wait for it to land
                        Plan::WaitRegistration
                    } else {
                        Self::admit(&mut st, &self.config)
                    }
                } else {
                    Self::admit(&mut st, &self.config)
                }
            };

            match plan {
                Plan::Ready(result) => return Ok(result),
                Plan::Open { overlap } => {
                    if overlap > 1 {
                        tracing::warn!(
                            core = %self.name,
                            on_deck = overlap,
                            "performance warning: multiple searchers on deck; commits are outpacing registration"
                        );
                    }
                    return self
                        .open_and_schedule(return_searcher, update_handler_reopens)
                        .await;
                }
                Plan::WaitAdmission => {
                    if !admission_warned {
                        admission_warned = true;
                        self.metrics.record_max_warming_reached();
                        tracing::warn!(
                            core = %self.name,
                            max = self.config.max_warming_searchers,
                            "max warming searchers reached; blocking open"
                        );
                    }
                    self.await_wakeup(&mut wakeups, start, wait_limit).await?;
                }
                Plan::WaitRegistration => {
                    self.await_wakeup(&mut wakeups, start, wait_limit).await?;
                }
            }
        }
    }

    fn admit(st: &mut CoreState, config: &CoreConfig) -> Plan {
        if st.on_deck >= config.max_warming_searchers {
            Plan::WaitAdmission
        } else {
            st.on_deck += 1;
            Plan::Open { overlap: st.on_deck }
        }
    }

    /// One iteration of the loop-while-predicate wait. The epoch channel was
    /// subscribed before the first predicate check, so a registration that
    /// lands between the check and this await resolves immediately; spurious
    /// wakeups only cost a re-check.
    async fn await_wakeup(
        &self,
        wakeups: &mut watch::Receiver<u64>,
        start: Instant,
        wait_limit: Option<Duration>,
    ) -> Result<()> {
        match wait_limit {
            None => {
                let _ = wakeups.changed().await;
                Ok(())
            }
            Some(limit) => {
                let waited = start.elapsed();
                let remaining = limit.checked_sub(waited).ok_or(SkilletError::WaitTimeout {
                    waited_ms: waited.as_millis() as u64,
                })?;
                match tokio::time::timeout(remaining, wakeups.changed()).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(SkilletError::WaitTimeout {
                        waited_ms: start.elapsed().as_millis() as u64,
                    }),
                }
            }
        }
    }

    /// Fast read-through access to the realtime snapshot.
    ///
    /// The fast path increfs the current realtime slot. The slow path
    /// serializes on the realtime lock and opens through the same
    /// `open_new_searcher` machinery, bypassing on-deck admission (realtime
    /// opens are bounded by the realtime lock itself). The result never
    /// becomes the registered searcher.
    pub async fn get_realtime_searcher(&self) -> Result<SearcherRef> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if let Some(rt) = self.realtime_fast_path() {
            return Ok(rt);
        }
        let _rt_guard = self.realtime_lock.lock().await;
        if let Some(rt) = self.realtime_fast_path() {
            return Ok(rt);
        }
        self.open_new_searcher(true, true).await
    }

    /// Force the realtime slot to reflect the writer's current state.
    ///
    /// Called by the update path after documents change so subsequent
    /// [`SearcherCore::get_realtime_searcher`] calls see them. Does not touch
    /// registration. A no-op when nothing changed underneath.
    pub async fn open_realtime_searcher(&self) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let _rt_guard = self.realtime_lock.lock().await;
        let searcher = self.open_new_searcher(true, true).await?;
        searcher.decref();
        Ok(())
    }

    fn realtime_fast_path(&self) -> Option<SearcherRef> {
        let st = self.state.lock().unwrap();
        st.realtime.as_ref().map(|rt| {
            rt.incref();
            Arc::clone(rt)
        })
    }

    /// Scoped acquisition: run `f` against the registered searcher and
    /// release the hold on every exit path, including `Err` and panics.
    pub async fn with_searcher<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Searcher) -> Result<R>,
    {
        let searcher = self
            .get_searcher(false, true, false)
            .await?
            .ok_or_else(|| SkilletError::NoSearcher(self.name.clone()))?;
        let guard = SearcherGuard::new(searcher);
        f(&guard)
    }

    /// Force-open a new searcher and wait until it (or something newer) is
    /// registered. This is the post-commit refresh path: when it returns,
    /// ordinary callers see the new snapshot.
    pub async fn reopen_searcher(&self) -> Result<()> {
        let Some(searcher) = self.get_searcher(true, true, true).await? else {
            return Ok(());
        };
        let target_serial = searcher.get().serial();
        let mut wakeups = self.wakeups.subscribe();
        loop {
            if self.is_closed() {
                searcher.decref();
                return Err(self.closed_error());
            }
            let registered = {
                let st = self.state.lock().unwrap();
                st.registered
                    .as_ref()
                    .map(|r| r.get().serial() >= target_serial)
                    .unwrap_or(false)
            };
            if registered {
                break;
            }
            let _ = wakeups.changed().await;
        }
        searcher.decref();
        Ok(())
    }

    // ============================================================
    // Open path
    // ============================================================

    async fn open_and_schedule(
        &self,
        return_searcher: bool,
        update_handler_reopens: bool,
    ) -> Result<Option<SearcherRef>> {
        // on-deck slot is held from here; every failure path must give it
        // back and wake waiters so nobody blocks forever
        let searcher = match self.open_new_searcher(update_handler_reopens, false).await {
            Ok(s) => s,
            Err(e) => {
                self.metrics.record_error();
                self.release_on_deck();
                return Err(e);
            }
        };

        // take the event holds on the previous searcher under the state
        // lock; the registered slot keeps its count positive there
        enum Previous {
            Same,
            Retiring(SearcherRef),
            None,
        }
        let previous = {
            let st = self.state.lock().unwrap();
            match &st.registered {
                Some(current) if Arc::ptr_eq(current, &searcher) => Previous::Same,
                Some(current) => {
                    current.incref(); // warm source hold
                    current.incref(); // new-searcher listener hold
                    Previous::Retiring(Arc::clone(current))
                }
                None => Previous::None,
            }
        };

        match previous {
            Previous::Same => {
                // no-op reopen resolved to the already-registered searcher;
                // registration just drops the duplicate hold
                self.submit(SearcherEvent::Register {
                    new: Arc::clone(&searcher),
                });
            }
            Previous::Retiring(current) => {
                self.submit(SearcherEvent::Warm {
                    new: Arc::clone(&searcher),
                    source: Arc::clone(&current),
                });
                self.submit(SearcherEvent::NewSearcher {
                    new: Arc::clone(&searcher),
                    previous: current,
                });
                self.submit(SearcherEvent::Register {
                    new: Arc::clone(&searcher),
                });
            }
            Previous::None if self.config.use_cold_searcher => {
                // first searcher of the core: serve cold rather than wait
                // for the bootstrap listeners
                self.register_searcher(Arc::clone(&searcher));
                self.submit(SearcherEvent::FirstSearcher {
                    new: Arc::clone(&searcher),
                });
            }
            Previous::None => {
                self.submit(SearcherEvent::FirstSearcher {
                    new: Arc::clone(&searcher),
                });
                self.submit(SearcherEvent::Register {
                    new: Arc::clone(&searcher),
                });
            }
        }

        if return_searcher {
            searcher.incref();
            Ok(Some(searcher))
        } else {
            Ok(None)
        }
    }

    /// Queue an event on the executor; if it already shut down (core
    /// closing), run the release-side of the event inline so no hold and no
    /// on-deck slot leaks.
    fn submit(&self, event: SearcherEvent) {
        if let Some(rejected) = self.executor.submit(event) {
            match rejected {
                SearcherEvent::Warm { source, .. } => source.decref(),
                SearcherEvent::NewSearcher { previous, .. } => previous.decref(),
                SearcherEvent::FirstSearcher { .. } => {}
                SearcherEvent::Register { new } => self.register_searcher(new),
            }
        }
    }

    /// Open a snapshot and build a searcher over it, per the four reopen
    /// outcomes. New searcher objects are pushed onto the tracking queue and
    /// swapped into the realtime slot. The returned hold belongs to the
    /// caller (for realtime requests) or to the pending registration.
    pub(crate) async fn open_new_searcher(
        &self,
        update_handler_reopens: bool,
        realtime: bool,
    ) -> Result<SearcherRef> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let _open_guard = self.open_lock.lock().await;
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let start = Instant::now();

        // the realtime slot tracks every open, so it is the newest snapshot
        // to reopen against
        let mut source = self.realtime_fast_path();

        let reopened = match &source {
            Some(rt) => self.factory.reopen(rt.get().reader(), update_handler_reopens),
            None => self
                .factory
                .open_fresh(update_handler_reopens)
                .map(Reopen::Changed),
        };

        let (reader, close_reader, reader_owner) = match reopened {
            Err(e) => {
                if let Some(rt) = source.take() {
                    rt.decref();
                }
                tracing::error!(core = %self.name, "snapshot open failed: {}", e);
                return Err(e);
            }
            Ok(Reopen::Changed(reader)) => {
                if let Some(rt) = source.take() {
                    tracing::debug!(
                        core = %self.name,
                        from = rt.get().generation(),
                        to = reader.generation(),
                        "reader changed on reopen"
                    );
                    rt.decref();
                }
                (reader, true, None)
            }
            Ok(Reopen::Unchanged) => {
                let rt = source
                    .take()
                    .expect("unchanged reopen implies a previous reader");
                if realtime {
                    // hand the caller our hold on the existing realtime searcher
                    return Ok(rt);
                }
                if self.config.caching_enabled {
                    let registered = {
                        let st = self.state.lock().unwrap();
                        st.registered.as_ref().map(|r| {
                            r.incref();
                            Arc::clone(r)
                        })
                    };
                    if let Some(registered) = registered {
                        tracing::debug!(core = %self.name, "reader unchanged; reusing registered searcher");
                        rt.decref();
                        return Ok(registered);
                    }
                }
                // same snapshot, fresh cache state; the reader stays owned
                // by the searcher we reopened against, so the new searcher
                // takes over our hold on it to keep the reader open
                let reader = Arc::clone(rt.get().reader());
                (reader, false, Some(rt))
            }
        };

        let kind = if realtime {
            SearcherKind::Realtime
        } else {
            SearcherKind::Main
        };
        let searcher = RefCounted::wrap(Searcher::new(
            &self.name,
            kind,
            reader,
            close_reader,
            reader_owner,
            &self.cache_specs,
            self.config.caching_enabled && !realtime,
        ));

        let weak = self.self_weak.clone();
        searcher.set_zero_hook(Box::new(move |rc| match weak.upgrade() {
            Some(core) => core.unlink_searcher(rc),
            None => rc.refcount() <= 0,
        }));

        let doomed_realtime = {
            let mut st = self.state.lock().unwrap();
            if self.is_closed() {
                // core closed while we were opening: release the only hold,
                // which closes the half-built searcher and its reader
                drop(st);
                searcher.decref();
                return Err(self.closed_error());
            }
            let queue = if realtime {
                &mut st.realtime_queue
            } else {
                &mut st.normal_queue
            };
            queue.push_front(Arc::clone(&searcher));
            searcher.incref(); // realtime slot hold
            st.realtime.replace(Arc::clone(&searcher))
        };
        if let Some(old) = doomed_realtime {
            old.decref();
        }

        self.metrics.record_open(start.elapsed());
        tracing::info!(
            core = %self.name,
            searcher = %searcher.get().name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "opened new searcher"
        );
        Ok(searcher)
    }

    // ============================================================
    // Registration and retirement
    // ============================================================

    /// Swap the registered slot to `new`, retiring the previous holder.
    ///
    /// Consumes the pending-registration hold carried by `new`. Runs on the
    /// event task (or inline for a cold first searcher). Waiters are woken on
    /// every exit path, including duplicate or out-of-order registrations,
    /// closed-core aborts, and a panicking `register()`.
    pub(crate) fn register_searcher(&self, new: SearcherRef) {
        if self.is_closed() {
            {
                let mut st = self.state.lock().unwrap();
                st.on_deck = st.on_deck.saturating_sub(1);
            }
            new.decref();
            self.wake_waiters();
            return;
        }

        enum Outcome {
            Installed,
            Duplicate,
            Stale,
        }

        let (outcome, retired) = {
            let mut st = self.state.lock().unwrap();
            st.on_deck = st.on_deck.saturating_sub(1);
            match &st.registered {
                Some(current) if Arc::ptr_eq(current, &new) => {
                    (Outcome::Duplicate, Some(Arc::clone(&new)))
                }
                // registered serials only move forward; a slower open that
                // lost the race to a newer one releases its hold instead
                Some(current) if current.get().serial() > new.get().serial() => {
                    (Outcome::Stale, Some(Arc::clone(&new)))
                }
                _ => (Outcome::Installed, st.registered.replace(Arc::clone(&new))),
            }
        };

        match outcome {
            Outcome::Duplicate => {
                tracing::debug!(core = %self.name, "duplicate registration from a no-op reopen");
            }
            Outcome::Stale => {
                tracing::warn!(
                    core = %self.name,
                    searcher = %new.get().name(),
                    "discarding registration of a searcher older than the current one"
                );
            }
            Outcome::Installed => {
                let outcome = catch_unwind(AssertUnwindSafe(|| new.get().register()));
                if outcome.is_err() {
                    tracing::error!(
                        core = %self.name,
                        searcher = %new.get().name(),
                        "register() panicked; searcher stays registered with partial bookkeeping"
                    );
                }
            }
        }

        if let Some(old) = retired {
            old.decref(); // outside the state lock; may close the retiree
        }
        self.wake_waiters();
    }

    fn release_on_deck(&self) {
        {
            let mut st = self.state.lock().unwrap();
            st.on_deck = st.on_deck.saturating_sub(1);
        }
        self.wake_waiters();
    }

    /// Zero-hook body: under the state lock, re-check the count and unlink
    /// the searcher from the tracking queues. Returns false if a concurrent
    /// incref revived the wrapper.
    fn unlink_searcher(&self, rc: &RefCounted<Searcher>) -> bool {
        let mut st = self.state.lock().unwrap();
        if rc.refcount() > 0 {
            return false;
        }
        let target = rc as *const RefCounted<Searcher>;
        st.normal_queue.retain(|s| Arc::as_ptr(s) != target);
        st.realtime_queue.retain(|s| Arc::as_ptr(s) != target);
        true
    }

    // ============================================================
    // Shutdown
    // ============================================================

    /// Close the core: release both slots, unblock every waiter with a
    /// closed error, and drain the event task. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(core = %self.name, "closing core");
        self.wake_waiters();

        let (registered, realtime) = {
            let mut st = self.state.lock().unwrap();
            st.normal_queue.clear();
            st.realtime_queue.clear();
            (st.registered.take(), st.realtime.take())
        };
        if let Some(r) = registered {
            r.decref();
        }
        if let Some(r) = realtime {
            r.decref();
        }

        // drains pending events; queued registrations release their holds
        // through the closed-core path above
        self.executor.shutdown().await;
    }
}
