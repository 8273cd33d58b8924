//! Warm-up and registration execution.
//!
//! All warm-up callbacks, listener hooks, and registrations for one core run
//! on exactly one spawned task draining one FIFO channel. That single
//! consumer is a correctness property, not a throughput choice: warm-up of
//! searcher N+1 must never race ahead of registration of searcher N, and
//! registrations must be totally ordered. Do not replace this with a pool.

use crate::searcher::lifecycle::SearcherCore;
use crate::searcher::SearcherRef;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Hooks invoked around searcher transitions, from the event task.
///
/// Panics in a listener are caught and logged; they never block registration
/// and never reach the caller of `get_searcher`.
pub trait SearcherListener: Send + Sync {
    /// The core's very first searcher was opened (bootstrap hook).
    fn on_first_searcher(&self, _new: &SearcherRef) {}

    /// A new searcher was opened to replace `previous`.
    fn on_new_searcher(&self, _new: &SearcherRef, _previous: &SearcherRef) {}
}

/// Events carrying a `source`/`previous` searcher hold one incref taken at
/// schedule time, released once the event has run, so the warm source cannot
/// close mid-replay.
pub(crate) enum SearcherEvent {
    Warm {
        new: SearcherRef,
        source: SearcherRef,
    },
    FirstSearcher {
        new: SearcherRef,
    },
    NewSearcher {
        new: SearcherRef,
        previous: SearcherRef,
    },
    /// Carries the pending-registration hold; consumed by the core.
    Register {
        new: SearcherRef,
    },
}

pub(crate) struct EventExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<SearcherEvent>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventExecutor {
    pub(crate) fn new(core: Weak<SearcherCore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(process_events(rx, core));
        EventExecutor {
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue an event. If the executor has shut down the event is handed
    /// back; the caller must then release the holds it carries.
    pub(crate) fn submit(&self, event: SearcherEvent) -> Option<SearcherEvent> {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(tx) => match tx.send(event) {
                Ok(()) => None,
                Err(mpsc::error::SendError(event)) => Some(event),
            },
            None => Some(event),
        }
    }

    /// Drop the sender so the consumer drains remaining events and exits,
    /// then wait for it.
    pub(crate) async fn shutdown(&self) {
        let sender = self.sender.lock().unwrap().take();
        drop(sender);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn process_events(mut rx: mpsc::UnboundedReceiver<SearcherEvent>, core: Weak<SearcherCore>) {
    while let Some(event) = rx.recv().await {
        let Some(core) = core.upgrade() else {
            // core dropped: keep draining so pending holds are released
            release_event_holds(event);
            continue;
        };
        handle_event(&core, event);
    }
}

fn release_event_holds(event: SearcherEvent) {
    match event {
        SearcherEvent::Warm { source, .. } => source.decref(),
        SearcherEvent::NewSearcher { previous, .. } => previous.decref(),
        SearcherEvent::Register { new } => new.decref(),
        SearcherEvent::FirstSearcher { .. } => {}
    }
}

fn handle_event(core: &Arc<SearcherCore>, event: SearcherEvent) {
    match event {
        SearcherEvent::Warm { new, source } => {
            let start = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| new.get().warm(source.get())));
            if outcome.is_err() {
                tracing::warn!(searcher = %new.get().name(), "panic during warm-up; registering with cold caches");
            }
            core.metrics().record_warm(start.elapsed());
            source.decref();
        }
        SearcherEvent::FirstSearcher { new } => {
            for listener in core.listeners() {
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| listener.on_first_searcher(&new)));
                if outcome.is_err() {
                    tracing::error!(searcher = %new.get().name(), "first-searcher listener panicked");
                }
            }
        }
        SearcherEvent::NewSearcher { new, previous } => {
            for listener in core.listeners() {
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| listener.on_new_searcher(&new, &previous)));
                if outcome.is_err() {
                    tracing::error!(searcher = %new.get().name(), "new-searcher listener panicked");
                }
            }
            previous.decref();
        }
        SearcherEvent::Register { new } => {
            core.register_searcher(new);
        }
    }
}
