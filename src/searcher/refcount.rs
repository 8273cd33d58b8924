//! Atomic reference counting with a close-on-zero contract.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// A resource that can be physically released exactly once.
///
/// Close failures are logged by the wrapper and never surfaced to whichever
/// holder happened to drop the last reference.
pub trait Close: Send + Sync {
    fn close(&self) -> crate::error::Result<()>;
}

/// Hook run when the count reaches zero, before the physical close.
///
/// The hook must re-read the count under the lock of whatever collection
/// tracks this wrapper, unlink the wrapper if the count is still ≤ 0, and
/// return whether the close should proceed. Returning `false` means a
/// concurrent `incref` revived the wrapper between the zero-crossing
/// decrement and the re-check; the resource stays open and usable.
pub type ZeroHook<T> = Box<dyn Fn(&RefCounted<T>) -> bool + Send + Sync>;

/// Generic reference-counted wrapper around a closable resource.
///
/// Created with count 1 (the creator's hold). `incref`/`decref` are atomic
/// and callable from any thread holding a valid reference; the last `decref`
/// triggers [`RefCounted::close`], which physically closes the resource at
/// most once.
pub struct RefCounted<T: Close> {
    count: AtomicI32,
    closed: AtomicBool,
    zero_hook: OnceCell<ZeroHook<T>>,
    resource: T,
}

impl<T: Close> std::fmt::Debug for RefCounted<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCounted")
            .field("count", &self.count)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<T: Close> RefCounted<T> {
    /// Wrap a resource with an initial count of 1.
    pub fn wrap(resource: T) -> Arc<Self> {
        Arc::new(RefCounted {
            count: AtomicI32::new(1),
            closed: AtomicBool::new(false),
            zero_hook: OnceCell::new(),
            resource,
        })
    }

    /// Install the collection-unlink hook. May be set at most once; the
    /// lifecycle manager does this right after wrapping, before the wrapper
    /// is shared with any other thread.
    pub(crate) fn set_zero_hook(&self, hook: ZeroHook<T>) {
        let _ = self.zero_hook.set(hook);
    }

    pub fn get(&self) -> &T {
        &self.resource
    }

    pub fn refcount(&self) -> i32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Atomically increment the count. Returns the new count.
    pub fn incref(&self) -> i32 {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Atomically decrement the count; attempts the physical close if the
    /// result is ≤ 0.
    pub fn decref(&self) {
        let now = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        if now <= 0 {
            self.close();
        }
    }

    /// Attempt the physical close.
    ///
    /// Re-checks the count first (via the zero hook, under the tracking
    /// collection's lock) and aborts if another holder incremented between
    /// the zero-crossing decrement and this re-check. Idempotent: a second
    /// call on an already-closed wrapper is a no-op.
    pub fn close(&self) {
        match self.zero_hook.get() {
            Some(hook) => {
                if !hook(self) {
                    return;
                }
            }
            None => {
                if self.count.load(Ordering::SeqCst) > 0 {
                    return;
                }
            }
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.resource.close() {
            tracing::warn!("error closing refcounted resource: {}", e);
        }
    }
}
