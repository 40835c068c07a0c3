//! The consumed tracker interface.
//!
//! The tracker is the external subsystem the interceptors notify; recording,
//! unwinding and reporting all live behind it. Exactly one tracker is
//! installed at a time, process-wide.

use crate::hooks::Allocator;
use spin::{Lazy, RwLock};
use std::sync::Arc;

/// Receiver of allocation events.
///
/// Every method is called from inside an interceptor, on the allocating
/// thread, possibly from many threads at once. A notification path that
/// itself allocates re-enters the interceptors; the tracker owns its own
/// per-thread reentrancy guards.
pub trait Tracker: Send + Sync {
    /// An allocator returned `address` for a request of `size` bytes.
    fn track_allocation(&self, address: usize, size: usize, kind: Allocator);

    /// `address` was handed back to the allocator. `size` is `0` when the
    /// routine does not report one (`free`); deallocation is notified while
    /// the caller still uniquely owns the address.
    fn track_deallocation(&self, address: usize, size: usize, kind: Allocator);

    /// The set of loaded modules changed under `dlopen`/`dlclose`.
    fn invalidate_module_cache(&self);

    /// Attach the per-thread trace function to the calling thread.
    fn install_trace_function(&self);

    /// Drop cached native stacks; their addresses may no longer resolve.
    fn flush_native_trace_cache(&self);
}

static TRACKER: Lazy<RwLock<Option<Arc<dyn Tracker>>>> = Lazy::new(|| RwLock::new(None));

/// Install the tracker the interceptors notify, replacing any previous one.
pub fn set_tracker(tracker: Arc<dyn Tracker>) {
    let previous = TRACKER.write().replace(tracker);
    // Dropping the old tracker may run arbitrary code, including `free`;
    // that must happen after the lock is released.
    drop(previous);
}

/// Remove the installed tracker. Interceptors keep delegating to the real
/// implementations, silently.
pub fn clear_tracker() {
    let previous = TRACKER.write().take();
    drop(previous);
}

/// Run `f` against the installed tracker, if any.
pub(crate) fn with_tracker(f: impl FnOnce(&dyn Tracker)) {
    let tracker = {
        let guard = TRACKER.read();
        (*guard).clone()
    };
    if let Some(tracker) = tracker {
        f(&*tracker);
    }
}
