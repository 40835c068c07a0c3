//! End-to-end interception scenarios, driven through this test binary's own
//! patched relocation tables.
//!
//! Installing the wrappers affects the whole process, so every scenario
//! holds a global lock and runs against a fresh recording tracker. The
//! recorder's reentrancy guard keeps its own allocations out of the event
//! log; the harness threads still produce background events, so assertions
//! match on exact `(address, size, kind)` triples instead of counting.

use alloctrace::{
    Allocator, Tracker, clear_tracker, overwrite_symbols, restore_symbols, set_tracker,
};
use std::cell::Cell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Event {
    Alloc {
        addr: usize,
        size: usize,
        kind: Allocator,
    },
    Dealloc {
        addr: usize,
        size: usize,
        kind: Allocator,
    },
    ModuleCacheInvalidated,
    TraceFunctionInstalled,
    NativeCacheFlushed,
}

thread_local! {
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Records every notification it receives. Allocations made while recording
/// are delegated but not themselves recorded.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    probe_addr: AtomicUsize,
    probe_byte: AtomicUsize,
}

impl Recorder {
    fn record(&self, event: Event) {
        IN_TRACKER.with(|guard| {
            if guard.get() {
                return;
            }
            guard.set(true);
            self.lock_events().push(event);
            guard.set(false);
        });
    }

    fn snapshot(&self) -> Vec<Event> {
        IN_TRACKER.with(|guard| {
            guard.set(true);
            let events = self.lock_events().clone();
            guard.set(false);
            events
        })
    }

    fn clear(&self) {
        IN_TRACKER.with(|guard| {
            guard.set(true);
            self.lock_events().clear();
            guard.set(false);
        });
    }

    fn lock_events(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Watch `addr`: when its deallocation is next notified, capture the
    /// byte it holds. The read can only succeed while the block is live.
    fn watch(&self, addr: usize) {
        self.probe_byte.store(usize::MAX, Ordering::SeqCst);
        self.probe_addr.store(addr, Ordering::SeqCst);
    }

    fn watched_byte(&self) -> Option<u8> {
        match self.probe_byte.load(Ordering::SeqCst) {
            usize::MAX => None,
            byte => Some(byte as u8),
        }
    }
}

impl Tracker for Recorder {
    fn track_allocation(&self, address: usize, size: usize, kind: Allocator) {
        self.record(Event::Alloc {
            addr: address,
            size,
            kind,
        });
    }

    fn track_deallocation(&self, address: usize, size: usize, kind: Allocator) {
        if address != 0
            && self
                .probe_addr
                .compare_exchange(address, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let byte = unsafe { *(address as *const u8) };
            self.probe_byte.store(byte as usize, Ordering::SeqCst);
        }
        self.record(Event::Dealloc {
            addr: address,
            size,
            kind,
        });
    }

    fn invalidate_module_cache(&self) {
        self.record(Event::ModuleCacheInvalidated);
    }

    fn install_trace_function(&self) {
        self.record(Event::TraceFunctionInstalled);
    }

    fn flush_native_trace_cache(&self) {
        self.record(Event::NativeCacheFlushed);
    }
}

static GUARD: Mutex<()> = Mutex::new(());

/// One installed tracing window. Dropping it restores the original symbols
/// even when an assertion unwinds mid-scenario.
struct Session {
    recorder: Arc<Recorder>,
    _guard: MutexGuard<'static, ()>,
}

impl Session {
    fn start() -> Session {
        let guard = GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = env_logger::builder().is_test(true).try_init();
        let recorder = Arc::new(Recorder::default());
        set_tracker(recorder.clone());
        overwrite_symbols();
        recorder.clear();
        Session {
            recorder,
            _guard: guard,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        restore_symbols();
        clear_tracker();
    }
}

#[test]
fn malloc_and_free_are_traced() {
    let session = Session::start();
    let recorder = session.recorder.clone();

    let ptr = unsafe { libc::malloc(128) };
    assert!(!ptr.is_null());
    unsafe { (ptr as *mut u8).write(0xa5) };
    recorder.watch(ptr as usize);
    unsafe { libc::free(ptr) };

    let events = recorder.snapshot();
    let alloc = events
        .iter()
        .position(|event| {
            *event
                == Event::Alloc {
                    addr: ptr as usize,
                    size: 128,
                    kind: Allocator::Malloc,
                }
        })
        .expect("malloc was not notified");
    let dealloc = events
        .iter()
        .position(|event| {
            *event
                == Event::Dealloc {
                    addr: ptr as usize,
                    size: 0,
                    kind: Allocator::Free,
                }
        })
        .expect("free was not notified");
    assert!(alloc < dealloc);
    // The deallocation was notified before the real free ran: the block was
    // still readable when the tracker saw it.
    assert_eq!(recorder.watched_byte(), Some(0xa5));

    drop(session);

    // Uninstalled: the allocator runs unobserved even with a tracker set.
    // Re-acquire the lock so no other scenario has wrappers installed.
    let _guard = GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    recorder.clear();
    set_tracker(recorder.clone());
    let ptr = unsafe { libc::malloc(99991) };
    assert!(!ptr.is_null());
    unsafe { libc::free(ptr) };
    let quiet = recorder.snapshot().iter().all(|event| {
        *event
            != Event::Alloc {
                addr: ptr as usize,
                size: 99991,
                kind: Allocator::Malloc,
            }
    });
    clear_tracker();
    assert!(quiet, "uninstalled malloc was still notified");
}

#[test]
fn successful_realloc_reports_both_sides() {
    let session = Session::start();
    let recorder = session.recorder.clone();

    let ptr = unsafe { libc::malloc(16) };
    assert!(!ptr.is_null());
    recorder.clear();

    let new_ptr = unsafe { libc::realloc(ptr, 32) };
    assert!(!new_ptr.is_null());

    let events = recorder.snapshot();
    let dealloc = events
        .iter()
        .position(|event| {
            *event
                == Event::Dealloc {
                    addr: ptr as usize,
                    size: 0,
                    kind: Allocator::Free,
                }
        })
        .expect("the old block was not reported");
    let alloc = events
        .iter()
        .position(|event| {
            *event
                == Event::Alloc {
                    addr: new_ptr as usize,
                    size: 32,
                    kind: Allocator::Realloc,
                }
        })
        .expect("the new block was not reported");
    assert!(dealloc < alloc);

    unsafe { libc::free(new_ptr) };
}

#[test]
fn failed_realloc_reports_nothing() {
    let session = Session::start();
    let recorder = session.recorder.clone();

    let ptr = unsafe { libc::malloc(64) };
    assert!(!ptr.is_null());
    unsafe { (ptr as *mut u8).write(0x5a) };
    recorder.clear();

    let huge = usize::MAX / 2;
    let new_ptr = unsafe { libc::realloc(ptr, huge) };
    assert!(new_ptr.is_null());

    let events = recorder.snapshot();
    assert!(events.iter().all(|event| {
        *event
            != Event::Dealloc {
                addr: ptr as usize,
                size: 0,
                kind: Allocator::Free,
            }
    }));
    assert!(
        events
            .iter()
            .all(|event| !matches!(event, Event::Alloc { size, kind: Allocator::Realloc, .. } if *size == huge))
    );
    // The old block survived the failure.
    assert_eq!(unsafe { *(ptr as *const u8) }, 0x5a);
    unsafe { libc::free(ptr) };
}

#[test]
fn calloc_reports_the_full_request() {
    let session = Session::start();
    let recorder = session.recorder.clone();

    let ptr = unsafe { libc::calloc(7, 33) };
    assert!(!ptr.is_null());
    let events = recorder.snapshot();
    assert!(events.contains(&Event::Alloc {
        addr: ptr as usize,
        size: 7 * 33,
        kind: Allocator::Calloc,
    }));
    unsafe { libc::free(ptr) };
}

#[test]
fn posix_memalign_reports_on_success_only() {
    let session = Session::start();
    let recorder = session.recorder.clone();

    let mut ptr: *mut c_void = std::ptr::null_mut();
    let ret = unsafe { libc::posix_memalign(&mut ptr, 64, 256) };
    assert_eq!(ret, 0);
    assert!(!ptr.is_null());
    assert!(recorder.snapshot().contains(&Event::Alloc {
        addr: ptr as usize,
        size: 256,
        kind: Allocator::PosixMemalign,
    }));
    unsafe { libc::free(ptr) };

    // An invalid alignment fails with a status code and reports nothing.
    recorder.clear();
    let mut bad: *mut c_void = std::ptr::null_mut();
    let ret = unsafe { libc::posix_memalign(&mut bad, 3, 256) };
    assert_ne!(ret, 0);
    assert!(recorder.snapshot().iter().all(|event| {
        !matches!(
            event,
            Event::Alloc {
                kind: Allocator::PosixMemalign,
                size: 256,
                ..
            }
        )
    }));
}

#[test]
fn mmap_and_munmap_are_traced_as_ranges() {
    let session = Session::start();
    let recorder = session.recorder.clone();

    let len = 4096;
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(addr, libc::MAP_FAILED);
    unsafe { (addr as *mut u8).write(1) };

    let ret = unsafe { libc::munmap(addr, len) };
    assert_eq!(ret, 0);

    let events = recorder.snapshot();
    let alloc = events
        .iter()
        .position(|event| {
            *event
                == Event::Alloc {
                    addr: addr as usize,
                    size: len,
                    kind: Allocator::Mmap,
                }
        })
        .expect("mmap was not notified");
    let dealloc = events
        .iter()
        .position(|event| {
            *event
                == Event::Dealloc {
                    addr: addr as usize,
                    size: len,
                    kind: Allocator::Munmap,
                }
        })
        .expect("munmap was not notified");
    assert!(alloc < dealloc);
}

#[test]
fn dlopen_and_dlclose_notify_the_module_cache() {
    let session = Session::start();
    let recorder = session.recorder.clone();

    let lib = unsafe { libloading::Library::new("libm.so.6") }.expect("libm should load");
    assert!(recorder.snapshot().contains(&Event::ModuleCacheInvalidated));

    recorder.clear();
    lib.close().expect("dlclose failed");
    let events = recorder.snapshot();
    assert!(events.contains(&Event::NativeCacheFlushed));

    drop(session);
}

// An object loaded after the install pass gets its own table patched by the
// re-install the dlopen wrapper performs; allocations made inside it are
// traced from then on.
#[test]
fn newly_loaded_objects_are_patched() {
    let session = Session::start();
    let recorder = session.recorder.clone();

    let Ok(lib) = (unsafe { libloading::Library::new("libz.so.1") }) else {
        eprintln!("Skipping test: libz.so.1 not available");
        return;
    };
    assert!(recorder.snapshot().contains(&Event::ModuleCacheInvalidated));
    recorder.clear();

    type Compress = unsafe extern "C" fn(
        *mut u8,
        *mut libc::c_ulong,
        *const u8,
        libc::c_ulong,
    ) -> libc::c_int;
    let compress: Compress = match unsafe { lib.get::<Compress>(b"compress\0") } {
        Ok(symbol) => *symbol,
        Err(_) => {
            eprintln!("Skipping test: libz does not export compress");
            return;
        }
    };

    let input = [0u8; 8192];
    let mut output = vec![0u8; 16384];
    let mut out_len = output.len() as libc::c_ulong;
    let ret = unsafe {
        compress(
            output.as_mut_ptr(),
            &mut out_len,
            input.as_ptr(),
            input.len() as libc::c_ulong,
        )
    };
    assert_eq!(ret, 0);

    // deflate's workspace comes from the allocator, reached through the
    // freshly patched table of the object dlopen just brought in.
    let events = recorder.snapshot();
    assert!(
        events
            .iter()
            .any(|event| matches!(event, Event::Alloc { size, .. } if *size >= 1024)),
        "no allocation from the newly loaded object was traced"
    );
}
