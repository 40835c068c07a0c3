//! The process-wide table of tracked symbols.
//!
//! The registry is closed: fourteen entries, enumerated at compile time,
//! each pairing a symbol name with its wrapper and a cell for the address
//! the dynamic linker resolved before any patching. Entries are written
//! once by [`resolve_hooks`] and are read-only afterwards.

use crate::{
    arch::{Dyn, Phdr},
    intercept,
    view::ElfView,
};
use core::{
    ffi::{CStr, c_char, c_int, c_void},
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};
use elf::abi::PT_DYNAMIC;
use libc::{dl_phdr_info, off_t, off64_t, size_t};
use spin::Once;

/// Allocator routine an interceptor observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Allocator {
    Malloc,
    Calloc,
    Realloc,
    Memalign,
    PosixMemalign,
    Valloc,
    Pvalloc,
    Free,
    Mmap,
    Munmap,
}

/// Semantic class of an [`Allocator`], exposed so a tracker can update its
/// shadow map without knowing the specific allocator variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// Single-address allocation (the `*alloc`/`memalign` variants).
    SimpleAllocator,
    /// Single-address free (`free`).
    SimpleDeallocator,
    /// `(address, length)` allocation (`mmap`).
    RangedAllocator,
    /// `(address, length)` free (`munmap`).
    RangedDeallocator,
}

/// Classify an allocator. Total over [`Allocator`].
pub fn allocator_kind(allocator: Allocator) -> AllocatorKind {
    match allocator {
        Allocator::Malloc
        | Allocator::Calloc
        | Allocator::Realloc
        | Allocator::Memalign
        | Allocator::PosixMemalign
        | Allocator::Valloc
        | Allocator::Pvalloc => AllocatorKind::SimpleAllocator,
        Allocator::Free => AllocatorKind::SimpleDeallocator,
        Allocator::Mmap => AllocatorKind::RangedAllocator,
        Allocator::Munmap => AllocatorKind::RangedDeallocator,
    }
}

/// A tracked symbol: its wrapper and the lazily resolved original.
///
/// `T` is the hooked signature's `unsafe extern "C"` fn-pointer type; the
/// original is kept in a single pointer-width cell and cast back at the
/// call site, which is sound because the registry is closed over known
/// signatures. Zero means unresolved.
pub(crate) struct Hook<T: Copy> {
    symbol: &'static str,
    wrapper: T,
    original: AtomicUsize,
}

impl<T: Copy> Hook<T> {
    const fn new(symbol: &'static str, wrapper: T) -> Self {
        Hook {
            symbol,
            wrapper,
            original: AtomicUsize::new(0),
        }
    }

    /// The real implementation behind this hook.
    ///
    /// Aborting here rather than faulting on a null call is the contract:
    /// entering a wrapper before resolution ran is a programming error.
    pub(crate) fn original(&self) -> T {
        let raw = self.original.load(Ordering::Acquire);
        assert!(
            raw != 0,
            "hook `{}` entered before symbol resolution",
            self.symbol
        );
        assert!(size_of::<T>() == size_of::<usize>());
        unsafe { mem::transmute_copy(&raw) }
    }
}

/// Registry-facing access to a hook entry, independent of its signature.
pub(crate) trait HookSlot: Sync {
    fn symbol(&self) -> &'static str;
    fn wrapper_addr(&self) -> usize;
    fn original_addr(&self) -> usize;
    fn set_original(&self, addr: usize);
}

impl<T: Copy + Sync> HookSlot for Hook<T> {
    fn symbol(&self) -> &'static str {
        self.symbol
    }

    fn wrapper_addr(&self) -> usize {
        assert!(size_of::<T>() == size_of::<usize>());
        let wrapper = self.wrapper;
        unsafe { mem::transmute_copy(&wrapper) }
    }

    fn original_addr(&self) -> usize {
        self.original.load(Ordering::Acquire)
    }

    fn set_original(&self, addr: usize) {
        self.original.store(addr, Ordering::Release);
    }
}

pub(crate) static MALLOC: Hook<unsafe extern "C" fn(size_t) -> *mut c_void> =
    Hook::new("malloc", intercept::malloc);
pub(crate) static CALLOC: Hook<unsafe extern "C" fn(size_t, size_t) -> *mut c_void> =
    Hook::new("calloc", intercept::calloc);
pub(crate) static REALLOC: Hook<unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void> =
    Hook::new("realloc", intercept::realloc);
pub(crate) static MEMALIGN: Hook<unsafe extern "C" fn(size_t, size_t) -> *mut c_void> =
    Hook::new("memalign", intercept::memalign);
pub(crate) static POSIX_MEMALIGN: Hook<
    unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int,
> = Hook::new("posix_memalign", intercept::posix_memalign);
pub(crate) static VALLOC: Hook<unsafe extern "C" fn(size_t) -> *mut c_void> =
    Hook::new("valloc", intercept::valloc);
pub(crate) static PVALLOC: Hook<unsafe extern "C" fn(size_t) -> *mut c_void> =
    Hook::new("pvalloc", intercept::pvalloc);
pub(crate) static FREE: Hook<unsafe extern "C" fn(*mut c_void)> =
    Hook::new("free", intercept::free);
pub(crate) static MMAP: Hook<
    unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void,
> = Hook::new("mmap", intercept::mmap);
pub(crate) static MMAP64: Hook<
    unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off64_t) -> *mut c_void,
> = Hook::new("mmap64", intercept::mmap64);
pub(crate) static MUNMAP: Hook<unsafe extern "C" fn(*mut c_void, size_t) -> c_int> =
    Hook::new("munmap", intercept::munmap);
pub(crate) static DLOPEN: Hook<unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void> =
    Hook::new("dlopen", intercept::dlopen);
pub(crate) static DLCLOSE: Hook<unsafe extern "C" fn(*mut c_void) -> c_int> =
    Hook::new("dlclose", intercept::dlclose);
pub(crate) static PYGILSTATE_ENSURE: Hook<unsafe extern "C" fn() -> c_int> =
    Hook::new("PyGILState_Ensure", intercept::py_gilstate_ensure);

/// Every tracked symbol, in resolution and patch order.
pub(crate) static HOOKS: [&'static (dyn HookSlot + 'static); 14] = [
    &MALLOC,
    &CALLOC,
    &REALLOC,
    &MEMALIGN,
    &POSIX_MEMALIGN,
    &VALLOC,
    &PVALLOC,
    &FREE,
    &MMAP,
    &MMAP64,
    &MUNMAP,
    &DLOPEN,
    &DLCLOSE,
    &PYGILSTATE_ENSURE,
];

/// The registry entry for `symbol`, if it is tracked.
pub(crate) fn find_hook(symbol: &str) -> Option<&'static dyn HookSlot> {
    if symbol.is_empty() {
        return None;
    }
    HOOKS.iter().copied().find(|hook| hook.symbol() == symbol)
}

/// A by-name lookup in flight across the loaded objects.
struct SymbolQuery {
    name: &'static str,
    address: usize,
    maps_visited: usize,
}

unsafe extern "C" fn resolve_callback(
    info: *mut dl_phdr_info,
    _size: size_t,
    data: *mut c_void,
) -> c_int {
    let query = unsafe { &mut *(data as *mut SymbolQuery) };
    let info = unsafe { &*info };
    let first = query.maps_visited == 0;
    query.maps_visited += 1;

    let name = unsafe { CStr::from_ptr(info.dlpi_name) }.to_bytes();
    // The executable is the first map and carries an empty name; any later
    // unnamed map has nothing to resolve against. The vdso has no usable
    // symbol table.
    if !first && name.is_empty() {
        return 0;
    }
    if contains(name, b"linux-vdso.so.1") {
        return 0;
    }

    let base = info.dlpi_addr as usize;
    let phdrs =
        unsafe { core::slice::from_raw_parts(info.dlpi_phdr as *const Phdr, info.dlpi_phnum as usize) };
    let Some(dynamic) = phdrs.iter().find(|phdr| phdr.p_type == PT_DYNAMIC) else {
        return 0;
    };
    let dyn_ptr = (base + dynamic.p_vaddr as usize) as *const Dyn;
    let Ok(view) = (unsafe { ElfView::new(base, dyn_ptr) }) else {
        return 0;
    };

    query.address = view.address_of(query.name);
    // A non-zero return stops the iteration: the first definition in
    // link-map order wins, as with normal dynamic linking.
    (query.address != 0) as c_int
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn resolve_symbol(name: &'static str) -> usize {
    let mut query = SymbolQuery {
        name,
        address: 0,
        maps_visited: 0,
    };
    unsafe {
        libc::dl_iterate_phdr(
            Some(resolve_callback),
            &mut query as *mut SymbolQuery as *mut c_void,
        )
    };
    query.address
}

static RESOLVE: Once = Once::new();

/// Resolve every registry entry to the address the dynamic linker produced,
/// before any slot has been patched. Runs once per process; later calls are
/// no-ops.
pub(crate) fn resolve_hooks() {
    RESOLVE.call_once(|| {
        for hook in HOOKS {
            let addr = resolve_symbol(hook.symbol());
            if addr != 0 {
                log::debug!("resolved {} to {:#x}", hook.symbol(), addr);
                hook.set_original(addr);
            } else {
                log::debug!("no loaded object defines {}", hook.symbol());
            }
        }
    });
}

/// Names of registry entries no loaded object defines.
pub fn unresolved_hooks() -> Vec<&'static str> {
    resolve_hooks();
    HOOKS
        .iter()
        .filter(|hook| hook.original_addr() == 0)
        .map(|hook| hook.symbol())
        .collect()
}

/// Assert that every tracked symbol resolved.
///
/// An interceptor whose original pointer never resolved would abort on its
/// first call; this surfaces that configuration error at install time
/// instead.
///
/// # Panics
/// Panics when any registry entry is unresolved.
pub fn ensure_all_hooks_are_valid() {
    let missing = unresolved_hooks();
    assert!(missing.is_empty(), "unresolved tracked symbols: {missing:?}");
}
