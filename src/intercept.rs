//! The wrapper functions installed over the tracked symbols.
//!
//! Each wrapper is ABI-identical to the symbol it replaces: it notifies the
//! tracker and delegates to the original exactly once per invocation. The
//! original pointers are direct, so a wrapper never re-enters itself
//! through the table it is patched into.

use crate::{
    hooks::{self, Allocator},
    patch,
    tracker::with_tracker,
};
use core::ffi::{c_char, c_int, c_void};
use libc::{off_t, off64_t, size_t};

pub(crate) unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let real = hooks::MALLOC.original();
    let ptr = unsafe { real(size) };
    if !ptr.is_null() {
        with_tracker(|t| t.track_allocation(ptr as usize, size, Allocator::Malloc));
    }
    ptr
}

pub(crate) unsafe extern "C" fn calloc(num: size_t, size: size_t) -> *mut c_void {
    let real = hooks::CALLOC.original();
    let ptr = unsafe { real(num, size) };
    if !ptr.is_null() {
        with_tracker(|t| {
            t.track_allocation(ptr as usize, num.wrapping_mul(size), Allocator::Calloc)
        });
    }
    ptr
}

pub(crate) unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let real = hooks::REALLOC.original();
    let new_ptr = unsafe { real(ptr, size) };
    if !new_ptr.is_null() {
        // The old block is gone and the new one is live; report both, in
        // that order. A failed realloc changes nothing and reports nothing.
        if !ptr.is_null() {
            with_tracker(|t| t.track_deallocation(ptr as usize, 0, Allocator::Free));
        }
        with_tracker(|t| t.track_allocation(new_ptr as usize, size, Allocator::Realloc));
    }
    new_ptr
}

pub(crate) unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    let real = hooks::MEMALIGN.original();
    let ptr = unsafe { real(alignment, size) };
    if !ptr.is_null() {
        with_tracker(|t| t.track_allocation(ptr as usize, size, Allocator::Memalign));
    }
    ptr
}

pub(crate) unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let real = hooks::POSIX_MEMALIGN.original();
    let ret = unsafe { real(memptr, alignment, size) };
    if ret == 0 {
        let ptr = unsafe { *memptr };
        with_tracker(|t| t.track_allocation(ptr as usize, size, Allocator::PosixMemalign));
    }
    ret
}

pub(crate) unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    let real = hooks::VALLOC.original();
    let ptr = unsafe { real(size) };
    if !ptr.is_null() {
        with_tracker(|t| t.track_allocation(ptr as usize, size, Allocator::Valloc));
    }
    ptr
}

pub(crate) unsafe extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    let real = hooks::PVALLOC.original();
    let ptr = unsafe { real(size) };
    if !ptr.is_null() {
        with_tracker(|t| t.track_allocation(ptr as usize, size, Allocator::Pvalloc));
    }
    ptr
}

pub(crate) unsafe extern "C" fn free(ptr: *mut c_void) {
    let real = hooks::FREE.original();
    // Notified before the real call: the event must be recorded while the
    // address is still uniquely owned by the caller, and must not be
    // reusable by an allocation the notification path itself makes.
    if !ptr.is_null() {
        with_tracker(|t| t.track_deallocation(ptr as usize, 0, Allocator::Free));
    }
    unsafe { real(ptr) }
}

pub(crate) unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let real = hooks::MMAP.original();
    let ret = unsafe { real(addr, length, prot, flags, fd, offset) };
    if !core::ptr::eq(ret, libc::MAP_FAILED) {
        with_tracker(|t| t.track_allocation(ret as usize, length, Allocator::Mmap));
    }
    ret
}

pub(crate) unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off64_t,
) -> *mut c_void {
    let real = hooks::MMAP64.original();
    let ret = unsafe { real(addr, length, prot, flags, fd, offset) };
    if !core::ptr::eq(ret, libc::MAP_FAILED) {
        with_tracker(|t| t.track_allocation(ret as usize, length, Allocator::Mmap));
    }
    ret
}

pub(crate) unsafe extern "C" fn munmap(addr: *mut c_void, length: size_t) -> c_int {
    let real = hooks::MUNMAP.original();
    with_tracker(|t| t.track_deallocation(addr as usize, length, Allocator::Munmap));
    unsafe { real(addr, length) }
}

pub(crate) unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    let real = hooks::DLOPEN.original();
    let handle = unsafe { real(filename, flags) };
    if !handle.is_null() {
        with_tracker(|t| t.invalidate_module_cache());
        // The new object's slots must point at the wrappers before its
        // first allocation.
        patch::overwrite_symbols();
    }
    handle
}

pub(crate) unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    let real = hooks::DLCLOSE.original();
    // Native stacks cached for the closing object stop being valid
    // symbolisation targets once it is unmapped.
    with_tracker(|t| t.flush_native_trace_cache());
    let ret = unsafe { real(handle) };
    if ret == 0 {
        with_tracker(|t| t.invalidate_module_cache());
    }
    ret
}

pub(crate) unsafe extern "C" fn py_gilstate_ensure() -> c_int {
    let real = hooks::PYGILSTATE_ENSURE.original();
    let state = unsafe { real() };
    // A thread the tracer did not create becomes traced the first time it
    // acquires the runtime lock.
    with_tracker(|t| t.install_trace_function());
    state
}
