//! Rewriting relocation slots across the loaded objects.
//!
//! An install pass walks every loaded object and points each relocation
//! slot that resolves to a tracked symbol at the wrapper; an uninstall
//! pass points it back at the address captured at startup. Both passes are
//! best effort and must be serialised by the caller; other threads may be
//! executing through already-patched slots the whole time, which is safe
//! because a slot flip is a single aligned pointer-width store.

use crate::{
    Result,
    arch::{Dyn, Phdr},
    hooks::{self, HookSlot, contains},
    protect_error,
    view::ElfView,
};
use core::{
    ffi::{CStr, c_int, c_void},
    sync::atomic::{AtomicUsize, Ordering},
};
use elf::abi::PT_DYNAMIC;
use hashbrown::HashSet;
use libc::{dl_phdr_info, size_t};
use spin::{Lazy, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PatchKind {
    Install,
    Restore,
}

/// Names of objects an install pass already processed. Owned by the
/// install/uninstall caller; cleared at the start of every uninstall pass
/// so the next install re-patches everything.
static PATCHED: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Install the wrappers into every currently loaded object.
///
/// Resolves the original addresses first if this is the first pass. Not
/// safe to run concurrently with itself or with [`restore_symbols`];
/// callers serialise, typically at start-of-tracking plus synchronously
/// from the `dlopen` wrapper.
pub fn overwrite_symbols() {
    hooks::resolve_hooks();
    log::debug!("installing symbol wrappers");
    iterate_objects(PatchKind::Install);
}

/// Point every patched slot back at the original implementation.
pub fn restore_symbols() {
    log::debug!("restoring original symbols");
    PATCHED.lock().clear();
    iterate_objects(PatchKind::Restore);
}

fn iterate_objects(kind: PatchKind) {
    let mut kind = kind;
    unsafe {
        libc::dl_iterate_phdr(
            Some(patch_callback),
            &mut kind as *mut PatchKind as *mut c_void,
        )
    };
}

unsafe extern "C" fn patch_callback(
    info: *mut dl_phdr_info,
    _size: size_t,
    data: *mut c_void,
) -> c_int {
    let kind = unsafe { *(data as *const PatchKind) };
    let info = unsafe { &*info };
    let name = unsafe { CStr::from_ptr(info.dlpi_name) }.to_bytes();
    if should_skip(name) {
        return 0;
    }
    let name = String::from_utf8_lossy(name);
    if kind == PatchKind::Install && !PATCHED.lock().insert(name.clone().into_owned()) {
        return 0;
    }

    let base = info.dlpi_addr as usize;
    let phdrs = unsafe {
        core::slice::from_raw_parts(info.dlpi_phdr as *const Phdr, info.dlpi_phnum as usize)
    };
    let Some(dynamic) = phdrs.iter().find(|phdr| phdr.p_type == PT_DYNAMIC) else {
        return 0;
    };
    let dyn_ptr = (base + dynamic.p_vaddr as usize) as *const Dyn;
    match unsafe { ElfView::new(base, dyn_ptr) } {
        Ok(view) => patch_object(&view, base, kind, &name),
        Err(err) => log::debug!("skipping {name}: {err}"),
    }
    0
}

/// The vdso has no symbols to patch; patching the dynamic linker would
/// deadlock its next resolution; patching the tracer's own object would
/// recurse the tracker's internal allocations into the wrappers.
fn should_skip(name: &[u8]) -> bool {
    if contains(name, b"linux-vdso.so.1") || contains(name, b"/ld-linux") {
        return true;
    }
    match SELF_NAME.as_ref() {
        Some(own) => !name.is_empty() && own.as_bytes() == name,
        None => false,
    }
}

/// Path of the object this code lives in, if it is a shared object.
static SELF_NAME: Lazy<Option<String>> = Lazy::new(|| {
    let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
    let ret = unsafe { libc::dladdr(overwrite_symbols as *const () as *const c_void, &mut info) };
    if ret == 0 || info.dli_fname.is_null() {
        return None;
    }
    let fname = unsafe { CStr::from_ptr(info.dli_fname) };
    Some(String::from_utf8_lossy(fname.to_bytes()).into_owned())
});

fn patch_object(view: &ElfView, base: usize, kind: PatchKind, name: &str) {
    log::trace!("patching {name} at {base:#x}");
    for table in view.relocation_tables() {
        for entry in table.entries() {
            let symbol = view.symbol_name(entry.symbol_index);
            let Some(hook) = hooks::find_hook(symbol) else {
                continue;
            };
            // An entry no object defined has nothing to delegate to; it is
            // left alone and caught by `ensure_all_hooks_are_valid`.
            if hook.original_addr() == 0 {
                continue;
            }
            let slot = base + entry.offset;
            if let Err(err) = patch_symbol(hook, kind, slot) {
                log::warn!("failed to patch {symbol} in {name}: {err}");
            }
        }
    }
}

/// Make the page holding `slot` writable and store the new target.
///
/// The page is left read+write afterwards. A racing reader observes either
/// the old or the new pointer; both are callable.
fn patch_symbol(hook: &dyn HookSlot, kind: PatchKind, slot: usize) -> Result<()> {
    let page_size = page_size();
    let page = page_start(slot, page_size);
    let ret = unsafe {
        libc::mprotect(
            page as *mut c_void,
            page_size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if ret != 0 {
        return Err(protect_error(format!(
            "mprotect({page:#x}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let target = match kind {
        PatchKind::Install => hook.wrapper_addr(),
        PatchKind::Restore => hook.original_addr(),
    };
    unsafe { (*(slot as *const AtomicUsize)).store(target, Ordering::Relaxed) };
    Ok(())
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Round `addr` down to the page containing it.
fn page_start(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_start(0x1000, 0x1000), 0x1000);
        assert_eq!(page_start(0x1fff, 0x1000), 0x1000);
        assert_eq!(page_start(0x2000, 0x1000), 0x2000);
        assert_eq!(page_start(0x12345, 0x1000), 0x12000);
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        let size = page_size();
        assert!(size.is_power_of_two());
        assert!(size >= 4096);
    }

    #[test]
    fn loader_and_vdso_are_skipped() {
        assert!(should_skip(b"linux-vdso.so.1"));
        assert!(should_skip(b"/lib64/ld-linux-x86-64.so.2"));
        assert!(!should_skip(b""));
        assert!(!should_skip(b"/usr/lib/libc.so.6"));
    }
}
