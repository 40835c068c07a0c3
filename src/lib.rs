//! In-process allocation tracing for ELF-based systems.
//!
//! This crate intercepts the calls an already-running process makes to the
//! allocator and dynamic-linker routines (`malloc` family, `mmap`/`munmap`,
//! `dlopen`/`dlclose`, `PyGILState_Ensure`) by rewriting the Global Offset
//! Table slots of every loaded shared object at runtime. Each intercepted
//! call notifies an externally supplied [`Tracker`] and then continues into
//! the real implementation, whose address was captured before any patching.
//!
//! The building blocks:
//! - [`view`](crate::view) walks an object's `PT_DYNAMIC` segment into its
//!   symbol table, string table and relocation tables;
//! - [`hooks`](crate::hooks) owns the closed, process-wide table of tracked
//!   symbols and resolves the original addresses in link-map order;
//! - [`patch`](crate::patch) flips the matching relocation slots to the
//!   wrappers ([`overwrite_symbols`]) and back ([`restore_symbols`]);
//! - the interceptors are the wrapper functions themselves, one per tracked
//!   symbol, notifying the [`Tracker`] and delegating exactly once.
//!
//! Interception happens at the PLT/GOT boundary only: calls a library makes
//! to its own internal allocator through a local branch are out of reach, as
//! are raw syscalls and statically linked binaries.

#[cfg(not(unix))]
compile_error!("unsupported platform, this crate patches ELF relocation tables");

mod arch;
pub mod hooks;
mod intercept;
pub mod patch;
mod tracker;
pub mod view;

pub use hooks::{
    Allocator, AllocatorKind, allocator_kind, ensure_all_hooks_are_valid, unresolved_hooks,
};
pub use patch::{overwrite_symbols, restore_symbols};
pub use tracker::{Tracker, clear_tracker, set_tracker};

use core::fmt::Display;

#[derive(Debug)]
pub enum Error {
    /// The dynamic section of a loaded object is missing a required entry.
    ParseDynamicError { msg: &'static str },
    /// `mprotect` refused to make a relocation slot's page writable.
    ProtectError { msg: String },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::ParseDynamicError { msg } => write!(f, "{msg}"),
            Error::ProtectError { msg } => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

#[cold]
#[inline(never)]
fn parse_dynamic_error(msg: &'static str) -> Error {
    Error::ParseDynamicError { msg }
}

#[cold]
#[inline(never)]
fn protect_error(msg: impl ToString) -> Error {
    Error::ProtectError {
        msg: msg.to_string(),
    }
}

pub type Result<T> = core::result::Result<T, Error>;
