//! Dynamic library loading and symbol resolution.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CString, c_void};

use libloading::os::unix::Library as RawLibrary;
use libloading::{Library, Symbol};

use crate::error::LibraryError;
use crate::types::{CallConv, PTR_SIZE, Param, TypeArena};

mod sys {
    unsafe extern "C" {
        pub fn __errno_location() -> *mut i32;
    }
}

/// The calling thread's errno value.
pub(crate) fn read_errno() -> i32 {
    unsafe { *sys::__errno_location() }
}

pub(crate) fn write_errno(v: i32) {
    unsafe { *sys::__errno_location() = v };
}

/// One loaded library plus the addresses already resolved out of it.
/// Resolved functions keep the namespace alive, so the handle is shared.
#[derive(Debug)]
pub struct Namespace {
    lib: Library,
    name: String,
    symbols: RefCell<HashMap<String, usize>>,
}

impl Namespace {
    /// Whole-process namespace: the executable and everything it links.
    pub fn global() -> Namespace {
        Namespace {
            lib: Library::from(RawLibrary::this()),
            name: "global".to_string(),
            symbols: RefCell::new(HashMap::new()),
        }
    }

    /// Opens `name`, trying the literal string first and then the
    /// platform library naming fallbacks.
    pub fn open(name: &str) -> Result<Namespace, LibraryError> {
        let mut reason = String::new();
        for candidate in candidates(name) {
            match unsafe { Library::new(&candidate) } {
                Ok(lib) => {
                    log::debug!("loaded library {candidate}");
                    return Ok(Namespace {
                        lib,
                        name: candidate,
                        symbols: RefCell::new(HashMap::new()),
                    });
                }
                Err(e) => {
                    if !reason.is_empty() {
                        reason.push_str("; ");
                    }
                    reason.push_str(&e.to_string());
                }
            }
        }
        Err(LibraryError::OpenFailed {
            name: name.to_string(),
            reason,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves `symbol` to a raw address, consulting the per-namespace
    /// cache first. Non-C conventions fall back to their decorated form
    /// when the plain name is missing.
    pub fn address(
        &self,
        symbol: &str,
        conv: CallConv,
        stack_bytes: usize,
    ) -> Result<usize, LibraryError> {
        if let Some(addr) = self.symbols.borrow().get(symbol) {
            return Ok(*addr);
        }

        let addr = self
            .lookup(symbol)
            .or_else(|| decorated(conv, symbol, stack_bytes).and_then(|alt| self.lookup(&alt)));

        match addr {
            Some(addr) => {
                log::trace!("resolved {symbol} in {} to {addr:#x}", self.name);
                self.symbols.borrow_mut().insert(symbol.to_string(), addr);
                Ok(addr)
            }
            None => Err(LibraryError::SymbolNotFound {
                name: symbol.to_string(),
            }),
        }
    }

    fn lookup(&self, symbol: &str) -> Option<usize> {
        let bytes = CString::new(symbol).ok()?;
        let sym: Symbol<*mut c_void> =
            unsafe { self.lib.get(bytes.as_bytes_with_nul()) }.ok()?;
        Some(*sym as usize)
    }
}

fn candidates(name: &str) -> Vec<String> {
    let mut out = vec![name.to_string()];
    if cfg!(target_os = "macos") {
        out.push(format!("{name}.dylib"));
        out.push(format!("lib{name}.dylib"));
    } else if cfg!(windows) {
        out.push(format!("{name}.dll"));
    } else {
        out.push(format!("{name}.so"));
        out.push(format!("lib{name}.so"));
    }
    out
}

/// Decorated symbol name for the 32-bit-era conventions: stdcall exports
/// as `_name@bytes`, fastcall as `@name@bytes`. The C convention carries
/// no decoration.
pub(crate) fn decorated(conv: CallConv, name: &str, stack_bytes: usize) -> Option<String> {
    match conv {
        CallConv::C => None,
        CallConv::Std => Some(format!("_{name}@{stack_bytes}")),
        CallConv::Fast => Some(format!("@{name}@{stack_bytes}")),
    }
}

/// Callee-popped byte count used in decorated names; every argument
/// occupies a whole number of 4-byte slots.
pub(crate) fn decoration_bytes(params: &[Param], arena: &TypeArena) -> usize {
    params
        .iter()
        .map(|p| {
            let size = if p.ctype.is_pointer() || p.ctype.is_array {
                PTR_SIZE
            } else {
                p.ctype.base_size(arena)
            };
            (size.max(1) + 3) & !3
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CType, TypeKind};

    fn param(ctype: CType) -> Param {
        Param { name: None, ctype }
    }

    #[test]
    fn decorated_names_follow_the_convention() {
        assert_eq!(decorated(CallConv::C, "f", 8), None);
        assert_eq!(decorated(CallConv::Std, "f", 12).as_deref(), Some("_f@12"));
        assert_eq!(decorated(CallConv::Fast, "f", 12).as_deref(), Some("@f@12"));
    }

    #[test]
    fn decoration_rounds_arguments_to_slots() {
        let arena = TypeArena::new();
        let mut ptr = CType::scalar(TypeKind::I8);
        ptr.pointers = 1;
        let params = [
            param(CType::scalar(TypeKind::I8)),
            param(CType::scalar(TypeKind::I16)),
            param(CType::scalar(TypeKind::Double)),
            param(ptr),
        ];
        // 1 -> 4, 2 -> 4, 8 -> 8, pointer -> 8
        assert_eq!(decoration_bytes(&params, &arena), 24);
    }

    #[test]
    fn the_global_namespace_sees_libc() {
        let ns = Namespace::global();
        let addr = ns.address("strlen", CallConv::C, 0).expect("strlen");
        assert_ne!(addr, 0);
        // second resolution comes from the cache
        assert_eq!(ns.address("strlen", CallConv::C, 0).expect("strlen"), addr);
    }

    #[test]
    fn open_failure_names_the_library() {
        let err = Namespace::open("bruecke-no-such-library").expect_err("must fail");
        match err {
            LibraryError::OpenFailed { name, .. } => {
                assert_eq!(name, "bruecke-no-such-library");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_symbols_are_reported() {
        let ns = Namespace::global();
        let err = ns
            .address("bruecke_no_such_symbol", CallConv::C, 0)
            .expect_err("must fail");
        assert!(matches!(err, LibraryError::SymbolNotFound { .. }));
    }

    #[test]
    fn errno_round_trips() {
        write_errno(42);
        assert_eq!(read_errno(), 42);
    }
}
