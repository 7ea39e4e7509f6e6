//! Host-side values and cdata storage. [`Value`] is the closed set of
//! things the host can hand to or receive from the FFI; [`CData`] is a
//! typed box of raw C memory with shared ownership so member references
//! keep their parent allocation alive.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::jit::Closure;
use crate::types::CType;

/// Every cdata allocation is over-aligned to this, so aggregates with
/// 16-byte members (and SSE-friendly buffers) are always usable.
pub const CDATA_ALIGN: usize = 16;

/// A value crossing the host/C boundary.
#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Untyped foreign address.
    Ptr(*mut c_void),
    /// Positional initializer.
    List(Vec<Value>),
    /// Keyed initializer for records.
    Record(Vec<(String, Value)>),
    CData(CData),
}

impl Value {
    /// Category name used in conversion errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Ptr(_) => "pointer",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::CData(_) => "cdata",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<CData> for Value {
    fn from(v: CData) -> Value {
        Value::CData(v)
    }
}

impl From<*mut c_void> for Value {
    fn from(v: *mut c_void) -> Value {
        Value::Ptr(v)
    }
}

pub type Finalizer = Box<dyn FnOnce(*mut u8)>;

/// Owned, zero-initialized, 16-byte aligned allocation. The optional
/// finalizer runs when the last handle to the buffer drops, before the
/// memory is released.
pub struct RawBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    finalizer: RefCell<Option<Finalizer>>,
}

impl RawBuf {
    pub fn zeroed(len: usize) -> RawBuf {
        let size = len.max(1);
        let layout = match Layout::from_size_align(size, CDATA_ALIGN) {
            Ok(layout) => layout,
            // Sizes come from u32 array bounds, far below the layout cap.
            Err(_) => unreachable!("cdata layout overflow"),
        };
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        RawBuf {
            ptr,
            len,
            layout,
            finalizer: RefCell::new(None),
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        if let Some(f) = self.finalizer.borrow_mut().take() {
            f(self.ptr.as_ptr());
        }
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for RawBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// A typed window onto C memory. Plain cdata owns its buffer; member
/// access clones the `Rc` and narrows the window, so interior references
/// cannot outlive the allocation they point into.
#[derive(Clone, Debug)]
pub struct CData {
    pub ctype: CType,
    storage: Rc<RawBuf>,
    offset: usize,
    len: usize,
    /// Keeps a compiled callback alive while any handle to its function
    /// pointer survives.
    closure: Option<Rc<Closure>>,
}

impl CData {
    /// Fresh zeroed storage of `len` bytes for a value of `ctype`.
    pub fn new(ctype: CType, len: usize) -> CData {
        CData {
            ctype,
            storage: Rc::new(RawBuf::zeroed(len)),
            offset: 0,
            len,
            closure: None,
        }
    }

    /// Pointer-shaped cdata whose payload is `addr` itself.
    pub fn from_ptr(ctype: CType, addr: *mut c_void) -> CData {
        let cd = CData::new(ctype, std::mem::size_of::<*mut c_void>());
        unsafe { (cd.base_ptr() as *mut *mut c_void).write(addr) };
        cd
    }

    /// Callback cdata: the payload is the trampoline entry address and
    /// the cell rides along for lifetime.
    pub fn from_closure(ctype: CType, closure: Rc<Closure>) -> CData {
        let mut cd = CData::from_ptr(ctype, closure.entry() as *mut c_void);
        cd.closure = Some(closure);
        cd
    }

    /// Narrowed view of the same allocation, as produced by member
    /// access on a struct or indexing into an array.
    pub fn view(&self, ctype: CType, offset: usize, len: usize) -> CData {
        CData {
            ctype,
            storage: Rc::clone(&self.storage),
            offset: self.offset + offset,
            len,
            closure: self.closure.clone(),
        }
    }

    /// Address of this cdata's own payload bytes.
    pub fn base_ptr(&self) -> *mut u8 {
        unsafe { self.storage.ptr().add(self.offset) }
    }

    /// Address of the value: the payload itself, or the target for a
    /// reference, which stores an address and auto-derefs on access.
    pub fn value_ptr(&self) -> *mut u8 {
        let base = self.base_ptr();
        if self.ctype.is_reference {
            unsafe { (base as *const *mut u8).read() }
        } else {
            base
        }
    }

    /// Bytes visible through this window.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn closure(&self) -> Option<&Rc<Closure>> {
        self.closure.as_ref()
    }

    /// Runs `f` when the last handle to the underlying allocation drops.
    /// A second registration replaces the first.
    pub fn on_drop(&self, f: Finalizer) {
        self.storage.finalizer.replace(Some(f));
    }

    /// True when both windows alias the same allocation.
    pub fn same_storage(&self, other: &CData) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }
}
