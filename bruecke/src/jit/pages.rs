//! Executable memory for compiled call stubs. Pages are writable while
//! a stub is being copied in and flipped to read-execute before the
//! entry address escapes.

use std::ffi::c_void;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::JitError;
use crate::types::align_up;

pub(crate) mod sys {
    use std::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const PROT_EXEC: i32 = 0x4;

    pub const MAP_PRIVATE: i32 = 0x02;
    pub const MAP_ANONYMOUS: i32 = 0x20;
    pub const MAP_FAILED: *mut c_void = usize::MAX as *mut c_void;

    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            len: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: i64,
        ) -> *mut c_void;
        pub fn munmap(addr: *mut c_void, len: usize) -> i32;
        pub fn mprotect(addr: *mut c_void, len: usize, prot: i32) -> i32;
    }
}

const BLOCK_SIZE: usize = 64 * 1024;
/// Stub entries are kept on 16-byte boundaries.
const STUB_ALIGN_MASK: usize = 15;

struct Block {
    base: NonNull<u8>,
    len: usize,
    used: usize,
}

impl Block {
    fn map(len: usize) -> Result<Block, JitError> {
        let raw = unsafe {
            sys::mmap(
                std::ptr::null_mut(),
                len,
                sys::PROT_READ | sys::PROT_WRITE,
                sys::MAP_PRIVATE | sys::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == sys::MAP_FAILED {
            return Err(JitError::MapFailed { len });
        }
        let base = NonNull::new(raw as *mut u8).ok_or(JitError::MapFailed { len })?;
        Ok(Block { base, len, used: 0 })
    }

    fn protect(&self, prot: i32) -> Result<(), JitError> {
        let rc = unsafe { sys::mprotect(self.base.as_ptr() as *mut c_void, self.len, prot) };
        if rc == 0 { Ok(()) } else { Err(JitError::ProtectFailed) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { sys::munmap(self.base.as_ptr() as *mut c_void, self.len) };
    }
}

/// Bump allocator over executable blocks. Installed stubs live until
/// the heap itself is dropped.
pub struct CodeHeap {
    blocks: Mutex<Vec<Block>>,
}

impl CodeHeap {
    pub fn new() -> CodeHeap {
        CodeHeap {
            blocks: Mutex::new(Vec::new()),
        }
    }

    /// Copies `code` into executable memory and returns its entry point.
    pub fn install(&self, code: &[u8]) -> Result<NonNull<u8>, JitError> {
        let mut blocks = self.blocks.lock();

        let fits = blocks
            .last()
            .is_some_and(|b| align_up(b.used, STUB_ALIGN_MASK) + code.len() <= b.len);
        if !fits {
            let len = code.len().next_multiple_of(BLOCK_SIZE).max(BLOCK_SIZE);
            blocks.push(Block::map(len)?);
        }

        let block = match blocks.last_mut() {
            Some(block) => block,
            None => unreachable!("a block was just mapped"),
        };
        let at = align_up(block.used, STUB_ALIGN_MASK);

        block.protect(sys::PROT_READ | sys::PROT_WRITE)?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), block.base.as_ptr().add(at), code.len());
        }
        block.protect(sys::PROT_READ | sys::PROT_EXEC)?;
        block.used = at + code.len();

        let entry = unsafe { block.base.as_ptr().add(at) };
        log::trace!("installed {} byte stub at {entry:p}", code.len());
        match NonNull::new(entry) {
            Some(entry) => Ok(entry),
            None => unreachable!("block base is non-null"),
        }
    }
}

impl Default for CodeHeap {
    fn default() -> Self {
        CodeHeap::new()
    }
}

/// A stub in its own mapping, released when dropped. Used for one-shot
/// code like variadic call stubs compiled for a single argument list.
pub struct TransientCode {
    block: Block,
}

impl TransientCode {
    pub fn new(code: &[u8]) -> Result<TransientCode, JitError> {
        let mut block = Block::map(code.len().max(1))?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), block.base.as_ptr(), code.len());
        }
        block.protect(sys::PROT_READ | sys::PROT_EXEC)?;
        block.used = code.len();
        Ok(TransientCode { block })
    }

    pub fn entry(&self) -> *const u8 {
        self.block.base.as_ptr()
    }
}
