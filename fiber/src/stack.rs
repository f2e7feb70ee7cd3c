//! Fiber stacks backed by anonymous mappings with a guard page.

use std::io;
use std::ptr;

/// Errors of stack allocation.
#[derive(Debug, Display, Error)]
#[display(doc_comments)]
pub enum StackError {
    /// fiber stack allocation of {size} bytes failed: {err}
    Allocation { size: usize, err: io::Error },
}

/// A mapped stack region. The lowest page is kept `PROT_NONE` so that an
/// overflow faults instead of silently corrupting adjacent memory.
pub struct Stack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

// The mapping is owned exclusively by the fiber holding the stack.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

fn page_size() -> usize { unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize } }

impl Stack {
    /// Maps a stack of at least `size` usable bytes plus one guard page.
    pub fn alloc(size: usize) -> Result<Stack, StackError> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let total = usable + page;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::Allocation { size, err: io::Error::last_os_error() });
        }
        let base = base as *mut u8;
        if unsafe { libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base as *mut libc::c_void, total) };
            return Err(StackError::Allocation { size, err });
        }
        Ok(Stack { base, total, usable })
    }

    /// Upper end of the usable region; stacks grow downwards.
    pub fn top(&self) -> *mut u8 { unsafe { self.base.add(self.total) } }

    pub fn size(&self) -> usize { self.usable }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
    }
}
