//! Executable memory management using mmap.
//!
//! [`ExecutableMemory`] is one mmap'd region that starts writable and is
//! sealed read+execute before use. [`ExecutablePool`] hands regions out and
//! takes them back; the pool lock is the only blocking point in the whole
//! compilation pipeline.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::error::CompileError;

/// Error type for memory operations.
#[derive(Debug)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<MemoryError> for CompileError {
    fn from(_: MemoryError) -> Self {
        CompileError::OutOfExecutableMemory
    }
}

/// A page-aligned block of memory allocated via mmap. Writable until
/// [`ExecutableMemory::make_executable`] seals it.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a block of at least `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);
        let ptr = Self::mmap_alloc(aligned_size)?;
        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy `data` into the block at `offset`. Fails once sealed.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        if offset + data.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    fn protect(&mut self, prot: libc::c_int) -> Result<(), MemoryError> {
        let result =
            unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.size, prot) };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        Ok(())
    }

    /// Seal the block read+execute. No further writes are possible through
    /// this object; finalized code is only mutated through the aligned
    /// data words the inline caches own, which live outside the block.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        self.protect(libc::PROT_READ | libc::PROT_EXEC)?;
        self.executable = true;
        Ok(())
    }

    /// Reopen the block for writing so the pool can recycle it.
    fn make_writable(&mut self) -> Result<(), MemoryError> {
        if !self.executable {
            return Ok(());
        }
        self.protect(libc::PROT_READ | libc::PROT_WRITE)?;
        self.executable = false;
        Ok(())
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The region is exclusively owned and only ever mutated before sealing.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

struct PoolState {
    free: Vec<ExecutableMemory>,
}

/// A shared pool of executable regions. Acquiring a region takes the pool
/// lock and may block; everything else in compilation is lock-free.
#[derive(Clone)]
pub struct ExecutablePool {
    chunk_bytes: usize,
    state: Arc<Mutex<PoolState>>,
}

impl ExecutablePool {
    pub fn new(chunk_bytes: usize) -> Self {
        ExecutablePool {
            chunk_bytes: chunk_bytes.max(4096),
            state: Arc::new(Mutex::new(PoolState { free: Vec::new() })),
        }
    }

    /// Take a writable region of at least `size` bytes, reusing a free one
    /// when possible.
    pub fn acquire(&self, size: usize) -> Result<ExecutableAlloc, MemoryError> {
        let mut state = self.state.lock().expect("executable pool lock poisoned");
        if let Some(i) = state.free.iter().position(|m| m.size() >= size) {
            let mem = state.free.swap_remove(i);
            tracing::trace!(size, reused = mem.size(), "executable pool reuse");
            return Ok(ExecutableAlloc {
                mem: Some(mem),
                pool: Arc::clone(&self.state),
            });
        }
        drop(state);
        let mem = ExecutableMemory::new(size.max(self.chunk_bytes))?;
        tracing::trace!(size, chunk = mem.size(), "executable pool mmap");
        Ok(ExecutableAlloc {
            mem: Some(mem),
            pool: Arc::clone(&self.state),
        })
    }
}

/// A pool-owned region lease; returns the region to the pool on drop.
pub struct ExecutableAlloc {
    mem: Option<ExecutableMemory>,
    pool: Arc<Mutex<PoolState>>,
}

impl ExecutableAlloc {
    pub fn memory(&self) -> &ExecutableMemory {
        self.mem.as_ref().unwrap()
    }

    pub fn memory_mut(&mut self) -> &mut ExecutableMemory {
        self.mem.as_mut().unwrap()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.memory().as_ptr()
    }
}

impl Drop for ExecutableAlloc {
    fn drop(&mut self) {
        if let Some(mut mem) = self.mem.take() {
            if mem.make_writable().is_ok() {
                if let Ok(mut state) = self.pool.lock() {
                    state.free.push(mem);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_memory() {
        let mem = ExecutableMemory::new(4096).unwrap();
        assert!(mem.size() >= 4096);
        assert!(!mem.is_executable());
    }

    #[test]
    fn test_write_then_seal() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.write(0, &[0x90, 0x90, 0xC3]).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.is_executable());
        assert!(mem.write(0, &[0x90]).is_err());
    }

    #[test]
    fn test_pool_recycles_regions() {
        let pool = ExecutablePool::new(4096);
        let first = pool.acquire(64).unwrap();
        let ptr = first.as_ptr();
        drop(first);
        let second = pool.acquire(64).unwrap();
        assert_eq!(second.as_ptr(), ptr);
    }
}
