//! Executable memory for finalized images.
//!
//! [`ExecMemory::map`] copies an [`Image`] into a fresh anonymous mapping
//! and flips it from writable to executable, so no page is ever writable
//! and executable at the same time.  Raw OS calls are declared inline;
//! the crate stays free of C dependencies.
//!
//! The image must be position-independent (relative branches and
//! RIP-relative data) unless its base address was set to the address the
//! mapping will land at, which the caller generally cannot know up front.

use alloc::string::String;
use alloc::vec::Vec;

use crate::buffer::Image;
use crate::error::JitError;
use crate::operand::LabelId;

/// A block of executable memory holding one finalized image.
///
/// The mapping is freed on drop.  Function pointers obtained from
/// [`label_ptr`](Self::label_ptr) or [`symbol_ptr`](Self::symbol_ptr)
/// must not outlive it.
pub struct ExecMemory {
    ptr: *mut u8,
    len: usize,
    code_len: usize,
    labels: Vec<(LabelId, u64)>,
    symbols: Vec<(String, u64)>,
}

// The code is immutable once mapped read-execute.
unsafe impl Send for ExecMemory {}
unsafe impl Sync for ExecMemory {}

impl ExecMemory {
    /// Map `image` into executable memory.
    ///
    /// The bytes are copied into a read-write anonymous mapping, then the
    /// pages are re-protected to read-execute.
    ///
    /// # Errors
    ///
    /// [`JitError::ExecMap`] if the image is empty or the OS refuses the
    /// mapping or the protection change.
    pub fn map(image: &Image) -> Result<ExecMemory, JitError> {
        let code_len = image.len();
        if code_len == 0 {
            return Err(JitError::ExecMap {
                detail: "image is empty".into(),
            });
        }
        let len = code_len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let ptr = os::map_rw(len)?;
        // SAFETY: `ptr` is a fresh private mapping of `len >= code_len`
        // bytes that nothing else references.
        unsafe {
            core::ptr::copy_nonoverlapping(image.bytes().as_ptr(), ptr, code_len);
        }
        if let Err(e) = os::protect_rx(ptr, len) {
            // SAFETY: the mapping came from `map_rw` above.
            unsafe { os::unmap(ptr, len) };
            return Err(e);
        }
        Ok(ExecMemory {
            ptr,
            len,
            code_len,
            labels: image.labels().to_vec(),
            symbols: image.symbols().to_vec(),
        })
    }

    /// Pointer to the start of the code.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Length of the mapped code in bytes (excluding page padding).
    #[must_use]
    pub fn len(&self) -> usize {
        self.code_len
    }

    /// Whether the mapping holds no code.  Always false for a mapping
    /// that was successfully created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code_len == 0
    }

    /// Pointer to a bound label's position in the code.
    #[must_use]
    pub fn label_ptr(&self, label: LabelId) -> Option<*const u8> {
        self.labels
            .iter()
            .find(|(l, _)| *l == label)
            // SAFETY: finalize only records offsets inside the image.
            .map(|&(_, off)| unsafe { self.ptr.add(off as usize) } as *const u8)
    }

    /// Pointer to a named label's position in the code.
    #[must_use]
    pub fn symbol_ptr(&self, name: &str) -> Option<*const u8> {
        self.symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, off)| unsafe { self.ptr.add(off as usize) } as *const u8)
    }
}

impl Drop for ExecMemory {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: `ptr`/`len` describe a mapping we own exclusively.
            unsafe { os::unmap(self.ptr, self.len) };
        }
    }
}

const PAGE_SIZE: usize = 4096;

#[cfg(unix)]
mod os {
    use super::JitError;
    use alloc::format;

    const PROT_READ: i32 = 1;
    const PROT_WRITE: i32 = 2;
    const PROT_EXEC: i32 = 4;
    const MAP_PRIVATE: i32 = 0x02;
    // The anonymous-mapping flag differs between kernels: 0x20 on Linux,
    // 0x1000 (MAP_ANON) on the BSD family including macOS.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const MAP_ANONYMOUS: i32 = 0x20;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const MAP_ANONYMOUS: i32 = 0x1000;

    extern "C" {
        fn mmap(
            addr: *mut u8,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: i64,
        ) -> *mut u8;
        fn mprotect(addr: *mut u8, length: usize, prot: i32) -> i32;
        fn munmap(addr: *mut u8, length: usize) -> i32;
    }

    pub fn map_rw(len: usize) -> Result<*mut u8, JitError> {
        // SAFETY: anonymous private mapping, no fd, no fixed address.
        let ptr = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        // MAP_FAILED is (void*)-1.
        if ptr.is_null() || ptr as usize == usize::MAX {
            return Err(JitError::ExecMap {
                detail: format!("mmap of {} bytes failed", len),
            });
        }
        Ok(ptr)
    }

    pub fn protect_rx(ptr: *mut u8, len: usize) -> Result<(), JitError> {
        // SAFETY: `ptr`/`len` came from `map_rw`.
        if unsafe { mprotect(ptr, len, PROT_READ | PROT_EXEC) } != 0 {
            return Err(JitError::ExecMap {
                detail: "mprotect(PROT_READ|PROT_EXEC) failed".into(),
            });
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `ptr`/`len` must describe a live mapping returned by [`map_rw`].
    pub unsafe fn unmap(ptr: *mut u8, len: usize) {
        munmap(ptr, len);
    }
}

#[cfg(windows)]
mod os {
    use super::JitError;
    use alloc::format;

    const MEM_COMMIT_RESERVE: u32 = 0x3000;
    const MEM_RELEASE: u32 = 0x8000;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_EXECUTE_READ: u32 = 0x20;

    extern "system" {
        fn VirtualAlloc(addr: *mut u8, size: usize, alloc_type: u32, protect: u32) -> *mut u8;
        fn VirtualProtect(addr: *mut u8, size: usize, protect: u32, old: *mut u32) -> i32;
        fn VirtualFree(addr: *mut u8, size: usize, free_type: u32) -> i32;
    }

    pub fn map_rw(len: usize) -> Result<*mut u8, JitError> {
        // SAFETY: fresh reservation, no fixed address.
        let ptr =
            unsafe { VirtualAlloc(core::ptr::null_mut(), len, MEM_COMMIT_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(JitError::ExecMap {
                detail: format!("VirtualAlloc of {} bytes failed", len),
            });
        }
        Ok(ptr)
    }

    pub fn protect_rx(ptr: *mut u8, len: usize) -> Result<(), JitError> {
        let mut old = 0u32;
        // SAFETY: `ptr`/`len` came from `map_rw`.
        if unsafe { VirtualProtect(ptr, len, PAGE_EXECUTE_READ, &mut old) } == 0 {
            return Err(JitError::ExecMap {
                detail: "VirtualProtect(PAGE_EXECUTE_READ) failed".into(),
            });
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `ptr` must be a live allocation returned by [`map_rw`].
    pub unsafe fn unmap(ptr: *mut u8, _len: usize) {
        VirtualFree(ptr, 0, MEM_RELEASE);
    }
}

#[cfg(not(any(unix, windows)))]
mod os {
    use super::JitError;

    pub fn map_rw(_len: usize) -> Result<*mut u8, JitError> {
        Err(JitError::ExecMap {
            detail: "no executable-memory support on this platform".into(),
        })
    }

    pub fn protect_rx(_ptr: *mut u8, _len: usize) -> Result<(), JitError> {
        unreachable!("map_rw never succeeds on this platform")
    }

    pub unsafe fn unmap(_ptr: *mut u8, _len: usize) {}
}
