use std::ptr::NonNull;

use object::Address;

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    // posix mmap and munmap
    // Safety: see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    /// Anonymous, zero-filled read/write mapping.
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmap with the same length
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// One contiguous anonymous mapping backing the whole collected heap.
/// Unmapped on drop.
#[derive(Debug)]
pub struct MappedRegion {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is plain memory; synchronisation of its contents is
// the job of whoever hands out addresses into it.
unsafe impl Send for MappedRegion {}
// SAFETY: see above
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    #[must_use]
    pub fn map(size: usize) -> Option<Self> {
        debug_assert!(size % OS_PAGE_SIZE == 0);
        // SAFETY: the null result is checked below
        let ptr = unsafe { unix::anonymous_mmap(size) };
        NonNull::new(ptr).map(|base| Self { base, size })
    }

    #[inline(always)]
    pub fn base(&self) -> Address {
        Address::from_ptr(self.base.as_ptr())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: base/size come from the successful mmap in `map`
        unsafe { unix::anonymous_munmap(self.base.as_ptr(), self.size) };
    }
}
