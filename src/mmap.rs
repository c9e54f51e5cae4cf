use std::ptr::null_mut;

use crate::error::ConfigError;

/// Reserved, lazily committed virtual memory backing the heap.
///
/// The mapping is over-reserved by one alignment unit so that `aligned()` can hand out a
/// region-aligned base address.
pub struct Mmap {
    start: *mut u8,
    end: *mut u8,
    size: usize,
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn new(size: usize) -> Result<Self, ConfigError> {
        unsafe {
            let map = libc::mmap(
                null_mut(),
                size as _,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                return Err(ConfigError::ReserveFailed(size));
            }
            Ok(Self {
                start: map as *mut u8,
                end: (map as usize + size) as *mut u8,
                size,
            })
        }
    }

    /// Return an `align` aligned address inside the mapping.
    pub fn aligned(&self, align: usize) -> usize {
        crate::utils::align_up(self.start as usize, align)
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub fn end(&self) -> *mut u8 {
        self.end
    }

    /// Give the pages back to the OS. The range stays reserved and reads back as zeroes.
    pub fn dontneed(page: usize, size: usize) {
        unsafe {
            libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
        }
    }

    pub fn commit(page: usize, size: usize) {
        unsafe {
            libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
        }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.start() as *mut _, self.size as _);
        }
    }
}
