#![allow(clippy::cast_possible_truncation)]

use super::{BackingStore, BackingStoreProvider, VramAperture};
use crate::error::{MmError, MmResult};
use std::ptr;
use std::{io, slice};

/// Anonymous, page-aligned system memory. Unmapped on drop.
#[derive(Debug)]
pub struct SysmemPages {
    ptr: *mut u8,
    len: usize,
}

// The mapping is exclusively owned; access goes through &self / &mut self.
unsafe impl Send for SysmemPages {}
unsafe impl Sync for SysmemPages {}

impl SysmemPages {
    /// Maps `len` zeroed bytes.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero length, `Io` if `mmap` fails.
    pub fn new(len: usize, shared: bool) -> MmResult<Self> {
        if len == 0 {
            return Err(MmError::InvalidArgument(
                "cannot map a zero-length region".into(),
            ));
        }

        let visibility = if shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };

        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                visibility | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ret == libc::MAP_FAILED {
            return Err(MmError::Io(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ret.cast::<u8>(),
            len,
        })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_bounds(&self, offset: u64, len: usize) -> MmResult<usize> {
        let offset = usize::try_from(offset)
            .map_err(|_| MmError::InvalidArgument(format!("offset 0x{offset:x} out of range")))?;
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(offset),
            _ => Err(MmError::InvalidArgument(format!(
                "access 0x{offset:x}+0x{len:x} beyond mapping of 0x{:x} bytes",
                self.len
            ))),
        }
    }
}

impl Drop for SysmemPages {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.cast(), self.len) };
        if ret != 0 {
            log::error!(
                "munmap of {:p}+0x{:x} failed: {}",
                self.ptr,
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}

impl BackingStore for SysmemPages {
    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Hands out private anonymous mappings as shadow copies.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysmemProvider;

impl BackingStoreProvider for SysmemProvider {
    fn allocate(&self, size: usize) -> MmResult<Box<dyn BackingStore>> {
        Ok(Box::new(SysmemPages::new(size, false)?))
    }
}

/// Host memory standing in for the framebuffer BAR.
#[derive(Debug)]
pub struct HostAperture {
    pages: SysmemPages,
}

impl HostAperture {
    /// # Errors
    /// Fails if the backing mapping cannot be created.
    pub fn new(size: usize) -> MmResult<Self> {
        Ok(Self {
            pages: SysmemPages::new(size, true)?,
        })
    }
}

impl VramAperture for HostAperture {
    fn read(&self, offset: u64, buf: &mut [u8]) -> MmResult<()> {
        let start = self.pages.check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.pages.as_slice()[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> MmResult<()> {
        let start = self.pages.check_bounds(offset, data.len())?;
        self.pages.as_mut_slice()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.pages.len() as u64
    }
}
