use std::convert::TryFrom;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::error::{Error, Result};
use crate::Protection;

impl Protection {

    /// Returns the `Protection` value as a POSIX protection flag.
    fn as_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_READ;
        if self.is_writable() { prot |= libc::PROT_WRITE }
        if self.contains(Protection::EXEC) { prot |= libc::PROT_EXEC }
        prot
    }

    /// Returns the `Protection` value as a POSIX sharing flag.
    fn as_flag(self) -> libc::c_int {
        if self.contains(Protection::COPY) {
            libc::MAP_PRIVATE
        } else {
            libc::MAP_SHARED
        }
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {

    pub fn map(fd: RawFd, prot: Protection, offset: u64, len: usize) -> Result<MmapInner> {
        // `off_t` is 32 bits wide on some targets; never let the offset wrap.
        let offset = libc::off_t::try_from(offset).map_err(|_| Error::offset_out_of_range("mmap"))?;
        let ptr = unsafe {
            libc::mmap(ptr::null_mut(),
                       len as libc::size_t,
                       prot.as_prot(),
                       prot.as_flag(),
                       fd,
                       offset)
        };

        if ptr == libc::MAP_FAILED {
            Err(Error::map("mmap"))
        } else {
            Ok(MmapInner { ptr, len })
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.msync(libc::MS_SYNC)
    }

    pub fn flush_async(&self) -> Result<()> {
        self.msync(libc::MS_ASYNC)
    }

    fn msync(&self, flags: libc::c_int) -> Result<()> {
        let result = unsafe { libc::msync(self.ptr, self.len as libc::size_t, flags) };
        if result == 0 {
            Ok(())
        } else {
            Err(Error::flush("msync"))
        }
    }

    pub fn lock(&self) -> Result<()> {
        let result = unsafe { libc::mlock(self.ptr, self.len as libc::size_t) };
        if result == 0 {
            Ok(())
        } else {
            Err(Error::lock("mlock"))
        }
    }

    pub fn unlock(&self) -> Result<()> {
        let result = unsafe { libc::munlock(self.ptr, self.len as libc::size_t) };
        if result == 0 {
            Ok(())
        } else {
            Err(Error::lock("munlock"))
        }
    }

    /// Releases the mapping. Consumes the inner state so it can only happen once.
    pub fn unmap(self) -> Result<()> {
        let result = unsafe { libc::munmap(self.ptr, self.len as libc::size_t) };
        if result == 0 {
            Ok(())
        } else {
            Err(Error::unmap("munmap"))
        }
    }

    pub fn ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    pub fn mut_ptr(&mut self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

unsafe impl Sync for MmapInner { }
unsafe impl Send for MmapInner { }

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(size > 0, "unable to query page size: {}", io::Error::last_os_error());
    size as usize
}
