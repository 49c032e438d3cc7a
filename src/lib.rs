//! Cross-platform memory-mapped file regions.
//!
//! A file, or a page-aligned region of one, is mapped into the address space and
//! exposed as a byte slice. Mappings may be read-only, read-write (writes reach the
//! file) or copy-on-write (writes stay in this process), each optionally executable.
//!
//! ```no_run
//! use std::fs::OpenOptions;
//! use filemap::{Mmap, Protection};
//!
//! # fn main() -> filemap::Result<()> {
//! let file = OpenOptions::new().read(true).write(true).open("data.bin").unwrap();
//! let mut mmap = unsafe { Mmap::map(&file, Protection::READ_WRITE)? };
//! mmap.write_at(b"hello", 0)?;
//! mmap.flush()?;
//! mmap.close()?;
//! # Ok(())
//! # }
//! ```

#![doc(html_root_url = "https://docs.rs/filemap/0.1.0")]

#[macro_use]
extern crate lazy_static;

mod error;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix::MmapInner;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows::MmapInner;

use std::borrow::Borrow;
use std::convert::TryFrom;
use std::fmt;
use std::fs::File;
use std::io;
use std::ops::{Deref, DerefMut};
use std::slice;

use bitflags::bitflags;
use log::{debug, error, trace};
use stable_deref_trait::StableDeref;

pub use crate::error::{Error, Result};

bitflags! {
    /// Memory protection and sharing mode of a mapping.
    ///
    /// The empty set is `READ_ONLY`. At most one of `READ_WRITE` and `COPY` may be
    /// set; `EXEC` combines with either, or with neither.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// Pages may be read. Writes through the mapping are rejected.
        const READ_ONLY = 0;

        /// Pages may be read or written; writes update the underlying file.
        const READ_WRITE = 1 << 1;

        /// Pages may be read or written; writes are private to this process and
        /// never reach the underlying file.
        const COPY = 1 << 2;

        /// Pages may also be executed.
        const EXEC = 1 << 3;
    }
}

impl Protection {

    /// Rejects combinations no backend can express.
    fn validate(self) -> Result<()> {
        let unknown = self.bits() & !Protection::all().bits() != 0;
        if unknown || self.contains(Protection::READ_WRITE | Protection::COPY) {
            Err(Error::InvalidProtection(self))
        } else {
            Ok(())
        }
    }

    /// Returns `true` if the mapping may be written through, either shared or copy-on-write.
    pub fn is_writable(self) -> bool {
        self.intersects(Protection::READ_WRITE | Protection::COPY)
    }

    /// Returns `true` if writes through the mapping propagate to the file.
    pub fn is_shared_write(self) -> bool {
        self.contains(Protection::READ_WRITE) && !self.contains(Protection::COPY)
    }
}

lazy_static! {
    static ref PAGE_SIZE: usize = native_page_size();
}

#[cfg(unix)]
fn native_page_size() -> usize {
    unix::page_size()
}

#[cfg(windows)]
fn native_page_size() -> usize {
    windows::page_size()
}

/// Returns the granularity that mapping offsets must be a multiple of.
///
/// On Windows this is the allocation granularity rather than the page size. The value
/// is read from the OS once per process.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Native descriptor handed to the mapping system call.
#[cfg(unix)]
pub type RawDescriptor = std::os::unix::io::RawFd;

/// Native descriptor handed to the mapping system call.
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawHandle;

/// A file-like object that can back a mapping.
///
/// The mapping never opens or closes the source; the caller keeps ownership of it.
pub trait MapSource {
    /// Returns the OS descriptor (unix) or handle (Windows) of the file.
    fn raw_descriptor(&self) -> RawDescriptor;

    /// Returns the current size of the file in bytes.
    fn map_len(&self) -> io::Result<u64>;
}

impl MapSource for File {
    #[cfg(unix)]
    fn raw_descriptor(&self) -> RawDescriptor {
        std::os::unix::io::AsRawFd::as_raw_fd(self)
    }

    #[cfg(windows)]
    fn raw_descriptor(&self) -> RawDescriptor {
        std::os::windows::io::AsRawHandle::as_raw_handle(self)
    }

    fn map_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl<'a, T> MapSource for &'a T where T: MapSource + ?Sized {
    fn raw_descriptor(&self) -> RawDescriptor {
        (**self).raw_descriptor()
    }

    fn map_len(&self) -> io::Result<u64> {
        (**self).map_len()
    }
}

/// Configuration for a file-backed memory map.
///
/// Defaults to a read-only mapping of the whole file starting at offset 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmapOptions {
    offset: u64,
    len: Option<usize>,
    prot: Protection,
}

impl MmapOptions {

    pub fn new() -> MmapOptions {
        MmapOptions::default()
    }

    /// Sets the file offset of the mapping. Must be a multiple of [`page_size`].
    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.offset = offset;
        self
    }

    /// Sets the length of the mapping in bytes.
    ///
    /// When unset, the length is the total size of the file, whatever the offset.
    pub fn len(&mut self, len: usize) -> &mut Self {
        self.len = Some(len);
        self
    }

    pub fn protection(&mut self, prot: Protection) -> &mut Self {
        self.prot = prot;
        self
    }

    /// Creates the mapping described by these options.
    ///
    /// # Safety
    ///
    /// See [`Mmap::map_region`].
    pub unsafe fn map<S>(&self, source: &S) -> Result<Mmap> where S: MapSource + ?Sized {
        Mmap::map_region(source, self.prot, self.offset, self.len)
    }
}

/// A memory-mapped region of a file.
///
/// The region is unmapped by [`Mmap::close`] or, failing that, when the value is dropped.
pub struct Mmap {
    inner: Option<MmapInner>,
    prot: Protection,
}

impl Mmap {

    /// Maps the entire current extent of a file.
    ///
    /// # Safety
    ///
    /// See [`Mmap::map_region`].
    pub unsafe fn map<S>(source: &S, prot: Protection) -> Result<Mmap> where S: MapSource + ?Sized {
        Mmap::map_region(source, prot, 0, None)
    }

    /// Maps `len` bytes of a file starting at `offset`.
    ///
    /// `offset` must be a multiple of [`page_size`]. A `len` of `None` maps as many
    /// bytes as the whole file holds, counted from `offset` rather than reduced by it.
    ///
    /// Only `READ_WRITE` needs a handle opened for writing; it fails with
    /// [`Error::Map`] against a read-only handle. `COPY` works on a read-only handle,
    /// since its writes never reach the file.
    ///
    /// # Safety
    ///
    /// The mapped bytes may change underneath the returned slices if the file is
    /// modified or truncated by this or another process, and touching pages past
    /// the end of the file faults. The caller must rule both out for the lifetime of
    /// the mapping.
    pub unsafe fn map_region<S>(source: &S,
                                prot: Protection,
                                offset: u64,
                                len: Option<usize>)
                                -> Result<Mmap> where S: MapSource + ?Sized {
        prot.validate()?;

        let page_size = page_size();
        if offset % page_size as u64 != 0 {
            return Err(Error::Alignment { offset, page_size });
        }

        let len = match len {
            Some(len) => len,
            None => {
                let size = source.map_len().map_err(Error::FileSize)?;
                usize::try_from(size).map_err(|_| {
                    Error::FileSize(io::Error::new(io::ErrorKind::InvalidData,
                                                   "file is too large to map"))
                })?
            }
        };

        let inner = MmapInner::map(source.raw_descriptor(), prot, offset, len)?;
        debug!("mapped {} bytes at {:p} from file offset {} ({:?})",
               len, inner.ptr(), offset, prot);
        Ok(Mmap { inner: Some(inner), prot })
    }

    /// Returns the mapped bytes, or an empty slice once the mapping is closed.
    pub fn data(&self) -> &[u8] {
        match self.inner {
            Some(ref inner) => unsafe { slice::from_raw_parts(inner.ptr(), inner.len()) },
            None => &[],
        }
    }

    /// Returns the mapped bytes for writing.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        if !self.prot.is_writable() {
            return Err(Error::ReadOnly);
        }
        Ok(self.bytes_mut())
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self.inner {
            Some(ref mut inner) => unsafe { slice::from_raw_parts_mut(inner.mut_ptr(), inner.len()) },
            None => &mut [],
        }
    }

    /// Copies bytes starting at `offset` into `dest`, returning how many were copied.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is greater than the length of the mapping.
    pub fn read_at(&self, dest: &mut [u8], offset: usize) -> usize {
        let src = &self.data()[offset..];
        let n = dest.len().min(src.len());
        dest[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Copies `src` into the mapping at `offset`, returning how many bytes were written.
    ///
    /// The write is visible immediately in memory. It reaches the file on
    /// [`Mmap::flush`] or whenever the OS decides to write the pages back.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is greater than the length of the mapping.
    pub fn write_at(&mut self, src: &[u8], offset: usize) -> Result<usize> {
        let dest = &mut self.data_mut()?[offset..];
        let n = src.len().min(dest.len());
        dest[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, MmapInner::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the byte at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn byte_at(&self, index: usize) -> u8 {
        self.data()[index]
    }

    pub fn protection(&self) -> Protection {
        self.prot
    }

    /// Asks the OS to keep the mapped pages resident in physical memory.
    pub fn lock(&self) -> Result<()> {
        trace!("locking {} mapped bytes", self.len());
        self.inner()?.lock()
    }

    /// Reverses the effect of [`Mmap::lock`].
    pub fn unlock(&self) -> Result<()> {
        trace!("unlocking {} mapped bytes", self.len());
        self.inner()?.unlock()
    }

    /// Writes modified pages back to the file and waits for the write to complete.
    ///
    /// For read-write mappings the file's own buffers are made durable as well.
    pub fn flush(&self) -> Result<()> {
        trace!("flushing {} mapped bytes", self.len());
        self.inner()?.flush()
    }

    /// Starts writing modified pages back to the file without waiting for completion.
    pub fn flush_async(&self) -> Result<()> {
        trace!("scheduling flush of {} mapped bytes", self.len());
        self.inner()?.flush_async()
    }

    /// Unmaps the region.
    ///
    /// The region is detached before it is released, so the mapping reads as empty
    /// afterwards even if releasing fails. Closing an already closed mapping is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(inner) => {
                debug!("unmapping {} bytes at {:p}", inner.len(), inner.ptr());
                inner.unmap()
            }
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    fn inner(&self) -> Result<&MmapInner> {
        self.inner.as_ref().ok_or(Error::Closed)
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("unable to unmap mmap: {}", err);
        }
    }
}

impl fmt::Debug for Mmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mmap")
         .field("ptr", &self.inner.as_ref().map(MmapInner::ptr))
         .field("len", &self.len())
         .field("protection", &self.prot)
         .finish()
    }
}

impl Deref for Mmap {

    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

/// # Panics
///
/// Panics if the mapping is read-only.
impl DerefMut for Mmap {

    fn deref_mut(&mut self) -> &mut [u8] {
        assert!(self.prot.is_writable(), "cannot write through a read-only mapping");
        self.bytes_mut()
    }
}

impl AsRef<[u8]> for Mmap {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl Borrow<[u8]> for Mmap {
    fn borrow(&self) -> &[u8] {
        self.data()
    }
}

// The slice points into the mapping, not into the `Mmap` value, so moving the
// handle leaves it valid.
unsafe impl StableDeref for Mmap { }
