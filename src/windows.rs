use std::fs::File;
use std::mem::{self, ManuallyDrop};
use std::os::windows::io::{AsRawHandle, FromRawHandle, RawHandle};
use std::ptr;

use log::warn;
use winapi::ctypes::c_void;
use winapi::shared::basetsd::SIZE_T;
use winapi::shared::minwindef::DWORD;
use winapi::um::fileapi::FlushFileBuffers;
use winapi::um::handleapi::CloseHandle;
use winapi::um::memoryapi::{
    CreateFileMappingW, FlushViewOfFile, MapViewOfFile, UnmapViewOfFile, VirtualLock,
    VirtualUnlock, FILE_MAP_COPY, FILE_MAP_EXECUTE, FILE_MAP_READ, FILE_MAP_WRITE,
};
use winapi::um::sysinfoapi::GetSystemInfo;
use winapi::um::winnt::{
    HANDLE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_READONLY,
    PAGE_READWRITE, PAGE_WRITECOPY,
};

use crate::error::{Error, Result};
use crate::Protection;

impl Protection {

    /// Returns the `Protection` as a flag appropriate for a call to `CreateFileMapping`.
    fn as_mapping_flag(self) -> DWORD {
        let exec = self.contains(Protection::EXEC);
        if self.contains(Protection::COPY) {
            if exec { PAGE_EXECUTE_WRITECOPY } else { PAGE_WRITECOPY }
        } else if self.contains(Protection::READ_WRITE) {
            if exec { PAGE_EXECUTE_READWRITE } else { PAGE_READWRITE }
        } else if exec {
            PAGE_EXECUTE_READ
        } else {
            PAGE_READONLY
        }
    }

    /// Returns the `Protection` as a flag appropriate for a call to `MapViewOfFile`.
    fn as_view_flag(self) -> DWORD {
        let access = if self.contains(Protection::COPY) {
            FILE_MAP_COPY
        } else if self.contains(Protection::READ_WRITE) {
            FILE_MAP_WRITE
        } else {
            FILE_MAP_READ
        };
        if self.contains(Protection::EXEC) {
            access | FILE_MAP_EXECUTE
        } else {
            access
        }
    }
}

pub struct MmapInner {
    /// Duplicate of the caller's file handle, kept for `FlushFileBuffers` on
    /// read-write mappings only.
    file: Option<File>,
    mapping: HANDLE,
    ptr: *mut c_void,
    len: usize,
}

impl MmapInner {

    pub fn map(handle: RawHandle, prot: Protection, offset: u64, len: usize) -> Result<MmapInner> {
        let max_size = offset.checked_add(len as u64)
                             .ok_or_else(|| Error::offset_out_of_range("CreateFileMappingW"))?;

        let file = if prot.is_shared_write() {
            // The caller keeps ownership of `handle`; only the clone is ours to close.
            let borrowed = ManuallyDrop::new(unsafe { File::from_raw_handle(handle) });
            let owned = borrowed.try_clone()
                                .map_err(|source| Error::Map { call: "DuplicateHandle", source })?;
            Some(owned)
        } else {
            None
        };

        unsafe {
            let mapping = CreateFileMappingW(handle as HANDLE,
                                             ptr::null_mut(),
                                             prot.as_mapping_flag(),
                                             (max_size >> 32) as DWORD,
                                             (max_size & 0xffff_ffff) as DWORD,
                                             ptr::null());
            if mapping.is_null() {
                return Err(Error::map("CreateFileMappingW"));
            }

            let ptr = MapViewOfFile(mapping,
                                    prot.as_view_flag(),
                                    (offset >> 32) as DWORD,
                                    (offset & 0xffff_ffff) as DWORD,
                                    len as SIZE_T);
            if ptr.is_null() {
                let err = Error::map("MapViewOfFile");
                CloseHandle(mapping);
                return Err(err);
            }

            Ok(MmapInner { file, mapping, ptr, len })
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.flush_async()?;
        if let Some(ref file) = self.file {
            if unsafe { FlushFileBuffers(file.as_raw_handle() as HANDLE) } == 0 {
                return Err(Error::flush("FlushFileBuffers"));
            }
        }
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        let result = unsafe { FlushViewOfFile(self.ptr, self.len as SIZE_T) };
        if result != 0 {
            Ok(())
        } else {
            Err(Error::flush("FlushViewOfFile"))
        }
    }

    pub fn lock(&self) -> Result<()> {
        let result = unsafe { VirtualLock(self.ptr, self.len as SIZE_T) };
        if result != 0 {
            Ok(())
        } else {
            Err(Error::lock("VirtualLock"))
        }
    }

    pub fn unlock(&self) -> Result<()> {
        let result = unsafe { VirtualUnlock(self.ptr, self.len as SIZE_T) };
        if result != 0 {
            Ok(())
        } else {
            Err(Error::lock("VirtualUnlock"))
        }
    }

    /// Flushes, unmaps the view, then closes the mapping object.
    ///
    /// Every step runs even if an earlier one fails. The unmap error wins over the
    /// close error, which wins over the flush error; the others are logged.
    pub fn unmap(self) -> Result<()> {
        let flushed = self.flush();

        let unmapped = if unsafe { UnmapViewOfFile(self.ptr) } != 0 {
            Ok(())
        } else {
            Err(Error::unmap("UnmapViewOfFile"))
        };
        let closed = if unsafe { CloseHandle(self.mapping) } != 0 {
            Ok(())
        } else {
            Err(Error::unmap("CloseHandle"))
        };

        let mut first = None;
        for result in vec![unmapped, closed, flushed] {
            if let Err(err) = result {
                if first.is_none() {
                    first = Some(err);
                } else {
                    warn!("secondary error while releasing mapping: {}", err);
                }
            }
        }
        first.map_or(Ok(()), Err)
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

/// File offsets passed to `MapViewOfFile` must be multiples of the allocation
/// granularity, not of the (smaller) page size.
pub fn page_size() -> usize {
    unsafe {
        let mut info = mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwAllocationGranularity as usize
    }
}
