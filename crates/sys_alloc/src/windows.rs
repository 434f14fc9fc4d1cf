use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity.
///
/// `VirtualAlloc` reservations start at multiples of this value (typically
/// 64KB), which is often larger than the page size.
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

const fn flags_for(commit: bool) -> (u32, u32) {
    if commit {
        (MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
    } else {
        (MEM_RESERVE, PAGE_NOACCESS)
    }
}

pub struct RegionInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl RegionInner {
    pub unsafe fn reserve(len: usize, commit: bool) -> io::Result<Self> {
        let (kind, protect) = flags_for(commit);
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, kind, protect) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    /// Windows cannot release part of a reservation, so probe for an aligned
    /// address with an oversized reservation, free it, and reserve exactly
    /// there. Another thread may take the address in between; retry a few
    /// times before giving up.
    pub unsafe fn reserve_aligned(len: usize, alignment: usize, commit: bool) -> io::Result<Self> {
        let padded = len
            .checked_add(alignment)
            .ok_or_else(|| Error::new(io::ErrorKind::InvalidInput, "aligned length overflows"))?;
        let (kind, protect) = flags_for(commit);

        for _ in 0..8 {
            let probe = unsafe { VirtualAlloc(ptr::null(), padded, MEM_RESERVE, PAGE_NOACCESS) };
            if probe.is_null() {
                return Err(Error::last_os_error());
            }
            let aligned = ((probe as usize) + alignment - 1) & !(alignment - 1);
            unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

            let ptr = unsafe { VirtualAlloc(aligned as *const _, len, kind, protect) };
            if !ptr.is_null() {
                return Ok(Self { ptr, len });
            }
        }

        Err(Error::new(
            io::ErrorKind::AddrInUse,
            "could not obtain an aligned reservation",
        ))
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        let ptr = unsafe { VirtualAlloc(addr.cast(), len, MEM_COMMIT, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        if unsafe { VirtualFree(addr.cast(), len, MEM_DECOMMIT) } == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}
