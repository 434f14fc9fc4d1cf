use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

const fn prot_for(commit: bool) -> libc::c_int {
    if commit {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    }
}

unsafe fn map(len: usize, commit: bool) -> io::Result<*mut libc::c_void> {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    if !commit {
        flags |= MAP_NORESERVE;
    }

    let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot_for(commit), flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(ptr)
}

unsafe fn unmap(addr: usize, len: usize) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    if unsafe { libc::munmap(addr as *mut libc::c_void, len) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub struct RegionInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl RegionInner {
    /// Reserves `len` bytes anywhere in the address space.
    pub unsafe fn reserve(len: usize, commit: bool) -> io::Result<Self> {
        let ptr = unsafe { map(len, commit)? };
        Ok(Self { ptr, len })
    }

    /// Reserves `len` bytes starting at a multiple of `alignment`.
    ///
    /// Maps `len + alignment` bytes and unmaps the slop on both sides. `len`
    /// and `alignment` must be page multiples.
    pub unsafe fn reserve_aligned(len: usize, alignment: usize, commit: bool) -> io::Result<Self> {
        debug_assert_eq!(len % page_size(), 0);
        let padded = len
            .checked_add(alignment)
            .ok_or_else(|| Error::new(io::ErrorKind::InvalidInput, "aligned length overflows"))?;
        let base = unsafe { map(padded, commit)? } as usize;
        let aligned = (base + alignment - 1) & !(alignment - 1);

        let head = aligned - base;
        if let Err(err) = unsafe { unmap(base, head) } {
            // Best effort; the mapping is unusable either way.
            let _ = unsafe { unmap(base, padded) };
            return Err(err);
        }
        let tail = padded - head - len;
        if let Err(err) = unsafe { unmap(aligned + len, tail) } {
            let _ = unsafe { unmap(aligned, len + tail) };
            return Err(err);
        }

        Ok(Self {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        if unsafe { libc::mprotect(addr.cast(), len, prot_for(true)) } != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        if unsafe { libc::madvise(addr.cast(), len, libc::MADV_DONTNEED) } != 0 {
            return Err(Error::last_os_error());
        }
        if unsafe { libc::mprotect(addr.cast(), len, prot_for(false)) } != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn ptr(&self) -> *mut u8 {
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
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}
