//! Address-space reservation primitives.
//!
//! A [`Region`] is a contiguous range of virtual memory obtained from the
//! operating system. It may be reserved without backing (inaccessible until
//! committed) or reserved and committed in one step. The range is returned to
//! the OS when the handle is dropped.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
/// Reservation addresses are always multiples of this value.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A reserved range of address space.
///
/// The range is released when this handle is dropped.
pub struct Region {
    inner: os::RegionInner,
}

impl Region {
    /// Returns a pointer to the start of the range.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the range in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the range is empty. Reservations never are.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Makes `[offset, offset + len)` readable and writable.
    ///
    /// Both values are rounded out to page boundaries.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let (start, len) = self.page_span(offset, len)?;
        // SAFETY: the span lies inside the reservation owned by `self`.
        unsafe { self.inner.commit(start, len) }
    }

    /// Returns the pages of `[offset, offset + len)` to the OS, keeping the
    /// address range reserved. Contents are lost.
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let (start, len) = self.page_span(offset, len)?;
        // SAFETY: the span lies inside the reservation owned by `self`.
        unsafe { self.inner.decommit(start, len) }
    }

    fn page_span(&self, offset: usize, len: usize) -> io::Result<(usize, usize)> {
        let page = page_size();
        let start = offset & !(page - 1);
        let end = offset
            .checked_add(len)
            .map(|end| (end + page - 1) & !(page - 1))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "span overflows"))?;
        if end > self.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "span exceeds the reserved region",
            ));
        }
        Ok((start, end - start))
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Builder for a [`Region`].
#[derive(Debug, Clone)]
pub struct RegionOptions {
    len: usize,
    alignment: usize,
    commit: bool,
}

impl RegionOptions {
    /// Creates options with length 0, no alignment requirement beyond the
    /// allocation granularity, and no commit.
    pub const fn new() -> Self {
        Self {
            len: 0,
            alignment: 0,
            commit: false,
        }
    }

    /// Sets the length of the reservation in bytes. It is rounded up to a
    /// whole number of pages.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requires the start address to be a multiple of `alignment`.
    ///
    /// `alignment` must be a power of two. Values at or below the allocation
    /// granularity need no extra work.
    pub const fn align(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Commits the whole range as part of the reservation.
    pub const fn commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    /// Reserves the range.
    pub fn reserve(&self) -> io::Result<Region> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.alignment != 0 && !self.alignment.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let page = page_size();
        let len = self
            .len
            .checked_next_multiple_of(page)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length overflows"))?;

        let inner = if self.alignment > allocation_granularity() {
            // SAFETY: a fresh anonymous reservation does not alias anything.
            unsafe { os::RegionInner::reserve_aligned(len, self.alignment, self.commit)? }
        } else {
            // SAFETY: as above.
            unsafe { os::RegionInner::reserve(len, self.commit)? }
        };

        Ok(Region { inner })
    }
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self::new()
    }
}
