use std::ptr::NonNull;

use crate::{checked_round_up_to_page_size, page_size, sys, Access, SystemError};

/// An owned range of reserved address space, released when dropped.
///
/// A reservation of zero bytes never touches the OS. Its [`base`](Reservation::base) is a dangling
/// pointer that must not be dereferenced.
#[derive(Debug)]
pub struct Reservation {
    base: NonNull<u8>,
    len: usize,
}

impl Reservation {
    pub fn empty() -> Self {
        Self {
            base: NonNull::dangling(),
            len: 0,
        }
    }

    /// Reserves at least `size` bytes, rounded up to whole pages.
    ///
    /// # Panics
    ///
    /// Panics if the rounded size overflows or the OS cannot provide the address space. There is
    /// no fallback allocation strategy.
    pub fn acquire(size: usize, access: Access) -> Self {
        match Self::try_acquire(size, access) {
            Ok(reservation) => reservation,
            Err(err) => panic!("Failed to reserve {size} bytes of address space: {err}"),
        }
    }

    /// Like [`acquire`](Reservation::acquire) but hands OS failures back to the caller.
    ///
    /// # Panics
    ///
    /// Panics if `size` rounded up to a page boundary overflows `isize::MAX`.
    pub fn try_acquire(size: usize, access: Access) -> Result<Self, SystemError> {
        if size == 0 {
            return Ok(Self::empty());
        }

        let len = match checked_round_up_to_page_size(size) {
            Some(len) if len <= isize::MAX as usize => len,
            _ => panic!("Reservation of {size} bytes overflows isize::MAX"),
        };

        let base = sys::reserve(len, access)?;
        tracing::debug!(
            "Reserved {len} bytes ({} pages, {access:?}) at {base:p}",
            len / page_size()
        );
        Ok(Self { base, len })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Length in bytes. Always a multiple of [`page_size`].
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        !self.is_empty() && addr >= start && addr - start < self.len
    }

    /// Bytes of this reservation currently backed by physical memory.
    pub fn resident_bytes(&self) -> usize {
        if self.is_empty() {
            return 0;
        }

        match unsafe { sys::resident_bytes(self.base, self.len) } {
            Ok(bytes) => bytes,
            Err(err) => panic!("Failed to query residency of {:p}: {err}", self.base),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }

        tracing::debug!("Releasing {} bytes at {:p}", self.len, self.base);
        if let Err(err) = unsafe { sys::unreserve(self.base, self.len) } {
            panic!("Failed to unreserve {:p}: {err}", self.base);
        }
    }
}
