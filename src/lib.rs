//! Resvec provides [`ReservedVec`], a fixed-ceiling growable array whose storage comes straight
//! from the operating system's virtual memory facility instead of the heap.
//!
//! Address space for every element the array could ever hold is [reserved](reserve) once, up
//! front, and physical memory is only attached as elements are appended. The array never moves,
//! so references into it stay valid across growth, and resident memory tracks the used prefix
//! rather than the declared ceiling.
//!
//! ## Terminology
//!
//! A given region in memory can be reserved, committed, or backed.
//!
//! - A **reserved** region of memory is a region which is guaranteed not to be allocated by any
//!   other system allocation mechanism. Reserving does not attach physical memory.
//!
//! - A **committed** region of memory is readable and writable. The operating system guarantees
//!   that the first access to it will be backed by some memory.
//!
//! - A **backed** region of memory is backed by RAM or a page file and is thus taking "real"
//!   hardware resources.
//!
//! How a slot goes from reserved to committed is up to the array's [`CommitStrategy`]:
//!
//! - [`DemandPaged`] reserves accessible memory and lets the OS back pages on first touch.
//! - [`FaultTrapped`] reserves inaccessible memory and commits pages from inside a protection
//!   fault hook, resuming the faulting write.
//! - [`Precommit`] reserves inaccessible memory and commits the slot's pages before writing.
//!
//! Regions are described at page-level granularity, whose size varies between operating systems.
//! This value can be queried at runtime through [`page_size`].
//!
//! Violated preconditions (appending past capacity, indexing past the length, the OS refusing to
//! reserve or release memory) are treated as bugs and panic. There is no recovery path.

use std::sync::atomic::{AtomicUsize, Ordering};

mod reservation;
mod strategy;
mod sys;
mod trap;
mod vec;

#[cfg(test)]
mod tests;

pub use reservation::Reservation;
pub use strategy::{CommitStrategy, DemandPaged, FaultTrapped, Precommit};
pub use sys::{
    commit, install_fault_handler, reserve, resident_bytes, uncommit, unreserve, SystemError,
};
pub use vec::ReservedVec;

cfgenius::cond! {
    if cfg(feature = "fault-trap") {
        /// The commit strategy used by [`ReservedVec::new`].
        pub type DefaultStrategy = FaultTrapped;
    } else if cfg(feature = "precommit") {
        /// The commit strategy used by [`ReservedVec::new`].
        pub type DefaultStrategy = Precommit;
    } else if cfg(windows) {
        /// The commit strategy used by [`ReservedVec::new`].
        ///
        /// Windows never hands out accessible memory without committing it, so reserved pages are
        /// committed from the access violation they raise.
        pub type DefaultStrategy = FaultTrapped;
    } else {
        /// The commit strategy used by [`ReservedVec::new`].
        ///
        /// Anonymous mappings are demand paged, so nothing needs to happen before a write.
        pub type DefaultStrategy = DemandPaged;
    }
}

/// The access a range of reserved memory has before anything is explicitly committed in it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    /// Any access faults until the range is [committed](commit).
    None,
    /// Reads and writes succeed immediately; physical memory is attached on first touch.
    ReadWrite,
}

/// The OS page size in bytes, queried once and cached.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let mut size = PAGE_SIZE.load(Ordering::Relaxed);
    if size == 0 {
        size = sys::page_size_u32() as usize;
        debug_assert!(size.is_power_of_two());
        PAGE_SIZE.store(size, Ordering::Relaxed);
    }
    size
}

/// Rounds `size` up to the next multiple of [`page_size`].
///
/// # Panics
///
/// Panics if the rounded size does not fit in a `usize`.
pub fn round_up_to_page_size(size: usize) -> usize {
    match checked_round_up_to_page_size(size) {
        Some(size) => size,
        None => panic!("rounding {size} bytes up to a page boundary overflows usize"),
    }
}

pub(crate) fn checked_round_up_to_page_size(size: usize) -> Option<usize> {
    let mask = page_size() - 1;
    Some(size.checked_add(mask)? & !mask)
}

pub(crate) fn round_down_to_page_size(addr: usize) -> usize {
    addr & !(page_size() - 1)
}
