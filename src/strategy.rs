use std::{mem, ptr::NonNull};

use crate::{checked_round_up_to_page_size, sys, trap, Access, Reservation};

/// Decides how a slot inside a [`Reservation`] becomes writable before an element is placed in
/// it, and how the reservation's backing is thrown away again.
///
/// ## Safety
///
/// After [`emplace`](CommitStrategy::emplace) returns, the slot must hold `value` and every page
/// the slot touches must stay readable and writable until the next
/// [`invalidate`](CommitStrategy::invalidate) or until the reservation is released.
pub unsafe trait CommitStrategy {
    /// The access new reservations are made with.
    const INITIAL_ACCESS: Access;

    /// Makes `slot` accessible and moves `value` into it.
    ///
    /// ## Safety
    ///
    /// `slot` must be aligned for `T` and lie entirely within `reservation`, which must have been
    /// reserved with [`INITIAL_ACCESS`](CommitStrategy::INITIAL_ACCESS) and only ever been touched
    /// by this strategy.
    unsafe fn emplace<T>(&mut self, reservation: &Reservation, slot: NonNull<T>, value: T);

    /// Discards all physical backing of `reservation`, returning it to its freshly reserved
    /// state. Whatever was stored in it is lost.
    fn invalidate(&mut self, reservation: &Reservation);
}

fn uncommit_all(reservation: &Reservation, access: Access) {
    if reservation.is_empty() {
        return;
    }

    if let Err(err) = unsafe { sys::uncommit(reservation.base(), reservation.len(), access) } {
        panic!(
            "Failed to uncommit {} bytes at {:p}: {err}",
            reservation.len(),
            reservation.base()
        );
    }
}

// === DemandPaged === //

/// Relies on the OS to back pages on first touch. Appending is a plain write.
///
/// On Windows there is no way to get accessible memory without committing it, so the whole
/// reservation is committed up front and counts against the commit limit in full, even though
/// pages are still only backed when touched. Prefer [`FaultTrapped`] or [`Precommit`] there for
/// large ceilings.
#[derive(Debug, Default, Copy, Clone)]
pub struct DemandPaged;

unsafe impl CommitStrategy for DemandPaged {
    const INITIAL_ACCESS: Access = Access::ReadWrite;

    unsafe fn emplace<T>(&mut self, _reservation: &Reservation, slot: NonNull<T>, value: T) {
        slot.as_ptr().write(value);
    }

    fn invalidate(&mut self, reservation: &Reservation) {
        // Remapping keeps the range readable and writable, so the next append can simply touch it
        // again.
        uncommit_all(reservation, Access::ReadWrite);
    }
}

// === FaultTrapped === //

/// Reserves inaccessible memory and commits it from the protection fault raised by the write
/// into a slot, after which the write is resumed.
///
/// Only faults inside the reservation being written to are handled, and only once per write:
/// a second fault after committing, or a failure to commit, aborts the process. Any other fault
/// is forwarded to whichever handler was installed before.
#[derive(Debug, Clone)]
pub struct FaultTrapped {
    _private: (),
}

impl FaultTrapped {
    /// Installs the process-wide fault hook if it isn't already.
    pub fn new() -> Self {
        sys::install_fault_handler();
        Self { _private: () }
    }
}

impl Default for FaultTrapped {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl CommitStrategy for FaultTrapped {
    const INITIAL_ACCESS: Access = Access::None;

    unsafe fn emplace<T>(&mut self, reservation: &Reservation, slot: NonNull<T>, value: T) {
        trap::armed(reservation, slot.cast(), mem::size_of::<T>(), || {
            slot.as_ptr().write(value);
        });
    }

    fn invalidate(&mut self, reservation: &Reservation) {
        uncommit_all(reservation, Access::None);
    }
}

// === Precommit === //

/// Reserves inaccessible memory and commits the pages a slot needs before writing to it.
///
/// Commits only ever grow a single committed prefix, so each page is committed once between
/// invalidations.
#[derive(Debug, Default, Clone)]
pub struct Precommit {
    committed: usize,
}

impl Precommit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of the committed prefix, in bytes.
    pub fn committed(&self) -> usize {
        self.committed
    }
}

unsafe impl CommitStrategy for Precommit {
    const INITIAL_ACCESS: Access = Access::None;

    unsafe fn emplace<T>(&mut self, reservation: &Reservation, slot: NonNull<T>, value: T) {
        let base = reservation.base().as_ptr();
        let slot_end = slot.as_ptr() as usize - base as usize + mem::size_of::<T>();

        if slot_end > self.committed {
            let target = match checked_round_up_to_page_size(slot_end) {
                Some(target) => target.min(reservation.len()),
                None => reservation.len(),
            };
            let start = NonNull::new_unchecked(base.add(self.committed));

            tracing::trace!("Committing {} bytes at {start:p}", target - self.committed);
            if let Err(err) = sys::commit(start, target - self.committed) {
                panic!(
                    "Failed to commit {} bytes at {start:p}: {err}",
                    target - self.committed
                );
            }
            self.committed = target;
        }

        slot.as_ptr().write(value);
    }

    fn invalidate(&mut self, reservation: &Reservation) {
        uncommit_all(reservation, Access::None);
        self.committed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_size;

    fn slot_at<T>(reservation: &Reservation, offset: usize) -> NonNull<T> {
        unsafe { NonNull::new_unchecked(reservation.base().as_ptr().add(offset)).cast() }
    }

    #[test]
    fn precommit_grows_by_whole_pages() {
        let reservation = Reservation::acquire(page_size() * 4, Precommit::INITIAL_ACCESS);
        let mut strategy = Precommit::new();

        unsafe { strategy.emplace(&reservation, slot_at::<u64>(&reservation, 0), 1) };
        assert_eq!(strategy.committed(), page_size());

        // Still inside the first page.
        unsafe { strategy.emplace(&reservation, slot_at::<u64>(&reservation, 8), 2) };
        assert_eq!(strategy.committed(), page_size());

        // Straddles the second and third page.
        let straddle = page_size() * 3 - 4;
        unsafe { strategy.emplace(&reservation, slot_at::<[u8; 8]>(&reservation, straddle), [9; 8]) };
        assert_eq!(strategy.committed(), page_size() * 4);

        unsafe {
            assert_eq!(slot_at::<u64>(&reservation, 0).as_ptr().read(), 1);
            assert_eq!(slot_at::<u64>(&reservation, 8).as_ptr().read(), 2);
            assert_eq!(slot_at::<[u8; 8]>(&reservation, straddle).as_ptr().read(), [9; 8]);
        }

        strategy.invalidate(&reservation);
        assert_eq!(strategy.committed(), 0);
    }

    #[test]
    fn fault_trapped_commits_on_write() {
        let reservation = Reservation::acquire(page_size() * 3, FaultTrapped::INITIAL_ACCESS);
        let mut strategy = FaultTrapped::new();

        let straddle = page_size() * 2 - 2;
        unsafe {
            strategy.emplace(&reservation, slot_at::<u32>(&reservation, 0), 5);
            strategy.emplace(&reservation, slot_at::<[u8; 4]>(&reservation, straddle), [1, 2, 3, 4]);

            assert_eq!(slot_at::<u32>(&reservation, 0).as_ptr().read(), 5);
            assert_eq!(slot_at::<[u8; 4]>(&reservation, straddle).as_ptr().read(), [1, 2, 3, 4]);
        }

        strategy.invalidate(&reservation);

        // Inaccessible again, so writing has to go through the trap once more.
        unsafe {
            strategy.emplace(&reservation, slot_at::<u32>(&reservation, 0), 6);
            assert_eq!(slot_at::<u32>(&reservation, 0).as_ptr().read(), 6);
        }
    }

    #[test]
    fn demand_paged_reads_zero_after_invalidate() {
        let reservation = Reservation::acquire(page_size() * 2, DemandPaged::INITIAL_ACCESS);
        let mut strategy = DemandPaged;

        unsafe { strategy.emplace(&reservation, slot_at::<u64>(&reservation, page_size()), 42) };
        strategy.invalidate(&reservation);

        assert_eq!(unsafe { slot_at::<u64>(&reservation, page_size()).as_ptr().read() }, 0);
    }
}
