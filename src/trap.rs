//! Per-thread bookkeeping for writes performed under [`FaultTrapped`](crate::FaultTrapped).
//!
//! A write is "armed" while it runs. The platform fault hook asks [`on_fault`] what to do with a
//! protection fault: faults inside the armed reservation get their pages committed and the
//! faulting instruction is resumed, once. Everything here may run inside a signal handler, so it
//! must not allocate, lock, or panic.

use std::{
    cell::Cell,
    ptr::NonNull,
    sync::atomic::{compiler_fence, Ordering},
};

use crate::{checked_round_up_to_page_size, round_down_to_page_size, sys, Reservation};

#[derive(Debug, Copy, Clone)]
struct Armed {
    region_start: usize,
    region_end: usize,
    slot_start: usize,
    slot_end: usize,
    fired: bool,
}

thread_local! {
    static ARMED: Cell<Option<Armed>> = const { Cell::new(None) };
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// The pages were committed; re-run the faulting instruction.
    Resumed,
    /// Not our fault. Hand it to whoever was installed before us.
    Foreign,
    /// Unrecoverable. The message is newline terminated.
    Fatal(&'static str),
}

struct Disarm;

impl Drop for Disarm {
    fn drop(&mut self) {
        compiler_fence(Ordering::SeqCst);
        ARMED.with(|armed| armed.set(None));
    }
}

/// Runs `f` with a trap armed over `slot_len` bytes at `slot` inside `reservation`.
///
/// ## Safety
///
/// The slot must lie within `reservation`, and the fault hook must already be installed.
pub(crate) unsafe fn armed<R>(
    reservation: &Reservation,
    slot: NonNull<u8>,
    slot_len: usize,
    f: impl FnOnce() -> R,
) -> R {
    let region_start = reservation.base().as_ptr() as usize;
    let slot_start = slot.as_ptr() as usize;
    let trap = Armed {
        region_start,
        region_end: region_start + reservation.len(),
        slot_start,
        slot_end: slot_start + slot_len,
        fired: false,
    };
    debug_assert!(trap.slot_start >= trap.region_start && trap.slot_end <= trap.region_end);

    ARMED.with(|armed| {
        assert!(armed.get().is_none(), "fault traps cannot be nested");
        armed.set(Some(trap));
    });

    let _disarm = Disarm;
    compiler_fence(Ordering::SeqCst);
    f()
}

/// Decides what to do about a protection fault at `addr` on the current thread.
pub(crate) fn on_fault(addr: usize) -> Resolution {
    ARMED
        .try_with(|armed| {
            let Some(mut trap) = armed.get() else {
                return Resolution::Foreign;
            };

            if addr < trap.region_start || addr >= trap.region_end {
                return Resolution::Foreign;
            }

            if trap.fired {
                return Resolution::Fatal("resvec: protection fault in a slot that was already committed\n");
            }

            trap.fired = true;
            armed.set(Some(trap));

            let start = round_down_to_page_size(trap.slot_start.min(addr));
            let end = checked_round_up_to_page_size(trap.slot_end.max(addr + 1))
                .unwrap_or(trap.region_end)
                .min(trap.region_end);

            let Some(start_ptr) = NonNull::new(start as *mut u8) else {
                return Resolution::Fatal("resvec: fault trap armed over a null region\n");
            };

            match unsafe { sys::commit(start_ptr, end - start) } {
                Ok(()) => Resolution::Resumed,
                Err(_) => Resolution::Fatal("resvec: failed to commit page from the fault hook\n"),
            }
        })
        .unwrap_or(Resolution::Foreign)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{page_size, Access};

    #[test]
    fn unarmed_faults_are_foreign() {
        assert_eq!(on_fault(0x1000), Resolution::Foreign);
    }

    #[test]
    fn commits_once_then_gives_up() {
        let reservation = Reservation::acquire(page_size() * 4, Access::None);
        let base = reservation.base();
        let slot = unsafe { NonNull::new_unchecked(base.as_ptr().add(page_size() + 8)) };
        let addr = slot.as_ptr() as usize;

        unsafe {
            armed(&reservation, slot, 8, || {
                assert_eq!(on_fault(addr), Resolution::Resumed);
                assert!(matches!(on_fault(addr), Resolution::Fatal(_)));
            });
        }

        // The hook committed the page, so this write goes through without a trap.
        unsafe { slot.cast::<u64>().as_ptr().write(7) };
        assert_eq!(unsafe { slot.cast::<u64>().as_ptr().read() }, 7);

        // Disarmed again.
        assert_eq!(on_fault(addr), Resolution::Foreign);
    }

    #[test]
    fn faults_outside_the_reservation_are_foreign() {
        let reservation = Reservation::acquire(page_size(), Access::None);
        let slot = reservation.base();
        let outside = reservation.base().as_ptr() as usize + reservation.len();

        unsafe {
            armed(&reservation, slot, 8, || {
                assert_eq!(on_fault(outside), Resolution::Foreign);
                assert_eq!(on_fault(outside - 1), Resolution::Resumed);
            });
        }
    }
}
