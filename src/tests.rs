use std::ptr::NonNull;

use super::*;

#[test]
fn reserve_one_page() {
    let base = reserve(page_size(), Access::None).unwrap();
    unsafe { unreserve(base, page_size()) }.unwrap();
}

#[test]
fn reserve_many_pages() {
    let size = page_size() * 1000;
    let base = reserve(size, Access::ReadWrite).unwrap();
    unsafe { unreserve(base, size) }.unwrap();
}

#[test]
fn reads_zero() {
    let size = page_size() * 1000;
    let page_base = reserve(size, Access::ReadWrite).unwrap();
    let page_slice = unsafe { std::slice::from_raw_parts(page_base.as_ptr(), size) };

    assert!(page_slice.iter().all(|&v| v == 0));
    unsafe { unreserve(page_base, size) }.unwrap();
}

#[test]
fn no_commit_on_reserve() {
    let alloc_size = round_up_to_page_size(10usize.pow(8));

    println!("The page size is {}", page_size());

    // Windows commits readable memory up front, so only inaccessible reservations are free there.
    let accesses: &[Access] = if cfg!(windows) {
        &[Access::None]
    } else {
        &[Access::None, Access::ReadWrite]
    };

    for &access in accesses {
        let base = reserve(alloc_size, access).unwrap();
        assert_eq!(unsafe { resident_bytes(base, alloc_size) }.unwrap(), 0);
        unsafe { unreserve(base, alloc_size) }.unwrap();
    }
}

#[test]
#[cfg(target_pointer_width = "64")]
fn residency_of_huge_reservation() {
    // 1 TiB: far more pages than a residency vector could reasonably hold in one piece.
    let alloc_size = 1usize << 40;

    let base = reserve(alloc_size, Access::None).unwrap();
    assert_eq!(unsafe { resident_bytes(base, alloc_size) }.unwrap(), 0);

    // Touch one page far into the range.
    let page = NonNull::new(unsafe { base.as_ptr().add(alloc_size / 2 + page_size() * 3) }).unwrap();
    unsafe { commit(page, page_size()) }.unwrap();
    unsafe { *page.as_ptr() = 1 };
    assert_eq!(unsafe { resident_bytes(base, alloc_size) }.unwrap(), page_size());

    unsafe { unreserve(base, alloc_size) }.unwrap();

    let mut values = ReservedVec::<u64, _>::with_strategy(1 << 37, Precommit::new());
    values.push(9);
    assert_eq!(values.resident_bytes(), page_size());
}

#[test]
fn commit_and_write() {
    println!("The page size is {}", page_size());

    for page_count in [1, 2, 4] {
        let reserve_size = page_size() * page_count;

        for page_offset in 0..page_count {
            // Allocate
            let base = reserve(reserve_size, Access::None).unwrap();
            let page = NonNull::new(unsafe { base.as_ptr().add(page_size() * page_offset) }).unwrap();

            for _ in 0..10 {
                // Commit and check
                unsafe { commit(page, page_size()) }.unwrap();
                unsafe { *page.as_ptr() = 4 };
                assert_eq!(unsafe { *page.as_ptr() }, 4);

                // Committing again keeps the contents
                unsafe { commit(page, page_size()) }.unwrap();
                assert_eq!(unsafe { *page.as_ptr() }, 4);

                // Uncommit and check
                unsafe { uncommit(page, page_size(), Access::ReadWrite) }.unwrap();
                assert_eq!(unsafe { *page.as_ptr() }, 0);
                unsafe { uncommit(page, page_size(), Access::None) }.unwrap();
            }

            // Unreserve
            unsafe { unreserve(base, reserve_size) }.unwrap();
        }
    }
}

#[test]
fn rounds_to_pages() {
    assert_eq!(round_up_to_page_size(0), 0);
    assert_eq!(round_up_to_page_size(1), page_size());
    assert_eq!(round_up_to_page_size(page_size()), page_size());
    assert_eq!(round_up_to_page_size(page_size() + 1), page_size() * 2);
    assert_eq!(round_down_to_page_size(page_size() * 3 - 1), page_size() * 2);
    assert_eq!(checked_round_up_to_page_size(usize::MAX), None);
}

#[test]
#[should_panic(expected = "overflows usize")]
fn rounding_overflow_panics() {
    round_up_to_page_size(usize::MAX);
}

fn lazily_commits<S: CommitStrategy>(strategy: S) {
    let mut values = ReservedVec::<u64, S>::with_strategy(10_000, strategy);
    assert_eq!(values.resident_bytes(), 0);

    values.push(1);

    // A single element needs a single page, nowhere near the 10,000 reserved.
    let resident = values.resident_bytes();
    assert!(resident > 0);
    assert!(resident <= page_size() * 2, "{resident} bytes resident");

    for i in 0..10_000 {
        values.try_push(i).ok();
    }
    assert!(values.resident_bytes() >= 10_000 * 8 - page_size());

    values.reset();
    assert_eq!(values.resident_bytes(), 0);
}

#[test]
#[cfg(unix)]
fn demand_paged_commits_lazily() {
    lazily_commits(DemandPaged);
}

#[test]
fn fault_trapped_commits_lazily() {
    lazily_commits(FaultTrapped::new());
}

#[test]
fn precommit_commits_lazily() {
    lazily_commits(Precommit::new());
}

#[test]
#[cfg(windows)]
fn demand_paged_commits_everything_on_windows() {
    let values = ReservedVec::<u64, _>::with_strategy(10_000, DemandPaged);
    assert_eq!(values.resident_bytes(), round_up_to_page_size(10_000 * 8));
}
