// win32 quick reference:
// https://docs.rs/windows-sys/latest/windows_sys/index.html
// https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/
// https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc
// https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree
// https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualquery
// https://learn.microsoft.com/en-us/windows/win32/api/errhandlingapi/nf-errhandlingapi-addvectoredexceptionhandler

use std::{
    mem::{self, MaybeUninit},
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use lazy_static::lazy_static;
use windows_sys::Win32::{
    Foundation::{GetLastError, EXCEPTION_ACCESS_VIOLATION},
    System::{
        Diagnostics::Debug::{AddVectoredExceptionHandler, EXCEPTION_POINTERS},
        Memory::{
            VirtualAlloc, VirtualFree, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
            MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    },
};

use crate::{
    page_size,
    trap::{self, Resolution},
    Access,
};

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

#[derive(Debug, Clone, thiserror::Error)]
#[error("system error {0}")]
pub struct SystemError(u32);

impl SystemError {
    fn from_errno() -> Self {
        Self(unsafe {
            // Safety: `GetLastError`'s internal errno is stored using TLS.
            GetLastError()
        })
    }

    pub fn code(&self) -> u32 {
        self.0
    }
}

pub fn page_size_u32() -> u32 {
    static PAGE_SIZE: AtomicU32 = AtomicU32::new(0);

    let mut size = PAGE_SIZE.load(Ordering::Relaxed);
    if size == 0 {
        let sys_info = unsafe {
            let mut sys_info = MaybeUninit::<SYSTEM_INFO>::uninit();
            GetSystemInfo(sys_info.as_mut_ptr());
            sys_info.assume_init()
        };

        // N.B. according to MaulingMonkey:
        //
        // • Starting page address would be rounded down to an address that's a multiple of
        //   dwAllocationGranularity
        // • Ending page address or page count would be rounded up to an address that's a multiple
        //   of dwPageSize
        //
        // Since we're using `page_size` to determine the granularity of our reservation lengths,
        // commits, and uncommits, this is the number we are looking for.
        size = sys_info.dwPageSize;
        PAGE_SIZE.store(size, Ordering::Relaxed);
    }
    size
}

pub fn reserve(alloc_size: usize, access: Access) -> Result<NonNull<u8>, SystemError> {
    assert_eq!(alloc_size % page_size(), 0);
    assert_ne!(alloc_size, 0, "cannot reserve an empty range");

    // Windows has no lazily-backed reservations. Committed memory is still only backed on first
    // touch, so "accessible right away" means reserving and committing in one go.
    let (kind, protection) = match access {
        Access::None => (MEM_RESERVE, PAGE_NOACCESS),
        Access::ReadWrite => (MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE),
    };

    match NonNull::new(unsafe { VirtualAlloc(std::ptr::null(), alloc_size, kind, protection) }) {
        Some(base_addr) => Ok(base_addr.cast()),
        None => Err(SystemError::from_errno()),
    }
}

pub unsafe fn unreserve(addr: NonNull<u8>, _len: usize) -> Result<(), SystemError> {
    assert_eq!(addr.as_ptr() as usize % page_size(), 0);

    if VirtualFree(addr.as_ptr().cast(), 0, MEM_RELEASE) != 0 {
        Ok(())
    } else {
        Err(SystemError::from_errno())
    }
}

pub unsafe fn commit(addr: NonNull<u8>, size: usize) -> Result<(), SystemError> {
    // N.B. "the allocated pages include all pages containing one or more bytes in the range from
    // lpAddress to lpAddress+dwSize", so a partial page still commits the whole thing.
    if VirtualAlloc(addr.as_ptr() as *const _, size, MEM_COMMIT, PAGE_READWRITE).is_null() {
        Err(SystemError::from_errno())
    } else {
        Ok(())
    }
}

pub unsafe fn uncommit(addr: NonNull<u8>, size: usize, access: Access) -> Result<(), SystemError> {
    assert_eq!(addr.as_ptr() as usize % page_size(), 0);
    assert_eq!(size % page_size(), 0);

    if VirtualFree(addr.as_ptr().cast(), size, MEM_DECOMMIT) == 0 {
        return Err(SystemError::from_errno());
    }

    match access {
        Access::None => Ok(()),
        Access::ReadWrite => commit(addr, size),
    }
}

/// Windows can't cheaply tell which committed pages are in the working set, so this reports
/// committed bytes instead.
pub unsafe fn resident_bytes(addr: NonNull<u8>, size: usize) -> Result<usize, SystemError> {
    let start = addr.as_ptr() as usize;
    let end = start + size;
    let mut cursor = start;
    let mut committed = 0;

    while cursor < end {
        let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();
        let written = VirtualQuery(
            cursor as *const _,
            info.as_mut_ptr(),
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );
        if written == 0 {
            return Err(SystemError::from_errno());
        }

        let info = info.assume_init();
        let region_end = (info.BaseAddress as usize + info.RegionSize).min(end);
        if info.State == MEM_COMMIT {
            committed += region_end - cursor;
        }
        cursor = region_end;
    }

    Ok(committed)
}

// === Fault hook === //

lazy_static! {
    static ref VECTORED_HANDLER: usize = unsafe { install() };
}

pub fn install_fault_handler() {
    lazy_static::initialize(&VECTORED_HANDLER);
}

unsafe fn install() -> usize {
    let handle = AddVectoredExceptionHandler(1, Some(handle_exception));
    assert!(
        !handle.is_null(),
        "Failed to install vectored exception handler: {}",
        SystemError::from_errno()
    );
    tracing::debug!("installed vectored exception handler");
    handle as usize
}

unsafe extern "system" fn handle_exception(info: *mut EXCEPTION_POINTERS) -> i32 {
    let record = &*(*info).ExceptionRecord;

    // For access violations, the second parameter is the inaccessible address.
    if record.ExceptionCode != EXCEPTION_ACCESS_VIOLATION || record.NumberParameters < 2 {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    match trap::on_fault(record.ExceptionInformation[1]) {
        Resolution::Resumed => EXCEPTION_CONTINUE_EXECUTION,
        Resolution::Foreign => EXCEPTION_CONTINUE_SEARCH,
        Resolution::Fatal(message) => {
            eprint!("{message}");
            std::process::abort();
        }
    }
}
