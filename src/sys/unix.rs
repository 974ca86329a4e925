use std::{
    ffi::CStr,
    mem,
    ptr::{null_mut, NonNull},
};

use lazy_static::lazy_static;
use libc::{c_int, c_void, siginfo_t};

use crate::{
    page_size,
    trap::{self, Resolution},
    Access,
};

#[derive(Debug, Clone, thiserror::Error)]
#[error("system error {0}: {}", describe(*.0))]
pub struct SystemError(i32);

fn describe(code: i32) -> String {
    let str = unsafe {
        // Safety: this string will stay alive on this thread until the next call to `strerror`.
        CStr::from_ptr(libc::strerror(code))
    };
    str.to_string_lossy().into_owned()
}

cfgenius::cond! {
    if cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly")) {
        unsafe fn errno_location() -> *mut c_int {
            libc::__error()
        }
    } else if cfg(any(target_os = "android", target_os = "openbsd", target_os = "netbsd")) {
        unsafe fn errno_location() -> *mut c_int {
            libc::__errno()
        }
    } else {
        unsafe fn errno_location() -> *mut c_int {
            libc::__errno_location()
        }
    }
}

impl SystemError {
    fn from_errno() -> Self {
        Self(unsafe {
            // Safety: errno is thread local.
            *errno_location()
        })
    }

    pub fn code(&self) -> i32 {
        self.0
    }
}

pub fn page_size_u32() -> u32 {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u32 }
}

fn protection(access: Access) -> c_int {
    match access {
        Access::None => libc::PROT_NONE,
        Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

// N.B. `MAP_NORESERVE` keeps writable private mappings from being charged against the overcommit
// limit up front. Inaccessible ones are free either way.
const MAP_FLAGS: c_int = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE;

pub fn reserve(alloc_size: usize, access: Access) -> Result<NonNull<u8>, SystemError> {
    assert_eq!(alloc_size % page_size(), 0);
    assert_ne!(alloc_size, 0, "cannot reserve an empty range");

    let base_addr = unsafe {
        libc::mmap(
            null_mut(),
            alloc_size,
            protection(access),
            MAP_FLAGS,
            -1,
            0,
        )
    };

    if base_addr == libc::MAP_FAILED {
        return Err(SystemError::from_errno());
    }

    match NonNull::new(base_addr.cast()) {
        Some(base_addr) => Ok(base_addr),
        None => panic!("mmap returned a null mapping"),
    }
}

pub unsafe fn unreserve(addr: NonNull<u8>, len: usize) -> Result<(), SystemError> {
    assert_eq!(addr.as_ptr() as usize % page_size(), 0);

    if libc::munmap(addr.as_ptr().cast(), len) == 0 {
        Ok(())
    } else {
        Err(SystemError::from_errno())
    }
}

pub unsafe fn commit(addr: NonNull<u8>, size: usize) -> Result<(), SystemError> {
    // N.B. this runs from the fault hook, so it must stay async-signal-safe: no allocation and no
    // formatting on the failure path.
    let addr = addr.as_ptr().cast::<c_void>();
    debug_assert_eq!(addr as usize % page_size(), 0);
    debug_assert_eq!(size % page_size(), 0);

    // `mprotect` keeps whatever is already in the range, so committing a page twice is harmless.
    if libc::mprotect(addr, size, libc::PROT_READ | libc::PROT_WRITE) == 0 {
        Ok(())
    } else {
        Err(SystemError::from_errno())
    }
}

pub unsafe fn uncommit(addr: NonNull<u8>, size: usize, access: Access) -> Result<(), SystemError> {
    let addr = addr.as_ptr().cast::<c_void>();
    assert_eq!(addr as usize % page_size(), 0);
    assert_eq!(size % page_size(), 0);

    let mapped_addr = libc::mmap(
        addr,
        size,
        protection(access),
        // N.B. `MAP_FIXED` is allowed to discard underlying mappings.
        //
        // According to `mmap(2)` (https://web.archive.org/web/20230512013353/https://man7.org/linux/man-pages/man2/mmap.2.html):
        // If the memory region specified by addr and length overlaps pages of any
        // existing mapping(s), then the overlapped part of the existing mapping(s)
        // will be discarded.  If the specified address cannot be used, mmap()
        // will fail.
        //
        MAP_FLAGS | libc::MAP_FIXED,
        -1,
        0,
    );

    if mapped_addr == libc::MAP_FAILED {
        return Err(SystemError::from_errno());
    }

    assert_eq!(addr, mapped_addr);
    Ok(())
}

// Pages queried per `mincore` call, so huge reservations don't need a huge residency vector.
const MINCORE_CHUNK_PAGES: usize = 4096;

pub unsafe fn resident_bytes(addr: NonNull<u8>, size: usize) -> Result<usize, SystemError> {
    let page_size = page_size();
    assert_eq!(addr.as_ptr() as usize % page_size, 0);

    let mut pages = [0u8; MINCORE_CHUNK_PAGES];
    let mut resident = 0;
    let mut offset = 0;

    while offset < size {
        let chunk_len = (size - offset).min(MINCORE_CHUNK_PAGES * page_size);
        let chunk_pages = chunk_len.div_ceil(page_size);
        let chunk_addr = addr.as_ptr().add(offset);

        if libc::mincore(chunk_addr as _, chunk_len, pages.as_mut_ptr() as _) != 0 {
            return Err(SystemError::from_errno());
        }

        resident += pages[..chunk_pages].iter().filter(|&&page| page & 1 != 0).count();
        offset += chunk_len;
    }

    Ok(resident * page_size)
}

// === Fault hook === //

struct PreviousHandlers {
    segv: libc::sigaction,
    bus: libc::sigaction,
}

// Safety: the saved actions are plain data that is written once, before the hook can run.
unsafe impl Send for PreviousHandlers {}
unsafe impl Sync for PreviousHandlers {}

lazy_static! {
    static ref PREVIOUS_HANDLERS: PreviousHandlers = unsafe { install() };
}

pub fn install_fault_handler() {
    lazy_static::initialize(&PREVIOUS_HANDLERS);
}

unsafe fn install() -> PreviousHandlers {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction =
        handle_fault as extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    libc::sigemptyset(&mut action.sa_mask);

    // Some platforms report faults on `PROT_NONE` pages as `SIGBUS` rather than `SIGSEGV`.
    let install_for = |signal: c_int| {
        let mut previous: libc::sigaction = mem::zeroed();
        assert_eq!(
            libc::sigaction(signal, &action, &mut previous),
            0,
            "Failed to install fault handler for signal {signal}: {}",
            SystemError::from_errno()
        );
        previous
    };

    let handlers = PreviousHandlers {
        segv: install_for(libc::SIGSEGV),
        bus: install_for(libc::SIGBUS),
    };
    tracing::debug!("installed protection fault handler");
    handlers
}

cfgenius::cond! {
    if cfg(any(target_os = "linux", target_os = "android")) {
        unsafe fn fault_address(info: *mut siginfo_t) -> usize {
            (*info).si_addr() as usize
        }
    } else {
        unsafe fn fault_address(info: *mut siginfo_t) -> usize {
            (*info).si_addr as usize
        }
    }
}

extern "C" fn handle_fault(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let addr = unsafe { fault_address(info) };

    match trap::on_fault(addr) {
        Resolution::Resumed => {}
        Resolution::Fatal(message) => unsafe {
            libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
            libc::abort();
        },
        Resolution::Foreign => unsafe { forward(signal, info, context) },
    }
}

unsafe fn forward(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let previous = if signal == libc::SIGBUS {
        &PREVIOUS_HANDLERS.bus
    } else {
        &PREVIOUS_HANDLERS.segv
    };

    match previous.sa_sigaction {
        // Restore the old disposition and return. The faulting instruction runs again and takes
        // the default action.
        libc::SIG_DFL | libc::SIG_IGN => {
            libc::sigaction(signal, previous, null_mut());
        }
        handler if previous.sa_flags & libc::SA_SIGINFO != 0 => {
            let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = mem::transmute(handler);
            handler(signal, info, context);
        }
        handler => {
            let handler: extern "C" fn(c_int) = mem::transmute(handler);
            handler(signal);
        }
    }
}
