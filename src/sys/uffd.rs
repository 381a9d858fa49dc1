//! Raw `userfaultfd(2)` plumbing.
//!
//! Neither `libc` nor `rustix` expose the userfaultfd ioctl protocol, so
//! this module hand-encodes the handful of structs and ioctl numbers from
//! `linux/userfaultfd.h` it needs, the same way a crate like `region` or
//! `userfaultfd-sys` would. The ioctl encoding follows the standard Linux
//! `_IOC`/`_IOR`/`_IOWR` macros; these numbers are stable kernel ABI.

#![allow(non_camel_case_types)]

use crate::error::{Error, Result};
use std::os::unix::io::RawFd;

const UFFD_IOC_MAGIC: u64 = 0xAA;

const fn ioc(dir: u64, nr: u64, size: u64) -> u64 {
    const DIR_SHIFT: u64 = 30;
    const SIZE_SHIFT: u64 = 16;
    const TYPE_SHIFT: u64 = 8;
    (dir << DIR_SHIFT) | (size << SIZE_SHIFT) | (UFFD_IOC_MAGIC << TYPE_SHIFT) | nr
}

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

fn iowr(nr: u64, size: usize) -> u64 {
    ioc(IOC_READ | IOC_WRITE, nr, size as u64)
}

fn ior(nr: u64, size: usize) -> u64 {
    ioc(IOC_READ, nr, size as u64)
}

const UFFDIO_API_NR: u64 = 0x3F;
const UFFDIO_REGISTER_NR: u64 = 0x00;
const UFFDIO_UNREGISTER_NR: u64 = 0x01;
const UFFDIO_WAKE_NR: u64 = 0x02;
const UFFDIO_COPY_NR: u64 = 0x03;
const UFFDIO_ZEROPAGE_NR: u64 = 0x04;
const UFFDIO_WRITEPROTECT_NR: u64 = 0x06;

pub const UFFD_API: u64 = 0xAA;
pub const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
pub const UFFD_PAGEFAULT_FLAG_WRITE: u64 = 1 << 1;
pub const UFFD_PAGEFAULT_FLAG_WP: u64 = 1 << 2;

/// Matches `struct uffdio_api`.
#[repr(C)]
#[derive(Default)]
struct uffdio_api {
    api: u64,
    features: u64,
    ioctls: u64,
}

/// Matches `struct uffdio_range`.
#[repr(C)]
struct uffdio_range {
    start: u64,
    len: u64,
}

/// Matches `struct uffdio_register`.
#[repr(C)]
struct uffdio_register {
    range: uffdio_range,
    mode: u64,
    ioctls: u64,
}

const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;
const UFFDIO_REGISTER_MODE_WP: u64 = 1 << 1;

/// Matches `struct uffdio_copy`.
#[repr(C)]
struct uffdio_copy {
    dst: u64,
    src: u64,
    len: u64,
    mode: u64,
    copy: i64,
}

const UFFDIO_COPY_MODE_DONTWAKE: u64 = 1 << 0;

/// Matches `struct uffdio_zeropage`.
#[repr(C)]
struct uffdio_zeropage {
    range: uffdio_range,
    mode: u64,
    zeropage: i64,
}

/// Matches `struct uffdio_writeprotect`.
#[repr(C)]
struct uffdio_writeprotect {
    range: uffdio_range,
    mode: u64,
}

const UFFDIO_WRITEPROTECT_MODE_WP: u64 = 1 << 0;
const UFFDIO_WRITEPROTECT_MODE_DONTWAKE: u64 = 1 << 2;

/// Matches `struct uffd_msg`'s pagefault arm (the only event kind this
/// runtime ever asks for — spec.md §4.4). Field order matters: the kernel
/// lays out `flags` at offset 8, `address` at offset 16.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UffdPagefault {
    pub flags: u64,
    pub address: u64,
}

/// Minimal view of `struct uffd_msg`: event tag plus the pagefault payload,
/// padded to the kernel's fixed message size (32 bytes: an 8-byte header
/// plus the 24-byte arg union).
#[repr(C)]
pub struct UffdMsg {
    pub event: u8,
    _reserved1: u8,
    _reserved2: u16,
    _reserved3: u32,
    pub pagefault: UffdPagefault,
    _pad: u64,
}

impl Default for UffdMsg {
    fn default() -> Self {
        // SAFETY: all-zero is a valid bit pattern for this POD struct.
        unsafe { std::mem::zeroed() }
    }
}

fn check(r: libc::c_long, what: &str) -> Result<libc::c_long> {
    if r < 0 {
        Err(Error::fatal(format!(
            "{what} failed: errno {}",
            std::io::Error::last_os_error()
        )))
    } else {
        Ok(r)
    }
}

/// Opens a new userfaultfd, non-blocking and close-on-exec, and completes
/// the `UFFDIO_API` handshake.
pub fn open() -> Result<RawFd> {
    // SYS_userfaultfd has no libc wrapper on most targets.
    let fd = unsafe { libc::syscall(libc::SYS_userfaultfd, libc::O_CLOEXEC | libc::O_NONBLOCK) };
    let fd = check(fd, "userfaultfd")? as RawFd;

    let mut api = uffdio_api {
        api: UFFD_API,
        ..Default::default()
    };
    let r = unsafe { libc::ioctl(fd, iowr(UFFDIO_API_NR, std::mem::size_of::<uffdio_api>()) as _, &mut api) };
    check(r as libc::c_long, "UFFDIO_API")?;
    Ok(fd)
}

/// Registers `[addr, addr+size)` for missing-page (and, if `writable`,
/// write-protect) notifications.
pub fn register(fd: RawFd, addr: usize, size: usize, writable: bool) -> Result<()> {
    let mut mode = UFFDIO_REGISTER_MODE_MISSING;
    if writable {
        mode |= UFFDIO_REGISTER_MODE_WP;
    }
    let mut reg = uffdio_register {
        range: uffdio_range {
            start: addr as u64,
            len: size as u64,
        },
        mode,
        ioctls: 0,
    };
    let r = unsafe {
        libc::ioctl(
            fd,
            iowr(UFFDIO_REGISTER_NR, std::mem::size_of::<uffdio_register>()) as _,
            &mut reg,
        )
    };
    check(r as libc::c_long, "UFFDIO_REGISTER").map(|_| ())
}

pub fn unregister(fd: RawFd, addr: usize, size: usize) -> Result<()> {
    let mut range = uffdio_range {
        start: addr as u64,
        len: size as u64,
    };
    let r = unsafe {
        libc::ioctl(
            fd,
            ior(UFFDIO_UNREGISTER_NR, std::mem::size_of::<uffdio_range>()) as _,
            &mut range,
        )
    };
    check(r as libc::c_long, "UFFDIO_UNREGISTER").map(|_| ())
}

/// Installs `len` bytes from `src` at `dst` atomically, resolving a missing
/// fault (spec.md §4.5's `read_completion`, "atomic install").
pub fn copy(fd: RawFd, dst: usize, src: *const u8, len: usize, wake: bool) -> Result<()> {
    let mut c = uffdio_copy {
        dst: dst as u64,
        src: src as u64,
        len: len as u64,
        mode: if wake { 0 } else { UFFDIO_COPY_MODE_DONTWAKE },
        copy: 0,
    };
    let r = unsafe { libc::ioctl(fd, iowr(UFFDIO_COPY_NR, std::mem::size_of::<uffdio_copy>()) as _, &mut c) };
    check(r as libc::c_long, "UFFDIO_COPY").map(|_| ())
}

/// Installs a single zero-filled page (spec.md §4.5 step 4a, first-touch
/// fulfilment from zero-page).
pub fn zeropage(fd: RawFd, addr: usize, len: usize, wake: bool) -> Result<()> {
    let mut z = uffdio_zeropage {
        range: uffdio_range {
            start: addr as u64,
            len: len as u64,
        },
        mode: if wake { 0 } else { UFFDIO_COPY_MODE_DONTWAKE },
        zeropage: 0,
    };
    let r = unsafe {
        libc::ioctl(
            fd,
            iowr(UFFDIO_ZEROPAGE_NR, std::mem::size_of::<uffdio_zeropage>()) as _,
            &mut z,
        )
    };
    check(r as libc::c_long, "UFFDIO_ZEROPAGE").map(|_| ())
}

/// Sets or clears write-protection on a range without changing presence
/// (spec.md §4.5 step 3's WP drop, and §4.8's batch quiesce).
pub fn writeprotect(fd: RawFd, addr: usize, len: usize, protect: bool, wake: bool) -> Result<()> {
    let mut mode = if protect { UFFDIO_WRITEPROTECT_MODE_WP } else { 0 };
    if !wake {
        mode |= UFFDIO_WRITEPROTECT_MODE_DONTWAKE;
    }
    let mut wp = uffdio_writeprotect {
        range: uffdio_range {
            start: addr as u64,
            len: len as u64,
        },
        mode,
    };
    let r = unsafe {
        libc::ioctl(
            fd,
            iowr(UFFDIO_WRITEPROTECT_NR, std::mem::size_of::<uffdio_writeprotect>()) as _,
            &mut wp,
        )
    };
    check(r as libc::c_long, "UFFDIO_WRITEPROTECT").map(|_| ())
}

/// Wakes any threads parked on a range without resolving a fault — used
/// when a duplicate fault turns out to already be satisfied.
pub fn wake(fd: RawFd, addr: usize, size: usize) -> Result<()> {
    let mut range = uffdio_range {
        start: addr as u64,
        len: size as u64,
    };
    let r = unsafe { libc::ioctl(fd, ior(UFFDIO_WAKE_NR, std::mem::size_of::<uffdio_range>()) as _, &mut range) };
    check(r as libc::c_long, "UFFDIO_WAKE").map(|_| ())
}

/// Non-blocking poll-then-read of exactly one message (spec.md §4.4).
/// Returns `Ok(None)` on `EAGAIN` (another handler got there first) or when
/// nothing is pending; any other read error is fatal.
pub fn try_read_message(fd: RawFd) -> Result<Option<UffdMsg>> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, 0) };
    if n <= 0 {
        return Ok(None);
    }
    if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
        return Err(Error::fatal("uffd fd reported POLLERR/POLLHUP"));
    }

    let mut msg = UffdMsg::default();
    let n = unsafe {
        libc::read(
            fd,
            &mut msg as *mut UffdMsg as *mut libc::c_void,
            std::mem::size_of::<UffdMsg>(),
        )
    };
    if n < 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::EAGAIN) {
            return Ok(None);
        }
        return Err(Error::fatal(format!("uffd read failed: {errno}")));
    }
    if n as usize != std::mem::size_of::<UffdMsg>() {
        return Err(Error::fatal("short read on uffd fd"));
    }
    Ok(Some(msg))
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
