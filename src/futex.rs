//! Thin wrapper around the Linux `futex(2)` syscall.
//!
//! `nix` does not expose `futex` directly, so we go straight through
//! `libc::syscall` the same way this corpus reaches for raw syscalls when the
//! wrapping crate hasn't caught up (`SYS_close_range`, `SYS_clone3`, ...).

use std::sync::atomic::AtomicU32;
use std::time::Duration;

use crate::error::{Error, Result};

const FUTEX_WAIT: libc::c_int = 0;
const FUTEX_WAKE: libc::c_int = 1;

/// Outcome of a `futex_wait` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The kernel woke us, or the value didn't match `expected` to begin with.
    Woken,
    /// The timeout elapsed before a wake.
    TimedOut,
    /// The wait was interrupted by a signal; caller's retry policy decides
    /// what happens next.
    Interrupted,
}

/// Block while `word` still equals `expected`, for up to `timeout` (`None` =
/// forever).
///
/// Deliberately not `FUTEX_PRIVATE_FLAG`: the word is shared-memory backed
/// and mapped at a different virtual address in every participating process,
/// so the kernel must hash the futex by the underlying physical page rather
/// than by (mm, address).
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<WaitResult> {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    // Safety: `word` is a valid, aligned `u32` for the lifetime of the call;
    // the kernel only reads `expected` and dereferences `ts_ptr` if non-null.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        )
    };

    if rc == 0 {
        return Ok(WaitResult::Woken);
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Ok(WaitResult::Woken),
        Some(libc::ETIMEDOUT) => Ok(WaitResult::TimedOut),
        Some(libc::EINTR) => Ok(WaitResult::Interrupted),
        _ => Err(Error::Io(err)),
    }
}

/// Wake up to `n` waiters blocked on `word`. Returns the number actually
/// woken (best-effort; callers in this crate only care whether it was zero).
pub fn wake(word: &AtomicU32, n: i32) -> Result<u32> {
    // Safety: same as `wait` -- `word` is a valid aligned `u32`.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            FUTEX_WAKE,
            n,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0,
        )
    };

    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    Ok(rc as u32)
}
