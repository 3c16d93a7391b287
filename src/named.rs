//! Name-bound wrappers: own a 4-byte [`GuardedSegment`] and construct a
//! [`Mutex`]/[`Semaphore`] over its state word.

use std::sync::atomic::AtomicU32;

use tracing::debug;

use crate::config::OpenOptions;
use crate::error::Result;
use crate::segment::GuardedSegment;
use crate::word::{Mutex, Semaphore};

const WORD_SIZE: usize = std::mem::size_of::<u32>();

fn derived_name(name: &str) -> String {
    format!("__fastipc_{name}")
}

fn word_ptr(segment: &GuardedSegment) -> &AtomicU32 {
    let buf = segment.buffer();
    debug_assert!(buf.len() >= WORD_SIZE);
    // Safety: the segment maps at least `WORD_SIZE` bytes, suitably aligned
    // for `AtomicU32` because the OS page the mapping begins on is always
    // page-aligned (far stricter than `u32`'s 4-byte requirement).
    unsafe { &*(buf.as_ptr() as *const AtomicU32) }
}

/// A named, cross-process mutex. Construction opens (or creates) a 4-byte
/// shared segment named `__fastipc_{name}`.
pub struct NamedMutex {
    segment: GuardedSegment,
}

impl NamedMutex {
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, &OpenOptions::default())
    }

    pub fn open_with(name: &str, opts: &OpenOptions) -> Result<Self> {
        let segment = GuardedSegment::open_with(&derived_name(name), WORD_SIZE, opts)?;

        if segment.created_by_us() {
            // Freshly `ftruncate`'d POSIX shared memory is zero-filled by the
            // kernel, so 0 (FREE) is already the correct identity; this store
            // just documents the invariant rather than relying on silence.
            word_ptr(&segment).store(0, std::sync::atomic::Ordering::Relaxed);
            debug!(name, "named mutex initialized");
        }

        Ok(NamedMutex { segment })
    }

    fn mutex(&self) -> Mutex<'_> {
        Mutex::new(word_ptr(&self.segment))
    }

    pub fn try_acquire(&self) -> bool {
        self.mutex().try_acquire()
    }

    pub fn acquire(&self) -> Result<bool> {
        self.mutex().acquire()
    }

    pub fn release(&self) {
        self.mutex().release()
    }

    /// Acquire and return an RAII guard that releases on drop.
    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        self.acquire()?;
        Ok(MutexGuard { owner: self })
    }

    pub fn participant_count(&self) -> usize {
        self.segment.participant_count()
    }
}

/// RAII guard returned by [`NamedMutex::lock`]; releases the mutex on drop.
#[must_use = "dropping this guard immediately releases the mutex"]
pub struct MutexGuard<'a> {
    owner: &'a NamedMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.owner.release();
    }
}

/// A named, cross-process counting semaphore. Construction opens (or
/// creates) a 4-byte shared segment named `__fastipc_{name}`.
pub struct NamedSemaphore {
    segment: GuardedSegment,
}

impl NamedSemaphore {
    pub fn open(name: &str, initial: Option<u32>) -> Result<Self> {
        Self::open_with(name, initial, &OpenOptions::default())
    }

    pub fn open_with(name: &str, initial: Option<u32>, opts: &OpenOptions) -> Result<Self> {
        let segment = GuardedSegment::open_with(&derived_name(name), WORD_SIZE, opts)?;

        if segment.created_by_us() {
            let value = initial.unwrap_or(0);
            word_ptr(&segment).store(value, std::sync::atomic::Ordering::Relaxed);
            debug!(name, value, "named semaphore initialized");
        }
        // Non-creators never touch the word: the creator already
        // initialized it, or a prior run left a valid value.

        Ok(NamedSemaphore { segment })
    }

    fn semaphore(&self) -> Semaphore<'_> {
        Semaphore::new(word_ptr(&self.segment))
    }

    pub fn post(&self, n: u32) -> Result<()> {
        self.semaphore().post(n)
    }

    pub fn post1(&self) -> Result<()> {
        self.semaphore().post1()
    }

    pub fn wait(&self, blocking: bool, timeout: std::time::Duration) -> Result<bool> {
        self.wait_ns(blocking, timeout.as_nanos() as i64, 128)
    }

    pub fn wait_ns(&self, blocking: bool, timeout_ns: i64, spin: u32) -> Result<bool> {
        self.semaphore().wait(blocking, timeout_ns, spin)
    }

    pub fn value(&self) -> u32 {
        self.semaphore().value()
    }

    pub fn participant_count(&self) -> usize {
        self.segment.participant_count()
    }
}
