//! Futex-backed synchronization primitives over a single shared [`AtomicU32`].
//!
//! Both [`Mutex`] and [`Semaphore`] borrow their state word from caller-owned
//! shared memory (see [`crate::segment::GuardedSegment`]) rather than owning
//! it, so the same word can be reached from multiple independently-mapped
//! processes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::futex::{self, WaitResult};

const FREE: u32 = 0;
const LOCKED_NOWAITERS: u32 = 1;
const LOCKED_WAITERS: u32 = 2;

/// A non-recursive, non-owning mutex: any participant may release it, not
/// just the one that acquired it. The shared word encodes
/// `{0: free, 1: locked/no waiters, 2: locked/has waiters}`.
pub struct Mutex<'a> {
    word: &'a AtomicU32,
}

impl<'a> Mutex<'a> {
    /// Wrap an existing word. Callers are responsible for initializing it to
    /// `0` exactly once, by the segment's creator.
    pub fn new(word: &'a AtomicU32) -> Self {
        Mutex { word }
    }

    pub fn try_acquire(&self) -> bool {
        self.word
            .compare_exchange(FREE, LOCKED_NOWAITERS, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Blocks until acquired. Always returns `Ok(true)` under the default
    /// retry-on-interrupt policy; `Interrupted` is reserved for a future
    /// opt-in policy that isn't exposed yet.
    pub fn acquire(&self) -> Result<bool> {
        if self.try_acquire() {
            return Ok(true);
        }

        loop {
            let mut cur = self.word.load(Ordering::Relaxed);

            if cur == LOCKED_NOWAITERS {
                // Upgrade need not succeed: a racing release may have already
                // dropped it to FREE.
                match self.word.compare_exchange(
                    LOCKED_NOWAITERS,
                    LOCKED_WAITERS,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => cur = LOCKED_WAITERS,
                    Err(observed) => cur = observed,
                }
            }

            if cur == FREE {
                if self.try_acquire() {
                    return Ok(true);
                }
                continue;
            }

            debug_assert_eq!(cur, LOCKED_WAITERS);

            match futex::wait(self.word, LOCKED_WAITERS, None)? {
                WaitResult::Interrupted => {
                    // Default policy: retry rather than surface Interrupted.
                    continue;
                }
                WaitResult::Woken | WaitResult::TimedOut => {
                    // We must publish WAITERS again: other waiters may still
                    // be parked and would otherwise never be woken.
                    match self.word.compare_exchange(
                        FREE,
                        LOCKED_WAITERS,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return Ok(true),
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    /// Releases the mutex. Any participant may call this, including one that
    /// never called `acquire` -- the mutex is a coordination token, not an
    /// owning lock.
    pub fn release(&self) {
        let prev = self.word.swap(FREE, Ordering::Release);
        match prev {
            LOCKED_WAITERS => {
                if let Err(e) = futex::wake(self.word, 1) {
                    warn!(error = %e, "futex wake failed on mutex release");
                }
            }
            LOCKED_NOWAITERS => {
                // Uncontended path: no syscall needed.
            }
            FREE => {
                trace!("release() called on an already-free mutex");
            }
            other => unreachable!("mutex word in invalid state {other}"),
        }
    }
}

/// A counting semaphore over a shared, non-negative permit count.
pub struct Semaphore<'a> {
    word: &'a AtomicU32,
}

impl<'a> Semaphore<'a> {
    /// Wrap an existing word. If this participant created the backing
    /// segment, it should have initialized the word to the desired starting
    /// count before any other participant could observe it.
    pub fn new(word: &'a AtomicU32) -> Self {
        Semaphore { word }
    }

    pub fn value(&self) -> u32 {
        self.word.load(Ordering::Relaxed)
    }

    pub fn post1(&self) -> Result<()> {
        self.post(1)
    }

    pub fn post(&self, n: u32) -> Result<()> {
        if n == 0 {
            return Ok(());
        }

        let prev = self.word.load(Ordering::Relaxed);
        if prev as u64 + n as u64 > i32::MAX as u64 {
            return Err(Error::Overflow);
        }

        let prev = self.word.fetch_add(n, Ordering::Release);

        if prev == 0 {
            if let Err(e) = futex::wake(self.word, n as i32) {
                warn!(error = %e, "futex wake failed on semaphore post");
            }
        }

        Ok(())
    }

    /// `blocking = false` never syscalls. `timeout_ns < 0` waits forever;
    /// `timeout_ns == 0` polls only through the spin phase.
    pub fn wait(&self, blocking: bool, timeout_ns: i64, spin: u32) -> Result<bool> {
        for _ in 0..spin.max(1) {
            if self.try_decrement() {
                return Ok(true);
            }
            std::hint::spin_loop();
        }

        if !blocking {
            return Ok(false);
        }

        let deadline = if timeout_ns < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_nanos(timeout_ns as u64))
        };

        loop {
            if self.try_decrement() {
                return Ok(true);
            }

            let remaining = match deadline {
                None => None,
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Ok(false);
                    }
                    Some(dl - now)
                }
            };

            match futex::wait(self.word, 0, remaining)? {
                WaitResult::TimedOut => return Ok(false),
                WaitResult::Woken | WaitResult::Interrupted => {
                    // Loop around: re-check the word, possibly spurious.
                }
            }
        }
    }

    fn try_decrement(&self) -> bool {
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn try_acquire_then_release_round_trips_to_free() {
        let word = AtomicU32::new(0);
        let m = Mutex::new(&word);
        assert!(m.try_acquire());
        assert_eq!(word.load(Ordering::SeqCst), LOCKED_NOWAITERS);
        assert!(!m.try_acquire());
        m.release();
        assert_eq!(word.load(Ordering::SeqCst), FREE);
    }

    #[test]
    fn uncontended_acquire_release_roundtrip() {
        let word = AtomicU32::new(0);
        let m = Mutex::new(&word);
        assert!(m.acquire().unwrap());
        m.release();
        assert_eq!(word.load(Ordering::SeqCst), FREE);
    }

    #[test]
    fn contended_mutex_wakes_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        {
            let m = Mutex::new(&word);
            assert!(m.try_acquire());
        }

        let waiter_word = Arc::clone(&word);
        let waiter = std::thread::spawn(move || {
            let m = Mutex::new(&waiter_word);
            m.acquire().unwrap();
            m.release();
        });

        // give the waiter time to park as a LOCKED_WAITERS observer
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(word.load(Ordering::SeqCst), LOCKED_WAITERS);

        let m = Mutex::new(&word);
        m.release();

        waiter.join().unwrap();
        assert_eq!(word.load(Ordering::SeqCst), FREE);
    }

    #[test]
    fn semaphore_post_then_wait_k_times() {
        let word = AtomicU32::new(0);
        let s = Semaphore::new(&word);
        s.post(3).unwrap();
        assert!(s.wait(false, 0, 4).unwrap());
        assert!(s.wait(false, 0, 4).unwrap());
        assert!(s.wait(false, 0, 4).unwrap());
        assert!(!s.wait(false, 0, 4).unwrap());
    }

    #[test]
    fn wait_non_blocking_on_zero_returns_false() {
        let word = AtomicU32::new(0);
        let s = Semaphore::new(&word);
        assert!(!s.wait(false, -1, 8).unwrap());
    }

    #[test]
    fn wait_zero_timeout_after_spin_returns_false() {
        let word = AtomicU32::new(0);
        let s = Semaphore::new(&word);
        assert!(!s.wait(true, 0, 4).unwrap());
    }

    #[test]
    fn semaphore_rendezvous_wakes_blocked_waiter() {
        let word = Arc::new(AtomicU32::new(0));

        let waiter_word = Arc::clone(&word);
        let waiter = std::thread::spawn(move || {
            let s = Semaphore::new(&waiter_word);
            s.wait(true, -1, 16).unwrap()
        });

        std::thread::sleep(Duration::from_millis(20));
        let s = Semaphore::new(&word);
        s.post1().unwrap();

        assert!(waiter.join().unwrap());
        assert_eq!(word.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn semaphore_burst_wakes_at_most_n() {
        let word = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..5 {
            let w = Arc::clone(&word);
            handles.push(std::thread::spawn(move || {
                let s = Semaphore::new(&w);
                s.wait(true, -1, 16).unwrap()
            }));
        }

        std::thread::sleep(Duration::from_millis(20));
        let s = Semaphore::new(&word);
        s.post(3).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(word.load(Ordering::SeqCst), 0);

        // finish the rest so the test doesn't leak threads
        s.post(2).unwrap();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
