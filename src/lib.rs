//! `fastipc`: cross-process synchronization primitives -- a named mutex and a
//! named counting semaphore -- backed by a small, fixed-layout region of
//! POSIX shared memory.
//!
//! Two pieces do essentially all of the work:
//!
//! - [`segment::GuardedSegment`]: create-or-attach a named shared memory
//!   region and track its participants via PID files, unlinking it only when
//!   provably last.
//! - [`word`]: a [`word::Mutex`] and [`word::Semaphore`] that interpret a
//!   single shared `AtomicU32` as coordination state, blocking and waking
//!   across processes with `futex(2)`.
//!
//! [`named::NamedMutex`] and [`named::NamedSemaphore`] bind a name to a
//! 4-byte `GuardedSegment` and wrap the corresponding primitive -- this is
//! the surface most callers want.
//!
//! This crate only targets Linux: both the shared-memory backing (POSIX
//! `shm_open`) and the wait/wake primitive (`futex(2)`) are Linux-specific.

#![cfg(target_os = "linux")]

pub mod config;
pub mod error;
mod futex;
pub mod named;
pub mod segment;
pub mod word;

pub use config::OpenOptions;
pub use error::{Error, Result};
pub use named::{MutexGuard, NamedMutex, NamedSemaphore};
pub use segment::GuardedSegment;
pub use word::{Mutex, Semaphore};
