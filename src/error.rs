//! Error taxonomy for `fastipc`.
//!
//! Follows the split this corpus uses for its wire-protocol errors: one
//! domain-specific variant per named failure mode from the design, plus a
//! transparent passthrough for the underlying OS error.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The attach-or-create loop in [`crate::segment::GuardedSegment::open`]
    /// exhausted `max_attempts` without a stable attach or create.
    #[error("failed to attach or create shared segment {name:?} after {attempts} attempts")]
    AttachTimeout { name: String, attempts: u32 },

    /// An existing segment was found but is smaller than requested.
    #[error("existing segment {name:?} has size {existing}, smaller than requested {requested}")]
    SizeMismatch {
        name: String,
        existing: usize,
        requested: usize,
    },

    /// A semaphore `post` would overflow the 32-bit permit count.
    #[error("semaphore post would overflow i32::MAX permits")]
    Overflow,

    /// A blocking call returned due to a signal and the caller's policy opted
    /// not to retry. Reserved: the default policy always retries, so this is
    /// never returned by the primitives in this crate today.
    #[error("operation interrupted by signal")]
    Interrupted,

    /// The OS denied the underlying syscall.
    #[error("permission denied: {0}")]
    PermissionDenied(io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// True for errors that the close protocol treats as "someone else already
    /// won the race" rather than a real failure.
    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            Error::Nix(nix::Error::ENOENT) => true,
            _ => false,
        }
    }
}
