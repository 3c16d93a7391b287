//! Configuration knobs for [`crate::segment::GuardedSegment::open`].
//!
//! A small builder rather than scattered constructor arguments, once there
//! are more than a couple of knobs -- the convention this corpus reaches for
//! once a constructor would otherwise need four or five positional params.

use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PID_ROOT: &str = "/dev/shm/fastipc";
const DEFAULT_MAX_ATTEMPTS: u32 = 128;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(2);

/// Options governing how [`crate::segment::GuardedSegment::open`] retries and
/// where it keeps its PID-tracking directory.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub(crate) pid_root: PathBuf,
    pub(crate) max_attempts: u32,
    pub(crate) backoff_base: Duration,
}

impl Default for OpenOptions {
    /// Resolves `pid_root` from `FASTIPC_PID_DIR` if set, else
    /// `/dev/shm/fastipc`, matching the original's environment override.
    fn default() -> Self {
        let pid_root = std::env::var_os("FASTIPC_PID_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PID_ROOT));

        OpenOptions {
            pid_root,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid_root(mut self, root: impl AsRef<Path>) -> Self {
        self.pid_root = root.as_ref().to_path_buf();
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff_base(mut self, backoff: Duration) -> Self {
        self.backoff_base = backoff;
        self
    }
}
