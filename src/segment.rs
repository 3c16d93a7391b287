//! Guarded shared-memory segment: create-or-attach a named POSIX shared
//! memory region and track its participants with PID files so that the last
//! process out unlinks it.

use std::fs;
use std::num::NonZeroUsize;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::config::OpenOptions;
use crate::error::{Error, Result};

/// A named, fixed-size shared memory segment plus its PID-tracked
/// participant set.
///
/// `buffer()` stays valid and stable for the lifetime of this handle; the
/// segment itself is only unlinked from the OS namespace by whichever
/// participant observes itself to be the last one out (see [`Self::close`]).
pub struct GuardedSegment {
    name: String,
    size: usize,
    created_by_us: bool,
    ptr: Option<NonNull<u8>>,
    pid_dir: PathBuf,
    pid: u32,
    closed: bool,
}

// Safety: the mapping is `MAP_SHARED`, and all access to the bytes it points
// to goes through atomics or is documented as caller-synchronized.
unsafe impl Send for GuardedSegment {}
unsafe impl Sync for GuardedSegment {}

impl GuardedSegment {
    /// Attach to `name`, creating it with `size` bytes if it doesn't exist.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::open_with(name, size, &OpenOptions::default())
    }

    pub fn open_with(name: &str, size: usize, opts: &OpenOptions) -> Result<Self> {
        let pid_dir = opts.pid_root.join(format!("{name}.pids"));
        fs::create_dir_all(&pid_dir).or_else(ignore_already_exists)?;

        let mut last_err = None;
        let mut opened = None;

        for attempt in 0..opts.max_attempts {
            match try_attach(name) {
                Ok(raw_fd) => {
                    // Safety: `raw_fd` is a freshly opened shm fd.
                    let file = unsafe { std::fs::File::from_raw_fd(raw_fd) };
                    let existing_size = file.metadata()?.len() as usize;

                    if existing_size < size {
                        // A concurrent creator may have `shm_open`ed but not
                        // yet `ftruncate`d; treat this as a race and retry
                        // rather than failing a legitimate peer immediately.
                        last_err = Some(Error::SizeMismatch {
                            name: name.to_string(),
                            existing: existing_size,
                            requested: size,
                        });
                        drop(file);
                    } else {
                        opened = Some((file, false));
                        break;
                    }
                }
                Err(e) if e.is_not_found() => match try_create(name) {
                    Ok(raw_fd) => {
                        // Safety: `raw_fd` is a freshly created shm fd.
                        let file = unsafe { std::fs::File::from_raw_fd(raw_fd) };
                        file.set_len(size as u64)?;
                        opened = Some((file, true));
                        break;
                    }
                    Err(e) if is_exists(&e) => {
                        last_err = Some(e);
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }

            trace!(name, attempt, "shm attach/create race, backing off");
            std::thread::sleep(backoff(opts.backoff_base));
        }

        let (file, created_by_us) = match opened {
            Some(opened) => opened,
            None => {
                return Err(last_err.unwrap_or(Error::AttachTimeout {
                    name: name.to_string(),
                    attempts: opts.max_attempts,
                }));
            }
        };

        let map_size = NonZeroUsize::new(size.max(1)).expect("size > 0");

        // Safety: `file` owns a valid shm fd sized to at least `size` bytes;
        // the mapping is dropped exactly once, in `close`.
        let ptr = unsafe {
            mman::mmap(
                None,
                map_size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(Error::Nix)?;

        // The fd itself isn't needed once mapped; the mapping keeps the
        // segment alive.
        drop(file);

        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned null pointer",
            ))
        })?;

        let pid = std::process::id();
        write_pid_file(&pid_dir, pid)?;

        debug!(name, created_by_us, size, pid, "segment opened");

        Ok(GuardedSegment {
            name: name.to_string(),
            size,
            created_by_us,
            ptr: Some(ptr),
            pid_dir,
            pid,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn created_by_us(&self) -> bool {
        self.created_by_us
    }

    /// Stable for the lifetime of this handle.
    pub fn buffer(&self) -> &[u8] {
        let ptr = self.ptr.expect("not yet closed");
        // Safety: mapped for `self.size` bytes, valid until `close`.
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size) }
    }

    pub fn buffer_mut(&self) -> &mut [u8] {
        let ptr = self.ptr.expect("not yet closed");
        // Safety: same as `buffer`; shared mutability is the caller's
        // responsibility via the atomic state word protocol.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size) }
    }

    /// Number of PID files currently in the participant directory. Advisory:
    /// may include stale entries for crashed processes.
    pub fn participant_count(&self) -> usize {
        list_pids(&self.pid_dir).len()
    }

    /// Idempotent cooperative teardown. Safe to call multiple times and from
    /// `Drop`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.close_inner() {
            warn!(name = %self.name, error = %e, "error during segment close");
        }

        if let Some(ptr) = self.ptr.take() {
            // Safety: `ptr` was returned by `mmap` with `self.size` bytes and
            // hasn't been unmapped yet.
            let _ = unsafe { mman::munmap(ptr.as_ptr().cast(), self.size) };
        }
    }

    fn close_inner(&self) -> Result<()> {
        // 1. Reap dead peers.
        for pid in list_pids(&self.pid_dir) {
            if !is_alive(pid) {
                let path = self.pid_dir.join(pid.to_string());
                remove_file_ignore_missing(&path)?;
            }
        }

        // 2. Deregister self.
        remove_file_ignore_missing(&self.pid_dir.join(self.pid.to_string()))?;

        // 3. Survey survivors.
        let survivors: Vec<u32> = list_pids(&self.pid_dir)
            .into_iter()
            .filter(|&pid| is_alive(pid))
            .collect();

        if !survivors.is_empty() {
            trace!(name = %self.name, survivors = survivors.len(), "other participants remain, not unlinking");
            return Ok(());
        }

        // 4. Last one out: unlink segment and remove the directory.
        match mman::shm_unlink(self.name.as_str()) {
            Ok(()) => debug!(name = %self.name, "segment unlinked, last participant out"),
            Err(nix::Error::ENOENT) => {}
            Err(e) => return Err(Error::Nix(e)),
        }

        match fs::remove_dir(&self.pid_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if is_dir_not_empty(&e) => {
                // A new joiner raced us between steps 3 and 4; leaving the
                // directory behind is cheap and it'll be reused.
            }
            Err(e) => return Err(Error::Io(e)),
        }

        Ok(())
    }
}

impl Drop for GuardedSegment {
    fn drop(&mut self) {
        self.close();
    }
}

fn try_attach(name: &str) -> Result<i32> {
    let flags = OFlag::O_RDWR;
    let mode = Mode::S_IRUSR | Mode::S_IWUSR;
    mman::shm_open(name, flags, mode).map_err(map_shm_open_err)
}

fn try_create(name: &str) -> Result<i32> {
    let flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
    let mode = Mode::S_IRUSR | Mode::S_IWUSR;
    mman::shm_open(name, flags, mode).map_err(map_shm_open_err)
}

/// `shm_open` reports denied permissions as `EACCES`; surface that distinctly
/// from the generic `Nix` passthrough so callers can tell "no segment" apart
/// from "not allowed to see it".
fn map_shm_open_err(e: nix::Error) -> Error {
    if e == nix::Error::EACCES {
        Error::PermissionDenied(std::io::Error::from_raw_os_error(e as i32))
    } else {
        Error::Nix(e)
    }
}

fn is_exists(e: &Error) -> bool {
    matches!(e, Error::Nix(nix::Error::EEXIST))
}

fn ignore_already_exists(e: std::io::Error) -> std::io::Result<()> {
    if e.kind() == std::io::ErrorKind::AlreadyExists {
        Ok(())
    } else {
        Err(e)
    }
}

fn backoff(base: std::time::Duration) -> std::time::Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    base.mul_f64(1.0 + jitter)
}

fn write_pid_file(dir: &Path, pid: u32) -> Result<()> {
    fs::create_dir_all(dir).or_else(ignore_already_exists)?;
    let path = dir.join(pid.to_string());
    match fs::File::create(&path) {
        Ok(_) => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn list_pids(dir: &Path) -> Vec<u32> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<u32>().ok()))
        .collect()
}

fn remove_file_ignore_missing(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn is_dir_not_empty(e: &std::io::Error) -> bool {
    // ENOTEMPTY isn't a stable ErrorKind variant across all targets; check
    // the raw errno too.
    e.raw_os_error() == Some(libc::ENOTEMPTY)
}

/// A PID is dead iff a null-signal send returns "no such process"; permission
/// denied and any other error are conservatively treated as alive.
fn is_alive(pid: u32) -> bool {
    match nix::sys::signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::Error::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!(
            "/fastipc_test_{tag}_{}_{}",
            std::process::id(),
            rand::thread_rng().gen::<u32>()
        )
    }

    fn opts(dir: &Path) -> OpenOptions {
        OpenOptions::new().pid_root(dir)
    }

    #[test]
    fn create_then_attach_share_size_and_created_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let name = unique_name("attach");

        let creator = GuardedSegment::open_with(&name, 4, &opts(tmp.path())).unwrap();
        assert!(creator.created_by_us());
        assert_eq!(creator.size(), 4);

        let attacher = GuardedSegment::open_with(&name, 4, &opts(tmp.path())).unwrap();
        assert!(!attacher.created_by_us());
        assert_eq!(attacher.size(), 4);

        // Both handles are opened from this same process, so they share one
        // PID and therefore one PID file -- the participant set is keyed by
        // PID, not by handle.
        assert_eq!(creator.participant_count(), 1);

        drop(attacher);
        drop(creator);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let name = unique_name("sizemismatch");

        // A persistent mismatch (not a transient create/attach race) should
        // exhaust the retry budget and surface `SizeMismatch`; keep the
        // budget small so the test doesn't spend real time retrying.
        let small_budget = opts(tmp.path()).max_attempts(3);

        let _creator = GuardedSegment::open_with(&name, 64, &small_budget).unwrap();
        let err = GuardedSegment::open_with(&name, 128, &small_budget).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { .. }));
    }

    #[test]
    fn close_is_idempotent_and_unlinks_when_last() {
        let tmp = tempfile::tempdir().unwrap();
        let name = unique_name("close");

        let mut seg = GuardedSegment::open_with(&name, 4, &opts(tmp.path())).unwrap();
        seg.close();
        seg.close(); // no panic, no double-unlink

        assert!(!tmp.path().join(format!("{name}.pids")).exists() || {
            let dir = tmp.path().join(format!("{name}.pids"));
            fs::read_dir(&dir).map(|mut i| i.next().is_none()).unwrap_or(true)
        });
    }

    #[test]
    fn stale_pid_is_reaped_on_close() {
        let tmp = tempfile::tempdir().unwrap();
        let name = unique_name("reap");

        let mut owner = GuardedSegment::open_with(&name, 4, &opts(tmp.path())).unwrap();

        // Simulate a crashed peer: a PID file for a process that doesn't
        // exist. PID 1 is never us in a test sandbox's PID namespace view
        // used here, so pick an implausible but well-formed value instead.
        let stale_pid = 999_999u32;
        write_pid_file(&tmp.path().join(format!("{name}.pids")), stale_pid).unwrap();
        assert_eq!(owner.participant_count(), 2);

        owner.close();

        let dir = tmp.path().join(format!("{name}.pids"));
        let remaining = fs::read_dir(&dir)
            .map(|i| i.filter_map(|e| e.ok()).count())
            .unwrap_or(0);
        assert_eq!(remaining, 0);
    }
}
