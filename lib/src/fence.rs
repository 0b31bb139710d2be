//! Fences signal the completion of an asynchronous operation on a buffer.
//!
//! A [`Fence`] is an opaque, reference-counted handle around a file
//! descriptor that becomes readable once the operation it tracks has
//! completed. GPU drivers hand out Linux `sync_file`s for this purpose, but any
//! pollable fd will do: [`Fence::new_pending`] creates an eventfd-backed fence
//! and the [`FenceSignaler`] that completes it, which is what CPU producers and
//! consumers use.
//!
//! The queue never looks inside fences. It only passes them between both sides
//! and waits on them on a couple of internal paths.
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;
use thiserror::Error;

use crate::ioctl::{self, SyncFileInfoError, SyncMergeError, SyncStatus};

#[derive(Debug, Error)]
pub enum FenceError {
    #[error("timed out waiting for fence")]
    TimedOut,
    #[error("fence cannot be merged: {0}")]
    MergeError(#[from] SyncMergeError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl From<FenceError> for Errno {
    fn from(err: FenceError) -> Self {
        match err {
            FenceError::TimedOut => Errno::ETIMEDOUT,
            FenceError::MergeError(e) => e.into(),
            FenceError::IoError(_) => Errno::EIO,
        }
    }
}

/// Result of a non-blocking query of the time at which a fence signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTime {
    /// The fence has signaled, at the given time in nanoseconds (0 if unknown).
    Signaled(i64),
    Pending,
    /// The fence signaled an error or could not be queried.
    Invalid,
}

/// Handle to an asynchronous completion event.
///
/// Clones share the same underlying file descriptor. Use [`Fence::dup`] to
/// obtain an independent descriptor, e.g. for transport to another process.
#[derive(Debug, Clone, Default)]
pub struct Fence(Option<Arc<OwnedFd>>);

impl Fence {
    /// A fence that is always signaled.
    pub const NO_FENCE: Fence = Fence(None);

    /// Wraps a file descriptor that becomes readable once signaled.
    pub fn new(fd: OwnedFd) -> Self {
        Fence(Some(Arc::new(fd)))
    }

    /// Creates a new unsignaled fence, along with the signaler that completes
    /// it.
    pub fn new_pending() -> io::Result<(Fence, FenceSignaler)> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC))?;
        // Safe because we just created this fd and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let signaler = FenceSignaler {
            fd: File::from(fd.try_clone()?),
        };

        Ok((Fence::new(fd), signaler))
    }

    pub fn is_no_fence(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.0.as_ref().map(|fd| fd.as_fd())
    }

    /// Returns a fence backed by a new file descriptor referring to the same
    /// completion event.
    pub fn dup(&self) -> io::Result<Fence> {
        match &self.0 {
            None => Ok(Fence::NO_FENCE),
            Some(fd) => Ok(Fence::new(fd.try_clone()?)),
        }
    }

    fn poll(fd: BorrowedFd<'_>, timeout_ms: libc::c_int) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        match syscall!(poll(&mut pollfd, 1, timeout_ms))? {
            0 => Ok(false),
            _ if pollfd.revents & libc::POLLNVAL != 0 => {
                Err(io::Error::from_raw_os_error(libc::EBADF))
            }
            _ => Ok(true),
        }
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<(), FenceError> {
        let fd = match &self.0 {
            None => return Ok(()),
            Some(fd) => fd.as_fd(),
        };

        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // Round up so we never wake up before the deadline.
                    let ms = (remaining.as_micros() + 999) / 1000;
                    ms.min(libc::c_int::MAX as u128) as libc::c_int
                }
            };

            match Self::poll(fd, timeout_ms) {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(FenceError::TimedOut),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Waits for the fence to signal, for at most `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    pub fn wait_forever(&self) -> Result<(), FenceError> {
        self.wait_until(None)
    }

    /// Returns whether and when the fence has signaled, without blocking.
    pub fn signal_time(&self) -> SignalTime {
        let fd = match &self.0 {
            None => return SignalTime::Signaled(0),
            Some(fd) => fd.as_fd(),
        };

        match ioctl::sync_file_info(&fd) {
            Ok(info) => match info.status {
                SyncStatus::Signaled => {
                    SignalTime::Signaled(info.signal_time().unwrap_or(0) as i64)
                }
                SyncStatus::Active => SignalTime::Pending,
                SyncStatus::Error(_) => SignalTime::Invalid,
            },
            // Other kinds of fences do not record when they signaled.
            Err(SyncFileInfoError::NotASyncFile) => match Self::poll(fd, 0) {
                Ok(true) => SignalTime::Signaled(0),
                Ok(false) => SignalTime::Pending,
                Err(_) => SignalTime::Invalid,
            },
            Err(SyncFileInfoError::IoctlError(_)) => SignalTime::Invalid,
        }
    }

    /// Returns a fence that signals once both `f1` and `f2` have signaled.
    ///
    /// Merging with `NO_FENCE` returns the other fence. Only `sync_file`s can
    /// otherwise be merged.
    pub fn merge(name: &str, f1: &Fence, f2: &Fence) -> Result<Fence, FenceError> {
        match (&f1.0, &f2.0) {
            (None, _) => Ok(f2.clone()),
            (_, None) => Ok(f1.clone()),
            (Some(fd1), Some(fd2)) => {
                let fd: OwnedFd = ioctl::sync_merge(&**fd1, &**fd2, name)?;
                Ok(Fence::new(fd))
            }
        }
    }
}

/// Completes the fence it was created with by [`Fence::new_pending`].
#[derive(Debug)]
pub struct FenceSignaler {
    fd: File,
}

impl FenceSignaler {
    /// Signals the fence. Signaling an already signaled fence has no effect.
    pub fn signal(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        // The implementation of Write for &File lets us write through a
        // shared reference.
        (&self.fd).write(&buf).map(|_| ())
    }
}
