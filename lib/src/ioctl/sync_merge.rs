//! Safe wrapper for the `SYNC_IOC_MERGE` ioctl.
use nix::errno::Errno;
use std::os::unix::io::{AsRawFd, FromRawFd};
use thiserror::Error;

use crate::bindings;
use crate::ioctl::cstr_to_array;

#[doc(hidden)]
mod ioctl {
    use crate::bindings::sync_merge_data;
    nix::ioctl_readwrite!(sync_ioc_merge, crate::bindings::SYNC_IOC_MAGIC, 3, sync_merge_data);
}

#[derive(Debug, Error)]
pub enum SyncMergeError {
    #[error("one of the file descriptors is not a sync_file")]
    NotASyncFile,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<SyncMergeError> for Errno {
    fn from(err: SyncMergeError) -> Self {
        match err {
            SyncMergeError::NotASyncFile => Errno::EINVAL,
            SyncMergeError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `SYNC_IOC_MERGE` ioctl.
///
/// Returns a new sync_file that signals once both `fd1` and `fd2` have
/// signaled. `name` is truncated to fit the kernel's 32 bytes limit.
pub fn sync_merge<F1: AsRawFd, F2: AsRawFd, R: FromRawFd>(
    fd1: &F1,
    fd2: &F2,
    name: &str,
) -> Result<R, SyncMergeError> {
    let mut data = bindings::sync_merge_data {
        name: cstr_to_array(name),
        fd2: fd2.as_raw_fd(),
        ..Default::default()
    };

    match unsafe { ioctl::sync_ioc_merge(fd1.as_raw_fd(), &mut data) } {
        // Safe because the kernel just created this fd for us.
        Ok(_) => Ok(unsafe { R::from_raw_fd(data.fence) }),
        Err(Errno::EINVAL) | Err(Errno::ENOTTY) | Err(Errno::EBADF) => {
            Err(SyncMergeError::NotASyncFile)
        }
        Err(e) => Err(SyncMergeError::IoctlError(e)),
    }
}
