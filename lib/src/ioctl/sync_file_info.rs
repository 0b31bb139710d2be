//! Safe wrapper for the `SYNC_IOC_FILE_INFO` ioctl.
use nix::errno::Errno;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

use crate::bindings;
use crate::ioctl::string_from_cstr;

#[doc(hidden)]
mod ioctl {
    use crate::bindings::sync_file_info;
    nix::ioctl_readwrite!(sync_ioc_file_info, crate::bindings::SYNC_IOC_MAGIC, 4, sync_file_info);
}

/// Status of a sync_file or of one of its fences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Active,
    Signaled,
    /// The fence has been signaled with an error.
    Error(i32),
}

impl From<i32> for SyncStatus {
    fn from(status: i32) -> Self {
        match status {
            0 => SyncStatus::Active,
            s if s > 0 => SyncStatus::Signaled,
            s => SyncStatus::Error(s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncFenceInfo {
    pub obj_name: String,
    pub driver_name: String,
    pub status: SyncStatus,
    /// Time at which the fence signaled, if it did.
    pub timestamp_ns: u64,
}

impl From<bindings::sync_fence_info> for SyncFenceInfo {
    fn from(info: bindings::sync_fence_info) -> Self {
        SyncFenceInfo {
            obj_name: string_from_cstr(&info.obj_name).unwrap_or_default(),
            driver_name: string_from_cstr(&info.driver_name).unwrap_or_default(),
            status: info.status.into(),
            timestamp_ns: info.timestamp_ns,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncFileInfo {
    pub name: String,
    pub status: SyncStatus,
    pub fences: Vec<SyncFenceInfo>,
}

impl SyncFileInfo {
    /// Returns the time at which the last of the fences signaled, or `None` if
    /// the sync_file is not signaled yet.
    pub fn signal_time(&self) -> Option<u64> {
        match self.status {
            SyncStatus::Signaled => self.fences.iter().map(|f| f.timestamp_ns).max(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncFileInfoError {
    #[error("file descriptor is not a sync_file")]
    NotASyncFile,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<SyncFileInfoError> for Errno {
    fn from(err: SyncFileInfoError) -> Self {
        match err {
            SyncFileInfoError::NotASyncFile => Errno::ENOTTY,
            SyncFileInfoError::IoctlError(e) => e,
        }
    }
}

fn file_info(
    fd: &impl AsRawFd,
    info: &mut bindings::sync_file_info,
) -> Result<(), SyncFileInfoError> {
    match unsafe { ioctl::sync_ioc_file_info(fd.as_raw_fd(), info) } {
        Ok(_) => Ok(()),
        Err(Errno::ENOTTY) | Err(Errno::EINVAL) => Err(SyncFileInfoError::NotASyncFile),
        Err(e) => Err(SyncFileInfoError::IoctlError(e)),
    }
}

/// Safe wrapper around the `SYNC_IOC_FILE_INFO` ioctl.
///
/// The ioctl is called twice: once to learn the number of fences backing the
/// sync_file, then again to retrieve their information.
pub fn sync_file_info(fd: &impl AsRawFd) -> Result<SyncFileInfo, SyncFileInfoError> {
    let mut info = bindings::sync_file_info::default();
    file_info(fd, &mut info)?;

    let mut fences = vec![bindings::sync_fence_info::default(); info.num_fences as usize];
    if !fences.is_empty() {
        info.sync_fence_info = fences.as_mut_ptr() as u64;
        file_info(fd, &mut info)?;
        fences.truncate(info.num_fences as usize);
    }

    Ok(SyncFileInfo {
        name: string_from_cstr(&info.name).unwrap_or_default(),
        status: info.status.into(),
        fences: fences.into_iter().map(SyncFenceInfo::from).collect(),
    })
}
