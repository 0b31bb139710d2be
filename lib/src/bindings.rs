//! Kernel structures of the `sync_file` userspace API (`linux/sync_file.h`).
//!
//! Only the handful of structures needed by the fence ioctls are declared
//! here. Their layout must match the kernel's exactly.
#![allow(non_camel_case_types)]

/// Magic number of the sync_file ioctls.
pub const SYNC_IOC_MAGIC: u8 = b'>';

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct sync_merge_data {
    pub name: [u8; 32],
    pub fd2: i32,
    pub fence: i32,
    pub flags: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct sync_fence_info {
    pub obj_name: [u8; 32],
    pub driver_name: [u8; 32],
    pub status: i32,
    pub flags: u32,
    pub timestamp_ns: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct sync_file_info {
    pub name: [u8; 32],
    pub status: i32,
    pub flags: u32,
    pub num_fences: u32,
    pub pad: u32,
    /// Userspace pointer to an array of `num_fences` [`sync_fence_info`].
    pub sync_fence_info: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<sync_merge_data>(), 48);
        assert_eq!(size_of::<sync_fence_info>(), 80);
        assert_eq!(size_of::<sync_file_info>(), 56);
    }
}
