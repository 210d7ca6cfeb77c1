//! Packing directory slots into portable attribute records.

use crate::consts::*;
use crate::dostime::unix_time;
use crate::layout::DirSlot;
use crate::volume::Volume;

pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;

/// `rwxr-xr-x`: FAT has no owner concept, so everyone may read and
/// traverse; only the write bits react to the read-only attribute.
const PERM_BASE: u32 = 0o755;
const PERM_WRITE_BITS: u32 = 0o222;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttr {
    /// Starting cluster, standing in for an inode number.
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    /// The cluster size; FAT allocates whole clusters.
    pub blksize: u32,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
}

/// Extract a file's metadata from its directory slot.
pub fn unpack_attributes(vol: &Volume, slot: &DirSlot) -> FileAttr {
    let cluster_size = vol.cluster_size() as u64;
    // a partially filled final cluster still occupies a whole cluster.
    let blocks = (slot.size as u64).div_ceil(cluster_size);

    let mut mode = PERM_BASE;
    mode |= if slot.is_dir() { S_IFDIR } else { S_IFREG };
    if slot.is_read_only() {
        mode &= !PERM_WRITE_BITS;
    }

    FileAttr {
        ino: slot.start_cluster() as u64,
        mode,
        nlink: 1,
        size: slot.size as u64,
        blksize: vol.cluster_size(),
        blocks,
        // no time-of-day is stored for accesses, only the date.
        atime: unix_time(slot.access_date, 0),
        mtime: unix_time(slot.write_date, slot.write_time),
    }
}

/// The record `statvfs` reports, fed from the free-space map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeStats {
    pub block_size: u32,
    pub fragment_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub name_max: u32,
}

impl VolumeStats {
    pub fn new(vol: &Volume, used: u32, free: u32) -> Self {
        Self {
            block_size: vol.cluster_size(),
            fragment_size: vol.cluster_size(),
            blocks: used as u64 + free as u64,
            blocks_free: free as u64,
            blocks_avail: free as u64,
            name_max: DIR_NAME_LEN as u32,
        }
    }
}
