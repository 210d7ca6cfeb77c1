//! Mounted volume state and derived geometry.

use crate::consts::FIRST_DATA_CLUSTER;
use crate::dev::BlockDev;
use crate::error::FsResult;
use crate::layout::{FsInfo, SuperBlock};

/// Everything the driver knows about the mounted volume. Built once from
/// sector 0 and the FSInfo sector, then read-only until unmount.
#[derive(Clone, Copy, Debug)]
pub struct Volume {
    pub sb: SuperBlock,
    pub fsinfo: FsInfo,
}

impl Volume {
    /// Read and validate the super-block and FSInfo sector. A magic
    /// mismatch in either refuses the mount.
    pub fn mount<D: BlockDev>(dev: &mut D) -> FsResult<Self> {
        let mut sector = [0u8; 512];
        dev.read_at(0, &mut sector)?;
        let sb = SuperBlock::parse(&sector)?;

        let fsinfo_offset = sb.fsinfo_sector as u64 * sb.bytes_per_sector as u64;
        dev.read_at(fsinfo_offset, &mut sector)?;
        let fsinfo = FsInfo::parse(&sector)?;

        Ok(Self { sb, fsinfo })
    }

    pub fn sector_size(&self) -> u32 {
        self.sb.bytes_per_sector as u32
    }

    pub fn cluster_size(&self) -> u32 {
        self.sb.bytes_per_sector as u32 * self.sb.sectors_per_cluster as u32
    }

    /// First sector of the (first) file allocation table.
    pub fn fat_start_sector(&self) -> u32 {
        self.sb.reserved_sectors as u32
    }

    pub fn fat_sectors(&self) -> u32 {
        self.sb.sectors_per_fat
    }

    pub fn root_cluster(&self) -> u32 {
        self.sb.root_cluster
    }

    /// Byte offset of the first data cluster (cluster 2).
    pub fn data_start(&self) -> u64 {
        (self.sb.reserved_sectors as u64
            + self.sb.num_fats as u64 * self.sb.sectors_per_fat as u64)
            * self.sb.bytes_per_sector as u64
    }

    /// Byte offset of a given data cluster. Clusters are indexed from 2;
    /// callers never pass reserved indices.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_start() + (cluster - FIRST_DATA_CLUSTER) as u64 * self.cluster_size() as u64
    }

    /// Number of usable data clusters: bounded both by the sectors present
    /// after the data start and by how many cells the FAT can describe.
    pub fn data_clusters(&self) -> u32 {
        let data_sectors = self
            .sb
            .total_sectors
            .saturating_sub(self.data_start() as u32 / self.sector_size());
        let from_sectors = data_sectors / self.sb.sectors_per_cluster as u32;
        let fat_cells =
            (self.fat_sectors() as u64 * self.sector_size() as u64 / 4) as u32;
        let from_fat = fat_cells.saturating_sub(FIRST_DATA_CLUSTER);
        from_sectors.min(from_fat)
    }

    /// One past the highest valid cluster index.
    pub fn cluster_limit(&self) -> u32 {
        FIRST_DATA_CLUSTER + self.data_clusters()
    }

    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.sb.volume_label)
            .trim_end()
            .to_string()
    }
}
