//! Shared test harness: in-memory FAT32 volumes.
//!
//! Two ways to get a volume, used side by side: `fatfs`-formatted images
//! for cross-verification against an independent implementation, and
//! hand-assembled images when a test needs exact geometry.

#![allow(dead_code)]

use std::io::Cursor;

use fat32d::dev::MemDisk;

// ─── fatfs-formatted volumes ───────────────────────────────────────────────────

/// Create an in-memory FAT32 image using the `fatfs` crate.
///
/// FAT32 requires at least 65 525 data clusters; with the 512-byte clusters
/// fatfs picks for small disks, 40 MiB comfortably clears that.
pub fn make_disk() -> MemDisk {
    const SIZE: usize = 40 * 1024 * 1024;
    let mut cursor = Cursor::new(vec![0u8; SIZE]);
    fatfs::format_volume(
        &mut cursor,
        fatfs::FormatVolumeOptions::new().fat_type(fatfs::FatType::Fat32),
    )
    .expect("format_volume failed");
    MemDisk(cursor.into_inner())
}

/// Write a file into the image via `fatfs` and return the disk.
pub fn disk_with_file(name: &str, content: &[u8]) -> MemDisk {
    let mut disk = make_disk();
    {
        use std::io::Write;
        let mut cursor = Cursor::new(&mut disk.0);
        let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new())
            .expect("FileSystem::new failed");
        let mut f = fs
            .root_dir()
            .create_file(name)
            .expect("create_file failed");
        f.truncate().unwrap();
        f.write_all(content).unwrap();
    }
    disk
}

/// Read a file back through `fatfs`, independently of the driver.
pub fn read_via_fatfs(disk: &mut MemDisk, name: &str) -> Vec<u8> {
    use std::io::Read;
    let mut cursor = Cursor::new(&mut disk.0);
    let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).unwrap();
    let mut f = fs.root_dir().open_file(name).unwrap();
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).unwrap();
    buf
}

// ─── Hand-assembled volumes ────────────────────────────────────────────────────

pub const END_OF_CHAIN: u32 = 0x0FFF_FFFF;

/// Exact-geometry FAT32 image description.
#[derive(Clone, Copy)]
pub struct ImageSpec {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub sectors_per_fat: u32,
    pub total_sectors: u32,
}

impl ImageSpec {
    /// The 64 MiB layout the end-to-end scenarios use: 512-byte sectors,
    /// 8 per cluster, 32 reserved, two 126-sector FATs.
    pub fn small() -> Self {
        Self {
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            reserved_sectors: 32,
            num_fats: 2,
            sectors_per_fat: 126,
            total_sectors: 131072,
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.bytes_per_sector as usize * self.sectors_per_cluster as usize
    }

    pub fn fat_offset(&self, cluster: u32) -> usize {
        self.reserved_sectors as usize * self.bytes_per_sector as usize + cluster as usize * 4
    }

    pub fn data_offset(&self, cluster: u32) -> usize {
        let data_start = (self.reserved_sectors as usize
            + self.num_fats as usize * self.sectors_per_fat as usize)
            * self.bytes_per_sector as usize;
        data_start + (cluster as usize - 2) * self.cluster_size()
    }

    /// Build the image: super-block, FSInfo with valid magics, reserved
    /// FAT cells, and an end-of-chain root directory at cluster 2.
    pub fn build(&self) -> MemDisk {
        let mut img = vec![0u8; self.total_sectors as usize * self.bytes_per_sector as usize];

        // super-block
        put16(&mut img, 11, self.bytes_per_sector);
        img[13] = self.sectors_per_cluster;
        put16(&mut img, 14, self.reserved_sectors);
        img[16] = self.num_fats;
        put32(&mut img, 32, self.total_sectors);
        put32(&mut img, 36, self.sectors_per_fat);
        put32(&mut img, 44, 2); // root cluster
        put16(&mut img, 48, 1); // FSInfo sector
        put16(&mut img, 510, 0xAA55);

        // FSInfo
        let fsinfo = self.bytes_per_sector as usize;
        put32(&mut img[fsinfo..], 0, 0x4161_5252);
        put32(&mut img[fsinfo..], 484, 0x6141_7272);
        put32(&mut img[fsinfo..], 488, 0xFFFF_FFFF);
        put32(&mut img[fsinfo..], 492, 0xFFFF_FFFF);
        put32(&mut img[fsinfo..], 508, 0xAA55_0000);

        // FAT: media/EOC reserved cells plus the root directory cluster.
        self.set_fat(&mut img, 0, 0x0FFF_FFF8);
        self.set_fat(&mut img, 1, END_OF_CHAIN);
        self.set_fat(&mut img, 2, END_OF_CHAIN);

        MemDisk(img)
    }

    pub fn set_fat(&self, img: &mut [u8], cluster: u32, value: u32) {
        let off = self.fat_offset(cluster);
        img[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn get_fat(&self, img: &[u8], cluster: u32) -> u32 {
        let off = self.fat_offset(cluster);
        u32::from_le_bytes(img[off..off + 4].try_into().unwrap()) & 0x0FFF_FFFF
    }

    /// Plant a 32-byte slot in the root directory.
    pub fn add_root_slot(
        &self,
        img: &mut [u8],
        index: usize,
        name: &[u8; 11],
        attributes: u8,
        cluster: u32,
        size: u32,
    ) {
        let off = self.data_offset(2) + index * 32;
        let slot = &mut img[off..off + 32];
        slot.fill(0);
        slot[..11].copy_from_slice(name);
        slot[11] = attributes;
        slot[20..22].copy_from_slice(&(((cluster >> 16) & 0xFFFF) as u16).to_le_bytes());
        slot[26..28].copy_from_slice(&((cluster & 0xFFFF) as u16).to_le_bytes());
        slot[28..32].copy_from_slice(&size.to_le_bytes());
    }
}

fn put16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Collect a whole directory listing through the readdir filler.
pub fn list_dir<D: fat32d::dev::BlockDev>(
    fs: &mut fat32d::FatFs<D>,
    path: &str,
) -> Vec<(String, u64)> {
    let mut entries = Vec::new();
    fs.readdir(path, 0, &mut |name, attr, _next| {
        entries.push((name.to_string(), attr.size));
        false
    })
    .unwrap();
    entries
}
