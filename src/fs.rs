//! The filesystem façade.
//!
//! One `FatFs` owns everything the daemon shares across requests: the
//! device, the immutable volume geometry, the FAT cache, the free-space map
//! and the table of active files. The bridge drives it one operation at a
//! time; nothing here survives a request except through those fields.
//!
//! Handles crossing the bridge are starting-cluster identities, never
//! pointers.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::consts::*;
use crate::dev::BlockDev;
use crate::dir;
use crate::dostime::{dos_date, dos_time};
use crate::error::{FsError, FsResult};
use crate::file::{FatFile, IoCtx, Whence, FL_DELETE_ON_CLOSE};
use crate::freemap::{alloc_node, FreeMap};
use crate::handles::HandleTable;
use crate::layout::DirSlot;
use crate::path::{self, Resolved};
use crate::stat::{unpack_attributes, FileAttr, VolumeStats};
use crate::table::FatCache;
use crate::volume::Volume;

pub struct FatFs<D: BlockDev> {
    dev: D,
    volume: Volume,
    fat: FatCache,
    map: FreeMap,
    handles: HandleTable,
}

impl<D: BlockDev> std::fmt::Debug for FatFs<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatFs").field("volume", &self.volume).finish()
    }
}

impl<D: BlockDev> FatFs<D> {
    /// Validate the volume and build the mount-time state, in order: free
    /// map scan, handle table, FAT cache.
    pub fn mount(mut dev: D) -> FsResult<Self> {
        let volume = Volume::mount(&mut dev)?;
        let map = FreeMap::build(&mut dev, &volume)?;
        let handles = HandleTable::new();
        let fat = FatCache::new();

        log::info!(
            "mounted volume '{}' ({} clusters of {} bytes, {} free)",
            volume.label(),
            map.used_clusters() + map.free_clusters(),
            volume.cluster_size(),
            map.free_clusters(),
        );
        Ok(Self {
            dev,
            volume,
            fat,
            map,
            handles,
        })
    }

    /// Flush the device on the way down, leaving current counters in the
    /// FSInfo sector for the next mount.
    pub fn unmount(mut self) -> FsResult<()> {
        self.sync_fsinfo()?;
        self.dev.flush()?;
        log::info!("volume unmounted");
        Ok(())
    }

    /// Unmount and hand the device back, for callers that embed the engine
    /// and keep driving the underlying storage.
    pub fn into_device(mut self) -> FsResult<D> {
        self.sync_fsinfo()?;
        self.dev.flush()?;
        Ok(self.dev)
    }

    /// Write the live free-cluster count and a first-free hint back into
    /// the FSInfo sector. The hint helps traditional drivers; this one
    /// rebuilds its map from the FAT at every mount.
    fn sync_fsinfo(&mut self) -> FsResult<()> {
        use crate::layout::{write_u32, FSINFO_FREE_COUNT_OFFSET};

        let sector =
            self.volume.sb.fsinfo_sector as u64 * self.volume.sector_size() as u64;
        let mut counters = [0u8; 8];
        write_u32(&mut counters, 0, self.map.free_clusters());
        let hint = self
            .map
            .regions()
            .first()
            .map_or(0xFFFF_FFFF, |r| r.start);
        write_u32(&mut counters, 4, hint);
        self.dev
            .write_at(sector + FSINFO_FREE_COUNT_OFFSET as u64, &counters)?;
        Ok(())
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn free_clusters(&self) -> u32 {
        self.map.free_clusters()
    }

    pub fn used_clusters(&self) -> u32 {
        self.map.used_clusters()
    }

    fn parts(&mut self) -> (IoCtx<'_, D>, &mut HandleTable) {
        let Self {
            dev,
            volume,
            fat,
            map,
            handles,
        } = self;
        (
            IoCtx {
                dev,
                vol: &*volume,
                fat,
                map,
            },
            handles,
        )
    }

    // ─── Open and close ────────────────────────────────────────────────────────

    /// Open a file or directory, deduplicating by starting-cluster
    /// identity. The returned token is that identity.
    pub fn open(&mut self, fs_path: &str) -> FsResult<u64> {
        self.open_internal(fs_path, false)
    }

    /// Open a directory. Fails with `NotDirectory` when the path names a
    /// regular file.
    pub fn opendir(&mut self, fs_path: &str) -> FsResult<u64> {
        self.open_internal(fs_path, true)
    }

    fn open_internal(&mut self, fs_path: &str, want_dir: bool) -> FsResult<u64> {
        let (mut ctx, handles) = self.parts();
        let mut r = path::resolve(&mut ctx, fs_path)?;

        let ino = match r.index {
            None => ctx.vol.root_cluster(),
            Some(index) => {
                if want_dir && !r.slot.is_dir() {
                    return Err(FsError::NotDirectory);
                }
                let mut ino = r.slot.start_cluster();
                if ino < FIRST_DATA_CLUSTER {
                    // a zero-size file written by another driver carries no
                    // cluster yet; assign one so the identity is stable.
                    let cluster = alloc_node(ctx.dev, ctx.vol, ctx.fat, ctx.map)?;
                    r.slot.set_start_cluster(cluster);
                    dir::write_slot(&mut ctx, &mut r.parent, index, &r.slot)?;
                    ino = cluster;
                }
                ino
            }
        };

        if handles.acquire(ino).is_some() {
            return Ok(ino as u64);
        }
        let file = match r.index {
            None => FatFile::root(&mut ctx)?,
            Some(index) => FatFile::from_slot(&mut ctx, &r.slot, r.parent.ino, Some(index))?,
        };
        handles.insert(file);
        Ok(ino as u64)
    }

    /// Drop one reference to an open handle. On the last reference of a
    /// file marked delete-on-close, its data clusters go back to the free
    /// pool (the directory slot is already gone).
    pub fn release(&mut self, fh: u64) -> FsResult<()> {
        let ino = fh as u32;
        let (mut ctx, handles) = self.parts();
        if !handles.is_open(ino) {
            return Err(FsError::InvalidArgument);
        }
        if let Some(mut file) = handles.release(ino) {
            if file.flags & FL_DELETE_ON_CLOSE != 0 {
                let released = file.release_clusters(&mut ctx)?;
                log::debug!("last close released {released} clusters of {fh}");
            }
        }
        Ok(())
    }

    /// Directories close the same way files do.
    pub fn releasedir(&mut self, fh: u64) -> FsResult<()> {
        self.release(fh)
    }

    // ─── Data plane ────────────────────────────────────────────────────────────

    /// Read from an open handle at an explicit offset. Reading exactly at
    /// the end of the file returns zero bytes; positions beyond it cannot
    /// be established. A successful read touches the access date.
    pub fn read(&mut self, fh: u64, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let ino = fh as u32;
        let (mut ctx, handles) = self.parts();
        let file = handles.get(ino).ok_or(FsError::InvalidArgument)?;

        if offset == file.size {
            return Ok(0);
        }
        if offset > file.size {
            return Err(FsError::EndOfFile);
        }
        file.seek(offset as i64, Whence::Set)
            .map_err(|_| FsError::EndOfFile)?;

        let wanted = buf.len().min((file.size - offset) as usize);
        let read = file.read(&mut ctx, &mut buf[..wanted])?;

        let parent = file.parent;
        let slot_index = file.slot;
        if let Some(index) = slot_index {
            let date = dos_date(now());
            // metadata failure does not undo a completed transfer.
            if let Err(e) = update_slot(&mut ctx, parent, index, |s| s.access_date = date) {
                log::debug!("access-date update failed: {e}");
            }
        }
        Ok(read)
    }

    /// Write through an open handle at an explicit offset, growing the file
    /// (and its chain) as needed. Offsets beyond the current size are
    /// invalid; appends start exactly at it.
    pub fn write(&mut self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let ino = fh as u32;
        let (mut ctx, handles) = self.parts();
        let file = handles.get(ino).ok_or(FsError::InvalidArgument)?;

        if file.is_read_only() {
            return Err(FsError::PermissionDenied);
        }
        file.set_write_pos(offset)?;
        let written = file.write(&mut ctx, data)?;

        let parent = file.parent;
        let slot_index = file.slot;
        let size = file.size;
        let first = file.chain.first().unwrap_or(0);
        let is_dir = file.is_dir();
        if let Some(index) = slot_index {
            let (date, time) = (dos_date(now()), dos_time(now()));
            if let Err(e) = update_slot(&mut ctx, parent, index, |s| {
                if !is_dir {
                    s.size = size as u32;
                }
                s.set_start_cluster(first);
                s.write_date = date;
                s.write_time = time;
            }) {
                log::debug!("write-time update failed: {e}");
            }
        }
        Ok(written)
    }

    // ─── Metadata ──────────────────────────────────────────────────────────────

    pub fn getattr(&mut self, fs_path: &str) -> FsResult<FileAttr> {
        let (mut ctx, _) = self.parts();
        let r = path::resolve(&mut ctx, fs_path)?;
        Ok(unpack_attributes(ctx.vol, &r.slot))
    }

    /// Geometry plus the live counts from the free-space map.
    pub fn statfs(&self) -> VolumeStats {
        VolumeStats::new(
            &self.volume,
            self.map.used_clusters(),
            self.map.free_clusters(),
        )
    }

    /// Existence and writability probe. Reading and traversal are always
    /// permitted; only the read-only attribute can deny anything.
    pub fn access(&mut self, fs_path: &str, write: bool) -> FsResult<()> {
        let (mut ctx, _) = self.parts();
        let r = path::resolve(&mut ctx, fs_path)?;
        if write && r.slot.is_read_only() {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }

    /// Push buffered device writes to stable storage. The FAT cache is
    /// write-through, so the device itself holds the only volatile state.
    pub fn flush(&mut self) -> FsResult<()> {
        self.dev.flush()?;
        Ok(())
    }

    pub fn set_times(&mut self, fs_path: &str, atime: i64, mtime: i64) -> FsResult<()> {
        let (mut ctx, _) = self.parts();
        let mut r = path::resolve(&mut ctx, fs_path)?;
        let index = r.index.ok_or(FsError::InvalidArgument)?;
        if r.slot.is_read_only() {
            return Err(FsError::PermissionDenied);
        }
        let mut slot = r.slot;
        slot.access_date = dos_date(atime);
        slot.write_date = dos_date(mtime);
        slot.write_time = dos_time(mtime);
        dir::write_slot(&mut ctx, &mut r.parent, index, &slot)
    }

    // ─── Namespace ─────────────────────────────────────────────────────────────

    /// Create a regular file with one freshly allocated cluster.
    pub fn mknod(&mut self, fs_path: &str) -> FsResult<()> {
        self.create(fs_path, ATTR_ARCHIVE)
    }

    /// Create a directory: the same node creation with the directory
    /// attribute set.
    pub fn mkdir(&mut self, fs_path: &str) -> FsResult<()> {
        self.create(fs_path, ATTR_DIRECTORY)
    }

    fn create(&mut self, fs_path: &str, attributes: u8) -> FsResult<()> {
        let (parent_path, name) = path::split_parent(fs_path)?;
        let encoded = dir::encode_name(name)?;

        let (mut ctx, _) = self.parts();
        let mut parent = resolve_dir(&mut ctx, parent_path)?;
        if dir::find_slot(&mut ctx, &mut parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let cluster = alloc_node(ctx.dev, ctx.vol, ctx.fat, ctx.map)?;
        let unix = now();
        let (date, time) = (dos_date(unix), dos_time(unix));

        let mut slot = DirSlot::empty();
        slot.name = encoded;
        slot.attributes = attributes;
        slot.creation_time = time;
        slot.creation_date = date;
        slot.access_date = date;
        slot.write_time = time;
        slot.write_date = date;
        slot.set_start_cluster(cluster);
        slot.size = 0;

        dir::append_slot(&mut ctx, &mut parent, &slot)?;
        log::debug!("created {fs_path} at cluster {cluster}");
        Ok(())
    }

    /// Remove a file: the slot disappears now, the data clusters when the
    /// last open reference goes away.
    pub fn unlink(&mut self, fs_path: &str) -> FsResult<()> {
        self.remove(fs_path, false)
    }

    pub fn rmdir(&mut self, fs_path: &str) -> FsResult<()> {
        self.remove(fs_path, true)
    }

    fn remove(&mut self, fs_path: &str, expect_dir: bool) -> FsResult<()> {
        // open through the table so concurrent opens share the flag.
        let fh = self.open(fs_path)?;
        let ino = fh as u32;

        let outcome = (|| -> FsResult<()> {
            let (mut ctx, handles) = self.parts();
            let file = handles.get(ino).expect("handle just opened");
            if file.slot.is_none() {
                // the root, or a file whose slot is already gone.
                return Err(FsError::InvalidArgument);
            }
            if file.is_read_only() {
                return Err(FsError::PermissionDenied);
            }
            if expect_dir && !file.is_dir() {
                return Err(FsError::NotDirectory);
            }
            if file.is_dir() && !dir::is_empty(&mut ctx, file)? {
                return Err(FsError::NotEmpty);
            }

            file.flags |= FL_DELETE_ON_CLOSE;
            let parent = file.parent;
            let index = file.slot.take().expect("checked above");

            let mut parent_dir = open_dir_at(&mut ctx, parent)?;
            if let Some(moved) = dir::delete_slot(&mut ctx, &mut parent_dir, index)? {
                handles.retarget_slot(parent, moved.from, moved.to);
            }
            log::debug!("unlinked {fs_path}");
            Ok(())
        })();

        let closed = self.release(fh);
        outcome.and(closed)
    }

    /// Move an entry: the slot leaves its source directory (swap-with-last),
    /// takes the new name, and lands in the destination directory.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> FsResult<()> {
        let (new_parent_path, new_name) = path::split_parent(new_path)?;
        let encoded = dir::encode_name(new_name)?;

        let (mut ctx, handles) = self.parts();
        let mut new_parent = resolve_dir(&mut ctx, new_parent_path)?;
        if dir::find_slot(&mut ctx, &mut new_parent, new_name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let ro = path::resolve(&mut ctx, old_path)?;
        let old_index = ro.index.ok_or(FsError::InvalidArgument)?;
        let mut old_parent = ro.parent;

        if let Some(moved) = dir::delete_slot(&mut ctx, &mut old_parent, old_index)? {
            handles.retarget_slot(old_parent.ino, moved.from, moved.to);
        }

        let mut slot = ro.slot;
        slot.name = encoded;
        let new_index = dir::append_slot(&mut ctx, &mut new_parent, &slot)?;
        handles.retarget_parent(slot.start_cluster(), new_parent.ino, new_index);
        log::debug!("renamed {old_path} -> {new_path}");
        Ok(())
    }

    /// Shrink by cutting the chain behind the new final cluster, grow by
    /// writing zeros through the ordinary write path.
    pub fn truncate(&mut self, fs_path: &str, length: u64) -> FsResult<()> {
        let fh = self.open(fs_path)?;
        let ino = fh as u32;

        let outcome = (|| -> FsResult<()> {
            let (mut ctx, handles) = self.parts();
            let file = handles.get(ino).expect("handle just opened");
            if file.is_read_only() {
                return Err(FsError::PermissionDenied);
            }
            if file.is_dir() {
                return Err(FsError::InvalidArgument);
            }

            let old_size = file.size;
            if old_size > length {
                file.shrink_to(&mut ctx, length)?;
            } else if old_size < length {
                file.set_write_pos(old_size)?;
                let zeros = vec![0u8; ctx.vol.cluster_size() as usize];
                let mut remaining = length - old_size;
                while remaining > 0 {
                    let chunk = (zeros.len() as u64).min(remaining) as usize;
                    let n = file.write(&mut ctx, &zeros[..chunk])?;
                    if n == 0 {
                        return Err(FsError::NoSpace);
                    }
                    remaining -= n as u64;
                }
            }

            let parent = file.parent;
            let slot_index = file.slot;
            let first = file.chain.first().unwrap_or(0);
            if let Some(index) = slot_index {
                let (date, time) = (dos_date(now()), dos_time(now()));
                update_slot(&mut ctx, parent, index, |s| {
                    s.size = length as u32;
                    s.set_start_cluster(first);
                    s.write_date = date;
                    s.write_time = time;
                })?;
            }
            Ok(())
        })();

        let closed = self.release(fh);
        outcome.and(closed)
    }

    /// Iterate directory slots from `offset`, feeding each real entry to
    /// the filler with the index to resume from. Stops when the filler
    /// reports it is full or at the first unused slot.
    pub fn readdir(
        &mut self,
        fs_path: &str,
        offset: u64,
        filler: &mut dyn FnMut(&str, &FileAttr, u64) -> bool,
    ) -> FsResult<()> {
        let (mut ctx, _) = self.parts();
        let r = path::resolve(&mut ctx, fs_path)?;
        let mut dir_file = resolved_as_dir(&mut ctx, r)?;

        let mut index = offset as u32;
        while let Some(slot) = dir::read_slot(&mut ctx, &mut dir_file, index)? {
            if slot.is_end() {
                break;
            }
            if slot.is_deleted() || slot.is_long_name() || slot.is_volume_label() {
                index += 1;
                continue;
            }
            let name = dir::display_name(&slot.name);
            let attr = unpack_attributes(ctx.vol, &slot);
            if filler(&name, &attr, index as u64 + 1) {
                break;
            }
            index += 1;
        }
        Ok(())
    }
}

// ─── Shared helpers ────────────────────────────────────────────────────────────

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Materialise a directory file from its starting cluster alone; FAT
/// directories carry no size, so the chain defines the extent.
fn open_dir_at<D: BlockDev>(ctx: &mut IoCtx<'_, D>, cluster: u32) -> FsResult<FatFile> {
    let mut slot = DirSlot::empty();
    slot.attributes = ATTR_DIRECTORY;
    slot.set_start_cluster(cluster);
    FatFile::from_slot(ctx, &slot, cluster, None)
}

/// Resolve a path that must name a directory and materialise it.
fn resolve_dir<D: BlockDev>(ctx: &mut IoCtx<'_, D>, fs_path: &str) -> FsResult<FatFile> {
    let r = path::resolve(ctx, fs_path)?;
    resolved_as_dir(ctx, r)
}

fn resolved_as_dir<D: BlockDev>(ctx: &mut IoCtx<'_, D>, r: Resolved) -> FsResult<FatFile> {
    match r.index {
        None => Ok(r.parent), // the root resolves to itself
        Some(index) => {
            if !r.slot.is_dir() {
                return Err(FsError::NotDirectory);
            }
            let parent_ino = r.parent.ino;
            FatFile::from_slot(ctx, &r.slot, parent_ino, Some(index))
        }
    }
}

/// Read-modify-write one slot of the directory starting at `dir_cluster`.
fn update_slot<D: BlockDev>(
    ctx: &mut IoCtx<'_, D>,
    dir_cluster: u32,
    index: u32,
    mutate: impl FnOnce(&mut DirSlot),
) -> FsResult<()> {
    let mut dir_file = open_dir_at(ctx, dir_cluster)?;
    let mut slot = dir::read_slot(ctx, &mut dir_file, index)?.ok_or(FsError::NoEntry)?;
    mutate(&mut slot);
    dir::write_slot(ctx, &mut dir_file, index, &slot)
}
