//! Open-file state and cluster-granular I/O.
//!
//! A `FatFile` carries everything needed to service reads and writes
//! without touching the FAT again: the materialised cluster chain, the
//! current byte offset, and the identity of the directory slot the file
//! came from. Directories are handled by the same machinery; their logical
//! size is the allocated extent, since FAT directories store a size of zero
//! in their slots.

use crate::chain::ClusterChain;
use crate::consts::*;
use crate::dev::BlockDev;
use crate::error::{FsError, FsResult};
use crate::freemap::{alloc_near, alloc_node, release_cluster, FreeMap};
use crate::layout::DirSlot;
use crate::table::FatCache;
use crate::volume::Volume;

/// Release the data clusters and remove the parent slot when the last
/// reference goes away.
pub const FL_DELETE_ON_CLOSE: u8 = 0x01;

/// Mutable engine state threaded through every I/O path: the device, the
/// immutable volume geometry, the FAT cache and the free-space map.
pub struct IoCtx<'a, D: BlockDev> {
    pub dev: &'a mut D,
    pub vol: &'a Volume,
    pub fat: &'a mut FatCache,
    pub map: &'a mut FreeMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

#[derive(Debug)]
pub struct FatFile {
    /// Raw 8.3 slot name; `/` for the synthetic root.
    pub name: [u8; DIR_NAME_LEN],
    /// Starting cluster at open time; doubles as the inode.
    pub ino: u32,
    pub attributes: u8,
    pub chain: ClusterChain,
    pub offset: u64,
    pub size: u64,
    /// Starting cluster of the directory holding this file's slot.
    pub parent: u32,
    /// Slot index within the parent; `None` for the root and for files
    /// whose slot has been removed by unlink.
    pub slot: Option<u32>,
    pub flags: u8,
    /// Copied from the volume at open so cursor updates do not need the
    /// geometry handle.
    pub(crate) cluster_size: u32,
}

impl FatFile {
    /// Materialise an open file from its directory slot.
    pub fn from_slot<D: BlockDev>(
        ctx: &mut IoCtx<'_, D>,
        slot: &DirSlot,
        parent: u32,
        slot_index: Option<u32>,
    ) -> FsResult<Self> {
        let chain = ClusterChain::materialize(ctx.dev, ctx.vol, ctx.fat, slot.start_cluster())?;
        let size = if slot.is_dir() {
            chain.len() as u64 * ctx.vol.cluster_size() as u64
        } else {
            slot.size as u64
        };
        Ok(Self {
            name: slot.name,
            ino: slot.start_cluster(),
            attributes: slot.attributes,
            chain,
            offset: 0,
            size,
            parent,
            slot: slot_index,
            flags: 0,
            cluster_size: ctx.vol.cluster_size(),
        })
    }

    /// The synthetic root directory: no slot of its own, parent is itself.
    pub fn root<D: BlockDev>(ctx: &mut IoCtx<'_, D>) -> FsResult<Self> {
        let root = ctx.vol.root_cluster();
        let chain = ClusterChain::materialize(ctx.dev, ctx.vol, ctx.fat, root)?;
        let mut name = [b' '; DIR_NAME_LEN];
        name[0] = b'/';
        let size = chain.len() as u64 * ctx.vol.cluster_size() as u64;
        Ok(Self {
            name,
            ino: root,
            attributes: ATTR_DIRECTORY,
            chain,
            offset: 0,
            size,
            parent: root,
            slot: None,
            flags: 0,
            cluster_size: ctx.vol.cluster_size(),
        })
    }

    pub fn is_dir(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.attributes & ATTR_READ_ONLY != 0
    }

    // ─── Position ──────────────────────────────────────────────────────────────

    /// Move the offset. Targets outside `[0, size)` are rejected; growing a
    /// file happens through `write`, never by seeking past the end.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> FsResult<u64> {
        let target = match whence {
            Whence::Set => offset,
            Whence::Cur => self.offset as i64 + offset,
            Whence::End => self.size as i64 - 1 + offset,
        };
        if target < 0 || target as u64 >= self.size {
            return Err(FsError::InvalidArgument);
        }
        self.offset = target as u64;
        self.chain.seek_to(self.offset, self.cluster_size);
        Ok(self.offset)
    }

    /// Position for a write: `offset == size` is the append position and is
    /// allowed, anything beyond is not.
    pub fn set_write_pos(&mut self, offset: u64) -> FsResult<()> {
        if offset > self.size {
            return Err(FsError::InvalidArgument);
        }
        self.offset = offset;
        self.chain.seek_to(self.offset, self.cluster_size);
        Ok(())
    }

    // ─── Data transfer ─────────────────────────────────────────────────────────

    /// Read into `buf` from the current offset, walking the in-memory chain
    /// cluster by cluster. Returns the bytes transferred; the transfer ends
    /// early when the chain runs out.
    pub fn read<D: BlockDev>(&mut self, ctx: &mut IoCtx<'_, D>, buf: &mut [u8]) -> FsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cs = ctx.vol.cluster_size() as u64;
        self.chain.seek_to(self.offset, ctx.vol.cluster_size());

        let mut total = 0usize;
        let mut remaining = buf.len();
        // first chunk runs to the end of the current cluster.
        let mut block = remaining.min((cs - self.offset % cs) as usize);
        while remaining > 0 {
            let Some(cluster) = self.chain.current() else {
                break;
            };
            let pos = ctx.vol.cluster_offset(cluster) + self.offset % cs;
            ctx.dev.read_at(pos, &mut buf[total..total + block])?;
            self.offset += block as u64;
            total += block;
            remaining -= block;
            if self.offset % cs == 0 {
                self.chain.advance();
            }
            block = remaining.min(cs as usize);
        }
        self.chain.seek_to(self.offset, ctx.vol.cluster_size());
        Ok(total)
    }

    /// Write `buf` at the current offset, allocating clusters first when
    /// the write runs past the allocated extent. Grows `size` when the
    /// final offset passes it.
    pub fn write<D: BlockDev>(&mut self, ctx: &mut IoCtx<'_, D>, buf: &[u8]) -> FsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cs = ctx.vol.cluster_size() as u64;

        let end = self.offset + buf.len() as u64;
        let allocated = self.chain.len() as u64 * cs;
        if end > allocated {
            let shortfall = end - allocated;
            let clusters = shortfall.div_ceil(cs) as usize;
            self.extend(ctx, clusters)?;
        }

        self.chain.seek_to(self.offset, ctx.vol.cluster_size());
        let mut total = 0usize;
        let mut remaining = buf.len();
        let mut block = remaining.min((cs - self.offset % cs) as usize);
        while remaining > 0 {
            let Some(cluster) = self.chain.current() else {
                break;
            };
            let pos = ctx.vol.cluster_offset(cluster) + self.offset % cs;
            ctx.dev.write_at(pos, &buf[total..total + block])?;
            self.offset += block as u64;
            total += block;
            remaining -= block;
            if self.offset % cs == 0 {
                self.chain.advance();
            }
            block = remaining.min(cs as usize);
        }
        self.chain.seek_to(self.offset, ctx.vol.cluster_size());

        if self.is_dir() {
            self.size = self.chain.len() as u64 * cs;
        } else if self.offset > self.size {
            self.size = self.offset;
        }
        Ok(total)
    }

    /// Append `count` clusters to the chain: the first cluster of an empty
    /// chain comes from the new-node policy, every later one from the
    /// nearest-neighbour policy anchored at the current tail. Clusters
    /// already linked stay linked if a later allocation fails.
    pub fn extend<D: BlockDev>(&mut self, ctx: &mut IoCtx<'_, D>, count: usize) -> FsResult<usize> {
        let mut added = 0usize;
        while added < count {
            let cluster = match self.chain.tail() {
                Some(tail) => alloc_near(ctx.dev, ctx.vol, ctx.fat, ctx.map, tail)?,
                None => {
                    let c = alloc_node(ctx.dev, ctx.vol, ctx.fat, ctx.map)?;
                    self.ino = if self.ino < FIRST_DATA_CLUSTER { c } else { self.ino };
                    c
                }
            };
            self.chain.push(cluster);
            added += 1;
        }
        if self.is_dir() {
            self.size = self.chain.len() as u64 * ctx.vol.cluster_size() as u64;
        }
        Ok(added)
    }

    // ─── Truncation and release ────────────────────────────────────────────────

    /// Shrink the file to `new_len` bytes: the cluster holding byte
    /// `new_len - 1` becomes the chain tail, every successor is released.
    /// Shrinking to zero releases the whole chain.
    pub fn shrink_to<D: BlockDev>(&mut self, ctx: &mut IoCtx<'_, D>, new_len: u64) -> FsResult<()> {
        let cs = ctx.vol.cluster_size() as u64;
        let keep = if new_len == 0 {
            0
        } else {
            ((new_len - 1) / cs + 1) as usize
        };

        if keep < self.chain.len() {
            let tail = self.chain.split_off(keep);
            if let Some(last) = self.chain.tail() {
                ctx.fat.put(ctx.dev, ctx.vol, last, END_CLUSTER_WRITE)?;
            }
            for cluster in tail {
                release_cluster(ctx.dev, ctx.vol, ctx.fat, ctx.map, cluster)?;
            }
        }

        self.size = new_len;
        if self.offset > new_len {
            self.offset = new_len;
        }
        self.chain.seek_to(self.offset, ctx.vol.cluster_size());
        Ok(())
    }

    /// Release every data cluster; used on the last close of a file marked
    /// delete-on-close. Returns how many clusters went back to the pool.
    pub fn release_clusters<D: BlockDev>(&mut self, ctx: &mut IoCtx<'_, D>) -> FsResult<u32> {
        let clusters = self.chain.split_off(0);
        let count = clusters.len() as u32;
        for cluster in clusters {
            release_cluster(ctx.dev, ctx.vol, ctx.fat, ctx.map, cluster)?;
        }
        self.size = 0;
        self.offset = 0;
        Ok(count)
    }
}
