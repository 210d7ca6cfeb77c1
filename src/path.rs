//! Path resolution.
//!
//! Paths are absolute, `/`-separated, and every component is an 8.3 short
//! name. Resolution walks the directory tree one component at a time and
//! hands back a copy of the final slot together with its parent directory,
//! still open, and the slot index within it.

use crate::consts::*;
use crate::dev::BlockDev;
use crate::dir;
use crate::error::{FsError, FsResult};
use crate::file::{FatFile, IoCtx};
use crate::layout::DirSlot;

/// Outcome of a successful resolution. For the root path the slot is
/// synthetic and there is no index.
pub struct Resolved {
    pub slot: DirSlot,
    pub parent: FatFile,
    pub index: Option<u32>,
}

/// The root directory does not occur in any directory table; fabricate the
/// slot other components would have provided.
pub fn root_slot<D: BlockDev>(ctx: &IoCtx<'_, D>) -> DirSlot {
    let mut slot = DirSlot::empty();
    slot.name[0] = b'/';
    slot.name[1..].fill(b' ');
    slot.attributes = ATTR_DIRECTORY;
    slot.set_start_cluster(ctx.vol.root_cluster());
    slot
}

/// Walk `path` from the root. Fails with `NoEntry` when a component is
/// missing and `NotDirectory` when the walk tries to descend through a
/// file.
pub fn resolve<D: BlockDev>(ctx: &mut IoCtx<'_, D>, path: &str) -> FsResult<Resolved> {
    let mut current = FatFile::root(ctx)?;
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();

    if components.is_empty() {
        let slot = root_slot(ctx);
        return Ok(Resolved {
            slot,
            parent: current,
            index: None,
        });
    }

    for (depth, &component) in components.iter().enumerate() {
        if !current.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let (index, slot) =
            dir::find_slot(ctx, &mut current, component)?.ok_or(FsError::NoEntry)?;
        if depth + 1 == components.len() {
            return Ok(Resolved {
                slot,
                parent: current,
                index: Some(index),
            });
        }
        let parent_ino = current.ino;
        current = FatFile::from_slot(ctx, &slot, parent_ino, Some(index))?;
    }
    unreachable!("loop returns on the final component");
}

/// Split a path into its parent directory and final component, the way
/// create, rename and mkdir need it.
pub fn split_parent(path: &str) -> FsResult<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    match trimmed.rfind('/') {
        Some(i) => Ok((&trimmed[..i], &trimmed[i + 1..])),
        None => Err(FsError::InvalidArgument),
    }
}
