//! Slot-keyed directory operations.
//!
//! A directory is an ordinary cluster-chain file whose content is an array
//! of 32-byte slots. The driver keeps the in-use slots contiguous at the
//! front: deletion swaps the last in-use slot into the vacated index and
//! marks the old position unused, so every linear scan may stop at the
//! first slot whose name begins with 0x00.

use crate::consts::*;
use crate::dev::BlockDev;
use crate::error::{FsError, FsResult};
use crate::file::{FatFile, IoCtx};
use crate::layout::DirSlot;

/// A slot relocation performed by swap-with-last compaction, reported so
/// open handles pointing at the moved slot can be retargeted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MovedSlot {
    /// Starting cluster of the entry that moved.
    pub ino: u32,
    pub from: u32,
    pub to: u32,
}

/// Read the slot at `index`, or `None` past the end of the directory file.
pub fn read_slot<D: BlockDev>(
    ctx: &mut IoCtx<'_, D>,
    dir: &mut FatFile,
    index: u32,
) -> FsResult<Option<DirSlot>> {
    let pos = index as u64 * DIR_SLOT_SIZE as u64;
    if pos + DIR_SLOT_SIZE as u64 > dir.size {
        return Ok(None);
    }
    dir.set_write_pos(pos)?;
    let mut raw = [0u8; DIR_SLOT_SIZE];
    let n = dir.read(ctx, &mut raw)?;
    if n < DIR_SLOT_SIZE {
        return Ok(None);
    }
    Ok(Some(DirSlot::parse(&raw)))
}

/// Write `slot` at `index`. Writing one slot past the end grows the
/// directory file, allocating a fresh (zeroed) cluster when needed.
pub fn write_slot<D: BlockDev>(
    ctx: &mut IoCtx<'_, D>,
    dir: &mut FatFile,
    index: u32,
    slot: &DirSlot,
) -> FsResult<()> {
    let pos = index as u64 * DIR_SLOT_SIZE as u64;
    dir.set_write_pos(pos)?;
    dir.write(ctx, &slot.pack())?;
    Ok(())
}

/// Append a slot at the first unused position, returning its index.
pub fn append_slot<D: BlockDev>(
    ctx: &mut IoCtx<'_, D>,
    dir: &mut FatFile,
    slot: &DirSlot,
) -> FsResult<u32> {
    let mut index = 0u32;
    loop {
        match read_slot(ctx, dir, index)? {
            Some(existing) if !existing.is_end() && !existing.is_deleted() => index += 1,
            // unused slot, or end of the directory file: write here.
            _ => break,
        }
    }
    write_slot(ctx, dir, index, slot)?;
    Ok(index)
}

/// Remove the slot at `index` by swap-with-last. Returns the relocation the
/// compaction performed, if any.
pub fn delete_slot<D: BlockDev>(
    ctx: &mut IoCtx<'_, D>,
    dir: &mut FatFile,
    index: u32,
) -> FsResult<Option<MovedSlot>> {
    // find the last in-use slot.
    let mut last = index;
    let mut probe = index + 1;
    while let Some(slot) = read_slot(ctx, dir, probe)? {
        if slot.is_end() {
            break;
        }
        if !slot.is_deleted() {
            last = probe;
        }
        probe += 1;
    }

    if last == index {
        // deleting the final in-use slot: just mark it unused.
        let mut slot = read_slot(ctx, dir, index)?.ok_or(FsError::NoEntry)?;
        slot.name[0] = 0x00;
        write_slot(ctx, dir, index, &slot)?;
        return Ok(None);
    }

    let moved = read_slot(ctx, dir, last)?.ok_or(FsError::NoEntry)?;
    write_slot(ctx, dir, index, &moved)?;
    let mut blank = moved;
    blank.name[0] = 0x00;
    write_slot(ctx, dir, last, &blank)?;
    Ok(Some(MovedSlot {
        ino: moved.start_cluster(),
        from: last,
        to: index,
    }))
}

/// Linear scan for a name-matching entry. Slots belonging to long-name
/// sequences or the volume label are not real entries and are skipped.
pub fn find_slot<D: BlockDev>(
    ctx: &mut IoCtx<'_, D>,
    dir: &mut FatFile,
    component: &str,
) -> FsResult<Option<(u32, DirSlot)>> {
    let mut index = 0u32;
    while let Some(slot) = read_slot(ctx, dir, index)? {
        if slot.is_end() {
            return Ok(None);
        }
        if !slot.is_deleted() && !slot.is_long_name() && !slot.is_volume_label() {
            if names_match(&slot.name, component) {
                return Ok(Some((index, slot)));
            }
        }
        index += 1;
    }
    Ok(None)
}

/// True when every slot carries a reserved name: `.`, `..`, or unused.
pub fn is_empty<D: BlockDev>(ctx: &mut IoCtx<'_, D>, dir: &mut FatFile) -> FsResult<bool> {
    let mut index = 0u32;
    while let Some(slot) = read_slot(ctx, dir, index)? {
        if slot.is_end() {
            break;
        }
        if !slot.is_deleted() && !is_reserved_name(&slot.name) {
            return Ok(false);
        }
        index += 1;
    }
    Ok(true)
}

// ─── 8.3 names ─────────────────────────────────────────────────────────────────

/// The names excluded from is-directory-empty checks.
fn is_reserved_name(name: &[u8; DIR_NAME_LEN]) -> bool {
    if name[0] == 0x00 {
        return true;
    }
    let dot = {
        let mut n = [b' '; DIR_NAME_LEN];
        n[0] = b'.';
        n
    };
    let dotdot = {
        let mut n = [b' '; DIR_NAME_LEN];
        n[0] = b'.';
        n[1] = b'.';
        n
    };
    *name == dot || *name == dotdot
}

/// Encode a path component into the padded 11-byte 8.3 form, uppercased.
pub fn encode_name(component: &str) -> FsResult<[u8; DIR_NAME_LEN]> {
    let mut name = [b' '; DIR_NAME_LEN];
    if component == "." {
        name[0] = b'.';
        return Ok(name);
    }
    if component == ".." {
        name[0] = b'.';
        name[1] = b'.';
        return Ok(name);
    }

    let (base, ext) = match component.rfind('.') {
        Some(i) => (&component[..i], &component[i + 1..]),
        None => (component, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(FsError::InvalidArgument);
    }
    for (i, b) in base.bytes().enumerate() {
        if !b.is_ascii() || b == b'/' {
            return Err(FsError::InvalidArgument);
        }
        name[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().enumerate() {
        if !b.is_ascii() || b == b'/' {
            return Err(FsError::InvalidArgument);
        }
        name[8 + i] = b.to_ascii_uppercase();
    }
    Ok(name)
}

/// Case-insensitive match of a raw slot name against a path component.
pub fn names_match(name: &[u8; DIR_NAME_LEN], component: &str) -> bool {
    match encode_name(component) {
        Ok(encoded) => name.eq_ignore_ascii_case(&encoded),
        Err(_) => false,
    }
}

/// Render a raw slot name as `BASE.EXT`, with trailing padding removed.
pub fn display_name(name: &[u8; DIR_NAME_LEN]) -> String {
    if name[0] == b'.' {
        // dot entries keep their literal form.
        let end = name.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        return String::from_utf8_lossy(&name[..end]).into_owned();
    }
    let base_end = name[..8].iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    let ext_end = name[8..].iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    let mut out = String::from_utf8_lossy(&name[..base_end]).into_owned();
    if ext_end > 0 {
        out.push('.');
        out.push_str(&String::from_utf8_lossy(&name[8..8 + ext_end]));
    }
    out
}
