//! Table of active files.
//!
//! Open files are keyed by their starting-cluster identity, which serves as
//! the inode: every file owns exactly one first cluster and no two files
//! share one. Opening a path whose identity is already active hands back
//! the existing entry with its reference count bumped, so size, chain and
//! the delete-on-close flag stay globally coherent across duplicate opens.

use crate::file::FatFile;

struct HandleSlot {
    file: FatFile,
    refs: u32,
}

#[derive(Default)]
pub struct HandleTable {
    slots: Vec<HandleSlot>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the reference count of an active identity and return its file.
    pub fn acquire(&mut self, ino: u32) -> Option<&mut FatFile> {
        let slot = self.slots.iter_mut().find(|s| s.file.ino == ino)?;
        slot.refs += 1;
        Some(&mut slot.file)
    }

    /// Insert a freshly materialised file with one reference. The identity
    /// must not already be active.
    pub fn insert(&mut self, file: FatFile) -> &mut FatFile {
        debug_assert!(
            !self.slots.iter().any(|s| s.file.ino == file.ino),
            "duplicate handle identity"
        );
        self.slots.push(HandleSlot { file, refs: 1 });
        &mut self
            .slots
            .last_mut()
            .expect("slot just pushed")
            .file
    }

    /// Borrow an active file without touching its reference count.
    pub fn get(&mut self, ino: u32) -> Option<&mut FatFile> {
        self.slots
            .iter_mut()
            .find(|s| s.file.ino == ino)
            .map(|s| &mut s.file)
    }

    /// Drop one reference. Returns the file for final cleanup when the
    /// count reaches zero, `None` while other references remain or when the
    /// identity is unknown.
    pub fn release(&mut self, ino: u32) -> Option<FatFile> {
        let pos = self.slots.iter().position(|s| s.file.ino == ino)?;
        let slot = &mut self.slots[pos];
        slot.refs -= 1;
        if slot.refs > 0 {
            return None;
        }
        Some(self.slots.remove(pos).file)
    }

    pub fn refs(&self, ino: u32) -> u32 {
        self.slots
            .iter()
            .find(|s| s.file.ino == ino)
            .map_or(0, |s| s.refs)
    }

    pub fn is_open(&self, ino: u32) -> bool {
        self.slots.iter().any(|s| s.file.ino == ino)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Swap-with-last compaction moved the slot at `from` to `to` inside
    /// directory `parent`; fix any open handle that pointed at it.
    pub fn retarget_slot(&mut self, parent: u32, from: u32, to: u32) {
        for slot in &mut self.slots {
            if slot.file.parent == parent && slot.file.slot == Some(from) {
                slot.file.slot = Some(to);
            }
        }
    }

    /// Rename moved the file's slot into another directory.
    pub fn retarget_parent(&mut self, ino: u32, parent: u32, index: u32) {
        for slot in &mut self.slots {
            if slot.file.ino == ino {
                slot.file.parent = parent;
                slot.file.slot = Some(index);
            }
        }
    }
}
