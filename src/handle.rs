//! The open-handle list: every live directory iterator, open file, and
//! in-progress traversal registers itself here so a commit that splits,
//! drops, or relocates the mdir it's positioned in can patch the handle's
//! bookkeeping in place, rather than leaving it pointing at a block that no
//! longer holds what the handle thinks it does.
//!
//! A handle that can't be patched cleanly (its mid was itself removed out
//! from under it, e.g. the rename-over-stickynote race) is marked
//! desynchronized instead; the next operation through it returns
//! [`crate::error::Error::Desync`] rather than silently operating on the
//! wrong entry.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Dir,
    File,
    Traversal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub mbid: u32,
    pub blocks: [u32; 2],
    pub rid: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleId(u64);

#[derive(Debug, Clone)]
struct Entry {
    kind: Kind,
    pos: Position,
    desynced: bool,
}

/// The filesystem-wide registry of open handles. One instance lives on the
/// mounted filesystem; the commit pipeline consults it after every mdir
/// mutation that moves entries around.
#[derive(Debug, Default)]
pub struct HandleList {
    next_id: u64,
    entries: HashMap<u64, Entry>,
}

impl HandleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: Kind, pos: Position) -> HandleId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, Entry { kind, pos, desynced: false });
        HandleId(id)
    }

    pub fn deregister(&mut self, id: HandleId) {
        self.entries.remove(&id.0);
    }

    pub fn position(&self, id: HandleId) -> Option<Position> {
        self.entries.get(&id.0).map(|e| e.pos)
    }

    pub fn is_desynced(&self, id: HandleId) -> bool {
        self.entries.get(&id.0).map(|e| e.desynced).unwrap_or(false)
    }

    /// After relocating an mdir from `old_blocks` to `new_blocks`, patch
    /// every handle positioned there. `rid` is unaffected by a relocate
    /// (only the physical block pair changed), unlike a split (see
    /// [`Self::patch_split`]).
    pub fn patch_relocation(&mut self, old_blocks: [u32; 2], new_blocks: [u32; 2]) {
        for e in self.entries.values_mut() {
            if e.pos.blocks == old_blocks {
                e.pos.blocks = new_blocks;
            }
        }
    }

    /// After splitting the mdir at `old_mbid`/`old_blocks` into two mdirs,
    /// repoint every handle that was positioned at an rid `>= split_rid`
    /// into the new mdir with its rid renumbered relative to the new
    /// mdir's start; handles below the split stay where they are except for
    /// following the possible block relocation of the lower half.
    pub fn patch_split(
        &mut self,
        old_blocks: [u32; 2],
        split_rid: i64,
        lower_blocks: [u32; 2],
        lower_mbid: u32,
        upper_blocks: [u32; 2],
        upper_mbid: u32,
    ) {
        for e in self.entries.values_mut() {
            if e.pos.blocks != old_blocks {
                continue;
            }
            if e.pos.rid > split_rid {
                e.pos = Position {
                    mbid: upper_mbid,
                    blocks: upper_blocks,
                    rid: e.pos.rid - split_rid - 1,
                };
            } else {
                e.pos.mbid = lower_mbid;
                e.pos.blocks = lower_blocks;
            }
        }
    }

    /// Mark every handle positioned at `(blocks, rid)` desynchronized,
    /// because the entry it pointed to was removed by a concurrent commit
    /// (the rename-over-stickynote race).
    pub fn mark_desynced_at(&mut self, blocks: [u32; 2], rid: i64) {
        for e in self.entries.values_mut() {
            if e.pos.blocks == blocks && e.pos.rid == rid {
                e.desynced = true;
            }
        }
    }

    pub fn kind_of(&self, id: HandleId) -> Option<Kind> {
        self.entries.get(&id.0).map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relocation_patches_matching_handles() {
        let mut list = HandleList::new();
        let id = list.register(Kind::Dir, Position { mbid: 0, blocks: [2, 3], rid: 5 });
        list.patch_relocation([2, 3], [8, 9]);
        assert_eq!(list.position(id).unwrap().blocks, [8, 9]);
    }

    #[test]
    fn split_moves_upper_handles_and_renumbers_rid() {
        let mut list = HandleList::new();
        let lower = list.register(Kind::File, Position { mbid: 0, blocks: [2, 3], rid: 1 });
        let upper = list.register(Kind::File, Position { mbid: 0, blocks: [2, 3], rid: 10 });
        list.patch_split([2, 3], 5, [2, 3], 0, [6, 7], 1);
        assert_eq!(list.position(lower).unwrap().blocks, [2, 3]);
        let upper_pos = list.position(upper).unwrap();
        assert_eq!(upper_pos.blocks, [6, 7]);
        assert_eq!(upper_pos.rid, 4);
        assert_eq!(upper_pos.mbid, 1);
    }

    #[test]
    fn removed_entry_marks_handle_desynced() {
        let mut list = HandleList::new();
        let id = list.register(Kind::Traversal, Position { mbid: 0, blocks: [2, 3], rid: 3 });
        list.mark_desynced_at([2, 3], 3);
        assert!(list.is_desynced(id));
    }
}
