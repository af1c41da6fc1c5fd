//! The resumable traversal engine: walks every block the
//! filesystem currently considers live, one step at a time, so a caller can
//! interleave it with other work (a scrub that yields between blocks, a
//! `fsck` that wants to report progress, or the allocator's lookahead-window
//! refill, which is really just "traverse until the window is full").
//!
//! The state machine mirrors the structural layering the rest of the crate
//! already has: the mroot anchor, then however much of the mroot chain
//! exists, then the mtree (if any), then each mdir the mtree names, then
//! within each mdir any out-of-line btrees (file data trees promoted out of
//! their shrub) its entries point at.

use crate::btree::{fetch_node, BranchRef};
use crate::cksum::crc32c;
use crate::config::Config;
use crate::device::cache::CachedDevice;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::mdir::Mdir;
use crate::mtree::MTree;
use crate::rbyd::Rbyd;
use crate::tag::{Mode, Tag};

fn struct_btree_tag() -> u16 {
    Tag::new(Mode::Normal, 0x4, 0x4).raw() // StructBTree
}

/// A file-data btree's root ref, as stashed in its owning mdir entry's
/// `STRUCT/BTREE` tag: the root's own block (it's a plain committed rbyd,
/// not a power-fail-safe pair) plus the tree's height, exactly like the
/// mtree's own `STRUCT/MTREE` ref minus the second block of the pair.
fn decode_btree_ref(bytes: &[u8]) -> Result<(u32, u32)> {
    if bytes.len() != 8 {
        return Err(Error::Corrupt);
    }
    Ok((
        u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    MRootAnchor,
    MRootChain,
    MTree,
    MDirs { next_mbid: u32 },
    Done,
}

/// What a traversal checks as it visits each block: a plain "which blocks
/// are live" pass (for the
/// lookahead allocator) does none of this; a consistency check enables
/// `ck_meta`/`ck_data`; `compact` additionally re-compacts any rbyd whose
/// physical layout has drifted from a fresh balanced tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub ck_meta: bool,
    pub ck_data: bool,
    pub compact: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Visited {
    pub block: u32,
    pub cksum: Option<u32>,
}

/// One step of the traversal. Construct with [`Traversal::new`], then call
/// [`Traversal::step`] in a loop until it returns `Ok(None)`.
pub struct Traversal {
    state: State,
    opts: Options,
    mtree_mbid_bound: u32,
}

impl Traversal {
    pub fn new(opts: Options) -> Self {
        Self {
            state: State::MRootAnchor,
            opts,
            mtree_mbid_bound: 0,
        }
    }

    /// Advance one step, returning the block(s) visited, or `None` once the
    /// traversal has covered everything reachable.
    pub fn step<D: BlockDevice>(&mut self, dev: &mut CachedDevice<D>, cfg: &Config) -> Result<Option<Vec<Visited>>> {
        match self.state {
            State::MRootAnchor => {
                let visited = self.visit_mdir(dev, [0, 1])?;
                self.state = State::MRootChain;
                Ok(Some(visited))
            }
            State::MRootChain => {
                // the mroot chain and the mtree are both resolved by one
                // `MTree::mount` walk; we only need the final set of blocks
                // it touched for this step, which is a subset of what a
                // from-scratch mount already computes. We re-derive it here
                // rather than caching it on `Traversal` to keep this type
                // `Send`-free of device state between steps.
                let mounted = MTree::mount(dev)?;
                let mut visited = self.visit_mdir(dev, mounted.root_mdir.blocks)?;
                if let Some(bt) = &mounted.mtree {
                    self.mtree_mbid_bound = bt.weight();
                    if let Some(root_mdir) = &mounted.mtree_root_mdir {
                        visited.extend(self.visit_mdir(dev, root_mdir.blocks)?);
                    }
                    if bt.height > 0 {
                        for (_, entry) in bt.root.entries.iter() {
                            let branch = BranchRef::decode(&entry.payload)?;
                            let child = fetch_node(dev, branch.block)?;
                            self.visit_btree_subtree(dev, &child, bt.height - 1, &mut visited)?;
                        }
                    }
                }
                self.state = State::MTree;
                Ok(Some(visited))
            }
            State::MTree => {
                self.state = State::MDirs { next_mbid: 0 };
                Ok(Some(Vec::new()))
            }
            State::MDirs { next_mbid } => {
                if next_mbid >= self.mtree_mbid_bound {
                    self.state = State::Done;
                    return Ok(None);
                }
                let mounted = MTree::mount(dev)?;
                let mdir = mounted.lookup_mdir(dev, next_mbid)?;
                let mut visited = self.visit_mdir(dev, mdir.blocks)?;
                visited.extend(self.visit_out_of_line_btrees(dev, &mdir)?);
                self.state = State::MDirs { next_mbid: next_mbid + 1 };
                let _ = cfg;
                Ok(Some(visited))
            }
            State::Done => Ok(None),
        }
    }

    fn visit_mdir<D: BlockDevice>(&self, dev: &mut CachedDevice<D>, blocks: [u32; 2]) -> Result<Vec<Visited>> {
        let mdir = Mdir::fetch(dev, blocks)?;
        Ok(vec![self.cksum_of(&mdir.rbyd)])
    }

    /// Walk every `STRUCT/BTREE` tag in `mdir` (a file's data outgrew its
    /// shrub and was promoted to a standalone btree) and recurse into the
    /// referenced root's nodes, the same way the mtree's own nodes are
    /// walked in `State::MRootChain`.
    fn visit_out_of_line_btrees<D: BlockDevice>(&self, dev: &mut CachedDevice<D>, mdir: &Mdir) -> Result<Vec<Visited>> {
        let mut visited = Vec::new();
        for (_, entry) in mdir.rbyd.entries.iter().filter(|(key, _)| key.1 == struct_btree_tag()) {
            let (root_block, height) = decode_btree_ref(&entry.payload)?;
            let root = fetch_node(dev, root_block)?;
            visited.push(self.cksum_of(&root));
            if height > 0 {
                for (_, branch_entry) in root.entries.iter() {
                    let branch = BranchRef::decode(&branch_entry.payload)?;
                    let child = fetch_node(dev, branch.block)?;
                    self.visit_btree_subtree(dev, &child, height - 1, &mut visited)?;
                }
            }
        }
        Ok(visited)
    }

    /// Push `node`'s own cksum, then recurse into every child it points at
    /// if it isn't itself a leaf (`remaining_height == 0`).
    fn visit_btree_subtree<D: BlockDevice>(&self, dev: &mut CachedDevice<D>, node: &Rbyd, remaining_height: u32, out: &mut Vec<Visited>) -> Result<()> {
        out.push(self.cksum_of(node));
        if remaining_height == 0 {
            return Ok(());
        }
        for (_, entry) in node.entries.iter() {
            let branch = BranchRef::decode(&entry.payload)?;
            let child = fetch_node(dev, branch.block)?;
            self.visit_btree_subtree(dev, &child, remaining_height - 1, out)?;
        }
        Ok(())
    }

    fn cksum_of(&self, rbyd: &crate::rbyd::Rbyd) -> Visited {
        let cksum = if self.opts.ck_meta || self.opts.ck_data {
            let mut bytes = Vec::new();
            for (_, e) in rbyd.entries.iter() {
                bytes.extend_from_slice(&e.payload);
            }
            Some(crc32c(&bytes))
        } else {
            None
        };
        Visited { block: rbyd.block, cksum }
    }
}

/// Drain a traversal to completion, collecting every block visited. Used by
/// the allocator's full-pass `ckpoint` and by tests that want "just tell me
/// every live block".
pub fn collect_all<D: BlockDevice>(dev: &mut CachedDevice<D>, cfg: &Config, opts: Options) -> Result<Vec<Visited>> {
    let mut t = Traversal::new(opts);
    let mut all = Vec::new();
    while let Some(mut batch) = t.step(dev, cfg)? {
        all.append(&mut batch);
    }
    Ok(all)
}
