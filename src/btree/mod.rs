//! The B-tree over rbyds, and its inlined single-block variant, the shrub,
//! which share this module's commit/split algorithm.
//!
//! Unlike an mdir (a power-fail-safe pair of blocks), a B-tree node is a
//! plain copy-on-write rbyd: a mutation commits by allocating a fresh block,
//! compacting the node into it, and handing the parent a [`BranchRef`]
//! (block, weight, cksum) to the new block. Only the tree's root is held
//! resident (`Btree::root`); every other node is fetched from its block on
//! demand and recommitted whenever the path through it is touched. A
//! non-leaf node's entries hold `BranchRef` payloads under `STRUCT/BRANCH`,
//! keyed the same way a leaf's own `(rid, tag)` ordering already gives us:
//! the cumulative subtree weight boundary the branch owns — which is
//! exactly what an [`Rbyd`]'s `(rid, tag)` ordering already gives us, since
//! entries are keyed by "the last rid this entry's weighted range covers"
//! (see `rbyd::Rbyd`'s module doc). So "subtract sub-tree weight from bid
//! and recurse" falls out of `Rbyd::lookup_next` directly.
//!
//! Depth is tracked once on the tree (`height`) rather than per node, since
//! every root-to-leaf path in a B-tree has the same length.

pub mod shrub;

use crate::alloc::{Allocator, Lookahead};
use crate::device::cache::{CachedDevice, HINT_MAX};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::rbyd::{Entry, Key, Rbyd};
use crate::tag::{Mode, Tag};

fn leaf_tag() -> u16 {
    Tag::new(Mode::Normal, 0x5, 0).raw() // Attr
}

fn branch_tag() -> u16 {
    Tag::new(Mode::Normal, 0x4, 0x8).raw() // StructBranch
}

/// A caller-supplied window-refill closure, threaded through so a single
/// B-tree mutation can commit several nodes (a split's two halves, then
/// each ancestor up to the root) through the same [`Allocator`] without
/// re-deriving its own block counter.
pub type Refill<'a> = &'a mut dyn FnMut(u32, &mut Lookahead) -> Result<()>;

/// What a parent stores to reach a child node: which block it lives in,
/// its subtree weight (so the parent doesn't need to fetch it just to
/// answer `weight()`), and its last commit's checksum (so a consistency
/// check can confirm a fetched child matches what its parent expects
/// without re-walking the whole subtree).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchRef {
    pub block: u32,
    pub weight: u32,
    pub cksum: u32,
}

impl BranchRef {
    fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(12);
        v.extend_from_slice(&self.block.to_le_bytes());
        v.extend_from_slice(&self.weight.to_le_bytes());
        v.extend_from_slice(&self.cksum.to_le_bytes());
        v
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 12 {
            return Err(Error::Corrupt);
        }
        Ok(Self {
            block: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            weight: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            cksum: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        })
    }
}

/// Fetch the whole block holding a B-tree node and recover its rbyd.
pub fn fetch_node<D: BlockDevice>(dev: &mut CachedDevice<D>, block: u32) -> Result<Rbyd> {
    let block_size = dev.config().block_size;
    let data = dev.read(block, 0, block_size, HINT_MAX)?;
    Rbyd::fetch(block, &data)
}

/// Allocate a fresh block, compact `node` into it, and program it,
/// returning the [`BranchRef`] a parent stores to reach it. Every node
/// commit in this module — a mutated leaf, a split half, a promoted root —
/// goes through this one path, so block allocation always routes through
/// the real [`Allocator`] rather than a node inventing its own numbering.
pub fn commit_node<D: BlockDevice>(dev: &mut CachedDevice<D>, alloc: &mut Allocator, refill: Refill, node: &mut Rbyd) -> Result<BranchRef> {
    let block = alloc.alloc(refill)?;
    node.block = block;
    let phase = (node.revision & 0b11) as u8;
    let perturb = node.revision & 1 != 0;
    let bytes = node.compact(phase, perturb)?;
    dev.erase(block)?;
    dev.prog(block, 0, &bytes)?;
    dev.sync()?;
    log::trace!("btree: committed node to block {block} (weight {})", node.weight);
    Ok(BranchRef {
        block,
        weight: node.weight,
        cksum: node.cksum,
    })
}

/// A B-tree over device-backed rbyd nodes, optionally named by a `BNAME`
/// prefix.
#[derive(Debug, Clone)]
pub struct Btree {
    pub root: Rbyd,
    pub height: u32,
    pub name: Option<Vec<u8>>,
}

/// One node on a root-to-leaf descent: the node itself, the bid made local
/// to it (every ancestor's preceding-sibling weight already subtracted),
/// and — for every node but the leaf — the exact `(rid, tag)` key in this
/// node whose branch entry pointed at the next node down. Capturing that
/// key lets a later rebalance patch the parent's entry directly, rather
/// than searching for "whichever entry points at child X" the way an
/// in-memory arena index would have to.
struct PathNode {
    node: Rbyd,
    local: i64,
    child_key: Option<Key>,
}

/// The outcome of settling one node after a mutation: either it still fits
/// (`One`) or it overflowed and had to split (`Two`).
enum Pending {
    One(Rbyd),
    Two(Rbyd, Rbyd),
}

fn settle(node: Rbyd, block_size: u32) -> Pending {
    let est = node.estimate(block_size, u32::MAX as u64);
    if est.estimated_size <= block_size {
        Pending::One(node)
    } else {
        let (lower, upper) = split_node(node, est.split_rid);
        Pending::Two(lower, upper)
    }
}

/// Move every entry with rid above `split_rid` out of `node` into a fresh
/// node, renumbering the moved entries relative to the new node. The new
/// node's block is left at the placeholder `0`; the real block is assigned
/// when it's committed.
fn split_node(mut node: Rbyd, split_rid: i64) -> (Rbyd, Rbyd) {
    let base = split_rid + 1;
    let to_move: Vec<_> = node.entries.range((base, 0)..).map(|(k, v)| (*k, v.clone())).collect();
    for (k, _) in &to_move {
        node.entries.remove(k);
    }
    let mut upper = Rbyd::new(0);
    for (k, v) in to_move {
        upper.entries.insert((k.0 - base, k.1), v);
    }
    upper.recompute_weight();
    node.recompute_weight();
    (node, upper)
}

/// Replace the single entry at `old_key` with `replacements` (tags kept,
/// rids renumbered to reflect cumulative weight), preserving every other
/// sibling's relative order. Used both for a plain branch-weight refresh
/// (one replacement) and for a split propagating into the parent (two).
fn splice_branch(parent: &mut Rbyd, old_key: Key, replacements: Vec<(u16, Entry)>) -> Result<()> {
    let mut ordered: Vec<(u16, Entry)> = parent.entries.iter().map(|(k, v)| (k.1, v.clone())).collect();
    let idx = parent
        .entries
        .keys()
        .position(|k| *k == old_key)
        .ok_or_else(|| Error::internal("branch parent missing child key"))?;
    ordered.splice(idx..idx + 1, replacements);
    parent.entries.clear();
    let mut cum: i64 = 0;
    for (tag, entry) in ordered {
        cum += entry.weight as i64;
        parent.entries.insert((cum - 1, tag), entry);
    }
    parent.recompute_weight();
    Ok(())
}

fn upsert_branch(parent: &mut Rbyd, child_key: Option<Key>, node_ref: BranchRef) -> Result<()> {
    let key = child_key.ok_or_else(|| Error::internal("branch parent missing child key"))?;
    splice_branch(
        parent,
        key,
        vec![(
            key.1,
            Entry {
                weight: node_ref.weight,
                payload: node_ref.encode(),
            },
        )],
    )
}

fn replace_branch_with_split(parent: &mut Rbyd, child_key: Option<Key>, lower_ref: BranchRef, upper_ref: BranchRef) -> Result<()> {
    let key = child_key.ok_or_else(|| Error::internal("branch parent missing child key"))?;
    let tag = key.1;
    splice_branch(
        parent,
        key,
        vec![
            (
                tag,
                Entry {
                    weight: lower_ref.weight,
                    payload: lower_ref.encode(),
                },
            ),
            (
                tag,
                Entry {
                    weight: upper_ref.weight,
                    payload: upper_ref.encode(),
                },
            ),
        ],
    )
}

impl Btree {
    pub fn new_empty(block: u32) -> Self {
        Self {
            root: Rbyd::new(block),
            height: 0,
            name: None,
        }
    }

    pub fn weight(&self) -> u32 {
        self.root.weight
    }

    /// `lookupleaf`: descend `bid`, fetching each branch's child off the
    /// device and subtracting subtree weight at each step, until we reach a
    /// leaf payload.
    pub fn lookup<D: BlockDevice>(&self, dev: &mut CachedDevice<D>, bid: u32) -> Result<(u32, Vec<u8>)> {
        let mut node = self.root.clone();
        let mut local = bid as i64;
        for _ in 0..self.height {
            let (key, entry) = node.lookup_next(local, 0).ok_or(Error::NoEnt)?;
            let base = key.0 - entry.weight as i64 + 1;
            let branch = BranchRef::decode(&entry.payload)?;
            local -= base;
            node = fetch_node(dev, branch.block)?;
        }
        let (key, entry) = node.lookup_next(local, 0).ok_or(Error::NoEnt)?;
        let base = key.0 - entry.weight as i64 + 1;
        Ok(((local - base) as u32, entry.payload.clone()))
    }

    fn descend_path<D: BlockDevice>(&self, dev: &mut CachedDevice<D>, bid: u32) -> Result<Vec<PathNode>> {
        let mut path = Vec::with_capacity(self.height as usize + 1);
        let mut node = self.root.clone();
        let mut local = bid as i64;
        for _ in 0..self.height {
            let (key, entry) = node.lookup_next(local, 0).ok_or(Error::NoEnt)?;
            let base = key.0 - entry.weight as i64 + 1;
            let branch = BranchRef::decode(&entry.payload)?;
            let next_local = local - base;
            let child = fetch_node(dev, branch.block)?;
            path.push(PathNode {
                node,
                local,
                child_key: Some(key),
            });
            node = child;
            local = next_local;
        }
        path.push(PathNode { node, local, child_key: None });
        Ok(path)
    }

    /// Insert or update the single-rid entry at `bid` with weight `weight`
    /// and payload `payload`, splitting nodes that overflow and promoting a
    /// new root if the split propagates all the way up.
    pub fn insert<D: BlockDevice>(
        &mut self,
        dev: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        refill: Refill,
        bid: u32,
        weight: u32,
        payload: Vec<u8>,
        block_size: u32,
    ) -> Result<()> {
        let mut path = self.descend_path(dev, bid)?;
        let leaf = path.last_mut().expect("descend_path always yields at least the leaf");
        leaf.node
            .append_attr(leaf.local + weight as i64 - 1, leaf_tag(), weight as i64, payload, false)?;
        self.rebalance_path(dev, alloc, refill, path, block_size)
    }

    /// Replace the payload of the entry already occupying `bid`, without
    /// shifting any other entry's weight. Unlike `insert`, which always
    /// opens up `weight` new rids at `bid`, this targets the exact rid the
    /// existing entry already owns — the right call for a caller that knows
    /// `bid` is occupied and just wants to rewrite its payload in place.
    pub fn update<D: BlockDevice>(
        &mut self,
        dev: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        refill: Refill,
        bid: u32,
        payload: Vec<u8>,
        block_size: u32,
    ) -> Result<()> {
        let mut path = self.descend_path(dev, bid)?;
        let leaf = path.last_mut().expect("descend_path always yields at least the leaf");
        let (key, _) = leaf.node.lookup_next(leaf.local, 0).ok_or(Error::NoEnt)?;
        leaf.node.append_attr(key.0, leaf_tag(), 0, payload, false)?;
        self.rebalance_path(dev, alloc, refill, path, block_size)
    }

    pub fn remove<D: BlockDevice>(
        &mut self,
        dev: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        refill: Refill,
        bid: u32,
        weight: u32,
        block_size: u32,
    ) -> Result<()> {
        let mut path = self.descend_path(dev, bid)?;
        let leaf = path.last_mut().expect("descend_path always yields at least the leaf");
        leaf.node
            .append_attr(leaf.local + weight as i64 - 1, leaf_tag(), -(weight as i64), Vec::new(), false)?;
        self.rebalance_path(dev, alloc, refill, path, block_size)
    }

    /// After mutating the leaf at the end of `path`, walk back up: commit
    /// each touched node (it's never `self.root` until we run out of
    /// ancestors) to a fresh block, patch its parent's branch entry, and
    /// re-settle the parent, splitting it too if it now overflows. Once
    /// there's no parent left, either adopt the single settled node as the
    /// new resident root, or — if the mutation propagated a split all the
    /// way up — commit both halves and build a fresh two-entry root over
    /// them, growing `height` by one.
    fn rebalance_path<D: BlockDevice>(
        &mut self,
        dev: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        refill: Refill,
        mut path: Vec<PathNode>,
        block_size: u32,
    ) -> Result<()> {
        let leaf = path.pop().expect("descend_path always yields at least the leaf");
        let mut pending = settle(leaf.node, block_size);
        loop {
            let Some(parent) = path.pop() else {
                match pending {
                    Pending::One(node) => {
                        self.root = node;
                    }
                    Pending::Two(mut lower, mut upper) => {
                        let lower_ref = commit_node(dev, alloc, &mut *refill, &mut lower)?;
                        let upper_ref = commit_node(dev, alloc, &mut *refill, &mut upper)?;
                        let mut new_root = Rbyd::new(0);
                        new_root
                            .append_attr(lower_ref.weight as i64 - 1, branch_tag(), lower_ref.weight as i64, lower_ref.encode(), false)
                            .expect("fresh two-entry root never overflows append_attr");
                        new_root
                            .append_attr(
                                lower_ref.weight as i64 + upper_ref.weight as i64 - 1,
                                branch_tag(),
                                upper_ref.weight as i64,
                                upper_ref.encode(),
                                false,
                            )
                            .expect("fresh two-entry root never overflows append_attr");
                        self.root = new_root;
                        self.height += 1;
                        log::debug!("btree: root split propagated to top, height now {}", self.height);
                    }
                }
                return Ok(());
            };
            let mut parent_node = parent.node;
            match pending {
                Pending::One(mut node) => {
                    let node_ref = commit_node(dev, alloc, &mut *refill, &mut node)?;
                    upsert_branch(&mut parent_node, parent.child_key, node_ref)?;
                }
                Pending::Two(mut lower, mut upper) => {
                    let lower_ref = commit_node(dev, alloc, &mut *refill, &mut lower)?;
                    let upper_ref = commit_node(dev, alloc, &mut *refill, &mut upper)?;
                    replace_branch_with_split(&mut parent_node, parent.child_key, lower_ref, upper_ref)?;
                }
            }
            pending = settle(parent_node, block_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigFlags};

    struct RamDevice {
        block_size: u32,
        blocks: Vec<Vec<u8>>,
    }

    impl RamDevice {
        fn new(block_size: u32, count: u32) -> Self {
            Self {
                block_size,
                blocks: vec![vec![0xffu8; block_size as usize]; count as usize],
            }
        }
    }

    impl BlockDevice for RamDevice {
        fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
            let b = &self.blocks[block as usize];
            buf.copy_from_slice(&b[off as usize..off as usize + buf.len()]);
            Ok(())
        }
        fn prog(&mut self, block: u32, off: u32, buf: &[u8]) -> Result<()> {
            let b = &mut self.blocks[block as usize];
            b[off as usize..off as usize + buf.len()].copy_from_slice(buf);
            Ok(())
        }
        fn erase(&mut self, block: u32) -> Result<()> {
            self.blocks[block as usize].fill(0xff);
            Ok(())
        }
        fn sync(&mut self) -> Result<()> {
            Ok(())
        }
        fn read_size(&self) -> u32 {
            16
        }
        fn prog_size(&self) -> u32 {
            16
        }
        fn block_size(&self) -> u32 {
            self.block_size
        }
        fn block_count(&self) -> u32 {
            self.blocks.len() as u32
        }
    }

    fn cfg(block_size: u32, block_count: u32) -> Config {
        Config {
            read_size: 16,
            prog_size: 16,
            block_size,
            block_count,
            rcache_size: 16,
            pcache_size: 16,
            lookahead_size: block_count,
            inline_size: 64,
            fragment_size: 0,
            crystal_thresh: u32::MAX,
            block_recycles: None,
            name_limit: 255,
            file_limit: 1 << 20,
            flags: ConfigFlags::NONE,
        }
    }

    fn no_conflict_refill(_off: u32, _la: &mut Lookahead) -> Result<()> {
        Ok(())
    }

    #[test]
    fn insert_and_lookup_single_leaf() {
        let c = cfg(4096, 64);
        let mut dev = CachedDevice::new(RamDevice::new(4096, 64), c.clone());
        let mut alloc = Allocator::new(c.block_count, c.lookahead_size);
        let mut t = Btree::new_empty(10);
        t.insert(&mut dev, &mut alloc, &mut no_conflict_refill, 0, 1, b"a".to_vec(), 4096).unwrap();
        t.insert(&mut dev, &mut alloc, &mut no_conflict_refill, 1, 1, b"b".to_vec(), 4096).unwrap();
        assert_eq!(t.weight(), 2);
        let (_, v) = t.lookup(&mut dev, 0).unwrap();
        assert_eq!(v, b"a");
        let (_, v) = t.lookup(&mut dev, 1).unwrap();
        assert_eq!(v, b"b");
    }

    #[test]
    fn split_promotes_new_root_and_survives_remount() {
        let c = cfg(512, 64);
        let mut dev = CachedDevice::new(RamDevice::new(512, 64), c.clone());
        let mut alloc = Allocator::new(c.block_count, c.lookahead_size);
        let mut t = Btree::new_empty(10);
        for i in 0..64u32 {
            t.insert(&mut dev, &mut alloc, &mut no_conflict_refill, i, 1, vec![b'x'; 16], 512).unwrap();
        }
        assert!(t.height >= 1, "expected at least one split to have occurred");
        assert_eq!(t.weight(), 64);

        // every non-root node the tree currently references must be
        // reachable on the device, not just resident in RAM.
        let (_, v) = t.lookup(&mut dev, 50).unwrap();
        assert_eq!(v, vec![b'x'; 16]);

        // rebuild a fresh `Btree` from just the root's bytes and the
        // recorded height, as a remount would, and confirm every leaf is
        // still reachable purely by fetching off the device.
        let remounted = Btree {
            root: t.root.clone(),
            height: t.height,
            name: None,
        };
        for i in 0..64u32 {
            let (_, v) = remounted.lookup(&mut dev, i).unwrap();
            assert_eq!(v, vec![b'x'; 16], "bid {i}");
        }
    }
}
