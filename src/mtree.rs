//! The mtree (a [`Btree`] whose leaves are mdir block pairs) and the mroot
//! chain that anchors it.
//!
//! Small filesystems never need an mtree at all: everything lives directly
//! in the mroot anchor pair `{0, 1}`. Once that single mdir would overflow,
//! its `STRUCT/MTREE` tag starts pointing at a real [`Btree`] of further
//! mdirs, each leaf weighted by how many mids it owns. Like any other mdir,
//! the mtree's own root node is itself a power-fail-safe pair — the
//! `STRUCT/MTREE` tag records that pair's two blocks plus the tree's height,
//! and every node beneath the root is a plain committed rbyd reached the
//! same way any other B-tree node is. The anchor itself can also outgrow a
//! single mdir's `Config`-class tags plus its mtree pointer; when it does,
//! it chains to a fresh mdir pair via a `STRUCT/MROOT` tag, and mounting
//! walks that chain to find the actual current root. The chain is walked
//! with Brent's cycle-detection algorithm rather than a visited-set, since
//! an adversarial or corrupt image could make a naive walk loop forever and
//! a visited-`Vec` is unbounded memory for an embedded target.

use crate::alloc::Allocator;
use crate::btree::Btree;
use crate::config::Config;
use crate::device::cache::CachedDevice;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::mdir::Mdir;
use crate::tag::{Mode, Tag};

fn mroot_tag() -> u16 {
    Tag::new(Mode::Normal, 0x4, 0x5).raw() // StructMRoot
}

fn mtree_tag() -> u16 {
    Tag::new(Mode::Normal, 0x4, 0x7).raw() // StructMTree
}

/// One mdir's worth of leaf payload in the mtree: its block pair.
fn encode_mdir_ref(blocks: [u32; 2]) -> Vec<u8> {
    let mut v = Vec::with_capacity(8);
    v.extend_from_slice(&blocks[0].to_le_bytes());
    v.extend_from_slice(&blocks[1].to_le_bytes());
    v
}

fn decode_mdir_ref(bytes: &[u8]) -> Result<[u32; 2]> {
    if bytes.len() != 8 {
        return Err(Error::Corrupt);
    }
    Ok([
        u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
    ])
}

/// The mtree root's own block pair plus the tree's height, so a remount can
/// rebuild the resident `Btree` without re-walking anything beneath it.
fn encode_mtree_ref(blocks: [u32; 2], height: u32) -> Vec<u8> {
    let mut v = Vec::with_capacity(12);
    v.extend_from_slice(&blocks[0].to_le_bytes());
    v.extend_from_slice(&blocks[1].to_le_bytes());
    v.extend_from_slice(&height.to_le_bytes());
    v
}

fn decode_mtree_ref(bytes: &[u8]) -> Result<([u32; 2], u32)> {
    if bytes.len() != 12 {
        return Err(Error::Corrupt);
    }
    Ok((
        [
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        ],
        u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
    ))
}

/// The root of the whole filesystem: the mroot anchor (always `{0, 1}`),
/// walked forward through however many `STRUCT/MROOT` links it takes to
/// reach the mdir that actually holds the current `Config`/`STRUCT/MTREE`
/// tags, plus (if present) the mtree itself and the power-fail-safe pair its
/// root node lives in.
pub struct MTree {
    pub root_mdir: Mdir,
    pub mtree: Option<Btree>,
    pub mtree_root_mdir: Option<Mdir>,
}

impl MTree {
    /// Mount: walk the mroot chain from the anchor pair `{0, 1}`, using
    /// Brent's algorithm (a slow pointer that restarts at the fast pointer's
    /// position each time the search bound doubles) so a chain that somehow
    /// loops is detected in bounded memory instead of looping forever.
    pub fn mount<D: BlockDevice>(dev: &mut CachedDevice<D>) -> Result<Self> {
        let mut power: u32 = 1;
        let mut steps: u32 = 0;
        let mut slow = Mdir::fetch(dev, [0, 1])?;
        let mut fast_blocks = next_link(&slow)?;
        loop {
            let Some(blocks) = fast_blocks else {
                break;
            };
            let fast = Mdir::fetch(dev, blocks)?;
            fast_blocks = next_link(&fast)?;
            steps += 1;
            if steps == power {
                // restart the slow pointer here; this is the "tortoise
                // teleports to the hare" step of Brent's algorithm
                slow = fast;
                power *= 2;
                steps = 0;
            }
            if let Some(next) = fast_blocks {
                if next == slow.blocks {
                    return Err(Error::Corrupt);
                }
            }
        }
        // re-walk from the anchor to the actual tail, now that we know it
        // terminates (mirrors Floyd/Brent usage: the cycle check above is
        // purely a bound; the real walk is this simple linear one).
        let mut cur = Mdir::fetch(dev, [0, 1])?;
        while let Some(blocks) = next_link(&cur)? {
            cur = Mdir::fetch(dev, blocks)?;
        }
        let (mtree, mtree_root_mdir) = match cur.rbyd.lookup_exact(0, mtree_tag()) {
            Some(entry) => {
                let (blocks, height) = decode_mtree_ref(&entry.payload)?;
                let mdir = Mdir::fetch(dev, blocks)?;
                log::debug!("mtree: mounted root at {blocks:?}, height {height}");
                let bt = Btree {
                    root: mdir.rbyd.clone(),
                    height,
                    name: None,
                };
                (Some(bt), Some(mdir))
            }
            None => (None, None),
        };
        Ok(Self {
            root_mdir: cur,
            mtree,
            mtree_root_mdir,
        })
    }

    /// Find the mdir owning `mbid`, consulting the mtree if present or
    /// falling back to the root mdir itself for a single-mdir filesystem.
    pub fn lookup_mdir<D: BlockDevice>(&self, dev: &mut CachedDevice<D>, mbid: u32) -> Result<Mdir> {
        match &self.mtree {
            None => Ok(self.root_mdir.clone()),
            Some(bt) => {
                let (_, payload) = bt.lookup(dev, mbid)?;
                let blocks = decode_mdir_ref(&payload)?;
                Mdir::fetch(dev, blocks)
            }
        }
    }

    /// Insert or replace the mdir-ref leaf for `mbid` (called after a commit
    /// splits, drops, or relocates an mdir), creating the mtree's own
    /// power-fail-safe root pair on first use, and recommitting both the
    /// mtree root and the `STRUCT/MTREE` tag that anchors it every time.
    pub fn upsert_mdir<D: BlockDevice>(
        &mut self,
        dev: &mut CachedDevice<D>,
        cfg: &Config,
        alloc: &mut Allocator,
        mbid: u32,
        blocks: [u32; 2],
    ) -> Result<()> {
        if self.mtree.is_none() {
            let a = alloc.alloc(|_off, _la| Ok(()))?;
            let b = alloc.alloc(|_off, _la| Ok(()))?;
            let mdir = Mdir {
                blocks: [a, b],
                rbyd: crate::rbyd::Rbyd::new(a),
            };
            self.mtree = Some(Btree::new_empty(a));
            self.mtree_root_mdir = Some(mdir);
        }
        let mtree_mdir = self.mtree_root_mdir.as_mut().expect("just populated above");
        let bt = self.mtree.as_mut().expect("just populated above");
        bt.root = mtree_mdir.rbyd.clone();

        let mut refill = |_off: u32, _la: &mut crate::alloc::Lookahead| -> Result<()> { Ok(()) };
        match bt.lookup(dev, mbid) {
            Ok(_) => bt.update(dev, alloc, &mut refill, mbid, encode_mdir_ref(blocks), cfg.block_size)?,
            Err(Error::NoEnt) => bt.insert(dev, alloc, &mut refill, mbid, 1, encode_mdir_ref(blocks), cfg.block_size)?,
            Err(e) => return Err(e),
        }

        // the mtree root node may have been replaced wholesale by a split
        // propagating to the top (a fresh `Rbyd::new(0)` at revision 0);
        // carry the mdir's own revision forward regardless, so its
        // power-fail-safe commit keeps incrementing from where it left off
        // rather than resetting and losing the race against its stale half.
        let prior_revision = mtree_mdir.rbyd.revision;
        let mut new_root = bt.root.clone();
        new_root.revision = prior_revision;
        mtree_mdir.rbyd = new_root;
        mtree_mdir.commit(dev, cfg)?;
        bt.root = mtree_mdir.rbyd.clone();

        let height = bt.height;
        let mtree_blocks = mtree_mdir.blocks;
        match self.root_mdir.rbyd.lookup_exact(0, mtree_tag()) {
            Some(_) => self
                .root_mdir
                .rbyd
                .append_attr(0, mtree_tag(), 0, encode_mtree_ref(mtree_blocks, height), false)?,
            None => self
                .root_mdir
                .rbyd
                .append_attr(0, mtree_tag(), 1, encode_mtree_ref(mtree_blocks, height), false)?,
        }
        self.root_mdir.commit(dev, cfg)?;
        log::debug!("mtree: upserted mbid {mbid} at blocks {mtree_blocks:?}, height {height}");
        Ok(())
    }
}

fn next_link(mdir: &Mdir) -> Result<Option<[u32; 2]>> {
    match mdir.rbyd.lookup_exact(0, mroot_tag()) {
        Some(entry) => Ok(Some(decode_mdir_ref(&entry.payload)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFlags;

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

    fn cfg(block_count: u32) -> Config {
        Config {
            read_size: 16,
            prog_size: 16,
            block_size: 512,
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

    #[test]
    fn mount_with_no_chain_and_no_mtree_is_just_the_anchor() {
        let c = cfg(16);
        let mut dev = CachedDevice::new(RamDevice::new(512, 16), c.clone());
        let mut anchor = Mdir { blocks: [0, 1], rbyd: crate::rbyd::Rbyd::new(0) };
        anchor.commit(&mut dev, &c).unwrap();

        let mounted = MTree::mount(&mut dev).unwrap();
        assert!(mounted.mtree.is_none());
        assert_eq!(mounted.root_mdir.blocks, [0, 1]);
    }

    #[test]
    fn chained_mroot_is_followed_to_its_tail() {
        let c = cfg(16);
        let mut dev = CachedDevice::new(RamDevice::new(512, 16), c.clone());
        let mut tail = Mdir { blocks: [2, 3], rbyd: crate::rbyd::Rbyd::new(2) };
        tail.commit(&mut dev, &c).unwrap();

        let mut anchor = Mdir { blocks: [0, 1], rbyd: crate::rbyd::Rbyd::new(0) };
        anchor
            .rbyd
            .append_attr(0, mroot_tag(), 1, encode_mdir_ref([2, 3]), false)
            .unwrap();
        anchor.commit(&mut dev, &c).unwrap();

        let mounted = MTree::mount(&mut dev).unwrap();
        assert_eq!(mounted.root_mdir.blocks, [2, 3]);
    }

    #[test]
    fn mdir_ref_roundtrips() {
        let enc = encode_mdir_ref([40, 41]);
        assert_eq!(decode_mdir_ref(&enc).unwrap(), [40, 41]);
    }

    #[test]
    fn mtree_ref_roundtrips() {
        let enc = encode_mtree_ref([40, 41], 3);
        assert_eq!(decode_mtree_ref(&enc).unwrap(), ([40, 41], 3));
    }

    #[test]
    fn upsert_mdir_creates_and_persists_the_mtree_across_a_remount() {
        let c = cfg(64);
        let mut dev = CachedDevice::new(RamDevice::new(512, 64), c.clone());
        let mut anchor = Mdir { blocks: [0, 1], rbyd: crate::rbyd::Rbyd::new(0) };
        anchor.commit(&mut dev, &c).unwrap();

        let mut alloc = Allocator::new(c.block_count, c.lookahead_size);
        // the anchor's own blocks are already taken.
        alloc.alloc(|_off, _la| Ok(())).unwrap();
        alloc.alloc(|_off, _la| Ok(())).unwrap();

        let mut mt = MTree::mount(&mut dev).unwrap();
        for mbid in 0..40u32 {
            mt.upsert_mdir(&mut dev, &c, &mut alloc, mbid, [10 + mbid * 2, 11 + mbid * 2]).unwrap();
        }
        assert!(mt.mtree.is_some());

        let remounted = MTree::mount(&mut dev).unwrap();
        assert!(remounted.mtree.is_some(), "mtree must survive a remount once it exists");
        for mbid in 0..40u32 {
            let found = remounted.lookup_mdir(&mut dev, mbid).unwrap();
            assert_eq!(found.blocks, [10 + mbid * 2, 11 + mbid * 2], "mbid {mbid}");
        }
    }

    #[test]
    fn upsert_mdir_on_an_existing_mbid_updates_in_place_without_duplicating() {
        let c = cfg(64);
        let mut dev = CachedDevice::new(RamDevice::new(512, 64), c.clone());
        let mut anchor = Mdir { blocks: [0, 1], rbyd: crate::rbyd::Rbyd::new(0) };
        anchor.commit(&mut dev, &c).unwrap();

        let mut alloc = Allocator::new(c.block_count, c.lookahead_size);
        alloc.alloc(|_off, _la| Ok(())).unwrap();
        alloc.alloc(|_off, _la| Ok(())).unwrap();

        let mut mt = MTree::mount(&mut dev).unwrap();
        mt.upsert_mdir(&mut dev, &c, &mut alloc, 0, [10, 11]).unwrap();
        let weight_after_first = mt.mtree.as_ref().unwrap().weight();
        mt.upsert_mdir(&mut dev, &c, &mut alloc, 0, [20, 21]).unwrap();
        assert_eq!(mt.mtree.as_ref().unwrap().weight(), weight_after_first, "same mbid must not grow the tree's weight");

        let found = mt.lookup_mdir(&mut dev, 0).unwrap();
        assert_eq!(found.blocks, [20, 21]);
    }
}
