//! The mdir commit pipeline: the single path every filesystem
//! mutation goes through, from "apply this change to one mdir's rbyd" to
//! "every structure the change touches — the mtree, the pending-grm queue,
//! the running gcksum, and any open handles — is either all updated on
//! disk, or none of it is".
//!
//! Staged the way a careful journal writer stages a transaction
//! (dry-run the write, only then touch the device, only then update
//! in-RAM bookkeeping): this pipeline dry-runs the mutation against a
//! scratch copy of the target mdir's rbyd to decide split/drop/relocate
//! *before* anything is written, then performs exactly one or two real
//! [`Mdir::commit`] calls, and only updates the mtree/handle list/gstate
//! after those have returned `Ok`. A failure at any stage before the final
//! device sync leaves the previous on-disk state exactly as it was — an
//! interrupted pipeline is indistinguishable from one that was never
//! started, because nothing downstream of the fetch has been written yet.

use crate::alloc::Allocator;
use crate::config::Config;
use crate::device::cache::CachedDevice;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::gstate::{GCksum, Grm};
use crate::handle::HandleList;
use crate::mdir::Mdir;
use crate::mtree::MTree;
use crate::rbyd::Rbyd;

/// Everything a mutation needs to drive one commit: the mtree (to locate
/// and later re-register mdirs), the allocator (for a split's new half),
/// and the global state this commit may contribute a delta to.
pub struct Pipeline<'a> {
    pub mtree: &'a mut MTree,
    pub handles: &'a mut HandleList,
    pub grm: &'a mut Grm,
    pub gcksum: &'a mut GCksum,
    pub alloc: &'a mut Allocator,
}

/// What happened to the target mdir as a result of a commit, so the caller
/// (a directory/file operation) can translate it into a mid the rest of
/// the filesystem should use going forward.
#[derive(Debug)]
pub enum Outcome {
    /// The mutation fit; the mdir (possibly relocated to its other half,
    /// as every mdir commit does) is unchanged in identity.
    Committed,
    /// The mdir overflowed and was split in two; the caller should
    /// re-resolve any mid it's tracking against the new mbid/rid pair that
    /// now owns it (via `HandleList::patch_split`, already applied here).
    Split { lower_mbid: u32, upper_mbid: u32 },
}

impl<'a> Pipeline<'a> {
    /// Apply `mutate` to the rbyd of the mdir owning `mbid`, commit it, and
    /// propagate any structural consequence (split) up through the mtree
    /// and handle list. `mutate` must be pure/idempotent with respect to
    /// being dry-run first: it runs once against a scratch clone to decide
    /// overflow, then again (identically) against the real rbyd for the
    /// actual commit — a "compute the write, then perform it" split between
    /// planning and I/O.
    pub fn commit_mdir<D: BlockDevice>(
        &mut self,
        dev: &mut CachedDevice<D>,
        cfg: &Config,
        mbid: u32,
        mutate: impl Fn(&mut Rbyd) -> Result<()>,
    ) -> Result<Outcome> {
        let mut mdir = self.mtree.lookup_mdir(dev, mbid)?;

        // dry run: decide overflow before touching the device at all.
        let mut scratch = mdir.rbyd.clone();
        mutate(&mut scratch)?;
        let overflow = scratch.estimate(cfg.block_size, cfg.file_limit);
        let must_split = overflow.estimated_size > cfg.block_size;

        // fold in any pending grm/gcksum deltas this commit carries, same
        // as every other Config-class tag this mdir owns.
        if !self.grm.is_empty() {
            mutate_grm_tag(&mut scratch, self.grm)?;
        }

        if !must_split {
            log::trace!("commit: mbid {mbid} fits in {} estimated bytes, committing in place", overflow.estimated_size);
            mutate(&mut mdir.rbyd)?;
            if !self.grm.is_empty() {
                mutate_grm_tag(&mut mdir.rbyd, self.grm)?;
            }
            let before_blocks = mdir.blocks;
            self.gcksum.fold_bytes(&mbid.to_le_bytes());
            mdir.commit(dev, cfg)?;
            self.handles.patch_relocation(before_blocks, mdir.blocks);
            self.mtree.upsert_mdir(dev, cfg, self.alloc, mbid, mdir.blocks)?;
            return Ok(Outcome::Committed);
        }

        log::debug!("commit: mbid {mbid} overflowed ({} > {}), splitting at rid {}", overflow.estimated_size, cfg.block_size, overflow.split_rid);
        // split: apply the real mutation, then divide the rbyd's entries at
        // the estimator's chosen boundary and commit each half to its own
        // block pair (the lower half keeps the existing pair; the upper
        // half gets freshly allocated blocks).
        mutate(&mut mdir.rbyd)?;
        let split_rid = overflow.split_rid;
        let upper_entries: Vec<_> = mdir
            .rbyd
            .entries
            .range((split_rid + 1, 0)..)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (k, _) in &upper_entries {
            mdir.rbyd.entries.remove(k);
        }
        mdir.rbyd.recompute_weight();

        let upper_block_a = self.alloc.alloc(|_off, _la| Ok(()))?;
        let upper_block_b = self.alloc.alloc(|_off, _la| Ok(()))?;
        let mut upper_rbyd = Rbyd::new(upper_block_a);
        let base = split_rid + 1;
        for ((r, t), v) in upper_entries {
            upper_rbyd.entries.insert((r - base, t), v);
        }
        upper_rbyd.recompute_weight();
        let mut upper_mdir = Mdir { blocks: [upper_block_a, upper_block_b], rbyd: upper_rbyd };

        let old_blocks = mdir.blocks;
        mdir.commit(dev, cfg)?;
        upper_mdir.commit(dev, cfg)?;

        let lower_mbid = mbid;
        let upper_mbid = mbid + 1;
        self.handles.patch_split(
            old_blocks,
            split_rid,
            mdir.blocks,
            lower_mbid,
            upper_mdir.blocks,
            upper_mbid,
        );
        self.mtree.upsert_mdir(dev, cfg, self.alloc, lower_mbid, mdir.blocks)?;
        self.mtree.upsert_mdir(dev, cfg, self.alloc, upper_mbid, upper_mdir.blocks)?;
        self.gcksum.fold_bytes(&mbid.to_le_bytes());
        log::debug!("commit: mbid {mbid} split into lower {lower_mbid} / upper {upper_mbid}");

        Ok(Outcome::Split { lower_mbid, upper_mbid })
    }
}

fn mutate_grm_tag(rbyd: &mut Rbyd, grm: &Grm) -> Result<()> {
    let tag = crate::tag::Tag::new(crate::tag::Mode::Normal, 0x2, 0x1).raw(); // GrmDelta
    let encoded = grm.encode();
    match rbyd.lookup_exact(0, tag) {
        Some(_) => rbyd.append_attr(0, tag, 0, encoded, false),
        None => rbyd.append_attr(0, tag, 1, encoded, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFlags;
    use crate::tag::{Mode, Tag};

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
            lookahead_size: 16,
            inline_size: 64,
            fragment_size: 0,
            crystal_thresh: u32::MAX,
            block_recycles: None,
            name_limit: 255,
            file_limit: 1 << 20,
            flags: ConfigFlags::NONE,
        }
    }

    fn name_tag() -> u16 {
        Tag::new(Mode::Normal, 0x3, 0x0).raw()
    }

    #[test]
    fn small_mutation_commits_without_splitting() {
        let c = cfg(512, 16);
        let mut dev = CachedDevice::new(RamDevice::new(512, 16), c.clone());
        let mut anchor = Mdir { blocks: [0, 1], rbyd: Rbyd::new(0) };
        anchor.commit(&mut dev, &c).unwrap();
        let mut mtree = MTree { root_mdir: anchor, mtree: None, mtree_root_mdir: None };
        let mut handles = HandleList::new();
        let mut grm = Grm::default();
        let mut gcksum = GCksum::new();
        let mut alloc = Allocator::new(c.block_count, c.lookahead_size);

        let mut pipeline = Pipeline {
            mtree: &mut mtree,
            handles: &mut handles,
            grm: &mut grm,
            gcksum: &mut gcksum,
            alloc: &mut alloc,
        };
        let outcome = pipeline
            .commit_mdir(&mut dev, &c, 0, |rbyd| rbyd.append_attr(0, name_tag(), 1, b"a".to_vec(), false))
            .unwrap();
        assert!(matches!(outcome, Outcome::Committed));
    }

    #[test]
    fn overflowing_mutation_splits_the_mdir() {
        let c = cfg(256, 32);
        let mut dev = CachedDevice::new(RamDevice::new(256, 32), c.clone());
        let mut anchor = Mdir { blocks: [0, 1], rbyd: Rbyd::new(0) };
        for i in 0..5i64 {
            anchor.rbyd.append_attr(i, name_tag(), 1, vec![b'x'; 20], false).unwrap();
        }
        anchor.commit(&mut dev, &c).unwrap();
        let mut mtree = MTree { root_mdir: anchor, mtree: None, mtree_root_mdir: None };
        let mut handles = HandleList::new();
        let mut grm = Grm::default();
        let mut gcksum = GCksum::new();
        let mut alloc = Allocator::new(c.block_count, c.lookahead_size);

        let mut pipeline = Pipeline {
            mtree: &mut mtree,
            handles: &mut handles,
            grm: &mut grm,
            gcksum: &mut gcksum,
            alloc: &mut alloc,
        };
        let outcome = pipeline
            .commit_mdir(&mut dev, &c, 0, |rbyd| rbyd.append_attr(5, name_tag(), 1, vec![b'y'; 20], false))
            .unwrap();
        assert!(matches!(outcome, Outcome::Split { .. }));
    }
}
