//! The shrub: a B-tree inlined as a second trunk inside its host rbyd,
//! used for small or newly-grown files so they don't need a block of their
//! own just yet.
//!
//! A `Bshrub` is the tagged sum described there: `Null` (no data yet),
//! `Shrub` (still small enough to ride along inside the host mdir's block,
//! its single node held only in RAM until promoted), or `Btree` (promoted
//! to its own out-of-line nodes once it outgrows the host). Promotion is
//! one-way: a shrub that crosses `crystal_thresh` has its resident node
//! committed to a real block for the first time, and the host only keeps a
//! `STRUCT/BTREE` pointer to its root from then on.

use super::{commit_node, Btree, Refill};
use crate::alloc::Allocator;
use crate::device::cache::CachedDevice;
use crate::device::BlockDevice;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum Bshrub {
    Null,
    Shrub(Btree),
    Btree(Btree),
}

impl Bshrub {
    pub fn weight(&self) -> u32 {
        match self {
            Bshrub::Null => 0,
            Bshrub::Shrub(t) | Bshrub::Btree(t) => t.weight(),
        }
    }

    /// Insert into whichever representation is current, promoting a shrub
    /// to a standalone btree if the insert pushes its estimated size past
    /// `crystal_thresh` (a shrub's trunk lives in the host block, so it can
    /// only grow until it would crowd out the host's own attributes).
    /// Promotion commits the shrub's single resident node to a real block
    /// for the first time, through the same [`commit_node`] path every
    /// other B-tree node commit uses.
    pub fn insert<D: BlockDevice>(
        &mut self,
        dev: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        refill: Refill,
        bid: u32,
        weight: u32,
        payload: Vec<u8>,
        block_size: u32,
        crystal_thresh: u32,
    ) -> Result<()> {
        match self {
            Bshrub::Null => {
                let mut t = Btree::new_empty(0);
                t.insert(dev, alloc, refill, bid, weight, payload, block_size)?;
                *self = if t.root.estimate(block_size, u32::MAX as u64).estimated_size > crystal_thresh {
                    Bshrub::Btree(t)
                } else {
                    Bshrub::Shrub(t)
                };
            }
            Bshrub::Shrub(t) => {
                t.insert(dev, alloc, &mut *refill, bid, weight, payload, block_size)?;
                let est = t.root.estimate(block_size, u32::MAX as u64).estimated_size;
                if est > crystal_thresh {
                    let mut promoted = std::mem::replace(t, Btree::new_empty(0));
                    commit_node(dev, alloc, &mut *refill, &mut promoted.root)?;
                    log::debug!("shrub: promoted to a standalone btree at block {}", promoted.root.block);
                    *self = Bshrub::Btree(promoted);
                }
            }
            Bshrub::Btree(t) => {
                t.insert(dev, alloc, refill, bid, weight, payload, block_size)?;
            }
        }
        Ok(())
    }

    pub fn lookup<D: BlockDevice>(&self, dev: &mut CachedDevice<D>, bid: u32) -> Result<(u32, Vec<u8>)> {
        match self {
            Bshrub::Null => Err(Error::NoEnt),
            Bshrub::Shrub(t) | Bshrub::Btree(t) => t.lookup(dev, bid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Lookahead;
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
    fn small_inserts_stay_a_shrub() {
        let c = cfg(4096, 16);
        let mut dev = CachedDevice::new(RamDevice::new(4096, 16), c.clone());
        let mut alloc = Allocator::new(c.block_count, c.lookahead_size);
        let mut b = Bshrub::Null;
        b.insert(&mut dev, &mut alloc, &mut no_conflict_refill, 0, 1, vec![1, 2, 3], 4096, 512).unwrap();
        assert!(matches!(b, Bshrub::Shrub(_)));
        assert_eq!(b.weight(), 1);
    }

    #[test]
    fn large_inserts_promote_to_a_standalone_btree_reachable_on_device() {
        let c = cfg(512, 64);
        let mut dev = CachedDevice::new(RamDevice::new(512, 64), c.clone());
        let mut alloc = Allocator::new(c.block_count, c.lookahead_size);
        let mut b = Bshrub::Null;
        for i in 0..64u32 {
            b.insert(&mut dev, &mut alloc, &mut no_conflict_refill, i, 1, vec![0xaa; 64], 512, 256).unwrap();
        }
        assert!(matches!(b, Bshrub::Btree(_)), "expected promotion once past crystal_thresh");

        // the promoted root must be a real, independently-fetchable block,
        // not just a field set on an in-memory node.
        let Bshrub::Btree(t) = &b else { unreachable!() };
        let refetched = super::super::fetch_node(&mut dev, t.root.block).unwrap();
        assert_eq!(refetched.weight, t.root.weight);

        for i in 0..64u32 {
            let (_, v) = b.lookup(&mut dev, i).unwrap();
            assert_eq!(v, vec![0xaa; 64], "bid {i}");
        }
    }
}
