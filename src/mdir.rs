//! A metadata directory: a power-fail-safe pair of blocks, each an
//! [`Rbyd`], where the "live" half is whichever one has the greater
//! revision count with a valid trailing checksum.
//!
//! Committing never overwrites the currently-live half in place: it writes
//! a fresh compacted image to the *other* half with `revision + 1`, and
//! only after that prog succeeds does the other half become live. A crash
//! mid-write leaves the old half's higher-or-equal revision intact and
//! still valid, so recovery never has to do anything beyond "fetch both,
//! keep the winner" — there is no separate redo log for mdirs, unlike the
//! journaled commit pipeline ([`crate::commit`]) built on top of them.

use crate::config::Config;
use crate::device::cache::CachedDevice;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::rbyd::Rbyd;

#[derive(Debug, Clone)]
pub struct Mdir {
    pub blocks: [u32; 2],
    pub rbyd: Rbyd,
}

/// Wrap-safe "is `a` newer than `b`": revisions are compared
/// as the sign of their difference in two's complement, so a 32-bit counter
/// can wrap around indefinitely without ever looking "older" than where it
/// started.
fn newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

impl Mdir {
    /// Fetch both halves of `blocks` and pick the live one. If exactly one
    /// half fetches cleanly, that one wins outright (the other is presumed
    /// mid-relocation or simply never written). If both are corrupt, the
    /// pair itself is corrupt.
    pub fn fetch<D: BlockDevice>(dev: &mut CachedDevice<D>, blocks: [u32; 2]) -> Result<Self> {
        let block_size = dev.config().block_size;
        let a = Self::fetch_half(dev, blocks[0], block_size);
        let b = Self::fetch_half(dev, blocks[1], block_size);
        let rbyd = match (a, b) {
            (Ok(a), Ok(b)) => {
                if newer(a.revision, b.revision) {
                    a
                } else {
                    b
                }
            }
            (Ok(a), Err(_)) => a,
            (Err(_), Ok(b)) => b,
            (Err(e), Err(_)) => return Err(e),
        };
        Ok(Self { blocks, rbyd })
    }

    fn fetch_half<D: BlockDevice>(dev: &mut CachedDevice<D>, block: u32, block_size: u32) -> Result<Rbyd> {
        let data = dev.read(block, 0, block_size, crate::device::cache::HINT_MAX)?;
        Rbyd::fetch(block, &data)
    }

    fn other_half(&self) -> u32 {
        if self.rbyd.block == self.blocks[0] {
            self.blocks[1]
        } else {
            self.blocks[0]
        }
    }

    /// Compact `rbyd` (already mutated by the caller via `append_attr`) and
    /// program it into the non-live half with the next revision, toggling
    /// `perturb` each commit so the valid-bit parity a reader expects keeps
    /// alternating (`perturb` must differ between consecutive
    /// commits to the same block, or a reader couldn't tell a stale leftover
    /// valid bit from the new commit's). On success, that half becomes live.
    pub fn commit<D: BlockDevice>(&mut self, dev: &mut CachedDevice<D>, cfg: &Config) -> Result<()> {
        if cfg.is_rdonly() {
            return Err(Error::Inval);
        }
        let target = self.other_half();
        let next_revision = self.rbyd.revision.wrapping_add(1);
        let mut staged = self.rbyd.clone();
        staged.revision = next_revision.wrapping_sub(1); // compact() bumps by one itself
        let perturb = next_revision & 1 != 0;
        let phase = (next_revision & 0b11) as u8;
        let bytes = staged.compact(phase, perturb)?;
        dev.erase(target)?;
        dev.prog(target, 0, &bytes)?;
        dev.sync()?;
        log::trace!("mdir: relocated {:?} -> block {target} at revision {next_revision}", self.blocks);
        staged.block = target;
        self.rbyd = staged;
        Ok(())
    }
}
