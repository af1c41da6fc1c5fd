//! The lookahead-bitmap block allocator.
//!
//! Free/in-use state for the whole device is never fully materialized in
//! RAM; instead a `lookahead_size`-bit window is scanned from the device
//! (via the mtree/mdir traversal, conceptually — here the window is filled
//! by whatever caller drives the scan) and consumed bit by bit. Exhausting
//! the window advances the scan start and refills it; exhausting a full
//! pass around the device without finding a free block is `NoSpc`.

use crate::error::{Error, Result};

/// A window of `size` consecutive blocks starting at `off`, one bit per
/// block (`true` = in use).
pub struct Lookahead {
    off: u32,
    size: u32,
    block_count: u32,
    bits: Vec<bool>,
    cursor: u32,
    /// Bumped every time the window wraps back to block 0, so callers can
    /// tell "we've scanned the whole device since the last checkpoint"
    /// (see `ckpoint`).
    pass: u64,
}

impl Lookahead {
    pub fn new(block_count: u32, size: u32) -> Self {
        let size = size.min(block_count).max(1);
        Self {
            off: 0,
            size,
            block_count,
            bits: vec![false; size as usize],
            cursor: 0,
            pass: 0,
        }
    }

    /// Mark `block` in-use if it falls within the current window.
    pub fn mark_inuse(&mut self, block: u32) {
        if block >= self.off && block < self.off + self.size {
            self.bits[(block - self.off) as usize] = true;
        }
    }

    pub fn mark_free(&mut self, block: u32) {
        if block >= self.off && block < self.off + self.size {
            self.bits[(block - self.off) as usize] = false;
        }
    }

    /// Advance the window to start at `off`, clearing it (the caller is
    /// expected to re-mark every block the mtree/mdir traversal reports as
    /// in-use within the new window before calling `alloc`).
    pub fn refill_at(&mut self, off: u32) {
        if off == 0 && self.off != 0 {
            self.pass += 1;
        }
        self.off = off % self.block_count.max(1);
        self.bits.iter_mut().for_each(|b| *b = false);
        self.cursor = 0;
    }

    /// Find the next free block in the current window, advancing the
    /// cursor. Returns `Ok(None)` when the window is exhausted (caller
    /// should refill and retry); after a full pass around the device with
    /// no free block found anywhere, the caller should surface `NoSpc`.
    pub fn alloc_from_window(&mut self) -> Option<u32> {
        while (self.cursor as usize) < self.bits.len() {
            let i = self.cursor;
            self.cursor += 1;
            if !self.bits[i as usize] {
                self.bits[i as usize] = true;
                return Some(self.off + i);
            }
        }
        None
    }

    pub fn pass_count(&self) -> u64 {
        self.pass
    }
}

/// Drives [`Lookahead`] across however many windows are needed to satisfy
/// one allocation, refilling via `refill` (supplied by the caller, since
/// only the caller's mtree/mdir traversal knows which blocks are live) and
/// giving up with `NoSpc` once a full revolution around the device has
/// turned up nothing.
pub struct Allocator {
    lookahead: Lookahead,
    populated: bool,
}

impl Allocator {
    pub fn new(block_count: u32, lookahead_size: u32) -> Self {
        Self {
            lookahead: Lookahead::new(block_count, lookahead_size),
            populated: false,
        }
    }

    pub fn ckpoint(&self) -> u64 {
        self.lookahead.pass_count()
    }

    /// Allocate one block, calling `refill(window_off, lookahead)` to
    /// (re)populate the window with live blocks whenever the current window
    /// is exhausted or has never been scanned. `refill` returns `Err` only
    /// on a real I/O/corruption failure while scanning; exhausting the
    /// whole device is reported by this function as `NoSpc`, not by
    /// `refill`.
    pub fn alloc(&mut self, mut refill: impl FnMut(u32, &mut Lookahead) -> Result<()>) -> Result<u32> {
        let block_count = self.lookahead.block_count;
        let starting_pass = self.lookahead.pass;
        if !self.populated {
            refill(self.lookahead.off, &mut self.lookahead)?;
            self.populated = true;
        }
        loop {
            if let Some(b) = self.lookahead.alloc_from_window() {
                return Ok(b);
            }
            let next_off = (self.lookahead.off + self.lookahead.size) % block_count.max(1);
            self.lookahead.refill_at(next_off);
            refill(next_off, &mut self.lookahead)?;
            if self.lookahead.pass > starting_pass + 1 {
                log::warn!("alloc: exhausted a full revolution over {block_count} blocks with no free block found");
                return Err(Error::NoSpc);
            }
        }
    }
}
