//! # Checksum utils
//!
//! CRC-32C (Castagnoli) is used for every on-disk framing checksum in this
//! crate: the rbyd commit cksum, the mdir revision/validity
//! check, and the whole-block data cksum used by `ckdatacksumreads`. We wrap
//! the `crc` crate's incremental digest behind a small wrapper, so a future
//! swap to a hand-rolled table-based impl (if ever needed for `no_std`) only
//! touches this file.

use crc::{Crc, Digest, CRC_32_ISCSI};

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A CRC constant that flips the parity of a running checksum without moving
/// within its equivalence class under XOR — used to fold the CKSUM tag's
/// `perturb` bit into the stored checksum.
///
/// `ODDZERO` is any value `v` such that `crc32c(v-bytes appended) == crc ^ v`
/// does *not* generally hold; instead we use it purely as an XOR mask applied
/// directly to the finalized running CRC: the running CRC after the CKSUM
/// tag, XORed with `ODDZERO` when `perturb` is set.
pub const ODDZERO: u32 = 0x8000_0000;

#[derive(Clone)]
pub struct Crc32c {
    digest: Digest<'static, u32>,
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Crc32c {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crc32c")
            .field("digest", &self.clone().finish())
            .finish()
    }
}

impl Crc32c {
    pub const fn new() -> Self {
        Self {
            digest: CRC32C.digest(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    pub fn finish(self) -> u32 {
        self.digest.finalize()
    }
}

/// One-shot helper for the common case of checksumming a single buffer.
pub fn crc32c(bytes: &[u8]) -> u32 {
    let mut c = Crc32c::new();
    c.update(bytes);
    c.finish()
}

/// `parity(x)` is the low bit of the population count of `x`; this is the
/// "valid bit" contribution used by the tag codec: the tag codec's valid
/// bit is set to the parity of the running commit CRC (xor perturb), and a
/// reader must XOR that contribution back out before continuing the running
/// CRC across the tag.
pub fn parity(x: u32) -> bool {
    x.count_ones() % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_is_deterministic() {
        assert_eq!(crc32c(b"hello"), crc32c(b"hello"));
        assert_ne!(crc32c(b"hello"), crc32c(b"hellp"));
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut c = Crc32c::new();
        c.update(b"hel");
        c.update(b"lo");
        assert_eq!(c.finish(), crc32c(b"hello"));
    }

    #[test]
    fn oddzero_flips_parity() {
        let v = crc32c(b"flash");
        assert_ne!(parity(v), parity(v ^ ODDZERO));
    }
}
