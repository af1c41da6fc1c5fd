//! The 16-bit tag + leb128 weight/size wire codec.
//!
//! A tag's *semantic* value is 16 bits: a 4-bit `mode` (alt / cksum / normal /
//! internal) and a 12-bit `key` (further split into a 4-bit `supkey` and an
//! 8-bit `subkey`, e.g. `STRUCT/DATA` vs `STRUCT/BLOCK`). On the wire, the top
//! bit of that 16-bit word doubles as the commit's **valid bit**: its value is
//! forced to `parity(running_crc) ^ perturb` rather than carrying semantic
//! content, so mode values only ever use their low 3 bits on disk (plenty of
//! room for the four named categories). A reader maintains the same running
//! CRC and parity computation; if the stored valid bit doesn't match the
//! parity it expects, it has found the first byte of an interrupted commit
//! and stops there.

use crate::cksum::{parity, Crc32c};
use crate::error::{Error, Result};

pub const VALID_BIT: u16 = 1 << 15;
pub const MODE_MASK: u16 = 0x7000;
pub const KEY_MASK: u16 = 0x0fff;

/// The four tag mode categories. Internal-only kinds (RATTRS,
/// SHRUBCOMMIT, GRMPUSH, MOVE, ATTRS, ORPHAN, TRAVERSAL, UNKNOWN) live under
/// `Mode::Internal` and are asserted never to reach [`encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Alt = 0,
    Cksum = 1,
    Normal = 2,
    Internal = 3,
}

impl Mode {
    fn from_bits(bits: u16) -> Result<Self> {
        match bits {
            0 => Ok(Self::Alt),
            1 => Ok(Self::Cksum),
            2 => Ok(Self::Normal),
            3 => Ok(Self::Internal),
            _ => Err(Error::Corrupt),
        }
    }
}

/// The named kinds that live inside a `Normal`-mode tag's key.
/// Only a subset the commit pipeline actually emits is enumerated here;
/// unrecognized keys within a known supkey are preserved as `Unknown` rather
/// than rejected, so forward-compatible readers can skip attributes they
/// don't understand (mirrors the rcompat/wcompat "unknown bit" tolerance,
/// applied at the tag granularity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Null,
    ConfigMagic,
    ConfigVersion,
    ConfigRcompat,
    ConfigWcompat,
    ConfigOcompat,
    ConfigGeometry,
    ConfigNameLimit,
    ConfigFileLimit,
    GDelta,
    GrmDelta,
    GCksumDelta,
    NameReg,
    NameDir,
    NameStickyNote,
    NameBookmark,
    NameBName,
    NameMName,
    StructData,
    StructBlock,
    StructDid,
    StructBShrub,
    StructBTree,
    StructMRoot,
    StructMDir,
    StructMTree,
    StructBranch,
    Attr,
    Cksum,
    Alt { red: bool, gt: bool },
    ECksum,
    Note,
    Unknown(u16),
}

/// A decoded/to-be-encoded tag key, split into supkey (top 4 bits of the
/// 12-bit key) and subkey (bottom 8 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub mode: Mode,
    pub key: u16, // 12 bits
}

impl Tag {
    pub fn new(mode: Mode, supkey: u8, subkey: u8) -> Self {
        let key = (((supkey & 0xf) as u16) << 8) | subkey as u16;
        Self { mode, key }
    }

    pub fn supkey(&self) -> u8 {
        (self.key >> 8) as u8 & 0xf
    }

    pub fn subkey(&self) -> u8 {
        self.key as u8
    }

    pub fn kind(&self) -> Kind {
        use Kind::*;
        match self.mode {
            Mode::Alt => Alt {
                red: self.supkey() & 0b10 != 0,
                gt: self.supkey() & 0b01 != 0,
            },
            Mode::Cksum => Cksum,
            Mode::Normal => match (self.supkey(), self.subkey()) {
                (0x0, 0x0) => Null,
                (0x1, 0x0) => ConfigMagic,
                (0x1, 0x1) => ConfigVersion,
                (0x1, 0x2) => ConfigRcompat,
                (0x1, 0x3) => ConfigWcompat,
                (0x1, 0x4) => ConfigOcompat,
                (0x1, 0x5) => ConfigGeometry,
                (0x1, 0x6) => ConfigNameLimit,
                (0x1, 0x7) => ConfigFileLimit,
                (0x2, 0x0) => GDelta,
                (0x2, 0x1) => GrmDelta,
                (0x2, 0x2) => GCksumDelta,
                (0x3, 0x0) => NameReg,
                (0x3, 0x1) => NameDir,
                (0x3, 0x2) => NameStickyNote,
                (0x3, 0x3) => NameBookmark,
                (0x3, 0x4) => NameBName,
                (0x3, 0x5) => NameMName,
                (0x4, 0x0) => StructData,
                (0x4, 0x1) => StructBlock,
                (0x4, 0x2) => StructDid,
                (0x4, 0x3) => StructBShrub,
                (0x4, 0x4) => StructBTree,
                (0x4, 0x5) => StructMRoot,
                (0x4, 0x6) => StructMDir,
                (0x4, 0x7) => StructMTree,
                (0x4, 0x8) => StructBranch,
                (0x5, _) => Attr,
                (0x6, 0x0) => ECksum,
                (0x6, 0x1) => Note,
                _ => Unknown(self.key),
            },
            Mode::Internal => Unknown(self.key),
        }
    }

    /// Semantic 16-bit value before the valid bit is folded in. Used as the
    /// raw tag key stored alongside an rid in an [`crate::rbyd::Rbyd`]'s
    /// logical entry map.
    pub fn raw(&self) -> u16 {
        ((self.mode as u16) << 12) | (self.key & KEY_MASK)
    }

    fn semantic(&self) -> u16 {
        self.raw()
    }
}

/// Encode a tag's 2-byte wire prefix, folding in the valid bit computed from
/// `running_crc` (the CRC over everything written so far in this commit) and
/// `perturb`. Returns the two big-endian bytes and updates `running_crc` to
/// include them. The writer XORs the valid-bit contribution out of the
/// running CRC before CRCing the full tag, so that a reader performing the
/// same dance recovers an identical running CRC.
pub fn encode_tag_prefix(tag: Tag, running_crc: &mut Crc32c, perturb: bool) -> [u8; 2] {
    let semantic = tag.semantic();
    // valid bit = parity(crc-so-far) ^ perturb
    let crc_so_far = running_crc.clone().finish();
    let valid = parity(crc_so_far) ^ perturb;
    let wire = (semantic & !VALID_BIT) | if valid { VALID_BIT } else { 0 };
    let bytes = wire.to_be_bytes();
    running_crc.update(&bytes);
    bytes
}

/// Decode a tag's 2-byte wire prefix, checking the valid bit against the
/// expected parity. Returns `Err(Corrupt)` (treated by the rbyd fetch loop as
/// "stop, we found an interrupted commit") if the valid bit doesn't match.
pub fn decode_tag_prefix(bytes: [u8; 2], running_crc: &mut Crc32c, perturb: bool) -> Result<Tag> {
    let crc_so_far = running_crc.clone().finish();
    let expect_valid = parity(crc_so_far) ^ perturb;
    let wire = u16::from_be_bytes(bytes);
    let got_valid = wire & VALID_BIT != 0;
    if got_valid != expect_valid {
        return Err(Error::Corrupt);
    }
    running_crc.update(&bytes);
    let semantic = wire & !VALID_BIT;
    let mode = Mode::from_bits((semantic & MODE_MASK) >> 12)?;
    let key = semantic & KEY_MASK;
    Ok(Tag { mode, key })
}

/// Encode an unsigned value as leb128, capped at `max_bits` (28 for `size`,
/// 31 for `weight`). Appends to `out` and folds the bytes into
/// `crc`.
pub fn encode_leb128(mut value: u64, max_bits: u32, out: &mut Vec<u8>, crc: &mut Crc32c) -> Result<()> {
    if max_bits < 64 && value >= (1u64 << max_bits) {
        return Err(Error::Inval);
    }
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        crc.update(&[byte]);
        if value == 0 {
            break;
        }
    }
    Ok(())
}

/// Decode a leb128 value from `input`, returning the value and the number of
/// bytes consumed. Folds consumed bytes into `crc`. At most 5 bytes are read
/// (sufficient for the 31-bit weight cap plus continuation overhead).
pub fn decode_leb128(input: &[u8], crc: &mut Crc32c) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in input.iter().enumerate() {
        if i >= 5 {
            return Err(Error::Corrupt);
        }
        crc.update(&[byte]);
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::Corrupt)
}
