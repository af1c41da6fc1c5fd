//! The superblock: the fixed set of `Config`-class tags every mroot carries,
//! and the rcompat/wcompat feature-flag validation that decides
//! whether this build is even allowed to mount a given image.
//!
//! `rcompat` bits describe on-disk features that change how data is *read*
//! (an unrecognized bit means this build cannot safely interpret the image
//! at all); `wcompat` bits describe features that only affect *writing*
//! (an unrecognized bit still lets a read-only mount through, matching the
//! ext-family compat/incompat/ro-compat convention other on-disk header
//! versioning schemes mirror in spirit, if not in
//! bit layout).

use crate::error::{Error, Result};

pub const MAGIC: &[u8; 8] = b"rbydfs\0\0";
pub const VERSION: u32 = 0x0001_0000;

/// A tiny hand-rolled stand-in for a real bitflags macro: this crate has
/// exactly two such flag sets and they're simple enough not to warrant a
/// proc-macro dependency.
macro_rules! bitflags_like {
    (
        $(#[$outer:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $(pub const $flag: Self = Self($value);)*

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            /// `true` if `self` (the on-disk image's flags) names any bit
            /// this build (`supported`) doesn't recognize.
            pub const fn has_unknown_bits(self, supported: Self) -> bool {
                self.0 & !supported.0 != 0
            }
        }
    };
}

bitflags_like! {
    /// Features that change on-disk *read* semantics; an unrecognized bit
    /// here is a hard mount failure (`NotSup`).
    pub struct Rcompat: u32 {
        const NONE = 0;
    }
}

bitflags_like! {
    /// Features that only change *write* semantics; an unrecognized bit
    /// only blocks read-write mounts, not read-only ones.
    pub struct Wcompat: u32 {
        const NONE = 0;
        const GCKSUM = 1 << 0;
    }
}

/// The fixed superblock fields every mroot's first mdir carries as
/// `Config`-class tags: on-disk geometry, the feature-compat
/// words, and the configured name/file limits.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub magic: [u8; 8],
    pub version: u32,
    pub rcompat: Rcompat,
    pub wcompat: Wcompat,
    pub ocompat: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub name_limit: u32,
    pub file_limit: u64,
}

impl Superblock {
    pub fn new(block_size: u32, block_count: u32, name_limit: u32, file_limit: u64) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            rcompat: Rcompat::NONE,
            wcompat: Wcompat::NONE,
            ocompat: 0,
            block_size,
            block_count,
            name_limit,
            file_limit,
        }
    }

    /// Validate this build can mount the image described by `self`,
    /// rejecting on unknown `rcompat` bits unconditionally and on unknown
    /// `wcompat` bits unless `readonly`.
    pub fn check_compat(&self, supported_rcompat: Rcompat, supported_wcompat: Wcompat, readonly: bool) -> Result<()> {
        if self.magic != *MAGIC {
            log::error!("superblock: bad magic {:?}", self.magic);
            return Err(Error::Corrupt);
        }
        if (self.version >> 16) != (VERSION >> 16) {
            // major version mismatch
            log::error!("superblock: version {:#x} incompatible with this build's {:#x}", self.version, VERSION);
            return Err(Error::NotSup);
        }
        if self.rcompat.has_unknown_bits(supported_rcompat) {
            log::error!("superblock: unknown rcompat bits {:#x}", self.rcompat.0 & !supported_rcompat.0);
            return Err(Error::NotSup);
        }
        if !readonly && self.wcompat.has_unknown_bits(supported_wcompat) {
            log::warn!("superblock: unknown wcompat bits {:#x}, read-write mount refused", self.wcompat.0 & !supported_wcompat.0);
            return Err(Error::NotSup);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_image_mounts_cleanly() {
        let sb = Superblock::new(4096, 128, 255, 1 << 20);
        assert!(sb.check_compat(Rcompat::NONE, Wcompat::GCKSUM, false).is_ok());
    }

    #[test]
    fn unknown_rcompat_bit_always_rejected() {
        let mut sb = Superblock::new(4096, 128, 255, 1 << 20);
        sb.rcompat = Rcompat(1 << 31);
        assert!(matches!(sb.check_compat(Rcompat::NONE, Wcompat::NONE, false), Err(Error::NotSup)));
        assert!(matches!(sb.check_compat(Rcompat::NONE, Wcompat::NONE, true), Err(Error::NotSup)));
    }

    #[test]
    fn unknown_wcompat_bit_only_blocks_readwrite() {
        let mut sb = Superblock::new(4096, 128, 255, 1 << 20);
        sb.wcompat = Wcompat(1 << 31);
        assert!(sb.check_compat(Rcompat::NONE, Wcompat::NONE, true).is_ok());
        assert!(matches!(sb.check_compat(Rcompat::NONE, Wcompat::NONE, false), Err(Error::NotSup)));
    }

    #[test]
    fn bad_magic_is_corrupt_not_unsupported() {
        let mut sb = Superblock::new(4096, 128, 255, 1 << 20);
        sb.magic = *b"garbage!";
        assert!(matches!(sb.check_compat(Rcompat::NONE, Wcompat::NONE, true), Err(Error::Corrupt)));
    }
}
