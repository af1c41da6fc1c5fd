/*
 * Error taxonomy surfaced by the rbyd/btree/mdir core to its callers.
 *
 * This mirrors the errno-style negative-integer codes of the reference design
 * as a plain enum rather than raw integers, and keeps a commit-or-revert
 * contract: every fallible routine in this crate returns `Result<T>`, and the
 * only variants that may be produced by a *successful* on-disk mutation are
 * the ones explicitly called out per routine.
 */

use std::{fmt, io};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// No such entry (file, directory, tag, or mid).
    NoEnt,
    /// Entry already exists.
    Exist,
    /// Expected a directory, found something else.
    NotDir,
    /// Expected a non-directory, found a directory.
    IsDir,
    /// Directory is not empty.
    NotEmpty,
    /// Name exceeds the configured `name_limit`.
    NameTooLong,
    /// File exceeds the configured `file_limit`.
    FBig,
    /// Allocator exhausted after a full lookahead pass.
    NoSpc,
    /// A buffer allocation failed (only relevant if the caller did not supply
    /// its own buffers).
    NoMem,
    /// Any disk-level validation failure: bad cksum, malformed tag, unbalanced
    /// rbyd, or a device read/prog error that isn't an assertion.
    Corrupt,
    /// Precondition violation: bad path, out-of-range seek, bad config.
    Inval,
    /// An on-disk feature this build doesn't understand (rcompat/wcompat).
    NotSup,
    /// Requested user attribute absent.
    NoAttr,
    /// Wraps an underlying device I/O error that isn't itself a corruption.
    Io(io::Error),
    /// A handle observed a remove/rename race and must re-synchronize
    /// ("rename-over-stickynote").
    Desync,
    /// Internal invariant violation (weight underflow, unreachable rebalance
    /// state). Asserted in debug builds; returned as `Corrupt` in release
    /// builds ("fatal / asserted").
    Internal(&'static str),
}

impl Error {
    /// Turn an internal invariant violation into the right thing for the
    /// build profile: panic in debug (so tests catch the bug immediately),
    /// `Corrupt` in release (so a field unit doesn't just abort).
    #[track_caller]
    pub(crate) fn internal(msg: &'static str) -> Self {
        debug_assert!(false, "rbydfs internal invariant violated: {msg}");
        Error::Internal(msg)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEnt => write!(f, "no such entry"),
            Self::Exist => write!(f, "entry already exists"),
            Self::NotDir => write!(f, "not a directory"),
            Self::IsDir => write!(f, "is a directory"),
            Self::NotEmpty => write!(f, "directory not empty"),
            Self::NameTooLong => write!(f, "name exceeds configured limit"),
            Self::FBig => write!(f, "file exceeds configured limit"),
            Self::NoSpc => write!(f, "no space left on device"),
            Self::NoMem => write!(f, "out of memory"),
            Self::Corrupt => write!(f, "corrupt on-disk state"),
            Self::Inval => write!(f, "invalid argument"),
            Self::NotSup => write!(f, "unsupported on-disk feature"),
            Self::NoAttr => write!(f, "attribute not found"),
            Self::Io(e) => write!(f, "device I/O error: {e}"),
            Self::Desync => write!(f, "handle desynchronized from disk state"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
