//! A power-fail-safe, wear-leveled, log-structured filesystem core for raw
//! flash block devices.
//!
//! The on-disk structure is a tree of rbyds (append-only, checksummed,
//! balanced-alt-tree blocks — [`rbyd`]), organized into B-trees
//! ([`btree`]) of metadata directories ([`mdir`], [`mtree`]), committed
//! transactionally ([`commit`]) with a replicated superblock
//! ([`superblock`]), wear-leveled allocation ([`alloc`]), and a resumable
//! traversal engine ([`traversal`]) for consistency checks and compaction.

pub mod alloc;
pub mod btree;
pub mod cksum;
pub mod commit;
pub mod config;
pub mod device;
pub mod error;
pub mod gstate;
pub mod handle;
mod macros;
pub mod mdir;
pub mod mtree;
pub mod rbyd;
pub mod superblock;
pub mod tag;
pub mod traversal;

pub use config::Config;
pub use error::{Error, Result};

/// Initialize `env_logger` from the `RBYDFS_LOG` environment variable
/// (`info` if unset), for emulator/CLI front ends that want the crate's
/// `log` output on stderr without building their own logger.
#[cfg(feature = "logger")]
pub fn init_logger() {
    env_logger::Builder::new()
        .parse_filters(&std::env::var("RBYDFS_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
}
