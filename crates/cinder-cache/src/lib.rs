//! Build cache and artifact storage for Cinder.
//!
//! Blobs handed to the stores are uncompressed tar archives produced by a step runner;
//! the stores compress them at rest and verify a SHA-256 checksum on the way out.

pub mod archiver;
pub mod artifacts;
pub mod compression;
pub mod keys;
pub mod store;

pub use archiver::{pack, unpack};
pub use artifacts::{FilesystemArtifactStore, MemoryArtifactStore};
pub use compression::{compress, decompress};
pub use keys::{checksum, matches_prefix, sanitize_key};
pub use store::{CacheLimits, FilesystemCacheStore, MemoryCacheStore};
