//! Cirrus filesystem - a stable inode namespace over mounted providers
//!
//! Projects the union of any number of provider handles as a virtual
//! filesystem suitable for an outer FUSE-like layer:
//!
//! - a synthetic root (inode 1) with one child per mounted provider, each
//!   carrying a synthetic `authorize.html` child that surfaces the consent
//!   URL when a provider needs re-authorization;
//! - directory caching with a refresh TTL and a persisted listing cache;
//! - a read path with a bounded per-inode chunk FIFO and read-ahead;
//! - a write path buffering locally and uploading on `fsync`;
//! - two background workers (finish and cancel) that keep user callbacks
//!   off callers' threads and give shutdown an ordered join point.

pub mod filesystem;
pub mod listing_cache;
pub mod node;
pub mod workers;

pub use filesystem::{CloudFileSystem, NodeInfo, ProviderMount};
pub use listing_cache::{ListingCache, ListingKey};
pub use node::{Inode, AUTH_ITEM_ID, CACHED_CHUNK_COUNT, CACHE_DIRECTORY_DURATION, READ_AHEAD, ROOT_INODE};
pub use workers::WorkerQueues;
