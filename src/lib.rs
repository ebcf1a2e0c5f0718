//! Cross-process shared-memory key/value cache.
//!
//! Short-lived worker processes attach to one named shared segment, perform
//! `get` / `set` / `add` / `replace` / `delete` / `exists` / `increment` /
//! `flush` operations on opaque binary values, and detach; the cache
//! survives every worker exit. Storage is a ring of fixed-size zones
//! evicted wholesale in insertion order, indexed by a chained hash table
//! living in the same segment, coordinated by process-shared rwlocks.
//!
//! ```no_run
//! use zonecache::Config;
//!
//! let cache = Config::new("demo").open()?;
//! cache.set(b"greeting", b"hello", 0)?;
//! assert_eq!(cache.get(b"greeting")?, Some((b"hello".to_vec(), 0)));
//! cache.increment(b"visits", 1, 0)?;
//! # Ok::<(), zonecache::Error>(())
//! ```
//!
//! There is no TTL and no per-item LRU: when the segment fills, the oldest
//! zone is dropped in one piece. Deleted values free their space in place;
//! the allocator only ever carves at the newest zone's top-of-stack.

#[cfg(not(unix))]
compile_error!("zonecache requires a Unix host: POSIX process-shared rwlocks and shm-backed mappings");

mod cache;
mod config;
mod error;
mod key;
mod shm;

pub use cache::Cache;
pub use config::Config;
pub use error::{Error, Result};
pub use shm::layout::{
    DEFAULT_SEGMENT_SIZE, FLAG_SERIALIZED, MAX_CHUNK_PAYLOAD, MAX_KEY_LEN, MIN_SEGMENT_SIZE,
};
pub use shm::CacheStats;
