use crate::error::Result;
use crate::key::CacheKey;
use crate::shm::{CacheStats, SetMode, ShmCache};

/// The cache façade: sanitizes keys and delegates to the engine.
///
/// A `Cache` is one process's handle onto a shared segment; any number of
/// processes (or threads — the handle is `Send + Sync`) may operate on the
/// same segment concurrently. Values are opaque bytes plus one flag byte
/// that is stored and returned verbatim; serialize before `set` and check
/// [`FLAG_SERIALIZED`](crate::FLAG_SERIALIZED) after `get`.
pub struct Cache {
    engine: ShmCache,
}

impl Cache {
    pub(crate) fn new(engine: ShmCache) -> Self {
        Cache { engine }
    }

    /// Fetch a value and its flag byte; `None` on miss.
    pub fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u8)>> {
        self.engine.get(&CacheKey::new(key)?)
    }

    /// Store a value, overwriting any existing entry.
    pub fn set(&self, key: &[u8], value: &[u8], flags: u8) -> Result<()> {
        self.engine
            .set(&CacheKey::new(key)?, value, flags, SetMode::Upsert)
    }

    /// Store a value only when the key is absent; `Error::KeyExists`
    /// otherwise.
    pub fn add(&self, key: &[u8], value: &[u8], flags: u8) -> Result<()> {
        self.engine
            .set(&CacheKey::new(key)?, value, flags, SetMode::Add)
    }

    /// Store a value only when the key is present; `Error::KeyNotFound`
    /// otherwise.
    pub fn replace(&self, key: &[u8], value: &[u8], flags: u8) -> Result<()> {
        self.engine
            .set(&CacheKey::new(key)?, value, flags, SetMode::Replace)
    }

    /// Remove a key. Removing a missing key succeeds.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.engine.delete(&CacheKey::new(key)?)
    }

    /// Whether the key currently has a live entry.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.engine.exists(&CacheKey::new(key)?)
    }

    /// Adjust the decimal counter stored under `key` by `delta`, clamping
    /// at zero; a missing key is seeded with `initial + delta`.
    pub fn increment(&self, key: &[u8], delta: i64, initial: i64) -> Result<i64> {
        self.engine.increment(&CacheKey::new(key)?, delta, initial)
    }

    /// Drop every entry. Hit/miss counters survive.
    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }

    /// Aggregate counters and a live-item census of the segment.
    pub fn stats(&self) -> Result<CacheStats> {
        self.engine.stats()
    }

    /// Remove the segment's backing files. Handles still attached keep
    /// working on the orphaned mapping until they detach.
    pub fn destroy(self) -> Result<()> {
        self.engine.destroy()
    }
}
