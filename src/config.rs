use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::Cache;
use crate::error::Result;
use crate::shm::layout::DEFAULT_SEGMENT_SIZE;
use crate::shm::region::{derive_segment_name, shm_dir};
use crate::shm::ShmCache;

/// Configuration for attaching to (or creating) a cache segment.
///
/// ```no_run
/// use zonecache::Config;
///
/// let cache = Config::new("sessions")
///     .segment_size(32 * 1024 * 1024)
///     .open()?;
/// # Ok::<(), zonecache::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    name: String,
    directory: PathBuf,
    segment_size: usize,
    lock_timeout: Option<Duration>,
    stats_flush_every: u64,
}

impl Config {
    /// Configuration for the segment called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Config {
            name: name.into(),
            directory: shm_dir(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            lock_timeout: None,
            stats_flush_every: 64,
        }
    }

    /// Derive the segment name from the inode of a well-known file, so
    /// independent processes resolving the same path share one segment.
    pub fn from_name_file(path: &Path) -> Result<Self> {
        Ok(Self::new(derive_segment_name(path)?))
    }

    /// Directory holding the backing files. Defaults to a shm-backed
    /// location (`/dev/shm` on Linux).
    #[must_use]
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = dir.into();
        self
    }

    /// Total segment size for a freshly created segment; an existing
    /// segment is attached at its recorded size. Clamped up to the minimum
    /// segment size.
    #[must_use]
    pub fn segment_size(mut self, bytes: usize) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Give up on lock acquisition after this long, surfacing
    /// `Error::Locked`. Default: block indefinitely.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Fold buffered hit/miss counters into the segment after this many
    /// gets. Default 64.
    #[must_use]
    pub fn stats_flush_every(mut self, every: u64) -> Self {
        self.stats_flush_every = every.max(1);
        self
    }

    /// Attach to the segment, creating and initializing it when absent.
    pub fn open(self) -> Result<Cache> {
        let engine = ShmCache::attach(
            &self.directory,
            &self.name,
            self.segment_size,
            self.lock_timeout,
            self.stats_flush_every,
        )?;
        Ok(Cache::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new("t");
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(config.lock_timeout, None);
        assert_eq!(config.stats_flush_every, 64);
    }

    #[test]
    fn flush_threshold_never_zero() {
        let config = Config::new("t").stats_flush_every(0);
        assert_eq!(config.stats_flush_every, 1);
    }

    #[test]
    fn name_file_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let a = Config::from_name_file(&dir.path().join("cache.name")).unwrap();
        let b = Config::from_name_file(&dir.path().join("cache.name")).unwrap();
        assert_eq!(a.name, b.name);
    }
}
