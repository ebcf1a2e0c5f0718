/// Shared-memory cache engine.
///
/// Provides `ShmCache` — a cross-process key/value store backed by one
/// mmap'd segment laid out per `layout`, plus a mapped file of
/// process-shared rwlocks. Multiple processes attaching to the same name
/// get independent `ShmCache` handles over the same bytes.
///
/// Lock discipline (the canonical order is `BUCKET[b] → RING → ZONE[z]`):
/// ordinary reads hold `SEGMENT` shared plus one `BUCKET` shared; single
/// chunk writes upgrade the bucket to exclusive; allocation and eviction
/// additionally take `RING` exclusive and then exactly one `ZONE`
/// exclusive. Eviction is the one place extra bucket locks are taken out
/// of order, and only ever with try-exclusive plus back-off.
pub mod codec;
pub mod hashtable;
pub mod layout;
pub mod lock;
pub mod region;
pub mod zone;

use std::fs;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::key::CacheKey;
use codec::{ChunkRef, ZoneRef};
use layout::{Geometry, BUCKET_COUNT, CHUNK_META_SIZE, MAX_CHUNK_PAYLOAD, MIN_SEGMENT_SIZE, MIN_VALUE_ALLOC};
use lock::LockSet;
use region::ShmRegion;

/// How an insert treats an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Insert or overwrite.
    Upsert,
    /// Fail with `KeyExists` when the key is present.
    Add,
    /// Fail with `KeyNotFound` when the key is absent.
    Replace,
}

/// Aggregate returned by `stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub get_hits: i64,
    pub get_misses: i64,
    pub items: u64,
    pub value_bytes: u64,
    pub used_buckets: usize,
    pub zone_count: usize,
    pub oldest_zone_index: usize,
}

/// Per-process buffered hit/miss counters, folded into the segment's stats
/// words under the `STATS` lock.
#[derive(Default)]
struct LocalStats {
    hits: u64,
    misses: u64,
}

/// The engine handle. One per attaching process (or more; handles are
/// independent).
pub struct ShmCache {
    region: ShmRegion,
    locks: LockSet,
    geometry: Geometry,
    local: Mutex<LocalStats>,
    lock_timeout: Option<Duration>,
    stats_flush_every: u64,
}

impl ShmCache {
    /// Attach to the named segment under `dir`, creating and initializing
    /// it when absent.
    ///
    /// An existing segment is adopted at its recorded size (the segment is
    /// never resized after creation); `desired_size` only shapes a fresh
    /// one. Create-vs-open races are serialized by an advisory lock on the
    /// lock file.
    pub(crate) fn attach(
        dir: &Path,
        name: &str,
        desired_size: usize,
        lock_timeout: Option<Duration>,
        stats_flush_every: u64,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let data_path = dir.join(format!("{name}.data"));
        let lock_path = dir.join(format!("{name}.lock"));

        let guard_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;
        region::flock_exclusive(&guard_file)?;

        let size = desired_size.max(MIN_SEGMENT_SIZE);
        let (region, geometry, fresh) = match Self::open_existing(&data_path) {
            Some((region, geometry)) => {
                if geometry.segment_size != size {
                    log::warn!(
                        "attaching to existing segment of {} bytes (requested {size})",
                        geometry.segment_size
                    );
                }
                (region, geometry, false)
            }
            None => {
                let geometry = Geometry::for_segment_size(size)?;
                let region = ShmRegion::create(&data_path, size)?;
                init_segment(&region, &geometry)?;
                (region, geometry, true)
            }
        };

        // A fresh segment gets fresh locks: an old lock file may still
        // encode a lock held by a dead process.
        let locks = if fresh {
            LockSet::create(&lock_path, geometry.zone_count)?
        } else {
            match LockSet::open(&lock_path, geometry.zone_count) {
                Ok(locks) => locks,
                Err(_) => LockSet::create(&lock_path, geometry.zone_count)?,
            }
        };
        drop(guard_file);

        Ok(ShmCache {
            region,
            locks,
            geometry,
            local: Mutex::new(LocalStats::default()),
            lock_timeout,
            stats_flush_every,
        })
    }

    /// Open and validate an existing data file; `None` means "create fresh"
    /// (missing, undersized, or with an out-of-range ring pointer).
    fn open_existing(data_path: &Path) -> Option<(ShmRegion, Geometry)> {
        if !data_path.exists() {
            return None;
        }
        let region = ShmRegion::open(data_path).ok()?;
        if region.len() < MIN_SEGMENT_SIZE {
            log::warn!("segment file {data_path:?} is undersized; recreating");
            return None;
        }
        let geometry = Geometry::for_segment_size(region.len()).ok()?;
        let oldest = codec::read_word(&region, geometry.oldest_zone_off()).ok()?;
        if oldest < 0 || oldest as usize >= geometry.zone_count {
            log::warn!("segment file {data_path:?} has a bad ring pointer; recreating");
            return None;
        }
        Some((region, geometry))
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Read `oldestZoneIndex`. The caller holds `RING` in some mode.
    fn oldest_zone(&self) -> Result<usize> {
        let raw = codec::read_word(&self.region, self.geometry.oldest_zone_off())?;
        let oldest = codec::word_to_usize(raw, "negative oldestZoneIndex")?;
        if oldest >= self.geometry.zone_count {
            return Err(Error::Corrupt("oldestZoneIndex out of range"));
        }
        Ok(oldest)
    }

    /// Look up a key and copy out its value and flag byte.
    pub fn get(&self, key: &CacheKey) -> Result<Option<(Vec<u8>, u8)>> {
        let padded = key.padded();
        let bucket = hashtable::bucket_index(key.as_bytes());

        let found = {
            let _segment = self.locks.segment().shared(self.lock_timeout)?;
            let _bucket = self.locks.bucket(bucket).shared(self.lock_timeout)?;
            match hashtable::lookup(&self.region, &self.geometry, bucket, &padded)? {
                Some(chunk) => Some((
                    chunk.read_value(&self.region)?,
                    chunk.flags(&self.region)?,
                )),
                None => None,
            }
        };

        self.record_get(found.is_some());
        Ok(found)
    }

    /// Whether a live entry exists for the key. Does not touch stats.
    pub fn exists(&self, key: &CacheKey) -> Result<bool> {
        let padded = key.padded();
        let bucket = hashtable::bucket_index(key.as_bytes());

        let _segment = self.locks.segment().shared(self.lock_timeout)?;
        let _bucket = self.locks.bucket(bucket).shared(self.lock_timeout)?;
        Ok(hashtable::lookup(&self.region, &self.geometry, bucket, &padded)?.is_some())
    }

    /// Insert, overwrite, `add` or `replace` a value.
    ///
    /// Overwrites reuse the chunk in place when the new value fits its
    /// allocation; otherwise the old chunk is freed and a new one carved.
    /// An oversize value is rejected, but — memcached semantics — still
    /// removes any prior entry for the key.
    pub fn set(&self, key: &CacheKey, value: &[u8], flags: u8, mode: SetMode) -> Result<()> {
        if value.is_empty() {
            return Err(Error::EmptyValue);
        }
        let padded = key.padded();
        let bucket = hashtable::bucket_index(key.as_bytes());

        let _segment = self.locks.segment().shared(self.lock_timeout)?;
        let _bucket = self.locks.bucket(bucket).exclusive(self.lock_timeout)?;

        let existing = hashtable::lookup(&self.region, &self.geometry, bucket, &padded)?;
        match mode {
            SetMode::Add if existing.is_some() => return Err(Error::KeyExists),
            SetMode::Replace if existing.is_none() => return Err(Error::KeyNotFound),
            _ => {}
        }

        if value.len() > MAX_CHUNK_PAYLOAD {
            if let Some(chunk) = existing {
                self.unlink_and_free(bucket, chunk)?;
            }
            return Err(Error::Oversize(value.len()));
        }

        if let Some(chunk) = existing {
            if value.len() <= chunk.val_alloc_size(&self.region)? {
                chunk.write_value(&self.region, value)?;
                chunk.set_flags(&self.region, flags)?;
                return Ok(());
            }
            self.unlink_and_free(bucket, chunk)?;
        }

        let chunk = self.allocate(bucket, &padded, value, flags)?;
        hashtable::link_tail(&self.region, &self.geometry, bucket, chunk)
    }

    /// Remove a key. Removing a missing key is not an error.
    pub fn delete(&self, key: &CacheKey) -> Result<()> {
        let padded = key.padded();
        let bucket = hashtable::bucket_index(key.as_bytes());

        let _segment = self.locks.segment().shared(self.lock_timeout)?;
        let _bucket = self.locks.bucket(bucket).exclusive(self.lock_timeout)?;

        if let Some(chunk) = hashtable::lookup(&self.region, &self.geometry, bucket, &padded)? {
            self.unlink_and_free(bucket, chunk)?;
        }
        Ok(())
    }

    /// Adjust a decimal counter, clamping the result at zero.
    ///
    /// A missing key is seeded with `initial + delta`; a value that does
    /// not parse as a decimal integer fails without touching the segment.
    pub fn increment(&self, key: &CacheKey, delta: i64, initial: i64) -> Result<i64> {
        let padded = key.padded();
        let bucket = hashtable::bucket_index(key.as_bytes());

        let _segment = self.locks.segment().shared(self.lock_timeout)?;
        let _bucket = self.locks.bucket(bucket).exclusive(self.lock_timeout)?;

        match hashtable::lookup(&self.region, &self.geometry, bucket, &padded)? {
            Some(chunk) => {
                let stored = chunk.read_value(&self.region)?;
                let prior = parse_decimal(&stored).ok_or(Error::NonNumeric)?;
                let next = prior.saturating_add(delta).max(0);
                let text = next.to_string();
                let flags = chunk.flags(&self.region)?;

                if text.len() <= chunk.val_alloc_size(&self.region)? {
                    chunk.write_value(&self.region, text.as_bytes())?;
                } else {
                    self.unlink_and_free(bucket, chunk)?;
                    let fresh = self.allocate(bucket, &padded, text.as_bytes(), flags)?;
                    hashtable::link_tail(&self.region, &self.geometry, bucket, fresh)?;
                }
                Ok(next)
            }
            None => {
                let next = initial.saturating_add(delta).max(0);
                let text = next.to_string();
                let chunk = self.allocate(bucket, &padded, text.as_bytes(), 0)?;
                hashtable::link_tail(&self.region, &self.geometry, bucket, chunk)?;
                Ok(next)
            }
        }
    }

    /// Drop every entry and rewind the ring. Stats survive.
    pub fn flush(&self) -> Result<()> {
        let _segment = self.locks.segment().exclusive(self.lock_timeout)?;

        for bucket in 0..BUCKET_COUNT {
            codec::write_word(&self.region, self.geometry.bucket_slot_off(bucket), 0)?;
        }
        for z in 0..self.geometry.zone_count {
            zone::reset_zone(&self.region, &self.geometry, z)?;
        }
        codec::write_word(
            &self.region,
            self.geometry.oldest_zone_off(),
            (self.geometry.zone_count - 1) as i64,
        )?;
        log::debug!("flushed segment");
        Ok(())
    }

    /// Walk the segment and aggregate live items, bytes and counters.
    pub fn stats(&self) -> Result<CacheStats> {
        self.flush_local_stats()?;

        let _segment = self.locks.segment().shared(self.lock_timeout)?;

        let (get_hits, get_misses) = {
            let _stats = self.locks.stats().shared(self.lock_timeout)?;
            (
                codec::read_word(&self.region, self.geometry.hits_off())?,
                codec::read_word(&self.region, self.geometry.misses_off())?,
            )
        };

        let mut used_buckets = 0;
        for bucket in 0..BUCKET_COUNT {
            let _bucket = self.locks.bucket(bucket).shared(self.lock_timeout)?;
            if hashtable::bucket_head(&self.region, &self.geometry, bucket)? != 0 {
                used_buckets += 1;
            }
        }

        let mut items = 0u64;
        let mut value_bytes = 0u64;
        for z in 0..self.geometry.zone_count {
            let _zone = self.locks.zone(z).shared(self.lock_timeout)?;
            let mut walker = zone::ChunkWalker::new(&self.region, ZoneRef::at(&self.geometry, z))?;
            while let Some(chunk) = walker.next(&self.region)? {
                let val_size = chunk.val_size(&self.region)?;
                if val_size > 0 {
                    items += 1;
                    value_bytes += val_size as u64;
                }
            }
        }

        let oldest_zone_index = {
            let _ring = self.locks.ring().shared(self.lock_timeout)?;
            self.oldest_zone()?
        };

        Ok(CacheStats {
            get_hits,
            get_misses,
            items,
            value_bytes,
            used_buckets,
            zone_count: self.geometry.zone_count,
            oldest_zone_index,
        })
    }

    /// Remove the backing files. Other attached processes keep their
    /// mappings until they detach.
    pub fn destroy(self) -> Result<()> {
        let _ = self.flush_local_stats();
        {
            let _segment = self.locks.segment().exclusive(self.lock_timeout)?;
            self.region.unlink()?;
            self.locks.unlink()?;
        }
        log::debug!("destroyed segment files");
        Ok(())
    }

    /// Unlink a chunk from its (exclusively held) bucket and recover its
    /// zone space. Canonical order: the bucket is held, then the zone.
    fn unlink_and_free(&self, bucket: usize, chunk: ChunkRef) -> Result<()> {
        hashtable::unlink(&self.region, &self.geometry, bucket, chunk)?;
        let z = self.geometry.zone_of_offset(chunk.offset)?;
        let _zone = self.locks.zone(z).exclusive(self.lock_timeout)?;
        zone::free_chunk(&self.region, ZoneRef::at(&self.geometry, z), chunk)
    }

    /// Carve a chunk for `value`, evicting the oldest zone as needed.
    ///
    /// Runs under the caller's bucket lock; takes `RING` exclusive, then a
    /// single zone lock. When eviction loses the try-lock race on a foreign
    /// bucket, everything past the caller's bucket is dropped and the whole
    /// allocation restarts after a yield.
    fn allocate(
        &self,
        held_bucket: usize,
        padded_key: &[u8; layout::MAX_KEY_LEN],
        value: &[u8],
        flags: u8,
    ) -> Result<ChunkRef> {
        debug_assert!(value.len() <= MAX_CHUNK_PAYLOAD);
        let need = CHUNK_META_SIZE + value.len().max(MIN_VALUE_ALLOC);

        loop {
            let ring = self.locks.ring().exclusive(self.lock_timeout)?;
            let oldest = self.oldest_zone()?;
            let newest = zone::newest_zone_index(oldest, self.geometry.zone_count);

            {
                let _zone = self.locks.zone(newest).exclusive(self.lock_timeout)?;
                let zref = ZoneRef::at(&self.geometry, newest);
                if zone::free_space(&self.region, zref)? >= need {
                    return zone::carve(&self.region, zref, padded_key, value, flags);
                }
                // Not enough room: fall through to evict the oldest zone.
                // The newest zone's lock drops here — never two zones at once.
            }

            let victim = oldest;
            let zone_guard = self.locks.zone(victim).exclusive(self.lock_timeout)?;
            if !self.evict_zone(victim, held_bucket)? {
                drop(zone_guard);
                drop(ring);
                log::trace!("eviction of zone {victim} contended; restarting allocation");
                std::thread::yield_now();
                continue;
            }

            // The evicted zone is now the newest.
            codec::write_word(
                &self.region,
                self.geometry.oldest_zone_off(),
                ((victim + 1) % self.geometry.zone_count) as i64,
            )?;
            let zref = ZoneRef::at(&self.geometry, victim);
            return zone::carve(&self.region, zref, padded_key, value, flags);
        }
    }

    /// Unlink every live chunk in the zone and reset it to one free chunk.
    ///
    /// Holds `RING`, the zone's lock and the caller's bucket lock. Foreign
    /// buckets are taken with try-exclusive only, one at a time; `false`
    /// means a try-lock failed and the caller must back off. Chunks already
    /// processed stay dead — a retried eviction just has less to do.
    fn evict_zone(&self, zone_index: usize, held_bucket: usize) -> Result<bool> {
        let zref = ZoneRef::at(&self.geometry, zone_index);
        let mut walker = zone::ChunkWalker::new(&self.region, zref)?;

        while let Some(chunk) = walker.next(&self.region)? {
            if chunk.val_size(&self.region)? == 0 {
                continue;
            }
            let key = chunk.key_trimmed(&self.region)?.to_vec();
            let bucket = hashtable::bucket_index(&key);

            if bucket == held_bucket {
                self.unlink_evicted(bucket, chunk)?;
            } else {
                match self.locks.bucket(bucket).try_exclusive() {
                    Some(_guard) => self.unlink_evicted(bucket, chunk)?,
                    None => return Ok(false),
                }
            }
        }

        zone::reset_zone(&self.region, &self.geometry, zone_index)?;
        log::debug!("evicted zone {zone_index}");
        Ok(true)
    }

    /// Unlink one chunk under its (now held) bucket lock and mark it dead.
    fn unlink_evicted(&self, bucket: usize, chunk: ChunkRef) -> Result<()> {
        // Re-check under the bucket lock; an updater may have raced the walk.
        if chunk.val_size(&self.region)? == 0 {
            return Ok(());
        }
        match hashtable::unlink(&self.region, &self.geometry, bucket, chunk) {
            Ok(()) => {}
            Err(Error::Corrupt(what)) => {
                log::warn!(
                    "eviction skipped chunk at {} not reachable from bucket {bucket}: {what}",
                    chunk.offset
                );
            }
            Err(e) => return Err(e),
        }
        chunk.set_val_size(&self.region, 0)
    }

    fn record_get(&self, hit: bool) {
        let mut local = self.local.lock();
        if hit {
            local.hits += 1;
        } else {
            local.misses += 1;
        }
        if local.hits + local.misses >= self.stats_flush_every {
            if let Err(e) = self.fold_stats(&mut local) {
                log::warn!("deferring stats flush: {e}");
            }
        }
    }

    /// Fold the buffered counters into the segment under `STATS` exclusive.
    fn fold_stats(&self, local: &mut LocalStats) -> Result<()> {
        if local.hits == 0 && local.misses == 0 {
            return Ok(());
        }
        let _stats = self.locks.stats().exclusive(self.lock_timeout)?;
        let hits = codec::read_word(&self.region, self.geometry.hits_off())?;
        let misses = codec::read_word(&self.region, self.geometry.misses_off())?;
        codec::write_word(
            &self.region,
            self.geometry.hits_off(),
            hits.saturating_add(local.hits as i64),
        )?;
        codec::write_word(
            &self.region,
            self.geometry.misses_off(),
            misses.saturating_add(local.misses as i64),
        )?;
        local.hits = 0;
        local.misses = 0;
        Ok(())
    }

    fn flush_local_stats(&self) -> Result<()> {
        let mut local = self.local.lock();
        self.fold_stats(&mut local)
    }
}

impl Drop for ShmCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush_local_stats() {
            log::warn!("stats lost at detach: {e}");
        }
    }
}

/// Write a fresh segment: zeroed meta, stats and buckets, every zone one
/// full free chunk, ring pointer at zone 0.
fn init_segment(region: &ShmRegion, geometry: &Geometry) -> Result<()> {
    codec::write_word(region, geometry.oldest_zone_off(), 0)?;
    codec::write_word(region, geometry.hits_off(), 0)?;
    codec::write_word(region, geometry.misses_off(), 0)?;
    for bucket in 0..BUCKET_COUNT {
        codec::write_word(region, geometry.bucket_slot_off(bucket), 0)?;
    }
    for z in 0..geometry.zone_count {
        zone::reset_zone(region, geometry, z)?;
    }
    log::debug!(
        "initialized segment: {} zones, {} buckets",
        geometry.zone_count,
        BUCKET_COUNT
    );
    Ok(())
}

/// Strict ASCII decimal parse; the increment value format.
fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::layout::MAX_KEY_LEN;
    use super::*;
    use crate::key::CacheKey;
    use test_log::test;

    fn attach(dir: &Path) -> ShmCache {
        ShmCache::attach(dir, "engine-test", MIN_SEGMENT_SIZE, None, 1).unwrap()
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s.as_bytes()).unwrap()
    }

    #[test]
    fn set_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());

        cache.set(&key("hello"), b"world", 0, SetMode::Upsert).unwrap();
        let (value, flags) = cache.get(&key("hello")).unwrap().unwrap();
        assert_eq!(value, b"world");
        assert_eq!(flags, 0);
        assert!(cache.exists(&key("hello")).unwrap());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.items, 1);
        assert_eq!(stats.value_bytes, 5);
        assert_eq!(stats.used_buckets, 1);
        assert_eq!(stats.get_hits, 1);
    }

    #[test]
    fn flags_survive_the_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());

        cache
            .set(&key("s"), b"blob", layout::FLAG_SERIALIZED, SetMode::Upsert)
            .unwrap();
        let (_, flags) = cache.get(&key("s")).unwrap().unwrap();
        assert_eq!(flags, layout::FLAG_SERIALIZED);
    }

    #[test]
    fn get_miss_counts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());

        assert!(cache.get(&key("nope")).unwrap().is_none());
        let stats = cache.stats().unwrap();
        assert_eq!(stats.get_misses, 1);
        assert_eq!(stats.get_hits, 0);
    }

    #[test]
    fn overwrite_reuses_the_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());
        let k = key("k");

        cache.set(&k, &[b'a'; 64], 0, SetMode::Upsert).unwrap();
        let padded = k.padded();
        let bucket = hashtable::bucket_index(k.as_bytes());
        let chunk = hashtable::lookup(&cache.region, &cache.geometry, bucket, &padded)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.val_alloc_size(&cache.region).unwrap(), MIN_VALUE_ALLOC);

        cache.set(&k, &[b'a'; 96], 0, SetMode::Upsert).unwrap();
        let again = hashtable::lookup(&cache.region, &cache.geometry, bucket, &padded)
            .unwrap()
            .unwrap();
        assert_eq!(again, chunk);
        assert_eq!(again.val_alloc_size(&cache.region).unwrap(), MIN_VALUE_ALLOC);
        assert_eq!(cache.get(&k).unwrap().unwrap().0.len(), 96);
    }

    #[test]
    fn overwrite_grow_reallocates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());
        let k = key("k");

        cache.set(&k, &[b'a'; 200], 0, SetMode::Upsert).unwrap();
        cache.set(&k, &vec![b'a'; 900_000], 0, SetMode::Upsert).unwrap();
        assert_eq!(cache.get(&k).unwrap().unwrap().0.len(), 900_000);
        assert_eq!(cache.stats().unwrap().items, 1);
    }

    #[test]
    fn add_and_replace_preconditions() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());

        assert!(matches!(
            cache.set(&key("r"), b"v", 0, SetMode::Replace),
            Err(Error::KeyNotFound)
        ));
        cache.set(&key("r"), b"v", 0, SetMode::Add).unwrap();
        assert!(matches!(
            cache.set(&key("r"), b"w", 0, SetMode::Add),
            Err(Error::KeyExists)
        ));
        cache.set(&key("r"), b"w", 0, SetMode::Replace).unwrap();
        assert_eq!(cache.get(&key("r")).unwrap().unwrap().0, b"w");
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());

        cache.set(&key("d"), b"v", 0, SetMode::Upsert).unwrap();
        cache.delete(&key("d")).unwrap();
        assert!(cache.get(&key("d")).unwrap().is_none());
        cache.delete(&key("d")).unwrap();
        assert_eq!(cache.stats().unwrap().items, 0);
    }

    #[test]
    fn oversize_set_removes_the_prior_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());
        let k = key("k");

        cache.set(&k, b"small", 0, SetMode::Upsert).unwrap();
        let huge = vec![0u8; MAX_CHUNK_PAYLOAD + 1];
        assert!(matches!(
            cache.set(&k, &huge, 0, SetMode::Upsert),
            Err(Error::Oversize(_))
        ));
        assert!(cache.get(&k).unwrap().is_none());
    }

    #[test]
    fn oversize_set_on_missing_key_leaves_segment_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());
        cache.set(&key("other"), b"v", 0, SetMode::Upsert).unwrap();

        let before = cache.region.slice(0, cache.region.len()).unwrap().to_vec();
        let huge = vec![0u8; MAX_CHUNK_PAYLOAD + 1];
        assert!(matches!(
            cache.set(&key("k"), &huge, 0, SetMode::Upsert),
            Err(Error::Oversize(_))
        ));
        let after = cache.region.slice(0, cache.region.len()).unwrap();
        assert_eq!(before.as_slice(), after);
    }

    #[test]
    fn empty_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());
        assert!(matches!(
            cache.set(&key("k"), b"", 0, SetMode::Upsert),
            Err(Error::EmptyValue)
        ));
    }

    #[test]
    fn increment_seeds_clamps_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());

        assert_eq!(cache.increment(&key("ctr"), 5, 10).unwrap(), 15);
        assert_eq!(cache.increment(&key("ctr"), -20, 0).unwrap(), 0);
        assert_eq!(cache.increment(&key("ctr"), 3, 0).unwrap(), 3);
        assert_eq!(cache.increment(&key("ctr2"), 0, 7).unwrap(), 7);
        assert_eq!(cache.get(&key("ctr")).unwrap().unwrap().0, b"3");
    }

    #[test]
    fn increment_rejects_non_numeric_values() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());

        cache.set(&key("s"), b"not a number", 0, SetMode::Upsert).unwrap();
        assert!(matches!(
            cache.increment(&key("s"), 1, 0),
            Err(Error::NonNumeric)
        ));
        assert_eq!(cache.get(&key("s")).unwrap().unwrap().0, b"not a number");
    }

    #[test]
    fn eviction_drops_the_oldest_zone_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());
        let zone_count = cache.geometry.zone_count;
        assert_eq!(zone_count, 15);

        // One 900 kB value per zone; each insert after the first evicts.
        let value = vec![b'v'; 900_000];
        for i in 0..zone_count {
            cache
                .set(&key(&format!("bulk-{i}")), &value, 0, SetMode::Upsert)
                .unwrap();
        }
        assert_eq!(cache.stats().unwrap().items, zone_count as u64);
        let oldest_before = cache.stats().unwrap().oldest_zone_index;

        cache
            .set(&key("bulk-last"), &value, 0, SetMode::Upsert)
            .unwrap();

        assert!(cache.get(&key("bulk-0")).unwrap().is_none());
        assert!(cache.get(&key("bulk-last")).unwrap().is_some());
        assert!(cache
            .get(&key(&format!("bulk-{}", zone_count - 1)))
            .unwrap()
            .is_some());
        let oldest_after = cache.stats().unwrap().oldest_zone_index;
        assert_eq!(oldest_after, (oldest_before + 1) % zone_count);
        assert_eq!(cache.stats().unwrap().items, zone_count as u64);
    }

    #[test]
    fn flush_clears_items_but_not_stats() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());

        for i in 0..10 {
            cache
                .set(&key(&format!("k{i}")), b"v", 0, SetMode::Upsert)
                .unwrap();
        }
        cache.get(&key("k0")).unwrap();
        cache.get(&key("missing")).unwrap();
        let before = cache.stats().unwrap();
        assert_eq!(before.items, 10);

        cache.flush().unwrap();
        let after = cache.stats().unwrap();
        assert_eq!(after.items, 0);
        assert_eq!(after.used_buckets, 0);
        assert_eq!(after.get_hits, before.get_hits);
        assert_eq!(after.get_misses, before.get_misses);
        assert_eq!(after.oldest_zone_index, cache.geometry.zone_count - 1);

        for i in 0..10 {
            assert!(cache.get(&key(&format!("k{i}"))).unwrap().is_none());
        }
    }

    #[test]
    fn two_handles_share_the_segment() {
        let dir = tempfile::tempdir().unwrap();
        let a = attach(dir.path());
        let b = attach(dir.path());

        a.set(&key("shared"), b"from-a", 0, SetMode::Upsert).unwrap();
        assert_eq!(b.get(&key("shared")).unwrap().unwrap().0, b"from-a");

        b.delete(&key("shared")).unwrap();
        assert!(a.get(&key("shared")).unwrap().is_none());
    }

    #[test]
    fn reattach_adopts_existing_size() {
        let dir = tempfile::tempdir().unwrap();
        let a = ShmCache::attach(dir.path(), "adopt", MIN_SEGMENT_SIZE, None, 1).unwrap();
        a.set(&key("k"), b"v", 0, SetMode::Upsert).unwrap();
        drop(a);

        // A bigger request attaches to the existing 16 MiB segment.
        let b = ShmCache::attach(dir.path(), "adopt", 2 * MIN_SEGMENT_SIZE, None, 1).unwrap();
        assert_eq!(b.geometry.segment_size, MIN_SEGMENT_SIZE);
        assert_eq!(b.get(&key("k")).unwrap().unwrap().0, b"v");
    }

    #[test]
    fn long_keys_truncate_to_the_stored_width() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());

        let long = "x".repeat(MAX_KEY_LEN + 50);
        let truncated = "x".repeat(MAX_KEY_LEN);
        cache
            .set(&CacheKey::new(long.as_bytes()).unwrap(), b"v", 0, SetMode::Upsert)
            .unwrap();
        assert_eq!(
            cache
                .get(&CacheKey::new(truncated.as_bytes()).unwrap())
                .unwrap()
                .unwrap()
                .0,
            b"v"
        );
    }

    #[test]
    fn destroy_removes_the_backing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = attach(dir.path());
        cache.set(&key("k"), b"v", 0, SetMode::Upsert).unwrap();
        cache.destroy().unwrap();
        assert!(!dir.path().join("engine-test.data").exists());
        assert!(!dir.path().join("engine-test.lock").exists());
    }
}
