/// Byte layout of the shared segment.
///
/// The segment is four contiguous fixed-offset areas separated by a small
/// guard gap, all offsets and counts stored as signed 64-bit little-endian
/// words so the layout is identical across compilations and processes:
///
/// ```text
/// offset 0     meta area    (1024 bytes, word 0 = oldestZoneIndex)
/// offset 2048  stats area   (1024 bytes, words 0..2 = getHits, getMisses)
/// offset 4096  bucket area  (BUCKET_COUNT words, absolute chunk offsets)
/// offset 9216  zones area   (ZONE_COUNT zones of ZONE_SIZE bytes)
/// ```
///
/// Within a zone: a `usedSpace` word, then a packed stack of chunks. Within
/// a chunk: space-padded key, hashNext word, valAllocSize word, valSize
/// word, one flag byte, then the payload.
use crate::error::{Error, Result};

/// Size of a segment word. All offsets and counts are i64 little-endian.
pub const WORD: usize = 8;

/// Fixed width of the space-padded key field.
pub const MAX_KEY_LEN: usize = 200;

/// Number of hash buckets.
pub const BUCKET_COUNT: usize = 512;

/// Size of one zone, the unit of eviction.
pub const ZONE_SIZE: usize = 1024 * 1024;

/// Smallest payload allocation a chunk is carved with.
pub const MIN_VALUE_ALLOC: usize = 128;

/// Default total segment size.
pub const DEFAULT_SEGMENT_SIZE: usize = 128 * 1024 * 1024;

/// Smallest accepted segment size.
pub const MIN_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Guard gap between areas.
pub const SAFE_GAP: usize = 1024;

/// Reserved byte size of the meta area (only word 0 is used).
pub const META_AREA_SIZE: usize = 1024;

/// Reserved byte size of the stats area (only words 0..2 are used).
pub const STATS_AREA_SIZE: usize = 1024;

/// Byte size of a chunk header: key + hashNext + valAllocSize + valSize + flags.
pub const CHUNK_META_SIZE: usize = MAX_KEY_LEN + 3 * WORD + 1;

/// Largest value that fits a single chunk (a zone minus its header and one
/// chunk header).
pub const MAX_CHUNK_PAYLOAD: usize = ZONE_SIZE - WORD - CHUNK_META_SIZE;

/// Flag bit 0: the stored value was serialized by the caller. Stored and
/// returned verbatim, never interpreted by the engine.
pub const FLAG_SERIALIZED: u8 = 0b0000_0001;

/// Resolved offsets for one segment size.
///
/// Everything here is derived from the constants above plus the total size;
/// two processes mapping the same segment always agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub segment_size: usize,
    pub zone_count: usize,
    pub stats_off: usize,
    pub buckets_off: usize,
    pub zones_off: usize,
}

impl Geometry {
    /// Compute the geometry for a total segment size.
    ///
    /// Fails if the size leaves no room for at least one zone.
    pub fn for_segment_size(segment_size: usize) -> Result<Self> {
        let stats_off = META_AREA_SIZE + SAFE_GAP;
        let buckets_off = stats_off + STATS_AREA_SIZE + SAFE_GAP;
        let zones_off = buckets_off + BUCKET_COUNT * WORD + SAFE_GAP;

        if segment_size < zones_off + ZONE_SIZE {
            return Err(Error::Corrupt("segment too small for one zone"));
        }
        let zone_count = (segment_size - zones_off) / ZONE_SIZE;

        Ok(Geometry {
            segment_size,
            zone_count,
            stats_off,
            buckets_off,
            zones_off,
        })
    }

    /// Absolute offset of the `oldestZoneIndex` word.
    pub fn oldest_zone_off(&self) -> usize {
        0
    }

    /// Absolute offset of the `getHits` word.
    pub fn hits_off(&self) -> usize {
        self.stats_off
    }

    /// Absolute offset of the `getMisses` word.
    pub fn misses_off(&self) -> usize {
        self.stats_off + WORD
    }

    /// Absolute offset of bucket slot `b`.
    pub fn bucket_slot_off(&self, bucket: usize) -> usize {
        debug_assert!(bucket < BUCKET_COUNT);
        self.buckets_off + bucket * WORD
    }

    /// Absolute offset of zone `z` (its `usedSpace` word).
    pub fn zone_start(&self, zone: usize) -> usize {
        debug_assert!(zone < self.zone_count);
        self.zones_off + zone * ZONE_SIZE
    }

    /// End offset (exclusive) of the zones area.
    pub fn zones_end(&self) -> usize {
        self.zones_off + self.zone_count * ZONE_SIZE
    }

    /// Zone index containing the byte at `offset`.
    pub fn zone_of_offset(&self, offset: usize) -> Result<usize> {
        if offset < self.zones_off || offset >= self.zones_end() {
            return Err(Error::Corrupt("offset outside the zones area"));
        }
        Ok((offset - self.zones_off) / ZONE_SIZE)
    }

    /// Validate that `offset` can be the start of a chunk.
    pub fn check_chunk_offset(&self, offset: usize) -> Result<()> {
        let zone = self.zone_of_offset(offset)?;
        if offset < self.zone_start(zone) + WORD
            || offset + CHUNK_META_SIZE > self.zone_start(zone) + ZONE_SIZE
        {
            return Err(Error::Corrupt("chunk offset does not fit its zone"));
        }
        Ok(())
    }

    /// Upper bound on the number of chunks the segment can hold; used to cap
    /// chain and zone walks so a corrupt link cannot loop forever.
    pub fn max_chunks(&self) -> usize {
        let per_zone = (ZONE_SIZE - WORD) / (CHUNK_META_SIZE + MIN_VALUE_ALLOC) + 1;
        self.zone_count * per_zone
    }
}
