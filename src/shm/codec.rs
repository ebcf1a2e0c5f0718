/// Typed reads and writes against the raw segment bytes.
///
/// Every segment word is a signed 64-bit little-endian integer; keys are
/// space-padded to `MAX_KEY_LEN`. Accessors are plain `(offset)` values
/// created on the stack per operation; field offsets are compile-time
/// constants. No locking happens here.
use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::shm::layout::{Geometry, CHUNK_META_SIZE, MAX_KEY_LEN, WORD, ZONE_SIZE};
use crate::shm::region::ShmRegion;

/// Read one segment word.
pub fn read_word(region: &ShmRegion, offset: usize) -> Result<i64> {
    Ok(LittleEndian::read_i64(region.slice(offset, WORD)?))
}

/// Write one segment word.
pub fn write_word(region: &ShmRegion, offset: usize, value: i64) -> Result<()> {
    let mut buf = [0u8; WORD];
    LittleEndian::write_i64(&mut buf, value);
    region.write(offset, &buf)
}

/// Convert a word read from the segment into a usize, rejecting negatives.
pub fn word_to_usize(value: i64, what: &'static str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::Corrupt(what))
}

/// Space-pad a key to the fixed on-segment width.
///
/// The caller guarantees `key.len() <= MAX_KEY_LEN` (the façade truncates).
pub fn pad_key(key: &[u8]) -> [u8; MAX_KEY_LEN] {
    debug_assert!(key.len() <= MAX_KEY_LEN);
    let mut padded = [b' '; MAX_KEY_LEN];
    padded[..key.len()].copy_from_slice(key);
    padded
}

/// Strip the space padding from a stored key field.
pub fn trim_key(padded: &[u8]) -> &[u8] {
    let mut end = padded.len();
    while end > 0 && padded[end - 1] == b' ' {
        end -= 1;
    }
    &padded[..end]
}

// Field offsets inside a chunk header.
const KEY_OFF: usize = 0;
const HASH_NEXT_OFF: usize = MAX_KEY_LEN;
const VAL_ALLOC_OFF: usize = MAX_KEY_LEN + WORD;
const VAL_SIZE_OFF: usize = MAX_KEY_LEN + 2 * WORD;
const FLAGS_OFF: usize = MAX_KEY_LEN + 3 * WORD;

/// Accessor for one chunk, bound to its absolute segment offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub offset: usize,
}

impl ChunkRef {
    pub fn new(offset: usize) -> Self {
        ChunkRef { offset }
    }

    /// First byte after the header; the payload starts here.
    pub fn end_header_offset(&self) -> usize {
        self.offset + CHUNK_META_SIZE
    }

    pub fn key_padded<'r>(&self, region: &'r ShmRegion) -> Result<&'r [u8]> {
        region.slice(self.offset + KEY_OFF, MAX_KEY_LEN)
    }

    /// The stored key with its space padding removed.
    pub fn key_trimmed<'r>(&self, region: &'r ShmRegion) -> Result<&'r [u8]> {
        Ok(trim_key(self.key_padded(region)?))
    }

    /// Byte-for-byte comparison against an already padded query key.
    pub fn key_eq(&self, region: &ShmRegion, padded: &[u8; MAX_KEY_LEN]) -> Result<bool> {
        Ok(self.key_padded(region)? == padded)
    }

    pub fn set_key(&self, region: &ShmRegion, padded: &[u8; MAX_KEY_LEN]) -> Result<()> {
        region.write(self.offset + KEY_OFF, padded)
    }

    pub fn hash_next(&self, region: &ShmRegion) -> Result<i64> {
        read_word(region, self.offset + HASH_NEXT_OFF)
    }

    pub fn set_hash_next(&self, region: &ShmRegion, next: i64) -> Result<()> {
        write_word(region, self.offset + HASH_NEXT_OFF, next)
    }

    pub fn val_alloc_size(&self, region: &ShmRegion) -> Result<usize> {
        let v = read_word(region, self.offset + VAL_ALLOC_OFF)?;
        word_to_usize(v, "negative valAllocSize")
    }

    pub fn set_val_alloc_size(&self, region: &ShmRegion, size: usize) -> Result<()> {
        write_word(region, self.offset + VAL_ALLOC_OFF, size as i64)
    }

    pub fn val_size(&self, region: &ShmRegion) -> Result<usize> {
        let v = read_word(region, self.offset + VAL_SIZE_OFF)?;
        word_to_usize(v, "negative valSize")
    }

    pub fn set_val_size(&self, region: &ShmRegion, size: usize) -> Result<()> {
        write_word(region, self.offset + VAL_SIZE_OFF, size as i64)
    }

    pub fn flags(&self, region: &ShmRegion) -> Result<u8> {
        Ok(region.slice(self.offset + FLAGS_OFF, 1)?[0])
    }

    pub fn set_flags(&self, region: &ShmRegion, flags: u8) -> Result<()> {
        region.write(self.offset + FLAGS_OFF, &[flags])
    }

    /// Header plus allocated payload.
    pub fn total_size(&self, region: &ShmRegion) -> Result<usize> {
        Ok(CHUNK_META_SIZE + self.val_alloc_size(region)?)
    }

    /// Copy out the first `valSize` payload bytes.
    pub fn read_value(&self, region: &ShmRegion) -> Result<Vec<u8>> {
        let len = self.val_size(region)?;
        if len > self.val_alloc_size(region)? {
            return Err(Error::Corrupt("valSize exceeds valAllocSize"));
        }
        Ok(region.slice(self.end_header_offset(), len)?.to_vec())
    }

    /// Overwrite the payload and `valSize`. The value must fit the
    /// allocation; overrunning it would clobber the next chunk.
    pub fn write_value(&self, region: &ShmRegion, value: &[u8]) -> Result<()> {
        if value.len() > self.val_alloc_size(region)? {
            return Err(Error::Corrupt("value write exceeds the chunk allocation"));
        }
        region.write(self.end_header_offset(), value)?;
        self.set_val_size(region, value.len())
    }
}

/// Accessor for one zone, bound to its index and start offset.
#[derive(Debug, Clone, Copy)]
pub struct ZoneRef {
    pub index: usize,
    pub start: usize,
}

impl ZoneRef {
    pub fn at(geometry: &Geometry, index: usize) -> Self {
        ZoneRef {
            index,
            start: geometry.zone_start(index),
        }
    }

    /// Offset of the first chunk (right after the `usedSpace` word).
    pub fn stack_start(&self) -> usize {
        self.start + WORD
    }

    /// End offset (exclusive) of the zone.
    pub fn end(&self) -> usize {
        self.start + ZONE_SIZE
    }

    pub fn used_space(&self, region: &ShmRegion) -> Result<usize> {
        let used = word_to_usize(read_word(region, self.start)?, "negative usedSpace")?;
        if used > ZONE_SIZE - WORD {
            return Err(Error::Corrupt("usedSpace exceeds the zone"));
        }
        Ok(used)
    }

    pub fn set_used_space(&self, region: &ShmRegion, used: usize) -> Result<()> {
        debug_assert!(used <= ZONE_SIZE - WORD);
        write_word(region, self.start, used as i64)
    }

    /// Offset one past the last allocated chunk byte.
    pub fn stack_end(&self, region: &ShmRegion) -> Result<usize> {
        Ok(self.stack_start() + self.used_space(region)?)
    }

    /// Whether the byte at `offset` falls inside this zone's chunk area.
    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.stack_start() && offset < self.end()
    }
}
