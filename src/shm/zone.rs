/// Zone allocator: a ring of fixed-size zones, each a packed stack of
/// chunks growing from the zone header.
///
/// Space is carved only at the newest zone's top-of-stack and reclaimed in
/// whole-zone units (eviction) or by freeing individual chunks in place.
/// The byte range beyond `usedSpace` is always covered by a single free
/// tail chunk, which is the carving site for the next allocation.
///
/// Callers hold the zone's lock; nothing here takes locks.
use crate::error::{Error, Result};
use crate::shm::codec::{pad_key, ChunkRef, ZoneRef};
use crate::shm::layout::{
    Geometry, CHUNK_META_SIZE, MAX_KEY_LEN, MIN_VALUE_ALLOC, WORD, ZONE_SIZE,
};
use crate::shm::region::ShmRegion;

/// The zone that allocations carve into: the one inserted most recently.
pub fn newest_zone_index(oldest: usize, zone_count: usize) -> usize {
    if oldest == 0 {
        zone_count - 1
    } else {
        oldest - 1
    }
}

/// Bytes still carvable from the zone (chunk header included).
pub fn free_space(region: &ShmRegion, zone: ZoneRef) -> Result<usize> {
    Ok(ZONE_SIZE - WORD - zone.used_space(region)?)
}

/// Reset a zone to one full-zone free chunk with `usedSpace = 0`.
///
/// Used at segment initialization, after eviction, and by flush.
pub fn reset_zone(region: &ShmRegion, geometry: &Geometry, zone_index: usize) -> Result<()> {
    let zone = ZoneRef::at(geometry, zone_index);
    zone.set_used_space(region, 0)?;
    write_free_tail(region, zone, 0)
}

/// Write the free chunk covering everything beyond `used`.
fn write_free_tail(region: &ShmRegion, zone: ZoneRef, used: usize) -> Result<()> {
    let remaining = ZONE_SIZE - WORD - used;
    debug_assert!(remaining >= CHUNK_META_SIZE + MIN_VALUE_ALLOC);
    let tail = ChunkRef::new(zone.stack_start() + used);
    tail.set_key(region, &pad_key(b""))?;
    tail.set_hash_next(region, 0)?;
    tail.set_val_alloc_size(region, remaining - CHUNK_META_SIZE)?;
    tail.set_val_size(region, 0)?;
    tail.set_flags(region, 0)
}

/// Carve a new chunk for `value` at the zone's top-of-stack.
///
/// The caller has already verified `free_space >= CHUNK_META_SIZE +
/// max(len, MIN_VALUE_ALLOC)`; the chunk is written and accounted here but
/// not yet linked into its bucket. The trailing free space is split off as
/// a new free tail when it can still hold a minimal chunk, and absorbed
/// into the allocation otherwise.
pub fn carve(
    region: &ShmRegion,
    zone: ZoneRef,
    padded_key: &[u8; MAX_KEY_LEN],
    value: &[u8],
    flags: u8,
) -> Result<ChunkRef> {
    let used = zone.used_space(region)?;
    let avail = ZONE_SIZE - WORD - used;
    let alloc = value.len().max(MIN_VALUE_ALLOC);
    if avail < CHUNK_META_SIZE + alloc {
        return Err(Error::Corrupt("carve without room in the zone"));
    }

    let avail_payload = avail - CHUNK_META_SIZE;
    let leftover = avail_payload - alloc;
    let alloc = if leftover >= CHUNK_META_SIZE + MIN_VALUE_ALLOC {
        alloc
    } else {
        // Too small to stand alone as a free chunk: absorb it.
        avail_payload
    };

    let chunk = ChunkRef::new(zone.stack_start() + used);
    chunk.set_key(region, padded_key)?;
    chunk.set_hash_next(region, 0)?;
    chunk.set_val_alloc_size(region, alloc)?;
    chunk.set_flags(region, flags)?;
    chunk.write_value(region, value)?;

    let new_used = used + CHUNK_META_SIZE + alloc;
    zone.set_used_space(region, new_used)?;
    if alloc != avail_payload {
        write_free_tail(region, zone, new_used)?;
    }
    Ok(chunk)
}

/// Kill an (already unlinked) chunk and recover its space.
///
/// The chunk is zeroed to a free chunk, merged with free neighbours to its
/// right, and, when the merged run ends at the zone's top-of-stack,
/// `usedSpace` shrinks by the run and the free tail is rebuilt over the
/// remainder of the zone.
pub fn free_chunk(region: &ShmRegion, zone: ZoneRef, chunk: ChunkRef) -> Result<()> {
    chunk.set_val_size(region, 0)?;
    chunk.set_hash_next(region, 0)?;
    chunk.set_flags(region, 0)?;

    let stack_end = zone.stack_end(region)?;
    merge_right(region, zone, chunk, stack_end)?;

    let total = chunk.total_size(region)?;
    if chunk.offset + total == stack_end {
        let used = zone.used_space(region)? - total;
        zone.set_used_space(region, used)?;
        write_free_tail(region, zone, used)?;
    }
    Ok(())
}

/// Absorb free chunks to the right of `chunk` into its allocation.
///
/// Stops at the first live chunk or at the zone's `usedSpace` boundary;
/// never crosses into another zone.
fn merge_right(
    region: &ShmRegion,
    zone: ZoneRef,
    chunk: ChunkRef,
    stack_end: usize,
) -> Result<()> {
    let mut alloc = chunk.val_alloc_size(region)?;
    let mut next_off = chunk.end_header_offset() + alloc;
    let mut steps = 0usize;

    while next_off < stack_end {
        let next = ChunkRef::new(next_off);
        if next.val_size(region)? != 0 {
            break;
        }
        let next_total = next.total_size(region)?;
        if next_total < CHUNK_META_SIZE || next_off + next_total > stack_end {
            return Err(Error::Corrupt("free chunk overruns its zone stack"));
        }
        alloc += next_total;
        next_off += next_total;
        steps += 1;
        if steps > ZONE_SIZE / CHUNK_META_SIZE {
            return Err(Error::Corrupt("free-chunk merge walk did not terminate"));
        }
    }
    chunk.set_val_alloc_size(region, alloc)
}

/// Left-to-right iterator over the chunks inside a zone's used stack.
pub struct ChunkWalker {
    cursor: usize,
    end: usize,
    steps: usize,
}

impl ChunkWalker {
    pub fn new(region: &ShmRegion, zone: ZoneRef) -> Result<Self> {
        Ok(ChunkWalker {
            cursor: zone.stack_start(),
            end: zone.stack_end(region)?,
            steps: 0,
        })
    }

    /// The next chunk, or `None` once the walk lands exactly on the
    /// `usedSpace` boundary. A chunk overrunning the boundary is corrupt.
    pub fn next(&mut self, region: &ShmRegion) -> Result<Option<ChunkRef>> {
        if self.cursor >= self.end {
            return Ok(None);
        }
        let chunk = ChunkRef::new(self.cursor);
        let total = chunk.total_size(region)?;
        if self.cursor + total > self.end {
            log::warn!("chunk at {} overruns its zone's usedSpace", self.cursor);
            return Err(Error::Corrupt("zone walk overran usedSpace"));
        }
        self.cursor += total;
        self.steps += 1;
        if self.steps > ZONE_SIZE / CHUNK_META_SIZE {
            return Err(Error::Corrupt("zone walk did not terminate"));
        }
        Ok(Some(chunk))
    }
}
