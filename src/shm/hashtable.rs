/// Hash index over the bucket area: separate chaining through `hashNext`.
///
/// `bucketIndex(key) = CRC32(key) mod BUCKET_COUNT`. CRC32 (IEEE) is baked
/// into the on-segment layout; changing the hash mid-life would corrupt
/// every lookup. Chains terminate at offset 0 and new entries are appended
/// at the tail, so iteration order within a bucket is insertion order.
///
/// Callers hold the bucket's lock; nothing here takes locks.
use crate::error::{Error, Result};
use crate::shm::codec::{self, ChunkRef};
use crate::shm::layout::{Geometry, BUCKET_COUNT, MAX_KEY_LEN};
use crate::shm::region::ShmRegion;

/// Bucket index for a (already truncated) key.
pub fn bucket_index(key: &[u8]) -> usize {
    crc32fast::hash(key) as usize % BUCKET_COUNT
}

fn chain_overrun(bucket: usize) -> Error {
    log::warn!("bucket {bucket}: chain walk exceeded the segment's chunk bound");
    Error::Corrupt("bucket chain walk exceeded the segment")
}

/// Head chunk offset of bucket `b`, 0 when the bucket is empty.
pub fn bucket_head(region: &ShmRegion, geometry: &Geometry, bucket: usize) -> Result<i64> {
    codec::read_word(region, geometry.bucket_slot_off(bucket))
}

fn set_bucket_head(
    region: &ShmRegion,
    geometry: &Geometry,
    bucket: usize,
    offset: i64,
) -> Result<()> {
    codec::write_word(region, geometry.bucket_slot_off(bucket), offset)
}

/// Walk bucket `b` for the chunk storing `padded` as its key.
pub fn lookup(
    region: &ShmRegion,
    geometry: &Geometry,
    bucket: usize,
    padded: &[u8; MAX_KEY_LEN],
) -> Result<Option<ChunkRef>> {
    let mut offset = bucket_head(region, geometry, bucket)?;
    let mut steps = 0usize;

    while offset != 0 {
        let chunk = ChunkRef::new(chunk_offset(geometry, offset)?);
        if chunk.key_eq(region, padded)? {
            return Ok(Some(chunk));
        }
        offset = chunk.hash_next(region)?;
        steps += 1;
        if steps > geometry.max_chunks() {
            return Err(chain_overrun(bucket));
        }
    }
    Ok(None)
}

/// Append `chunk` at the tail of bucket `b`'s chain.
pub fn link_tail(
    region: &ShmRegion,
    geometry: &Geometry,
    bucket: usize,
    chunk: ChunkRef,
) -> Result<()> {
    chunk.set_hash_next(region, 0)?;

    let head = bucket_head(region, geometry, bucket)?;
    if head == 0 {
        return set_bucket_head(region, geometry, bucket, chunk.offset as i64);
    }

    let mut tail = ChunkRef::new(chunk_offset(geometry, head)?);
    let mut steps = 0usize;
    loop {
        let next = tail.hash_next(region)?;
        if next == 0 {
            break;
        }
        tail = ChunkRef::new(chunk_offset(geometry, next)?);
        steps += 1;
        if steps > geometry.max_chunks() {
            return Err(chain_overrun(bucket));
        }
    }
    tail.set_hash_next(region, chunk.offset as i64)
}

/// Splice `chunk` out of bucket `b`'s chain and clear its link.
///
/// Fails with `Corrupt` when the chunk is not reachable from the bucket
/// head; eviction treats that as a degraded-but-survivable state.
pub fn unlink(
    region: &ShmRegion,
    geometry: &Geometry,
    bucket: usize,
    chunk: ChunkRef,
) -> Result<()> {
    let target = chunk.offset as i64;
    let head = bucket_head(region, geometry, bucket)?;

    if head == target {
        set_bucket_head(region, geometry, bucket, chunk.hash_next(region)?)?;
        return chunk.set_hash_next(region, 0);
    }

    let mut prev_off = head;
    let mut steps = 0usize;
    while prev_off != 0 {
        let prev = ChunkRef::new(chunk_offset(geometry, prev_off)?);
        let next = prev.hash_next(region)?;
        if next == target {
            prev.set_hash_next(region, chunk.hash_next(region)?)?;
            return chunk.set_hash_next(region, 0);
        }
        prev_off = next;
        steps += 1;
        if steps > geometry.max_chunks() {
            return Err(chain_overrun(bucket));
        }
    }
    Err(Error::Corrupt("chunk not reachable from its bucket"))
}

/// Validate a chain link before following it.
fn chunk_offset(geometry: &Geometry, offset: i64) -> Result<usize> {
    let offset = codec::word_to_usize(offset, "negative chunk offset")?;
    geometry.check_chunk_offset(offset)?;
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::codec::pad_key;
    use crate::shm::layout::{CHUNK_META_SIZE, MIN_SEGMENT_SIZE, MIN_VALUE_ALLOC, WORD};

    fn setup() -> (ShmRegion, Geometry) {
        let geometry = Geometry::for_segment_size(MIN_SEGMENT_SIZE).unwrap();
        let region = ShmRegion::anonymous(MIN_SEGMENT_SIZE).unwrap();
        (region, geometry)
    }

    /// Hand-place a live chunk inside zone 0 at stack position `slot`.
    fn place_chunk(region: &ShmRegion, geometry: &Geometry, slot: usize, key: &[u8]) -> ChunkRef {
        let step = CHUNK_META_SIZE + MIN_VALUE_ALLOC;
        let chunk = ChunkRef::new(geometry.zone_start(0) + WORD + slot * step);
        chunk.set_key(region, &pad_key(key)).unwrap();
        chunk.set_hash_next(region, 0).unwrap();
        chunk.set_val_alloc_size(region, MIN_VALUE_ALLOC).unwrap();
        chunk.write_value(region, b"v").unwrap();
        chunk.set_flags(region, 0).unwrap();
        chunk
    }

    /// Two distinct short keys that land in the same bucket.
    fn colliding_keys() -> (Vec<u8>, Vec<u8>) {
        let first = b"collide-0".to_vec();
        let target = bucket_index(&first);
        for i in 1..100_000u32 {
            let candidate = format!("collide-{i}").into_bytes();
            if bucket_index(&candidate) == target {
                return (first, candidate);
            }
        }
        unreachable!("512 buckets must collide within 100k keys");
    }

    #[test]
    fn bucket_index_is_stable_crc32() {
        // CRC32("hello") = 0x3610a686
        assert_eq!(bucket_index(b"hello"), 0x3610_a686 % BUCKET_COUNT);
    }

    #[test]
    fn link_and_lookup() {
        let (region, geometry) = setup();
        let chunk = place_chunk(&region, &geometry, 0, b"hello");
        link_tail(&region, &geometry, 9, chunk).unwrap();

        let found = lookup(&region, &geometry, 9, &pad_key(b"hello")).unwrap();
        assert_eq!(found, Some(chunk));
        assert_eq!(lookup(&region, &geometry, 9, &pad_key(b"other")).unwrap(), None);
        // Different bucket: not reachable.
        assert_eq!(lookup(&region, &geometry, 10, &pad_key(b"hello")).unwrap(), None);
    }

    #[test]
    fn chain_keeps_insertion_order() {
        let (region, geometry) = setup();
        let a = place_chunk(&region, &geometry, 0, b"a");
        let b = place_chunk(&region, &geometry, 1, b"b");
        let c = place_chunk(&region, &geometry, 2, b"c");
        for chunk in [a, b, c] {
            link_tail(&region, &geometry, 3, chunk).unwrap();
        }

        assert_eq!(bucket_head(&region, &geometry, 3).unwrap(), a.offset as i64);
        assert_eq!(a.hash_next(&region).unwrap(), b.offset as i64);
        assert_eq!(b.hash_next(&region).unwrap(), c.offset as i64);
        assert_eq!(c.hash_next(&region).unwrap(), 0);
    }

    #[test]
    fn unlink_head_middle_tail() {
        let (region, geometry) = setup();
        let a = place_chunk(&region, &geometry, 0, b"a");
        let b = place_chunk(&region, &geometry, 1, b"b");
        let c = place_chunk(&region, &geometry, 2, b"c");
        for chunk in [a, b, c] {
            link_tail(&region, &geometry, 3, chunk).unwrap();
        }

        unlink(&region, &geometry, 3, b).unwrap();
        assert_eq!(a.hash_next(&region).unwrap(), c.offset as i64);
        assert_eq!(b.hash_next(&region).unwrap(), 0);

        unlink(&region, &geometry, 3, a).unwrap();
        assert_eq!(bucket_head(&region, &geometry, 3).unwrap(), c.offset as i64);

        unlink(&region, &geometry, 3, c).unwrap();
        assert_eq!(bucket_head(&region, &geometry, 3).unwrap(), 0);
    }

    #[test]
    fn unlink_of_unreachable_chunk_is_corrupt() {
        let (region, geometry) = setup();
        let a = place_chunk(&region, &geometry, 0, b"a");
        assert!(matches!(
            unlink(&region, &geometry, 3, a),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn colliding_keys_share_a_chain() {
        let (region, geometry) = setup();
        let (k1, k2) = colliding_keys();
        let bucket = bucket_index(&k1);
        assert_eq!(bucket, bucket_index(&k2));

        let c1 = place_chunk(&region, &geometry, 0, &k1);
        let c2 = place_chunk(&region, &geometry, 1, &k2);
        link_tail(&region, &geometry, bucket, c1).unwrap();
        link_tail(&region, &geometry, bucket, c2).unwrap();

        // Removing the first leaves the second reachable.
        unlink(&region, &geometry, bucket, c1).unwrap();
        let found = lookup(&region, &geometry, bucket, &pad_key(&k2)).unwrap();
        assert_eq!(found, Some(c2));
    }

    #[test]
    fn corrupt_link_is_detected() {
        let (region, geometry) = setup();
        let a = place_chunk(&region, &geometry, 0, b"a");
        link_tail(&region, &geometry, 3, a).unwrap();
        // Point the link at the bucket area: not a chunk offset.
        a.set_hash_next(&region, geometry.buckets_off as i64).unwrap();
        assert!(matches!(
            lookup(&region, &geometry, 3, &pad_key(b"zzz")),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn self_link_terminates_as_corrupt() {
        let (region, geometry) = setup();
        let a = place_chunk(&region, &geometry, 0, b"a");
        link_tail(&region, &geometry, 3, a).unwrap();
        a.set_hash_next(&region, a.offset as i64).unwrap();
        assert!(matches!(
            lookup(&region, &geometry, 3, &pad_key(b"zzz")),
            Err(Error::Corrupt(_))
        ));
    }
}
