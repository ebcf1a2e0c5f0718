/// Named cross-process reader/writer locks.
///
/// Every lock is a POSIX `pthread_rwlock_t` initialized with
/// `PTHREAD_PROCESS_SHARED`, living at a fixed slot inside one mapped lock
/// file so unrelated processes agree on lock identity:
///
/// ```text
/// slot 0                      SEGMENT   (lifecycle; shared for ordinary ops)
/// slot 1                      STATS     (the two stats words)
/// slot 2                      RING      (oldestZoneIndex)
/// slots 3 .. 3+512            BUCKET[b] (one per hash bucket)
/// slots 3+512 ..              ZONE[z]   (one per zone)
/// ```
///
/// Acquisition returns a scoped guard; release happens in `Drop` on every
/// exit path. Exclusive acquisition also comes in a non-blocking `try`
/// flavor, used by eviction when it must touch foreign buckets out of the
/// canonical lock order.
use std::fs::{self, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::shm::layout::BUCKET_COUNT;

/// Bytes reserved per lock slot.
/// pthread_rwlock_t is 56 bytes on x86_64 Linux, 200 bytes on macOS arm64.
/// We over-allocate to be safe.
pub const LOCK_SLOT_SIZE: usize = 256;

const SEGMENT_SLOT: usize = 0;
const STATS_SLOT: usize = 1;
const RING_SLOT: usize = 2;
const FIXED_SLOTS: usize = 3;

/// Total byte size of the lock file for a segment with `zone_count` zones.
pub fn lock_file_size(zone_count: usize) -> usize {
    (FIXED_SLOTS + BUCKET_COUNT + zone_count) * LOCK_SLOT_SIZE
}

/// The full set of segment locks, backed by one mapped file.
pub struct LockSet {
    // Keeps the mapping alive; locks are addressed through `ptr`.
    _mmap: MmapMut,
    ptr: *mut u8,
    path: PathBuf,
    zone_count: usize,
}

// The pthread locks themselves are the synchronization primitive.
unsafe impl Send for LockSet {}
unsafe impl Sync for LockSet {}

impl LockSet {
    /// Create (or recreate) the lock file and initialize every lock.
    ///
    /// Must run under the attach-time advisory file lock so a concurrent
    /// opener never sees half-initialized pthread state.
    pub fn create(path: &Path, zone_count: usize) -> Result<Self> {
        let size = lock_file_size(zone_count);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;

        // Safety: we just created and sized the file.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();

        let set = LockSet {
            _mmap: mmap,
            ptr,
            path: path.to_path_buf(),
            zone_count,
        };
        for slot in 0..FIXED_SLOTS + BUCKET_COUNT + zone_count {
            // Safety: each slot is zeroed, in bounds, and owned by us here.
            unsafe { init_rwlock(set.slot_ptr(slot))? };
        }
        log::debug!("initialized {} locks in {path:?}", FIXED_SLOTS + BUCKET_COUNT + zone_count);
        Ok(set)
    }

    /// Map an existing lock file, validating its size against the geometry.
    pub fn open(path: &Path, zone_count: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let expected = lock_file_size(zone_count) as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("lock file {path:?} is {actual} bytes, expected {expected}"),
            )));
        }

        // Safety: the locks were initialized by the creating process.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        Ok(LockSet {
            _mmap: mmap,
            ptr,
            path: path.to_path_buf(),
            zone_count,
        })
    }

    fn slot_ptr(&self, slot: usize) -> *mut libc::pthread_rwlock_t {
        debug_assert!(slot < FIXED_SLOTS + BUCKET_COUNT + self.zone_count);
        // Safety: slot index is validated by the callers below.
        unsafe { self.ptr.add(slot * LOCK_SLOT_SIZE) as *mut libc::pthread_rwlock_t }
    }

    fn lock_at(&self, slot: usize) -> ShmRwLock<'_> {
        ShmRwLock {
            ptr: self.slot_ptr(slot),
            _owner: PhantomData,
        }
    }

    /// Segment lifecycle lock; shared for ordinary ops, exclusive for flush
    /// and destroy.
    pub fn segment(&self) -> ShmRwLock<'_> {
        self.lock_at(SEGMENT_SLOT)
    }

    /// Protects the two stats words.
    pub fn stats(&self) -> ShmRwLock<'_> {
        self.lock_at(STATS_SLOT)
    }

    /// Protects `oldestZoneIndex`.
    pub fn ring(&self) -> ShmRwLock<'_> {
        self.lock_at(RING_SLOT)
    }

    /// Protects bucket `b`'s head and every chunk linked from it.
    pub fn bucket(&self, bucket: usize) -> ShmRwLock<'_> {
        assert!(bucket < BUCKET_COUNT);
        self.lock_at(FIXED_SLOTS + bucket)
    }

    /// Protects all bytes of zone `z`.
    pub fn zone(&self, zone: usize) -> ShmRwLock<'_> {
        assert!(zone < self.zone_count);
        self.lock_at(FIXED_SLOTS + BUCKET_COUNT + zone)
    }

    /// Remove the backing file.
    pub fn unlink(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

/// Initialize a process-shared rwlock in place.
///
/// # Safety
/// `ptr` must point at `LOCK_SLOT_SIZE` zeroed bytes of shared memory not
/// yet used as a lock by any process.
unsafe fn init_rwlock(ptr: *mut libc::pthread_rwlock_t) -> Result<()> {
    let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
    let rc = libc::pthread_rwlockattr_init(&mut attr);
    if rc != 0 {
        return Err(Error::Io(io::Error::from_raw_os_error(rc)));
    }
    let rc = libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if rc != 0 {
        libc::pthread_rwlockattr_destroy(&mut attr);
        return Err(Error::Io(io::Error::from_raw_os_error(rc)));
    }
    let rc = libc::pthread_rwlock_init(ptr, &attr);
    libc::pthread_rwlockattr_destroy(&mut attr);
    if rc != 0 {
        return Err(Error::Io(io::Error::from_raw_os_error(rc)));
    }
    Ok(())
}

/// A handle to one named lock. Cheap to create, lives as long as its
/// `LockSet`.
#[derive(Clone, Copy)]
#[derive(Debug)]
pub struct ShmRwLock<'a> {
    ptr: *mut libc::pthread_rwlock_t,
    _owner: PhantomData<&'a LockSet>,
}

impl<'a> ShmRwLock<'a> {
    /// Acquire in shared (reader) mode.
    pub fn shared(self, timeout: Option<Duration>) -> Result<SharedGuard<'a>> {
        acquire(
            timeout,
            || unsafe { libc::pthread_rwlock_rdlock(self.ptr) },
            || unsafe { libc::pthread_rwlock_tryrdlock(self.ptr) },
        )?;
        Ok(SharedGuard { lock: self })
    }

    /// Acquire in exclusive (writer) mode.
    pub fn exclusive(self, timeout: Option<Duration>) -> Result<ExclusiveGuard<'a>> {
        acquire(
            timeout,
            || unsafe { libc::pthread_rwlock_wrlock(self.ptr) },
            || unsafe { libc::pthread_rwlock_trywrlock(self.ptr) },
        )?;
        Ok(ExclusiveGuard { lock: self })
    }

    /// Non-blocking exclusive acquisition.
    pub fn try_exclusive(self) -> Option<ExclusiveGuard<'a>> {
        let rc = unsafe { libc::pthread_rwlock_trywrlock(self.ptr) };
        if rc == 0 {
            Some(ExclusiveGuard { lock: self })
        } else {
            None
        }
    }

    fn unlock(self) {
        let rc = unsafe { libc::pthread_rwlock_unlock(self.ptr) };
        debug_assert_eq!(rc, 0, "pthread_rwlock_unlock failed: {rc}");
    }
}

/// Block (no timeout) or spin on the try variant until the deadline.
fn acquire(
    timeout: Option<Duration>,
    block: impl Fn() -> i32,
    try_once: impl Fn() -> i32,
) -> Result<()> {
    match timeout {
        None => {
            let rc = block();
            if rc != 0 {
                return Err(Error::Io(io::Error::from_raw_os_error(rc)));
            }
            Ok(())
        }
        Some(limit) => {
            let deadline = Instant::now() + limit;
            loop {
                let rc = try_once();
                if rc == 0 {
                    return Ok(());
                }
                if rc != libc::EBUSY {
                    return Err(Error::Io(io::Error::from_raw_os_error(rc)));
                }
                if Instant::now() >= deadline {
                    return Err(Error::Locked);
                }
                std::thread::yield_now();
            }
        }
    }
}

/// Shared-mode guard; releases on drop.
pub struct SharedGuard<'a> {
    lock: ShmRwLock<'a>,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Exclusive-mode guard; releases on drop.
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    lock: ShmRwLock<'a>,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_set(dir: &Path) -> LockSet {
        LockSet::create(&dir.join("t.lock"), 4).unwrap()
    }

    #[test]
    fn shared_then_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let locks = lock_set(dir.path());

        let a = locks.segment().shared(None).unwrap();
        let b = locks.segment().shared(None).unwrap();
        assert!(locks.segment().try_exclusive().is_none());
        drop(a);
        drop(b);
        assert!(locks.segment().try_exclusive().is_some());
    }

    #[test]
    fn try_exclusive_fails_under_writer() {
        let dir = tempfile::tempdir().unwrap();
        let locks = lock_set(dir.path());

        let g = locks.bucket(7).exclusive(None).unwrap();
        assert!(locks.bucket(7).try_exclusive().is_none());
        // Other buckets stay independent.
        assert!(locks.bucket(8).try_exclusive().is_some());
        drop(g);
        assert!(locks.bucket(7).try_exclusive().is_some());
    }

    #[test]
    fn exclusive_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let locks = lock_set(dir.path());

        let _g = locks.zone(0).exclusive(None).unwrap();
        let err = locks
            .zone(0)
            .exclusive(Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, Error::Locked));
    }

    #[test]
    fn reopen_sees_same_locks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lock");
        let a = LockSet::create(&path, 4).unwrap();
        let b = LockSet::open(&path, 4).unwrap();

        let g = a.ring().exclusive(None).unwrap();
        assert!(b.ring().try_exclusive().is_none());
        drop(g);
        assert!(b.ring().try_exclusive().is_some());
    }

    #[test]
    fn open_rejects_wrong_zone_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lock");
        LockSet::create(&path, 4).unwrap();
        assert!(LockSet::open(&path, 5).is_err());
    }
}
