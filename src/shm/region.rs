/// Shared memory region management using mmap.
///
/// The segment's bytes live in a memory-mapped file under a shm-backed
/// directory. This type owns the mapping and is the only place raw bytes are
/// touched; everything above it goes through bounds-checked `slice`/`write`.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Where to store the mapped files.
pub fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        // macOS and other Unix: use TMPDIR
        std::env::temp_dir().join("zonecache")
    }
}

/// Derive a deterministic host-wide segment name from a well-known file.
///
/// The name is built from the file's device and inode numbers, so every
/// process that resolves the same path attaches to the same segment. The
/// file is created empty if it does not exist.
pub fn derive_segment_name(name_file: &Path) -> io::Result<String> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(name_file)?;
    let md = file.metadata()?;
    Ok(format!("zonecache-{:x}-{:x}", md.dev(), md.ino()))
}

/// Take an exclusive advisory lock on `file`, blocking until granted.
///
/// Used to serialize create-vs-open decisions between processes; the lock is
/// released when the file handle is dropped.
pub(crate) fn flock_exclusive(file: &File) -> io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A mapped byte region of fixed size.
///
/// Writes go through `&self`: concurrent mutation is serialized by the
/// process-shared lock set, not by Rust borrows, exactly like the kernel
/// shares the pages between unrelated processes.
pub struct ShmRegion {
    // Keeps the mapping alive; all access goes through `ptr`.
    _mmap: MmapMut,
    ptr: *mut u8,
    len: usize,
    path: Option<PathBuf>,
}

// Mutations against the mapping are guarded by the segment's lock set.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create (or truncate) the backing file at `path` and map it.
    ///
    /// A freshly extended file reads as zeroes, which is exactly the
    /// initialized state of buckets and stats; the caller still writes the
    /// zone free tails.
    pub fn create(path: &Path, size: usize) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;

        // Safety: we just created the file and sized it ourselves.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        log::debug!("created segment file {path:?} ({size} bytes)");

        Ok(ShmRegion {
            _mmap: mmap,
            ptr,
            len: size,
            path: Some(path.to_path_buf()),
        })
    }

    /// Map an existing backing file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;

        // Safety: the file is shared by design; the lock set serializes access.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        log::debug!("opened segment file {path:?} ({len} bytes)");

        Ok(ShmRegion {
            _mmap: mmap,
            ptr,
            len,
            path: Some(path.to_path_buf()),
        })
    }

    /// An anonymous private mapping, for tests of the codec and allocator.
    pub fn anonymous(size: usize) -> Result<Self> {
        let mut mmap = MmapMut::map_anon(size)?;
        let ptr = mmap.as_mut_ptr();
        Ok(ShmRegion {
            _mmap: mmap,
            ptr,
            len: size,
            path: None,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(Error::Corrupt("byte access outside the segment"));
        }
        Ok(())
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        // Safety: bounds checked above; the mapping outlives the borrow.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) })
    }

    /// Overwrite exactly `data.len()` bytes starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // Safety: bounds checked above; concurrent writers are excluded by
        // the caller's locks.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
        Ok(())
    }

    /// Fill `len` bytes starting at `offset` with `byte`.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.check(offset, len)?;
        // Safety: bounds checked above.
        unsafe {
            std::ptr::write_bytes(self.ptr.add(offset), byte, len);
        }
        Ok(())
    }

    /// Remove the backing file. The mapping stays usable until drop.
    pub fn unlink(&self) -> io::Result<()> {
        if let Some(path) = &self.path {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
