//! Owns the file descriptor and mmap view backing a database file.
//!
//! Growth follows the exponential-doubling-plus-headroom strategy used by
//! the reference mmap storage in the corpus, scaled down for twoskip's much
//! smaller records (no multi-megabyte floor is warranted here). Advisory
//! locking is layered on with `fs2`, since this is a single-process-mmap
//! design in spirit but twoskip is explicitly meant to serialize concurrent
//! *processes* through OS file locks, which a plain single-process mmap
//! design never needs.

use std::fs::{File, OpenOptions};
use std::ops::Deref;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::debug;

use crate::error::{Error, Result};

/// A bounds-checked, read-only view into the mapped file.
///
/// Borrowed key/value slices returned by the engine are built on top of
/// this; callers must not hold one across an operation that might grow or
/// remap the file.
pub struct View<'a> {
    guard: RwLockReadGuard<'a, MmapMut>,
}

impl Deref for View<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

pub struct MappedFile {
    path: PathBuf,
    file: File,
    mmap: RwLock<MmapMut>,
}

impl MappedFile {
    const INITIAL_SIZE: u64 = 64 * 1024;
    const MIN_GROWTH: u64 = 1024 * 1024;
    const GROWTH_FACTOR: u64 = 2;

    /// Opens `path`, creating it (zero-length) if `create` is set and it
    /// does not exist. Does not write a header or DUMMY record — that is
    /// the engine's job on a fresh file.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(|e| Error::io(path, e))?;

        let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
        let map_len = len.max(Self::INITIAL_SIZE);
        if len < map_len {
            file.set_len(map_len).map_err(|e| Error::io(path, e))?;
        }

        // SAFETY: `file` is open for read+write and sized to at least
        // `map_len` bytes by the `set_len` call above.
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| Error::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap: RwLock::new(mmap),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current capacity of the mapping. May exceed the logical file size
    /// tracked by the header (`current_size`) when growth has run ahead of
    /// actual content.
    pub fn capacity(&self) -> u64 {
        self.mmap.read().len() as u64
    }

    /// Actual on-disk length as reported by the OS, which may exceed the
    /// logical `current_size` tracked in the header after a crash
    /// mid-transaction.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| Error::io(&self.path, e))?
            .len())
    }

    /// Borrows the mapping for reads. Held only for the duration of a
    /// single navigation step or copy-out; never across a call that can
    /// mutate the file.
    pub fn view(&self) -> View<'_> {
        View {
            guard: self.mmap.read(),
        }
    }

    /// Grows the mapping (and backing file) so that byte offset
    /// `required_len - 1` is addressable.
    pub fn ensure_capacity(&self, required_len: u64) -> Result<()> {
        let mut mmap = self.mmap.write();
        if (mmap.len() as u64) >= required_len {
            return Ok(());
        }
        mmap.flush().map_err(|e| Error::io(&self.path, e))?;

        let current_len = mmap.len() as u64;
        let doubled = current_len.saturating_mul(Self::GROWTH_FACTOR);
        let with_headroom = required_len.saturating_add(Self::MIN_GROWTH);
        let new_len = doubled.max(with_headroom).max(required_len);

        self.file
            .set_len(new_len)
            .map_err(|e| Error::io(&self.path, e))?;

        // SAFETY: `self.file` has just been resized to `new_len` bytes via
        // `set_len`, so the new mapping range is backed by allocated space.
        *mmap = unsafe { MmapOptions::new().map_mut(&self.file) }.map_err(|e| Error::io(&self.path, e))?;
        debug!(path = %self.path.display(), old = current_len, new = new_len, "mapped file grown");
        Ok(())
    }

    /// Writes `data` at `offset`, growing the mapping first if needed.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_capacity(offset + data.len() as u64)?;
        let mut mmap = self.mmap.write();
        let start = offset as usize;
        mmap[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Shrinks the backing file to exactly `len` bytes and remaps.
    /// Used by `recovery1` to discard any bytes appended past
    /// `current_size` by an aborted transaction.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut mmap = self.mmap.write();
        mmap.flush().map_err(|e| Error::io(&self.path, e))?;
        self.file.set_len(len).map_err(|e| Error::io(&self.path, e))?;
        let map_len = len.max(Self::INITIAL_SIZE);
        self.file
            .set_len(map_len)
            .map_err(|e| Error::io(&self.path, e))?;
        // SAFETY: `self.file` was just sized to `map_len` bytes above.
        *mmap = unsafe { MmapOptions::new().map_mut(&self.file) }.map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }

    /// Flushes the mmap and fsyncs the underlying file descriptor. This is
    /// the durability point the write protocol relies on.
    pub fn fsync(&self) -> Result<()> {
        let mmap = self.mmap.read();
        mmap.flush().map_err(|e| Error::io(&self.path, e))?;
        self.file.sync_all().map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }

    /// Acquires an advisory exclusive (writer) lock, blocking until
    /// available. Serializes writers across cooperating processes.
    pub fn lock_exclusive(&self) -> Result<()> {
        self.file
            .lock_exclusive()
            .map_err(|e| Error::lock(&self.path, e.to_string()))
    }

    /// Acquires an advisory shared (reader) lock, blocking until available.
    pub fn lock_shared(&self) -> Result<()> {
        self.file
            .lock_shared()
            .map_err(|e| Error::lock(&self.path, e.to_string()))
    }

    /// Releases whichever advisory lock is currently held.
    pub fn unlock(&self) -> Result<()> {
        fs2::FileExt::unlock(&self.file).map_err(|e| Error::lock(&self.path, e.to_string()))
    }

    /// Acquires the shared lock and returns a guard that releases it on
    /// drop, so a read path can't leak the lock on an early return.
    pub fn lock_shared_guard(&self) -> Result<FileLockGuard<'_>> {
        self.lock_shared()?;
        Ok(FileLockGuard { file: self })
    }

    /// Acquires the exclusive lock and returns a guard that releases it on
    /// drop. Held for the lifetime of a transaction or a recovery pass.
    pub fn lock_exclusive_guard(&self) -> Result<FileLockGuard<'_>> {
        self.lock_exclusive()?;
        Ok(FileLockGuard { file: self })
    }
}

/// RAII handle for an advisory lock acquired through
/// [`MappedFile::lock_shared_guard`]/[`MappedFile::lock_exclusive_guard`].
/// Releases the lock when dropped, on every return path including `?`.
pub struct FileLockGuard<'a> {
    file: &'a MappedFile,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let mf = MappedFile::open(&path, true).unwrap();
        mf.write_at(64, b"hello").unwrap();
        assert_eq!(&mf.view()[64..69], b"hello");
    }

    #[test]
    fn grows_past_initial_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let mf = MappedFile::open(&path, true).unwrap();
        let big_offset = MappedFile::INITIAL_SIZE + 10;
        mf.write_at(big_offset, b"x").unwrap();
        assert!(mf.capacity() > MappedFile::INITIAL_SIZE);
        assert_eq!(mf.view()[big_offset as usize], b'x');
    }

    #[test]
    fn truncate_shrinks_logical_and_preserves_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let mf = MappedFile::open(&path, true).unwrap();
        mf.write_at(64, b"abcdef").unwrap();
        mf.truncate(70).unwrap();
        assert_eq!(&mf.view()[64..70], b"abcdef");
    }

    #[test]
    fn exclusive_lock_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let mf = MappedFile::open(&path, true).unwrap();
        mf.lock_exclusive().unwrap();
        mf.unlock().unwrap();
    }
}
