//! The engine: find/store/delete/stitch over records, driven by the
//! dirty-flag write protocol, plus the handful of primitives
//! (`effective_level0`, `choose_level0_slot`, raw live-key iteration) that
//! `recovery` and `checkpoint` reuse instead of re-deriving.

use std::cmp::Ordering as CmpOrdering;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, instrument};

use crate::comparator::ComparatorKind;
use crate::config::{Config, OpenFlags};
use crate::error::{Error, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::mapped_file::MappedFile;
use crate::metrics::EngineMetrics;
use crate::record::{encode_head, encode_new, Record, RecordType, MAX_NEXTLOC};
use crate::skiploc::Skiploc;

/// Offset of the mandatory DUMMY record, immediately after the header.
pub const DUMMY_OFFSET: u64 = HEADER_SIZE as u64;

/// The mutable state guarded by the handle's in-process lock. This lock is
/// the Rust-level analogue of the single-writer discipline the engine
/// assumes; the OS-level advisory lock on `file` additionally serializes
/// cooperating processes.
pub(crate) struct EngineInner {
    pub(crate) file: MappedFile,
    pub(crate) header: Header,
    pub(crate) skiploc: RwLock<Skiploc>,
    rng: StdRng,
    /// Logical append cursor for the transaction currently in flight.
    /// `None` means "use `header.current_size`"; once a transaction has
    /// appended at least one record this tracks the true end so later
    /// appends in the same transaction land after it, even though
    /// `header.current_size` itself isn't bumped until commit.
    pub(crate) end: Option<u64>,
}

/// A transaction token. At most one may be outstanding per handle.
pub struct Txn {
    serial: u64,
    start_size: u64,
}

pub struct Engine {
    path: PathBuf,
    comparator: ComparatorKind,
    config: Config,
    metrics: EngineMetrics,
    pub(crate) inner: RwLock<EngineInner>,
    txn_serial: std::sync::atomic::AtomicU64,
}

/// Result of a skiplist search: the predecessor and
/// candidate-successor offset at every level, and whether the candidate is
/// an exact match.
struct Located {
    backloc: [u64; MAX_NEXTLOC],
    forwardloc: [u64; MAX_NEXTLOC],
    is_exact: bool,
}

impl Located {
    fn matched_offset(&self) -> u64 {
        self.forwardloc[1]
    }
}

/// The dual lowest-level pointer read rule.
///
/// In steady state the effective forward pointer is the larger of the two
/// slots. While recovering, any slot `>= current_size` is a suspect write
/// from an uncommitted transaction and must be ignored.
pub(crate) fn effective_level0(slot0: u64, slot1: u64, current_size: u64, recovering: bool) -> u64 {
    if !recovering {
        return slot0.max(slot1);
    }
    match (slot0 < current_size, slot1 < current_size) {
        (true, true) => slot0.max(slot1),
        (true, false) => slot0,
        (false, true) => slot1,
        (false, false) => 0,
    }
}

/// The dual lowest-level pointer write rule: prefer the
/// slot already touched by the current transaction; otherwise overwrite
/// the smaller (older) slot, preserving the pre-transaction value.
pub(crate) fn choose_level0_slot(slot0: u64, slot1: u64, current_size: u64) -> usize {
    if slot0 >= current_size {
        0
    } else if slot1 >= current_size {
        1
    } else if slot0 <= slot1 {
        0
    } else {
        1
    }
}

/// The forward pointer of `record` at skiplist level `level` (1..=MAXLEVEL).
/// Level 1 is the dual-pointer pair at `nextloc[0]`/`nextloc[1]`; higher
/// levels are a single slot at `nextloc[level]`.
pub(crate) fn forward_at(record: &Record, level: usize, current_size: u64, recovering: bool) -> u64 {
    if level == 1 {
        effective_level0(record.nextloc[0], record.nextloc[1], current_size, recovering)
    } else {
        record.nextloc[level]
    }
}

/// Rewrites a record's fixed head in place (type/level/lengths/pointers),
/// leaving the payload and tail CRC untouched. Shared by the engine's own
/// stitch helpers and by `recovery1`'s physical-chain repair.
pub(crate) fn rewrite_head(inner: &EngineInner, record: &Record) -> Result<()> {
    let head = encode_head(
        record.rtype,
        record.level,
        record.keylen,
        record.vallen,
        &record.nextloc[0..=record.level as usize],
        record.crc_tail,
    );
    inner.file.write_at(record.offset, &head)?;
    Ok(())
}

impl Engine {
    /// Opens (and if needed creates) a database at `path`.
    #[instrument(skip(config), fields(path = %path.display()))]
    pub fn open(path: &Path, flags: OpenFlags, config: Config) -> Result<Self> {
        let existed = path.exists();
        let file = MappedFile::open(path, flags.create)?;
        if !existed {
            if !flags.create {
                return Err(Error::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "database does not exist"),
                ));
            }
            Self::initialize_new_file(&file, path)?;
            info!(path = %path.display(), "created new twoskip database");
        }

        let buf = file.view();
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&buf[0..HEADER_SIZE]);
        let header = Header::decode(&header_bytes, path)?;
        drop(buf);

        let engine = Self {
            path: path.to_path_buf(),
            comparator: flags.comparator(),
            config,
            metrics: EngineMetrics::new(),
            inner: RwLock::new(EngineInner {
                file,
                header,
                skiploc: RwLock::new(Skiploc::new()),
                rng: StdRng::from_entropy(),
                end: None,
            }),
            txn_serial: std::sync::atomic::AtomicU64::new(0),
        };

        engine.ensure_recovered()?;
        Ok(engine)
    }

    /// Always-create variant used internally by `checkpoint` for the
    /// `<filename>.NEW` rewrite target.
    pub(crate) fn open_fresh(path: &Path, comparator: ComparatorKind, config: Config) -> Result<Self> {
        let flags = OpenFlags {
            create: true,
            mboxsort: comparator == ComparatorKind::Mailbox,
        };
        Self::open(path, flags, config)
    }

    fn initialize_new_file(file: &MappedFile, path: &Path) -> Result<()> {
        let current_size = DUMMY_OFFSET + 8 * (crate::config::MAXLEVEL as u64 + 1);
        let dummy = encode_new(RecordType::Dummy, crate::config::MAXLEVEL, &[], &[], &[0; MAX_NEXTLOC]);
        file.write_at(DUMMY_OFFSET, &dummy)?;
        let header = Header::new(DUMMY_OFFSET + dummy.len() as u64);
        debug_assert_eq!(header.current_size, current_size);
        file.write_at(0, &header.encode())?;
        file.fsync()?;
        let _ = path;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn comparator(&self) -> ComparatorKind {
        self.comparator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub(crate) fn header_snapshot(&self) -> Header {
        self.inner.read().header
    }

    /// Read guard over the inner state, for `consistency::check`'s
    /// independent walk.
    pub(crate) fn inner_for_check(&self) -> parking_lot::RwLockReadGuard<'_, EngineInner> {
        self.inner.read()
    }

    // ---- recovery entry point -------------------------------------------------

    /// Runs recovery if the header is dirty or the physical file is shorter
    /// than `current_size` (a torn truncate/grow). Idempotent on a clean
    /// file.
    ///
    /// Deliberately does *not* compare `file_len()` against `current_size`
    /// for equality: `MappedFile` over-allocates the backing file (a
    /// doubling growth strategy with a 64 KiB floor, see
    /// `MappedFile::ensure_capacity`), so the physical file is routinely
    /// larger than `current_size` on a cleanly committed database. Any
    /// transaction that actually left an uncommitted tail past
    /// `current_size` also left DIRTY set (the write path's `ensure_dirty`
    /// guard sets and fsyncs it before the first append), so DIRTY alone
    /// already catches that case; the length check only guards against a
    /// file that is impossibly short for its own header.
    pub fn ensure_recovered(&self) -> Result<()> {
        let needs_recovery = {
            let inner = self.inner.read();
            let _lock = inner.file.lock_shared_guard()?;
            inner.header.is_dirty() || inner.file.file_len()? < inner.header.current_size
        };
        if !needs_recovery {
            return Ok(());
        }
        let mut inner = self.inner.write();
        inner.file.lock_exclusive()?;
        let result = crate::recovery::recover(&self.path, &mut inner, self.comparator, self.config, &self.metrics);
        inner.file.unlock()?;
        result
    }

    // ---- navigation -------------------------------------------------------

    /// Searches for `key`, consulting the per-handle [`Skiploc`] cache for
    /// the fast paths from spec §4.3 before falling back to a full
    /// traversal from `DUMMY`: a repeat lookup of the cached key returns
    /// straight from the cache, and a lookup strictly between the cached
    /// position and its cached level-1 forward pointer reuses the cached
    /// backlocs after a single confirming read.
    fn relocate(&self, inner: &EngineInner, key: &[u8]) -> Result<Located> {
        let buf = inner.file.view();
        let current_size = inner.header.current_size;
        let fingerprint_end = self.engine_end(inner);
        let generation = inner.header.generation;

        if let Some(located) = self.relocate_cached(inner, &buf, key, generation, fingerprint_end)? {
            return Ok(located);
        }

        let mut backloc = [DUMMY_OFFSET; MAX_NEXTLOC];
        let mut forwardloc = [0u64; MAX_NEXTLOC];
        let mut cur_offset = DUMMY_OFFSET;

        for level in (1..=crate::config::MAXLEVEL as usize).rev() {
            loop {
                let cur = Record::decode_head(&buf, cur_offset, &self.path)?;
                let next_off = forward_at(&cur, level, current_size, false);
                if next_off == 0 {
                    break;
                }
                let next = Record::decode_head(&buf, next_off, &self.path)?;
                if self.comparator.compare(next.key(&buf), key) == CmpOrdering::Less {
                    cur_offset = next_off;
                } else {
                    break;
                }
            }
            let cur = Record::decode_head(&buf, cur_offset, &self.path)?;
            backloc[level] = cur_offset;
            forwardloc[level] = forward_at(&cur, level, current_size, false);
        }
        backloc[0] = backloc[1];
        forwardloc[0] = forwardloc[1];

        let is_exact = if forwardloc[1] != 0 {
            let candidate = Record::decode_head(&buf, forwardloc[1], &self.path)?;
            self.comparator.compare(candidate.key(&buf), key) == CmpOrdering::Equal
        } else {
            false
        };

        inner.skiploc.write().store(
            key,
            is_exact,
            forwardloc[1],
            backloc,
            forwardloc,
            generation,
            fingerprint_end,
        );

        Ok(Located {
            backloc,
            forwardloc,
            is_exact,
        })
    }

    /// The cache fast paths from spec §4.3. Returns `Ok(None)` to fall back
    /// to a full traversal: either the cache is stale (fingerprint mismatch,
    /// or no traversal has happened yet), or `key` falls outside the window
    /// the cached backlocs can answer for.
    fn relocate_cached(
        &self,
        inner: &EngineInner,
        buf: &[u8],
        key: &[u8],
        generation: u64,
        end: u64,
    ) -> Result<Option<Located>> {
        let cache = inner.skiploc.read();
        if !cache.is_fresh(generation, end) {
            return Ok(None);
        }
        let Some(cached_key) = cache.cached_key() else {
            return Ok(None);
        };

        if cached_key == key {
            return Ok(Some(Located {
                backloc: *cache.backloc_slice(),
                forwardloc: *cache.forwardloc_slice(),
                is_exact: cache.is_exactmatch(),
            }));
        }

        if self.comparator.compare(key, cached_key) != CmpOrdering::Greater {
            return Ok(None);
        }

        let fwd1 = cache.forwardloc(1);
        if fwd1 == 0 {
            // Cached position is already the tail of the chain; any greater
            // key still falls in this window, with no exact match possible.
            return Ok(Some(Located {
                backloc: *cache.backloc_slice(),
                forwardloc: *cache.forwardloc_slice(),
                is_exact: false,
            }));
        }

        let candidate = Record::decode_head(buf, fwd1, &self.path)?;
        match self.comparator.compare(key, candidate.key(buf)) {
            CmpOrdering::Greater => Ok(None),
            CmpOrdering::Equal => Ok(Some(Located {
                backloc: *cache.backloc_slice(),
                forwardloc: *cache.forwardloc_slice(),
                is_exact: true,
            })),
            CmpOrdering::Less => Ok(Some(Located {
                backloc: *cache.backloc_slice(),
                forwardloc: *cache.forwardloc_slice(),
                is_exact: false,
            })),
        }
    }

    // ---- reads --------------------------------------------------------------

    pub fn fetch(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_recovered()?;
        let inner = self.inner.read();
        let _lock = inner.file.lock_shared_guard()?;
        self.metrics.record_fetch();
        let located = self.relocate(&inner, key)?;
        if !located.is_exact {
            return Err(Error::NotFound);
        }
        let buf = inner.file.view();
        let record = Record::decode_head(&buf, located.matched_offset(), &self.path)?;
        record.verify_tail(&buf, &self.path)?;
        Ok(record.value(&buf).to_vec())
    }

    pub fn fetchnext(&self, key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        self.ensure_recovered()?;
        let inner = self.inner.read();
        let _lock = inner.file.lock_shared_guard()?;
        let located = self.relocate(&inner, key)?;
        let offset = if located.is_exact {
            let buf = inner.file.view();
            let rec = Record::decode_head(&buf, located.matched_offset(), &self.path)?;
            forward_at(&rec, 1, inner.header.current_size, false)
        } else {
            located.matched_offset()
        };
        if offset == 0 {
            return Err(Error::NotFound);
        }
        let buf = inner.file.view();
        let record = Record::decode_head(&buf, offset, &self.path)?;
        record.verify_tail(&buf, &self.path)?;
        Ok((record.key(&buf).to_vec(), record.value(&buf).to_vec()))
    }

    /// Walks keys starting at `prefix` while `goodp` accepts them, invoking
    /// `cb(key, value)` for each. Stops at the first non-zero `cb` result
    /// (returned to the caller) or when `goodp` rejects a key.
    pub fn foreach<G, C>(&self, prefix: &[u8], goodp: G, mut cb: C) -> Result<i32>
    where
        G: Fn(&[u8]) -> bool,
        C: FnMut(&[u8], &[u8]) -> Result<i32>,
    {
        self.ensure_recovered()?;
        let mut next_offset = {
            let inner = self.inner.read();
            let _lock = inner.file.lock_shared_guard()?;
            let located = self.relocate(&inner, prefix)?;
            located.matched_offset()
        };

        loop {
            if next_offset == 0 {
                return Ok(0);
            }
            let (key, value, advance_to, current_size) = {
                let inner = self.inner.read();
                let _lock = inner.file.lock_shared_guard()?;
                let buf = inner.file.view();
                let record = Record::decode_head(&buf, next_offset, &self.path)?;
                record.verify_tail(&buf, &self.path)?;
                let key = record.key(&buf).to_vec();
                let value = record.value(&buf).to_vec();
                let advance_to = forward_at(&record, 1, inner.header.current_size, false);
                (key, value, advance_to, inner.header.current_size)
            };
            let _ = current_size;
            if !goodp(&key) {
                return Ok(0);
            }
            // Lock released around the callback so it may re-enter the
            // database.
            let result = cb(&key, &value)?;
            if result != 0 {
                return Ok(result);
            }
            next_offset = advance_to;
        }
    }

    // ---- writes ---------------------------------------------------------------

    fn ensure_dirty(&self, inner: &mut EngineInner) -> Result<()> {
        if inner.header.is_dirty() {
            return Ok(());
        }
        inner.header.set_dirty(true);
        inner.file.write_at(0, &inner.header.encode())?;
        inner.file.fsync()?;
        Ok(())
    }

    /// Rewrites the predecessor chain at levels `1..=max_level` to point at
    /// `target`, using the dual-pointer rule at level 1.
    fn stitch_uniform(&self, inner: &EngineInner, backloc: &[u64; MAX_NEXTLOC], max_level: usize, target: u64) -> Result<()> {
        let buf = inner.file.view();
        let current_size = inner.header.current_size;
        let mut to_rewrite = Vec::with_capacity(max_level);
        for level in 1..=max_level {
            let pred_off = backloc[level];
            let mut pred = Record::decode_head(&buf, pred_off, &self.path)?;
            if level == 1 {
                let slot = choose_level0_slot(pred.nextloc[0], pred.nextloc[1], current_size);
                pred.nextloc[slot] = target;
            } else {
                pred.nextloc[level] = target;
            }
            to_rewrite.push(pred);
        }
        drop(buf);
        for pred in &to_rewrite {
            rewrite_head(inner, pred)?;
        }
        Ok(())
    }

    /// Rewrites the predecessor chain for a forced overwrite whose
    /// replacement record landed on a different `randlvl` than the record
    /// it replaces. At levels `1..=new_level` predecessors are pointed at
    /// `new_offset`, same as `stitch_uniform`. At levels
    /// `new_level+1..=old.level` (only populated when the replacement's
    /// level came out lower than `old`'s) predecessors instead bypass
    /// straight to whatever `old` itself forwarded to at that level: `old`'s
    /// own record on disk still encodes pointers only up to its own level,
    /// so pointing a higher-level predecessor at `new_offset` would dead-end
    /// on a record with no pointer slot that high, truncating every record
    /// that used to follow `old` at those levels.
    fn stitch_overwrite(
        &self,
        inner: &EngineInner,
        backloc: &[u64; MAX_NEXTLOC],
        old: &Record,
        new_level: u8,
        new_offset: u64,
    ) -> Result<()> {
        let buf = inner.file.view();
        let current_size = inner.header.current_size;
        let new_level = new_level as usize;
        let max_level = (old.level as usize).max(new_level);
        let mut to_rewrite = Vec::with_capacity(max_level);
        for level in 1..=max_level {
            let target = if level <= new_level {
                new_offset
            } else {
                forward_at(old, level, current_size, false)
            };
            let pred_off = backloc[level];
            let mut pred = Record::decode_head(&buf, pred_off, &self.path)?;
            if level == 1 {
                let slot = choose_level0_slot(pred.nextloc[0], pred.nextloc[1], current_size);
                pred.nextloc[slot] = target;
            } else {
                pred.nextloc[level] = target;
            }
            to_rewrite.push(pred);
        }
        drop(buf);
        for pred in &to_rewrite {
            rewrite_head(inner, pred)?;
        }
        Ok(())
    }

    /// Rewrites the predecessor chain at levels `1..=old_level` to bypass
    /// `old`, pointing each predecessor directly at whatever `old` itself
    /// pointed to at that level.
    fn stitch_bypass(&self, inner: &EngineInner, backloc: &[u64; MAX_NEXTLOC], old: &Record) -> Result<()> {
        let buf = inner.file.view();
        let current_size = inner.header.current_size;
        let mut to_rewrite = Vec::with_capacity(old.level as usize);
        for level in 1..=(old.level as usize) {
            let successor = forward_at(old, level, current_size, false);
            let pred_off = backloc[level];
            let mut pred = Record::decode_head(&buf, pred_off, &self.path)?;
            if level == 1 {
                let slot = choose_level0_slot(pred.nextloc[0], pred.nextloc[1], current_size);
                pred.nextloc[slot] = successor;
            } else {
                pred.nextloc[level] = successor;
            }
            to_rewrite.push(pred);
        }
        drop(buf);
        for pred in &to_rewrite {
            rewrite_head(inner, pred)?;
        }
        Ok(())
    }

    fn randlvl(&self, inner: &mut EngineInner) -> u8 {
        let maxlevel = self.config.maxlevel.min(crate::config::MAXLEVEL);
        let mut level = 1u8;
        while level < maxlevel && inner.rng.gen::<f64>() < self.config.prob {
            level += 1;
        }
        level
    }

    /// Appends always land at the current logical end of the transaction,
    /// which may already exceed `current_size` if earlier appends happened
    /// in this same transaction.
    fn append(&self, inner: &mut EngineInner, bytes: &[u8]) -> Result<u64> {
        let end = self.engine_end(inner);
        inner.file.write_at(end, bytes)?;
        Ok(end)
    }

    /// The offset one past the last byte written so far in this
    /// transaction (which may exceed `header.current_size` mid-transaction).
    fn engine_end(&self, inner: &EngineInner) -> u64 {
        inner.end.unwrap_or(inner.header.current_size)
    }

    fn set_engine_end(&self, inner: &mut EngineInner, end: u64) {
        inner.end = Some(end);
    }

    pub fn begin(&self) -> Txn {
        let serial = self.txn_serial.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let start_size = self.inner.read().header.current_size;
        Txn { serial, start_size }
    }

    /// Stores `key -> value` within an already-open transaction.
    ///
    /// Takes the file's OS-level advisory write lock for the duration of
    /// this single append, serializing this mutation against cooperating
    /// processes the same way the in-process `RwLock` serializes it against
    /// other threads.
    pub fn store_in(&self, _txn: &mut Txn, key: &[u8], value: &[u8], force: bool) -> Result<()> {
        self.metrics.record_store();
        let mut inner = self.inner.write();
        inner.file.lock_exclusive()?;
        let result = self.store_in_locked(&mut inner, key, value, force);
        inner.file.unlock()?;
        result
    }

    fn store_in_locked(&self, inner: &mut EngineInner, key: &[u8], value: &[u8], force: bool) -> Result<()> {
        self.ensure_dirty(inner)?;
        let located = self.relocate(inner, key)?;

        if located.is_exact {
            if !force {
                return Err(Error::Exists);
            }
            let old = {
                let buf = inner.file.view();
                let old = Record::decode_head(&buf, located.matched_offset(), &self.path)?;
                old.verify_tail(&buf, &self.path)?;
                if old.value(&buf) == value {
                    return Ok(());
                }
                old
            };

            let new_level = self.randlvl(inner);

            let mut nextloc = [0u64; MAX_NEXTLOC];
            {
                let current_size = inner.header.current_size;
                for level in 1..=(new_level as usize) {
                    nextloc[level] = if level <= old.level as usize {
                        forward_at(&old, level, current_size, false)
                    } else {
                        located.forwardloc[level]
                    };
                }
                nextloc[0] = nextloc[1];
            }

            let bytes = encode_new(RecordType::Record, new_level, key, value, &nextloc[0..=new_level as usize]);
            let new_offset = self.append(inner, &bytes)?;
            self.set_engine_end(inner, new_offset + bytes.len() as u64);
            self.stitch_overwrite(inner, &located.backloc, &old, new_level, new_offset)?;
            return Ok(());
        }

        let level = self.randlvl(inner);
        let mut nextloc = [0u64; MAX_NEXTLOC];
        for lv in 1..=(level as usize) {
            nextloc[lv] = located.forwardloc[lv];
        }
        nextloc[0] = nextloc[1];

        let bytes = encode_new(RecordType::Record, level, key, value, &nextloc[0..=level as usize]);
        let new_offset = self.append(inner, &bytes)?;
        self.set_engine_end(inner, new_offset + bytes.len() as u64);
        self.stitch_uniform(inner, &located.backloc, level as usize, new_offset)?;
        Ok(())
    }

    /// Deletes `key` within an already-open transaction. Same OS-lock
    /// discipline as [`Engine::store_in`].
    pub fn delete_in(&self, _txn: &mut Txn, key: &[u8], force: bool) -> Result<()> {
        self.metrics.record_delete();
        let mut inner = self.inner.write();
        inner.file.lock_exclusive()?;
        let result = self.delete_in_locked(&mut inner, key, force);
        inner.file.unlock()?;
        result
    }

    fn delete_in_locked(&self, inner: &mut EngineInner, key: &[u8], force: bool) -> Result<()> {
        self.ensure_dirty(inner)?;
        let located = self.relocate(inner, key)?;

        if !located.is_exact {
            if force {
                return Ok(());
            }
            return Err(Error::NotFound);
        }

        let old = {
            let buf = inner.file.view();
            Record::decode_head(&buf, located.matched_offset(), &self.path)?
        };
        let successor = forward_at(&old, 1, inner.header.current_size, false);
        let bytes = encode_new(RecordType::Delete, 0, &[], &[], &[successor]);
        let new_offset = self.append(inner, &bytes)?;
        self.set_engine_end(inner, new_offset + bytes.len() as u64);
        self.stitch_bypass(inner, &located.backloc, &old)?;
        Ok(())
    }

    /// Auto-transaction convenience: begins, performs the write, and
    /// commits in a single call (a null transaction token).
    pub fn store(&self, key: &[u8], value: &[u8], force: bool) -> Result<()> {
        let mut txn = self.begin();
        self.store_in(&mut txn, key, value, force)?;
        self.commit(txn)
    }

    pub fn delete(&self, key: &[u8], force: bool) -> Result<()> {
        let mut txn = self.begin();
        self.delete_in(&mut txn, key, force)?;
        self.commit(txn)
    }

    /// Commits the transaction: appends a COMMIT record, fsyncs, updates
    /// the header, fsyncs again, then runs a checkpoint if the dead
    /// fraction of the file has crossed the configured threshold.
    pub fn commit(&self, txn: Txn) -> Result<()> {
        let should_checkpoint = self.commit_building(txn)?;
        if should_checkpoint {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Same as `commit`, but never triggers a checkpoint itself — used
    /// while a checkpoint or `recovery2` rebuild is itself writing a fresh
    /// file, where an auto-triggered nested checkpoint would be pointless.
    /// Returns whether this build would otherwise have wanted one.
    pub(crate) fn commit_building(&self, txn: Txn) -> Result<bool> {
        self.metrics.record_commit();
        let mut inner = self.inner.write();
        inner.file.lock_exclusive()?;
        let result = self.commit_building_locked(&mut inner, txn);
        inner.file.unlock()?;
        result
    }

    fn commit_building_locked(&self, inner: &mut EngineInner, txn: Txn) -> Result<bool> {
        if !inner.header.is_dirty() {
            inner.end = None;
            return Ok(false);
        }

        let commit_bytes = encode_new(RecordType::Commit, 0, &[], &[], &[txn.start_size]);
        let commit_offset = self.append(inner, &commit_bytes)?;
        let new_end = commit_offset + commit_bytes.len() as u64;
        inner.file.fsync()?;

        inner.header.current_size = new_end;
        inner.header.num_records = count_live_records(inner)?;
        inner.header.set_dirty(false);
        inner.file.write_at(0, &inner.header.encode())?;
        inner.file.fsync()?;
        inner.end = None;
        inner.skiploc.write().invalidate();

        let diff = inner.header.current_size.saturating_sub(inner.header.repack_size);
        let ratio = diff as f64 / (inner.header.current_size.max(1) as f64);
        Ok(diff > self.config.minrewrite_bytes && ratio > self.config.rewrite_ratio)
    }

    /// Aborts the transaction: prunes any pointers past `current_size` and
    /// truncates back to it.
    pub fn abort(&self, _txn: Txn) -> Result<()> {
        self.metrics.record_abort();
        let mut inner = self.inner.write();
        inner.file.lock_exclusive()?;
        let result = (|| -> Result<()> {
            inner.end = None;
            if !inner.header.is_dirty() {
                return Ok(());
            }
            crate::recovery::recover(&self.path, &mut inner, self.comparator, self.config, &self.metrics)
        })();
        inner.file.unlock()?;
        result
    }

    pub fn checkpoint(&self) -> Result<()> {
        let start = Instant::now();
        crate::checkpoint::run(self)?;
        self.metrics.record_checkpoint(start.elapsed());
        Ok(())
    }

    /// Reads every live `(key, value)` pair in key order by walking the
    /// level-1 chain directly. Used by `checkpoint`.
    pub(crate) fn collect_live(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.inner.read();
        let buf = inner.file.view();
        let mut out = Vec::new();
        let mut offset = DUMMY_OFFSET;
        loop {
            let record = Record::decode_head(&buf, offset, &self.path)?;
            let next = forward_at(&record, 1, inner.header.current_size, false);
            if next == 0 {
                break;
            }
            let rec = Record::decode_head(&buf, next, &self.path)?;
            out.push((rec.key(&buf).to_vec(), rec.value(&buf).to_vec()));
            offset = next;
        }
        Ok(out)
    }

    /// Swaps in a freshly-opened file after `checkpoint` has renamed a
    /// rewritten copy over `self.path()`.
    pub(crate) fn replace_file(&self, file: MappedFile, header: Header) {
        let mut inner = self.inner.write();
        inner.file = file;
        inner.header = header;
        inner.skiploc.write().invalidate();
        inner.end = None;
    }

    /// Overwrites the header generation without going through a
    /// transaction. Used by `checkpoint`/`recovery2` to bump the
    /// generation of the freshly-built file before it's swapped in.
    pub(crate) fn set_generation(&self, generation: u64) {
        let mut inner = self.inner.write();
        inner.header.generation = generation;
        let _ = inner.file.write_at(0, &inner.header.encode());
    }

    /// Marks the file as freshly repacked: `repack_size` catches up to
    /// `current_size`, so the next commit's dead-fraction check starts
    /// from zero. Called once a checkpoint rewrite has finished copying.
    pub(crate) fn mark_repacked(&self) {
        let mut inner = self.inner.write();
        inner.header.repack_size = inner.header.current_size;
        let _ = inner.file.write_at(0, &inner.header.encode());
    }

    /// Flushes header and data to disk ahead of a rename-into-place.
    pub(crate) fn sync_for_handoff(&self) -> Result<()> {
        let inner = self.inner.read();
        inner.file.fsync()
    }

    /// Consumes the handle, yielding its inner state so the caller can
    /// fold a freshly-built replacement file into an existing handle's
    /// lock rather than constructing a brand new `Engine`.
    pub(crate) fn into_inner(self) -> EngineInner {
        self.inner.into_inner()
    }
}

/// Counts live (non-DUMMY, non-DELETE, non-COMMIT) records by walking the
/// level-1 chain, used to refresh `header.num_records` on commit.
fn count_live_records(inner: &EngineInner) -> Result<u64> {
    let buf = inner.file.view();
    let mut count = 0u64;
    let mut offset = DUMMY_OFFSET;
    loop {
        let record = Record::decode_head(&buf, offset, Path::new(""))
            .map_err(|_| Error::internal("", "corrupt record while counting"))?;
        let next = forward_at(&record, 1, inner.header.current_size, false);
        if next == 0 {
            break;
        }
        count += 1;
        offset = next;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path, name: &str) -> Engine {
        Engine::open(&dir.join(name), OpenFlags::create(), Config::default()).unwrap()
    }

    #[test]
    fn store_and_fetch_round_trip() {
        let dir = tempdir().unwrap();
        let db = open(dir.path(), "db");
        db.store(b"hello", b"world", false).unwrap();
        assert_eq!(db.fetch(b"hello").unwrap(), b"world");
        assert!(matches!(db.fetch(b"absent").unwrap_err(), Error::NotFound));
    }

    #[test]
    fn ordered_iteration() {
        let dir = tempdir().unwrap();
        let db = open(dir.path(), "db");
        for k in ["c", "a", "b", "d"] {
            db.store(k.as_bytes(), k.as_bytes(), false).unwrap();
        }
        let mut seen = Vec::new();
        db.foreach(
            b"",
            |_| true,
            |k, _v| {
                seen.push(k.to_vec());
                Ok(0)
            },
        )
        .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn overwrite_and_delete() {
        let dir = tempdir().unwrap();
        let db = open(dir.path(), "db");
        db.store(b"k", b"v1", false).unwrap();
        db.store(b"k", b"v2", true).unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), b"v2");
        db.delete(b"k", false).unwrap();
        assert!(matches!(db.fetch(b"k").unwrap_err(), Error::NotFound));
    }

    #[test]
    fn store_without_force_rejects_duplicate() {
        let dir = tempdir().unwrap();
        let db = open(dir.path(), "db");
        db.store(b"k", b"v", false).unwrap();
        assert!(matches!(db.store(b"k", b"v2", false).unwrap_err(), Error::Exists));
    }

    #[test]
    fn delete_without_force_rejects_missing() {
        let dir = tempdir().unwrap();
        let db = open(dir.path(), "db");
        assert!(matches!(db.delete(b"missing", false).unwrap_err(), Error::NotFound));
        db.delete(b"missing", true).unwrap();
    }
}
