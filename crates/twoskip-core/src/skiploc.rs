//! Per-handle location cache.
//!
//! Caches the predecessors and forward pointers discovered by the last
//! full traversal so that repeat lookups, narrow re-lookups, and
//! sequential iteration can skip re-walking the skiplist from `DUMMY`.
//! Invalidated wholesale whenever the database's `(generation, end)`
//! fingerprint no longer matches.

use crate::record::MAX_NEXTLOC;

/// Navigation state cached between calls on the same handle.
#[derive(Debug, Clone)]
pub struct Skiploc {
    /// The key this cache describes, if any.
    key: Option<Vec<u8>>,
    /// Whether `key` was found exactly (as opposed to a nearest-following
    /// position).
    is_exactmatch: bool,
    /// Offset of the last record the traversal actually landed on.
    last_record: u64,
    /// `backloc[i]` = offset of the predecessor record at level `i`.
    backloc: [u64; MAX_NEXTLOC],
    /// `forwardloc[i]` = the predecessor's forward pointer at level `i`
    /// (i.e. what `backloc[i]` currently points to at that level).
    forwardloc: [u64; MAX_NEXTLOC],
    /// Fingerprint this cache was built under.
    generation: u64,
    end: u64,
}

impl Default for Skiploc {
    fn default() -> Self {
        Self {
            key: None,
            is_exactmatch: false,
            last_record: 0,
            backloc: [0; MAX_NEXTLOC],
            forwardloc: [0; MAX_NEXTLOC],
            generation: u64::MAX,
            end: u64::MAX,
        }
    }
}

impl Skiploc {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this cache was built under the given fingerprint and is
    /// still eligible for a fast path.
    pub fn is_fresh(&self, generation: u64, end: u64) -> bool {
        self.key.is_some() && self.generation == generation && self.end == end
    }

    pub fn cached_key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn is_exactmatch(&self) -> bool {
        self.is_exactmatch
    }

    pub fn last_record(&self) -> u64 {
        self.last_record
    }

    pub fn backloc(&self, level: usize) -> u64 {
        self.backloc[level]
    }

    pub fn forwardloc(&self, level: usize) -> u64 {
        self.forwardloc[level]
    }

    pub fn backloc_slice(&self) -> &[u64; MAX_NEXTLOC] {
        &self.backloc
    }

    pub fn forwardloc_slice(&self) -> &[u64; MAX_NEXTLOC] {
        &self.forwardloc
    }

    /// Replaces the whole cache after a fresh `relocate` traversal.
    pub fn store(
        &mut self,
        key: &[u8],
        is_exactmatch: bool,
        last_record: u64,
        backloc: [u64; MAX_NEXTLOC],
        forwardloc: [u64; MAX_NEXTLOC],
        generation: u64,
        end: u64,
    ) {
        self.key = Some(key.to_vec());
        self.is_exactmatch = is_exactmatch;
        self.last_record = last_record;
        self.backloc = backloc;
        self.forwardloc = forwardloc;
        self.generation = generation;
        self.end = end;
    }

    /// Advances the cache past the current position during sequential
    /// iteration: the old forward pointer at level 0 becomes the new
    /// `last_record`/`backloc[0]`, and forward pointers are refreshed from
    /// the newly-reached record's own `nextloc`. Levels above 0 keep their
    /// existing predecessor as long as the new record's level doesn't
    /// exceed what was cached.
    pub fn advance(
        &mut self,
        new_key: &[u8],
        new_record_offset: u64,
        new_nextloc: &[u64; MAX_NEXTLOC],
        generation: u64,
        end: u64,
    ) {
        self.backloc[0] = self.last_record;
        self.key = Some(new_key.to_vec());
        self.is_exactmatch = true;
        self.last_record = new_record_offset;
        self.forwardloc = *new_nextloc;
        self.generation = generation;
        self.end = end;
    }

    pub fn invalidate(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cache_requires_matching_fingerprint() {
        let mut loc = Skiploc::new();
        assert!(!loc.is_fresh(0, 64));
        loc.store(b"k", true, 64, [0; MAX_NEXTLOC], [0; MAX_NEXTLOC], 0, 96);
        assert!(loc.is_fresh(0, 96));
        assert!(!loc.is_fresh(1, 96));
        assert!(!loc.is_fresh(0, 128));
    }

    #[test]
    fn invalidate_clears_cached_key() {
        let mut loc = Skiploc::new();
        loc.store(b"k", true, 64, [0; MAX_NEXTLOC], [0; MAX_NEXTLOC], 0, 96);
        loc.invalidate();
        assert!(loc.cached_key().is_none());
        assert!(!loc.is_fresh(0, 96));
    }
}
