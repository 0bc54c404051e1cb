//! Whole-file consistency check.
//!
//! Walks the level-1 chain exactly like the ordinary read path, confirming
//! keys come out in strictly increasing order, then re-walks every level
//! 2..=MAXLEVEL independently, confirming each higher-level chain is a
//! subsequence of the level-1 chain and terminates at zero. Used before and
//! after `checkpoint` rewrites a file, and available to callers who want to
//! validate a database without taking the engine's word for it.

use crate::engine::{forward_at, Engine, DUMMY_OFFSET};
use crate::error::{Error, Result};
use crate::record::Record;

/// Checks `engine`'s current file for structural consistency. Returns the
/// number of live records found on success.
pub fn check(engine: &Engine) -> Result<u64> {
    let inner = engine.inner_for_check();
    let buf = inner.file.view();
    let current_size = inner.header.current_size;
    let path = engine.path();

    let mut live_offsets = Vec::new();
    let mut offset = DUMMY_OFFSET;
    let mut prev_key: Option<Vec<u8>> = None;

    loop {
        let record = Record::decode_head(&buf, offset, path)?;
        let next = forward_at(&record, 1, current_size, false);
        if next == 0 {
            break;
        }
        if next <= offset {
            return Err(Error::internal(
                path,
                format!("level-1 chain is not monotonically increasing at offset {offset}"),
            ));
        }
        let rec = Record::decode_head(&buf, next, path)?;
        rec.verify_tail(&buf, path)?;
        let key = rec.key(&buf).to_vec();
        if let Some(prev) = &prev_key {
            if engine.comparator().compare(prev, &key) != std::cmp::Ordering::Less {
                return Err(Error::internal(path, format!("keys out of order at offset {next}")));
            }
        }
        prev_key = Some(key);
        live_offsets.push(next);
        offset = next;
    }

    for level in 2..=crate::config::MAXLEVEL as usize {
        let mut seen = 0usize;
        let mut cursor = DUMMY_OFFSET;
        loop {
            let record = Record::decode_head(&buf, cursor, path)?;
            let next = record.nextloc[level];
            if next == 0 {
                break;
            }
            if !live_offsets.contains(&next) {
                return Err(Error::internal(
                    path,
                    format!("level {level} points at non-live offset {next}"),
                ));
            }
            seen += 1;
            if seen > live_offsets.len() {
                return Err(Error::internal(path, format!("level {level} chain does not terminate")));
            }
            cursor = next;
        }
    }

    Ok(live_offsets.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, OpenFlags};
    use tempfile::tempdir;

    #[test]
    fn fresh_database_is_consistent() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(&dir.path().join("db"), OpenFlags::create(), Config::default()).unwrap();
        assert_eq!(check(&engine).unwrap(), 0);
    }

    #[test]
    fn populated_database_is_consistent() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(&dir.path().join("db"), OpenFlags::create(), Config::default()).unwrap();
        for k in ["c", "a", "e", "b", "d"] {
            engine.store(k.as_bytes(), b"v", false).unwrap();
        }
        engine.delete(b"b", false).unwrap();
        assert_eq!(check(&engine).unwrap(), 4);
    }
}
