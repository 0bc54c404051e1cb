//! Checkpoint: rewrites the whole database into a compact fresh file.
//!
//! Deleted records and superseded overwrites accumulate as dead bytes
//! between commits; a checkpoint reclaims them by copying every live
//! `(key, value)` pair, already in key order, into a brand-new file inside
//! a single transaction, bumping the generation, and renaming it over the
//! original. Triggered automatically by `Engine::commit` once the dead
//! fraction of the file crosses the configured threshold, or by calling
//! `Engine::checkpoint` directly.

use std::path::PathBuf;

use tracing::info;

use crate::engine::Engine;
use crate::error::{Error, Result};

fn sibling_new_path(path: &std::path::Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".NEW");
    path.with_file_name(name)
}

/// Runs one checkpoint of `engine`'s current file in place.
pub(crate) fn run(engine: &Engine) -> Result<()> {
    crate::consistency::check(engine)?;

    let live = engine.collect_live()?;
    let new_path = sibling_new_path(engine.path());
    let _ = std::fs::remove_file(&new_path);

    let new_engine = Engine::open_fresh(&new_path, engine.comparator(), *engine.config())?;
    {
        let mut txn = new_engine.begin();
        for (key, value) in &live {
            new_engine.store_in(&mut txn, key, value, true)?;
        }
        new_engine.commit_building(txn)?;
    }

    crate::consistency::check(&new_engine)?;

    let old_generation = engine.header_snapshot().generation;
    new_engine.set_generation(old_generation.wrapping_add(1));
    new_engine.mark_repacked();
    new_engine.sync_for_handoff()?;

    std::fs::rename(&new_path, engine.path()).map_err(|e| Error::io(engine.path(), e))?;

    let new_inner = new_engine.into_inner();
    engine.replace_file(new_inner.file, new_inner.header);

    info!(
        path = %engine.path().display(),
        records = live.len(),
        "checkpoint completed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, OpenFlags};
    use tempfile::tempdir;

    #[test]
    fn checkpoint_preserves_all_live_keys() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(&dir.path().join("db"), OpenFlags::create(), Config::default()).unwrap();
        for i in 0..50u32 {
            engine.store(i.to_string().as_bytes(), b"v", false).unwrap();
        }
        for i in 0..25u32 {
            engine.delete(i.to_string().as_bytes(), false).unwrap();
        }
        let generation_before = engine.header_snapshot().generation;
        engine.checkpoint().unwrap();
        assert!(engine.header_snapshot().generation > generation_before);
        for i in 25..50u32 {
            assert_eq!(engine.fetch(i.to_string().as_bytes()).unwrap(), b"v");
        }
        for i in 0..25u32 {
            assert!(engine.fetch(i.to_string().as_bytes()).is_err());
        }
    }

    #[test]
    fn checkpoint_shrinks_file_after_deletes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let engine = Engine::open(&path, OpenFlags::create(), Config::default()).unwrap();
        for i in 0..200u32 {
            engine.store(i.to_string().as_bytes(), &[0u8; 64], false).unwrap();
        }
        for i in 0..190u32 {
            engine.delete(i.to_string().as_bytes(), false).unwrap();
        }
        let before = engine.header_snapshot().current_size;
        engine.checkpoint().unwrap();
        let after = engine.header_snapshot().current_size;
        assert!(after < before);
    }
}
