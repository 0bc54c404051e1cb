//! Process-wide handle registry.
//!
//! Deduplicates [`Engine`] instances per canonical path so that two callers
//! opening the same database within one process share the same mapped
//! file and in-process lock, rather than racing two independent mmaps of
//! the same bytes. Exposed both as an instantiable [`Registry`] (for tests
//! that want a clean slate) and as a process-wide singleton via [`global`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::{Config, OpenFlags};
use crate::engine::Engine;
use crate::error::{Error, Result};

struct Entry {
    engine: Arc<Engine>,
    refcount: usize,
}

/// A refcounted map from canonical path to open [`Engine`].
#[derive(Default)]
pub struct Registry {
    handles: Mutex<HashMap<PathBuf, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `path`, returning the existing handle (with its refcount
    /// bumped) if this process already has it open, or creating a fresh
    /// one otherwise.
    pub fn open(&self, path: &Path, flags: OpenFlags, config: Config) -> Result<Arc<Engine>> {
        let key = canonical_key(path)?;
        let mut handles = self.handles.lock();
        if let Some(entry) = handles.get_mut(&key) {
            entry.refcount += 1;
            return Ok(entry.engine.clone());
        }
        let engine = Arc::new(Engine::open(path, flags, config)?);
        handles.insert(key, Entry { engine: engine.clone(), refcount: 1 });
        Ok(engine)
    }

    /// Decrements the refcount for `path`'s handle, dropping it from the
    /// registry once it reaches zero. The underlying `Engine` is only torn
    /// down once every clone of the returned `Arc` has also been dropped.
    pub fn close(&self, path: &Path) -> Result<()> {
        let key = canonical_key(path)?;
        let mut handles = self.handles.lock();
        if let Some(entry) = handles.get_mut(&key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                handles.remove(&key);
            }
        }
        Ok(())
    }

    /// Current refcount for `path`, or 0 if it isn't open through this
    /// registry.
    pub fn refcount(&self, path: &Path) -> Result<usize> {
        let key = canonical_key(path)?;
        Ok(self.handles.lock().get(&key).map_or(0, |e| e.refcount))
    }

    /// Drops every tracked handle regardless of refcount. Test hook.
    pub fn clear(&self) {
        self.handles.lock().clear();
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry shared by callers that don't keep their own.
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(Registry::new)
}

/// Canonicalizes `path` for use as a registry key. Falls back to
/// canonicalizing the parent directory and rejoining the file name when
/// `path` itself doesn't exist yet (the common case for a first `create`
/// open), since `fs::canonicalize` requires the full path to exist.
fn canonical_key(path: &Path) -> Result<PathBuf> {
    if let Ok(canon) = std::fs::canonicalize(path) {
        return Ok(canon);
    }
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().ok_or_else(|| {
        Error::io(path, std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"))
    })?;
    let canon_parent = std::fs::canonicalize(parent).map_err(|e| Error::io(path, e))?;
    Ok(canon_parent.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    #[test]
    fn reopening_same_path_shares_the_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let registry = Registry::new();
        let a = registry.open(&path, OpenFlags::create(), Config::default()).unwrap();
        let b = registry.open(&path, OpenFlags::create(), Config::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.refcount(&path).unwrap(), 2);
    }

    #[test]
    fn closing_drops_the_entry_at_zero_refcount() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let registry = Registry::new();
        registry.open(&path, OpenFlags::create(), Config::default()).unwrap();
        registry.open(&path, OpenFlags::create(), Config::default()).unwrap();
        registry.close(&path).unwrap();
        assert_eq!(registry.refcount(&path).unwrap(), 1);
        registry.close(&path).unwrap();
        assert_eq!(registry.refcount(&path).unwrap(), 0);
    }

    #[test]
    fn distinct_paths_get_distinct_handles() {
        let dir = tempdir().unwrap();
        let registry = Registry::new();
        let a = registry.open(&dir.path().join("a"), OpenFlags::create(), Config::default()).unwrap();
        let b = registry.open(&dir.path().join("b"), OpenFlags::create(), Config::default()).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
