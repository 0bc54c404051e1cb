//! End-to-end scenarios exercised against a real file on disk, as opposed
//! to the component-level invariants covered by each module's inline
//! `#[cfg(test)]` block.

use tempfile::tempdir;
use twoskip_core::{check_consistency, Config, Engine, Error, OpenFlags};

#[test]
fn basic_insert_fetch_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    {
        let db = Engine::open(&path, OpenFlags::create(), Config::default()).unwrap();
        db.store(b"hello", b"world", false).unwrap();
    }
    let db = Engine::open(&path, OpenFlags::default(), Config::default()).unwrap();
    assert_eq!(db.fetch(b"hello").unwrap(), b"world");
    assert!(matches!(db.fetch(b"absent").unwrap_err(), Error::NotFound));
}

#[test]
fn ordered_iteration_visits_keys_in_order() {
    let dir = tempdir().unwrap();
    let db = Engine::open(&dir.path().join("db"), OpenFlags::create(), Config::default()).unwrap();
    for k in ["c", "a", "b", "d"] {
        db.store(k.as_bytes(), k.as_bytes(), false).unwrap();
    }
    let mut seen = Vec::new();
    db.foreach(
        b"",
        |_| true,
        |k, _v| {
            seen.push(String::from_utf8(k.to_vec()).unwrap());
            Ok(0)
        },
    )
    .unwrap();
    assert_eq!(seen, vec!["a", "b", "c", "d"]);
}

#[test]
fn delete_and_overwrite_round_trip() {
    let dir = tempdir().unwrap();
    let db = Engine::open(&dir.path().join("db"), OpenFlags::create(), Config::default()).unwrap();
    db.store(b"k", b"v1", false).unwrap();
    db.store(b"k", b"v2", true).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"v2");
    db.delete(b"k", false).unwrap();
    assert!(matches!(db.fetch(b"k").unwrap_err(), Error::NotFound));
}

#[test]
fn crash_before_commit_is_invisible_after_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let pre_txn_size = {
        let db = Engine::open(&path, OpenFlags::create(), Config::default()).unwrap();
        db.store(b"seed", b"v", false).unwrap();
        std::fs::metadata(&path).unwrap().len()
    };

    // Begin a transaction and write two records, but never commit — the
    // in-process equivalent of a crash between the appends and the COMMIT
    // record that would make them durable. Dropping the transaction token
    // without committing leaves the header's dirty flag set on disk, so the
    // next open runs recovery exactly as it would after a real crash.
    {
        let db = Engine::open(&path, OpenFlags::default(), Config::default()).unwrap();
        let mut txn = db.begin();
        db.store_in(&mut txn, b"x", b"1", false).unwrap();
        db.store_in(&mut txn, b"y", b"2", false).unwrap();
    }

    let db = Engine::open(&path, OpenFlags::default(), Config::default()).unwrap();
    assert!(matches!(db.fetch(b"x").unwrap_err(), Error::NotFound));
    assert!(matches!(db.fetch(b"y").unwrap_err(), Error::NotFound));
    assert_eq!(db.fetch(b"seed").unwrap(), b"v");
    assert_eq!(std::fs::metadata(&path).unwrap().len(), pre_txn_size);
}

#[test]
fn extended_length_key_round_trips_through_the_engine() {
    let dir = tempdir().unwrap();
    let db = Engine::open(&dir.path().join("db"), OpenFlags::create(), Config::default()).unwrap();
    let key = vec![b'k'; 70_000];
    let value = vec![b'v'; 70_005];
    db.store(&key, &value, false).unwrap();
    assert_eq!(db.fetch(&key).unwrap(), value);
    assert_eq!(check_consistency(&db).unwrap(), 1);
}

#[test]
fn checkpoint_compacts_after_overwrites() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let db = Engine::open(&path, OpenFlags::create(), Config::default()).unwrap();
    for i in 0..10_000u32 {
        db.store(i.to_string().as_bytes(), b"v1", false).unwrap();
    }
    for i in 0..10_000u32 {
        db.store(i.to_string().as_bytes(), b"v2", true).unwrap();
    }
    let size_before = std::fs::metadata(&path).unwrap().len();

    db.checkpoint().unwrap();

    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before);
    assert_eq!(check_consistency(&db).unwrap(), 10_000);
    for i in 0..10_000u32 {
        assert_eq!(db.fetch(i.to_string().as_bytes()).unwrap(), b"v2");
    }
}
