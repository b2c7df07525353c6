use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crossbeam_utils::thread;
use tempfile::TempDir;

use romba::{Bitcask, KvStore, RombaError, StoreOptions};

fn open(dir: &Path, key_size: u16) -> Bitcask {
    Bitcask::open(dir, StoreOptions::new(key_size)).unwrap()
}

fn key(n: u8) -> [u8; 4] {
    [n, n.wrapping_add(1), n.wrapping_add(2), n.wrapping_add(3)]
}

#[test]
fn set_get_overwrite_delete() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 4);

    assert_eq!(store.get(&key(1)).unwrap(), None);
    store.set(&key(1), b"one").unwrap();
    assert_eq!(store.get(&key(1)).unwrap(), Some(b"one".to_vec()));
    assert!(store.exists(&key(1)).unwrap());

    store.set(&key(1), b"uno").unwrap();
    assert_eq!(store.get(&key(1)).unwrap(), Some(b"uno".to_vec()));
    assert_eq!(store.len(), 1);

    store.delete(&key(1)).unwrap();
    assert_eq!(store.get(&key(1)).unwrap(), None);
    assert!(!store.exists(&key(1)).unwrap());

    // deleting an absent key is a no-op
    store.delete(&key(1)).unwrap();
}

#[test]
fn append_is_idempotent_per_value() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 4);

    store.append(&key(7), b"v1").unwrap();
    store.append(&key(7), b"v1").unwrap();
    store.append(&key(7), b"v2").unwrap();

    let mut values = Vec::new();
    store
        .iterate(&mut |k, v| {
            assert_eq!(k, key(7));
            values.push(v.to_vec());
            Ok(true)
        })
        .unwrap();
    values.sort();
    assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec()]);
}

#[test]
fn key_suffixes_are_ordered_and_complete() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 8);

    let prefix = [0xab, 0xcd];
    let suffixes: [&[u8; 6]; 3] = [b"zzzzzz", b"aaaaaa", b"mmmmmm"];
    for suffix in suffixes {
        let mut k = prefix.to_vec();
        k.extend_from_slice(suffix);
        store.set(&k, &[1]).unwrap();
    }
    // a key under another prefix must not show up
    store.set(b"xx123456", &[1]).unwrap();

    let joined = store.key_suffixes_for(&prefix).unwrap();
    assert_eq!(joined.len(), 6 * 3);
    assert_eq!(&joined, b"aaaaaammmmmmzzzzzz");

    assert!(store.key_suffixes_for(b"nothere!").unwrap().is_empty());
}

#[test]
fn batch_is_invisible_until_written() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 4);
    store.set(&key(9), b"stale").unwrap();

    let mut batch = store.start_batch();
    batch.set(&key(1), b"one");
    batch.append(&key(2), b"two");
    batch.append(&key(2), b"two"); // in-batch duplicate collapses
    batch.delete(&key(9));
    assert!(batch.size() > 0);

    assert_eq!(store.get(&key(1)).unwrap(), None);
    assert_eq!(store.get(&key(9)).unwrap(), Some(b"stale".to_vec()));

    store.write_batch(batch).unwrap();

    assert_eq!(store.get(&key(1)).unwrap(), Some(b"one".to_vec()));
    assert_eq!(store.get(&key(2)).unwrap(), Some(b"two".to_vec()));
    assert_eq!(store.get(&key(9)).unwrap(), None);
}

#[test]
fn reopen_after_clean_close_uses_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 4);
    for n in 0..50u8 {
        store.set(&key(n), &[n]).unwrap();
    }
    store.close().unwrap();
    assert!(matches!(store.set(&key(0), b"x"), Err(RombaError::Closed)));

    // the snapshot pair is on disk
    assert!(dir.path().join("keydir_0").is_file());
    assert!(dir.path().join("keydir-sha1_0").is_file());

    let store = open(dir.path(), 4);
    assert_eq!(store.len(), 50);
    for n in 0..50u8 {
        assert_eq!(store.get(&key(n)).unwrap(), Some(vec![n]));
    }
}

#[test]
fn reopen_without_close_rebuilds_from_logs() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 4);
    store.set(&key(1), b"one").unwrap();
    store.append(&key(2), b"a").unwrap();
    store.append(&key(2), b"b").unwrap();
    store.set(&key(3), b"gone").unwrap();
    store.delete(&key(3)).unwrap();
    drop(store); // simulated crash: no snapshot written

    let store = open(dir.path(), 4);
    assert_eq!(store.get(&key(1)).unwrap(), Some(b"one".to_vec()));
    assert_eq!(store.get(&key(2)).unwrap(), Some(b"a".to_vec()));
    assert_eq!(store.get(&key(3)).unwrap(), None);
    assert_eq!(store.len(), 2);
}

#[test]
fn torn_tail_is_truncated() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 4);
    store.set(&key(1), b"one").unwrap();
    store.set(&key(2), b"two").unwrap();
    drop(store);

    // half a record at the tail: tag, key size, then only two key bytes
    let mut file = OpenOptions::new()
        .append(true)
        .open(dir.path().join("data.0"))
        .unwrap();
    file.write_all(&[0, 0, 4, 0xde, 0xad]).unwrap();
    drop(file);

    let store = open(dir.path(), 4);
    assert_eq!(store.get(&key(1)).unwrap(), Some(b"one".to_vec()));
    assert_eq!(store.get(&key(2)).unwrap(), Some(b"two".to_vec()));
    assert_eq!(store.len(), 2);
}

#[test]
fn corrupt_snapshot_falls_back_to_logs() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 4);
    for n in 0..10u8 {
        store.set(&key(n), &[n]).unwrap();
    }
    store.close().unwrap();

    // flip a byte in the snapshot; the sha1 sibling no longer matches
    let snap = dir.path().join("keydir_0");
    let mut bytes = std::fs::read(&snap).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;
    std::fs::write(&snap, bytes).unwrap();

    let store = open(dir.path(), 4);
    assert_eq!(store.len(), 10);
    for n in 0..10u8 {
        assert_eq!(store.get(&key(n)).unwrap(), Some(vec![n]));
    }
}

#[test]
fn compaction_drops_stale_segments() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 4);
    for round in 0..5u8 {
        for n in 0..40u8 {
            store.set(&key(n), &[round, n]).unwrap();
        }
    }
    store.delete(&key(0)).unwrap();
    let before = store.stats().unwrap();
    assert!(before.orphaned > 0);

    store.compact().unwrap();

    let after = store.stats().unwrap();
    assert_eq!(after.keys, 39);
    assert_eq!(after.orphaned, 0);
    assert!(after.disk_bytes < before.disk_bytes);
    for n in 1..40u8 {
        assert_eq!(store.get(&key(n)).unwrap(), Some(vec![4, n]));
    }

    // survives a reopen
    store.close().unwrap();
    let store = open(dir.path(), 4);
    assert_eq!(store.len(), 39);
    assert_eq!(store.get(&key(5)).unwrap(), Some(vec![4, 5]));
}

#[test]
fn refresh_sweeps_unseen_keys() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 4);
    store.set(&key(1), b"a").unwrap();
    store.set(&key(2), b"b").unwrap();
    store.set(&key(3), b"c").unwrap();

    store.begin_refresh().unwrap();
    store.set(&key(2), b"b2").unwrap();

    assert_eq!(store.end_refresh().unwrap(), 2);
    assert_eq!(store.len(), 1);
    assert_eq!(store.get(&key(2)).unwrap(), Some(b"b2".to_vec()));
    assert_eq!(store.get(&key(1)).unwrap(), None);

    // without a begin, end is a no-op
    assert_eq!(store.end_refresh().unwrap(), 0);
}

#[test]
fn concurrent_readers_and_writers() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 4);

    thread::scope(|scope| {
        for t in 0..4u8 {
            let store = store.clone();
            scope.spawn(move |_| {
                for n in 0..50u8 {
                    let k = [t, n, 0, 0];
                    store.set(&k, &[t, n]).unwrap();
                    assert_eq!(store.get(&k).unwrap(), Some(vec![t, n]));
                }
            });
        }
    })
    .unwrap();

    assert_eq!(store.len(), 200);
    for t in 0..4u8 {
        for n in 0..50u8 {
            assert_eq!(store.get(&[t, n, 0, 0]).unwrap(), Some(vec![t, n]));
        }
    }
}
