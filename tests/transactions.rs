//! # Transaction Integration Tests
//!
//! Covers the transactional façade end to end: tid sequencing from 1,
//! index-name collisions, the insert/scan/commit/read-back flow, and
//! concurrent writer and reader transaction fleets over disjoint
//! indexes.

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use famkv::{AccessMode, HeapConfig, StatusCode, TransactionManager};

const BUFFER_SIZE: usize = 1024;

const ALPHANUM: &[u8] = b"0123456789!@#$%^&*ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn random_names(n: usize) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(0);

    (0..n)
        .map(|i| {
            let len = 2 + rng.gen_range(0..18);
            let tail: String = (0..len)
                .map(|_| ALPHANUM[rng.gen_range(0..ALPHANUM.len())] as char)
                .collect();
            // The positional prefix keeps names collision-free.
            format!("{i:02}-{tail}")
        })
        .collect()
}

fn manager() -> (tempfile::TempDir, TransactionManager) {
    let dir = tempdir().unwrap();
    let cfg = HeapConfig::new(dir.path()).capacity(64 << 20);
    let mgr = TransactionManager::new(&cfg).unwrap();
    (dir, mgr)
}

#[test]
fn transaction_basics_follow_the_contract() {
    let (_dir, mgr) = manager();
    let mut kbuf = [0u8; BUFFER_SIZE];
    let mut vbuf = [0u8; BUFFER_SIZE];

    // First transaction gets tid 1.
    let tid = mgr.begin();
    assert_eq!(tid, 1);

    mgr.create_index(tid, "A").unwrap();
    assert_eq!(
        mgr.create_index(tid, "A").unwrap_err().code(),
        StatusCode::AlreadyExists
    );

    let handle = mgr.open_index(tid, "A", AccessMode::ReadWrite).unwrap();
    mgr.insert_item(handle, tid, b"the-key", b"the-key").unwrap();

    let (klen, vlen) = mgr
        .scan_item(
            &mut kbuf, &mut vbuf, handle, tid, b"the-key", true, b"the-key", true,
        )
        .unwrap();
    assert_eq!(&kbuf[..klen], b"the-key");
    assert_eq!(&vbuf[..vlen], b"the-key");

    assert!(mgr.commit(tid).unwrap());

    // A second transaction gets tid 2 and observes the committed value.
    let tid = mgr.begin();
    assert_eq!(tid, 2);

    let handle = mgr.open_index(tid, "A", AccessMode::ReadWrite).unwrap();
    let (klen, vlen) = mgr
        .scan_item(
            &mut kbuf, &mut vbuf, handle, tid, b"the-key", true, b"the-key", true,
        )
        .unwrap();
    assert_eq!(&kbuf[..klen], b"the-key");
    assert_eq!(&vbuf[..vlen], b"the-key");

    assert!(mgr.commit(tid).unwrap());
}

#[test]
fn create_index_collisions_across_names() {
    let (_dir, mgr) = manager();
    let names = random_names(3);

    let tid = mgr.begin();

    for name in &names {
        mgr.create_index(tid, name).unwrap();
        assert_eq!(
            mgr.create_index(tid, name).unwrap_err().code(),
            StatusCode::AlreadyExists
        );
    }

    mgr.commit(tid).unwrap();
}

/// Three writer transactions create disjoint index pairs and populate
/// them concurrently; three reader transactions then verify every item.
#[test]
fn concurrent_writer_then_reader_transactions() {
    const WRITERS: usize = 3;

    let dir = tempdir().unwrap();
    let cfg = HeapConfig::new(dir.path()).capacity(64 << 20);
    let mgr = Arc::new(TransactionManager::new(&cfg).unwrap());

    // Six names per writer: two indexes and four keys.
    let names: Vec<String> = random_names(WRITERS * 6);

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let mgr = Arc::clone(&mgr);
            let names = names.clone();
            thread::spawn(move || {
                let base = w * 6;
                let tid = mgr.begin();

                for half in 0..2 {
                    let index = &names[base + half * 3];
                    let keys = &names[base + half * 3 + 1..base + half * 3 + 3];

                    mgr.create_index(tid, index).unwrap();
                    let handle = mgr.open_index(tid, index, AccessMode::ReadWrite).unwrap();

                    for key in keys {
                        mgr.insert_item(handle, tid, key.as_bytes(), key.as_bytes())
                            .unwrap();
                    }
                }

                assert!(mgr.commit(tid).unwrap());
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }

    let readers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let mgr = Arc::clone(&mgr);
            let names = names.clone();
            thread::spawn(move || {
                let base = w * 6;
                let tid = mgr.begin();
                let mut kbuf = [0u8; BUFFER_SIZE];
                let mut vbuf = [0u8; BUFFER_SIZE];

                for half in 0..2 {
                    let index = &names[base + half * 3];
                    let keys = &names[base + half * 3 + 1..base + half * 3 + 3];

                    let handle = mgr.open_index(tid, index, AccessMode::ReadOnly).unwrap();

                    for key in keys {
                        let (klen, vlen) = mgr
                            .scan_item(
                                &mut kbuf,
                                &mut vbuf,
                                handle,
                                tid,
                                key.as_bytes(),
                                true,
                                key.as_bytes(),
                                true,
                            )
                            .unwrap();

                        assert_eq!(&kbuf[..klen], key.as_bytes());
                        assert_eq!(&vbuf[..vlen], key.as_bytes());
                    }
                }

                assert!(mgr.commit(tid).unwrap());
            })
        })
        .collect();

    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn reset_between_runs_restores_a_clean_slate() {
    let (_dir, mgr) = manager();

    let tid = mgr.begin();
    mgr.create_index(tid, "left-over").unwrap();
    mgr.commit(tid).unwrap();

    mgr.reset();

    assert_eq!(mgr.begin(), 1, "reset SHOULD restart tids at 1");
    let err = mgr.open_index(1, "left-over", AccessMode::ReadOnly).unwrap_err();
    assert_eq!(err.code(), StatusCode::NotFound);
}
