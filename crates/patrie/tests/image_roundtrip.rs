// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com
//
// Persisted image: save -> load round trip, in-place freeze of a
// file-backed trie, and corruption detection.

use patrie::{ConcurrentLevel, Patricia, TrieConfig, TrieError};
use std::collections::BTreeMap;

fn build_pairs(n: u32) -> BTreeMap<Vec<u8>, [u8; 4]> {
    let mut rng = fastrand::Rng::with_seed(42);
    let mut pairs = BTreeMap::new();
    while pairs.len() < n as usize {
        let len = rng.usize(1..24);
        let key: Vec<u8> = (0..len).map(|_| rng.u8(b'a'..=b'f')).collect();
        let v = (pairs.len() as u32).to_le_bytes();
        pairs.insert(key, v);
    }
    pairs
}

#[test]
fn test_save_load_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("trie.img");

    let pairs = build_pairs(1_000);
    let trie = Patricia::new(
        TrieConfig::new(ConcurrentLevel::OneWriteMultiRead).value_size(4),
    )
    .expect("trie");
    {
        let mut w = trie.writer().expect("writer");
        for (k, v) in &pairs {
            assert!(w.insert(k, v).expect("insert"));
        }
    }
    trie.set_readonly().expect("freeze");
    trie.save(&path).expect("save");

    let loaded = Patricia::open(&path).expect("load");
    assert!(loaded.is_readonly());
    assert_eq!(loaded.num_keys(), pairs.len() as u64);
    assert_eq!(loaded.value_size(), 4);
    assert_eq!(loaded.max_key_len(), trie.max_key_len());

    let mut r = loaded.reader();
    for (k, v) in &pairs {
        assert_eq!(r.lookup(k), Some(&v[..]), "value mismatch for {k:?}");
    }
    assert!(r.lookup(b"not-there-at-all").is_none());

    // iteration order equals the b-tree order of the source pairs
    let mut c = loaded.cursor();
    assert!(c.seek_first());
    let mut it = pairs.iter();
    loop {
        let (k, v) = it.next().expect("loaded trie has extra keys");
        assert_eq!(c.key(), &k[..]);
        assert_eq!(c.value(), Some(&v[..]));
        if !c.next() {
            break;
        }
    }
    assert!(it.next().is_none(), "loaded trie lost keys");

    // a loaded trie rejects writers
    assert!(matches!(loaded.writer(), Err(TrieError::InvalidArgument(_))));
}

#[test]
fn test_file_backed_freeze_in_place() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("inplace.img");

    let pairs = build_pairs(500);
    {
        let trie = Patricia::new(
            TrieConfig::new(ConcurrentLevel::SingleThreadShared)
                .value_size(4)
                .max_memory(8 << 20)
                .file_path(&path),
        )
        .expect("trie");
        {
            let mut w = trie.writer().expect("writer");
            for (k, v) in &pairs {
                assert!(w.insert(k, v).expect("insert"));
            }
        }
        trie.set_readonly().expect("freeze");
    }

    // the truncated backing file is a loadable image
    let file_len = std::fs::metadata(&path).expect("meta").len();
    assert!(file_len < 8 << 20, "tail was not truncated");
    let loaded = Patricia::open(&path).expect("load");
    let mut r = loaded.reader();
    for (k, v) in &pairs {
        assert_eq!(r.lookup(k), Some(&v[..]));
    }
}

#[test]
fn test_appdata_survives_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("appdata.img");

    let trie = Patricia::new(TrieConfig::new(ConcurrentLevel::SingleThreadShared))
        .expect("trie");
    {
        let mut w = trie.writer().expect("writer");
        assert!(w.insert(b"key", b"").expect("insert"));
    }
    let ptr = trie.alloc_appdata(64).expect("appdata");
    // SAFETY: exclusive caller-owned range inside the slab.
    unsafe { std::ptr::copy_nonoverlapping(b"collaborator state".as_ptr(), ptr.as_ptr(), 18) };
    trie.set_readonly().expect("freeze");
    trie.save(&path).expect("save");

    let loaded = Patricia::open(&path).expect("load");
    let data = loaded.appdata().expect("appdata present");
    assert_eq!(&data[..18], b"collaborator state");
}

#[test]
fn test_corrupted_header_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("corrupt.img");

    let trie = Patricia::new(TrieConfig::new(ConcurrentLevel::SingleThreadStrict))
        .expect("trie");
    {
        let mut w = trie.writer().expect("writer");
        assert!(w.insert(b"k", b"").expect("insert"));
    }
    trie.save(&path).expect("save");

    // flip a counter byte inside the header: crc must catch it
    let mut bytes = std::fs::read(&path).expect("read");
    bytes[40] ^= 0xFF;
    std::fs::write(&path, &bytes).expect("write");
    assert!(matches!(
        Patricia::open(&path),
        Err(TrieError::Corruption(_))
    ));

    // and a clobbered magic as well
    let mut bytes = std::fs::read(&path).expect("read");
    bytes[40] ^= 0xFF; // restore
    bytes[0] = b'X';
    std::fs::write(&path, &bytes).expect("write");
    assert!(matches!(
        Patricia::open(&path),
        Err(TrieError::Corruption(_))
    ));

    // a truncated file cannot even present a header
    std::fs::write(&path, b"short").expect("write");
    assert!(Patricia::open(&path).is_err());
}
