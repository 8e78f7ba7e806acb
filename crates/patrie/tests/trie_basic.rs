// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com
//
// Single-threaded end-to-end behavior: insert/lookup across all structural
// operations, ordered iteration, lower bound, prefix seek, error surface.

use patrie::{ConcurrentLevel, Patricia, TrieConfig, TrieError};

fn set(level: ConcurrentLevel) -> std::sync::Arc<Patricia> {
    Patricia::new(TrieConfig::new(level)).expect("trie")
}

#[test]
fn test_basic_set_and_iteration_order() {
    let trie = set(ConcurrentLevel::SingleThreadStrict);
    let mut w = trie.writer().expect("writer");
    let keys: [&[u8]; 6] = [b"", b"a", b"ab", b"abc", b"abd", b"b"];
    for k in keys {
        assert!(w.insert(k, b"").expect("insert"), "created {k:?}");
    }
    for k in keys {
        assert!(w.lookup(k).is_some(), "present {k:?}");
    }
    assert!(w.lookup(b"ac").is_none());
    assert!(w.lookup(b"abe").is_none());
    assert_eq!(trie.num_keys(), 6);

    let mut c = trie.cursor();
    assert!(c.seek_first());
    let mut seen = Vec::new();
    loop {
        seen.push(c.key().to_vec());
        if !c.next() {
            break;
        }
    }
    assert_eq!(seen, keys.map(<[u8]>::to_vec));

    // and the exact inverse
    assert!(c.seek_last());
    let mut rev = Vec::new();
    loop {
        rev.push(c.key().to_vec());
        if !c.prev() {
            break;
        }
    }
    rev.reverse();
    assert_eq!(rev, seen);
}

#[test]
fn test_zpath_split_shares_prefix_node() {
    let trie = set(ConcurrentLevel::SingleThreadShared);
    let mut w = trie.writer().expect("writer");
    assert!(w.insert(b"abcdefghij", b"").expect("insert"));
    assert!(w.insert(b"abcdx", b"").expect("insert"));
    assert_eq!(trie.num_keys(), 2);
    // the divergence inside the z-path is a fork, not a split
    assert_eq!(trie.stat().n_fork, 1);
    assert!(w.lookup(b"abcdefghij").is_some());
    assert!(w.lookup(b"abcdx").is_some());
    assert!(w.lookup(b"abcd").is_none());

    // a key that is a proper prefix ending inside the z-path splits it
    assert!(w.insert(b"ab", b"").expect("insert"));
    assert_eq!(trie.stat().n_split, 1);
    assert!(w.lookup(b"ab").is_some());
    assert!(w.lookup(b"abcdefghij").is_some());
}

#[test]
fn test_fork_mid_zpath_and_lower_bound() {
    let trie = set(ConcurrentLevel::SingleThreadShared);
    let mut w = trie.writer().expect("writer");
    assert!(w.insert(b"abczzz", b"").expect("insert"));
    assert!(w.insert(b"abcyyy", b"").expect("insert"));
    assert_eq!(trie.num_keys(), 2);

    let mut c = trie.cursor();
    assert!(c.seek_lower_bound(b"abcz"));
    assert_eq!(c.key(), b"abczzz");
    assert!(!c.seek_lower_bound(b"abd"));
    assert!(c.seek_lower_bound(b"abc"));
    assert_eq!(c.key(), b"abcyyy");
    assert!(c.next());
    assert_eq!(c.key(), b"abczzz");
    assert!(!c.next());
}

#[test]
fn test_fast_root_all_single_bytes() {
    let trie = set(ConcurrentLevel::OneWriteMultiRead);
    let mut w = trie.writer().expect("writer");
    let mut bytes: Vec<u8> = (0..=255).collect();
    fastrand::seed(0x5eed);
    fastrand::shuffle(&mut bytes);
    for b in &bytes {
        assert!(w.insert(&[*b], b"").expect("insert"));
    }
    assert_eq!(trie.num_keys(), 256);
    for b in 0..=255u8 {
        assert!(w.lookup(&[b]).is_some());
        assert!(w.lookup(&[b, b]).is_none());
    }
    // every root edge was a direct dense-root update
    assert_eq!(trie.stat().n_add_state_move, 256);

    let mut c = trie.cursor();
    assert!(c.seek_first());
    let mut prev = c.key().to_vec();
    while c.next() {
        assert!(c.key() > &prev[..]);
        prev = c.key().to_vec();
    }
    assert_eq!(prev, vec![255]);
}

#[test]
fn test_wide_fanout_grows_through_every_variant() {
    // all 256 second bytes under one root edge: the interior node walks
    // tag 1 -> 2 -> ... -> 7 -> 8 and keeps growing the bitmap variant
    let trie = set(ConcurrentLevel::SingleThreadStrict);
    let mut w = trie.writer().expect("writer");
    let mut bytes: Vec<u8> = (0..=255).collect();
    fastrand::seed(7);
    fastrand::shuffle(&mut bytes);
    for b in &bytes {
        assert!(w.insert(&[b'z', *b], b"").expect("insert"));
    }
    assert!(w.insert(b"z", b"").expect("insert"));
    assert_eq!(trie.num_keys(), 257);
    for b in 0..=255u8 {
        assert!(w.lookup(&[b'z', b]).is_some(), "missing z{b:02x}");
    }

    let mut c = trie.cursor();
    assert!(c.seek_first());
    assert_eq!(c.key(), b"z");
    let mut count = 1;
    let mut prev = c.key().to_vec();
    while c.next() {
        assert!(c.key() > &prev[..]);
        prev = c.key().to_vec();
        count += 1;
    }
    assert_eq!(count, 257);
    assert_eq!(prev, b"z\xff");
}

#[test]
fn test_long_keys_chain_over_zpath_cap() {
    let trie = set(ConcurrentLevel::SingleThreadStrict);
    let mut w = trie.writer().expect("writer");
    let long_a = vec![b'a'; 600];
    let long_b = {
        let mut k = vec![b'a'; 600];
        k[599] = b'b';
        k
    };
    assert!(w.insert(&long_a, b"").expect("insert"));
    assert!(w.insert(&long_b, b"").expect("insert"));
    assert!(!w.insert(&long_a, b"").expect("insert"), "duplicate");
    assert!(w.lookup(&long_a).is_some());
    assert!(w.lookup(&long_b).is_some());
    assert!(w.lookup(&long_a[..599]).is_none());
    assert_eq!(trie.max_key_len(), 600);

    let mut c = trie.cursor();
    assert!(c.seek_first());
    assert_eq!(c.key(), &long_a[..]);
    assert!(c.next());
    assert_eq!(c.key(), &long_b[..]);
    assert!(!c.next());
}

#[test]
fn test_values_and_duplicate_semantics() {
    let trie =
        Patricia::new(TrieConfig::new(ConcurrentLevel::SingleThreadShared).value_size(4))
            .expect("trie");
    let mut w = trie.writer().expect("writer");
    assert!(w.insert(b"k1", &11u32.to_le_bytes()).expect("insert"));
    assert!(w.insert(b"k2", &22u32.to_le_bytes()).expect("insert"));
    // duplicate insert keeps the stored value and reports "existed"
    assert!(!w.insert(b"k1", &99u32.to_le_bytes()).expect("insert"));
    assert_eq!(w.value(), Some(&11u32.to_le_bytes()[..]));
    assert_eq!(w.lookup(b"k1"), Some(&11u32.to_le_bytes()[..]));
    assert_eq!(w.lookup(b"k2"), Some(&22u32.to_le_bytes()[..]));

    // value size is validated
    assert!(matches!(
        w.insert(b"k3", b"toolong-val"),
        Err(TrieError::InvalidArgument(_))
    ));
}

#[test]
fn test_seek_max_prefix() {
    let trie = set(ConcurrentLevel::SingleThreadShared);
    let mut w = trie.writer().expect("writer");
    for k in [&b"ab"[..], b"abcde", b"abcdefg", b"x"] {
        assert!(w.insert(k, b"").expect("insert"));
    }
    let mut c = trie.cursor();
    // longest stored prefix of "abcdez" is "abcde"
    c.seek_max_prefix(b"abcdez");
    assert!(c.is_valid());
    assert_eq!(c.key(), b"abcde");
    // and the cursor can walk on from there
    assert!(c.next());
    assert_eq!(c.key(), b"abcdefg");

    c.seek_max_prefix(b"zzz");
    assert!(!c.is_valid());
}

#[test]
fn test_out_of_memory_surfaces_and_preserves_structure() {
    // smallest possible reservation; fill it up
    let trie = Patricia::new(
        TrieConfig::new(ConcurrentLevel::SingleThreadStrict).max_memory(1),
    )
    .expect("trie");
    let mut w = trie.writer().expect("writer");
    let mut inserted = Vec::new();
    let mut hit_cap = false;
    for i in 0..200_000u32 {
        let key = format!("key-{i:08}-{}", "p".repeat(40));
        match w.insert(key.as_bytes(), b"") {
            Ok(created) => {
                assert!(created);
                inserted.push(key);
            }
            Err(TrieError::OutOfMemory) => {
                hit_cap = true;
                break;
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert!(hit_cap, "cap was never reached");
    assert!(!inserted.is_empty());
    // everything inserted before the failure is still intact
    for key in &inserted {
        assert!(w.lookup(key.as_bytes()).is_some());
    }
}

#[test]
fn test_readonly_transition_rejects_writes() {
    let trie = set(ConcurrentLevel::OneWriteMultiRead);
    {
        let mut w = trie.writer().expect("writer");
        assert!(w.insert(b"stay", b"").expect("insert"));
    }
    trie.set_readonly().expect("freeze");
    assert!(trie.is_readonly());
    assert!(matches!(trie.writer(), Err(TrieError::InvalidArgument(_))));
    let mut r = trie.reader();
    assert!(r.lookup(b"stay").is_some());
    // idempotent
    trie.set_readonly().expect("freeze again");
}

#[test]
fn test_single_writer_levels_admit_one_writer() {
    let trie = set(ConcurrentLevel::OneWriteMultiRead);
    let _w = trie.writer().expect("writer");
    assert!(matches!(trie.writer(), Err(TrieError::LogicError(_))));
}

#[test]
fn test_appdata_roundtrip_in_memory() {
    let trie = set(ConcurrentLevel::SingleThreadStrict);
    let ptr = trie.alloc_appdata(100).expect("appdata");
    // SAFETY: exclusive 100-byte caller range inside the slab.
    unsafe { std::ptr::copy_nonoverlapping([0xABu8; 100].as_ptr(), ptr.as_ptr(), 100) };
    let data = trie.appdata().expect("present");
    assert!(data.len() >= 100);
    assert!(data[..100].iter().all(|&b| b == 0xAB));
    assert!(trie.alloc_appdata(8).is_err(), "one-shot");
}
