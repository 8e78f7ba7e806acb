// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com
//
// Multi-writer behavior: linearizable insert across racing writers and
// reader pinning under concurrent insertion.

use patrie::{ConcurrentLevel, Patricia, TrieConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const WRITERS: usize = 4;
const KEYS_PER_WRITER: usize = 100_000;

fn key_of(tid: u8, i: u32, salt: u32) -> [u8; 8] {
    // first five bytes make the key unique, the rest vary the shape
    [
        tid,
        (i >> 16) as u8,
        (i >> 8) as u8,
        i as u8,
        0x7E,
        salt as u8,
        (salt >> 8) as u8,
        (salt >> 16) as u8,
    ]
}

#[test]
fn test_concurrent_distinct_inserts() {
    let trie = Patricia::new(
        TrieConfig::new(ConcurrentLevel::MultiWriteMultiRead)
            .value_size(4)
            .max_memory(256 << 20),
    )
    .expect("trie");

    let created_total = AtomicU64::new(0);
    std::thread::scope(|s| {
        for tid in 0..WRITERS as u8 {
            let trie = Arc::clone(&trie);
            let created_total = &created_total;
            s.spawn(move || {
                let mut rng = fastrand::Rng::with_seed(0xC0FFEE + u64::from(tid));
                let mut w = trie.writer().expect("writer");
                let mut created = 0u64;
                for i in 0..KEYS_PER_WRITER as u32 {
                    let key = key_of(tid, i, rng.u32(..));
                    if w.insert(&key, &u32::from(tid).to_le_bytes()).expect("insert") {
                        created += 1;
                    }
                }
                created_total.fetch_add(created, Ordering::Relaxed);
            });
        }
    });

    let expected = (WRITERS * KEYS_PER_WRITER) as u64;
    assert_eq!(created_total.load(Ordering::Relaxed), expected);
    assert_eq!(trie.num_keys(), expected);

    let mut r = trie.reader();
    for tid in 0..WRITERS as u8 {
        let mut rng = fastrand::Rng::with_seed(0xC0FFEE + u64::from(tid));
        for i in 0..KEYS_PER_WRITER as u32 {
            let key = key_of(tid, i, rng.u32(..));
            let v = r.lookup(&key).expect("present after join");
            assert_eq!(v, u32::from(tid).to_le_bytes());
        }
    }
}

#[test]
fn test_concurrent_same_keys_linearize() {
    let trie = Patricia::new(
        TrieConfig::new(ConcurrentLevel::MultiWriteMultiRead)
            .value_size(4)
            .max_memory(64 << 20),
    )
    .expect("trie");

    const SHARED_KEYS: u32 = 10_000;
    let created_total = AtomicU64::new(0);
    std::thread::scope(|s| {
        for tid in 0..WRITERS as u8 {
            let trie = Arc::clone(&trie);
            let created_total = &created_total;
            s.spawn(move || {
                let mut w = trie.writer().expect("writer");
                let mut created = 0u64;
                for i in 0..SHARED_KEYS {
                    let key = format!("shared/{i:06}");
                    if w.insert(key.as_bytes(), &i.to_le_bytes()).expect("insert") {
                        created += 1;
                    } else {
                        // losers must observe the winner's value slot
                        assert_eq!(w.value(), Some(&i.to_le_bytes()[..]));
                    }
                }
                created_total.fetch_add(created, Ordering::Relaxed);
            });
        }
    });

    // exactly one writer created each key
    assert_eq!(created_total.load(Ordering::Relaxed), u64::from(SHARED_KEYS));
    assert_eq!(trie.num_keys(), u64::from(SHARED_KEYS));
    let mut r = trie.reader();
    for i in 0..SHARED_KEYS {
        let key = format!("shared/{i:06}");
        assert_eq!(r.lookup(key.as_bytes()), Some(&i.to_le_bytes()[..]));
    }
}

#[test]
fn test_reader_pinning_during_inserts() {
    let trie = Patricia::new(
        TrieConfig::new(ConcurrentLevel::MultiWriteMultiRead)
            .value_size(4)
            .max_memory(64 << 20),
    )
    .expect("trie");

    const FIRST: u32 = 10_000;
    const SECOND: u32 = 10_000;
    let even_key = |i: u32| format!("pin/{:06}", i * 2);
    let odd_key = |i: u32| format!("pin/{:06}", i * 2 + 1);

    {
        let mut w = trie.writer().expect("writer");
        for i in 0..FIRST {
            assert!(w.insert(even_key(i).as_bytes(), &i.to_le_bytes()).expect("insert"));
        }
    }

    // cursor pins its epoch, then a second writer races ahead of it
    let mut c = trie.cursor();
    assert!(c.seek_first());
    let writer_handle = {
        let trie = Arc::clone(&trie);
        std::thread::spawn(move || {
            let mut w = trie.writer().expect("writer");
            for i in 0..SECOND {
                assert!(w.insert(odd_key(i).as_bytes(), &i.to_le_bytes()).expect("insert"));
            }
        })
    };

    let mut visited = Vec::new();
    loop {
        let key = c.key().to_vec();
        // the bytes behind a visited key must still be the written value
        let value = c.value().expect("cursor on a final node").to_vec();
        let idx: u32 = std::str::from_utf8(&key[4..]).expect("utf8").parse().expect("num");
        assert_eq!(value, (idx / 2).to_le_bytes());
        visited.push(key);
        if visited.len() % 64 == 0 {
            std::thread::yield_now();
        }
        if !c.next() {
            break;
        }
    }
    writer_handle.join().expect("writer thread");

    // strictly ascending traversal ...
    for pair in visited.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    // ... covering at least every key of the first batch
    let evens: Vec<Vec<u8>> = (0..FIRST).map(|i| even_key(i).into_bytes()).collect();
    let visited_set: std::collections::BTreeSet<&[u8]> =
        visited.iter().map(Vec::as_slice).collect();
    for k in &evens {
        assert!(visited_set.contains(k.as_slice()), "missing {k:?}");
    }

    // a fresh cursor sees everything
    drop(c);
    let mut c2 = trie.cursor();
    assert!(c2.seek_first());
    let mut n = 1;
    while c2.next() {
        n += 1;
    }
    assert_eq!(n, FIRST + SECOND);
}

#[test]
fn test_token_release_acquire_cycles_under_load() {
    let trie = Patricia::new(
        TrieConfig::new(ConcurrentLevel::MultiWriteMultiRead).max_memory(16 << 20),
    )
    .expect("trie");

    std::thread::scope(|s| {
        let writer = {
            let trie = Arc::clone(&trie);
            s.spawn(move || {
                let mut w = trie.writer().expect("writer");
                for i in 0..20_000u32 {
                    w.insert(&i.to_be_bytes(), b"").expect("insert");
                }
            })
        };
        for seed in 0..2u64 {
            let trie = Arc::clone(&trie);
            s.spawn(move || {
                let mut rng = fastrand::Rng::with_seed(seed);
                let mut r = trie.reader();
                for _ in 0..2_000 {
                    let probe = rng.u32(..20_000);
                    let _ = r.lookup(&probe.to_be_bytes());
                    match rng.u8(..3) {
                        0 => {
                            r.release();
                            r.acquire();
                        }
                        1 => {
                            r.idle();
                            r.acquire();
                        }
                        _ => {}
                    }
                }
            });
        }
        writer.join().expect("writer thread");
    });

    assert_eq!(trie.num_keys(), 20_000);
}
