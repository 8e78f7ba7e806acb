// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::cast_possible_truncation)] // bench parameters
#![allow(clippy::missing_panics_doc)] // benches panic on failure

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use patrie::{ConcurrentLevel, Patricia, TrieConfig};
use std::sync::Arc;

fn random_keys(n: usize, seed: u64) -> Vec<[u8; 12]> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..n)
        .map(|i| {
            let mut k = [0u8; 12];
            k[..4].copy_from_slice(&(i as u32).to_be_bytes());
            rng.fill(&mut k[4..]);
            k
        })
        .collect()
}

/// Insert throughput, single writer, multi-writer engine.
fn bench_insert_mw(c: &mut Criterion) {
    let keys = random_keys(100_000, 1);
    c.bench_function("insert_mw_100k", |b| {
        b.iter_batched(
            || {
                Patricia::new(
                    TrieConfig::new(ConcurrentLevel::MultiWriteMultiRead)
                        .value_size(4)
                        .max_memory(64 << 20),
                )
                .expect("trie")
            },
            |trie| {
                let mut w = trie.writer().expect("writer");
                for k in &keys {
                    w.insert(k, &4u32.to_le_bytes()).expect("insert");
                }
                trie
            },
            BatchSize::LargeInput,
        );
    });
}

/// Point lookup, hit and miss.
fn bench_lookup(c: &mut Criterion) {
    let keys = random_keys(100_000, 2);
    let trie = Patricia::new(
        TrieConfig::new(ConcurrentLevel::OneWriteMultiRead)
            .value_size(4)
            .max_memory(64 << 20),
    )
    .expect("trie");
    {
        let mut w = trie.writer().expect("writer");
        for k in &keys {
            w.insert(k, &4u32.to_le_bytes()).expect("insert");
        }
    }
    let trie = Arc::clone(&trie);
    let mut r = trie.reader();
    let mut i = 0usize;
    c.bench_function("lookup_hit", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(r.lookup(&keys[i]))
        });
    });
    let miss = *b"nothere-miss";
    c.bench_function("lookup_miss", |b| {
        b.iter(|| black_box(r.lookup(&miss)));
    });
}

/// Full ordered scan through the cursor.
fn bench_cursor_scan(c: &mut Criterion) {
    let keys = random_keys(50_000, 3);
    let trie = Patricia::new(
        TrieConfig::new(ConcurrentLevel::OneWriteMultiRead).max_memory(64 << 20),
    )
    .expect("trie");
    {
        let mut w = trie.writer().expect("writer");
        for k in &keys {
            w.insert(k, b"").expect("insert");
        }
    }
    c.bench_function("cursor_scan_50k", |b| {
        b.iter(|| {
            let mut cur = trie.cursor();
            let mut n = 0usize;
            if cur.seek_first() {
                n += 1;
                while cur.next() {
                    n += 1;
                }
            }
            black_box(n)
        });
    });
}

criterion_group!(benches, bench_insert_mw, bench_lookup, bench_cursor_scan);
criterion_main!(benches);
