// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # PATRIE - Concurrent in-memory Patricia trie
//!
//! An ordered byte-key index with lock-free multi-writer insert, wait-free
//! reads, epoch-based lazy reclamation and a stable mmap-able image.
//! Designed as the mutable front of indexing pipelines: storage engines,
//! succinct-index builders, routing tables.
//!
//! ## Quick Start
//!
//! ```rust
//! use patrie::{ConcurrentLevel, Patricia, TrieConfig};
//!
//! fn main() -> patrie::Result<()> {
//!     let trie = Patricia::new(
//!         TrieConfig::new(ConcurrentLevel::MultiWriteMultiRead).value_size(4),
//!     )?;
//!
//!     let mut w = trie.writer()?;
//!     w.insert(b"alpha", &1u32.to_le_bytes())?;
//!     w.insert(b"beta", &2u32.to_le_bytes())?;
//!
//!     let mut r = trie.reader();
//!     assert!(r.lookup(b"alpha").is_some());
//!
//!     let mut c = trie.cursor();
//!     assert!(c.seek_first());
//!     assert_eq!(c.key(), b"alpha");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Accessor handles                            |
//! |    ReaderToken        WriterToken            Cursor                |
//! +--------------------------------------------------------------------+
//! |                        Trie engines                                |
//! |    lookup (wait-free) | insert (lock-free) | ordered iteration     |
//! +--------------------------------------------------------------------+
//! |    Node layout: 10 packed variants over 4-byte cells               |
//! |    inline labels | 16-label block | bitmap+rank | dense root       |
//! +--------------------------------------------------------------------+
//! |    Epoch: token version queue, min_age, lazy-free lists            |
//! +--------------------------------------------------------------------+
//! |    Slab: one mmap region, size-class bins, per-writer caches       |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Patricia`] | The trie; always behind an `Arc` |
//! | [`WriterToken`] | Insert + lookup handle, one epoch slot |
//! | [`ReaderToken`] | Lookup handle pinning reclamation |
//! | [`Cursor`] | Ordered forward/backward/lower-bound iteration |
//! | [`TrieConfig`] | Concurrency level, value size, memory, backing file |
//!
//! ## Guarantees
//!
//! - **Linearizable insert**: concurrent inserts of the same key agree on
//!   one winner; the losers observe the winner's value slot.
//! - **Pinned reads**: a pointer returned while a token is acquired stays
//!   readable until that token releases or advances.
//! - **Ordered iteration**: byte-lexicographic, with snapshot-consistent
//!   traversal of the already-crossed subtree under concurrent inserts.
//! - **Stable image**: the cell-level node format is the on-disk contract;
//!   `save`/`open` round-trip through a crc-checked header.

mod config;
mod epoch;
mod error;
mod mem;
mod node;
mod trie;

pub use config::{ConcurrentLevel, TrieConfig, DEFAULT_MAX_MEMORY, MAX_VALUE_SIZE};
pub use error::{Result, TrieError};
pub use trie::{Cursor, MemStat, Patricia, ReaderToken, Stat, WriterToken};
