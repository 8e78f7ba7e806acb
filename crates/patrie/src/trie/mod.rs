// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The trie itself: construction, statistics, lifecycle.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Patricia                              |
//! |   slab (nodes, dense root at id 0)     token queue           |
//! |   +----------------------------+       +------------------+  |
//! |   | [root][n][n][n]....        |<----->| dummy->T->T->tail|  |
//! |   +----------------------------+       +------------------+  |
//! |        ^            ^                                        |
//! |   insert engine   lookup / cursor                            |
//! +--------------------------------------------------------------+
//! ```
//!
//! A `Patricia` is always behind an `Arc`; accessor handles
//! ([`ReaderToken`], [`WriterToken`], [`Cursor`]) each hold a clone and a
//! cell in the token queue. The concurrency level fixed at construction
//! selects the insert entry point; `set_readonly` is the only level
//! transition and is one-way.

mod access;
mod image;
mod insert;
mod iter;
mod lookup;

pub use access::{ReaderToken, WriterToken};
pub use iter::Cursor;

use crate::config::{ConcurrentLevel, TrieConfig};
use crate::epoch::{LazyFreeList, TokenQueue};
use crate::error::{Result, TrieError};
use crate::mem::{align_up, Region, Slab, ALIGN, ALLOC_FAIL, SCAN_SLACK};
use crate::node::{Cells, FAST_NODE_CELLS, MAX_ZPATH, NIL};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// The root node id. The root is the dense fast node, created at offset 0
/// during construction and never replaced.
pub(crate) const ROOT: u32 = 0;

/// Structural-operation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub n_add_state_move: u64,
    pub n_fork: u64,
    pub n_split: u64,
    pub n_mark_final: u64,
}

/// Memory accounting snapshot.
#[derive(Debug, Clone, Copy)]
pub struct MemStat {
    /// Bytes of the slab's bump-allocated prefix.
    pub used: usize,
    /// Reserved bytes.
    pub capacity: usize,
    /// Bytes parked in the shared free bins.
    pub frag: usize,
    /// Entries waiting in the global lazy-free list.
    pub lazy_free_cnt: usize,
    /// Bytes waiting in the global lazy-free list.
    pub lazy_free_sum: usize,
}

/// Concurrent in-memory Patricia trie over byte keys with fixed-size
/// values.
///
/// ```
/// use patrie::{ConcurrentLevel, Patricia, TrieConfig};
///
/// let trie = Patricia::new(TrieConfig::new(ConcurrentLevel::OneWriteMultiRead)
///     .value_size(4))?;
/// let mut w = trie.writer()?;
/// assert!(w.insert(b"key", &7u32.to_le_bytes())?);
/// let mut r = trie.reader();
/// assert_eq!(r.lookup(b"key"), Some(&7u32.to_le_bytes()[..]));
/// # Ok::<(), patrie::TrieError>(())
/// ```
pub struct Patricia {
    pub(crate) slab: Slab,
    pub(crate) valsize: usize,
    level: ConcurrentLevel,
    writing: AtomicU8,
    pub(crate) queue: TokenQueue,
    /// Lazy-free list of the single-writer modes, and the sink for a
    /// retiring multi-mode writer's residue.
    pub(crate) lazy_sgl: Mutex<LazyFreeList>,
    /// Serializes merges of per-writer counter deltas and stat read-out.
    pub(crate) counter_mutex: Mutex<()>,

    pub(crate) n_nodes: AtomicU64,
    pub(crate) n_words: AtomicU64,
    pub(crate) max_word_len: AtomicU64,
    pub(crate) total_key_len: AtomicU64,
    pub(crate) total_zpath_len: AtomicU64,
    pub(crate) zpath_states: AtomicI64,
    pub(crate) n_retry: AtomicU64,
    pub(crate) s_add_state_move: AtomicU64,
    pub(crate) s_fork: AtomicU64,
    pub(crate) s_split: AtomicU64,
    pub(crate) s_mark_final: AtomicU64,

    /// Live writer tokens; the single-writer modes admit one.
    pub(crate) writers: AtomicUsize,
    appdata_off: AtomicUsize,
    appdata_len: AtomicUsize,
}

/// Largest node this trie can ever allocate: a full-width tag-8 node with
/// a maximal z-path, plus the value slot.
pub(crate) fn max_node_size(valsize: usize) -> usize {
    align_up(ALIGN * (10 + 256) + MAX_ZPATH) + valsize
}

impl Patricia {
    /// Create a writable trie per `config`.
    pub fn new(config: TrieConfig) -> Result<Arc<Self>> {
        config.check()?;
        if config.concurrent_level == ConcurrentLevel::ReadOnly {
            return Err(TrieError::InvalidArgument(
                "read-only tries are produced by Patricia::open".into(),
            ));
        }
        let (cap, precommit) = config.reservation();
        let region = match &config.file_path {
            Some(path) => Region::file(path, cap)?,
            None => Region::anon(cap, precommit)?,
        };
        let slab = Slab::new(region, max_node_size(config.value_size));
        let trie = Self {
            slab,
            valsize: config.value_size,
            level: config.concurrent_level,
            writing: AtomicU8::new(level_to_u8(config.concurrent_level)),
            queue: TokenQueue::new(),
            lazy_sgl: Mutex::new(LazyFreeList::new()),
            counter_mutex: Mutex::new(()),
            n_nodes: AtomicU64::new(1),
            n_words: AtomicU64::new(0),
            max_word_len: AtomicU64::new(0),
            total_key_len: AtomicU64::new(0),
            total_zpath_len: AtomicU64::new(0),
            zpath_states: AtomicI64::new(0),
            n_retry: AtomicU64::new(0),
            s_add_state_move: AtomicU64::new(0),
            s_fork: AtomicU64::new(0),
            s_split: AtomicU64::new(0),
            s_mark_final: AtomicU64::new(0),
            writers: AtomicUsize::new(0),
            appdata_off: AtomicUsize::new(usize::MAX),
            appdata_len: AtomicUsize::new(0),
        };
        trie.new_root()?;
        log::debug!(
            "[trie] created level={:?} valsize={} cap={}",
            config.concurrent_level,
            config.value_size,
            cap
        );
        Ok(Arc::new(trie))
    }

    /// Dense root at offset 0: 256 nil children, a zeroed live counter,
    /// and a permanent value slot.
    fn new_root(&self) -> Result<()> {
        let root_size = ALIGN * FAST_NODE_CELLS + self.valsize;
        let pos = self.slab.alloc(root_size, None);
        if pos == ALLOC_FAIL {
            return Err(TrieError::OutOfMemory);
        }
        debug_assert_eq!(pos, 0);
        let a = self.cells();
        a.write_cell(ROOT, 0);
        a.write_u8(0, 15);
        a.write_u16(2, 256);
        a.write_cell(ROOT + 1, 0);
        for i in 0..256 {
            a.write_cell(ROOT + 2 + i, NIL);
        }
        a.fill_bytes(ALIGN * FAST_NODE_CELLS, 0, self.valsize);
        Ok(())
    }

    #[inline]
    pub(crate) fn cells(&self) -> Cells {
        Cells::new(self.slab.base())
    }

    /// The concurrency level the trie was constructed with.
    pub fn concurrent_level(&self) -> ConcurrentLevel {
        self.level
    }

    /// The currently effective level (`ReadOnly` once frozen).
    #[inline]
    pub(crate) fn writing(&self) -> ConcurrentLevel {
        level_from_u8(self.writing.load(Ordering::Acquire))
    }

    pub fn is_readonly(&self) -> bool {
        self.writing() == ConcurrentLevel::ReadOnly
    }

    /// Bytes of value stored behind every final node.
    pub fn value_size(&self) -> usize {
        self.valsize
    }

    /// Number of keys. Multi-writer counters lag by at most each live
    /// writer's unmerged delta.
    pub fn num_keys(&self) -> u64 {
        self.n_words.load(Ordering::Relaxed)
    }

    pub fn num_nodes(&self) -> u64 {
        self.n_nodes.load(Ordering::Relaxed)
    }

    pub fn max_key_len(&self) -> usize {
        self.max_word_len.load(Ordering::Relaxed) as usize
    }

    /// Total bytes of all inserted keys.
    pub fn total_key_len(&self) -> u64 {
        self.total_key_len.load(Ordering::Relaxed)
    }

    /// Total path-compressed bytes stored in nodes.
    pub fn total_zpath_len(&self) -> u64 {
        self.total_zpath_len.load(Ordering::Relaxed)
    }

    /// Number of nodes currently carrying a z-path.
    pub fn zpath_states(&self) -> i64 {
        self.zpath_states.load(Ordering::Relaxed)
    }

    /// Structural-operation counters merged so far.
    pub fn stat(&self) -> Stat {
        let _g = self.counter_mutex.lock();
        Stat {
            n_add_state_move: self.s_add_state_move.load(Ordering::Relaxed),
            n_fork: self.s_fork.load(Ordering::Relaxed),
            n_split: self.s_split.load(Ordering::Relaxed),
            n_mark_final: self.s_mark_final.load(Ordering::Relaxed),
        }
    }

    /// Insert retries observed by retired or synced writers.
    pub fn retry_count(&self) -> u64 {
        self.n_retry.load(Ordering::Relaxed)
    }

    pub fn mem_stat(&self) -> MemStat {
        let lazy = self.lazy_sgl.lock();
        MemStat {
            used: self.slab.used(),
            capacity: self.slab.capacity(),
            frag: self.slab.frag_bytes(),
            lazy_free_cnt: lazy.len(),
            lazy_free_sum: lazy.mem_size,
        }
    }

    /// One-shot, 256-byte-aligned caller-owned range inside the slab.
    /// Recorded in the image header and recoverable after a load via
    /// [`Patricia::appdata`].
    pub fn alloc_appdata(&self, len: usize) -> Result<NonNull<u8>> {
        if self.is_readonly() {
            return Err(TrieError::InvalidArgument(
                "appdata allocation on a read-only trie".into(),
            ));
        }
        const APPDATA_ALIGN: usize = 256;
        const RESERVING: usize = usize::MAX - 1;
        if self
            .appdata_off
            .compare_exchange(usize::MAX, RESERVING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(TrieError::LogicError("appdata already allocated".into()));
        }
        let len = align_up(len);
        let ext = len + APPDATA_ALIGN;
        let pos = self.slab.alloc_huge(ext);
        if pos == ALLOC_FAIL {
            self.appdata_off.store(usize::MAX, Ordering::Release);
            return Err(TrieError::OutOfMemory);
        }
        let lead = (APPDATA_ALIGN - pos % APPDATA_ALIGN) % APPDATA_ALIGN;
        let off = pos + lead;
        // return the alignment slack to the bins
        if lead > 0 {
            self.slab.free(pos, lead, None);
        }
        let tail = ext - lead - len;
        if tail > 0 {
            self.slab.free(off + len, tail, None);
        }
        self.appdata_len.store(len, Ordering::Release);
        self.appdata_off.store(off, Ordering::Release);
        // SAFETY: off points into the slab's used prefix.
        Ok(unsafe { NonNull::new_unchecked(self.cells().byte_ptr(off)) })
    }

    /// The application-data range, if one was allocated or loaded.
    pub fn appdata(&self) -> Option<&[u8]> {
        let off = self.appdata_off.load(Ordering::Acquire);
        if off >= usize::MAX - 1 {
            return None;
        }
        let len = self.appdata_len.load(Ordering::Acquire);
        Some(self.cells().bytes(off, len))
    }

    pub(crate) fn appdata_range(&self) -> (usize, usize) {
        (
            self.appdata_off.load(Ordering::Relaxed),
            self.appdata_len.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_appdata_range(&self, off: usize, len: usize) {
        self.appdata_off.store(off, Ordering::Release);
        self.appdata_len.store(len, Ordering::Release);
    }

    pub(crate) fn from_parts(slab: Slab, valsize: usize) -> Self {
        Self {
            slab,
            valsize,
            level: ConcurrentLevel::ReadOnly,
            writing: AtomicU8::new(level_to_u8(ConcurrentLevel::ReadOnly)),
            queue: TokenQueue::new(),
            lazy_sgl: Mutex::new(LazyFreeList::new()),
            counter_mutex: Mutex::new(()),
            n_nodes: AtomicU64::new(1),
            n_words: AtomicU64::new(0),
            max_word_len: AtomicU64::new(0),
            total_key_len: AtomicU64::new(0),
            total_zpath_len: AtomicU64::new(0),
            zpath_states: AtomicI64::new(0),
            n_retry: AtomicU64::new(0),
            s_add_state_move: AtomicU64::new(0),
            s_fork: AtomicU64::new(0),
            s_split: AtomicU64::new(0),
            s_mark_final: AtomicU64::new(0),
            writers: AtomicUsize::new(0),
            appdata_off: AtomicUsize::new(usize::MAX),
            appdata_len: AtomicUsize::new(0),
        }
    }

    /// Freeze the trie: no further inserts, the slab shrinks to its used
    /// prefix, and a file-backed trie becomes a loadable image in place.
    ///
    /// The caller must have retired every writer token first.
    pub fn set_readonly(&self) -> Result<()> {
        if self.writers.load(Ordering::Acquire) > 0 {
            return Err(TrieError::LogicError(
                "set_readonly with live writer tokens".into(),
            ));
        }
        let prev = self
            .writing
            .swap(level_to_u8(ConcurrentLevel::ReadOnly), Ordering::AcqRel);
        if level_from_u8(prev) == ConcurrentLevel::ReadOnly {
            return Ok(());
        }
        // Reclamation debts are moot once frozen: the bytes stay inside the
        // image's used prefix either way.
        self.lazy_sgl.lock().drain_all(|_| {});
        if self.slab.region().is_file_backed() {
            image::stamp_header_in_place(self)?;
        }
        // keep the scan slack mapped so 16-byte label loads on the last
        // node cannot run off the shrunken mapping
        self.slab.region().shrink(self.slab.used() + SCAN_SLACK)?;
        log::debug!(
            "[trie] readonly: {} keys, {} bytes used, {} tokens still queued",
            self.num_keys(),
            self.slab.used(),
            self.queue.qlen()
        );
        Ok(())
    }

    /// Write a self-describing image of this trie to `path`.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        image::save(self, path.as_ref())
    }

    /// Map an image produced by [`Patricia::save`] or a frozen file-backed
    /// trie, read-only.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Arc<Self>> {
        image::load(path.as_ref())
    }
}

impl Drop for Patricia {
    fn drop(&mut self) {
        // SAFETY: dropping the trie means no accessor handle holds an Arc,
        // so every remaining queue cell is queue-owned.
        unsafe { self.queue.drain_all() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::search;

    /// Walk every reachable node checking the layout invariants: known
    /// tag, child count in the tag's range, strictly ascending labels,
    /// bitmap rank prefix consistent, dense node only at the root.
    fn walk_check(a: Cells, id: u32, depth: usize) -> usize {
        let m = a.meta(id);
        let tag = m.tag();
        assert!(tag <= 8 || tag == 15, "unknown tag {tag}");
        let n = a.n_children(id, tag);
        match tag {
            0 => assert!(m.is_final(), "childless node must be final"),
            1..=6 => assert_eq!(n, tag as usize),
            7 => assert!((7..=16).contains(&n), "tag 7 with {n} children"),
            8 => assert!(n >= 17, "tag 8 with {n} children"),
            15 => {
                assert_eq!(depth, 0, "dense node below the root");
                assert_eq!(m.zlen(), 0);
            }
            _ => unreachable!(),
        }
        match tag {
            2 => assert!(m.label(0) < m.label(1)),
            3..=7 => {
                let off = if tag == 7 {
                    id as usize * ALIGN + ALIGN
                } else {
                    id as usize * ALIGN + 2
                };
                let labels = a.bytes(off, n);
                assert!(
                    labels.windows(2).all(|p| p[0] < p[1]),
                    "labels out of order at node {id}"
                );
            }
            8 => {
                let mut cum = 0usize;
                for word in 0..4 {
                    let rank = a.u8_at(id as usize * ALIGN + ALIGN + word) as usize;
                    assert_eq!(rank, cum, "rank prefix diverges at node {id}");
                    cum += a
                        .u64_unaligned(id as usize * ALIGN + 2 * ALIGN + word * 8)
                        .count_ones() as usize;
                }
                assert_eq!(cum, n, "bitmap population != child count");
            }
            _ => {}
        }
        let mut total = 1;
        for ch in 0..=255u8 {
            if let Some((child, _slot)) = search::child_at(a, id, m, ch) {
                total += walk_check(a, child, depth + 1);
            }
        }
        total
    }

    #[test]
    fn test_structure_invariants_hold() {
        let trie = Patricia::new(TrieConfig::new(ConcurrentLevel::SingleThreadStrict))
            .expect("trie");
        let mut w = trie.writer().expect("writer");
        let mut rng = fastrand::Rng::with_seed(99);
        let mut n_keys = 0u64;
        // mixed shapes: dense single bytes, wide fanout, long tails
        for b in 0..=255u8 {
            if w.insert(&[b], b"").expect("insert") {
                n_keys += 1;
            }
        }
        for _ in 0..2_000 {
            let len = rng.usize(2..40);
            let key: Vec<u8> = (0..len).map(|_| rng.u8(b'a'..=b'p')).collect();
            if w.insert(&key, b"").expect("insert") {
                n_keys += 1;
            }
        }
        assert_eq!(trie.num_keys(), n_keys);
        let visited = walk_check(trie.cells(), ROOT, 0);
        assert_eq!(visited as u64, trie.num_nodes());
    }
}

fn level_to_u8(l: ConcurrentLevel) -> u8 {
    match l {
        ConcurrentLevel::SingleThreadStrict => 0,
        ConcurrentLevel::SingleThreadShared => 1,
        ConcurrentLevel::OneWriteMultiRead => 2,
        ConcurrentLevel::MultiWriteMultiRead => 3,
        ConcurrentLevel::ReadOnly => 4,
    }
}

fn level_from_u8(v: u8) -> ConcurrentLevel {
    match v {
        0 => ConcurrentLevel::SingleThreadStrict,
        1 => ConcurrentLevel::SingleThreadShared,
        2 => ConcurrentLevel::OneWriteMultiRead,
        3 => ConcurrentLevel::MultiWriteMultiRead,
        _ => ConcurrentLevel::ReadOnly,
    }
}
