// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The insert engines.
//!
//! Every insert reduces to one of four structural operations, each built
//! off to the side and published by a single store/CAS of the parent's
//! child slot:
//!
//! - **add-state-move**: one more outgoing edge on an existing node
//!   (repacked into the next-larger variant as needed);
//! - **fork-branch**: the key diverges inside a z-path; the node is split
//!   into a two-child parent, the carved-off suffix, and a fresh chain
//!   carrying the remaining key bytes;
//! - **split-z-path**: the key ends inside a z-path; prefix node becomes
//!   final, suffix carved off below it;
//! - **mark-final**: the key ends exactly at a non-final node, which is
//!   copied with a value slot appended.
//!
//! The dense root short-circuits the first two: a missing root edge is a
//! bare CAS of `child[ch]`, and marking the empty key final is a
//! two-phase flag dance on the root itself.
//!
//! In the multi-writer mode the publication is guarded by the commit
//! protocol: lock the parent's flag cell, permanently tag the superseded
//! node lazy-free, verify its child array against the plan-time snapshot,
//! then CAS the slot. Any step failing aborts the whole attempt, frees
//! the side-built nodes locally and retries from the root.

use super::{Patricia, Stat, ROOT};
use crate::config::ConcurrentLevel;
use crate::epoch::{LazyFreeItem, LazyFreeList, TokenCell, TokenQueue};
use crate::error::{Result, TrieError};
use crate::mem::{align_up, BinCache, ALIGN, ALLOC_FAIL};
use crate::node::{
    node_size, prefetch, search, Cells, Meta, NodeInfo, FLAG_FINAL, FLAG_LAZY_FREE, FLAG_LOCK,
    FLAG_SET_FINAL, LINK_NODE_SIZE, MAX_ZPATH, NIL,
};
use crate::trie::WriterToken;
use crossbeam::utils::Backoff;
use std::sync::atomic::Ordering;

/// A head-owning writer syncs counters and steps to the queue tail once
/// its lazy debt passes this.
const HEAD_SYNC_BYTES: usize = 32 * 1024;

/// A non-head writer nudges an idle head once its debt passes this.
const IDLE_NUDGE_BYTES: usize = 512 * 1024;

#[inline]
fn bo(id: u32) -> usize {
    id as usize * ALIGN
}

// ---- per-writer scratch ----------------------------------------------------

/// Thread-owned writer state: allocator cache, lazy-free FIFO and counter
/// deltas merged into the trie at sync points.
pub(crate) struct WriterScratch {
    pub bins: BinCache,
    pub lazy: LazyFreeList,
    pub stat: Stat,
    pub n_nodes: u64,
    pub n_words: u64,
    pub max_word_len: u64,
    pub total_key_len: u64,
    pub total_zpath_len: u64,
    pub zpath_states: i64,
    pub n_retry: u64,
}

impl WriterScratch {
    pub(crate) fn new(trie: &Patricia) -> Self {
        Self {
            bins: trie.slab.new_cache(),
            lazy: LazyFreeList::new(),
            stat: Stat::default(),
            n_nodes: 0,
            n_words: 0,
            max_word_len: 0,
            total_key_len: 0,
            total_zpath_len: 0,
            zpath_states: 0,
            n_retry: 0,
        }
    }

    /// Merge counter deltas into the trie's globals and reset them.
    pub(crate) fn merge_counters(&mut self, trie: &Patricia) {
        let _g = trie.counter_mutex.lock();
        trie.n_nodes.fetch_add(self.n_nodes, Ordering::Relaxed);
        trie.n_words.fetch_add(self.n_words, Ordering::Relaxed);
        trie.max_word_len
            .fetch_max(self.max_word_len, Ordering::Relaxed);
        trie.total_key_len
            .fetch_add(self.total_key_len, Ordering::Relaxed);
        trie.total_zpath_len
            .fetch_add(self.total_zpath_len, Ordering::Relaxed);
        trie.zpath_states
            .fetch_add(self.zpath_states, Ordering::Relaxed);
        trie.n_retry.fetch_add(self.n_retry, Ordering::Relaxed);
        trie.s_add_state_move
            .fetch_add(self.stat.n_add_state_move, Ordering::Relaxed);
        trie.s_fork.fetch_add(self.stat.n_fork, Ordering::Relaxed);
        trie.s_split.fetch_add(self.stat.n_split, Ordering::Relaxed);
        trie.s_mark_final
            .fetch_add(self.stat.n_mark_final, Ordering::Relaxed);
        self.n_nodes = 0;
        self.n_words = 0;
        self.max_word_len = 0;
        self.total_key_len = 0;
        self.total_zpath_len = 0;
        self.zpath_states = 0;
        self.n_retry = 0;
        self.stat = Stat::default();
    }

    /// Writer teardown: free what has expired, park the rest on the
    /// trie-global list, spill the bin cache, merge counters.
    pub(crate) fn retire(&mut self, trie: &Patricia, min_age: u64) {
        let Self { bins, lazy, .. } = self;
        lazy.drain_expired(min_age, |item| {
            trie.slab
                .free(item.node as usize * ALIGN, item.size as usize, Some(bins));
        });
        lazy.drain_all_into(&mut trie.lazy_sgl.lock());
        trie.slab.drain_cache(bins);
        self.merge_counters(trie);
    }
}

// ---- allocation context ----------------------------------------------------

/// Routes node alloc/free to the shared pool or a writer's cache.
pub(crate) enum AllocCtx<'a> {
    Shared,
    Cache(&'a mut BinCache),
}

impl AllocCtx<'_> {
    fn alloc(&mut self, trie: &Patricia, size: usize) -> Result<u32> {
        let pos = match self {
            AllocCtx::Shared => trie.slab.alloc(size, None),
            AllocCtx::Cache(bins) => trie.slab.alloc(size, Some(bins)),
        };
        if pos == ALLOC_FAIL {
            return Err(TrieError::OutOfMemory);
        }
        Ok((pos / ALIGN) as u32)
    }

    fn free(&mut self, trie: &Patricia, id: u32, size: usize) {
        match self {
            AllocCtx::Shared => trie.slab.free(bo(id), size, None),
            AllocCtx::Cache(bins) => trie.slab.free(bo(id), size, Some(bins)),
        }
    }
}

// ---- descent ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlanKind {
    Existed,
    AddState,
    AddStateFast,
    Fork,
    Split,
    MarkFinal,
    MarkFinalFast,
}

pub(crate) struct Walk {
    pub parent: u32,
    pub slot: u32,
    pub curr: u32,
    pub meta: Meta,
    pub pos: usize,
    pub zidx: usize,
    pub ni: NodeInfo,
    pub valpos: usize,
}

/// Walk `key` from the root and classify what the insert must do.
pub(crate) fn descend(a: Cells, key: &[u8]) -> (Walk, PlanKind) {
    let mut w = Walk {
        parent: NIL,
        slot: NIL,
        curr: ROOT,
        meta: Meta(0),
        pos: 0,
        zidx: 0,
        ni: NodeInfo::new(),
        valpos: 0,
    };
    loop {
        let m = a.meta(w.curr);
        w.meta = m;
        let zlen = m.zlen();
        if zlen != 0 {
            w.ni.set(a, w.curr, m, 0);
            let kkn = key.len() - w.pos;
            let zkn = zlen.min(kkn);
            let zp = w.ni.zpath(a, w.curr, zlen);
            let mut zidx = 0;
            while zidx < zkn {
                if key[w.pos + zidx] != zp[zidx] {
                    w.pos += zidx;
                    w.zidx = zidx;
                    return (w, PlanKind::Fork);
                }
                zidx += 1;
            }
            w.pos += zkn;
            if kkn <= zlen {
                if kkn < zlen {
                    w.zidx = kkn;
                    return (w, PlanKind::Split);
                }
                if m.is_final() {
                    w.valpos = bo(w.curr) + w.ni.va_offset as usize;
                    return (w, PlanKind::Existed);
                }
                return (w, PlanKind::MarkFinal);
            }
        } else if key.len() == w.pos {
            if m.is_final() {
                w.ni.set(a, w.curr, m, 0);
                w.valpos = bo(w.curr) + w.ni.va_offset as usize;
                return (w, PlanKind::Existed);
            }
            if m.tag() != 15 {
                w.ni.set(a, w.curr, m, 0);
                return (w, PlanKind::MarkFinal);
            }
            return (w, PlanKind::MarkFinalFast);
        }
        let ch = key[w.pos];
        match search::child_at(a, w.curr, m, ch) {
            Some((child, slot)) => {
                prefetch(a, child);
                w.parent = w.curr;
                w.slot = slot;
                w.curr = child;
                w.pos += 1;
            }
            None => {
                let kind = if m.tag() == 15 {
                    PlanKind::AddStateFast
                } else {
                    PlanKind::AddState
                };
                return (w, kind);
            }
        }
    }
}

// ---- node builders ---------------------------------------------------------

/// Zero-pad `off` up to the next cell boundary; returns the aligned end.
fn pad_zero(a: Cells, off: usize) -> usize {
    let aligned = align_up(off);
    if aligned > off {
        a.fill_bytes(off, 0, aligned - off);
    }
    aligned
}

fn set_bit(a: Cells, node: u32, ch: u8) {
    let off = bo(node) + 2 * ALIGN + ch as usize / 8;
    a.write_u8(off, a.u8_at(off) | 1 << (ch % 8));
}

/// Recompute the 4-byte per-64-bit rank prefix from the bitmap.
fn rebuild_rank(a: Cells, node: u32) {
    let mut cum = 0u32;
    for word in 0..4 {
        a.write_u8(bo(node) + ALIGN + word, cum as u8);
        cum += a
            .u64_unaligned(bo(node) + 2 * ALIGN + word * 8)
            .count_ones();
    }
}

/// Build a linear chain of single-child nodes carrying `suffix`, ending
/// in a final node holding `value`. Returns (head, value offset, length).
fn new_suffix_chain(
    trie: &Patricia,
    ctx: &mut AllocCtx<'_>,
    mut suffix: &[u8],
    value: &[u8],
) -> Result<(u32, usize, usize)> {
    let a = trie.cells();
    let mut head = NIL;
    let mut parent = NIL;
    let mut chain_len = 0usize;
    while suffix.len() > MAX_ZPATH {
        let node = match ctx.alloc(trie, LINK_NODE_SIZE) {
            Ok(n) => n,
            Err(e) => {
                revoke_chain(trie, ctx, head);
                return Err(e);
            }
        };
        chain_len += 1;
        a.write_cell(node, 0);
        a.write_u8(bo(node), 1);
        a.write_u8(bo(node) + 1, MAX_ZPATH as u8);
        a.write_u8(bo(node) + 2, suffix[MAX_ZPATH]);
        a.write_cell(node + 1, NIL);
        a.write_slice(bo(node) + 2 * ALIGN, &suffix[..MAX_ZPATH]);
        pad_zero(a, bo(node) + 2 * ALIGN + MAX_ZPATH);
        if head == NIL {
            head = node;
        } else {
            a.write_cell(parent + 1, node);
        }
        suffix = &suffix[MAX_ZPATH + 1..];
        parent = node;
    }
    let node = match ctx.alloc(trie, ALIGN + trie.valsize + suffix.len()) {
        Ok(n) => n,
        Err(e) => {
            revoke_chain(trie, ctx, head);
            return Err(e);
        }
    };
    chain_len += 1;
    a.write_cell(node, 0);
    a.write_u8(bo(node), FLAG_FINAL); // tag 0 leaf
    a.write_u8(bo(node) + 1, suffix.len() as u8);
    a.write_slice(bo(node) + ALIGN, suffix);
    let valpos = pad_zero(a, bo(node) + ALIGN + suffix.len());
    a.write_slice(valpos, value);
    if head == NIL {
        Ok((node, valpos, chain_len))
    } else {
        a.write_cell(parent + 1, node);
        Ok((head, valpos, chain_len))
    }
}

/// Free an unpublished (or aborted) suffix chain.
fn revoke_chain(trie: &Patricia, ctx: &mut AllocCtx<'_>, head: u32) {
    if head == NIL {
        return;
    }
    let a = trie.cells();
    let mut curr = head;
    while curr != NIL {
        let m = a.meta(curr);
        if m.is_final() {
            ctx.free(trie, curr, node_size(a, curr, trie.valsize));
            break;
        }
        let next = a.child_relaxed(curr + 1);
        ctx.free(trie, curr, LINK_NODE_SIZE);
        curr = next;
    }
}

/// Z-path-carrying nodes a fresh suffix chain contributes.
fn suffix_zpath_states(chain_len: usize, pos: usize, key_len: usize) -> i64 {
    let suffix_len = key_len - pos - 1;
    if suffix_len <= MAX_ZPATH + 1 {
        return if suffix_len > 0 {
            chain_len as i64
        } else {
            chain_len as i64 - 1
        };
    }
    if suffix_len % (MAX_ZPATH + 1) == 0 {
        chain_len as i64 - 1
    } else {
        chain_len as i64
    }
}

/// Copy of `curr` with its z-path shortened to the part past `zidx`.
/// Children and value carry over; the byte at `zidx` becomes the incoming
/// edge stored in the new parent.
fn carve_suffix(
    trie: &Patricia,
    ctx: &mut AllocCtx<'_>,
    a: Cells,
    curr: u32,
    ni: &NodeInfo,
    zlen: usize,
    zidx: usize,
) -> Result<u32> {
    let node = ctx.alloc(trie, ni.suffix_node_size(zlen, zidx))?;
    let skip = ni.skip as usize;
    let n = ni.n_children as usize;
    a.copy_bytes(bo(node), bo(curr), ALIGN * skip);
    for i in 0..n {
        a.write_cell(
            node + (skip + i) as u32,
            a.child_relaxed(curr + (skip + i) as u32),
        );
    }
    let tail_len = zlen - zidx - 1;
    a.write_u8(bo(node) + 1, tail_len as u8);
    a.copy_bytes(
        bo(node) + ni.zp_offset as usize,
        bo(curr) + ni.zp_offset as usize + zidx + 1,
        tail_len,
    );
    let end = pad_zero(a, bo(node) + ni.zp_offset as usize + tail_len);
    a.copy_bytes(end, bo(curr) + ni.va_offset as usize, ni.node_valsize());
    Ok(node)
}

/// Fork at z-path index `zidx`: two-child parent over the carved suffix
/// and the freshly built chain. Returns the new parent.
fn fork_branch(
    trie: &Patricia,
    ctx: &mut AllocCtx<'_>,
    a: Cells,
    curr: u32,
    ni: &mut NodeInfo,
    zlen: usize,
    zidx: usize,
    new_char: u8,
    new_suffix: u32,
) -> Result<u32> {
    let old_suffix = carve_suffix(trie, ctx, a, curr, ni, zlen, zidx)?;
    let parent_size = ALIGN * 3 + zidx;
    let parent = match ctx.alloc(trie, parent_size) {
        Ok(p) => p,
        Err(e) => {
            ctx.free(trie, old_suffix, ni.suffix_node_size(zlen, zidx));
            return Err(e);
        }
    };
    let zp = ni.zpath(a, curr, zlen);
    let old_char = zp[zidx];
    debug_assert_ne!(old_char, new_char);
    a.write_cell(parent, 0);
    a.write_u8(bo(parent), 2);
    a.write_u8(bo(parent) + 1, zidx as u8);
    if old_char < new_char {
        a.write_u8(bo(parent) + 2, old_char);
        a.write_u8(bo(parent) + 3, new_char);
        a.write_cell(parent + 1, old_suffix);
        a.write_cell(parent + 2, new_suffix);
    } else {
        a.write_u8(bo(parent) + 2, new_char);
        a.write_u8(bo(parent) + 3, old_char);
        a.write_cell(parent + 1, new_suffix);
        a.write_cell(parent + 2, old_suffix);
    }
    a.write_slice(bo(parent) + 3 * ALIGN, &zp[..zidx]);
    pad_zero(a, bo(parent) + 3 * ALIGN + zidx);
    ni.old_suffix = old_suffix;
    ni.new_suffix = new_suffix;
    Ok(parent)
}

/// Split at z-path index `zidx`: the prefix node becomes final and holds
/// `value`; the suffix keeps everything else. Returns (prefix, valpos).
fn split_zpath(
    trie: &Patricia,
    ctx: &mut AllocCtx<'_>,
    a: Cells,
    curr: u32,
    ni: &mut NodeInfo,
    zlen: usize,
    zidx: usize,
    value: &[u8],
) -> Result<(u32, usize)> {
    let suffix = carve_suffix(trie, ctx, a, curr, ni, zlen, zidx)?;
    let prefix_size = ALIGN * 2 + trie.valsize + zidx;
    let prefix = match ctx.alloc(trie, prefix_size) {
        Ok(p) => p,
        Err(e) => {
            ctx.free(trie, suffix, ni.suffix_node_size(zlen, zidx));
            return Err(e);
        }
    };
    let zp = ni.zpath(a, curr, zlen);
    a.write_cell(prefix, 0);
    a.write_u8(bo(prefix), 1 | FLAG_FINAL);
    a.write_u8(bo(prefix) + 1, zidx as u8);
    a.write_u8(bo(prefix) + 2, zp[zidx]);
    a.write_cell(prefix + 1, suffix);
    a.write_slice(bo(prefix) + 2 * ALIGN, &zp[..zidx]);
    let valpos = pad_zero(a, bo(prefix) + 2 * ALIGN + zidx);
    a.write_slice(valpos, value);
    ni.old_suffix = suffix;
    Ok((prefix, valpos))
}

/// Copy `curr` with one more outgoing edge `ch -> suffix_node`, repacked
/// into whatever variant now fits. Returns the replacement node.
fn add_state_move(
    trie: &Patricia,
    ctx: &mut AllocCtx<'_>,
    a: Cells,
    curr: u32,
    meta: Meta,
    ch: u8,
    suffix_node: u32,
) -> Result<u32> {
    let tag = meta.tag();
    let zlen = meta.zlen();
    let valsize = trie.valsize;
    let mut avz = align_up(zlen);
    if meta.is_final() {
        avz += valsize;
    }

    // shift-insert `ch` into the label run and `suffix_node` into the
    // children of the new node; labels were copied along with the skip
    // cells unless the caller placed them explicitly
    let splice = |a: Cells,
                  node: u32,
                  new_tag: u8,
                  old_skip: usize,
                  new_skip: usize,
                  old_n: usize,
                  labels_off: usize,
                  copy_skip: bool| {
        if copy_skip {
            a.copy_bytes(bo(node), bo(curr), ALIGN * old_skip);
        }
        let b0 = a.u8_at(bo(node));
        a.write_u8(bo(node), (b0 & 0xF0) | new_tag);
        let labels = a.bytes(labels_off, old_n);
        let idx = search::lower_bound(labels, ch);
        for i in 0..idx {
            a.write_cell(
                node + (new_skip + i) as u32,
                a.child_relaxed(curr + (old_skip + i) as u32),
            );
        }
        a.write_cell(node + (new_skip + idx) as u32, suffix_node);
        for i in idx..old_n {
            a.write_cell(
                node + (new_skip + i + 1) as u32,
                a.child_relaxed(curr + (old_skip + i) as u32),
            );
        }
        let mut i = old_n;
        while i > idx {
            a.write_u8(labels_off + i, a.u8_at(labels_off + i - 1));
            i -= 1;
        }
        a.write_u8(labels_off + idx, ch);
        a.copy_bytes(
            (node as usize + new_skip + old_n + 1) * ALIGN,
            (curr as usize + old_skip + old_n) * ALIGN,
            avz,
        );
    };

    let node = match tag {
        0 => {
            debug_assert!(meta.is_final());
            let node = ctx.alloc(trie, ALIGN * 2 + avz)?;
            splice(a, node, 1, 1, 1, 0, bo(node) + 2, true);
            node
        }
        1 => {
            let node = ctx.alloc(trie, ALIGN * 3 + avz)?;
            splice(a, node, 2, 1, 1, 1, bo(node) + 2, true);
            node
        }
        2 => {
            let node = ctx.alloc(trie, ALIGN * 5 + avz)?;
            splice(a, node, 3, 1, 2, 2, bo(node) + 2, true);
            a.fill_bytes(bo(node) + 2 + 3, 0, 3);
            node
        }
        3..=5 => {
            let node = ctx.alloc(trie, ALIGN * (2 + tag as usize + 1) + avz)?;
            splice(a, node, tag + 1, 2, 2, tag as usize, bo(node) + 2, true);
            node
        }
        6 => {
            // 6 inline labels do not fit a 7th; move to the 16-label block
            let node = ctx.alloc(trie, ALIGN * (5 + 7) + avz)?;
            a.copy_bytes(bo(node), bo(curr), ALIGN);
            a.fill_bytes(bo(node + 2), 0, ALIGN * 3);
            a.copy_bytes(bo(node + 1), bo(curr) + 2, 6);
            splice(a, node, 7, 2, 5, 6, bo(node + 1), false);
            a.write_u16(bo(node) + 2, 7);
            node
        }
        7 => {
            let n = a.n_children(curr, tag);
            debug_assert!((7..=16).contains(&n));
            if n < 16 {
                let node = ctx.alloc(trie, ALIGN * (5 + n + 1) + avz)?;
                splice(a, node, 7, 5, 5, n, bo(node + 1), true);
                a.write_u16(bo(node) + 2, (n + 1) as u16);
                node
            } else {
                // 16 -> 17 children: build the bitmap + rank variant
                let node = ctx.alloc(trie, ALIGN * (10 + 17) + avz)?;
                a.copy_bytes(bo(node), bo(curr), ALIGN);
                let b0 = a.u8_at(bo(node));
                a.write_u8(bo(node), (b0 & 0xF0) | 8);
                a.write_u16(bo(node) + 2, 17);
                a.fill_bytes(bo(node + 2), 0, 32);
                for i in 0..16 {
                    set_bit(a, node, a.u8_at(bo(curr + 1) + i));
                }
                set_bit(a, node, ch);
                rebuild_rank(a, node);
                let idx = search::rank_idx(a, node, ch);
                debug_assert!(idx <= 16);
                for i in 0..idx {
                    a.write_cell(node + 10 + i as u32, a.child_relaxed(curr + 5 + i as u32));
                }
                a.write_cell(node + 10 + idx as u32, suffix_node);
                for i in idx..16 {
                    a.write_cell(
                        node + 10 + i as u32 + 1,
                        a.child_relaxed(curr + 5 + i as u32),
                    );
                }
                a.copy_bytes(bo(node + 10 + 17), bo(curr + 5 + 16), avz);
                node
            }
        }
        8 => {
            let n = a.n_children(curr, tag);
            debug_assert!(n >= 17);
            let node = ctx.alloc(trie, ALIGN * (10 + n + 1) + avz)?;
            // rank gives the insertion index while ch's bit is still clear
            let idx = search::rank_idx(a, curr, ch);
            a.copy_bytes(bo(node), bo(curr), ALIGN * 10);
            for i in 0..idx {
                a.write_cell(node + 10 + i as u32, a.child_relaxed(curr + 10 + i as u32));
            }
            a.write_cell(node + 10 + idx as u32, suffix_node);
            for i in idx..n {
                a.write_cell(
                    node + 10 + i as u32 + 1,
                    a.child_relaxed(curr + 10 + i as u32),
                );
            }
            a.copy_bytes(bo(node) + ALIGN * (10 + n + 1), bo(curr) + ALIGN * (10 + n), avz);
            set_bit(a, node, ch);
            rebuild_rank(a, node);
            a.write_u16(bo(node) + 2, (n + 1) as u16);
            node
        }
        t => unreachable!("add_state_move on tag {t}"),
    };
    Ok(node)
}

// ---- single-writer engine --------------------------------------------------

fn drain_lazy_single(trie: &Patricia, level: ConcurrentLevel) {
    if level == ConcurrentLevel::SingleThreadStrict {
        return;
    }
    let min_age = trie.queue.min_age();
    let mut lazy = trie.lazy_sgl.lock();
    lazy.drain_expired(min_age, |item| {
        trie.slab
            .free(item.node as usize * ALIGN, item.size as usize, None);
    });
}

/// Publish the replacement with a release store and retire the superseded
/// node; counters ride along. The lazy-free stamp is the tail version read
/// after the store: every token that can still reach the old node enqueued
/// before the publication, so its verseq is covered by the stamp.
fn publish_single(
    trie: &Patricia,
    a: Cells,
    level: ConcurrentLevel,
    w: &Walk,
    new_curr: u32,
    node_inc: usize,
    key_len: usize,
) {
    let old_size = align_up(w.ni.node_size as usize);
    a.store_child(w.slot, new_curr);
    if level == ConcurrentLevel::SingleThreadStrict {
        trie.slab.free(bo(w.curr), old_size, None);
    } else {
        trie.lazy_sgl.lock().push(LazyFreeItem {
            age: trie.queue.tail_verseq(),
            node: w.curr,
            size: old_size as u32,
        });
    }
    trie.n_nodes.fetch_add(node_inc as u64, Ordering::Relaxed);
    trie.n_words.fetch_add(1, Ordering::Relaxed);
    trie.total_key_len.fetch_add(key_len as u64, Ordering::Relaxed);
    trie.total_zpath_len.fetch_add(
        (key_len as i64 - w.pos as i64 - node_inc as i64) as u64,
        Ordering::Relaxed,
    );
    trie.max_word_len.fetch_max(key_len as u64, Ordering::Relaxed);
}

pub(crate) fn insert_single(
    trie: &Patricia,
    tok: &mut WriterToken,
    key: &[u8],
    value: &[u8],
    level: ConcurrentLevel,
) -> Result<bool> {
    let valsize = trie.valsize;
    let a = trie.cells();
    let mut ctx = AllocCtx::Shared;
    let (mut w, plan) = descend(a, key);
    match plan {
        PlanKind::Existed => {
            tok.set_value(a.byte_ptr(w.valpos));
            Ok(false)
        }
        PlanKind::MarkFinalFast => {
            let valpos = ALIGN * (ROOT as usize + 2 + 256);
            a.write_slice(valpos, value);
            a.or_flags(ROOT, FLAG_FINAL);
            trie.n_words.fetch_add(1, Ordering::Relaxed);
            trie.s_mark_final.fetch_add(1, Ordering::Relaxed);
            trie.total_key_len.fetch_add(key.len() as u64, Ordering::Relaxed);
            tok.set_value(a.byte_ptr(valpos));
            Ok(true)
        }
        PlanKind::AddStateFast => {
            drain_lazy_single(trie, level);
            trie.s_add_state_move.fetch_add(1, Ordering::Relaxed);
            let ch = key[w.pos];
            let (chain, valpos, chain_len) =
                new_suffix_chain(trie, &mut ctx, &key[w.pos + 1..], value)?;
            if w.pos + 1 < key.len() {
                trie.zpath_states.fetch_add(
                    suffix_zpath_states(chain_len, w.pos, key.len()),
                    Ordering::Relaxed,
                );
            }
            debug_assert!(a.fast_live_children(ROOT) < 256);
            a.store_child(ROOT + 2 + u32::from(ch), chain);
            a.bump_fast_live_children(ROOT);
            trie.n_nodes.fetch_add(chain_len as u64, Ordering::Relaxed);
            trie.n_words.fetch_add(1, Ordering::Relaxed);
            trie.total_key_len.fetch_add(key.len() as u64, Ordering::Relaxed);
            trie.total_zpath_len.fetch_add(
                (key.len() as i64 - w.pos as i64 - chain_len as i64) as u64,
                Ordering::Relaxed,
            );
            trie.max_word_len
                .fetch_max(key.len() as u64, Ordering::Relaxed);
            tok.set_value(a.byte_ptr(valpos));
            Ok(true)
        }
        PlanKind::AddState => {
            drain_lazy_single(trie, level);
            trie.s_add_state_move.fetch_add(1, Ordering::Relaxed);
            let ch = key[w.pos];
            let (chain, valpos, chain_len) =
                new_suffix_chain(trie, &mut ctx, &key[w.pos + 1..], value)?;
            if w.meta.zlen() == 0 {
                let vs = if w.meta.is_final() { valsize } else { 0 };
                w.ni.set(a, w.curr, w.meta, vs);
            } else if w.meta.is_final() {
                w.ni.node_size += valsize as u32;
            }
            let new_curr = match add_state_move(trie, &mut ctx, a, w.curr, w.meta, ch, chain) {
                Ok(n) => n,
                Err(e) => {
                    revoke_chain(trie, &mut ctx, chain);
                    return Err(e);
                }
            };
            if w.pos + 1 < key.len() {
                trie.zpath_states.fetch_add(
                    suffix_zpath_states(chain_len, w.pos, key.len()),
                    Ordering::Relaxed,
                );
            }
            tok.set_value(a.byte_ptr(valpos));
            publish_single(trie, a, level, &w, new_curr, chain_len, key.len());
            Ok(true)
        }
        PlanKind::Fork => {
            if w.meta.is_final() {
                w.ni.node_size += valsize as u32;
            }
            drain_lazy_single(trie, level);
            trie.s_fork.fetch_add(1, Ordering::Relaxed);
            let zlen = w.meta.zlen();
            let (chain, valpos, chain_len) =
                new_suffix_chain(trie, &mut ctx, &key[w.pos + 1..], value)?;
            let new_curr = match fork_branch(
                trie, &mut ctx, a, w.curr, &mut w.ni, zlen, w.zidx, key[w.pos], chain,
            ) {
                Ok(n) => n,
                Err(e) => {
                    revoke_chain(trie, &mut ctx, chain);
                    return Err(e);
                }
            };
            let mut zinc = suffix_zpath_states(chain_len, w.pos, key.len());
            if zlen != 1 {
                if w.zidx != 0 && w.zidx + 1 != zlen {
                    zinc += 1;
                }
            } else {
                zinc -= 1;
            }
            trie.zpath_states.fetch_add(zinc, Ordering::Relaxed);
            tok.set_value(a.byte_ptr(valpos));
            publish_single(trie, a, level, &w, new_curr, 1 + chain_len, key.len());
            Ok(true)
        }
        PlanKind::Split => {
            if w.meta.is_final() {
                w.ni.node_size += valsize as u32;
            }
            drain_lazy_single(trie, level);
            trie.s_split.fetch_add(1, Ordering::Relaxed);
            let zlen = w.meta.zlen();
            let (prefix, valpos) =
                split_zpath(trie, &mut ctx, a, w.curr, &mut w.ni, zlen, w.zidx, value)?;
            if zlen != 1 {
                if w.zidx != 0 && w.zidx + 1 != zlen {
                    trie.zpath_states.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                trie.zpath_states.fetch_sub(1, Ordering::Relaxed);
            }
            tok.set_value(a.byte_ptr(valpos));
            publish_single(trie, a, level, &w, prefix, 1, key.len());
            Ok(true)
        }
        PlanKind::MarkFinal => {
            drain_lazy_single(trie, level);
            trie.s_mark_final.fetch_add(1, Ordering::Relaxed);
            let newlen = w.ni.node_size as usize + valsize;
            let newcur = ctx.alloc(trie, newlen)?;
            clone_head(a, w.curr, newcur, &w.ni);
            let b0 = a.u8_at(bo(newcur));
            a.write_u8(bo(newcur), b0 | FLAG_FINAL);
            let valpos = bo(newcur) + w.ni.va_offset as usize;
            a.write_slice(valpos, value);
            tok.set_value(a.byte_ptr(valpos));
            publish_single(trie, a, level, &w, newcur, 0, key.len());
            Ok(true)
        }
    }
}

/// Copy skip cells, children (slot by slot) and the padded z-path of
/// `src` to `dst`; everything up to the value slot.
fn clone_head(a: Cells, src: u32, dst: u32, ni: &NodeInfo) {
    let skip = ni.skip as usize;
    let n = ni.n_children as usize;
    a.copy_bytes(bo(dst), bo(src), ALIGN * skip);
    for i in 0..n {
        a.write_cell(
            dst + (skip + i) as u32,
            a.child_relaxed(src + (skip + i) as u32),
        );
    }
    a.copy_bytes(
        bo(dst) + ni.zp_offset as usize,
        bo(src) + ni.zp_offset as usize,
        (ni.va_offset - ni.zp_offset) as usize,
    );
}

// ---- multi-writer engine ---------------------------------------------------

fn cell0_clear(raw: u32, bits: u8) -> u32 {
    let mut b = raw.to_ne_bytes();
    b[0] &= !bits;
    u32::from_ne_bytes(b)
}

fn cell0_set(raw: u32, bits: u8) -> u32 {
    let mut b = raw.to_ne_bytes();
    b[0] |= bits;
    u32::from_ne_bytes(b)
}

fn copy_backup(a: Cells, w: &Walk, backup: &mut [u32; 256]) {
    let skip = w.ni.skip as u32;
    for i in 0..w.ni.n_children as u32 {
        backup[i as usize] = a.child_relaxed(w.curr + skip + i);
    }
}

/// The concurrent commit protocol. On success the old node is queued on
/// the writer's lazy-free list and counters are recorded; on failure both
/// tentative flags are rolled back and the caller frees its side-built
/// nodes and retries.
#[allow(clippy::too_many_arguments)]
fn commit_mw(
    a: Cells,
    scratch: &mut WriterScratch,
    queue: &TokenQueue,
    w: &Walk,
    new_curr: u32,
    node_inc: usize,
    key_len: usize,
    backup: &[u32; 256],
) -> bool {
    debug_assert!(w.parent != NIL && w.slot != NIL);
    debug_assert!(!a.meta(new_curr).is_lazy_free());

    let p_raw = a.meta(w.parent).0;
    let p_unlock = cell0_clear(p_raw, FLAG_LAZY_FREE | FLAG_LOCK);
    let p_locked = cell0_set(p_unlock, FLAG_LOCK);
    if !a.cas_cell0(w.parent, p_unlock, p_locked) {
        return false;
    }
    let c_raw = a.meta(w.curr).0;
    let c_unlock = cell0_clear(c_raw, FLAG_LAZY_FREE | FLAG_LOCK);
    // lazy-free doubles as a lock here: once the slot CAS lands it is
    // permanent, readers may still walk the node until reclamation
    let c_tagged = cell0_set(c_unlock, FLAG_LAZY_FREE);
    if !a.cas_cell0(w.curr, c_unlock, c_tagged) {
        a.clear_flags(w.parent, FLAG_LOCK);
        return false;
    }
    let skip = w.ni.skip as u32;
    for i in 0..w.ni.n_children as u32 {
        if a.child_relaxed(w.curr + skip + i) != backup[i as usize] {
            a.clear_flags(w.curr, FLAG_LAZY_FREE);
            a.clear_flags(w.parent, FLAG_LOCK);
            return false;
        }
    }
    if !a.cas_child(w.slot, w.curr, new_curr) {
        a.clear_flags(w.curr, FLAG_LAZY_FREE);
        a.clear_flags(w.parent, FLAG_LOCK);
        return false;
    }
    a.clear_flags(w.parent, FLAG_LOCK);

    // the stamp covers every token enqueued before the slot CAS, which is
    // every token that can still hold a pointer into the old node
    let age = queue.tail_verseq();
    scratch.max_word_len = scratch.max_word_len.max(key_len as u64);
    scratch.n_nodes += node_inc as u64;
    scratch.n_words += 1;
    scratch.total_key_len += key_len as u64;
    scratch.total_zpath_len = scratch
        .total_zpath_len
        .wrapping_add((key_len as i64 - w.pos as i64 - node_inc as i64) as u64);
    scratch.lazy.push(LazyFreeItem {
        age,
        node: w.curr,
        size: align_up(w.ni.node_size as usize) as u32,
    });
    true
}

pub(crate) fn insert_multi(
    trie: &Patricia,
    tok: &mut WriterToken,
    key: &[u8],
    value: &[u8],
) -> Result<bool> {
    // SAFETY: cell is the token's live allocation for the whole call.
    let cell = unsafe { &*tok.cell };
    if cell.flags().is_head {
        if tok.scratch.lazy.mem_size > HEAD_SYNC_BYTES {
            tok.scratch.merge_counters(trie);
            // SAFETY: we are the acquired queue head.
            unsafe { trie.queue.update(tok.cell) };
        }
    } else if trie.queue.head_is_dead() {
        trie.queue.reclaim_head();
    } else if tok.scratch.lazy.mem_size > IDLE_NUDGE_BYTES && trie.queue.head_is_idle() {
        trie.queue.reclaim_head();
    }

    let mut backup = [0u32; 256];
    let backoff = Backoff::new();
    loop {
        match insert_multi_once(trie, &mut tok.scratch, cell, key, value, &mut backup)? {
            Some((created, vptr)) => {
                tok.set_value(vptr);
                return Ok(created);
            }
            None => {
                tok.scratch.n_retry += 1;
                log::trace!("[insert] retry {} key_len={}", tok.scratch.n_retry, key.len());
                backoff.spin();
            }
        }
    }
}

/// One attempt; `Ok(None)` means a plan-time or commit-time race, retry
/// from the root.
fn insert_multi_once(
    trie: &Patricia,
    scratch: &mut WriterScratch,
    cell: &TokenCell,
    key: &[u8],
    value: &[u8],
    backup: &mut [u32; 256],
) -> Result<Option<(bool, *mut u8)>> {
    let a = trie.cells();
    let valsize = trie.valsize;
    let (mut w, plan) = descend(a, key);
    match plan {
        PlanKind::Existed => Ok(Some((false, a.byte_ptr(w.valpos)))),
        PlanKind::MarkFinalFast => {
            let valpos = ALIGN * (ROOT as usize + 2 + 256);
            if a.or_flags(ROOT, FLAG_SET_FINAL) & FLAG_SET_FINAL != 0 {
                // lost the two-phase race; wait for the winner's value
                let spin = Backoff::new();
                while a.flags(ROOT) & FLAG_FINAL == 0 {
                    spin.spin();
                }
                return Ok(Some((false, a.byte_ptr(valpos))));
            }
            a.write_slice(valpos, value);
            a.or_flags(ROOT, FLAG_FINAL);
            scratch.n_words += 1;
            scratch.stat.n_mark_final += 1;
            scratch.total_key_len += key.len() as u64;
            Ok(Some((true, a.byte_ptr(valpos))))
        }
        PlanKind::AddStateFast => {
            scratch.stat.n_add_state_move += 1;
            drain_lazy_mw(trie, scratch, cell);
            let ch = key[w.pos];
            let mut ctx = AllocCtx::Cache(&mut scratch.bins);
            let (chain, valpos, chain_len) =
                new_suffix_chain(trie, &mut ctx, &key[w.pos + 1..], value)?;
            if a.cas_child(ROOT + 2 + u32::from(ch), NIL, chain) {
                a.bump_fast_live_children(ROOT);
                scratch.n_nodes += chain_len as u64;
                scratch.n_words += 1;
                scratch.total_key_len += key.len() as u64;
                scratch.total_zpath_len = scratch
                    .total_zpath_len
                    .wrapping_add((key.len() as i64 - w.pos as i64 - chain_len as i64) as u64);
                if w.pos + 1 < key.len() {
                    scratch.zpath_states += suffix_zpath_states(chain_len, w.pos, key.len());
                }
                scratch.max_word_len = scratch.max_word_len.max(key.len() as u64);
                Ok(Some((true, a.byte_ptr(valpos))))
            } else {
                let mut ctx = AllocCtx::Cache(&mut scratch.bins);
                revoke_chain(trie, &mut ctx, chain);
                Ok(None)
            }
        }
        PlanKind::AddState => {
            scratch.stat.n_add_state_move += 1;
            drain_lazy_mw(trie, scratch, cell);
            let ch = key[w.pos];
            let mut ctx = AllocCtx::Cache(&mut scratch.bins);
            let (chain, valpos, chain_len) =
                new_suffix_chain(trie, &mut ctx, &key[w.pos + 1..], value)?;
            if w.meta.zlen() == 0 {
                let vs = if w.meta.is_final() { valsize } else { 0 };
                w.ni.set(a, w.curr, w.meta, vs);
            } else if w.meta.is_final() {
                w.ni.node_size += valsize as u32;
            }
            copy_backup(a, &w, backup);
            let new_curr = match add_state_move(trie, &mut ctx, a, w.curr, w.meta, ch, chain) {
                Ok(n) => n,
                Err(e) => {
                    revoke_chain(trie, &mut ctx, chain);
                    return Err(e);
                }
            };
            if a.flags(new_curr) & (FLAG_LAZY_FREE | FLAG_LOCK) != 0 {
                // the copy caught curr mid-supersede
                ctx.free(trie, new_curr, node_size(a, new_curr, valsize));
                revoke_chain(trie, &mut ctx, chain);
                return Ok(None);
            }
            w.ni.new_suffix = chain;
            if commit_mw(a, scratch, &trie.queue, &w, new_curr, chain_len, key.len(), backup) {
                if w.pos + 1 < key.len() {
                    scratch.zpath_states += suffix_zpath_states(chain_len, w.pos, key.len());
                }
                Ok(Some((true, a.byte_ptr(valpos))))
            } else {
                free_plan(trie, scratch, a, &w, new_curr);
                Ok(None)
            }
        }
        PlanKind::Fork => {
            if w.meta.is_final() {
                w.ni.node_size += valsize as u32;
            }
            scratch.stat.n_fork += 1;
            drain_lazy_mw(trie, scratch, cell);
            let zlen = w.meta.zlen();
            let mut ctx = AllocCtx::Cache(&mut scratch.bins);
            let (chain, valpos, chain_len) =
                new_suffix_chain(trie, &mut ctx, &key[w.pos + 1..], value)?;
            copy_backup(a, &w, backup);
            let new_curr = match fork_branch(
                trie, &mut ctx, a, w.curr, &mut w.ni, zlen, w.zidx, key[w.pos], chain,
            ) {
                Ok(n) => n,
                Err(e) => {
                    revoke_chain(trie, &mut ctx, chain);
                    return Err(e);
                }
            };
            if a.flags(w.ni.old_suffix) & (FLAG_LAZY_FREE | FLAG_LOCK) != 0 {
                ctx.free(trie, new_curr, node_size(a, new_curr, valsize));
                ctx.free(
                    trie,
                    w.ni.old_suffix,
                    node_size(a, w.ni.old_suffix, valsize),
                );
                revoke_chain(trie, &mut ctx, chain);
                return Ok(None);
            }
            if commit_mw(
                a,
                scratch,
                &trie.queue,
                &w,
                new_curr,
                1 + chain_len,
                key.len(),
                backup,
            ) {
                let mut zinc = suffix_zpath_states(chain_len, w.pos, key.len());
                if zlen != 1 {
                    if w.zidx != 0 && w.zidx + 1 != zlen {
                        zinc += 1;
                    }
                } else {
                    zinc -= 1;
                }
                scratch.zpath_states += zinc;
                Ok(Some((true, a.byte_ptr(valpos))))
            } else {
                free_plan(trie, scratch, a, &w, new_curr);
                Ok(None)
            }
        }
        PlanKind::Split => {
            if w.meta.is_final() {
                w.ni.node_size += valsize as u32;
            }
            scratch.stat.n_split += 1;
            drain_lazy_mw(trie, scratch, cell);
            let zlen = w.meta.zlen();
            copy_backup(a, &w, backup);
            let mut ctx = AllocCtx::Cache(&mut scratch.bins);
            let (prefix, valpos) =
                split_zpath(trie, &mut ctx, a, w.curr, &mut w.ni, zlen, w.zidx, value)?;
            if a.flags(w.ni.old_suffix) & (FLAG_LAZY_FREE | FLAG_LOCK) != 0 {
                ctx.free(trie, prefix, node_size(a, prefix, valsize));
                ctx.free(
                    trie,
                    w.ni.old_suffix,
                    node_size(a, w.ni.old_suffix, valsize),
                );
                return Ok(None);
            }
            if commit_mw(a, scratch, &trie.queue, &w, prefix, 1, key.len(), backup) {
                if zlen != 1 {
                    if w.zidx != 0 && w.zidx + 1 != zlen {
                        scratch.zpath_states += 1;
                    }
                } else {
                    scratch.zpath_states -= 1;
                }
                Ok(Some((true, a.byte_ptr(valpos))))
            } else {
                free_plan(trie, scratch, a, &w, prefix);
                Ok(None)
            }
        }
        PlanKind::MarkFinal => {
            scratch.stat.n_mark_final += 1;
            drain_lazy_mw(trie, scratch, cell);
            let newlen = w.ni.node_size as usize + valsize;
            let mut ctx = AllocCtx::Cache(&mut scratch.bins);
            let newcur = ctx.alloc(trie, newlen)?;
            copy_backup(a, &w, backup);
            clone_head(a, w.curr, newcur, &w.ni);
            if a.flags(newcur) & (FLAG_LAZY_FREE | FLAG_LOCK) != 0 {
                ctx.free(trie, newcur, newlen);
                return Ok(None);
            }
            let b0 = a.u8_at(bo(newcur));
            a.write_u8(bo(newcur), b0 | FLAG_FINAL);
            let valpos = bo(newcur) + w.ni.va_offset as usize;
            a.write_slice(valpos, value);
            if commit_mw(a, scratch, &trie.queue, &w, newcur, 0, key.len(), backup) {
                Ok(Some((true, a.byte_ptr(valpos))))
            } else {
                free_plan(trie, scratch, a, &w, newcur);
                Ok(None)
            }
        }
    }
}

/// Free the side-built nodes of an aborted attempt (replacement node,
/// carved suffix, fresh chain).
fn free_plan(trie: &Patricia, scratch: &mut WriterScratch, a: Cells, w: &Walk, new_curr: u32) {
    let valsize = trie.valsize;
    let mut ctx = AllocCtx::Cache(&mut scratch.bins);
    ctx.free(trie, new_curr, node_size(a, new_curr, valsize));
    if w.ni.new_suffix != NIL {
        revoke_chain(trie, &mut ctx, w.ni.new_suffix);
    }
    if w.ni.old_suffix != NIL {
        ctx.free(
            trie,
            w.ni.old_suffix,
            node_size(a, w.ni.old_suffix, valsize),
        );
    }
}

fn drain_lazy_mw(trie: &Patricia, scratch: &mut WriterScratch, cell: &TokenCell) {
    let min_age = cell.min_age.load(Ordering::Relaxed);
    let WriterScratch { bins, lazy, .. } = scratch;
    lazy.drain_expired(min_age, |item| {
        trie.slab
            .free(item.node as usize * ALIGN, item.size as usize, Some(bins));
    });
}
