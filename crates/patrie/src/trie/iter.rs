// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ordered cursor.
//!
//! An explicit stack of `(node, n_children, nth_child, zpath_len)` frames
//! plus a byte buffer holding the current key. The word buffer layout is
//! `zpath(f0) edge(f0) zpath(f1) edge(f1) ... zpath(f_last)`: every frame
//! but the last contributes its z-path and the edge byte taken out of it.
//! Rewinding therefore pops `zpath_len + 1` bytes per frame and the byte
//! at the cut is always the edge to re-step.
//!
//! The cursor owns a reader token: every node on the stack stays readable
//! until the cursor releases or re-acquires, so `next`/`prev` are stable
//! even while writers keep inserting (point-in-time consistency for the
//! subtree already crossed).

use super::access::ReaderToken;
use super::{lookup, Patricia, ROOT};
use crate::mem::{align_up, ALIGN};
use crate::node::{search, Cells, Meta, NIL, SKIP_SLOTS};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct Frame {
    state: u32,
    n_children: u16,
    /// Child index for tags 1..8; the edge byte itself for the dense
    /// root (sibling steps there scan the child array by byte).
    nth_child: u8,
    zlen: u8,
}

impl Frame {
    #[inline]
    fn has_next(self) -> bool {
        u16::from(self.nth_child) + 1 < self.n_children
    }
}

/// Forward/backward/lower-bound cursor over a trie. See
/// [`Patricia::cursor`].
pub struct Cursor {
    token: ReaderToken,
    stack: Vec<Frame>,
    word: Vec<u8>,
    curr: u32,
    value: *const u8,
}

// SAFETY: single-owner handle like the token it wraps.
unsafe impl Send for Cursor {}

impl Patricia {
    /// Open a cursor holding its own reader token.
    pub fn cursor(self: &Arc<Self>) -> Cursor {
        Cursor {
            token: self.reader(),
            stack: Vec::with_capacity(16),
            word: Vec::with_capacity(128),
            curr: NIL,
            value: std::ptr::null(),
        }
    }
}

#[inline]
fn bo(id: u32) -> usize {
    id as usize * ALIGN
}

/// (n_children, absolute z-path byte offset, z-path length)
#[inline]
fn geom(a: Cells, id: u32, m: Meta) -> (usize, usize, usize) {
    let tag = m.tag();
    let skip = SKIP_SLOTS[tag as usize] as usize;
    let n = a.n_children(id, tag);
    (n, bo(id) + ALIGN * (skip + n), m.zlen())
}

impl Cursor {
    fn cells(&self) -> Cells {
        self.token.trie().cells()
    }

    fn valsize(&self) -> usize {
        self.token.trie().value_size()
    }

    fn reset_pos(&mut self) {
        self.stack.clear();
        self.word.clear();
        self.curr = NIL;
        self.value = std::ptr::null();
    }

    fn ensure_acquired(&mut self) {
        if !self.token.is_acquired() {
            self.token.acquire();
        }
    }

    /// The key the cursor is positioned at.
    pub fn key(&self) -> &[u8] {
        &self.word
    }

    /// Append the current key's bytes to a caller buffer, for consumers
    /// that assemble sorted key streams without re-copying per call.
    pub fn append_key(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.word);
    }

    /// The value slot of the current key.
    pub fn value(&self) -> Option<&[u8]> {
        if self.value.is_null() || self.stack.is_empty() {
            return None;
        }
        // SAFETY: value points at the current final node's slot, pinned by
        // the cursor's token.
        Some(unsafe { std::slice::from_raw_parts(self.value, self.valsize()) })
    }

    /// Positioned at a key?
    pub fn is_valid(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Release the underlying token (the position becomes invalid).
    pub fn release(&mut self) {
        self.reset_pos();
        self.token.release();
    }

    /// Position at the smallest key.
    pub fn seek_first(&mut self) -> bool {
        self.seek_lower_bound(b"")
    }

    /// Position at the largest key.
    pub fn seek_last(&mut self) -> bool {
        self.ensure_acquired();
        self.reset_pos();
        let a = self.cells();
        let m = a.meta(ROOT);
        if search::first_child(a, ROOT, m).is_none() && !m.is_final() {
            return false;
        }
        self.append_max_suffix(a, ROOT);
        true
    }

    /// Position at the smallest stored key `>= key`.
    pub fn seek_lower_bound(&mut self, key: &[u8]) -> bool {
        self.ensure_acquired();
        self.reset_pos();
        let a = self.cells();
        let mut curr = ROOT;
        let mut pos = 0usize;
        loop {
            let m = a.meta(curr);
            let (n, zp_off, zlen) = geom(a, curr, m);
            let zp = a.bytes(zp_off, zlen);
            if zlen != 0 {
                let kkn = key.len() - pos;
                let zkn = zlen.min(kkn);
                let mut cmp = 0i8;
                for i in 0..zkn {
                    if key[pos + i] != zp[i] {
                        cmp = if key[pos + i] < zp[i] { -1 } else { 1 };
                        break;
                    }
                }
                if cmp > 0 {
                    // key orders after everything below curr
                    return self.rewind_next(a);
                }
                if cmp < 0 || kkn <= zlen {
                    // the minimum of curr's subtree is the lower bound
                    self.stack.push(Frame {
                        state: curr,
                        n_children: n as u16,
                        nth_child: 0,
                        zlen: zlen as u8,
                    });
                    self.word.extend_from_slice(zp);
                    if m.is_final() {
                        self.curr = curr;
                        self.value = a.byte_ptr(zp_off + align_up(zlen));
                        return true;
                    }
                    let (ch, child) = search::first_child(a, curr, m)
                        .expect("non-final interior node has a child");
                    self.word.push(ch);
                    self.append_min_suffix(a, child);
                    return true;
                }
                pos += zlen;
            } else if key.len() == pos {
                self.stack.push(Frame {
                    state: curr,
                    n_children: n as u16,
                    nth_child: 0,
                    zlen: 0,
                });
                if m.is_final() {
                    self.curr = curr;
                    self.value = a.byte_ptr(zp_off);
                    return true;
                }
                match search::first_child(a, curr, m) {
                    Some((ch, child)) => {
                        self.word.push(ch);
                        self.append_min_suffix(a, child);
                        return true;
                    }
                    None => {
                        // empty dense root
                        self.reset_pos();
                        return false;
                    }
                }
            }
            let ch = key[pos];
            // locate the smallest edge >= ch, or back out
            let step = match m.tag() {
                0 => None,
                1 => {
                    if ch <= m.label(0) {
                        Some((0usize, m.label(0), a.child(curr + 1)))
                    } else {
                        None
                    }
                }
                2 => {
                    if ch > m.label(1) {
                        None
                    } else if ch <= m.label(0) {
                        Some((0, m.label(0), a.child(curr + 1)))
                    } else {
                        Some((1, m.label(1), a.child(curr + 2)))
                    }
                }
                tag @ 3..=6 => {
                    let labels = a.bytes(bo(curr) + 2, tag as usize);
                    let idx = search::lower_bound(labels, ch);
                    if idx < tag as usize {
                        Some((idx, labels[idx], a.child(curr + 2 + idx as u32)))
                    } else {
                        None
                    }
                }
                7 => {
                    let labels = a.bytes(bo(curr) + ALIGN, n);
                    let idx = search::lower_bound(labels, ch);
                    if idx < n {
                        Some((idx, labels[idx], a.child(curr + 5 + idx as u32)))
                    } else {
                        None
                    }
                }
                8 => {
                    let idx = search::rank_idx(a, curr, ch);
                    if idx < n {
                        let label = if search::bit_test(a, curr, ch) {
                            ch
                        } else {
                            search::next_one(a, curr, ch)
                        };
                        Some((idx, label, a.child(curr + 10 + idx as u32)))
                    } else {
                        None
                    }
                }
                15 => {
                    let mut found = None;
                    for ich in ch as usize..256 {
                        let c = a.child(curr + 2 + ich as u32);
                        if c != NIL {
                            found = Some((ich, ich as u8, c));
                            break;
                        }
                    }
                    found
                }
                t => unreachable!("bad tag {t}"),
            };
            let Some((idx, label, child)) = step else {
                return self.rewind_next(a);
            };
            self.stack.push(Frame {
                state: curr,
                n_children: n as u16,
                nth_child: idx as u8,
                zlen: zlen as u8,
            });
            self.word.extend_from_slice(zp);
            self.word.push(label);
            if label == ch {
                curr = child;
                pos += 1;
                continue;
            }
            self.append_min_suffix(a, child);
            return true;
        }
    }

    /// Advance to the next key in byte-lexicographic order.
    pub fn next(&mut self) -> bool {
        self.ensure_acquired();
        if self.stack.is_empty() {
            return false;
        }
        let a = self.cells();
        let m = a.meta(self.curr);
        if let Some((ch, child)) = search::first_child(a, self.curr, m) {
            // the current key is a proper prefix of its successor
            self.word.push(ch);
            self.append_min_suffix(a, child);
            return true;
        }
        if self.stack.len() == 1 {
            // positioned on a childless root: nothing orders after ""
            self.reset_pos();
            return false;
        }
        let mut top = self.stack.len();
        let mut len = self.word.len();
        'outer: loop {
            loop {
                top -= 1;
                if self.stack[top].has_next() {
                    break;
                }
                if top == 0 {
                    self.reset_pos();
                    return false;
                }
                len -= self.stack[top].zlen as usize + 1;
            }
            let prev_edge = self.word[len];
            self.stack.truncate(top + 1);
            let f = &mut self.stack[top];
            f.nth_child += 1;
            let id = f.state;
            let m = a.meta(id);
            let nth = f.nth_child as usize;
            let (ch, child) = match m.tag() {
                2 => (m.label(nth), a.child(id + 1 + nth as u32)),
                3..=6 => (a.u8_at(bo(id) + 2 + nth), a.child(id + 2 + nth as u32)),
                7 => (a.u8_at(bo(id) + ALIGN + nth), a.child(id + 5 + nth as u32)),
                8 => (search::next_one(a, id, prev_edge), a.child(id + 10 + nth as u32)),
                15 => {
                    let mut found = None;
                    for ich in (prev_edge as usize + 1)..256 {
                        let c = a.child(id + 2 + ich as u32);
                        if c != NIL {
                            found = Some((ich as u8, c));
                            break;
                        }
                    }
                    match found {
                        Some((ich, c)) => {
                            f.nth_child = ich;
                            (ich, c)
                        }
                        None => {
                            if top == 0 {
                                self.reset_pos();
                                return false;
                            }
                            len -= 1;
                            continue 'outer;
                        }
                    }
                }
                t => unreachable!("sibling step on tag {t}"),
            };
            self.word.truncate(len);
            self.word.push(ch);
            self.append_min_suffix(a, child);
            return true;
        }
    }

    /// Step back to the previous key; exact inverse of [`Cursor::next`].
    pub fn prev(&mut self) -> bool {
        self.ensure_acquired();
        if self.stack.is_empty() {
            return false;
        }
        let a = self.cells();
        let mut top = self.stack.len() - 1;
        if top == 0 {
            // current key sits on the root itself
            self.reset_pos();
            return false;
        }
        let mut len = self.word.len() - (self.stack[top].zlen as usize + 1);
        'outer: loop {
            loop {
                top -= 1;
                let f = self.stack[top];
                if f.nth_child != 0 {
                    break;
                }
                // leftmost edge everywhere below: an ancestor final node
                // is the predecessor
                if a.meta(f.state).is_final() {
                    self.stack.truncate(top + 1);
                    self.word.truncate(len);
                    let m = a.meta(f.state);
                    let (_, zp_off, zlen) = geom(a, f.state, m);
                    self.curr = f.state;
                    self.value = a.byte_ptr(zp_off + align_up(zlen));
                    return true;
                }
                if top == 0 {
                    self.reset_pos();
                    return false;
                }
                len -= f.zlen as usize + 1;
            }
            let prev_edge = self.word[len];
            self.stack.truncate(top + 1);
            self.word.truncate(len);
            let f = &mut self.stack[top];
            let id = f.state;
            let m = a.meta(id);
            let (ch, child) = match m.tag() {
                2 => {
                    f.nth_child -= 1;
                    let nth = f.nth_child as usize;
                    (m.label(nth), a.child(id + 1 + nth as u32))
                }
                3..=6 => {
                    f.nth_child -= 1;
                    let nth = f.nth_child as usize;
                    (a.u8_at(bo(id) + 2 + nth), a.child(id + 2 + nth as u32))
                }
                7 => {
                    f.nth_child -= 1;
                    let nth = f.nth_child as usize;
                    (a.u8_at(bo(id) + ALIGN + nth), a.child(id + 5 + nth as u32))
                }
                8 => {
                    f.nth_child -= 1;
                    let nth = f.nth_child as usize;
                    let ch = search::prev_one(a, id, prev_edge);
                    debug_assert_eq!(ch, search::select1(a, id, nth));
                    (ch, a.child(id + 10 + nth as u32))
                }
                15 => {
                    let mut found = None;
                    let mut ich = prev_edge;
                    while ich > 0 {
                        ich -= 1;
                        let c = a.child(id + 2 + u32::from(ich));
                        if c != NIL {
                            found = Some((ich, c));
                            break;
                        }
                    }
                    match found {
                        Some((ich, c)) => {
                            f.nth_child = ich;
                            (ich, c)
                        }
                        None => {
                            if m.is_final() {
                                f.nth_child = 0;
                                let (_, zp_off, zlen) = geom(a, id, m);
                                self.curr = id;
                                self.value = a.byte_ptr(zp_off + align_up(zlen));
                                return true;
                            }
                            if top == 0 {
                                self.reset_pos();
                                return false;
                            }
                            len -= 1;
                            continue 'outer;
                        }
                    }
                }
                t => unreachable!("sibling step on tag {t}"),
            };
            self.word.push(ch);
            self.append_max_suffix(a, child);
            return true;
        }
    }

    /// Position at the longest stored key that is a prefix of `key`;
    /// returns how many bytes of `key` matched structurally.
    pub fn seek_max_prefix(&mut self, key: &[u8]) -> usize {
        self.ensure_acquired();
        self.reset_pos();
        let a = self.cells();
        let mut last_stack_top = 0usize;
        let mut last_match_len = 0usize;
        let mut curr = ROOT;
        let mut pos = 0usize;
        loop {
            let m = a.meta(curr);
            let (n, zp_off, zlen) = geom(a, curr, m);
            self.stack.push(Frame {
                state: curr,
                n_children: n as u16,
                nth_child: 0,
                zlen: zlen as u8,
            });
            if zlen != 0 {
                let zkn = (key.len() - pos).min(zlen);
                let zp = a.bytes(zp_off, zlen);
                let mut matched = zkn;
                for (j, &b) in zp.iter().take(zkn).enumerate() {
                    if key[pos + j] != b {
                        matched = j;
                        break;
                    }
                }
                pos += matched;
                if matched < zlen {
                    break;
                }
            }
            if m.is_final() {
                last_stack_top = self.stack.len();
                last_match_len = pos;
            }
            if key.len() == pos {
                break;
            }
            match search::child_at(a, curr, m, key[pos]) {
                Some((child, slot)) => {
                    let skip = SKIP_SLOTS[m.tag() as usize];
                    let nth = slot - curr - skip;
                    self.stack.last_mut().expect("frame just pushed").nth_child = nth as u8;
                    curr = child;
                    pos += 1;
                }
                None => break,
            }
        }
        // restore the deepest final node seen on the way
        if last_stack_top > 0 {
            let frame = self.stack[last_stack_top - 1];
            self.stack.truncate(last_stack_top);
            self.stack[last_stack_top - 1].nth_child = 0;
            let m = a.meta(frame.state);
            let (_, zp_off, zlen) = geom(a, frame.state, m);
            self.curr = frame.state;
            self.value = a.byte_ptr(zp_off + align_up(zlen));
        } else {
            self.stack.clear();
            self.curr = NIL;
            self.value = std::ptr::null();
        }
        self.word.clear();
        self.word.extend_from_slice(&key[..last_match_len]);
        pos
    }

    /// Convenience: point lookup through the cursor's token.
    pub fn lookup(&mut self, key: &[u8]) -> Option<&[u8]> {
        self.ensure_acquired();
        let trie = Arc::clone(self.token.trie());
        let ptr = lookup::lookup_raw(&trie, key)?;
        // SAFETY: ptr is a slab value slot pinned by the cursor's token.
        Some(unsafe { std::slice::from_raw_parts(ptr, trie.value_size()) })
    }

    /// Descend along smallest edges from `start` down to the first final
    /// node, appending to the stack and word.
    fn append_min_suffix(&mut self, a: Cells, start: u32) {
        let mut curr = start;
        loop {
            let m = a.meta(curr);
            let (n, zp_off, zlen) = geom(a, curr, m);
            self.word.extend_from_slice(a.bytes(zp_off, zlen));
            if m.is_final() {
                self.stack.push(Frame {
                    state: curr,
                    n_children: n as u16,
                    nth_child: 0,
                    zlen: zlen as u8,
                });
                self.curr = curr;
                self.value = a.byte_ptr(zp_off + align_up(zlen));
                return;
            }
            let (ch, child) =
                search::first_child(a, curr, m).expect("non-final interior node has a child");
            self.stack.push(Frame {
                state: curr,
                n_children: n as u16,
                nth_child: if m.tag() == 15 { ch } else { 0 },
                zlen: zlen as u8,
            });
            self.word.push(ch);
            curr = child;
        }
    }

    /// Descend along largest edges from `start` to the deepest node.
    fn append_max_suffix(&mut self, a: Cells, start: u32) {
        let mut curr = start;
        loop {
            let m = a.meta(curr);
            let (n, zp_off, zlen) = geom(a, curr, m);
            self.word.extend_from_slice(a.bytes(zp_off, zlen));
            match search::last_child(a, curr, m) {
                Some((ch, child)) => {
                    let nth = if m.tag() == 15 { ch } else { (n - 1) as u8 };
                    self.stack.push(Frame {
                        state: curr,
                        n_children: n as u16,
                        nth_child: nth,
                        zlen: zlen as u8,
                    });
                    self.word.push(ch);
                    curr = child;
                }
                None => {
                    debug_assert!(m.is_final(), "childless node must be final");
                    self.stack.push(Frame {
                        state: curr,
                        n_children: n as u16,
                        nth_child: 0,
                        zlen: zlen as u8,
                    });
                    self.curr = curr;
                    self.value = a.byte_ptr(zp_off + align_up(zlen));
                    return;
                }
            }
        }
    }

    /// Back out of a failed descent: take the next sibling of the deepest
    /// frame that has one and min-descend from it.
    fn rewind_next(&mut self, a: Cells) -> bool {
        loop {
            let Some(&top) = self.stack.last() else {
                return false;
            };
            if top.has_next() {
                let ti = self.stack.len() - 1;
                let wlast = self.word.len() - 1;
                let f = &mut self.stack[ti];
                f.nth_child += 1;
                let id = f.state;
                let m = a.meta(id);
                let nth = f.nth_child as usize;
                let step = match m.tag() {
                    2 => Some((m.label(nth), a.child(id + 1 + nth as u32))),
                    3..=6 => Some((a.u8_at(bo(id) + 2 + nth), a.child(id + 2 + nth as u32))),
                    7 => Some((a.u8_at(bo(id) + ALIGN + nth), a.child(id + 5 + nth as u32))),
                    8 => Some((
                        search::next_one(a, id, self.word[wlast]),
                        a.child(id + 10 + nth as u32),
                    )),
                    15 => {
                        let mut found = None;
                        for ich in (self.word[wlast] as usize + 1)..256 {
                            let c = a.child(id + 2 + ich as u32);
                            if c != NIL {
                                found = Some((ich as u8, c));
                                break;
                            }
                        }
                        if let Some((ich, _)) = found {
                            f.nth_child = ich;
                        }
                        found
                    }
                    t => unreachable!("sibling step on tag {t}"),
                };
                if let Some((ch, child)) = step {
                    self.word[wlast] = ch;
                    self.append_min_suffix(a, child);
                    return true;
                }
                // dense-root scan exhausted: fall through to pop
            }
            if self.stack.len() == 1 {
                self.reset_pos();
                return false;
            }
            let f = self.stack.pop().expect("checked non-empty");
            self.word.truncate(self.word.len() - (f.zlen as usize + 1));
        }
    }
}
