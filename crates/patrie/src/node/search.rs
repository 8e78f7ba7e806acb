// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-tag child search.
//!
//! Given a node and an edge byte, locate the child id and the cell holding
//! it (the CAS target for writers). Small label sets use a single 16-byte
//! SSE4.2 ordered-equal scan when the build enables it, a branch-light
//! linear scan otherwise; tag 8 answers through its 256-bit bitmap and
//! 4-byte rank prefix; the dense root indexes directly.

use super::{Cells, Meta, NIL};
use crate::mem::ALIGN;

/// Find `ch` in a sorted label run of at most 16 bytes. Returns the index,
/// or `len` when absent.
#[cfg(all(target_arch = "x86_64", target_feature = "sse4.2"))]
#[inline]
pub(crate) fn search_byte(labels: *const u8, len: usize, ch: u8) -> usize {
    use core::arch::x86_64::{_mm_cmpestri, _mm_cvtsi32_si128, _mm_loadu_si128};
    debug_assert!(len <= 16);
    // SAFETY:
    // 1. labels points into the slab; the allocator keeps SCAN_SLACK
    //    committed past the watermark, so the full 16-byte load is mapped
    //    even when len < 16.
    // 2. lanes past `len` are masked off by the explicit-length form.
    unsafe {
        let needle = _mm_cvtsi32_si128(i32::from(ch));
        let hay = _mm_loadu_si128(labels.cast());
        // imm8 = unsigned bytes, equal-ordered, least significant index
        let idx = _mm_cmpestri::<12>(needle, 1, hay, len as i32) as usize;
        if idx < len {
            idx
        } else {
            len
        }
    }
}

/// Portable fallback: same contract as the SSE form.
#[cfg(not(all(target_arch = "x86_64", target_feature = "sse4.2")))]
#[inline]
pub(crate) fn search_byte(labels: *const u8, len: usize, ch: u8) -> usize {
    debug_assert!(len <= 16);
    let mut idx = 0;
    while idx < len {
        // SAFETY: idx < len, inside the label run.
        if unsafe { labels.add(idx).read() } == ch {
            return idx;
        }
        idx += 1;
    }
    len
}

/// First index whose label is `>= ch` in a sorted run, or `len`.
#[inline]
pub(crate) fn lower_bound(labels: &[u8], ch: u8) -> usize {
    let mut idx = 0;
    while idx < labels.len() && labels[idx] < ch {
        idx += 1;
    }
    idx
}

// ---- tag-8 bitmap + rank ---------------------------------------------------

#[inline]
fn bitmap_word(a: Cells, id: u32, word: usize) -> u64 {
    a.u64_unaligned(id as usize * ALIGN + 2 * ALIGN + word * 8)
}

#[inline]
fn rank_byte(a: Cells, id: u32, word: usize) -> usize {
    a.u8_at(id as usize * ALIGN + ALIGN + word) as usize
}

#[inline]
pub(crate) fn bit_test(a: Cells, id: u32, ch: u8) -> bool {
    (bitmap_word(a, id, ch as usize / 64) >> (ch as usize % 64)) & 1 != 0
}

/// Child index of `ch` in a tag-8 node: rank prefix byte plus a trailing
/// popcount. Only meaningful together with `bit_test`.
#[inline]
pub(crate) fn rank_idx(a: Cells, id: u32, ch: u8) -> usize {
    let word = ch as usize / 64;
    let w = bitmap_word(a, id, word);
    rank_byte(a, id, word) + (w & ((1u64 << (ch as usize % 64)) - 1)).count_ones() as usize
}

/// Smallest set bit strictly greater than `ch`; the caller guarantees one
/// exists.
pub(crate) fn next_one(a: Cells, id: u32, ch: u8) -> u8 {
    let mut word = ch as usize / 64;
    let w = bitmap_word(a, id, word) >> (ch as usize % 64) >> 1;
    if w != 0 {
        return ch + 1 + w.trailing_zeros() as u8;
    }
    loop {
        word += 1;
        debug_assert!(word < 4);
        let w = bitmap_word(a, id, word);
        if w != 0 {
            return (word * 64) as u8 + w.trailing_zeros() as u8;
        }
    }
}

/// Largest set bit strictly smaller than `ch`; the caller guarantees one
/// exists.
pub(crate) fn prev_one(a: Cells, id: u32, ch: u8) -> u8 {
    let mut word = ch as usize / 64;
    let w = bitmap_word(a, id, word) << (63 - ch as usize % 64) << 1;
    if w != 0 {
        return ch - 1 - w.leading_zeros() as u8;
    }
    loop {
        debug_assert!(word > 0);
        word -= 1;
        let w = bitmap_word(a, id, word);
        if w != 0 {
            return (word * 64 + 63) as u8 - w.leading_zeros() as u8;
        }
    }
}

/// Label of the `nth` set bit of a tag-8 node.
pub(crate) fn select1(a: Cells, id: u32, nth: usize) -> u8 {
    let mut word = 3;
    while rank_byte(a, id, word) > nth {
        word -= 1;
    }
    let mut w = bitmap_word(a, id, word);
    let mut rem = nth - rank_byte(a, id, word);
    let mut bit = 0;
    loop {
        let tz = w.trailing_zeros() as usize;
        bit += tz;
        if rem == 0 {
            return (word * 64 + bit) as u8;
        }
        w >>= tz + 1;
        bit += 1;
        rem -= 1;
    }
}

// ---- per-tag child lookup --------------------------------------------------

/// Locate the child for edge byte `ch`. Returns `(child_id, slot_cell)`;
/// the slot cell is the CAS target a structural insert rewrites.
pub(crate) fn child_at(a: Cells, id: u32, m: Meta, ch: u8) -> Option<(u32, u32)> {
    let tag = m.tag();
    match tag {
        0 => None,
        1 | 2 => {
            if m.label(0) == ch {
                let slot = id + 1;
                return Some((a.child(slot), slot));
            }
            if tag == 2 && m.label(1) == ch {
                let slot = id + 2;
                return Some((a.child(slot), slot));
            }
            None
        }
        3..=6 => {
            let n = tag as usize;
            let labels = a.byte_ptr(id as usize * ALIGN + 2);
            let idx = search_byte(labels, n, ch);
            if idx < n {
                let slot = id + 2 + idx as u32;
                Some((a.child(slot), slot))
            } else {
                None
            }
        }
        7 => {
            let n = a.n_children(id, tag);
            debug_assert!((7..=16).contains(&n));
            let labels = a.byte_ptr(id as usize * ALIGN + ALIGN);
            let idx = search_byte(labels, n, ch);
            if idx < n {
                let slot = id + 5 + idx as u32;
                Some((a.child(slot), slot))
            } else {
                None
            }
        }
        8 => {
            if bit_test(a, id, ch) {
                let slot = id + 10 + rank_idx(a, id, ch) as u32;
                Some((a.child(slot), slot))
            } else {
                None
            }
        }
        15 => {
            let slot = id + 2 + u32::from(ch);
            let child = a.child(slot);
            if child != NIL {
                Some((child, slot))
            } else {
                None
            }
        }
        _ => {
            debug_assert!(false, "bad tag {tag}");
            None
        }
    }
}

/// Smallest outgoing edge of a node: `(label, child_id)`.
pub(crate) fn first_child(a: Cells, id: u32, m: Meta) -> Option<(u8, u32)> {
    match m.tag() {
        0 => None,
        1 | 2 => Some((m.label(0), a.child(id + 1))),
        3..=6 => Some((m.label(0), a.child(id + 2))),
        7 => Some((a.u8_at(id as usize * ALIGN + ALIGN), a.child(id + 5))),
        8 => {
            for word in 0..4 {
                let w = bitmap_word(a, id, word);
                if w != 0 {
                    let ch = (word * 64) as u8 + w.trailing_zeros() as u8;
                    return Some((ch, a.child(id + 10)));
                }
            }
            debug_assert!(false, "tag 8 with empty bitmap");
            None
        }
        15 => {
            for ch in 0u32..256 {
                let child = a.child(id + 2 + ch);
                if child != NIL {
                    return Some((ch as u8, child));
                }
            }
            None // dense root may be empty
        }
        tag => {
            debug_assert!(false, "bad tag {tag}");
            None
        }
    }
}

/// Largest outgoing edge of a node: `(label, child_id)`.
pub(crate) fn last_child(a: Cells, id: u32, m: Meta) -> Option<(u8, u32)> {
    let tag = m.tag();
    match tag {
        0 => None,
        1 => Some((m.label(0), a.child(id + 1))),
        2 => Some((m.label(1), a.child(id + 2))),
        3..=6 => {
            let n = tag as u32;
            Some((
                a.u8_at(id as usize * ALIGN + 2 + n as usize - 1),
                a.child(id + 2 + n - 1),
            ))
        }
        7 => {
            let n = a.n_children(id, tag) as u32;
            Some((
                a.u8_at(id as usize * ALIGN + ALIGN + n as usize - 1),
                a.child(id + 5 + n - 1),
            ))
        }
        8 => {
            let n = a.n_children(id, tag) as u32;
            for word in (0..4).rev() {
                let w = bitmap_word(a, id, word);
                if w != 0 {
                    let ch = (word * 64 + 63) as u8 - w.leading_zeros() as u8;
                    return Some((ch, a.child(id + 10 + n - 1)));
                }
            }
            debug_assert!(false, "tag 8 with empty bitmap");
            None
        }
        15 => {
            for ch in (0u32..256).rev() {
                let child = a.child(id + 2 + ch);
                if child != NIL {
                    return Some((ch as u8, child));
                }
            }
            None
        }
        _ => {
            debug_assert!(false, "bad tag {tag}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_byte_hit_and_miss() {
        let labels = [b'b', b'd', b'f', b'k', b'm', b'q', b'z'];
        assert_eq!(search_byte(labels.as_ptr(), labels.len(), b'b'), 0);
        assert_eq!(search_byte(labels.as_ptr(), labels.len(), b'q'), 5);
        assert_eq!(search_byte(labels.as_ptr(), labels.len(), b'a'), 7);
        assert_eq!(search_byte(labels.as_ptr(), labels.len(), b'c'), 7);
        assert_eq!(search_byte(labels.as_ptr(), 0, b'c'), 0);
    }

    #[test]
    fn test_lower_bound() {
        let labels = [3u8, 9, 40, 200];
        assert_eq!(lower_bound(&labels, 0), 0);
        assert_eq!(lower_bound(&labels, 9), 1);
        assert_eq!(lower_bound(&labels, 10), 2);
        assert_eq!(lower_bound(&labels, 201), 4);
    }
}
