// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Read-only traversal.
//!
//! Never blocks and never retries: the slot CAS publishing a replacement
//! node is release-paired with the acquire load here, so a traversal sees
//! either the old node (still intact, pinned by the token's epoch) or the
//! fully written new one. One cache-line prefetch per hop.

use super::{Patricia, ROOT};
use crate::mem::{align_up, ALIGN};
use crate::node::{prefetch, search, SKIP_SLOTS};

/// Find `key`; returns a pointer to its value slot inside the slab. The
/// pointer stays valid until the calling token releases or advances past
/// the node's supersede version.
pub(crate) fn lookup_raw(trie: &Patricia, key: &[u8]) -> Option<*const u8> {
    let a = trie.cells();
    let mut curr = ROOT;
    let mut pos = 0usize;
    loop {
        let m = a.meta(curr);
        let zlen = m.zlen();
        if zlen != 0 {
            let tag = m.tag();
            let skip = SKIP_SLOTS[tag as usize] as usize;
            let n = a.n_children(curr, tag);
            let zp_off = curr as usize * ALIGN + ALIGN * (skip + n);
            let kkn = key.len() - pos;
            let zkn = zlen.min(kkn);
            let zp = a.bytes(zp_off, zlen);
            for (i, &b) in zp.iter().take(zkn).enumerate() {
                if key[pos + i] != b {
                    return None;
                }
            }
            if kkn <= zlen {
                if kkn == zlen && m.is_final() {
                    return Some(a.byte_ptr(zp_off + align_up(zlen)));
                }
                return None;
            }
            pos += zlen;
        } else if key.len() == pos {
            if m.is_final() {
                let tag = m.tag();
                let skip = SKIP_SLOTS[tag as usize] as usize;
                let n = a.n_children(curr, tag);
                return Some(a.byte_ptr(curr as usize * ALIGN + ALIGN * (skip + n)));
            }
            return None;
        }
        let ch = key[pos];
        let (child, _slot) = search::child_at(a, curr, m, ch)?;
        prefetch(a, child);
        curr = child;
        pos += 1;
    }
}
