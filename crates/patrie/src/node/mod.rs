// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packed trie-node layout over 4-byte cells.
//!
//! A node is a run of cells inside the slab; its id is `byte_offset / 4`.
//! The first cell carries the variant tag, the flag nibble and the z-path
//! length; what follows depends on the tag:
//!
//! ```text
//! tag 0      [meta      ]                                      leaf
//! tag 1..2   [meta|l0 l1] [child]*                             inline labels
//! tag 3..6   [meta|l0 l1] [l2..l5] [child]*                    inline labels
//! tag 7      [meta|cnt  ] [16 label bytes    ] [child]*        label block
//! tag 8      [meta|cnt  ] [rank4] [bitmap 32B] [child]*        bitmap+rank
//! tag 15     [meta|256  ] [pad|live] [child x 256] [value]     dense root
//! ```
//!
//! after the children: z-path bytes (padded to a cell), then the value
//! bytes iff the final flag is set. The value slot position is the same
//! trailing-aligned rule for every variant, so a caller-held value pointer
//! survives any number of flag updates on the node.
//!
//! Flag nibble (byte 0, high bits): `FINAL` a key ends here; `LAZY_FREE`
//! the node has been superseded (permanent once published); `SET_FINAL`
//! two-phase final mark on the dense root; `LOCK` parent-slot rewrite in
//! progress. Writers CAS the whole first cell, readers load it acquire.

pub(crate) mod search;

use crate::mem::{align_up, ALIGN};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

/// Nil node id (no child in this slot).
pub(crate) const NIL: u32 = u32::MAX;

/// A key ends at this node; a value slot trails the node body.
pub(crate) const FLAG_FINAL: u8 = 0x10;
/// Node superseded; still readable, never again written.
pub(crate) const FLAG_LAZY_FREE: u8 = 0x20;
/// Reserved two-phase final mark, dense root only.
pub(crate) const FLAG_SET_FINAL: u8 = 0x40;
/// Short-lived exclusive flag held across one parent-slot rewrite.
pub(crate) const FLAG_LOCK: u8 = 0x80;

/// Longest z-path stored inline in one node.
pub(crate) const MAX_ZPATH: usize = 254;

/// Chain link: cell0 + one child cell + a full z-path.
pub(crate) const LINK_NODE_SIZE: usize = ALIGN + ALIGN + MAX_ZPATH;

/// Cells to skip from the node start to its child array, per tag.
pub(crate) const SKIP_SLOTS: [u32; 16] = [
    1, 1, 1, // tag 0, 1, 2
    2, 2, 2, 2, // tag 3..6
    5,  // tag 7: n_children in [7, 16]
    10, // tag 8: n_children >= 17
    u32::MAX,
    u32::MAX,
    u32::MAX,
    u32::MAX,
    u32::MAX,
    u32::MAX,
    2, // tag 15: dense root, never has a z-path
];

/// Cells occupied by the dense root (meta + live-count + 256 children).
pub(crate) const FAST_NODE_CELLS: usize = 2 + 256;

/// Decoded first cell of a node.
#[derive(Clone, Copy)]
pub(crate) struct Meta(pub u32);

impl Meta {
    #[inline]
    pub fn flags(self) -> u8 {
        self.0.to_ne_bytes()[0]
    }
    #[inline]
    pub fn tag(self) -> u8 {
        self.flags() & 0x0F
    }
    #[inline]
    pub fn zlen(self) -> usize {
        self.0.to_ne_bytes()[1] as usize
    }
    #[inline]
    pub fn is_final(self) -> bool {
        self.flags() & FLAG_FINAL != 0
    }
    #[inline]
    pub fn is_lazy_free(self) -> bool {
        self.flags() & FLAG_LAZY_FREE != 0
    }
    /// Inline label bytes 0..1 (tags 1..6).
    #[inline]
    pub fn label(self, idx: usize) -> u8 {
        debug_assert!(idx < 2);
        self.0.to_ne_bytes()[2 + idx]
    }
}

/// Raw cell-indexed view over the slab. Copyable; all methods take node or
/// cell indices, never pointers, so call sites read like the layout above.
#[derive(Clone, Copy)]
pub(crate) struct Cells {
    base: *mut u8,
}

// SAFETY: Cells is a typed window over the slab region. Mutation happens
// either on unpublished nodes (exclusively owned by the building writer)
// or through the atomic accessors below; the region outlives every Cells
// (enforced by the trie, which owns the slab and hands out Cells per op).
unsafe impl Send for Cells {}
unsafe impl Sync for Cells {}

impl Cells {
    #[inline]
    pub(crate) fn new(base: *mut u8) -> Self {
        Self { base }
    }

    #[inline]
    pub(crate) fn byte_ptr(self, byte_off: usize) -> *mut u8 {
        // SAFETY: callers only pass offsets inside the slab's used prefix;
        // the allocator keeps SCAN_SLACK committed past the watermark.
        unsafe { self.base.add(byte_off) }
    }

    #[inline]
    fn cell_ptr(self, cell: u32) -> *mut u8 {
        self.byte_ptr(cell as usize * ALIGN)
    }

    // ---- atomic accessors -------------------------------------------------

    /// First cell of a node, acquire: pairs with the release publication of
    /// the node id into its parent slot and with release flag updates.
    #[inline]
    pub(crate) fn meta(self, id: u32) -> Meta {
        // SAFETY: cell is 4-aligned inside the slab; AtomicU32 has the same
        // layout as the raw cell.
        let cell = unsafe { &*self.cell_ptr(id).cast::<AtomicU32>() };
        Meta(cell.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn cas_cell0(self, id: u32, old: u32, new: u32) -> bool {
        // SAFETY: as in `meta`.
        let cell = unsafe { &*self.cell_ptr(id).cast::<AtomicU32>() };
        cell.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn flags(self, id: u32) -> u8 {
        // SAFETY: byte 0 of the cell; AtomicU8 is layout-identical.
        let b = unsafe { &*self.cell_ptr(id).cast::<AtomicU8>() };
        b.load(Ordering::Acquire)
    }

    /// Returns the previous flag byte.
    #[inline]
    pub(crate) fn or_flags(self, id: u32, bits: u8) -> u8 {
        // SAFETY: as in `flags`.
        let b = unsafe { &*self.cell_ptr(id).cast::<AtomicU8>() };
        b.fetch_or(bits, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn clear_flags(self, id: u32, bits: u8) {
        // SAFETY: as in `flags`.
        let b = unsafe { &*self.cell_ptr(id).cast::<AtomicU8>() };
        b.fetch_and(!bits, Ordering::Release);
    }

    /// Child slot load, acquire: a non-nil id read here observes the fully
    /// written node body behind it.
    #[inline]
    pub(crate) fn child(self, slot_cell: u32) -> u32 {
        // SAFETY: child slots are 4-aligned cells inside the slab.
        let cell = unsafe { &*self.cell_ptr(slot_cell).cast::<AtomicU32>() };
        cell.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn child_relaxed(self, slot_cell: u32) -> u32 {
        // SAFETY: as in `child`.
        let cell = unsafe { &*self.cell_ptr(slot_cell).cast::<AtomicU32>() };
        cell.load(Ordering::Relaxed)
    }

    /// Single-writer publication of a new child id.
    #[inline]
    pub(crate) fn store_child(self, slot_cell: u32, id: u32) {
        // SAFETY: as in `child`.
        let cell = unsafe { &*self.cell_ptr(slot_cell).cast::<AtomicU32>() };
        cell.store(id, Ordering::Release);
    }

    /// Multi-writer publication; release on success so readers see the new
    /// node's body.
    #[inline]
    pub(crate) fn cas_child(self, slot_cell: u32, old: u32, new: u32) -> bool {
        // SAFETY: as in `child`.
        let cell = unsafe { &*self.cell_ptr(slot_cell).cast::<AtomicU32>() };
        cell.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Live-child counter of the dense root (second cell, high half).
    #[inline]
    pub(crate) fn fast_live_children(self, id: u32) -> u16 {
        // SAFETY: 2-aligned halfword inside the node.
        let h = unsafe { &*self.cell_ptr(id + 1).add(2).cast::<AtomicU16>() };
        h.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn bump_fast_live_children(self, id: u32) {
        // SAFETY: as in `fast_live_children`.
        let h = unsafe { &*self.cell_ptr(id + 1).add(2).cast::<AtomicU16>() };
        h.fetch_add(1, Ordering::Relaxed);
    }

    // ---- plain reads of published-immutable bytes -------------------------

    #[inline]
    pub(crate) fn u8_at(self, byte_off: usize) -> u8 {
        // SAFETY: offset inside the slab; byte is immutable once published.
        unsafe { self.byte_ptr(byte_off).read() }
    }

    /// Little-endian 64-bit load; bitmap words are byte-addressed on disk
    /// so the image stays portable across endianness.
    #[inline]
    pub(crate) fn u64_unaligned(self, byte_off: usize) -> u64 {
        // SAFETY: 8 bytes inside the slab; read_unaligned tolerates the
        // 4-byte cell grid.
        u64::from_le(unsafe { self.byte_ptr(byte_off).cast::<u64>().read_unaligned() })
    }

    /// Immutable byte slice inside a published node (labels, z-path).
    #[inline]
    pub(crate) fn bytes(self, byte_off: usize, len: usize) -> &'static [u8] {
        // SAFETY: the range lies inside a published node; published node
        // bytes are never rewritten (supersede-and-swap discipline), and
        // the slab mapping outlives every traversal holding the slice.
        unsafe { std::slice::from_raw_parts(self.byte_ptr(byte_off), len) }
    }

    /// Number of outgoing edges. For the dense root this is the slot count
    /// (256), not the live count. Tags 7 and 8 store the count in bytes
    /// 2..4 of the first cell; read through the atomic cell load since
    /// writers CAS the whole cell when flipping flag bits.
    #[inline]
    pub(crate) fn n_children(self, id: u32, tag: u8) -> usize {
        if tag <= 6 {
            tag as usize
        } else if tag == 15 {
            256
        } else {
            let b = self.meta(id).0.to_ne_bytes();
            u16::from_ne_bytes([b[2], b[3]]) as usize
        }
    }

    // ---- plain writes on unpublished nodes --------------------------------

    #[inline]
    pub(crate) fn write_cell(self, cell: u32, v: u32) {
        // SAFETY: the node is unpublished; this writer owns it exclusively.
        unsafe { self.cell_ptr(cell).cast::<u32>().write(v) }
    }

    #[inline]
    pub(crate) fn write_u8(self, byte_off: usize, v: u8) {
        // SAFETY: as in `write_cell`.
        unsafe { self.byte_ptr(byte_off).write(v) }
    }

    #[inline]
    pub(crate) fn write_u16(self, byte_off: usize, v: u16) {
        debug_assert_eq!(byte_off % 2, 0);
        // SAFETY: as in `write_cell`; offset is 2-aligned.
        unsafe { self.byte_ptr(byte_off).cast::<u16>().write(v) }
    }

    #[inline]
    pub(crate) fn copy_bytes(self, dst_off: usize, src_off: usize, len: usize) {
        // SAFETY: destination node unpublished; source bytes immutable;
        // distinct nodes never overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.byte_ptr(src_off), self.byte_ptr(dst_off), len);
        }
    }

    #[inline]
    pub(crate) fn fill_bytes(self, dst_off: usize, v: u8, len: usize) {
        // SAFETY: as in `write_cell`.
        unsafe { self.byte_ptr(dst_off).write_bytes(v, len) }
    }

    #[inline]
    pub(crate) fn write_slice(self, dst_off: usize, src: &[u8]) {
        // SAFETY: as in `write_cell`; src is a caller buffer outside the slab.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.byte_ptr(dst_off), src.len());
        }
    }
}

/// Total bytes of a node, derived from the node itself (unaligned; the
/// allocator aligns on both alloc and free).
pub(crate) fn node_size(a: Cells, id: u32, valsize: usize) -> usize {
    let m = a.meta(id);
    let tag = m.tag();
    let n = a.n_children(id, tag);
    let skip = SKIP_SLOTS[tag as usize] as usize;
    m.zlen() + ALIGN * (skip + n) + if m.is_final() { valsize } else { 0 }
}

/// Derived geometry of one node, captured once per structural operation.
#[derive(Clone, Copy)]
pub(crate) struct NodeInfo {
    pub skip: u16,
    pub n_children: u16,
    /// Byte offset, from the node start, of the z-path.
    pub zp_offset: u32,
    /// Byte offset, from the node start, of the value slot.
    pub va_offset: u32,
    /// Total byte size (z-path + cells + value if final).
    pub node_size: u32,
    /// Outputs of fork/split planning.
    pub old_suffix: u32,
    pub new_suffix: u32,
}

impl NodeInfo {
    pub(crate) fn new() -> Self {
        Self {
            skip: u16::MAX,
            n_children: u16::MAX,
            zp_offset: NIL,
            va_offset: NIL,
            node_size: NIL,
            old_suffix: NIL,
            new_suffix: NIL,
        }
    }

    /// `valsize` is the value-slot size to account for: 0 unless the
    /// caller knows the node is final and wants the slot counted.
    pub(crate) fn set(&mut self, a: Cells, id: u32, m: Meta, valsize: usize) {
        let tag = m.tag();
        debug_assert!(tag <= 8 || tag == 15);
        let skip = SKIP_SLOTS[tag as usize];
        let n = a.n_children(id, tag);
        self.skip = skip as u16;
        self.n_children = n as u16;
        self.zp_offset = (ALIGN * (skip as usize + n)) as u32;
        self.va_offset = self.zp_offset + align_up(m.zlen()) as u32;
        self.node_size = self.va_offset + valsize as u32;
    }

    /// Z-path bytes of `id` (length from its meta).
    #[inline]
    pub(crate) fn zpath(&self, a: Cells, id: u32, zlen: usize) -> &'static [u8] {
        a.bytes(id as usize * ALIGN + self.zp_offset as usize, zlen)
    }

    /// Size of the suffix node a fork/split carves out of `id` at z-path
    /// index `zidx`: same cells and value, z-path shortened past `zidx`.
    #[inline]
    pub(crate) fn suffix_node_size(&self, zlen: usize, zidx: usize) -> usize {
        self.node_valsize() + self.zp_offset as usize + zlen - zidx - 1
    }

    #[inline]
    pub(crate) fn node_valsize(&self) -> usize {
        (self.node_size - self.va_offset) as usize
    }
}

/// One-cache-line prefetch of a node about to be visited.
#[inline]
pub(crate) fn prefetch(a: Cells, id: u32) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch is a hint; any address is allowed.
    unsafe {
        use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(a.byte_ptr(id as usize * ALIGN).cast::<i8>());
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (a, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{Region, Slab};

    #[test]
    fn test_meta_decode() {
        let m = Meta(u32::from_ne_bytes([0x12 | FLAG_FINAL, 7, b'a', b'z']));
        assert_eq!(m.tag(), 2);
        assert!(m.is_final());
        assert!(!m.is_lazy_free());
        assert_eq!(m.zlen(), 7);
        assert_eq!(m.label(0), b'a');
        assert_eq!(m.label(1), b'z');
    }

    #[test]
    fn test_fast_root_live_counter() {
        let slab = Slab::new(Region::anon(1 << 20, false).expect("reserve"), 2048);
        let a = Cells::new(slab.base());
        let pos = slab.alloc(ALIGN * FAST_NODE_CELLS, None);
        let id = (pos / ALIGN) as u32;
        a.write_cell(id, u32::from_ne_bytes([15, 0, 0, 1])); // n_children = 256
        a.write_cell(id + 1, 0);
        assert_eq!(a.fast_live_children(id), 0);
        a.bump_fast_live_children(id);
        a.bump_fast_live_children(id);
        assert_eq!(a.fast_live_children(id), 2);
        assert_eq!(a.n_children(id, 15), 256);
    }

    #[test]
    fn test_node_size_per_tag() {
        let slab = Slab::new(Region::anon(1 << 20, false).expect("reserve"), 2048);
        let a = Cells::new(slab.base());
        // tag 2 node, zlen 3, not final: [meta|l0 l1][c][c] + 3 zpath bytes
        let pos = slab.alloc(ALIGN * 3 + 3, None);
        let id = (pos / ALIGN) as u32;
        a.write_cell(id, u32::from_ne_bytes([2, 3, b'a', b'b']));
        a.write_cell(id + 1, 77);
        a.write_cell(id + 2, 78);
        a.write_slice(pos + ALIGN * 3, b"xyz");
        assert_eq!(node_size(a, id, 8), ALIGN * 3 + 3);

        let mut ni = NodeInfo::new();
        ni.set(a, id, a.meta(id), 0);
        assert_eq!(ni.skip, 1);
        assert_eq!(ni.n_children, 2);
        assert_eq!(ni.zp_offset, 12);
        assert_eq!(ni.va_offset, 16); // zpath padded to a cell
        assert_eq!(ni.zpath(a, id, 3), b"xyz");
    }
}
