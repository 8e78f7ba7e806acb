// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Size-classed slab allocator over a [`Region`].
//!
//! Allocation is a per-size-class free-bin pop, falling back to an atomic
//! bump of the used watermark. Every node size is a small multiple of the
//! cell size, so classes are exact: bin `n` recycles ranges of exactly
//! `n * ALIGN` bytes and a free never needs splitting or coalescing.
//!
//! Writers in the multi-writer mode own a [`BinCache`] fronting the shared
//! pool: pops and pushes hit thread-owned vectors, refilling from /
//! spilling to the mutex-protected pool in small batches.

use super::region::Region;
use super::{align_up, ALIGN, ALLOC_FAIL, SCAN_SLACK};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Entries moved from the shared pool into a cache per refill.
const REFILL_BATCH: usize = 8;

/// Cache bin length that triggers a spill of half the bin.
const CACHE_SPILL: usize = 64;

/// Free ranges bucketed by exact size class (`size / ALIGN`).
struct FreeBins {
    bins: Vec<Vec<u32>>,
}

impl FreeBins {
    fn new(max_units: usize) -> Self {
        Self {
            bins: (0..=max_units).map(|_| Vec::new()).collect(),
        }
    }
}

/// Per-writer unlocked front for the shared free bins.
pub(crate) struct BinCache {
    bins: Vec<Vec<u32>>,
    /// Bytes currently parked in this cache.
    held: usize,
}

impl BinCache {
    fn new(max_units: usize) -> Self {
        Self {
            bins: (0..=max_units).map(|_| Vec::new()).collect(),
            held: 0,
        }
    }
}

/// The slab: bump watermark + free bins over one region.
pub(crate) struct Slab {
    region: Region,
    used: AtomicUsize,
    /// Bytes parked in the shared bins (diagnostic only).
    frag: AtomicUsize,
    shared: Mutex<FreeBins>,
    max_units: usize,
}

impl Slab {
    /// `max_node_size` bounds the largest allocation this trie can make
    /// (dense root plus value slot); it fixes the bin count.
    pub(crate) fn new(region: Region, max_node_size: usize) -> Self {
        let max_units = align_up(max_node_size) / ALIGN;
        Self {
            region,
            used: AtomicUsize::new(0),
            frag: AtomicUsize::new(0),
            shared: Mutex::new(FreeBins::new(max_units)),
            max_units,
        }
    }

    /// Restore a slab over a loaded read-only image: the watermark is the
    /// image length and nothing is ever allocated again.
    pub(crate) fn for_image(region: Region, used: usize) -> Self {
        let slab = Self::new(region, 0);
        slab.used.store(used, Ordering::Relaxed);
        slab
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.region.base()
    }

    #[inline]
    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.region.cap()
    }

    pub(crate) fn frag_bytes(&self) -> usize {
        self.frag.load(Ordering::Relaxed)
    }

    pub(crate) fn region(&self) -> &Region {
        &self.region
    }

    pub(crate) fn new_cache(&self) -> BinCache {
        BinCache::new(self.max_units)
    }

    /// Allocate `size` bytes (rounded up to a cell multiple). Returns the
    /// byte offset, or `ALLOC_FAIL` when the reservation is exhausted.
    pub(crate) fn alloc(&self, size: usize, cache: Option<&mut BinCache>) -> usize {
        let size = align_up(size);
        let units = size / ALIGN;
        debug_assert!(units > 0 && units <= self.max_units);

        if let Some(cache) = cache {
            if let Some(pos) = cache.bins[units].pop() {
                cache.held -= size;
                return pos as usize * ALIGN;
            }
            // refill a small batch from the shared pool
            let mut shared = self.shared.lock();
            if let Some(pos) = shared.bins[units].pop() {
                let n = shared.bins[units].len().min(REFILL_BATCH - 1);
                let tail = shared.bins[units].len() - n;
                cache.bins[units].extend(shared.bins[units].drain(tail..));
                drop(shared);
                self.frag.fetch_sub((n + 1) * size, Ordering::Relaxed);
                cache.held += n * size;
                return pos as usize * ALIGN;
            }
        } else {
            let mut shared = self.shared.lock();
            if let Some(pos) = shared.bins[units].pop() {
                drop(shared);
                self.frag.fetch_sub(size, Ordering::Relaxed);
                return pos as usize * ALIGN;
            }
        }
        self.bump(size)
    }

    /// Return `size` bytes at `pos` to the free bins.
    pub(crate) fn free(&self, pos: usize, size: usize, cache: Option<&mut BinCache>) {
        let size = align_up(size);
        let units = size / ALIGN;
        debug_assert!(pos % ALIGN == 0 && pos + size <= self.used());
        debug_assert!(units <= self.max_units);
        let cell = (pos / ALIGN) as u32;

        if let Some(cache) = cache {
            cache.bins[units].push(cell);
            cache.held += size;
            if cache.bins[units].len() >= CACHE_SPILL {
                let half = cache.bins[units].len() / 2;
                let mut shared = self.shared.lock();
                shared.bins[units].extend(cache.bins[units].drain(..half));
                drop(shared);
                cache.held -= half * size;
                self.frag.fetch_add(half * size, Ordering::Relaxed);
            }
        } else {
            self.shared.lock().bins[units].push(cell);
            self.frag.fetch_add(size, Ordering::Relaxed);
        }
    }

    /// Move everything a retiring writer still holds into the shared pool.
    pub(crate) fn drain_cache(&self, cache: &mut BinCache) {
        if cache.held == 0 {
            return;
        }
        let mut shared = self.shared.lock();
        for (units, bin) in cache.bins.iter_mut().enumerate() {
            if !bin.is_empty() {
                self.frag
                    .fetch_add(bin.len() * units * ALIGN, Ordering::Relaxed);
                shared.bins[units].append(bin);
            }
        }
        cache.held = 0;
    }

    /// Bin-less bump allocation for ranges larger than any node (the
    /// application-data region).
    pub(crate) fn alloc_huge(&self, size: usize) -> usize {
        self.bump(align_up(size))
    }

    fn bump(&self, size: usize) -> usize {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let end = cur + size;
            if end + SCAN_SLACK > self.region.cap() {
                return ALLOC_FAIL;
            }
            match self
                .used
                .compare_exchange_weak(cur, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return cur,
                Err(seen) => cur = seen,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_slab() -> Slab {
        let region = Region::anon(1 << 20, false).expect("reserve");
        Slab::new(region, 2048)
    }

    #[test]
    fn test_bump_is_aligned_and_monotone() {
        let slab = small_slab();
        let a = slab.alloc(10, None);
        let b = slab.alloc(30, None);
        assert_eq!(a % ALIGN, 0);
        assert_eq!(b, a + align_up(10));
    }

    #[test]
    fn test_free_then_alloc_recycles_exact_class() {
        let slab = small_slab();
        let a = slab.alloc(264, None);
        let _gap = slab.alloc(64, None);
        slab.free(a, 264, None);
        // same class comes back from the bin, different class bumps
        assert_eq!(slab.alloc(264, None), a);
        assert_ne!(slab.alloc(260, None), a);
    }

    #[test]
    fn test_cache_refills_and_spills() {
        let slab = small_slab();
        let mut cache = slab.new_cache();
        let mut held = Vec::new();
        for _ in 0..CACHE_SPILL {
            held.push(slab.alloc(40, Some(&mut cache)));
        }
        for pos in held {
            slab.free(pos, 40, Some(&mut cache));
        }
        // spill moved half of the bin into the shared pool
        assert!(slab.frag_bytes() > 0);
        let mut cache2 = slab.new_cache();
        let p = slab.alloc(40, Some(&mut cache2));
        assert_ne!(p, ALLOC_FAIL);
        slab.drain_cache(&mut cache2);
    }

    #[test]
    fn test_alloc_fail_at_cap() {
        let region = Region::anon(512 << 10, false).expect("reserve");
        let slab = Slab::new(region, 1 << 16);
        let mut n = 0usize;
        while slab.alloc(1 << 16, None) != ALLOC_FAIL {
            n += 1;
            assert!(n < 1 << 20, "allocator never reported exhaustion");
        }
    }
}
