// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mmap-backed slab regions.
//!
//! Three flavors share one wrapper:
//!
//! 1. Anonymous reservation: `mmap(PROT_READ|PROT_WRITE, MAP_NORESERVE)` of
//!    the full cap; pages are committed by first touch. The pre-commit
//!    variant adds `MAP_POPULATE` and rounds the cap to the huge page size.
//! 2. File-backed writable: the trie lives inside a mapped file, behind a
//!    page-sized header slot that `set_readonly` fills in.
//! 3. File-backed read-only: a loaded image.
//!
//! The mapping address never changes once created; node ids stay valid for
//! the life of the trie. `shrink` releases the unused tail when the trie
//! goes read-only.

use crate::error::{Result, TrieError};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Page-aligned space reserved at the start of a backing file for the
/// image header.
pub(crate) const HEADER_RESERVED: usize = 4096;

const PAGE: usize = 4096;
const HUGE_PAGE: usize = 2 << 20;

enum Backing {
    Anon,
    File { file: File, readonly: AtomicBool },
}

/// One mapped byte range. `base()` points at the slab data (past the
/// header slot for file-backed regions) and is stable until drop.
///
/// `shrink` runs once, serialized by the trie's read-only transition;
/// `map_len`/`cap` are atomics only so it can run behind a shared
/// reference.
pub(crate) struct Region {
    map: *mut u8,
    map_len: AtomicUsize,
    data_off: usize,
    cap: AtomicUsize,
    backing: Backing,
}

// SAFETY: Region hands out raw pointers into a mapping that is valid for
// map_len bytes until drop; all concurrent access goes through atomics or
// published-then-immutable bytes, enforced by the slab and node layers.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Reserve `cap` bytes of anonymous memory. `precommit` populates the
    /// pages up front and rounds the reservation to the huge page size.
    pub(crate) fn anon(cap: usize, precommit: bool) -> Result<Self> {
        let cap = if precommit {
            (cap + HUGE_PAGE - 1) & !(HUGE_PAGE - 1)
        } else {
            cap
        };
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        if precommit {
            flags |= libc::MAP_POPULATE;
        }
        // SAFETY:
        // 1. addr is null: the kernel picks a free range.
        // 2. cap is nonzero (clamped to >= 512 KiB by the config layer).
        // 3. PROT_READ|PROT_WRITE with MAP_ANONYMOUS needs no fd (-1).
        // 4. mmap returns MAP_FAILED on error, checked below.
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                cap,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(TrieError::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            map: map.cast(),
            map_len: AtomicUsize::new(cap),
            data_off: 0,
            cap: AtomicUsize::new(cap),
            backing: Backing::Anon,
        })
    }

    /// Create (or truncate) `path` and map `HEADER_RESERVED + cap` bytes of
    /// it writable. The header slot stays zeroed until `set_readonly`.
    pub(crate) fn file(path: &Path, cap: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let total = HEADER_RESERVED + cap;
        // SAFETY: fd is valid for the just-opened file; ftruncate to the
        // full mapping size so stores through the mapping cannot SIGBUS.
        let rc = unsafe { libc::ftruncate(file.as_raw_fd(), total as libc::off_t) };
        if rc < 0 {
            return Err(TrieError::Io(io::Error::last_os_error()));
        }
        // SAFETY:
        // 1. addr null, kernel-chosen; total bytes exist in the file.
        // 2. MAP_SHARED so the bytes land in the file.
        // 3. MAP_FAILED checked below.
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(TrieError::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            map: map.cast(),
            map_len: AtomicUsize::new(total),
            data_off: HEADER_RESERVED,
            cap: AtomicUsize::new(cap),
            backing: Backing::File {
                file,
                readonly: AtomicBool::new(false),
            },
        })
    }

    /// Map an existing image read-only. The caller validates the header.
    pub(crate) fn file_readonly(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let total = file.metadata()?.len() as usize;
        if total < HEADER_RESERVED {
            return Err(TrieError::Corruption(format!(
                "image file is {total} bytes, smaller than its header"
            )));
        }
        // SAFETY: total bytes exist in the file (just measured); PROT_READ
        // only; MAP_FAILED checked below.
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(TrieError::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            map: map.cast(),
            map_len: AtomicUsize::new(total),
            data_off: HEADER_RESERVED,
            cap: AtomicUsize::new(total - HEADER_RESERVED),
            backing: Backing::File {
                file,
                readonly: AtomicBool::new(true),
            },
        })
    }

    /// Start of the slab data.
    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        // SAFETY: data_off <= map_len by construction.
        unsafe { self.map.add(self.data_off) }
    }

    /// Reserved slab bytes (excluding any header slot).
    #[inline]
    pub(crate) fn cap(&self) -> usize {
        self.cap.load(Ordering::Relaxed)
    }

    /// Start of the header slot, or None for anonymous regions.
    pub(crate) fn header_ptr(&self) -> Option<*mut u8> {
        match self.backing {
            Backing::File { .. } => Some(self.map),
            Backing::Anon => None,
        }
    }

    pub(crate) fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::File { .. })
    }

    /// Release everything past `used` data bytes. File-backed regions are
    /// flushed, unmapped past the used prefix and truncated into a
    /// self-describing image; anonymous regions drop the tail pages but
    /// keep the address range reserved.
    pub(crate) fn shrink(&self, used: usize) -> Result<()> {
        debug_assert!(used <= self.cap());
        let keep = self.data_off + used;
        let keep_aligned = (keep + PAGE - 1) & !(PAGE - 1);
        let map_len = self.map_len.load(Ordering::Acquire);
        match &self.backing {
            Backing::File { file, readonly } => {
                if readonly.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                // SAFETY: [map, keep_aligned) is within the live mapping;
                // MS_ASYNC schedules writeback without blocking.
                unsafe {
                    libc::msync(self.map.cast(), keep_aligned, libc::MS_ASYNC);
                }
                if keep_aligned < map_len {
                    // SAFETY: the tail [keep_aligned, map_len) is page
                    // aligned on both ends and part of this mapping; after
                    // munmap we shrink map_len so drop unmaps only the rest.
                    unsafe {
                        libc::munmap(self.map.add(keep_aligned).cast(), map_len - keep_aligned);
                    }
                    self.map_len.store(keep_aligned, Ordering::Release);
                }
                // SAFETY: fd valid; shrinking to the used prefix.
                let rc = unsafe { libc::ftruncate(file.as_raw_fd(), keep as libc::off_t) };
                if rc < 0 {
                    return Err(TrieError::Io(io::Error::last_os_error()));
                }
                self.cap.store(used, Ordering::Release);
                Ok(())
            }
            Backing::Anon => {
                if keep_aligned < map_len {
                    // SAFETY: page-aligned tail of the live mapping;
                    // MADV_DONTNEED releases the backing pages, keeps the
                    // reservation, and re-faults as zero pages if touched.
                    unsafe {
                        libc::madvise(
                            self.map.add(keep_aligned).cast(),
                            map_len - keep_aligned,
                            libc::MADV_DONTNEED,
                        );
                    }
                }
                self.cap.store(used, Ordering::Release);
                Ok(())
            }
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: [map, map_len) is exactly what remains mapped (shrink
        // updates map_len when it unmaps the tail).
        unsafe {
            libc::munmap(self.map.cast(), self.map_len.load(Ordering::Relaxed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anon_reserve_and_touch() {
        let r = Region::anon(1 << 20, false).expect("reserve");
        // SAFETY: test-local exclusive access, offsets within cap.
        unsafe {
            r.base().write(0xAB);
            r.base().add((1 << 20) - 1).write(0xCD);
            assert_eq!(r.base().read(), 0xAB);
        }
    }

    #[test]
    fn test_file_backed_shrink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slab.bin");
        let r = Region::file(&path, 1 << 20).expect("map file");
        // SAFETY: exclusive access in test.
        unsafe { r.base().write_bytes(0x5A, 8192) };
        r.shrink(8192).expect("shrink");
        let len = std::fs::metadata(&path).expect("meta").len() as usize;
        assert_eq!(len, HEADER_RESERVED + 8192);
    }
}
