// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persisted trie image.
//!
//! Layout: a page-sized header slot followed by the raw slab prefix. The
//! node format (variant tags, cell layout, bitmap/rank encoding, z-path
//! padding) is the on-disk contract; the header carries the counters, the
//! application-data range, one block descriptor and a crc32 over itself.
//!
//! A file-backed writable trie becomes an image in place on
//! `set_readonly`; an anonymous trie is copied out by `save`. `load` maps
//! the file read-only and rejects anything whose magic, version, geometry
//! or checksum does not hold up.

use super::{Patricia, ROOT};
use crate::error::{Result, TrieError};
use crate::mem::{Region, Slab, ALIGN, SCAN_SLACK};
use crate::node::FAST_NODE_CELLS;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const MAGIC: [u8; 8] = *b"PATRIE\x00\x01";
const FORMAT_VERSION: u32 = 1;
pub(crate) const HEADER_RESERVED: usize = crate::mem::HEADER_RESERVED;

/// Serialized header length (magic through crc).
const HEADER_LEN: usize = 140;

struct HeaderFields {
    valsize: u32,
    n_nodes: u64,
    n_words: u64,
    max_word_len: u64,
    total_key_len: u64,
    total_zpath_len: u64,
    zpath_states: i64,
    appdata_off: u64,
    appdata_len: u64,
    block_off: u64,
    block_len: u64,
    stat: [u64; 4],
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(bytes);
    crc.sum()
}

fn encode_header(f: &HeaderFields) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    let mut w = &mut buf[..];
    // the writer advances through the fixed buffer; infallible
    w.write_all(&MAGIC).expect("header buffer");
    let put32 = |w: &mut &mut [u8], v: u32| w.write_all(&v.to_le_bytes()).expect("header");
    let put64 = |w: &mut &mut [u8], v: u64| w.write_all(&v.to_le_bytes()).expect("header");
    put32(&mut w, FORMAT_VERSION);
    put32(&mut w, ALIGN as u32);
    put32(&mut w, f.valsize);
    put32(&mut w, 0); // reserved
    put64(&mut w, f.n_nodes);
    put64(&mut w, f.n_words);
    put64(&mut w, f.max_word_len);
    put64(&mut w, f.total_key_len);
    put64(&mut w, f.total_zpath_len);
    put64(&mut w, f.zpath_states as u64);
    put64(&mut w, f.appdata_off);
    put64(&mut w, f.appdata_len);
    put64(&mut w, f.block_off);
    put64(&mut w, f.block_len);
    for s in f.stat {
        put64(&mut w, s);
    }
    let crc = crc32(&buf[..HEADER_LEN - 4]);
    buf[HEADER_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
    buf
}

struct HeaderReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> HeaderReader<'a> {
    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().expect("header"));
        self.pos += 4;
        v
    }
    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().expect("header"));
        self.pos += 8;
        v
    }
}

fn decode_header(buf: &[u8]) -> Result<HeaderFields> {
    if buf.len() < HEADER_LEN {
        return Err(TrieError::Corruption("truncated header".into()));
    }
    if buf[..8] != MAGIC {
        return Err(TrieError::Corruption("bad magic".into()));
    }
    let stored_crc =
        u32::from_le_bytes(buf[HEADER_LEN - 4..HEADER_LEN].try_into().expect("header"));
    let actual = crc32(&buf[..HEADER_LEN - 4]);
    if stored_crc != actual {
        return Err(TrieError::Corruption(format!(
            "header crc mismatch: stored {stored_crc:#010x}, computed {actual:#010x}"
        )));
    }
    let mut r = HeaderReader { buf, pos: 8 };
    let version = r.u32();
    if version != FORMAT_VERSION {
        return Err(TrieError::Corruption(format!(
            "unsupported format version {version}"
        )));
    }
    let align = r.u32();
    if align as usize != ALIGN {
        return Err(TrieError::Corruption(format!(
            "image cell size {align} does not match {ALIGN}"
        )));
    }
    let valsize = r.u32();
    let _reserved = r.u32();
    Ok(HeaderFields {
        valsize,
        n_nodes: r.u64(),
        n_words: r.u64(),
        max_word_len: r.u64(),
        total_key_len: r.u64(),
        total_zpath_len: r.u64(),
        zpath_states: r.u64() as i64,
        appdata_off: r.u64(),
        appdata_len: r.u64(),
        block_off: r.u64(),
        block_len: r.u64(),
        stat: [r.u64(), r.u64(), r.u64(), r.u64()],
    })
}

fn gather_fields(trie: &Patricia) -> HeaderFields {
    let (app_off, app_len) = trie.appdata_range();
    HeaderFields {
        valsize: trie.valsize as u32,
        n_nodes: trie.n_nodes.load(Ordering::Relaxed),
        n_words: trie.n_words.load(Ordering::Relaxed),
        max_word_len: trie.max_word_len.load(Ordering::Relaxed),
        total_key_len: trie.total_key_len.load(Ordering::Relaxed),
        total_zpath_len: trie.total_zpath_len.load(Ordering::Relaxed),
        zpath_states: trie.zpath_states.load(Ordering::Relaxed),
        appdata_off: if app_off >= usize::MAX - 1 {
            u64::MAX
        } else {
            app_off as u64
        },
        appdata_len: app_len as u64,
        block_off: HEADER_RESERVED as u64,
        block_len: trie.slab.used() as u64,
        stat: [
            trie.s_add_state_move.load(Ordering::Relaxed),
            trie.s_fork.load(Ordering::Relaxed),
            trie.s_split.load(Ordering::Relaxed),
            trie.s_mark_final.load(Ordering::Relaxed),
        ],
    }
}

/// Fill the header slot of a file-backed trie during the read-only
/// transition; the mapped file then is the image.
pub(crate) fn stamp_header_in_place(trie: &Patricia) -> Result<()> {
    let header = encode_header(&gather_fields(trie));
    let Some(dst) = trie.slab.region().header_ptr() else {
        return Err(TrieError::LogicError(
            "header stamp on an anonymous region".into(),
        ));
    };
    // SAFETY: the header slot is HEADER_RESERVED bytes at the start of the
    // writable mapping, untouched by node storage.
    unsafe {
        std::ptr::copy_nonoverlapping(header.as_ptr(), dst, HEADER_LEN);
    }
    Ok(())
}

/// Write header + used slab prefix to `path`. The trie should be quiesced
/// (no concurrent writers) so the snapshot is point-in-time consistent.
pub(crate) fn save(trie: &Patricia, path: &Path) -> Result<()> {
    let used = trie.slab.used();
    let header = encode_header(&gather_fields(trie));
    let pad = vec![0u8; HEADER_RESERVED - HEADER_LEN];
    let mut file = std::fs::File::create(path)?;
    file.write_all(&header)?;
    file.write_all(&pad)?;
    // SAFETY: [base, used + SCAN_SLACK) is inside the mapped region; with
    // no live writer it is stable for the duration of the copy. The slack
    // keeps 16-byte label loads on the last node inside the loaded image.
    let body = unsafe { std::slice::from_raw_parts(trie.slab.base(), used + SCAN_SLACK) };
    file.write_all(body)?;
    file.sync_all()?;
    log::debug!("[image] saved {} bytes to {}", used, path.display());
    Ok(())
}

/// Map an image read-only and wrap it as a frozen trie.
pub(crate) fn load(path: &Path) -> Result<Arc<Patricia>> {
    let region = Region::file_readonly(path)?;
    let Some(hp) = region.header_ptr() else {
        return Err(TrieError::LogicError("image region without header".into()));
    };
    // SAFETY: the mapping is at least HEADER_RESERVED bytes (checked by
    // Region::file_readonly) and immutable.
    let hbuf = unsafe { std::slice::from_raw_parts(hp, HEADER_RESERVED) };
    let f = decode_header(hbuf)?;
    if f.block_off as usize != HEADER_RESERVED {
        return Err(TrieError::Corruption(format!(
            "unexpected block offset {}",
            f.block_off
        )));
    }
    let block_len = f.block_len as usize;
    if block_len > region.cap() || block_len < ALIGN * FAST_NODE_CELLS {
        return Err(TrieError::Corruption(format!(
            "block length {block_len} out of range (file holds {})",
            region.cap()
        )));
    }
    let valsize = f.valsize as usize;
    if valsize % ALIGN != 0 {
        return Err(TrieError::Corruption(format!(
            "value size {valsize} not cell-aligned"
        )));
    }
    let slab = Slab::for_image(region, block_len);
    let trie = Patricia::from_parts(slab, valsize);
    // sanity: the root must be the dense fast node
    if trie.cells().meta(ROOT).tag() != 15 {
        return Err(TrieError::Corruption("root is not the dense node".into()));
    }
    trie.n_nodes.store(f.n_nodes, Ordering::Relaxed);
    trie.n_words.store(f.n_words, Ordering::Relaxed);
    trie.max_word_len.store(f.max_word_len, Ordering::Relaxed);
    trie.total_key_len.store(f.total_key_len, Ordering::Relaxed);
    trie.total_zpath_len
        .store(f.total_zpath_len, Ordering::Relaxed);
    trie.zpath_states.store(f.zpath_states, Ordering::Relaxed);
    trie.s_add_state_move.store(f.stat[0], Ordering::Relaxed);
    trie.s_fork.store(f.stat[1], Ordering::Relaxed);
    trie.s_split.store(f.stat[2], Ordering::Relaxed);
    trie.s_mark_final.store(f.stat[3], Ordering::Relaxed);
    if f.appdata_off != u64::MAX {
        let off = f.appdata_off as usize;
        let len = f.appdata_len as usize;
        if off + len > block_len {
            return Err(TrieError::Corruption(
                "application data range exceeds the block".into(),
            ));
        }
        trie.set_appdata_range(off, len);
    }
    log::debug!(
        "[image] loaded {} keys, {} bytes from {}",
        f.n_words,
        block_len,
        path.display()
    );
    Ok(Arc::new(trie))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_and_crc() {
        let f = HeaderFields {
            valsize: 8,
            n_nodes: 42,
            n_words: 41,
            max_word_len: 17,
            total_key_len: 420,
            total_zpath_len: 77,
            zpath_states: -3,
            appdata_off: u64::MAX,
            appdata_len: 0,
            block_off: HEADER_RESERVED as u64,
            block_len: 4096,
            stat: [1, 2, 3, 4],
        };
        let buf = encode_header(&f);
        let d = decode_header(&buf).expect("decode");
        assert_eq!(d.valsize, 8);
        assert_eq!(d.n_words, 41);
        assert_eq!(d.zpath_states, -3);
        assert_eq!(d.stat, [1, 2, 3, 4]);

        let mut bad = buf;
        bad[20] ^= 0xFF;
        assert!(matches!(
            decode_header(&bad),
            Err(TrieError::Corruption(_))
        ));
    }
}
