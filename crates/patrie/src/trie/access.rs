// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Accessor tokens.
//!
//! Handles own an `Arc` of the trie and a heap cell in the token queue.
//! A handle is created acquired; `release`/`acquire` cycle it in and out
//! of the epoch, `idle` parks it without giving up the slot. Dropping a
//! handle releases and disposes it; the queue frees the cell once the
//! head moves past it.

use super::{insert, lookup, Patricia};
use crate::config::ConcurrentLevel;
use crate::epoch::{Flags, State, TokenCell};
use crate::error::{Result, TrieError};
use std::sync::Arc;

/// Read-side accessor. Pins the epoch it joined; value pointers returned
/// by [`ReaderToken::lookup`] stay valid until release.
pub struct ReaderToken {
    trie: Arc<Patricia>,
    pub(crate) cell: *mut TokenCell,
    pub(crate) value: *const u8,
    queued: bool,
}

// SAFETY: the handle is a single-owner view of its queue cell; the cell
// itself synchronizes through atomics. Handles may move between threads
// but are not shareable.
unsafe impl Send for ReaderToken {}

/// Write-side accessor: epoch participation plus the writer's private
/// allocator cache, lazy-free list and counter deltas.
pub struct WriterToken {
    trie: Arc<Patricia>,
    pub(crate) cell: *mut TokenCell,
    pub(crate) value: *mut u8,
    pub(crate) scratch: insert::WriterScratch,
    queued: bool,
}

// SAFETY: as for ReaderToken; the scratch state is handle-local.
unsafe impl Send for WriterToken {}

impl Patricia {
    /// Acquire a reader token.
    pub fn reader(self: &Arc<Self>) -> ReaderToken {
        let mut t = ReaderToken {
            trie: Arc::clone(self),
            cell: Box::into_raw(Box::new(TokenCell::new())),
            value: std::ptr::null(),
            queued: false,
        };
        t.acquire();
        t
    }

    /// Acquire a writer token. The single-writer levels admit one live
    /// writer at a time.
    pub fn writer(self: &Arc<Self>) -> Result<WriterToken> {
        let level = self.writing();
        if level == ConcurrentLevel::ReadOnly {
            return Err(TrieError::InvalidArgument(
                "writer token on a read-only trie".into(),
            ));
        }
        let prev = self
            .writers
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        if level != ConcurrentLevel::MultiWriteMultiRead && prev > 0 {
            self.writers
                .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
            return Err(TrieError::LogicError(format!(
                "{level:?} admits a single writer token"
            )));
        }
        let mut t = WriterToken {
            trie: Arc::clone(self),
            cell: Box::into_raw(Box::new(TokenCell::new())),
            value: std::ptr::null_mut(),
            scratch: insert::WriterScratch::new(self),
            queued: false,
        };
        t.acquire();
        Ok(t)
    }
}

/// Shared token mechanics over a queue cell.
fn do_acquire(trie: &Patricia, cell: *mut TokenCell, queued: &mut bool) {
    // SAFETY: cell is this handle's live allocation.
    let t = unsafe { &*cell };
    if t.state() == State::AcquireDone {
        return;
    }
    if trie.writing().uses_queue() || *queued {
        // SAFETY: cell is live; the queue handles every legal state.
        unsafe { trie.queue.acquire(cell) };
        *queued = true;
    } else {
        t.set_flags(Flags::new(State::AcquireDone, false));
    }
}

fn do_release(trie: &Patricia, cell: *mut TokenCell, queued: bool) {
    // SAFETY: cell is this handle's live allocation.
    let t = unsafe { &*cell };
    match t.state() {
        State::AcquireDone | State::AcquireIdle | State::AcquireLock => {}
        _ => return, // already out
    }
    if queued {
        // SAFETY: cell is live and in the queue.
        unsafe { trie.queue.release(cell) };
    } else {
        t.set_flags(Flags::new(State::ReleaseDone, false));
    }
}

fn do_idle(trie: &Patricia, cell: *mut TokenCell, queued: bool) {
    // SAFETY: cell is this handle's live allocation.
    let t = unsafe { &*cell };
    if !queued {
        if t.state() == State::AcquireDone {
            t.set_flags(Flags::new(State::AcquireIdle, false));
        }
        return;
    }
    loop {
        let flags = t.flags();
        if flags.state != State::AcquireDone {
            return;
        }
        if flags.is_head {
            // step out of the head slot so min_age can advance past us;
            // when alone in the queue this only bumps our version and we
            // park while still head
            // SAFETY: cell is the acquired queue head.
            unsafe { trie.queue.update(cell) };
        }
        let flags = t.flags();
        if flags.state != State::AcquireDone {
            return;
        }
        if t.cas_flags(flags, Flags::new(State::AcquireIdle, false)) {
            return;
        }
    }
}

/// Drop-side teardown shared by both handles. Returns cell ownership to
/// the caller when the queue is done with it.
fn do_dispose(trie: &Patricia, cell: *mut TokenCell) {
    // SAFETY: cell is live; dispose transfers ownership either back to us
    // (free now) or to the queue (freed on dequeue).
    unsafe {
        if trie.queue.dispose(cell) {
            drop(Box::from_raw(cell));
        }
    }
}

impl ReaderToken {
    /// Re-join the epoch after a `release`/`idle`.
    pub fn acquire(&mut self) {
        do_acquire(&self.trie, self.cell, &mut self.queued);
    }

    /// Leave the epoch. Value pointers obtained through this token are
    /// invalidated (enforced by the borrow on `lookup`'s return).
    pub fn release(&mut self) {
        self.value = std::ptr::null();
        do_release(&self.trie, self.cell, self.queued);
    }

    /// Park without fully releasing: stops pinning reclamation while
    /// keeping the token warm for the next `acquire`.
    pub fn idle(&mut self) {
        do_idle(&self.trie, self.cell, self.queued);
    }

    pub fn is_acquired(&self) -> bool {
        // SAFETY: cell is this handle's live allocation.
        unsafe { (*self.cell).state() == State::AcquireDone }
    }

    /// Wait-free point lookup. Returns the value slot for `key`, pinned
    /// until this token releases.
    pub fn lookup(&mut self, key: &[u8]) -> Option<&[u8]> {
        debug_assert!(self.is_acquired(), "lookup on an unacquired token");
        let ptr = lookup::lookup_raw(&self.trie, key)?;
        self.value = ptr;
        // SAFETY: ptr is a slab value slot pinned by this token.
        Some(unsafe { std::slice::from_raw_parts(ptr, self.trie.valsize) })
    }

    /// The value slot of the most recent successful `lookup`.
    pub fn value(&self) -> Option<&[u8]> {
        if self.value.is_null() {
            return None;
        }
        // SAFETY: value points at a slab value slot pinned by this token.
        Some(unsafe { std::slice::from_raw_parts(self.value, self.trie.valsize) })
    }

    pub fn trie(&self) -> &Arc<Patricia> {
        &self.trie
    }
}

impl Drop for ReaderToken {
    fn drop(&mut self) {
        do_release(&self.trie, self.cell, self.queued);
        do_dispose(&self.trie, self.cell);
    }
}

impl WriterToken {
    pub fn acquire(&mut self) {
        do_acquire(&self.trie, self.cell, &mut self.queued);
    }

    pub fn release(&mut self) {
        self.value = std::ptr::null_mut();
        do_release(&self.trie, self.cell, self.queued);
    }

    pub fn idle(&mut self) {
        do_idle(&self.trie, self.cell, self.queued);
    }

    pub fn is_acquired(&self) -> bool {
        // SAFETY: cell is this handle's live allocation.
        unsafe { (*self.cell).state() == State::AcquireDone }
    }

    /// Insert `key` with `value` (`value.len()` must equal the trie's
    /// value size). Returns `Ok(true)` when the key was created,
    /// `Ok(false)` when it already existed (the stored value is left
    /// untouched and exposed via [`WriterToken::value`]).
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let trie = Arc::clone(&self.trie);
        let level = trie.writing();
        if level == ConcurrentLevel::ReadOnly {
            return Err(TrieError::InvalidArgument(
                "insert into a read-only trie".into(),
            ));
        }
        if value.len() != trie.valsize {
            return Err(TrieError::InvalidArgument(format!(
                "value length {} does not match value_size {}",
                value.len(),
                trie.valsize
            )));
        }
        if !self.is_acquired() {
            return Err(TrieError::LogicError("insert on an unacquired token".into()));
        }
        let r = if level == ConcurrentLevel::MultiWriteMultiRead {
            insert::insert_multi(&trie, self, key, value)
        } else {
            insert::insert_single(&trie, self, key, value, level)
        };
        if r.is_err() {
            self.value = std::ptr::null_mut();
        }
        r
    }

    /// Wait-free point lookup through the writer's epoch pin.
    pub fn lookup(&mut self, key: &[u8]) -> Option<&[u8]> {
        debug_assert!(self.is_acquired(), "lookup on an unacquired token");
        let ptr = lookup::lookup_raw(&self.trie, key)?;
        self.value = ptr as *mut u8;
        // SAFETY: ptr is a slab value slot pinned by this token.
        Some(unsafe { std::slice::from_raw_parts(ptr, self.trie.valsize) })
    }

    /// Value slot of the most recent `insert`/`lookup`.
    pub fn value(&self) -> Option<&[u8]> {
        if self.value.is_null() {
            return None;
        }
        // SAFETY: value points at a slab value slot pinned by this token.
        Some(unsafe { std::slice::from_raw_parts(self.value, self.trie.valsize) })
    }

    /// Raw pointer form of [`WriterToken::value`], for callers that update
    /// the slot in place.
    pub fn value_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        std::ptr::NonNull::new(self.value)
    }

    /// Merge this writer's counter deltas into the trie-global statistics
    /// ahead of the automatic sync points (teardown, head-writer updates).
    pub fn sync_stat(&mut self) {
        let trie = Arc::clone(&self.trie);
        self.scratch.merge_counters(&trie);
    }

    pub(crate) fn set_value(&mut self, ptr: *mut u8) {
        self.value = ptr;
    }

    pub fn trie(&self) -> &Arc<Patricia> {
        &self.trie
    }
}

impl Drop for WriterToken {
    fn drop(&mut self) {
        let trie = Arc::clone(&self.trie);
        // SAFETY: cell is this handle's live allocation.
        let min_age = unsafe { (*self.cell).min_age.load(std::sync::atomic::Ordering::Relaxed) };
        self.scratch.retire(&trie, min_age);
        do_release(&trie, self.cell, self.queued);
        do_dispose(&trie, self.cell);
        trie.writers
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    }
}
