// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The token version queue.
//!
//! Singly-linked intrusive FIFO with a dummy head. `dummy.next` is the
//! queue head; `dummy.min_age` is the global minimum live epoch. The tail
//! pointer and tail version are only written under `head_lock`, so a
//! version assigned at enqueue time is strictly increasing along the list.
//!
//! Release is wait-free: a head token that cannot take the lock flags
//! `head_is_dead` and leaves; whoever next takes the lock advances the
//! head past every contiguous released/disposed cell and installs the
//! first live token as the new head, raising `min_age` to its version.

use super::token::{Flags, State, TokenCell};
use crossbeam::utils::{Backoff, CachePadded};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Cells retired per head-lock critical section; the rest wait for the
/// next pass so the lock hold time stays bounded.
pub(crate) const MAX_DEL_PTRS: usize = 32;

/// Deferred frees collected under the lock, executed after unlock.
struct DelList {
    ptrs: [*mut TokenCell; MAX_DEL_PTRS],
    n: usize,
}

impl DelList {
    fn new() -> Self {
        Self {
            ptrs: [ptr::null_mut(); MAX_DEL_PTRS],
            n: 0,
        }
    }

    /// Queue a disposed cell for freeing. Past the cap it is freed inline;
    /// rare, and still correct because the cell is already unlinked.
    unsafe fn push(&mut self, cell: *mut TokenCell) {
        if self.n < MAX_DEL_PTRS {
            self.ptrs[self.n] = cell;
            self.n += 1;
        } else {
            // SAFETY: caller unlinked the cell; nothing else references it.
            unsafe {
                (*cell).set_flags(Flags::new(State::DisposeDone, false));
                drop(Box::from_raw(cell));
            }
        }
    }

    unsafe fn free_all(&mut self) {
        for i in 0..self.n {
            // SAFETY: every pointer was unlinked from the queue under the
            // head lock and its owner marked it DisposeWait, transferring
            // ownership to the queue.
            unsafe {
                (*self.ptrs[i]).set_flags(Flags::new(State::DisposeDone, false));
                drop(Box::from_raw(self.ptrs[i]));
            }
        }
        self.n = 0;
    }
}

pub(crate) struct TokenQueue {
    dummy: TokenCell,
    /// Last cell of the list; null means the dummy itself.
    tail: AtomicPtr<TokenCell>,
    tail_verseq: AtomicU64,
    head_lock: CachePadded<AtomicBool>,
    head_is_dead: AtomicBool,
    head_is_idle: AtomicBool,
    qlen: AtomicUsize,
}

impl TokenQueue {
    pub(crate) fn new() -> Self {
        let dummy = TokenCell::new();
        dummy.set_flags(Flags::new(State::DisposeDone, false));
        Self {
            dummy,
            tail: AtomicPtr::new(ptr::null_mut()),
            tail_verseq: AtomicU64::new(0),
            head_lock: CachePadded::new(AtomicBool::new(false)),
            head_is_dead: AtomicBool::new(false),
            head_is_idle: AtomicBool::new(false),
            qlen: AtomicUsize::new(0),
        }
    }

    /// Minimum live epoch: nodes retired before this version are
    /// unreachable from every live token.
    #[inline]
    pub(crate) fn min_age(&self) -> u64 {
        self.dummy.min_age.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn tail_verseq(&self) -> u64 {
        self.tail_verseq.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn qlen(&self) -> usize {
        self.qlen.load(Ordering::Relaxed)
    }

    /// A releaser parked a dead token at the head; cleanup is pending.
    #[inline]
    pub(crate) fn head_is_dead(&self) -> bool {
        self.head_is_dead.load(Ordering::Relaxed)
    }

    /// The head token is parked idle and pinning its version.
    #[inline]
    pub(crate) fn head_is_idle(&self) -> bool {
        self.head_is_idle.load(Ordering::Relaxed)
    }

    #[inline]
    fn head(&self) -> *mut TokenCell {
        self.dummy.next.load(Ordering::Acquire)
    }

    fn tail_cell(&self) -> &TokenCell {
        let t = self.tail.load(Ordering::Relaxed);
        if t.is_null() {
            &self.dummy
        } else {
            // SAFETY: the tail cell is never freed while linked; only
            // head-lock holders retire cells, and the tail is retired last
            // (dequeue stops at a cell with a null next).
            unsafe { &*t }
        }
    }

    fn lock_head(&self) {
        let backoff = Backoff::new();
        while self
            .head_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.spin();
        }
    }

    fn try_lock_head(&self) -> bool {
        !self.head_lock.load(Ordering::Relaxed)
            && self
                .head_lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    fn unlock_head(&self) {
        self.head_lock.store(false, Ordering::Release);
    }

    /// Append under the head lock; the version counter only moves here.
    unsafe fn enqueue_locked(&self, tok: *mut TokenCell) {
        debug_assert!(self.head_lock.load(Ordering::Relaxed));
        let verseq = self.tail_verseq.load(Ordering::Relaxed) + 1;
        // SAFETY: tok is a live cell owned by the enqueuing accessor.
        let t = unsafe { &*tok };
        t.next.store(ptr::null_mut(), Ordering::Relaxed);
        t.verseq.store(verseq, Ordering::Relaxed);
        self.tail_cell().next.store(tok, Ordering::Release);
        self.tail.store(tok, Ordering::Relaxed);
        self.tail_verseq.store(verseq, Ordering::Relaxed);
    }

    /// Join the queue (or revive a released/idle token).
    pub(crate) unsafe fn acquire(&self, tok: *mut TokenCell) {
        // SAFETY: tok is the caller's own live cell throughout.
        let t = unsafe { &*tok };
        let backoff = Backoff::new();
        loop {
            let flags = t.flags();
            match flags.state {
                State::AcquireLock => {
                    // another thread is relocating this idle cell; wait out
                    let spin = Backoff::new();
                    while t.state() == State::AcquireLock {
                        spin.spin();
                    }
                    continue;
                }
                State::AcquireIdle => {
                    if t.cas_flags(flags, Flags::new(State::AcquireDone, flags.is_head)) {
                        break;
                    }
                }
                State::ReleaseDone => {
                    t.set_flags(Flags::new(State::AcquireDone, false));
                    self.lock_head();
                    self.qlen.fetch_add(1, Ordering::Relaxed);
                    // SAFETY: lock held; tok not currently linked.
                    unsafe { self.enqueue_locked(tok) };
                    self.unlock_head();
                    break;
                }
                State::ReleaseWait => {
                    // still linked: revive in place, keeping our verseq
                    if t.cas_flags(flags, Flags::new(State::AcquireDone, false)) {
                        break;
                    }
                }
                s => unreachable!("acquire from {s:?}"),
            }
            backoff.spin();
        }
        if self.head() == tok {
            if self.try_lock_head() {
                if self.head() == tok {
                    let f = t.flags();
                    t.set_flags(Flags::new(f.state, true));
                }
                self.unlock_head();
            }
        } else if self.head_is_dead.load(Ordering::Relaxed) {
            // a releaser could not take the lock; finish its cleanup
            self.reclaim_head();
        }
    }

    /// Advance the head to the first live cell starting at `start`.
    /// Requires the head lock. Returns true when a live (acquired or idle)
    /// head was installed, false when the scan parked on a dead tail.
    unsafe fn dequeue_locked(&self, start: *mut TokenCell, dels: &mut DelList) -> bool {
        debug_assert!(self.head_lock.load(Ordering::Relaxed));
        let mut curr = start;
        loop {
            debug_assert!(!curr.is_null());
            // SAFETY: cells reachable from the queue under the head lock
            // are owned by the queue or by a live accessor.
            let c = unsafe { &*curr };
            let next = c.next.load(Ordering::Acquire);
            let flags = c.flags();
            debug_assert!(!flags.is_head);
            match flags.state {
                State::AcquireDone => {
                    let min_age = c.verseq.load(Ordering::Relaxed);
                    if c.cas_flags(flags, Flags::new(State::AcquireDone, true)) {
                        self.dummy.next.store(curr, Ordering::Release);
                        self.dummy.min_age.store(min_age, Ordering::Release);
                        c.min_age.store(min_age, Ordering::Relaxed);
                        return true;
                    }
                    // raced with release/dispose; re-examine the same cell
                }
                State::AcquireIdle => {
                    if c.cas_flags(flags, Flags::new(State::AcquireLock, false)) {
                        // an idle head still counts as live; it pins its
                        // own version until it re-acquires or releases
                        let min_age = c.verseq.load(Ordering::Relaxed);
                        self.dummy.next.store(curr, Ordering::Release);
                        self.dummy.min_age.store(min_age, Ordering::Release);
                        self.head_is_idle.store(true, Ordering::Relaxed);
                        c.min_age.store(min_age, Ordering::Relaxed);
                        c.set_flags(Flags::new(State::AcquireIdle, true));
                        return true;
                    }
                }
                State::ReleaseWait => {
                    if next.is_null() {
                        break;
                    }
                    if c.cas_flags(flags, Flags::new(State::ReleaseDone, false)) {
                        self.qlen.fetch_sub(1, Ordering::Relaxed);
                        curr = next;
                    }
                }
                State::DisposeWait => {
                    if next.is_null() {
                        break;
                    }
                    self.qlen.fetch_sub(1, Ordering::Relaxed);
                    // SAFETY: unlinked here under the lock.
                    unsafe { dels.push(curr) };
                    curr = next;
                }
                s => unreachable!("dequeue over {s:?}"),
            }
        }
        // the tail is a dead cell; it stays as head until someone enqueues
        // behind it and reclaims
        let c = unsafe { &*curr };
        let min_age = c.verseq.load(Ordering::Relaxed);
        self.dummy.next.store(curr, Ordering::Release);
        self.dummy.min_age.store(min_age, Ordering::Release);
        c.min_age.store(min_age, Ordering::Relaxed);
        false
    }

    /// Leave the queue. Wait-free: contention downgrades to marking the
    /// head dead for someone else to clean up.
    pub(crate) unsafe fn release(&self, tok: *mut TokenCell) {
        // SAFETY: tok is the caller's own live cell.
        let t = unsafe { &*tok };
        let backoff = Backoff::new();
        let mut dels = DelList::new();
        loop {
            let flags = t.flags();
            let next = t.next.load(Ordering::Acquire);
            if flags.is_head {
                match flags.state {
                    State::AcquireDone => {
                        if next.is_null() || !self.try_lock_head() {
                            // alone in the queue, or lock contended: park
                            t.set_flags(Flags::new(State::ReleaseWait, false));
                            self.head_is_dead.store(true, Ordering::Relaxed);
                            return;
                        }
                        debug_assert_eq!(self.head(), tok);
                        // SAFETY: lock held; next is a linked cell.
                        if unsafe { self.dequeue_locked(next, &mut dels) } {
                            t.min_age
                                .store(t.verseq.load(Ordering::Relaxed), Ordering::Relaxed);
                        } else {
                            self.head_is_dead.store(true, Ordering::Relaxed);
                        }
                        t.set_flags(Flags::new(State::ReleaseDone, false));
                        self.qlen.fetch_sub(1, Ordering::Relaxed);
                        self.unlock_head();
                        // SAFETY: cells were unlinked above.
                        unsafe { dels.free_all() };
                        return;
                    }
                    State::AcquireLock => {
                        let spin = Backoff::new();
                        while t.state() == State::AcquireLock {
                            spin.spin();
                        }
                        continue;
                    }
                    State::AcquireIdle => {
                        if next.is_null() || !self.try_lock_head() {
                            if t.cas_flags(flags, Flags::new(State::ReleaseWait, false)) {
                                self.head_is_dead.store(true, Ordering::Relaxed);
                                self.head_is_idle.store(false, Ordering::Relaxed);
                                return;
                            }
                            continue;
                        }
                        if t.cas_flags(flags, Flags::new(State::ReleaseDone, false)) {
                            // SAFETY: lock held; next is linked.
                            if unsafe { self.dequeue_locked(next, &mut dels) } {
                                t.min_age
                                    .store(t.verseq.load(Ordering::Relaxed), Ordering::Relaxed);
                            } else {
                                self.head_is_dead.store(true, Ordering::Relaxed);
                            }
                            self.qlen.fetch_sub(1, Ordering::Relaxed);
                            self.head_is_idle.store(false, Ordering::Relaxed);
                            self.unlock_head();
                            // SAFETY: cells were unlinked above.
                            unsafe { dels.free_all() };
                            return;
                        }
                        self.unlock_head();
                    }
                    s => unreachable!("release head from {s:?}"),
                }
            } else {
                match flags.state {
                    State::AcquireDone | State::AcquireIdle => {
                        if t.cas_flags(flags, Flags::new(State::ReleaseWait, false)) {
                            return;
                        }
                        // CAS lost: the old head just promoted us to head
                    }
                    State::AcquireLock => {
                        let spin = Backoff::new();
                        while t.state() == State::AcquireLock {
                            spin.spin();
                        }
                    }
                    s => unreachable!("release from {s:?}"),
                }
            }
            backoff.spin();
        }
    }

    /// Final transition of a released token. Returns true when the caller
    /// regains ownership of the cell (must free it); false when the queue
    /// now owns it and will free it on dequeue.
    pub(crate) unsafe fn dispose(&self, tok: *mut TokenCell) -> bool {
        // SAFETY: tok is the caller's own cell.
        let t = unsafe { &*tok };
        loop {
            let flags = t.flags();
            match flags.state {
                State::ReleaseDone => {
                    if t.cas_flags(flags, Flags::new(State::DisposeDone, false)) {
                        return true;
                    }
                }
                State::ReleaseWait => {
                    if t.cas_flags(flags, Flags::new(State::DisposeWait, flags.is_head)) {
                        return false;
                    }
                }
                s => unreachable!("dispose from {s:?}"),
            }
        }
    }

    /// A head-owning writer moves itself to the tail so its old version
    /// stops pinning reclamation. Advisory: bails out on any contention.
    pub(crate) unsafe fn update(&self, tok: *mut TokenCell) {
        // SAFETY: tok is the caller's own acquired head cell.
        let t = unsafe { &*tok };
        debug_assert!(t.flags().is_head);
        debug_assert_eq!(t.flags().state, State::AcquireDone);
        if !self.try_lock_head() {
            return;
        }
        let next = t.next.load(Ordering::Acquire);
        if next.is_null() {
            // alone: bump our own version in place so min_age can advance
            let v = t.verseq.load(Ordering::Relaxed) + 1;
            t.verseq.store(v, Ordering::Relaxed);
            self.tail_verseq.store(v, Ordering::Relaxed);
            self.dummy.min_age.store(v, Ordering::Release);
            t.min_age.store(v, Ordering::Relaxed);
            self.unlock_head();
            return;
        }
        let mut dels = DelList::new();
        let f = t.flags();
        t.set_flags(Flags::new(f.state, false));
        // SAFETY: lock held; tok is unlinked from the head position by the
        // dequeue below and re-linked at the tail here.
        unsafe {
            self.enqueue_locked(tok);
            let installed = self.dequeue_locked(next, &mut dels);
            // we are alive and behind `next`, so a live head must exist
            debug_assert!(installed);
            let _ = installed;
        }
        self.unlock_head();
        // SAFETY: cells were unlinked above.
        unsafe { dels.free_all() };
    }

    /// Bounded cleanup of a dead or idle head. Callable from any acquired
    /// accessor; a no-op under contention.
    pub(crate) fn reclaim_head(&self) {
        if self.head_lock.load(Ordering::Relaxed) || !self.try_lock_head() {
            return;
        }
        if !self.head_is_dead.load(Ordering::Relaxed) && !self.head_is_idle.load(Ordering::Relaxed)
        {
            self.unlock_head();
            return;
        }
        let head = self.head();
        if head.is_null() {
            self.unlock_head();
            return;
        }
        let mut dels = DelList::new();
        let mut curr = head;
        let live = loop {
            // SAFETY: queue-reachable cells are valid under the head lock.
            let c = unsafe { &*curr };
            let next = c.next.load(Ordering::Acquire);
            let flags = c.flags();
            match flags.state {
                State::ReleaseWait => {
                    if next.is_null() {
                        break false;
                    }
                    if c.cas_flags(flags, Flags::new(State::ReleaseDone, false)) {
                        self.qlen.fetch_sub(1, Ordering::Relaxed);
                        curr = next;
                    }
                }
                State::DisposeWait => {
                    if next.is_null() {
                        break false;
                    }
                    self.qlen.fetch_sub(1, Ordering::Relaxed);
                    // SAFETY: unlinked here under the lock.
                    unsafe { dels.push(curr) };
                    curr = next;
                }
                State::AcquireDone => {
                    if c.cas_flags(flags, Flags::new(State::AcquireDone, true)) {
                        break true;
                    }
                }
                State::AcquireIdle => {
                    if next.is_null() {
                        // lone idle token: leave it parked as the head
                        break true;
                    }
                    if c.cas_flags(flags, Flags::new(State::AcquireLock, false)) {
                        let min_age = c.verseq.load(Ordering::Relaxed);
                        // SAFETY: lock held; cell is being relocated.
                        unsafe { self.enqueue_locked(curr) };
                        c.min_age.store(min_age, Ordering::Relaxed);
                        c.set_flags(Flags::new(State::AcquireIdle, false));
                        curr = next;
                    }
                }
                s => unreachable!("reclaim over {s:?}"),
            }
        };
        // SAFETY: curr is the surviving head cell.
        let c = unsafe { &*curr };
        let min_age = c.verseq.load(Ordering::Relaxed);
        self.dummy.next.store(curr, Ordering::Release);
        self.dummy.min_age.store(min_age, Ordering::Release);
        c.min_age.store(min_age, Ordering::Relaxed);
        if live {
            self.head_is_dead.store(false, Ordering::Relaxed);
            self.head_is_idle.store(false, Ordering::Relaxed);
        }
        self.unlock_head();
        // SAFETY: cells were unlinked above.
        unsafe { dels.free_all() };
    }

    /// Teardown: free every cell still linked. Only callable when no
    /// accessor handle exists (the trie is being dropped).
    pub(crate) unsafe fn drain_all(&self) {
        let mut curr = self.dummy.next.load(Ordering::Relaxed);
        while !curr.is_null() {
            // SAFETY: with no live handles every remaining cell is
            // queue-owned (DisposeWait) and unreferenced elsewhere.
            unsafe {
                let next = (*curr).next.load(Ordering::Relaxed);
                debug_assert_eq!((*curr).state(), State::DisposeWait);
                (*curr).set_flags(Flags::new(State::DisposeDone, false));
                drop(Box::from_raw(curr));
                curr = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cell() -> *mut TokenCell {
        Box::into_raw(Box::new(TokenCell::new()))
    }

    #[test]
    fn test_verseq_monotone_and_min_age() {
        let q = TokenQueue::new();
        let t1 = new_cell();
        let t2 = new_cell();
        unsafe {
            q.acquire(t1);
            q.acquire(t2);
            assert_eq!(q.qlen(), 2);
            assert_eq!((*t1).verseq.load(Ordering::Relaxed), 1);
            assert_eq!((*t2).verseq.load(Ordering::Relaxed), 2);
            assert!((*t1).flags().is_head);
            assert_eq!(q.min_age(), 0);

            // head releases: min_age advances to the next live version
            q.release(t1);
            assert_eq!(q.min_age(), 2);
            assert!((*t2).flags().is_head);
            assert!(q.dispose(t1));
            drop(Box::from_raw(t1));

            q.release(t2);
            // t2 was alone: parked dead, reclaimed by the next acquirer
            assert!(q.head_is_dead.load(Ordering::Relaxed));
            let t3 = new_cell();
            q.acquire(t3);
            assert_eq!(q.min_age(), 3);
            // reclaim moved t2 out of the queue; its owner frees it
            assert!(q.dispose(t2));
            drop(Box::from_raw(t2));
            q.release(t3);
            if q.dispose(t3) {
                drop(Box::from_raw(t3));
            } else {
                q.drain_all();
            }
        }
    }

    #[test]
    fn test_update_alone_bumps_version() {
        let q = TokenQueue::new();
        let t = new_cell();
        unsafe {
            q.acquire(t);
            // force head status (single token becomes head via acquire)
            assert!((*t).flags().is_head);
            let v0 = (*t).verseq.load(Ordering::Relaxed);
            q.update(t);
            assert_eq!((*t).verseq.load(Ordering::Relaxed), v0 + 1);
            assert_eq!(q.min_age(), v0 + 1);
            q.release(t);
            if q.dispose(t) {
                drop(Box::from_raw(t));
            } else {
                q.drain_all();
            }
        }
    }

    #[test]
    fn test_release_reacquire_cycle() {
        let q = TokenQueue::new();
        let a = new_cell();
        let b = new_cell();
        unsafe {
            q.acquire(a);
            q.acquire(b);
            // non-head release parks, head advance collects it
            q.release(b);
            assert_eq!((*b).state(), State::ReleaseWait);
            q.acquire(b); // revive in place
            assert_eq!((*b).state(), State::AcquireDone);
            q.release(a);
            q.release(b);
            let survivors = [a, b];
            for t in survivors {
                if q.dispose(t) {
                    drop(Box::from_raw(t));
                }
            }
            q.drain_all();
        }
    }
}
