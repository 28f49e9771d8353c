// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::CORE_UNOWNED;
use crate::clock::Timestamp;
use core::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// `page_hint` value for a core that is not filling any bpage
const NO_HINT: u32 = u32::MAX;

/// Tracking state for one bpage
///
/// `refs` counts one unit per message slice stored in the page, plus one
/// unit while a core holds the right to append more bytes. A page with
/// `refs == 0` and no owner is free.
///
/// Every field may be read without the lock, but only as a scan hint; all
/// writes happen with `lock` held, so a re-read under the lock is
/// authoritative.
pub(super) struct Descriptor {
    refs: AtomicI32,
    /// Core currently allowed to append to this page, or [`CORE_UNOWNED`]
    owner: AtomicI32,
    /// When `owner` is set, the claim is revocable after this time
    expiration: AtomicU64,
    lock: Mutex<()>,
}

impl Descriptor {
    pub fn new() -> Self {
        Self {
            refs: AtomicI32::new(0),
            owner: AtomicI32::new(CORE_UNOWNED),
            expiration: AtomicU64::new(0),
            lock: Mutex::new(()),
        }
    }

    /// Attempts to lock the descriptor without blocking
    ///
    /// Scan paths treat failure as "skip this page": the cost of waiting
    /// exceeds the cost of one wasted candidate.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock.try_lock().ok()
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap()
    }

    #[inline]
    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    #[inline]
    pub fn owner(&self) -> i32 {
        self.owner.load(Ordering::Acquire)
    }

    #[inline]
    pub fn expiration(&self) -> Timestamp {
        Timestamp::from_nanos(self.expiration.load(Ordering::Acquire))
    }

    /// Caller must hold the descriptor lock
    #[inline]
    pub fn set_refs(&self, refs: i32) {
        self.refs.store(refs, Ordering::Release);
    }

    /// Adds a reference for a new message slice. Caller must hold the
    /// descriptor lock.
    #[inline]
    pub fn inc_refs(&self) {
        self.refs.fetch_add(1, Ordering::Release);
    }

    /// Drops one reference and returns the new count. Caller must hold the
    /// descriptor lock.
    #[inline]
    pub fn dec_refs(&self) -> i32 {
        let refs = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(refs >= 0, "bpage reference count underflow");
        refs
    }

    /// Caller must hold the descriptor lock
    #[inline]
    pub fn set_owner(&self, owner: i32) {
        self.owner.store(owner, Ordering::Release);
    }

    /// Caller must hold the descriptor lock
    #[inline]
    pub fn set_expiration(&self, expiration: Timestamp) {
        self.expiration
            .store(expiration.as_nanos(), Ordering::Release);
    }
}

/// Per-core allocation state
///
/// Threads map onto slots, so two threads can transiently share one.
/// `page_hint` and `allocated` travel together in a single word; a torn
/// pair mixing two pages is therefore impossible, and appends against the
/// pair serialize on the hinted descriptor's lock.
pub(super) struct CoreState {
    /// Packed `(page_hint, allocated)`; see [`CoreState::hint`]
    hint: AtomicU64,
    /// Descriptor index where this core's next scan starts
    next_candidate: AtomicUsize,
}

impl CoreState {
    pub fn new() -> Self {
        Self {
            hint: AtomicU64::new(pack(NO_HINT, 0)),
            next_candidate: AtomicUsize::new(0),
        }
    }

    /// Returns `(page_hint, allocated)` while the core is filling a page
    #[inline]
    pub fn hint(&self) -> Option<(usize, usize)> {
        let packed = self.hint.load(Ordering::Acquire);
        let page = (packed >> 32) as u32;
        if page == NO_HINT {
            None
        } else {
            Some((page as usize, packed as u32 as usize))
        }
    }

    #[inline]
    pub fn set_hint(&self, page: usize, allocated: usize) {
        self.hint
            .store(pack(page as u32, allocated as u32), Ordering::Release);
    }

    #[inline]
    pub fn next_candidate(&self) -> usize {
        self.next_candidate.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_next_candidate(&self, candidate: usize) {
        self.next_candidate.store(candidate, Ordering::Relaxed);
    }
}

#[inline]
fn pack(page: u32, allocated: u32) -> u64 {
    ((page as u64) << 32) | allocated as u64
}
