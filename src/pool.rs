// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    clock::{Clock, StdClock, Timestamp},
    message::Message,
};
use arrayvec::ArrayVec;
use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
    time::Duration,
};
use crossbeam_utils::CachePadded;
use std::alloc::Layout;
use tracing::trace;

mod descriptor;

use descriptor::{CoreState, Descriptor};

/// Log2 of [`BPAGE_SIZE`]
pub const BPAGE_SHIFT: u32 = 16;

/// Size of one buffer page (bpage), the allocation unit for message buffers
pub const BPAGE_SIZE: usize = 1 << BPAGE_SHIFT;

/// Largest message the transport will ask the pool to back
pub const MAX_MESSAGE_LENGTH: usize = 1_000_000;

/// Upper bound on the number of bpages backing one message
pub const MAX_MESSAGE_BPAGES: usize = MAX_MESSAGE_LENGTH.div_ceil(BPAGE_SIZE) + 1;

/// Owner value for a bpage that no core may append to
pub const CORE_UNOWNED: i32 = -1;

/// Smallest region the pool accepts, in bpages
pub const MIN_BPAGES: usize = 4;

/// Slack added to the scanned prefix of the descriptor ring; see `get_pages`
const MIN_EXTRA: usize = 4;

/// Errors surfaced by the pool
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// The region is misaligned or too small, or the pool is in the wrong
    /// state for the call
    #[error("invalid region or pool state")]
    InvalidArgument,
    /// The descriptor or per-core tables could not be allocated
    #[error("pool tables could not be allocated")]
    OutOfMemory,
    /// The free-page budget cannot cover the request
    #[error("not enough free bpages")]
    NotEnoughFree,
}

/// Runtime configuration for a pool
#[derive(Clone, Debug)]
pub struct Config {
    /// How long a core keeps the exclusive right to append to a
    /// partially-filled bpage before the page may be stolen
    pub lease: Duration,
    /// Number of per-core allocation slots; threads map onto slots
    /// round-robin
    pub cores: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease: Duration::from_micros(10_000),
            cores: std::thread::available_parallelism()
                .map(Into::into)
                .unwrap_or(1),
        }
    }
}

/// An owned, bpage-aligned buffer region
///
/// Kernel-style embedders hand the pool an externally-managed region through
/// [`Pool::init_raw`]; userspace callers and tests allocate a conforming one
/// here and transfer it with [`Pool::init`].
pub struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is a plain byte allocation; all access synchronization
// happens in the pool
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocates a zeroed region of `num_bpages` pages
    pub fn alloc(num_bpages: usize) -> Self {
        let layout = Layout::from_size_align(num_bpages * BPAGE_SIZE, BPAGE_SIZE)
            .expect("invalid region layout");
        let ptr = unsafe {
            // SAFETY: the layout is non-zero size
            debug_assert_ne!(layout.size(), 0);
            std::alloc::alloc_zeroed(layout)
        };
        let ptr = NonNull::new(ptr).expect("failed to allocate memory");
        Self { ptr, layout }
    }

    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            // SAFETY: `ptr` was allocated in `alloc` with the same layout
            std::alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

type Notify = Box<dyn Fn() + Send + Sync>;

/// Receive buffer pool for incoming messages
///
/// The pool slices a caller-supplied region into bpages and hands them out
/// to messages: whole pages for the bulk of a message, with the remainder
/// packed into a per-core partial page shared across messages. Pages are
/// reference counted; a partial page stays reserved for its core until its
/// lease expires, after which any scan may steal it.
///
/// There is no pool-wide lock. Descriptors carry their own mutex, taken only
/// with `try_lock` on allocation paths, and the free-page budget is a single
/// atomic counter that serves as the admission gate.
pub struct Pool<C: Clock = StdClock> {
    region: Option<NonNull<u8>>,
    region_size: usize,
    num_bpages: usize,
    descriptors: Box<[Descriptor]>,
    cores: Box<[CachePadded<CoreState>]>,
    /// Count of bpages with no references and no owner. Written explicitly
    /// on every state transition rather than derived, so it may briefly
    /// disagree with the table while an operation is in flight.
    free_bpages: AtomicI64,
    /// Set when an allocation starves; cleared by the next upward transition
    /// of `free_bpages` (see [`Pool::check_waiting`])
    waiting: AtomicBool,
    lease: Duration,
    clock: C,
    notify: Option<Notify>,
    /// Keeps a region transferred through [`Pool::init`] alive
    owned: Option<Region>,
}

// SAFETY: the pool never reads or writes region bytes, it only computes
// offsets into the region; descriptor and core state are synchronized with
// per-descriptor locks and atomics
unsafe impl<C: Clock + Send> Send for Pool<C> {}
unsafe impl<C: Clock + Sync> Sync for Pool<C> {}

impl<C: Clock> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("num_bpages", &self.num_bpages)
            .field("free_bpages", &self.free_bpages.load(Ordering::Relaxed))
            .finish()
    }
}

impl Pool {
    /// Creates an empty pool; [`Pool::init`] attaches a region
    pub fn new() -> Self {
        Self::with_clock(StdClock::default())
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

/// Which way a scan candidate can be claimed
enum Claim {
    /// The page is free
    Free,
    /// The page's owner lease expired with no live slices left
    Steal,
}

/// Decides whether a scan may take this page
///
/// Callers use this twice: once without the lock as a cheap filter, and
/// again with the lock held, where the answer is authoritative.
#[inline]
fn usability(desc: &Descriptor, now: Timestamp) -> Option<Claim> {
    let refs = desc.refs();
    if refs == 0 {
        return Some(Claim::Free);
    }
    if refs == 1 && desc.owner() != CORE_UNOWNED && desc.expiration() < now {
        return Some(Claim::Steal);
    }
    None
}

impl<C: Clock> Pool<C> {
    /// Creates an empty pool reading time from `clock`
    pub fn with_clock(clock: C) -> Self {
        Self {
            region: None,
            region_size: 0,
            num_bpages: 0,
            descriptors: Box::default(),
            cores: Box::default(),
            free_bpages: AtomicI64::new(0),
            waiting: AtomicBool::new(false),
            lease: Duration::ZERO,
            clock,
            notify: None,
            owned: None,
        }
    }

    /// Attaches `region` to the pool, transferring ownership
    pub fn init(&mut self, region: Region, config: Config) -> Result<(), Error> {
        unsafe {
            // SAFETY: the pool takes ownership of `region` below, so it
            // stays alive and exclusively bound to this pool until `destroy`
            self.init_raw(region.ptr(), region.size(), config)?;
        }
        self.owned = Some(region);
        Ok(())
    }

    /// Attaches an externally-managed region to the pool
    ///
    /// `region` must be aligned to [`BPAGE_SIZE`]; `region_size` must be a
    /// multiple of [`BPAGE_SIZE`] covering at least [`MIN_BPAGES`] pages and
    /// at most `u32::MAX` bytes (message descriptors store 32-bit offsets).
    ///
    /// # Safety
    ///
    /// The caller must keep the region alive until [`Pool::destroy`] and
    /// must not bind it to another pool.
    pub unsafe fn init_raw(
        &mut self,
        region: NonNull<u8>,
        region_size: usize,
        config: Config,
    ) -> Result<(), Error> {
        ensure!(self.region.is_none(), Err(Error::InvalidArgument));
        ensure!(
            region.as_ptr() as usize % BPAGE_SIZE == 0,
            Err(Error::InvalidArgument)
        );
        ensure!(region_size % BPAGE_SIZE == 0, Err(Error::InvalidArgument));
        ensure!(region_size <= u32::MAX as usize, Err(Error::InvalidArgument));
        ensure!(config.cores >= 1, Err(Error::InvalidArgument));

        let num_bpages = region_size / BPAGE_SIZE;
        ensure!(num_bpages >= MIN_BPAGES, Err(Error::InvalidArgument));

        let descriptors = alloc_table(num_bpages, Descriptor::new)?;
        let cores = alloc_table(config.cores, || CachePadded::new(CoreState::new()))?;

        self.region = Some(region);
        self.region_size = region_size;
        self.num_bpages = num_bpages;
        self.descriptors = descriptors;
        self.cores = cores;
        self.free_bpages.store(num_bpages as i64, Ordering::SeqCst);
        self.waiting.store(false, Ordering::SeqCst);
        self.lease = config.lease;
        Ok(())
    }

    /// Detaches the region and drops the descriptor tables
    ///
    /// Safe to call repeatedly, and on a pool that was never initialized.
    pub fn destroy(&mut self) {
        self.region = None;
        self.region_size = 0;
        self.num_bpages = 0;
        self.descriptors = Box::default();
        self.cores = Box::default();
        self.free_bpages.store(0, Ordering::SeqCst);
        self.waiting.store(false, Ordering::SeqCst);
        self.owned = None;
    }

    /// Installs the function invoked when free pages reappear after a
    /// starved allocation
    pub fn set_notify(&mut self, notify: impl Fn() + Send + Sync + 'static) {
        self.notify = Some(Box::new(notify));
    }

    /// Number of bpages in the attached region
    #[inline]
    pub fn num_bpages(&self) -> usize {
        self.num_bpages
    }

    /// Current free-page budget
    #[inline]
    pub fn free_bpages(&self) -> i64 {
        self.free_bpages.load(Ordering::Acquire)
    }

    #[inline]
    fn current_core(&self) -> usize {
        core_id() % self.cores.len()
    }

    /// Claims `num_pages` fresh bpages for the calling core
    ///
    /// The budget debit up front is the sole admission decision: after it
    /// succeeds the scan is committed to producing `num_pages` pages, taking
    /// expired leases if that is what it finds. Failure restores the budget
    /// and nothing else changes.
    fn get_pages(
        &self,
        num_pages: usize,
        set_owner: bool,
    ) -> Result<ArrayVec<u32, MAX_MESSAGE_BPAGES>, Error> {
        debug_assert!(num_pages >= 1);
        debug_assert!(num_pages <= MAX_MESSAGE_BPAGES);

        let debit = num_pages as i64;
        if self.free_bpages.fetch_sub(debit, Ordering::AcqRel) < debit {
            self.free_bpages.fetch_add(debit, Ordering::AcqRel);
            trace!(needed = num_pages, "not enough free bpages");
            return Err(Error::NotEnoughFree);
        }

        let core_id = self.current_core();
        let core = &self.cores[core_id];
        let now = self.clock.get_time();
        let mut pages = ArrayVec::new();
        let mut limit = 0;

        while pages.len() < num_pages {
            // When most of the pool is free, keep reusing the low end of the
            // ring: scan only the allocated prefix plus some slack, and wrap
            // back to zero past it.
            if limit == 0 {
                let free = self.free_bpages.load(Ordering::Acquire).max(0) as usize;
                let used = self.num_bpages.saturating_sub(free);
                limit = (used + (used / 4).max(MIN_EXTRA)).min(self.num_bpages);
            }

            let cur = core.next_candidate();
            core.set_next_candidate(cur + 1);
            if cur >= limit {
                core.set_next_candidate(0);
                // the prefix may have grown while scanning
                limit = 0;
                continue;
            }

            let desc = &self.descriptors[cur];

            // unlocked filter; stale reads are fine, the locked re-check
            // below decides
            ensure!(usability(desc, now).is_some(), continue);

            // never block on a candidate: one wasted slot is cheaper than a
            // wait
            let Some(guard) = desc.try_lock() else {
                continue;
            };

            let claim = match usability(desc, now) {
                Some(claim) => claim,
                None => continue,
            };

            if matches!(claim, Claim::Steal) {
                // The admission debit paid for a free page, but an expired
                // owner was holding one that was never counted free;
                // recovering it restores the difference.
                trace!(steal = cur, owner = desc.owner());
                self.free_bpages.fetch_add(1, Ordering::AcqRel);
            } else {
                debug_assert_eq!(desc.owner(), CORE_UNOWNED);
            }

            if set_owner {
                // one unit for the lease, one for the slice about to land
                desc.set_refs(2);
                desc.set_owner(core_id as i32);
                desc.set_expiration(now + self.lease);
            } else {
                desc.set_refs(1);
                desc.set_owner(CORE_UNOWNED);
            }
            drop(guard);

            trace!(claim = cur, set_owner);
            pages.push(cur as u32);
        }

        Ok(pages)
    }

    /// Fills `msg`'s offset list to cover its length
    ///
    /// Whole pages back the bulk of the message; the remainder lands in the
    /// calling core's partial page when it fits there, or in a fresh owned
    /// page otherwise. On [`Error::NotEnoughFree`] the message is left with
    /// no pages and the retry notification is armed.
    pub fn allocate(&self, msg: &mut Message) -> Result<(), Error> {
        ensure!(self.region.is_some(), Err(Error::InvalidArgument));
        debug_assert!(
            msg.length() <= MAX_MESSAGE_LENGTH,
            "message exceeds protocol maximum"
        );

        msg.clear_offsets();
        let full_pages = msg.length() >> BPAGE_SHIFT;
        let partial = msg.length() & (BPAGE_SIZE - 1);

        if full_pages > 0 {
            let pages = match self.get_pages(full_pages, false) {
                Ok(pages) => pages,
                Err(err) => return Err(self.out_of_space(msg, err)),
            };
            for &page in &pages {
                msg.push_offset(page << BPAGE_SHIFT);
            }
        }

        if partial > 0 {
            if let Err(err) = self.allocate_partial(msg, partial) {
                return Err(self.out_of_space(msg, err));
            }
        }

        debug_assert!(msg.num_bpages() <= MAX_MESSAGE_BPAGES);
        Ok(())
    }

    /// Places the sub-bpage tail of a message
    fn allocate_partial(&self, msg: &mut Message, partial: usize) -> Result<(), Error> {
        debug_assert!(partial > 0 && partial < BPAGE_SIZE);
        let core_id = self.current_core();

        if let Some(offset) = self.try_append(core_id, partial) {
            msg.push_offset(offset);
            return Ok(());
        }

        let pages = self.get_pages(1, true)?;
        let page = pages[0] as usize;
        msg.push_offset((page << BPAGE_SHIFT) as u32);
        self.cores[core_id].set_hint(page, partial);
        Ok(())
    }

    /// Tries to place a message tail in the calling core's partial page,
    /// returning the region offset on success
    ///
    /// Also retires a page that can no longer absorb the tail. Appends from
    /// threads sharing a slot serialize on the descriptor lock, so the
    /// `(page, allocated)` pair only advances while the lock is held.
    fn try_append(&self, core_id: usize, partial: usize) -> Option<u32> {
        let core = &self.cores[core_id];
        let (hint, _) = core.hint()?;
        let desc = &self.descriptors[hint];

        // never block: on contention the page is left to lease expiry
        let guard = desc.try_lock()?;

        // authoritative re-reads: the page may have been stolen, or a thread
        // sharing this slot may have moved the hint
        ensure!(desc.owner() == core_id as i32, None);
        let (page, allocated) = core.hint()?;
        ensure!(page == hint, None);

        if allocated + partial <= BPAGE_SIZE {
            desc.inc_refs();
            core.set_hint(hint, allocated + partial);
            drop(guard);
            trace!(append = hint, allocated = allocated + partial);
            return Some(((hint << BPAGE_SHIFT) + allocated) as u32);
        }

        // The page can't absorb the tail: drop the lease so the page drains
        // to free once its slices are released.
        desc.set_owner(CORE_UNOWNED);
        if desc.dec_refs() == 0 {
            self.free_bpages.fetch_add(1, Ordering::AcqRel);
        }
        trace!(retire = hint);
        None
    }

    /// Rolls back pages claimed earlier in a failed `allocate` call and arms
    /// the retry notification
    #[inline(never)] // this is rarely called
    fn out_of_space(&self, msg: &mut Message, err: Error) -> Error {
        self.release_buffers(msg.bpage_offsets());
        msg.clear_offsets();
        self.waiting.store(true, Ordering::SeqCst);
        err
    }

    /// Resolves a message byte offset to a region pointer and the contiguous
    /// bytes available from it
    ///
    /// Pure arithmetic over the message's immutable offset list; no locks.
    pub fn get_buffer(&self, msg: &Message, offset: usize) -> (NonNull<u8>, usize) {
        debug_assert!(offset < msg.length());
        let region = self.region.expect("pool is not initialized");

        let offsets = msg.bpage_offsets();
        let index = offset >> BPAGE_SHIFT;
        let within = offset & (BPAGE_SIZE - 1);

        let tail = msg.length() & (BPAGE_SIZE - 1);
        let available = if index + 1 == offsets.len() && tail != 0 {
            tail - within
        } else {
            BPAGE_SIZE - within
        };

        let region_offset = offsets[index] as usize + within;
        debug_assert!(region_offset + available <= self.region_size);

        let pointer = unsafe {
            // SAFETY: offsets produced by `allocate` address bpages inside
            // the region and `within` stays below BPAGE_SIZE, so
            // `region_offset` is in bounds
            NonNull::new_unchecked(region.as_ptr().add(region_offset))
        };
        (pointer, available)
    }

    /// Returns one message reference for every offset in `offsets`
    ///
    /// Pages whose last reference goes away (and that no core owns) rejoin
    /// the free budget, and blocked readers are notified. Tolerated after
    /// [`Pool::destroy`], where it does nothing, so teardown paths may call
    /// it unconditionally.
    pub fn release_buffers(&self, offsets: &[u32]) {
        ensure!(self.region.is_some());

        let mut freed = 0;
        for &offset in offsets {
            let index = offset as usize >> BPAGE_SHIFT;
            debug_assert!(index < self.num_bpages);
            let desc = &self.descriptors[index];
            let _guard = desc.lock();
            if desc.dec_refs() == 0 && desc.owner() == CORE_UNOWNED {
                self.free_bpages.fetch_add(1, Ordering::AcqRel);
                freed += 1;
                trace!(free = index);
            }
        }

        if freed > 0 {
            self.check_waiting();
        }
    }

    /// Wakes the external waiter if an allocation starved since the last
    /// wake and pages have become free
    ///
    /// Edge-triggered: each starvation episode produces at most one
    /// notification. The pool only invokes the installed function; any
    /// scheduling of actual readers happens outside.
    pub fn check_waiting(&self) {
        ensure!(self.waiting.load(Ordering::SeqCst));
        ensure!(self.free_bpages.load(Ordering::SeqCst) > 0);
        if self.waiting.swap(false, Ordering::SeqCst) {
            trace!("free bpages available");
            if let Some(notify) = self.notify.as_ref() {
                notify();
            }
        }
    }
}

impl<C: Clock> Drop for Pool<C> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Builds a fixed-length table, surfacing allocation failure instead of
/// aborting
fn alloc_table<T>(len: usize, init: impl FnMut() -> T) -> Result<Box<[T]>, Error> {
    let mut table = Vec::new();
    table.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    table.resize_with(len, init);
    Ok(table.into_boxed_slice())
}

/// Identifies the calling thread's allocation slot
///
/// Slots are handed out round-robin the first time a thread allocates.
/// Correctness only needs threads to rarely collide on a slot, not hardware
/// CPU identity.
fn core_id() -> usize {
    use core::sync::atomic::AtomicUsize;
    use std::cell::Cell;

    #[cfg(any(test, feature = "testing"))]
    if let Some(core) = crate::testing::pinned_core() {
        return core;
    }

    static NEXT_CORE: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static CORE: Cell<Option<usize>> = const { Cell::new(None) };
    }

    CORE.with(|core| match core.get() {
        Some(id) => id,
        None => {
            let id = NEXT_CORE.fetch_add(1, Ordering::Relaxed);
            core.set(Some(id));
            id
        }
    })
}

#[cfg(any(test, feature = "testing"))]
impl<C: Clock> Pool<C> {
    /// Forces the free-page budget, bypassing the descriptor table
    pub fn set_free_bpages(&self, free: i64) {
        self.free_bpages.store(free, Ordering::SeqCst);
    }

    /// Overwrites one descriptor's state
    pub fn set_bpage(&self, index: usize, refs: i32, owner: i32, expiration: Timestamp) {
        let desc = &self.descriptors[index];
        let _guard = desc.lock();
        desc.set_refs(refs);
        desc.set_owner(owner);
        desc.set_expiration(expiration);
    }

    /// Reads one descriptor's `(refs, owner)` pair
    pub fn bpage_state(&self, index: usize) -> (i32, i32) {
        let desc = &self.descriptors[index];
        (desc.refs(), desc.owner())
    }

    /// Reads a core's `(page_hint, allocated)` pair
    pub fn core_state(&self, core: usize) -> (Option<usize>, usize) {
        match self.cores[core].hint() {
            Some((page, allocated)) => (Some(page), allocated),
            None => (None, 0),
        }
    }

    /// Verifies the free-page budget against the descriptor table
    ///
    /// Only meaningful while no operation is in flight.
    pub fn assert_accounting(&self) {
        let mut free = 0;
        for desc in self.descriptors.iter() {
            let refs = desc.refs();
            let owner = desc.owner();
            assert!(refs >= 0);
            if owner != CORE_UNOWNED {
                assert!(refs >= 1, "owned bpage without a lease reference");
            } else if refs == 0 {
                free += 1;
            }
        }
        assert_eq!(self.free_bpages.load(Ordering::SeqCst), free);
    }
}
