//! Pin counters and pinned-sector handles.
//!
//! A *pin* is a reference-counted reservation on a sector id. While a sector
//! holds at least one pin the container will not move its payload, destroy
//! its components, or release memory it can address; structural writers block
//! on the waiter protocol here until the pins they would disturb are dropped.
//!
//! [`PinCounters`] keeps one atomic counter per id plus a
//! [`PinnedIdBitmask`] mirroring which counters are nonzero, so writers can
//! wait on ranges without scanning counters. [`PinnedSector`] and
//! [`PinnedComponent`] are the RAII handles the store hands out; dropping one
//! releases its pin and wakes waiting writers.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::bitmask::PinnedIdBitmask;
use crate::retire::RawBuf;
use crate::sectors::SectorStore;
use crate::sync::{self, Condvar, Mutex, Ordering};
use crate::StoreError;

// ---------------------------------------------------------------------------
// PinCounters
// ---------------------------------------------------------------------------

/// Per-id pin reference counts with a range-waitable drain protocol.
///
/// Gate discipline (enforced by the owning store): [`pin`](Self::pin) is only
/// called while the store's shared gate is held, so no pin can start while a
/// structural writer owns the exclusive gate; [`unpin`](Self::unpin) is
/// gate-free so in-flight pins can always drain, even while a writer blocks
/// in one of the `wait_*` methods.
pub struct PinCounters {
    counters: sync::AtomicPtr<sync::AtomicU32>,
    cap: sync::AtomicUsize,
    /// Total pins held across all ids; zero means fully drained.
    total: sync::AtomicUsize,
    bitmask: PinnedIdBitmask,
    waiters: Mutex<()>,
    notify: Condvar,
}

impl PinCounters {
    pub(crate) fn new() -> Self {
        Self {
            counters: sync::AtomicPtr::new(NonNull::<sync::AtomicU32>::dangling().as_ptr()),
            cap: sync::AtomicUsize::new(0),
            total: sync::AtomicUsize::new(0),
            bitmask: PinnedIdBitmask::new(),
            waiters: Mutex::new(()),
            notify: Condvar::new(),
        }
    }

    #[inline]
    fn slice(&self) -> &[sync::AtomicU32] {
        let len = self.cap.load(Ordering::Acquire);
        let ptr = self.counters.load(Ordering::Relaxed);
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    /// Ids currently addressable.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap.load(Ordering::Acquire)
    }

    /// Grow to cover ids `< cap_ids`. Gate-held, with all pins drained; every
    /// counter is zero so the old array is freed on the spot.
    pub(crate) fn grow(&self, cap_ids: usize) -> Result<(), StoreError> {
        let old_cap = self.cap.load(Ordering::Relaxed);
        if cap_ids <= old_cap {
            return Ok(());
        }
        debug_assert_eq!(self.total.load(Ordering::SeqCst), 0, "grow with pins outstanding");

        let old_ptr = self.counters.load(Ordering::Relaxed);
        let (ptr, cap) = RawBuf::<sync::AtomicU32>::alloc_zeroed(cap_ids)?.into_raw();
        self.counters.store(ptr.as_ptr(), Ordering::Relaxed);
        self.cap.store(cap, Ordering::Release);
        if old_cap > 0 {
            unsafe {
                let layout = Layout::array::<sync::AtomicU32>(old_cap).expect("counter layout");
                dealloc(old_ptr.cast::<u8>(), layout);
            }
        }
        self.bitmask.grow(cap_ids)
    }

    /// Take one pin on `id`. Returns `false` if `id` is beyond the tracked
    /// range (such an id has no sector to protect). Shared-gate-held only.
    pub fn pin(&self, id: u32) -> bool {
        let Some(counter) = self.slice().get(id as usize) else {
            return false;
        };
        self.total.fetch_add(1, Ordering::SeqCst);
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            self.bitmask.set(id);
        }
        true
    }

    /// Release one pin on `id`; on the last release, clears the bitmask bit
    /// and wakes every waiting writer.
    pub fn unpin(&self, id: u32) {
        let counter = &self.slice()[id as usize];
        let prev = counter.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unpin without a matching pin");
        self.total.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.bitmask.clear(id);
            // A pin that raced the drop to zero re-sets the bit itself, but
            // its set may have landed before our clear; re-assert it.
            if counter.load(Ordering::SeqCst) > 0 {
                self.bitmask.set(id);
            }
            let _guard = self.waiters.lock();
            self.notify.notify_all();
        }
    }

    /// Current pin count on `id` (0 for out-of-range ids).
    pub fn count(&self, id: u32) -> u32 {
        self.slice()
            .get(id as usize)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// Total pins held across all ids.
    #[inline]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Whether any pin is held.
    #[inline]
    pub fn any(&self) -> bool {
        self.total() > 0
    }

    #[inline]
    pub fn bitmask(&self) -> &PinnedIdBitmask {
        &self.bitmask
    }

    /// Block until no pin is held anywhere. Exclusive-gate-held only.
    pub(crate) fn wait_none(&self) {
        let mut guard = self.waiters.lock();
        while self.total.load(Ordering::SeqCst) > 0 {
            self.notify.wait(&mut guard);
        }
    }

    /// Block until no id in `lo..=hi` is pinned. Exclusive-gate-held only.
    pub(crate) fn wait_no_pins_in_range(&self, lo: u32, hi: u32) {
        let mut guard = self.waiters.lock();
        while self.bitmask.any_in_range(lo, hi) {
            self.notify.wait(&mut guard);
        }
    }

    /// Block until no id at or above `id` is pinned. Exclusive-gate-held
    /// only; used before mutations that move or release the tail.
    pub(crate) fn wait_no_pins_at_or_above(&self, id: u32) {
        let mut guard = self.waiters.lock();
        while self.bitmask.lowest_set_ge(id).is_some() {
            self.notify.wait(&mut guard);
        }
    }
}

impl Drop for PinCounters {
    fn drop(&mut self) {
        let cap = self.cap.load(Ordering::Relaxed);
        if cap > 0 {
            unsafe {
                let layout = Layout::array::<sync::AtomicU32>(cap).expect("counter layout");
                dealloc(self.counters.load(Ordering::Relaxed).cast::<u8>(), layout);
            }
        }
    }
}

impl fmt::Debug for PinCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinCounters")
            .field("capacity", &self.capacity())
            .field("total", &self.total())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PinnedSector
// ---------------------------------------------------------------------------

/// RAII handle on a pinned sector.
///
/// While the handle lives, the sector's payload address is stable and the
/// container will neither move nor destroy the sector; writers that would
/// disturb it block until the handle is dropped. The handle is move-only;
/// dropping it releases the pin.
///
/// Holding a pin while calling a structural mutator (`erase`, `reserve`,
/// `clear`, ...) from the same thread deadlocks: the mutator waits for a pin
/// only the caller can release.
pub struct PinnedSector<'a> {
    store: &'a SectorStore,
    id: u32,
    payload: NonNull<u8>,
    alive_at_pin: u64,
}

impl<'a> PinnedSector<'a> {
    /// The pin is already counted; the handle takes over releasing it.
    pub(crate) fn new(store: &'a SectorStore, id: u32, payload: NonNull<u8>, alive: u64) -> Self {
        Self {
            store,
            id,
            payload,
            alive_at_pin: alive,
        }
    }

    /// The pinned sector id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Base address of the sector payload. Stable while the handle lives.
    #[inline]
    pub fn payload_ptr(&self) -> NonNull<u8> {
        self.payload
    }

    /// Component liveness mask sampled when the pin was taken. Components
    /// cannot be destroyed while pinned, but new ones may be emplaced, so the
    /// current mask can be a superset of this one.
    #[inline]
    pub fn alive_at_pin(&self) -> u64 {
        self.alive_at_pin
    }

    /// Typed pointer to this sector's `T`, if `T` is alive right now.
    pub fn component_ptr<T: 'static>(&self) -> Option<NonNull<T>> {
        let entry = self.store.layout().entry_of::<T>()?;
        if self.store.alive_mask_of(self.id) & entry.mask() == 0 {
            return None;
        }
        let ptr = unsafe { self.payload.as_ptr().add(entry.offset()) };
        NonNull::new(ptr.cast::<T>())
    }

    /// Borrow this sector's `T`, if `T` is alive at the moment of the call.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.component_ptr::<T>().map(|p| unsafe { &*p.as_ptr() })
    }

    /// Narrow the handle to one component type, keeping the pin. Returns
    /// `None` (releasing the pin) if `T` is not part of the layout.
    pub fn into_component<T: 'static>(self) -> Option<PinnedComponent<'a, T>> {
        let entry = self.store.layout().entry_of::<T>()?;
        let ptr = unsafe { self.payload.as_ptr().add(entry.offset()) };
        let mask = entry.mask();
        Some(PinnedComponent {
            ptr: NonNull::new(ptr.cast::<T>())?,
            mask,
            sector: self,
        })
    }
}

impl Drop for PinnedSector<'_> {
    fn drop(&mut self) {
        self.store.pin_counters().unpin(self.id);
    }
}

impl fmt::Debug for PinnedSector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedSector")
            .field("id", &self.id)
            .field("alive_at_pin", &format_args!("{:#x}", self.alive_at_pin))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PinnedComponent
// ---------------------------------------------------------------------------

/// A [`PinnedSector`] narrowed to one component type.
///
/// [`get`](Self::get) is nullable: the component may not be alive in the
/// sector even though the sector itself is pinned.
pub struct PinnedComponent<'a, T> {
    sector: PinnedSector<'a>,
    ptr: NonNull<T>,
    mask: u64,
}

impl<'a, T: 'static> PinnedComponent<'a, T> {
    /// The pinned sector id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.sector.id()
    }

    /// The underlying sector handle.
    #[inline]
    pub fn sector(&self) -> &PinnedSector<'a> {
        &self.sector
    }

    /// Borrow the component, if it is alive at the moment of the call.
    pub fn get(&self) -> Option<&T> {
        if self.sector.store.alive_mask_of(self.sector.id) & self.mask == 0 {
            return None;
        }
        Some(unsafe { self.ptr.as_ref() })
    }

    /// Typed pointer to the component slot, alive or not. Stable while the
    /// handle lives.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }
}

impl<T> fmt::Debug for PinnedComponent<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedComponent")
            .field("id", &self.sector.id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
