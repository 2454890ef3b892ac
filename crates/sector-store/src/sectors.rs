//! The sector container.
//!
//! A [`SectorStore`] keeps one *sector* per entity id for a fixed grouped set
//! of component types. Payloads live in a [`ChunkArena`] (stable addresses,
//! chunked growth); parallel dense arrays hold each slot's id and component
//! liveness mask; a sparse array indexed by entity id maps back to the dense
//! slot. Dense slots are kept sorted by id, so keyed lookup is O(1) through
//! the sparse array and ranged traversal is a binary search plus a linear
//! walk.
//!
//! # Concurrency (the `concurrent` build)
//!
//! Readers are lock-free in the steady state: they load published snapshots
//! of the dense and sparse tables and address payloads through the
//! append-only chunk arena. Structural writers serialize on the exclusive
//! gate, drain pins covering the slots they would move or destroy, and
//! replace tables by publish-then-retire so a stale reader never dereferences
//! freed memory. Safe borrows (`pin_*`, `for_each_*`) are mediated either by
//! a pin or by holding the shared gate; raw-pointer reads (`get_ptr`,
//! `iter`) take no lock and see a consistent snapshot of possibly stale
//! data.
//!
//! # Safety
//!
//! Unsafe code here upholds: dense/sparse indices are always in bounds of the
//! tables they were read from; payload pointers come from the arena and are
//! only dereferenced below the published length; component values are written
//! and dropped exactly once through the layout dispatch table.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::Layout;
use std::fmt;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::chunks::{ChunkArena, LinearSpan, PayloadCursor, RangesCursor};
use crate::layout::{ComponentLayout, ComponentTypeId, SectorLayout};
use crate::pin::{PinCounters, PinnedComponent, PinnedSector};
use crate::retire::{dispose, RawBuf, RetireBin};
use crate::sync::{self, Ordering, RwLockReadGuard};
use crate::{StoreError, CHUNK_CAPACITY};

/// Reserved id; never a valid sector.
pub const INVALID_ID: u32 = u32::MAX;

/// Presence tag in a packed sparse word: low 32 bits hold the linear index.
/// The all-zero word means vacant, so freshly zeroed sparse storage is empty.
const SLOT_PRESENT: u64 = 1 << 32;

// ---------------------------------------------------------------------------
// Published table snapshots
// ---------------------------------------------------------------------------

/// Dense-array snapshot published to readers: parallel `ids[]` / `alive[]`
/// up to `cap` slots. Replaced wholesale on growth; old tables are retired.
struct DenseTables {
    ids: *mut sync::AtomicU32,
    alive: *mut sync::AtomicU64,
    cap: usize,
}

impl DenseTables {
    #[inline]
    unsafe fn id(&self, k: usize) -> &sync::AtomicU32 {
        debug_assert!(k < self.cap);
        &*self.ids.add(k)
    }

    #[inline]
    unsafe fn alive(&self, k: usize) -> &sync::AtomicU64 {
        debug_assert!(k < self.cap);
        &*self.alive.add(k)
    }
}

/// Sparse-array snapshot: one packed word per entity id.
struct SparseTable {
    slots: *mut sync::AtomicU64,
    cap: usize,
}

impl SparseTable {
    #[inline]
    fn lookup(&self, id: u32) -> Option<usize> {
        if (id as usize) >= self.cap {
            return None;
        }
        let word = unsafe { &*self.slots.add(id as usize) }.load(Ordering::Acquire);
        if word & SLOT_PRESENT != 0 {
            Some(word as u32 as usize)
        } else {
            None
        }
    }
}

/// Buffer ownership for the published tables; mutated only under the gate.
pub(crate) struct WriterState {
    ids_buf: RawBuf<sync::AtomicU32>,
    alive_buf: RawBuf<sync::AtomicU64>,
    sparse_buf: RawBuf<sync::AtomicU64>,
}

/// Shared-gate guard handed to iteration façades.
pub struct StoreReadGuard<'a>(#[allow(dead_code)] RwLockReadGuard<'a, WriterState>);

// ---------------------------------------------------------------------------
// SlotInfo
// ---------------------------------------------------------------------------

/// Location of a present sector: payload address and dense index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub data: NonNull<u8>,
    pub index: usize,
}

// ---------------------------------------------------------------------------
// ComponentSet -- tuples of components moved into a sector
// ---------------------------------------------------------------------------

/// A tuple of component values inserted into one sector together.
///
/// Implemented for tuples of one to four distinct component types; every
/// type must be part of the store's layout.
pub trait ComponentSet {
    /// Combined liveness mask. Fails if any type is foreign to `layout`;
    /// panics if the tuple repeats a type.
    fn mask(layout: &SectorLayout) -> Result<u64, StoreError>;

    /// Move every value into its slot of an unconstructed sector payload.
    ///
    /// # Safety
    ///
    /// `payload` must be a sector base of `layout` with no live value at any
    /// offset this set writes; [`mask`](Self::mask) must have succeeded.
    unsafe fn write_into(self, layout: &SectorLayout, payload: *mut u8);

    /// Like [`write_into`](Self::write_into) over a live sector: drops any
    /// value being replaced, per `old_alive`.
    ///
    /// # Safety
    ///
    /// Same as `write_into`, except offsets flagged in `old_alive` hold live
    /// values of the matching types.
    unsafe fn write_over(self, layout: &SectorLayout, payload: *mut u8, old_alive: u64);
}

unsafe fn write_one<T: 'static>(
    layout: &SectorLayout,
    payload: *mut u8,
    value: T,
    old_alive: u64,
) {
    let entry = layout
        .entry_of::<T>()
        .expect("component set validated against layout");
    let dst = payload.add(entry.offset());
    if old_alive & entry.mask() != 0 {
        (entry.ops.drop)(dst);
    }
    std::ptr::write(dst.cast::<T>(), value);
}

macro_rules! component_set_tuple {
    ($($name:ident),+) => {
        impl<$($name: 'static),+> ComponentSet for ($($name,)+) {
            fn mask(layout: &SectorLayout) -> Result<u64, StoreError> {
                let mut mask = 0u64;
                $(
                    let bit = layout.require::<$name>()?.mask();
                    assert_eq!(mask & bit, 0, "duplicate component type in component set");
                    mask |= bit;
                )+
                Ok(mask)
            }

            #[allow(non_snake_case)]
            unsafe fn write_into(self, layout: &SectorLayout, payload: *mut u8) {
                let ($($name,)+) = self;
                $(write_one(layout, payload, $name, 0);)+
            }

            #[allow(non_snake_case)]
            unsafe fn write_over(self, layout: &SectorLayout, payload: *mut u8, old_alive: u64) {
                let ($($name,)+) = self;
                $(write_one(layout, payload, $name, old_alive);)+
            }
        }
    };
}

component_set_tuple!(A);
component_set_tuple!(A, B);
component_set_tuple!(A, B, C);
component_set_tuple!(A, B, C, D);

// ---------------------------------------------------------------------------
// SectorStore
// ---------------------------------------------------------------------------

pub struct SectorStore {
    layout: Arc<SectorLayout>,
    bin: Arc<RetireBin>,
    arena: ChunkArena,
    len: sync::AtomicUsize,
    dense: sync::AtomicPtr<DenseTables>,
    sparse: sync::AtomicPtr<SparseTable>,
    pins: PinCounters,
    gate: sync::RwLock<WriterState>,
}

// Safety: every interior-mutable field is either an atomic, a lock, or raw
// storage mutated only under the exclusive gate after draining pins; layout
// registration requires every component type to be Send + Sync.
#[cfg(feature = "concurrent")]
unsafe impl Send for SectorStore {}
#[cfg(feature = "concurrent")]
unsafe impl Sync for SectorStore {}

impl SectorStore {
    /// Create an empty store for `layout` with no reserved capacity.
    pub fn new(layout: Arc<SectorLayout>) -> Result<Self, StoreError> {
        Self::with_chunk_capacity(layout, 0, CHUNK_CAPACITY)
    }

    /// Create a store with room for at least `capacity` sectors.
    pub fn with_capacity(layout: Arc<SectorLayout>, capacity: usize) -> Result<Self, StoreError> {
        Self::with_chunk_capacity(layout, capacity, CHUNK_CAPACITY)
    }

    /// Create a store with an explicit sectors-per-chunk count. Smaller
    /// chunks are mostly useful to exercise chunk-boundary behavior.
    pub fn with_chunk_capacity(
        layout: Arc<SectorLayout>,
        capacity: usize,
        chunk_capacity: usize,
    ) -> Result<Self, StoreError> {
        let arena = ChunkArena::new(layout.sector_size(), layout.sector_align(), chunk_capacity)?;
        let dense = Box::new(DenseTables {
            ids: NonNull::<sync::AtomicU32>::dangling().as_ptr(),
            alive: NonNull::<sync::AtomicU64>::dangling().as_ptr(),
            cap: 0,
        });
        let sparse = Box::new(SparseTable {
            slots: NonNull::<sync::AtomicU64>::dangling().as_ptr(),
            cap: 0,
        });
        let store = Self {
            layout,
            bin: Arc::new(RetireBin::new()),
            arena,
            len: sync::AtomicUsize::new(0),
            dense: sync::AtomicPtr::new(Box::into_raw(dense)),
            sparse: sync::AtomicPtr::new(Box::into_raw(sparse)),
            pins: PinCounters::new(),
            gate: sync::RwLock::new(WriterState {
                ids_buf: RawBuf::empty(),
                alive_buf: RawBuf::empty(),
                sparse_buf: RawBuf::empty(),
            }),
        };
        if capacity > 0 {
            let mut state = store.gate.write();
            store.reserve_locked(&mut state, capacity)?;
            drop(state);
        }
        Ok(store)
    }

    // -- snapshots ----------------------------------------------------------

    #[inline]
    fn dense_tables(&self) -> &DenseTables {
        unsafe { &*self.dense.load(Ordering::Acquire) }
    }

    #[inline]
    fn sparse_table(&self) -> &SparseTable {
        unsafe { &*self.sparse.load(Ordering::Acquire) }
    }

    // -- introspection ------------------------------------------------------

    /// Number of sectors.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sectors the store can hold without reallocating. Always a multiple of
    /// the chunk capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.dense_tables().cap
    }

    #[inline]
    pub fn layout(&self) -> &SectorLayout {
        &self.layout
    }

    #[inline]
    pub fn retire_bin(&self) -> &RetireBin {
        &self.bin
    }

    #[inline]
    pub fn pin_counters(&self) -> &PinCounters {
        &self.pins
    }

    #[inline]
    pub(crate) fn arena(&self) -> &ChunkArena {
        &self.arena
    }

    /// Whether a sector exists for `id`.
    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.slot_index(id).is_some()
    }

    /// Whether `id`'s sector currently holds a live `T`.
    pub fn contains_component<T: 'static>(&self, id: u32) -> bool {
        match self.layout.mask_of::<T>() {
            Some(mask) => self.alive_mask_of(id) & mask != 0,
            None => false,
        }
    }

    /// Liveness mask of `id`'s sector; 0 when absent.
    pub fn alive_mask_of(&self, id: u32) -> u64 {
        match self.slot_index(id) {
            Some(k) => {
                let dense = self.dense_tables();
                if k < dense.cap {
                    unsafe { dense.alive(k) }.load(Ordering::Acquire)
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    #[inline]
    pub(crate) fn slot_index(&self, id: u32) -> Option<usize> {
        self.sparse_table().lookup(id)
    }

    /// Payload address and dense index of `id`'s sector.
    pub fn slot_info(&self, id: u32) -> Option<SlotInfo> {
        let index = self.slot_index(id)?;
        let data = NonNull::new(self.arena.payload(index))?;
        Some(SlotInfo { data, index })
    }

    // -- reads --------------------------------------------------------------

    /// Raw pointer to `id`'s `T`, if alive. Lock-free.
    ///
    /// The pointee address is stable, but the value may be concurrently
    /// replaced or destroyed unless the caller holds a pin on `id`;
    /// dereferencing is `unsafe` for that reason.
    pub fn get_ptr<T: 'static>(&self, id: u32) -> Option<NonNull<T>> {
        let entry = self.layout.entry_of::<T>()?;
        self.get_ptr_erased(id, entry).map(NonNull::cast::<T>)
    }

    /// Erased variant of [`get_ptr`](Self::get_ptr), addressed by dense
    /// component id.
    pub fn get_ptr_by_id(&self, id: u32, type_id: ComponentTypeId) -> Option<NonNull<u8>> {
        let entry = self.layout.entry(type_id)?;
        self.get_ptr_erased(id, entry)
    }

    fn get_ptr_erased(&self, id: u32, entry: &ComponentLayout) -> Option<NonNull<u8>> {
        let k = self.slot_index(id)?;
        let dense = self.dense_tables();
        if k >= dense.cap {
            return None;
        }
        if unsafe { dense.alive(k) }.load(Ordering::Acquire) & entry.mask() == 0 {
            return None;
        }
        NonNull::new(unsafe { self.arena.payload(k).add(entry.offset()) })
    }

    /// Clone out `id`'s `T`. Takes a pin for the duration of the clone.
    pub fn get_cloned<T: Clone + 'static>(&self, id: u32) -> Option<T> {
        let component = self.pin_component::<T>(id)?;
        let value = component.get()?.clone();
        Some(value)
    }

    /// Mutable borrow of `id`'s `T`. Exclusive access through `&mut self`.
    pub fn get_mut<T: 'static>(&mut self, id: u32) -> Option<&mut T> {
        let entry = self.layout.entry_of::<T>()?;
        let k = self.slot_index(id)?;
        let dense = self.dense_tables();
        if unsafe { dense.alive(k) }.load(Ordering::Relaxed) & entry.mask() == 0 {
            return None;
        }
        let ptr = unsafe { self.arena.payload(k).add(entry.offset()) };
        Some(unsafe { &mut *ptr.cast::<T>() })
    }

    // -- pinning ------------------------------------------------------------

    /// Pin `id`'s sector, or `None` if absent. While the returned handle
    /// lives, the sector will not be moved or destroyed.
    pub fn pin_sector(&self, id: u32) -> Option<PinnedSector<'_>> {
        let _shared = self.gate.read();
        self.pin_sector_prelocked(id)
    }

    /// Pin while the caller already holds the shared gate.
    pub(crate) fn pin_sector_prelocked(&self, id: u32) -> Option<PinnedSector<'_>> {
        let k = self.slot_index(id)?;
        let pinned = self.pins.pin(id);
        debug_assert!(pinned, "present ids are within the counter range");
        // The shared gate blocks structural writers, so the slot resolved
        // above is still this sector.
        let payload = unsafe { NonNull::new_unchecked(self.arena.payload(k)) };
        let alive = unsafe { self.dense_tables().alive(k) }.load(Ordering::Acquire);
        Some(PinnedSector::new(self, id, payload, alive))
    }

    /// Pin `id`'s sector narrowed to component `T`. `None` if the sector is
    /// absent or `T` is not part of the layout.
    pub fn pin_component<T: 'static>(&self, id: u32) -> Option<PinnedComponent<'_, T>> {
        self.layout.entry_of::<T>()?;
        self.pin_sector(id)?.into_component::<T>()
    }

    // -- mutation -----------------------------------------------------------

    /// Reserve room for at least `capacity` sectors. Never shrinks. Waits for
    /// all pins to drain before republishing the dense tables.
    pub fn reserve(&self, capacity: usize) -> Result<(), StoreError> {
        let mut state = self.gate.write();
        self.reserve_locked(&mut state, capacity)
    }

    /// Insert a new sector for `id`. Strict: fails with
    /// [`StoreError::AlreadyPresent`] if `id` already has one.
    pub fn insert<S: ComponentSet>(&self, id: u32, components: S) -> Result<(), StoreError> {
        assert_ne!(id, INVALID_ID, "id {INVALID_ID:#x} is reserved");
        let mask = S::mask(&self.layout)?;
        let mut state = self.gate.write();
        if self.slot_index(id).is_some() {
            return Err(StoreError::AlreadyPresent { id });
        }
        let layout = &self.layout;
        self.push_new_sector(&mut state, id, mask, move |payload| unsafe {
            components.write_into(layout, payload)
        })
    }

    /// Insert a sector for `id`, or overwrite the matching components of the
    /// existing one in place (dropping replaced values, extending the
    /// liveness mask). Waits for pins on `id` before overwriting.
    pub fn insert_or_update<S: ComponentSet>(
        &self,
        id: u32,
        components: S,
    ) -> Result<(), StoreError> {
        assert_ne!(id, INVALID_ID, "id {INVALID_ID:#x} is reserved");
        let mask = S::mask(&self.layout)?;
        let mut state = self.gate.write();
        if let Some(k) = self.slot_index(id) {
            self.pins.wait_no_pins_in_range(id, id);
            let dense = self.dense_tables();
            let old_alive = unsafe { dense.alive(k) }.load(Ordering::Relaxed);
            let payload = self.arena.payload(k);
            unsafe {
                components.write_over(&self.layout, payload, old_alive);
                dense.alive(k).store(old_alive | mask, Ordering::Release);
            }
            tracing::trace!(id, "updated sector in place");
            return Ok(());
        }
        let layout = &self.layout;
        self.push_new_sector(&mut state, id, mask, move |payload| unsafe {
            components.write_into(layout, payload)
        })
    }

    /// Insert or overwrite a single component in `id`'s sector, creating the
    /// sector if absent. Other components of an existing sector are left
    /// untouched.
    pub fn emplace<T: 'static>(&self, id: u32, value: T) -> Result<(), StoreError> {
        assert_ne!(id, INVALID_ID, "id {INVALID_ID:#x} is reserved");
        let entry = self.layout.require::<T>()?;
        let mask = entry.mask();
        let offset = entry.offset();
        let drop_fn = entry.ops.drop;
        let mut state = self.gate.write();
        if let Some(k) = self.slot_index(id) {
            self.pins.wait_no_pins_in_range(id, id);
            let dense = self.dense_tables();
            let old_alive = unsafe { dense.alive(k) }.load(Ordering::Relaxed);
            let dst = unsafe { self.arena.payload(k).add(offset) };
            unsafe {
                if old_alive & mask != 0 {
                    drop_fn(dst);
                }
                std::ptr::write(dst.cast::<T>(), value);
                dense.alive(k).store(old_alive | mask, Ordering::Release);
            }
            tracing::trace!(id, component = entry.name(), "emplaced component");
            return Ok(());
        }
        self.push_new_sector(&mut state, id, mask, move |payload| unsafe {
            std::ptr::write(payload.add(offset).cast::<T>(), value)
        })
    }

    /// Default-construct a component by dense id, creating the sector if
    /// absent. Erased counterpart of [`emplace`](Self::emplace).
    pub fn emplace_default(&self, id: u32, type_id: ComponentTypeId) -> Result<(), StoreError> {
        assert_ne!(id, INVALID_ID, "id {INVALID_ID:#x} is reserved");
        let entry = self
            .layout
            .entry(type_id)
            .ok_or(StoreError::InvalidComponentType {
                ty: "<unregistered component id>",
            })?;
        let mask = entry.mask();
        let offset = entry.offset();
        let ops = entry.ops;
        let mut state = self.gate.write();
        if let Some(k) = self.slot_index(id) {
            self.pins.wait_no_pins_in_range(id, id);
            let dense = self.dense_tables();
            let old_alive = unsafe { dense.alive(k) }.load(Ordering::Relaxed);
            let dst = unsafe { self.arena.payload(k).add(offset) };
            unsafe {
                if old_alive & mask != 0 {
                    (ops.drop)(dst);
                }
                (ops.default_construct)(dst);
                dense.alive(k).store(old_alive | mask, Ordering::Release);
            }
            return Ok(());
        }
        self.push_new_sector(&mut state, id, mask, move |payload| unsafe {
            (ops.default_construct)(payload.add(offset))
        })
    }

    /// Erase `id`'s sector: destroy its live components, then shift the tail
    /// left one slot to keep the dense arrays packed and sorted. O(n) in the
    /// tail length. Waits for pins at or above `id` (the shift relocates
    /// every tail sector). Returns whether a sector was removed.
    pub fn erase(&self, id: u32) -> bool {
        let _gate = self.gate.write();
        let Some(k) = self.slot_index(id) else {
            return false;
        };
        self.pins.wait_no_pins_at_or_above(id);
        unsafe {
            self.destroy_slot_components(k);
        }
        self.clear_sparse(id);
        unsafe {
            self.shift_tail_left(k);
        }
        tracing::trace!(id, "erased sector");
        true
    }

    /// Destroy the live `T` in `id`'s sector, clearing its liveness bit. A
    /// sector whose mask reaches zero is removed entirely. Returns whether a
    /// component was destroyed.
    pub fn destroy_component<T: 'static>(&self, id: u32) -> Result<bool, StoreError> {
        let entry = self.layout.require::<T>()?;
        Ok(self.destroy_component_inner(id, entry))
    }

    /// Erased counterpart of [`destroy_component`](Self::destroy_component).
    pub fn destroy_component_by_id(
        &self,
        id: u32,
        type_id: ComponentTypeId,
    ) -> Result<bool, StoreError> {
        let entry = self
            .layout
            .entry(type_id)
            .ok_or(StoreError::InvalidComponentType {
                ty: "<unregistered component id>",
            })?;
        Ok(self.destroy_component_inner(id, entry))
    }

    fn destroy_component_inner(&self, id: u32, entry: &ComponentLayout) -> bool {
        let _gate = self.gate.write();
        let Some(k) = self.slot_index(id) else {
            return false;
        };
        let dense = self.dense_tables();
        let alive = unsafe { dense.alive(k) }.load(Ordering::Relaxed);
        if alive & entry.mask() == 0 {
            return false;
        }
        self.pins.wait_no_pins_in_range(id, id);
        unsafe {
            (entry.ops.drop)(self.arena.payload(k).add(entry.offset()));
        }
        let remaining = alive & !entry.mask();
        unsafe { dense.alive(k) }.store(remaining, Ordering::Release);
        tracing::trace!(id, component = entry.name(), "destroyed component");
        if remaining == 0 {
            // Last component gone: drop the whole sector.
            self.pins.wait_no_pins_at_or_above(id);
            self.clear_sparse(id);
            unsafe {
                self.shift_tail_left(k);
            }
            tracing::trace!(id, "sector empty after component destruction; erased");
        }
        true
    }

    /// Destroy every sector. Capacity, including the arena, is kept.
    pub fn clear(&self) {
        let _gate = self.gate.write();
        let n = self.len.load(Ordering::Relaxed);
        if n == 0 {
            return;
        }
        self.pins.wait_none();
        let dense = self.dense_tables();
        for k in 0..n {
            unsafe {
                self.destroy_slot_components(k);
            }
            let id = unsafe { dense.id(k) }.load(Ordering::Relaxed);
            self.clear_sparse(id);
            unsafe {
                dense.id(k).store(INVALID_ID, Ordering::Release);
                dense.alive(k).store(0, Ordering::Release);
            }
        }
        self.len.store(0, Ordering::Release);
        tracing::debug!(sectors = n, "cleared store");
    }

    /// Remove sectors whose liveness mask is zero, repacking the tail.
    /// Normally a no-op: `erase` and `destroy_component` keep the dense
    /// arrays packed on their own.
    pub fn compact(&self) {
        let _gate = self.gate.write();
        let n = self.len.load(Ordering::Relaxed);
        let dense = self.dense_tables();
        let first_dead = (0..n).find(|&k| unsafe { dense.alive(k) }.load(Ordering::Relaxed) == 0);
        let Some(first_dead) = first_dead else {
            return;
        };
        let boundary = unsafe { dense.id(first_dead) }.load(Ordering::Relaxed);
        self.pins.wait_no_pins_at_or_above(boundary);

        let stride = self.layout.sector_size();
        let mut write = first_dead;
        for read in first_dead..n {
            let alive = unsafe { dense.alive(read) }.load(Ordering::Relaxed);
            let id = unsafe { dense.id(read) }.load(Ordering::Relaxed);
            if alive == 0 {
                self.clear_sparse(id);
                continue;
            }
            if read != write {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.arena.payload(read),
                        self.arena.payload(write),
                        stride,
                    );
                    dense.id(write).store(id, Ordering::Release);
                    dense.alive(write).store(alive, Ordering::Release);
                }
                self.set_sparse(id, write);
            }
            write += 1;
        }
        for k in write..n {
            unsafe {
                dense.id(k).store(INVALID_ID, Ordering::Release);
                dense.alive(k).store(0, Ordering::Release);
            }
        }
        self.len.store(write, Ordering::Release);
        tracing::debug!(removed = n - write, "compacted store");
    }

    /// Release whole unused trailing chunks and shrink the dense tables to
    /// match. Waits for all pins to drain first. Payload addresses of
    /// retained sectors are unaffected.
    pub fn shrink_to_fit(&self) -> Result<(), StoreError> {
        let mut state = self.gate.write();
        let n = self.len.load(Ordering::Relaxed);
        let target_chunks = n.div_ceil(self.arena.chunk_capacity());
        if target_chunks >= self.arena.chunk_count() {
            return Ok(());
        }
        self.pins.wait_none();
        self.bin.drain_all();
        self.arena.shrink(n, &self.bin);
        self.rebuild_dense(&mut state, self.arena.capacity())
    }

    // -- gate-held internals ------------------------------------------------

    fn reserve_locked(
        &self,
        state: &mut WriterState,
        capacity: usize,
    ) -> Result<(), StoreError> {
        if capacity <= self.dense_tables().cap {
            return Ok(());
        }
        tracing::debug!(requested = capacity, current = self.capacity(), "growing sector store");
        self.pins.wait_none();
        self.bin.drain_all();
        self.arena.reserve(capacity, &self.bin)?;
        self.rebuild_dense(state, self.arena.capacity())
    }

    /// Swap in dense tables of `new_cap` slots, copying the live prefix and
    /// retiring the old storage. Pins must be fully drained.
    fn rebuild_dense(&self, state: &mut WriterState, new_cap: usize) -> Result<(), StoreError> {
        let len = self.len.load(Ordering::Relaxed);
        debug_assert!(len <= new_cap);

        let new_ids = RawBuf::<sync::AtomicU32>::alloc_zeroed(new_cap)?;
        let new_alive = RawBuf::<sync::AtomicU64>::alloc_zeroed(new_cap)?;
        let old = self.dense_tables();
        if len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(old.ids.cast_const(), new_ids.ptr(), len);
                std::ptr::copy_nonoverlapping(old.alive.cast_const(), new_alive.ptr(), len);
            }
        }

        let table = Box::new(DenseTables {
            ids: new_ids.ptr(),
            alive: new_alive.ptr(),
            cap: new_cap,
        });
        let old_table = self.dense.load(Ordering::Relaxed);
        self.dense.store(Box::into_raw(table), Ordering::Release);
        unsafe {
            dispose(
                &self.bin,
                NonNull::new_unchecked(old_table.cast::<u8>()),
                Layout::new::<DenseTables>(),
            );
        }
        state.ids_buf.take().dispose_into(&self.bin);
        state.alive_buf.take().dispose_into(&self.bin);
        state.ids_buf = new_ids;
        state.alive_buf = new_alive;
        Ok(())
    }

    fn grow_sparse_locked(&self, state: &mut WriterState, min_id: u32) -> Result<(), StoreError> {
        let needed = min_id as usize + 1;
        if needed <= self.sparse_table().cap {
            return Ok(());
        }
        let new_cap = needed.next_power_of_two().max(64);
        tracing::debug!(ids = new_cap, "growing sparse map");
        self.pins.wait_none();
        self.bin.drain_all();

        let new_slots = RawBuf::<sync::AtomicU64>::alloc_zeroed(new_cap)?;
        let old = self.sparse_table();
        if old.cap > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(old.slots.cast_const(), new_slots.ptr(), old.cap);
            }
        }

        let table = Box::new(SparseTable {
            slots: new_slots.ptr(),
            cap: new_cap,
        });
        let old_table = self.sparse.load(Ordering::Relaxed);
        self.sparse.store(Box::into_raw(table), Ordering::Release);
        unsafe {
            dispose(
                &self.bin,
                NonNull::new_unchecked(old_table.cast::<u8>()),
                Layout::new::<SparseTable>(),
            );
        }
        state.sparse_buf.take().dispose_into(&self.bin);
        state.sparse_buf = new_slots;

        self.pins.grow(new_cap)
    }

    fn push_new_sector(
        &self,
        state: &mut WriterState,
        id: u32,
        mask: u64,
        write: impl FnOnce(*mut u8),
    ) -> Result<(), StoreError> {
        let k = self.len.load(Ordering::Relaxed);
        if k == self.dense_tables().cap {
            self.reserve_locked(state, k + 1)?;
        }
        self.grow_sparse_locked(state, id)?;

        write(self.arena.payload(k));
        let dense = self.dense_tables();
        unsafe {
            dense.id(k).store(id, Ordering::Release);
            dense.alive(k).store(mask, Ordering::Release);
        }
        self.set_sparse(id, k);
        self.len.store(k + 1, Ordering::Release);
        tracing::trace!(id, slot = k, "inserted sector");
        self.restore_sort(k, id);
        Ok(())
    }

    /// Bubble the freshly appended slot `k` leftwards until `ids` is strictly
    /// increasing again. Each step exchanges the payload contents of two
    /// slots and re-points both sparse entries; affected sectors must be
    /// unpinned, which the wait below guarantees.
    fn restore_sort(&self, k: usize, id: u32) {
        if k == 0 {
            return;
        }
        let dense = self.dense_tables();
        if unsafe { dense.id(k - 1) }.load(Ordering::Relaxed) < id {
            return;
        }
        self.pins.wait_no_pins_at_or_above(id);
        let mut j = k;
        while j > 0 {
            let left = unsafe { dense.id(j - 1) }.load(Ordering::Relaxed);
            let right = unsafe { dense.id(j) }.load(Ordering::Relaxed);
            if left < right {
                break;
            }
            unsafe {
                self.swap_slots(j - 1, j);
            }
            j -= 1;
        }
    }

    unsafe fn swap_slots(&self, a: usize, b: usize) {
        let dense = self.dense_tables();
        std::ptr::swap_nonoverlapping(
            self.arena.payload(a),
            self.arena.payload(b),
            self.layout.sector_size(),
        );
        let id_a = dense.id(a).load(Ordering::Relaxed);
        let id_b = dense.id(b).load(Ordering::Relaxed);
        dense.id(a).store(id_b, Ordering::Release);
        dense.id(b).store(id_a, Ordering::Release);
        let alive_a = dense.alive(a).load(Ordering::Relaxed);
        let alive_b = dense.alive(b).load(Ordering::Relaxed);
        dense.alive(a).store(alive_b, Ordering::Release);
        dense.alive(b).store(alive_a, Ordering::Release);
        self.set_sparse(id_b, a);
        self.set_sparse(id_a, b);
    }

    unsafe fn destroy_slot_components(&self, k: usize) {
        let alive = self.dense_tables().alive(k).load(Ordering::Relaxed);
        if alive == 0 {
            return;
        }
        let payload = self.arena.payload(k);
        for entry in self.layout.entries() {
            if alive & entry.mask() != 0 && entry.ops.needs_drop {
                (entry.ops.drop)(payload.add(entry.offset()));
            }
        }
    }

    /// Move slots `k+1..len` one slot left, updating ids, masks, and sparse
    /// entries, then decrement the length. Slot `k`'s components must already
    /// be destroyed and its sparse entry cleared.
    unsafe fn shift_tail_left(&self, k: usize) {
        let dense = self.dense_tables();
        let n = self.len.load(Ordering::Relaxed);
        let stride = self.layout.sector_size();
        for j in k + 1..n {
            std::ptr::copy_nonoverlapping(self.arena.payload(j), self.arena.payload(j - 1), stride);
            let id = dense.id(j).load(Ordering::Relaxed);
            dense.id(j - 1).store(id, Ordering::Release);
            dense
                .alive(j - 1)
                .store(dense.alive(j).load(Ordering::Relaxed), Ordering::Release);
            self.set_sparse(id, j - 1);
        }
        dense.id(n - 1).store(INVALID_ID, Ordering::Release);
        dense.alive(n - 1).store(0, Ordering::Release);
        self.len.store(n - 1, Ordering::Release);
    }

    #[inline]
    fn set_sparse(&self, id: u32, k: usize) {
        debug_assert!(k <= u32::MAX as usize);
        let sparse = self.sparse_table();
        debug_assert!((id as usize) < sparse.cap);
        unsafe { &*sparse.slots.add(id as usize) }
            .store(SLOT_PRESENT | k as u64, Ordering::Release);
    }

    #[inline]
    fn clear_sparse(&self, id: u32) {
        let sparse = self.sparse_table();
        if (id as usize) < sparse.cap {
            unsafe { &*sparse.slots.add(id as usize) }.store(0, Ordering::Release);
        }
    }

    // -- traversal ----------------------------------------------------------

    /// Iterate every slot, dead or alive. Lock-free: snapshots the tables and
    /// length at construction and never observes a mid-iteration
    /// reallocation.
    pub fn iter(&self) -> Iter<'_> {
        let dense = self.dense_tables();
        let len = self.len().min(dense.cap);
        Iter {
            layout: &self.layout,
            ids: dense.ids,
            alive: dense.alive,
            cursor: PayloadCursor::new(&self.arena, 0),
            len,
            idx: 0,
        }
    }

    /// Iterate slots with any live component.
    pub fn iter_alive(&self) -> IterAlive<'_> {
        IterAlive {
            inner: self.iter(),
            filter: u64::MAX,
        }
    }

    /// Iterate slots whose sector holds a live `T`.
    pub fn iter_alive_of<T: 'static>(&self) -> Result<IterAlive<'_>, StoreError> {
        let filter = self.layout.require::<T>()?.mask();
        Ok(IterAlive {
            inner: self.iter(),
            filter,
        })
    }

    /// Iterate the slots whose ids fall in the given half-open id ranges.
    /// Ranges must be sorted and non-overlapping.
    pub fn iter_ranges(&self, ranges: &[Range<u32>]) -> IterRanges<'_> {
        let dense = self.dense_tables();
        IterRanges {
            layout: &self.layout,
            ids: dense.ids,
            alive: dense.alive,
            cursor: RangesCursor::new(&self.arena, self.resolve_spans(ranges)),
        }
    }

    /// Raw pointers into the published dense tables plus their capacity.
    pub(crate) fn dense_raw(&self) -> (*mut sync::AtomicU32, *mut sync::AtomicU64, usize) {
        let dense = self.dense_tables();
        (dense.ids, dense.alive, dense.cap)
    }

    /// Resolve sorted id ranges into dense linear-index spans by binary
    /// search over the sorted `ids` array.
    pub(crate) fn resolve_spans(&self, ranges: &[Range<u32>]) -> Vec<LinearSpan> {
        let dense = self.dense_tables();
        let len = self.len().min(dense.cap);
        let id_at = |k: usize| unsafe { dense.id(k) }.load(Ordering::Acquire);
        let mut spans = Vec::with_capacity(ranges.len());
        for range in ranges {
            let start = lower_bound(len, |k| id_at(k) < range.start);
            let end = lower_bound(len, |k| id_at(k) < range.end);
            if start < end {
                spans.push(LinearSpan { start, end });
            }
        }
        spans
    }

    /// Visit every alive sector under the shared gate, with safe component
    /// borrows scoped to the callback.
    pub fn for_each_alive<F>(&self, mut f: F)
    where
        F: FnMut(SectorView<'_>),
    {
        let _shared = self.gate.read();
        let len = self.len();
        let dense = self.dense_tables();
        let mut cursor = PayloadCursor::new(&self.arena, 0);
        for k in 0..len.min(dense.cap) {
            let alive = unsafe { dense.alive(k) }.load(Ordering::Acquire);
            if alive != 0 {
                let id = unsafe { dense.id(k) }.load(Ordering::Acquire);
                f(SectorView {
                    layout: &self.layout,
                    id,
                    alive,
                    payload: unsafe { NonNull::new_unchecked(cursor.ptr()) },
                    index: k,
                });
            }
            cursor.advance();
        }
    }

    /// Visit every alive sector with mutable component access. Exclusive
    /// through `&mut self`.
    pub fn for_each_alive_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(SectorViewMut<'_>),
    {
        let len = self.len();
        let dense = self.dense_tables();
        let mut cursor = PayloadCursor::new(&self.arena, 0);
        for k in 0..len.min(dense.cap) {
            let alive = unsafe { dense.alive(k) }.load(Ordering::Relaxed);
            if alive != 0 {
                let id = unsafe { dense.id(k) }.load(Ordering::Relaxed);
                f(SectorViewMut {
                    layout: &self.layout,
                    id,
                    alive,
                    payload: unsafe { NonNull::new_unchecked(cursor.ptr()) },
                    index: k,
                });
            }
            cursor.advance();
        }
    }

    /// Visit alive sectors whose ids fall in the given sorted, half-open
    /// ranges, under the shared gate.
    pub fn for_each_in_ranges<F>(&self, ranges: &[Range<u32>], mut f: F)
    where
        F: FnMut(SectorView<'_>),
    {
        let _shared = self.gate.read();
        let dense = self.dense_tables();
        let mut cursor = RangesCursor::new(&self.arena, self.resolve_spans(ranges));
        while let Some((k, payload)) = cursor.next() {
            let alive = unsafe { dense.alive(k) }.load(Ordering::Acquire);
            if alive != 0 {
                let id = unsafe { dense.id(k) }.load(Ordering::Acquire);
                f(SectorView {
                    layout: &self.layout,
                    id,
                    alive,
                    payload: unsafe { NonNull::new_unchecked(payload) },
                    index: k,
                });
            }
        }
    }

    pub(crate) fn read_gate(&self) -> StoreReadGuard<'_> {
        StoreReadGuard(self.gate.read())
    }

    pub(crate) fn read_gate_recursive(&self) -> StoreReadGuard<'_> {
        StoreReadGuard(self.gate.read_recursive())
    }
}

impl Drop for SectorStore {
    fn drop(&mut self) {
        let n = self.len.load(Ordering::Relaxed);
        for k in 0..n {
            unsafe {
                self.destroy_slot_components(k);
            }
        }
        unsafe {
            drop(Box::from_raw(self.dense.load(Ordering::Relaxed)));
            drop(Box::from_raw(self.sparse.load(Ordering::Relaxed)));
        }
        // Buffers, arena, counters, and the retire bin release through their
        // own Drop impls.
    }
}

impl fmt::Debug for SectorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("layout", &*self.layout)
            .finish()
    }
}

fn lower_bound(n: usize, mut pred: impl FnMut(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

// ---------------------------------------------------------------------------
// Iterators (lock-free, snapshot semantics)
// ---------------------------------------------------------------------------

/// One slot as seen by a snapshot iterator: id, liveness mask, and the raw
/// payload address.
///
/// Typed access is `unsafe`: a snapshot iterator takes no lock and no pin, so
/// a concurrent writer may replace or destroy the value (the *memory* stays
/// valid for the store's lifetime).
pub struct SectorRef<'a> {
    layout: &'a SectorLayout,
    id: u32,
    alive: u64,
    payload: *mut u8,
    index: usize,
}

impl<'a> SectorRef<'a> {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn alive_mask(&self) -> u64 {
        self.alive
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn payload_ptr(&self) -> *mut u8 {
        self.payload
    }

    /// Typed pointer to this slot's `T`, if alive in the snapshot.
    pub fn component_ptr<T: 'static>(&self) -> Option<NonNull<T>> {
        let entry = self.layout.entry_of::<T>()?;
        if self.alive & entry.mask() == 0 {
            return None;
        }
        NonNull::new(unsafe { self.payload.add(entry.offset()).cast::<T>() })
    }

    /// Borrow this slot's `T`, if alive in the snapshot.
    ///
    /// # Safety
    ///
    /// The caller must ensure no concurrent writer replaces or destroys this
    /// sector's components for the borrow's duration (hold a pin on the id,
    /// or single-threaded use).
    pub unsafe fn component<T: 'static>(&self) -> Option<&'a T> {
        self.component_ptr::<T>().map(|p| &*p.as_ptr())
    }
}

/// Snapshot iterator over every slot. See [`SectorStore::iter`].
pub struct Iter<'a> {
    layout: &'a SectorLayout,
    ids: *mut sync::AtomicU32,
    alive: *mut sync::AtomicU64,
    cursor: PayloadCursor<'a>,
    len: usize,
    idx: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = SectorRef<'a>;

    fn next(&mut self) -> Option<SectorRef<'a>> {
        if self.idx >= self.len {
            return None;
        }
        let k = self.idx;
        let id = unsafe { &*self.ids.add(k) }.load(Ordering::Acquire);
        let alive = unsafe { &*self.alive.add(k) }.load(Ordering::Acquire);
        let payload = self.cursor.ptr();
        self.cursor.advance();
        self.idx += 1;
        Some(SectorRef {
            layout: self.layout,
            id,
            alive,
            payload,
            index: k,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.len - self.idx;
        (rest, Some(rest))
    }
}

/// Snapshot iterator over slots with live components, optionally filtered to
/// one component's mask. See [`SectorStore::iter_alive`].
pub struct IterAlive<'a> {
    inner: Iter<'a>,
    filter: u64,
}

impl<'a> Iterator for IterAlive<'a> {
    type Item = SectorRef<'a>;

    fn next(&mut self) -> Option<SectorRef<'a>> {
        loop {
            let sector = self.inner.next()?;
            if sector.alive & self.filter != 0 {
                return Some(sector);
            }
        }
    }
}

/// Snapshot iterator over id ranges. See [`SectorStore::iter_ranges`].
pub struct IterRanges<'a> {
    layout: &'a SectorLayout,
    ids: *mut sync::AtomicU32,
    alive: *mut sync::AtomicU64,
    cursor: RangesCursor<'a>,
}

impl<'a> Iterator for IterRanges<'a> {
    type Item = SectorRef<'a>;

    fn next(&mut self) -> Option<SectorRef<'a>> {
        let (k, payload) = self.cursor.next()?;
        let id = unsafe { &*self.ids.add(k) }.load(Ordering::Acquire);
        let alive = unsafe { &*self.alive.add(k) }.load(Ordering::Acquire);
        Some(SectorRef {
            layout: self.layout,
            id,
            alive,
            payload,
            index: k,
        })
    }
}

// ---------------------------------------------------------------------------
// Scoped views (safe borrows under the shared gate)
// ---------------------------------------------------------------------------

/// One alive sector as seen by a gated visit; component borrows are scoped
/// to the callback invocation.
pub struct SectorView<'s> {
    layout: &'s SectorLayout,
    id: u32,
    alive: u64,
    payload: NonNull<u8>,
    index: usize,
}

impl<'s> SectorView<'s> {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn alive_mask(&self) -> u64 {
        self.alive
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Borrow this sector's `T`, if alive.
    pub fn get<T: 'static>(&self) -> Option<&'s T> {
        let entry = self.layout.entry_of::<T>()?;
        if self.alive & entry.mask() == 0 {
            return None;
        }
        Some(unsafe { &*self.payload.as_ptr().add(entry.offset()).cast::<T>() })
    }
}

/// Mutable counterpart of [`SectorView`], handed out by
/// [`SectorStore::for_each_alive_mut`].
pub struct SectorViewMut<'s> {
    layout: &'s SectorLayout,
    id: u32,
    alive: u64,
    payload: NonNull<u8>,
    index: usize,
}

impl SectorViewMut<'_> {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn alive_mask(&self) -> u64 {
        self.alive
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Borrow this sector's `T`, if alive.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        let entry = self.layout.entry_of::<T>()?;
        if self.alive & entry.mask() == 0 {
            return None;
        }
        Some(unsafe { &*self.payload.as_ptr().add(entry.offset()).cast::<T>() })
    }

    /// Mutably borrow this sector's `T`, if alive.
    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        let entry = self.layout.entry_of::<T>()?;
        if self.alive & entry.mask() == 0 {
            return None;
        }
        Some(unsafe { &mut *self.payload.as_ptr().add(entry.offset()).cast::<T>() })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
