//! Cross-store iteration views.
//!
//! A [`StoreView`] walks the *main* store's alive stream for one component
//! type `M` and, for every visited sector, projects the sector id into zero
//! or more *secondary* stores, yielding each secondary component as an
//! `Option` (absent when that id has no such component). A secondary that
//! lives in the main store itself (grouped components) is resolved from the
//! current sector directly, skipping the sparse lookup.
//!
//! Two traversal modes:
//! - [`each`](StoreView::each) invokes a callback positionally with safe
//!   borrows scoped to the call. With no secondaries this monomorphizes down
//!   to a bare scan of the main alive stream, and grouped secondaries add
//!   only a mask test; there is no tuple construction on this path.
//! - [`iter`](StoreView::iter) yields `(id, NonNull<M>, ...)` pointer tuples
//!   for callers that need to thread the cursor through their own control
//!   flow; dereferencing is the caller's contract.
//!
//! A view holds the shared gate of every involved store for its lifetime, so
//! structural writers wait until it is dropped, and it pins the main store's
//! highest live sector id as the iteration upper bound.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::marker::PhantomData;
use std::ops::Range;
use std::ptr::NonNull;

use crate::chunks::{LinearSpan, PayloadCursor, RangesCursor};
use crate::pin::PinnedSector;
use crate::sectors::{SectorStore, StoreReadGuard};
use crate::sync::Ordering;
use crate::StoreError;

// ---------------------------------------------------------------------------
// Secondary -- one resolved secondary component source
// ---------------------------------------------------------------------------

/// Lookup state for one secondary component type `C`.
pub struct Secondary<'a, C> {
    /// `None` when `C` is grouped in the main store and resolves from the
    /// current sector payload.
    external: Option<(&'a SectorStore, StoreReadGuard<'a>)>,
    offset: usize,
    mask: u64,
    _type: PhantomData<fn() -> C>,
}

impl<'a, C: 'static> Secondary<'a, C> {
    fn resolve(main: &'a SectorStore, store: &'a SectorStore) -> Result<Self, StoreError> {
        if std::ptr::eq(main, store) {
            let entry = main.layout().require::<C>()?;
            Ok(Self {
                external: None,
                offset: entry.offset(),
                mask: entry.mask(),
                _type: PhantomData,
            })
        } else {
            let entry = store.layout().require::<C>()?;
            let guard = store.read_gate_recursive();
            Ok(Self {
                external: Some((store, guard)),
                offset: entry.offset(),
                mask: entry.mask(),
                _type: PhantomData,
            })
        }
    }

    fn fetch_ptr(&self, id: u32, main_payload: NonNull<u8>, main_alive: u64) -> Option<NonNull<C>> {
        match &self.external {
            None => {
                if main_alive & self.mask == 0 {
                    return None;
                }
                NonNull::new(unsafe { main_payload.as_ptr().add(self.offset).cast::<C>() })
            }
            Some((store, _guard)) => {
                let k = store.slot_index(id)?;
                let (_, alive_ptr, cap) = store.dense_raw();
                if k >= cap {
                    return None;
                }
                let alive = unsafe { &*alive_ptr.add(k) }.load(Ordering::Acquire);
                if alive & self.mask == 0 {
                    return None;
                }
                NonNull::new(unsafe { store.arena().payload(k).add(self.offset).cast::<C>() })
            }
        }
    }

    fn fetch<'s>(&'s self, id: u32, main_payload: NonNull<u8>, main_alive: u64) -> Option<&'s C> {
        self.fetch_ptr(id, main_payload, main_alive)
            .map(|p| unsafe { &*p.as_ptr() })
    }
}

// ---------------------------------------------------------------------------
// SecondarySet -- tuple of secondary component types
// ---------------------------------------------------------------------------

/// A tuple of secondary component types joined onto the main stream.
/// Implemented for `()` and tuples of one to three types.
pub trait SecondarySet: Sized {
    /// One store reference per secondary type, in order.
    type Stores<'a>;
    /// Resolved per-secondary lookup state.
    type Sources<'a>;
    /// Per-sector output of [`StoreView::each`].
    type Refs<'s>;
    /// Per-sector output of [`StoreView::iter`].
    type Ptrs;

    fn resolve<'a>(
        main: &'a SectorStore,
        stores: Self::Stores<'a>,
    ) -> Result<Self::Sources<'a>, StoreError>;

    fn fetch<'a, 's>(
        sources: &'s Self::Sources<'a>,
        id: u32,
        payload: NonNull<u8>,
        alive: u64,
    ) -> Self::Refs<'s>;

    fn fetch_ptrs(
        sources: &Self::Sources<'_>,
        id: u32,
        payload: NonNull<u8>,
        alive: u64,
    ) -> Self::Ptrs;
}

impl SecondarySet for () {
    type Stores<'a> = ();
    type Sources<'a> = ();
    type Refs<'s> = ();
    type Ptrs = ();

    fn resolve<'a>(_main: &'a SectorStore, _stores: ()) -> Result<(), StoreError> {
        Ok(())
    }

    #[inline]
    fn fetch<'a, 's>(_: &'s (), _: u32, _: NonNull<u8>, _: u64) {}

    #[inline]
    fn fetch_ptrs(_: &(), _: u32, _: NonNull<u8>, _: u64) {}
}

impl<A: 'static> SecondarySet for (A,) {
    type Stores<'a> = (&'a SectorStore,);
    type Sources<'a> = (Secondary<'a, A>,);
    type Refs<'s> = (Option<&'s A>,);
    type Ptrs = (Option<NonNull<A>>,);

    fn resolve<'a>(
        main: &'a SectorStore,
        stores: Self::Stores<'a>,
    ) -> Result<Self::Sources<'a>, StoreError> {
        Ok((Secondary::resolve(main, stores.0)?,))
    }

    #[inline]
    fn fetch<'a, 's>(
        sources: &'s Self::Sources<'a>,
        id: u32,
        payload: NonNull<u8>,
        alive: u64,
    ) -> Self::Refs<'s> {
        (sources.0.fetch(id, payload, alive),)
    }

    #[inline]
    fn fetch_ptrs(
        sources: &Self::Sources<'_>,
        id: u32,
        payload: NonNull<u8>,
        alive: u64,
    ) -> Self::Ptrs {
        (sources.0.fetch_ptr(id, payload, alive),)
    }
}

impl<A: 'static, B: 'static> SecondarySet for (A, B) {
    type Stores<'a> = (&'a SectorStore, &'a SectorStore);
    type Sources<'a> = (Secondary<'a, A>, Secondary<'a, B>);
    type Refs<'s> = (Option<&'s A>, Option<&'s B>);
    type Ptrs = (Option<NonNull<A>>, Option<NonNull<B>>);

    fn resolve<'a>(
        main: &'a SectorStore,
        stores: Self::Stores<'a>,
    ) -> Result<Self::Sources<'a>, StoreError> {
        Ok((
            Secondary::resolve(main, stores.0)?,
            Secondary::resolve(main, stores.1)?,
        ))
    }

    #[inline]
    fn fetch<'a, 's>(
        sources: &'s Self::Sources<'a>,
        id: u32,
        payload: NonNull<u8>,
        alive: u64,
    ) -> Self::Refs<'s> {
        (
            sources.0.fetch(id, payload, alive),
            sources.1.fetch(id, payload, alive),
        )
    }

    #[inline]
    fn fetch_ptrs(
        sources: &Self::Sources<'_>,
        id: u32,
        payload: NonNull<u8>,
        alive: u64,
    ) -> Self::Ptrs {
        (
            sources.0.fetch_ptr(id, payload, alive),
            sources.1.fetch_ptr(id, payload, alive),
        )
    }
}

impl<A: 'static, B: 'static, C: 'static> SecondarySet for (A, B, C) {
    type Stores<'a> = (&'a SectorStore, &'a SectorStore, &'a SectorStore);
    type Sources<'a> = (Secondary<'a, A>, Secondary<'a, B>, Secondary<'a, C>);
    type Refs<'s> = (Option<&'s A>, Option<&'s B>, Option<&'s C>);
    type Ptrs = (Option<NonNull<A>>, Option<NonNull<B>>, Option<NonNull<C>>);

    fn resolve<'a>(
        main: &'a SectorStore,
        stores: Self::Stores<'a>,
    ) -> Result<Self::Sources<'a>, StoreError> {
        Ok((
            Secondary::resolve(main, stores.0)?,
            Secondary::resolve(main, stores.1)?,
            Secondary::resolve(main, stores.2)?,
        ))
    }

    #[inline]
    fn fetch<'a, 's>(
        sources: &'s Self::Sources<'a>,
        id: u32,
        payload: NonNull<u8>,
        alive: u64,
    ) -> Self::Refs<'s> {
        (
            sources.0.fetch(id, payload, alive),
            sources.1.fetch(id, payload, alive),
            sources.2.fetch(id, payload, alive),
        )
    }

    #[inline]
    fn fetch_ptrs(
        sources: &Self::Sources<'_>,
        id: u32,
        payload: NonNull<u8>,
        alive: u64,
    ) -> Self::Ptrs {
        (
            sources.0.fetch_ptr(id, payload, alive),
            sources.1.fetch_ptr(id, payload, alive),
            sources.2.fetch_ptr(id, payload, alive),
        )
    }
}

// ---------------------------------------------------------------------------
// StoreView
// ---------------------------------------------------------------------------

pub struct StoreView<'a, M, S: SecondarySet = ()> {
    main: &'a SectorStore,
    main_offset: usize,
    main_mask: u64,
    others: S::Sources<'a>,
    /// Restriction to id ranges, resolved into linear spans at construction.
    spans: Option<Vec<LinearSpan>>,
    _main_guard: StoreReadGuard<'a>,
    _back_pin: Option<PinnedSector<'a>>,
    _types: PhantomData<fn() -> M>,
}

impl SectorStore {
    /// Build a view over this store's alive `M` stream, joining the given
    /// secondary stores (one per type in `S`, in order; pass the main store
    /// itself for grouped components).
    pub fn view<'a, M: 'static, S: SecondarySet>(
        &'a self,
        others: S::Stores<'a>,
    ) -> Result<StoreView<'a, M, S>, StoreError> {
        StoreView::build(self, others, None)
    }

    /// Like [`view`](Self::view), restricted to sorted, non-overlapping,
    /// half-open id ranges.
    pub fn view_ranges<'a, M: 'static, S: SecondarySet>(
        &'a self,
        others: S::Stores<'a>,
        ranges: &[Range<u32>],
    ) -> Result<StoreView<'a, M, S>, StoreError> {
        StoreView::build(self, others, Some(ranges))
    }
}

impl<'a, M: 'static, S: SecondarySet> StoreView<'a, M, S> {
    fn build(
        main: &'a SectorStore,
        others: S::Stores<'a>,
        ranges: Option<&[Range<u32>]>,
    ) -> Result<Self, StoreError> {
        let entry = main.layout().require::<M>()?;
        let main_offset = entry.offset();
        let main_mask = entry.mask();
        let guard = main.read_gate_recursive();
        let others = S::resolve(main, others)?;
        let spans = ranges.map(|r| main.resolve_spans(r));

        // Pin the highest live sector id: the iteration upper bound stays
        // addressable even while concurrent appends extend the store.
        let back_pin = {
            let (ids, _, cap) = main.dense_raw();
            let len = main.len().min(cap);
            if len > 0 {
                let last = unsafe { &*ids.add(len - 1) }.load(Ordering::Acquire);
                main.pin_sector_prelocked(last)
            } else {
                None
            }
        };

        Ok(Self {
            main,
            main_offset,
            main_mask,
            others,
            spans,
            _main_guard: guard,
            _back_pin: back_pin,
            _types: PhantomData,
        })
    }

    /// Invoke `f` positionally for every alive `M` sector in id order:
    /// `(id, &M, secondaries)`, each secondary `None` where that id lacks
    /// the component.
    pub fn each<F>(&self, mut f: F)
    where
        F: FnMut(u32, &M, S::Refs<'_>),
    {
        let (ids, alive_ptr, cap) = self.main.dense_raw();
        match &self.spans {
            None => {
                let len = self.main.len().min(cap);
                let mut cursor = PayloadCursor::new(self.main.arena(), 0);
                for k in 0..len {
                    let alive = unsafe { &*alive_ptr.add(k) }.load(Ordering::Acquire);
                    if alive & self.main_mask != 0 {
                        let id = unsafe { &*ids.add(k) }.load(Ordering::Acquire);
                        let payload = unsafe { NonNull::new_unchecked(cursor.ptr()) };
                        let main_ref =
                            unsafe { &*payload.as_ptr().add(self.main_offset).cast::<M>() };
                        f(id, main_ref, S::fetch(&self.others, id, payload, alive));
                    }
                    cursor.advance();
                }
            }
            Some(spans) => {
                let mut cursor = RangesCursor::new(self.main.arena(), spans.clone());
                while let Some((k, ptr)) = cursor.next() {
                    debug_assert!(k < cap);
                    let alive = unsafe { &*alive_ptr.add(k) }.load(Ordering::Acquire);
                    if alive & self.main_mask != 0 {
                        let id = unsafe { &*ids.add(k) }.load(Ordering::Acquire);
                        let payload = unsafe { NonNull::new_unchecked(ptr) };
                        let main_ref =
                            unsafe { &*payload.as_ptr().add(self.main_offset).cast::<M>() };
                        f(id, main_ref, S::fetch(&self.others, id, payload, alive));
                    }
                }
            }
        }
    }

    /// Iterate `(id, NonNull<M>, secondary pointers)` tuples.
    pub fn iter(&self) -> ViewIter<'_, 'a, M, S> {
        let cursor = match &self.spans {
            None => ViewCursor::Linear {
                cursor: PayloadCursor::new(self.main.arena(), 0),
                len: self.main.len().min(self.main.dense_raw().2),
                idx: 0,
            },
            Some(spans) => ViewCursor::Ranged(RangesCursor::new(self.main.arena(), spans.clone())),
        };
        ViewIter { view: self, cursor }
    }
}

// ---------------------------------------------------------------------------
// ViewIter
// ---------------------------------------------------------------------------

enum ViewCursor<'v> {
    Linear {
        cursor: PayloadCursor<'v>,
        len: usize,
        idx: usize,
    },
    Ranged(RangesCursor<'v>),
}

/// Pointer-tuple iterator over a [`StoreView`].
pub struct ViewIter<'v, 'a, M, S: SecondarySet> {
    view: &'v StoreView<'a, M, S>,
    cursor: ViewCursor<'v>,
}

impl<'v, 'a, M: 'static, S: SecondarySet> Iterator for ViewIter<'v, 'a, M, S> {
    type Item = (u32, NonNull<M>, S::Ptrs);

    fn next(&mut self) -> Option<Self::Item> {
        let (ids, alive_ptr, cap) = self.view.main.dense_raw();
        loop {
            let (k, ptr) = match &mut self.cursor {
                ViewCursor::Linear { cursor, len, idx } => {
                    if *idx >= *len {
                        return None;
                    }
                    let k = *idx;
                    let ptr = cursor.ptr();
                    cursor.advance();
                    *idx += 1;
                    (k, ptr)
                }
                ViewCursor::Ranged(cursor) => cursor.next()?,
            };
            debug_assert!(k < cap);
            let alive = unsafe { &*alive_ptr.add(k) }.load(Ordering::Acquire);
            if alive & self.view.main_mask == 0 {
                continue;
            }
            let id = unsafe { &*ids.add(k) }.load(Ordering::Acquire);
            let payload = unsafe { NonNull::new_unchecked(ptr) };
            let main_ptr = unsafe {
                NonNull::new_unchecked(payload.as_ptr().add(self.view.main_offset).cast::<M>())
            };
            return Some((
                id,
                main_ptr,
                S::fetch_ptrs(&self.view.others, id, payload, alive),
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SectorLayoutBuilder;

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Health(u32);

    fn positions() -> SectorStore {
        let layout = SectorLayoutBuilder::new()
            .with::<Position>()
            .with::<Velocity>()
            .build();
        SectorStore::with_chunk_capacity(layout, 4, 4).unwrap()
    }

    fn healths() -> SectorStore {
        let layout = SectorLayoutBuilder::new().with::<Health>().build();
        SectorStore::with_chunk_capacity(layout, 4, 4).unwrap()
    }

    #[test]
    fn main_only_view_walks_alive_stream() {
        let store = positions();
        for id in [5u32, 1, 9] {
            store
                .insert(id, (Position { x: id as f32, y: 0.0 },))
                .unwrap();
        }

        let view = store.view::<Position, ()>(()).unwrap();
        let mut seen = Vec::new();
        view.each(|id, pos, ()| {
            assert_eq!(pos.x, id as f32);
            seen.push(id);
        });
        assert_eq!(seen, vec![1, 5, 9], "id order");
    }

    #[test]
    fn external_secondary_is_null_when_absent() {
        let main = positions();
        let health = healths();
        for id in [1u32, 2, 3] {
            main.insert(id, (Position::default(),)).unwrap();
        }
        health.insert(2, (Health(70),)).unwrap();

        let view = main.view::<Position, (Health,)>((&health,)).unwrap();
        let mut calls = 0;
        view.each(|id, _pos, (hp,)| {
            calls += 1;
            if id == 2 {
                assert_eq!(hp, Some(&Health(70)));
            } else {
                assert!(hp.is_none());
            }
        });
        assert_eq!(calls, 3, "every main sector visited");
    }

    #[test]
    fn grouped_secondary_resolves_from_main_sector() {
        let main = positions();
        main.insert(1, (Position { x: 1.0, y: 0.0 }, Velocity { dx: 0.5, dy: 0.0 }))
            .unwrap();
        main.insert(2, (Position { x: 2.0, y: 0.0 },)).unwrap();

        let view = main.view::<Position, (Velocity,)>((&main,)).unwrap();
        let mut seen = Vec::new();
        view.each(|id, _pos, (vel,)| seen.push((id, vel.copied())));
        assert_eq!(
            seen,
            vec![(1, Some(Velocity { dx: 0.5, dy: 0.0 })), (2, None)]
        );
    }

    #[test]
    fn view_skips_sectors_without_main_component() {
        let main = positions();
        main.insert(1, (Position::default(),)).unwrap();
        main.insert(2, (Velocity::default(),)).unwrap();
        main.insert(3, (Position::default(), Velocity::default()))
            .unwrap();

        let view = main.view::<Position, ()>(()).unwrap();
        let mut seen = Vec::new();
        view.each(|id, _pos, ()| seen.push(id));
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn ranged_view_restricts_ids() {
        let main = positions();
        for id in [3u32, 7, 9, 15, 22, 30] {
            main.insert(id, (Position::default(),)).unwrap();
        }

        let view = main
            .view_ranges::<Position, ()>((), &[5..11, 20..26])
            .unwrap();
        let mut seen = Vec::new();
        view.each(|id, _pos, ()| seen.push(id));
        assert_eq!(seen, vec![7, 9, 22]);
    }

    #[test]
    fn iter_yields_pointer_tuples() {
        let main = positions();
        let health = healths();
        main.insert(4, (Position { x: 4.0, y: 4.0 },)).unwrap();
        health.insert(4, (Health(12),)).unwrap();

        let view = main.view::<Position, (Health,)>((&health,)).unwrap();
        let items: Vec<_> = view.iter().collect();
        assert_eq!(items.len(), 1);
        let (id, pos_ptr, (hp_ptr,)) = items[0];
        assert_eq!(id, 4);
        unsafe {
            assert_eq!(*pos_ptr.as_ptr(), Position { x: 4.0, y: 4.0 });
            assert_eq!(*hp_ptr.unwrap().as_ptr(), Health(12));
        }
    }

    #[test]
    fn two_secondaries_mixed_grouping() {
        let main = positions();
        let health = healths();
        main.insert(1, (Position::default(), Velocity { dx: 1.0, dy: 1.0 }))
            .unwrap();
        main.insert(2, (Position::default(),)).unwrap();
        health.insert(1, (Health(5),)).unwrap();

        let view = main
            .view::<Position, (Velocity, Health)>((&main, &health))
            .unwrap();
        let mut seen = Vec::new();
        view.each(|id, _pos, (vel, hp)| seen.push((id, vel.is_some(), hp.is_some())));
        assert_eq!(seen, vec![(1, true, true), (2, false, false)]);
    }

    #[test]
    fn view_over_empty_store_visits_nothing() {
        let main = positions();
        let view = main.view::<Position, ()>(()).unwrap();
        let mut calls = 0;
        view.each(|_, _, ()| calls += 1);
        assert_eq!(calls, 0);
        assert_eq!(view.iter().count(), 0);
    }

    #[test]
    fn foreign_main_type_is_rejected() {
        let health = healths();
        assert!(matches!(
            health.view::<Position, ()>(()),
            Err(StoreError::InvalidComponentType { .. })
        ));
    }

    #[test]
    fn view_construction_pins_back_sector() {
        let main = positions();
        for id in [1u32, 5, 9] {
            main.insert(id, (Position::default(),)).unwrap();
        }
        let view = main.view::<Position, ()>(()).unwrap();
        assert_eq!(main.pin_counters().count(9), 1, "back sector pinned");
        drop(view);
        assert_eq!(main.pin_counters().count(9), 0);
    }
}
