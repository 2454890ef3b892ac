//! Sector Store -- chunked, sparse-indexed component storage with optional
//! lock-free concurrent reads.
//!
//! A [`SectorStore`](sectors::SectorStore) keeps one *sector* per entity id
//! for a grouped set of component types described by an immutable
//! [`SectorLayout`](layout::SectorLayout). Payloads live in an append-only
//! chunk arena, so a sector's address is stable for the store's lifetime;
//! parallel dense arrays (ids, per-component liveness masks) and a sparse
//! id-indexed map give O(1) keyed access and cache-friendly iteration in id
//! order. Cross-store [views](view::StoreView) join a main component stream
//! with per-entity projections from other stores.
//!
//! With the `concurrent` feature (default), a store is `Sync`: readers are
//! lock-free against published table snapshots, *pins* protect sectors from
//! being moved or destroyed under a reader, and structural writers retire
//! replaced buffers instead of freeing them until no reader can observe
//! them. Without the feature the same API compiles to plain single-threaded
//! storage.
//!
//! # Quick Start
//!
//! ```
//! use sector_store::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! # fn main() -> Result<(), sector_store::StoreError> {
//! let layout = SectorLayoutBuilder::new()
//!     .with::<Position>()
//!     .with::<Velocity>()
//!     .build();
//! let store = SectorStore::new(layout)?;
//!
//! store.insert(3, (Position { x: 1.0, y: 2.0 }, Velocity { dx: 0.1, dy: 0.0 }))?;
//! store.emplace(1, Position { x: 5.0, y: 6.0 })?;
//!
//! assert_eq!(store.get_cloned::<Position>(3), Some(Position { x: 1.0, y: 2.0 }));
//!
//! // Dense storage is kept sorted by id; views join grouped or external
//! // component streams per entity.
//! let view = store.view::<Position, (Velocity,)>((&store,))?;
//! let mut ids = Vec::new();
//! view.each(|id, _pos, (_vel,)| ids.push(id));
//! assert_eq!(ids, vec![1, 3]);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod bitmask;
#[allow(unsafe_code)]
pub mod chunks;
#[allow(unsafe_code)]
pub mod layout;
#[allow(unsafe_code)]
pub mod pin;
#[allow(unsafe_code)]
pub mod retire;
#[allow(unsafe_code)]
pub mod sectors;
mod sync;
#[allow(unsafe_code)]
pub mod view;

/// Default number of sectors per arena chunk.
pub const CHUNK_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
///
/// Absent-id lookups are *not* errors: they surface as `None` / empty
/// handles.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An allocation failed. The operation had no observable effect.
    #[error("allocation of {bytes} bytes failed")]
    OutOfMemory { bytes: usize },

    /// Strict insert into an occupied slot; `insert_or_update` overwrites
    /// instead.
    #[error("sector id {id} is already present")]
    AlreadyPresent { id: u32 },

    /// The component type is not part of this store's layout. A programming
    /// error at the call site.
    #[error("component type '{ty}' is not part of this container's layout")]
    InvalidComponentType { ty: &'static str },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::layout::{ComponentTypeId, SectorLayout, SectorLayoutBuilder};
    pub use crate::pin::{PinnedComponent, PinnedSector};
    pub use crate::retire::RetireBin;
    pub use crate::sectors::{ComponentSet, SectorStore, SlotInfo, INVALID_ID};
    pub use crate::view::{SecondarySet, StoreView};
    pub use crate::StoreError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

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

    fn grouped_store() -> SectorStore {
        let layout = SectorLayoutBuilder::new()
            .with::<Position>()
            .with::<Velocity>()
            .build();
        SectorStore::with_chunk_capacity(layout, 4, 4).unwrap()
    }

    #[test]
    fn layouts_are_shared_between_stores() {
        let layout = SectorLayoutBuilder::new().with::<Health>().build();
        let a = SectorStore::new(layout.clone()).unwrap();
        let b = SectorStore::new(layout).unwrap();

        a.insert(1, (Health(1),)).unwrap();
        b.insert(1, (Health(2),)).unwrap();
        assert_eq!(a.get_cloned::<Health>(1), Some(Health(1)));
        assert_eq!(b.get_cloned::<Health>(1), Some(Health(2)));
        assert_eq!(a.layout().sector_size(), b.layout().sector_size());
    }

    #[test]
    fn pin_survives_unrelated_inserts() {
        // Capacity and the sparse map are sized up front: growth drains all
        // pins, so it cannot run while the caller still holds one.
        let layout = SectorLayoutBuilder::new()
            .with::<Position>()
            .with::<Velocity>()
            .build();
        let store = SectorStore::with_chunk_capacity(layout, 64, 4).unwrap();
        store.insert(63, (Position::default(),)).unwrap();
        store.insert(2, (Position { x: 2.0, y: 0.0 },)).unwrap();

        let pinned = store.pin_sector(2).unwrap();
        let addr = pinned.payload_ptr();

        // Inserts, including ones that bubble past higher ids, must not
        // disturb the pinned payload.
        for id in 10..30u32 {
            store.insert(id, (Position { x: id as f32, y: 0.0 },)).unwrap();
        }
        assert_eq!(pinned.payload_ptr(), addr);
        assert_eq!(pinned.get::<Position>(), Some(&Position { x: 2.0, y: 0.0 }));
        drop(pinned);
        assert_eq!(store.pin_counters().total(), 0);
    }

    #[test]
    fn emplace_then_view_joins_across_stores() {
        let main = grouped_store();
        let layout = SectorLayoutBuilder::new().with::<Health>().build();
        let health = SectorStore::new(layout).unwrap();

        for id in [1u32, 2, 3] {
            main.emplace(id, Position { x: id as f32, y: 0.0 }).unwrap();
        }
        health.emplace(2, Health(70)).unwrap();

        let view = main.view::<Position, (Health,)>((&health,)).unwrap();
        let mut rows = Vec::new();
        view.each(|id, pos, (hp,)| rows.push((id, pos.x, hp.copied())));
        assert_eq!(
            rows,
            vec![
                (1, 1.0, None),
                (2, 2.0, Some(Health(70))),
                (3, 3.0, None),
            ]
        );
    }

    #[test]
    fn mixed_operations_keep_dense_sparse_coherent() {
        let store = grouped_store();
        for id in [12u32, 4, 30, 18, 7] {
            store.insert(id, (Position::default(), Velocity::default())).unwrap();
        }
        store.erase(12);
        store.emplace(25, Velocity { dx: 1.0, dy: 0.0 }).unwrap();
        store.destroy_component::<Velocity>(4).unwrap();
        store.erase(30);

        let ids: Vec<u32> = store.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![4, 7, 18, 25]);
        for (slot, id) in ids.iter().enumerate() {
            let info = store.slot_info(*id).unwrap();
            assert_eq!(info.index, slot);
        }
        assert!(store.contains_component::<Position>(4));
        assert!(!store.contains_component::<Velocity>(4));
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn invalid_id_is_rejected() {
        let store = grouped_store();
        let _ = store.insert(INVALID_ID, (Position::default(),));
    }

    #[test]
    fn error_display_names_the_condition() {
        let err = StoreError::AlreadyPresent { id: 9 };
        assert!(err.to_string().contains("9"));
        let err = StoreError::InvalidComponentType { ty: "Health" };
        assert!(err.to_string().contains("Health"));
    }
}
