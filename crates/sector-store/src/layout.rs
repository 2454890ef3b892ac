//! Sector layout metadata.
//!
//! A [`SectorLayout`] describes the memory shape of one grouped set of
//! component types: for every component it records the byte offset inside a
//! sector payload, a single liveness bit, and a small dispatch table of
//! type-erased lifecycle operations. Layouts are computed once by
//! [`SectorLayoutBuilder`], immutable afterwards, and shared between stores
//! via `Arc`.
//!
//! # Safety
//!
//! The dispatch table holds monomorphized `unsafe fn` pointers that construct
//! and drop component values through raw pointers. Callers (the sector
//! container) guarantee that a pointer passed to an entry's operations points
//! to properly aligned memory of that entry's concrete type.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::any::{type_name, TypeId};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::StoreError;

/// Maximum number of component types in one grouped layout: one bit each in
/// the per-sector liveness word.
pub const MAX_COMPONENTS: usize = 64;

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Dense identifier of a component type within one layout, assigned in
/// registration order starting from 0. It doubles as the component's bit
/// position in the sector liveness mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub(crate) u16);

impl ComponentTypeId {
    /// The raw index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The component's bit in the sector liveness mask.
    #[inline]
    pub fn mask(self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentOps -- type-erased lifecycle operations
// ---------------------------------------------------------------------------

/// Function pointers for type-erased construction and destruction of one
/// component type.
///
/// Relocation needs no entry here: Rust values move by untyped byte copy, so
/// the container shifts and swaps payloads with `ptr::copy`/`ptr::swap` and
/// only dispatches through this table when a value's lifetime actually starts
/// or ends.
#[derive(Clone, Copy)]
pub struct ComponentOps {
    /// Write `T::default()` into uninitialized, properly aligned memory.
    pub(crate) default_construct: unsafe fn(*mut u8),
    /// Drop the value in place.
    pub(crate) drop: unsafe fn(*mut u8),
    /// Whether dropping is observable (`std::mem::needs_drop`).
    pub(crate) needs_drop: bool,
}

impl ComponentOps {
    /// Create the dispatch table for a concrete component type `T`.
    pub fn of<T: Default + 'static>() -> Self {
        unsafe fn construct<T: Default>(dst: *mut u8) {
            std::ptr::write(dst.cast::<T>(), T::default());
        }

        unsafe fn drop_in_place<T>(ptr: *mut u8) {
            std::ptr::drop_in_place(ptr.cast::<T>());
        }

        Self {
            default_construct: construct::<T>,
            drop: drop_in_place::<T>,
            needs_drop: std::mem::needs_drop::<T>(),
        }
    }
}

impl fmt::Debug for ComponentOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentOps")
            .field("needs_drop", &self.needs_drop)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentLayout
// ---------------------------------------------------------------------------

/// Placement of one component type within a sector payload.
#[derive(Clone)]
pub struct ComponentLayout {
    pub(crate) type_id: ComponentTypeId,
    pub(crate) rust_type: TypeId,
    pub(crate) name: &'static str,
    pub(crate) size: usize,
    pub(crate) align: usize,
    /// Byte offset of this component relative to the sector payload base.
    pub(crate) offset: usize,
    /// Single liveness bit, `1 << type_id`.
    pub(crate) mask: u64,
    pub(crate) ops: ComponentOps,
}

impl ComponentLayout {
    #[inline]
    pub fn type_id(&self) -> ComponentTypeId {
        self.type_id
    }

    /// The Rust `TypeId` this entry was registered for.
    #[inline]
    pub fn rust_type(&self) -> TypeId {
        self.rust_type
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn mask(&self) -> u64 {
        self.mask
    }
}

impl fmt::Debug for ComponentLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentLayout")
            .field("type_id", &self.type_id)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("offset", &self.offset)
            .field("mask", &format_args!("{:#x}", self.mask))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SectorLayout
// ---------------------------------------------------------------------------

/// Immutable memory shape of a grouped component set.
///
/// Entries keep registration order (which fixes each component's
/// [`ComponentTypeId`] and mask bit); byte offsets are computed by packing
/// fields in order of descending alignment, and the sector stride is the
/// packed size rounded up to the strictest alignment.
pub struct SectorLayout {
    entries: Box<[ComponentLayout]>,
    by_rust_type: HashMap<TypeId, u16>,
    sector_size: usize,
    sector_align: usize,
}

impl SectorLayout {
    /// All component entries, in registration order. `entries()[i]` is the
    /// entry whose `ComponentTypeId` is `i`, so this doubles as the
    /// bit-to-placement cache.
    #[inline]
    pub fn entries(&self) -> &[ComponentLayout] {
        &self.entries
    }

    /// O(1) lookup by dense component id.
    #[inline]
    pub fn entry(&self, id: ComponentTypeId) -> Option<&ComponentLayout> {
        self.entries.get(id.index())
    }

    /// Lookup by Rust type.
    #[inline]
    pub fn entry_of<T: 'static>(&self) -> Option<&ComponentLayout> {
        let idx = *self.by_rust_type.get(&TypeId::of::<T>())?;
        Some(&self.entries[idx as usize])
    }

    /// The dense id of `T` in this layout, if registered.
    #[inline]
    pub fn type_id_of<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.entry_of::<T>().map(|e| e.type_id)
    }

    /// The liveness mask bit of `T` in this layout, if registered.
    #[inline]
    pub fn mask_of<T: 'static>(&self) -> Option<u64> {
        self.entry_of::<T>().map(|e| e.mask)
    }

    /// Liveness mask with every registered component's bit set.
    #[inline]
    pub fn full_mask(&self) -> u64 {
        if self.entries.len() == MAX_COMPONENTS {
            u64::MAX
        } else {
            (1u64 << self.entries.len()) - 1
        }
    }

    /// Number of component types in the layout.
    #[inline]
    pub fn component_count(&self) -> usize {
        self.entries.len()
    }

    /// Byte stride of one sector payload.
    #[inline]
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Alignment requirement of a sector payload.
    #[inline]
    pub fn sector_align(&self) -> usize {
        self.sector_align
    }

    /// Resolve a registered type or report it as foreign to this layout.
    pub(crate) fn require<T: 'static>(&self) -> Result<&ComponentLayout, StoreError> {
        self.entry_of::<T>().ok_or(StoreError::InvalidComponentType {
            ty: type_name::<T>(),
        })
    }
}

impl fmt::Debug for SectorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorLayout")
            .field("components", &self.entries.len())
            .field("sector_size", &self.sector_size)
            .field("sector_align", &self.sector_align)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SectorLayoutBuilder
// ---------------------------------------------------------------------------

struct PendingEntry {
    rust_type: TypeId,
    name: &'static str,
    size: usize,
    align: usize,
    ops: ComponentOps,
}

/// Builds a [`SectorLayout`] from a list of component types.
///
/// ```
/// use sector_store::layout::SectorLayoutBuilder;
///
/// #[derive(Default)]
/// struct Position { x: f32, y: f32 }
/// #[derive(Default)]
/// struct Velocity { dx: f32, dy: f32 }
///
/// let layout = SectorLayoutBuilder::new()
///     .with::<Position>()
///     .with::<Velocity>()
///     .build();
/// assert_eq!(layout.component_count(), 2);
/// ```
pub struct SectorLayoutBuilder {
    pending: Vec<PendingEntry>,
}

impl SectorLayoutBuilder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Register a component type. Registration order fixes the component's
    /// [`ComponentTypeId`] and mask bit.
    ///
    /// # Panics
    ///
    /// Panics if `T` is already registered in this builder or if the layout
    /// would exceed [`MAX_COMPONENTS`] types.
    pub fn with<T: Default + Send + Sync + 'static>(mut self) -> Self {
        let rust_type = TypeId::of::<T>();
        if self.pending.iter().any(|p| p.rust_type == rust_type) {
            panic!(
                "component type `{}` registered twice in the same layout",
                type_name::<T>()
            );
        }
        if self.pending.len() == MAX_COMPONENTS {
            panic!("a sector layout holds at most {MAX_COMPONENTS} component types");
        }
        self.pending.push(PendingEntry {
            rust_type,
            name: type_name::<T>(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            ops: ComponentOps::of::<T>(),
        });
        self
    }

    /// Compute offsets and finalize the layout.
    ///
    /// # Panics
    ///
    /// Panics if no component type was registered.
    pub fn build(self) -> Arc<SectorLayout> {
        assert!(
            !self.pending.is_empty(),
            "a sector layout requires at least one component type"
        );

        // Pack strictest alignment first; ties keep registration order so
        // layouts are deterministic.
        let mut order: Vec<usize> = (0..self.pending.len()).collect();
        order.sort_by_key(|&i| (Reverse(self.pending[i].align), i));

        let mut offsets = vec![0usize; self.pending.len()];
        let mut cursor = 0usize;
        let mut sector_align = 1usize;
        for &i in &order {
            let p = &self.pending[i];
            sector_align = sector_align.max(p.align);
            cursor = round_up(cursor, p.align);
            offsets[i] = cursor;
            cursor += p.size;
        }
        // Stride rounds up to the strictest alignment; a layout of only
        // zero-sized types still gets a one-byte stride so linear indices
        // stay distinct addresses.
        let sector_size = round_up(cursor, sector_align).max(1);

        let mut by_rust_type = HashMap::with_capacity(self.pending.len());
        let entries: Vec<ComponentLayout> = self
            .pending
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                by_rust_type.insert(p.rust_type, i as u16);
                ComponentLayout {
                    type_id: ComponentTypeId(i as u16),
                    rust_type: p.rust_type,
                    name: p.name,
                    size: p.size,
                    align: p.align,
                    offset: offsets[i],
                    mask: 1u64 << i,
                    ops: p.ops,
                }
            })
            .collect();

        Arc::new(SectorLayout {
            entries: entries.into_boxed_slice(),
            by_rust_type,
            sector_size,
            sector_align,
        })
    }
}

impl Default for SectorLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
