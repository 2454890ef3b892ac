//! Chunked payload arena.
//!
//! The arena owns a growable list of fixed-capacity chunks, each one
//! contiguous block large enough for `chunk_capacity` sector payloads. Growth
//! appends whole chunks and never relocates existing ones, so a payload
//! pointer stays valid for the life of the arena. A linear sector index `i`
//! addresses `(chunk = i / chunk_capacity, byte = (i % chunk_capacity) *
//! sector_size)`.
//!
//! The chunk-pointer spine is published through an atomic so lock-free
//! readers can translate indices while a gated writer appends chunks;
//! replaced spine arrays are routed through the retire bin.
//!
//! # Safety
//!
//! Mutating methods (`reserve`, `shrink`) must only be called while the
//! owning store holds its exclusive gate; addressing methods are safe to call
//! from any thread.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{alloc, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::retire::{dispose, RawBuf, RetireBin};
use crate::sync::{self, Ordering};
use crate::StoreError;

// ---------------------------------------------------------------------------
// ChunkArena
// ---------------------------------------------------------------------------

pub struct ChunkArena {
    sector_size: usize,
    sector_align: usize,
    chunk_capacity: usize,
    chunk_layout: Layout,
    /// Published array of chunk base pointers.
    spine: sync::AtomicPtr<*mut u8>,
    /// Allocation capacity of the spine array.
    spine_cap: sync::AtomicUsize,
    /// Published number of allocated chunks.
    chunks: sync::AtomicUsize,
}

impl ChunkArena {
    /// Create an empty arena for payloads of `sector_size` bytes aligned to
    /// `sector_align`, `chunk_capacity` sectors per chunk.
    pub fn new(
        sector_size: usize,
        sector_align: usize,
        chunk_capacity: usize,
    ) -> Result<Self, StoreError> {
        assert!(chunk_capacity > 0, "chunk capacity must be positive");
        assert!(sector_size > 0, "sector payloads must have nonzero stride");

        let bytes = sector_size
            .checked_mul(chunk_capacity)
            .ok_or(StoreError::OutOfMemory { bytes: usize::MAX })?;
        let chunk_layout = Layout::from_size_align(bytes, sector_align)
            .map_err(|_| StoreError::OutOfMemory { bytes })?;

        Ok(Self {
            sector_size,
            sector_align,
            chunk_capacity,
            chunk_layout,
            spine: sync::AtomicPtr::new(std::ptr::null_mut()),
            spine_cap: sync::AtomicUsize::new(0),
            chunks: sync::AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    #[inline]
    pub fn sector_align(&self) -> usize {
        self.sector_align
    }

    #[inline]
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Number of allocated chunks.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.load(Ordering::Acquire)
    }

    /// Number of sectors the arena currently covers. Always a multiple of
    /// `chunk_capacity`.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.chunk_count() * self.chunk_capacity
    }

    /// Base address of the payload at linear index `idx`. O(1); the address
    /// is stable until the chunk holding it is released.
    #[inline]
    pub fn payload(&self, idx: usize) -> *mut u8 {
        let chunk = idx / self.chunk_capacity;
        let byte = (idx % self.chunk_capacity) * self.sector_size;
        debug_assert!(chunk < self.chunk_count(), "payload index out of arena");
        let spine = self.spine.load(Ordering::Acquire);
        unsafe { spine.add(chunk).read().add(byte) }
    }

    /// Ensure the arena covers at least `sectors` payloads, appending whole
    /// chunks. Existing chunks are never moved. Gate-held only.
    pub(crate) fn reserve(&self, sectors: usize, bin: &RetireBin) -> Result<(), StoreError> {
        let needed = sectors.div_ceil(self.chunk_capacity);
        let current = self.chunks.load(Ordering::Relaxed);
        if needed <= current {
            return Ok(());
        }

        self.grow_spine(needed, bin)?;
        let spine = self.spine.load(Ordering::Relaxed);
        for i in current..needed {
            let chunk = unsafe { alloc(self.chunk_layout) };
            if chunk.is_null() {
                // Chunks published so far stay; the arena remains coherent.
                return Err(StoreError::OutOfMemory {
                    bytes: self.chunk_layout.size(),
                });
            }
            unsafe {
                spine.add(i).write(chunk);
            }
            self.chunks.store(i + 1, Ordering::Release);
        }
        tracing::debug!(
            chunks = needed,
            sectors = needed * self.chunk_capacity,
            "grew chunk arena"
        );
        Ok(())
    }

    /// Release whole chunks beyond what `keep_sectors` payloads require.
    /// Returns the number of chunks released. Gate-held only; the caller must
    /// have drained pins so no pinned payload lives in a released chunk.
    pub(crate) fn shrink(&self, keep_sectors: usize, bin: &RetireBin) -> usize {
        let keep = keep_sectors.div_ceil(self.chunk_capacity);
        let current = self.chunks.load(Ordering::Relaxed);
        if keep >= current {
            return 0;
        }
        // Unpublish first so no new reader addresses the doomed chunks.
        self.chunks.store(keep, Ordering::Release);
        let spine = self.spine.load(Ordering::Relaxed);
        for i in keep..current {
            unsafe {
                let chunk = spine.add(i).read();
                spine.add(i).write(std::ptr::null_mut());
                dispose(bin, NonNull::new_unchecked(chunk), self.chunk_layout);
            }
        }
        tracing::debug!(released = current - keep, kept = keep, "shrank chunk arena");
        current - keep
    }

    fn grow_spine(&self, needed_chunks: usize, bin: &RetireBin) -> Result<(), StoreError> {
        let cap = self.spine_cap.load(Ordering::Relaxed);
        if needed_chunks <= cap {
            return Ok(());
        }
        let new_cap = needed_chunks.next_power_of_two().max(8);
        let buf = RawBuf::<*mut u8>::alloc_zeroed(new_cap)?;
        let count = self.chunks.load(Ordering::Relaxed);
        let old = self.spine.load(Ordering::Relaxed);
        unsafe {
            if count > 0 {
                std::ptr::copy_nonoverlapping(old as *const *mut u8, buf.ptr(), count);
            }
        }
        let (new_ptr, new_cap) = buf.into_raw();
        self.spine.store(new_ptr.as_ptr(), Ordering::Release);
        self.spine_cap.store(new_cap, Ordering::Relaxed);
        if cap > 0 {
            unsafe {
                let layout = Layout::array::<*mut u8>(cap).expect("spine layout");
                dispose(bin, NonNull::new_unchecked(old.cast::<u8>()), layout);
            }
        }
        Ok(())
    }
}

impl Drop for ChunkArena {
    fn drop(&mut self) {
        let count = self.chunks.load(Ordering::Relaxed);
        let cap = self.spine_cap.load(Ordering::Relaxed);
        let spine = self.spine.load(Ordering::Relaxed);
        unsafe {
            for i in 0..count {
                dealloc(spine.add(i).read(), self.chunk_layout);
            }
            if cap > 0 {
                let layout = Layout::array::<*mut u8>(cap).expect("spine layout");
                dealloc(spine.cast::<u8>(), layout);
            }
        }
    }
}

impl fmt::Debug for ChunkArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkArena")
            .field("sector_size", &self.sector_size)
            .field("chunk_capacity", &self.chunk_capacity)
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PayloadCursor -- linear walk over payload addresses
// ---------------------------------------------------------------------------

/// Walks payload base addresses in linear-index order, jumping across chunk
/// boundaries without re-dividing on every step.
///
/// Snapshots the spine at construction, so a cursor never observes chunks
/// appended after it was created.
pub(crate) struct PayloadCursor<'a> {
    arena: &'a ChunkArena,
    spine: *const *mut u8,
    chunk_count: usize,
    idx: usize,
    within: usize,
    base: *mut u8,
}

impl<'a> PayloadCursor<'a> {
    pub fn new(arena: &'a ChunkArena, start: usize) -> Self {
        let spine = arena.spine.load(Ordering::Acquire) as *const *mut u8;
        let chunk_count = arena.chunks.load(Ordering::Acquire);
        let mut cursor = Self {
            arena,
            spine,
            chunk_count,
            idx: 0,
            within: 0,
            base: std::ptr::null_mut(),
        };
        cursor.seek(start);
        cursor
    }

    /// Reposition to an arbitrary linear index.
    pub fn seek(&mut self, idx: usize) {
        self.idx = idx;
        self.within = idx % self.arena.chunk_capacity;
        let chunk = idx / self.arena.chunk_capacity;
        self.base = if chunk < self.chunk_count {
            unsafe { self.spine.add(chunk).read() }
        } else {
            std::ptr::null_mut()
        };
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Payload address at the current position. Must not be called past the
    /// snapshotted arena capacity.
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        debug_assert!(!self.base.is_null(), "cursor past arena capacity");
        unsafe { self.base.add(self.within * self.arena.sector_size) }
    }

    #[inline]
    pub fn advance(&mut self) {
        self.idx += 1;
        self.within += 1;
        if self.within == self.arena.chunk_capacity {
            self.seek(self.idx);
        }
    }
}

// ---------------------------------------------------------------------------
// RangesCursor -- walk over resolved linear-index spans
// ---------------------------------------------------------------------------

/// A half-open span of linear indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinearSpan {
    pub start: usize,
    pub end: usize,
}

/// Emits `(linear_index, payload_ptr)` for every index covered by a sorted,
/// non-overlapping list of [`LinearSpan`]s.
pub(crate) struct RangesCursor<'a> {
    cursor: PayloadCursor<'a>,
    spans: Vec<LinearSpan>,
    span_idx: usize,
}

impl<'a> RangesCursor<'a> {
    pub fn new(arena: &'a ChunkArena, spans: Vec<LinearSpan>) -> Self {
        debug_assert!(spans.windows(2).all(|w| w[0].end <= w[1].start));
        Self {
            cursor: PayloadCursor::new(arena, 0),
            spans,
            span_idx: 0,
        }
    }

    pub fn next(&mut self) -> Option<(usize, *mut u8)> {
        loop {
            let span = *self.spans.get(self.span_idx)?;
            if self.cursor.index() < span.start {
                self.cursor.seek(span.start);
            }
            if self.cursor.index() >= span.end {
                self.span_idx += 1;
                continue;
            }
            let out = (self.cursor.index(), self.cursor.ptr());
            self.cursor.advance();
            return Some(out);
        }
    }

    /// Skip forward so the next emitted index is the first covered index at
    /// or after `target`. Binary search over the span list.
    pub fn advance_to(&mut self, target: usize) {
        let idx = self.spans.partition_point(|s| s.end <= target);
        self.span_idx = idx;
        if let Some(span) = self.spans.get(idx) {
            self.cursor.seek(span.start.max(target));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(sector_size: usize, chunk_capacity: usize) -> ChunkArena {
        ChunkArena::new(sector_size, 8, chunk_capacity).unwrap()
    }

    #[test]
    fn capacity_grows_in_whole_chunks() {
        let bin = RetireBin::new();
        let a = arena(16, 4);
        assert_eq!(a.capacity(), 0);

        a.reserve(1, &bin).unwrap();
        assert_eq!(a.capacity(), 4);
        a.reserve(4, &bin).unwrap();
        assert_eq!(a.capacity(), 4);
        a.reserve(5, &bin).unwrap();
        assert_eq!(a.capacity(), 8);
        assert_eq!(a.chunk_count(), 2);
    }

    #[test]
    fn payload_addresses_are_stable_across_growth() {
        let bin = RetireBin::new();
        let a = arena(32, 2);
        a.reserve(2, &bin).unwrap();

        let before: Vec<*mut u8> = (0..2).map(|i| a.payload(i)).collect();
        a.reserve(64, &bin).unwrap();
        let after: Vec<*mut u8> = (0..2).map(|i| a.payload(i)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn addressing_is_chunked() {
        let bin = RetireBin::new();
        let a = arena(8, 4);
        a.reserve(8, &bin).unwrap();

        // Within one chunk: consecutive strides.
        for i in 0..3 {
            let lo = a.payload(i) as usize;
            let hi = a.payload(i + 1) as usize;
            assert_eq!(hi - lo, 8);
        }
        // Slot 4 starts the second chunk: same intra-chunk offset as slot 0.
        let chunk0 = a.payload(0) as usize;
        let chunk1 = a.payload(4) as usize;
        assert_ne!(chunk0, chunk1);
        assert_eq!(a.payload(5) as usize - chunk1, 8);
    }

    #[test]
    fn cursor_crosses_chunk_boundaries() {
        let bin = RetireBin::new();
        let a = arena(8, 4);
        a.reserve(12, &bin).unwrap();

        let mut cursor = PayloadCursor::new(&a, 0);
        for i in 0..12 {
            assert_eq!(cursor.index(), i);
            assert_eq!(cursor.ptr(), a.payload(i));
            cursor.advance();
        }
    }

    #[test]
    fn cursor_seek_matches_direct_addressing() {
        let bin = RetireBin::new();
        let a = arena(24, 4);
        a.reserve(16, &bin).unwrap();

        let mut cursor = PayloadCursor::new(&a, 0);
        for &i in &[15, 0, 7, 8, 3] {
            cursor.seek(i);
            assert_eq!(cursor.ptr(), a.payload(i));
        }
    }

    #[test]
    fn ranges_cursor_walks_spans_in_order() {
        let bin = RetireBin::new();
        let a = arena(8, 4);
        a.reserve(32, &bin).unwrap();

        let spans = vec![
            LinearSpan { start: 1, end: 3 },
            LinearSpan { start: 6, end: 7 },
            LinearSpan { start: 20, end: 23 },
        ];
        let mut cursor = RangesCursor::new(&a, spans);
        let mut seen = Vec::new();
        while let Some((idx, ptr)) = cursor.next() {
            assert_eq!(ptr, a.payload(idx));
            seen.push(idx);
        }
        assert_eq!(seen, vec![1, 2, 6, 20, 21, 22]);
    }

    #[test]
    fn ranges_cursor_advance_to_skips_spans() {
        let bin = RetireBin::new();
        let a = arena(8, 4);
        a.reserve(32, &bin).unwrap();

        let spans = vec![
            LinearSpan { start: 0, end: 4 },
            LinearSpan { start: 10, end: 12 },
            LinearSpan { start: 25, end: 26 },
        ];
        let mut cursor = RangesCursor::new(&a, spans);
        cursor.advance_to(11);
        assert_eq!(cursor.next(), Some((11, a.payload(11))));
        cursor.advance_to(13);
        assert_eq!(cursor.next(), Some((25, a.payload(25))));
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn shrink_releases_trailing_chunks_only() {
        let bin = RetireBin::new();
        let a = arena(8, 4);
        a.reserve(16, &bin).unwrap();
        assert_eq!(a.chunk_count(), 4);

        let first = a.payload(0);
        let released = a.shrink(6, &bin);
        assert_eq!(released, 2);
        assert_eq!(a.capacity(), 8);
        assert_eq!(a.payload(0), first);
    }
}
