//! Deferred reclamation of dense backing storage.
//!
//! When the container reallocates its dense or sparse tables, a lock-free
//! reader may still hold a pointer-size snapshot of the old buffer. Freeing
//! that buffer immediately would hand the reader dangling memory, so the old
//! allocation is *retired* into a [`RetireBin`] instead and only freed at
//! points where no observer can still reference it: when a structural writer
//! holds the exclusive gate with no pins outstanding, or when the bin itself
//! is dropped. There is no epoch or hazard machinery; the pin protocol is the
//! single gate that drains observers.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::sync::Mutex;
use crate::StoreError;

// ---------------------------------------------------------------------------
// RetireBin
// ---------------------------------------------------------------------------

/// A raw allocation awaiting release.
struct Retired {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safety: Retired is an ownership token for a heap allocation that no other
// party will touch until the bin frees it.
unsafe impl Send for Retired {}

/// Mutex-guarded list of raw allocations pending release.
///
/// The bin must outlive every buffer routed into it; dropping the bin drains.
pub struct RetireBin {
    pending: Mutex<Vec<Retired>>,
}

impl RetireBin {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue an allocation for a later [`drain_all`](Self::drain_all).
    #[cfg_attr(not(feature = "concurrent"), allow(dead_code))]
    pub(crate) fn retire(&self, ptr: NonNull<u8>, layout: Layout) {
        debug_assert!(layout.size() > 0);
        self.pending.lock().push(Retired { ptr, layout });
    }

    /// Free every queued allocation. Returns how many were released.
    pub fn drain_all(&self) -> usize {
        let drained = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending)
        };
        let count = drained.len();
        for retired in drained {
            unsafe {
                dealloc(retired.ptr.as_ptr(), retired.layout);
            }
        }
        if count > 0 {
            tracing::debug!(freed = count, "drained retire bin");
        }
        count
    }

    /// Number of allocations currently queued.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for RetireBin {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RetireBin {
    fn drop(&mut self) {
        self.drain_all();
    }
}

impl fmt::Debug for RetireBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetireBin")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Release a raw allocation according to the build's reclamation policy:
/// retired into `bin` in the `concurrent` build, freed on the spot otherwise.
///
/// # Safety
///
/// `ptr` must have been allocated with exactly `layout` and must not be used
/// again by the caller.
#[cfg(feature = "concurrent")]
pub(crate) unsafe fn dispose(bin: &RetireBin, ptr: NonNull<u8>, layout: Layout) {
    bin.retire(ptr, layout);
}

#[cfg(not(feature = "concurrent"))]
pub(crate) unsafe fn dispose(_bin: &RetireBin, ptr: NonNull<u8>, layout: Layout) {
    dealloc(ptr.as_ptr(), layout);
}

// ---------------------------------------------------------------------------
// RawBuf -- zero-initialized typed buffer with deferred release
// ---------------------------------------------------------------------------

/// A zero-initialized heap buffer of `cap` values of `T`.
///
/// Backing storage for the dense, sparse, and bookkeeping tables. Dropping
/// frees immediately (used at container teardown, when no readers exist);
/// [`dispose_into`](Self::dispose_into) routes the allocation through the
/// build's reclamation policy instead.
///
/// Only used with types for which the all-zero bit pattern is a valid value
/// (atomics and cells of integers, raw pointer tables).
pub(crate) struct RawBuf<T> {
    ptr: NonNull<T>,
    cap: usize,
}

impl<T> RawBuf<T> {
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            cap: 0,
        }
    }

    pub fn alloc_zeroed(cap: usize) -> Result<Self, StoreError> {
        if cap == 0 {
            return Ok(Self::empty());
        }
        let layout = Layout::array::<T>(cap).map_err(|_| StoreError::OutOfMemory {
            bytes: usize::MAX,
        })?;
        let raw = unsafe { alloc_zeroed(layout) };
        match NonNull::new(raw.cast::<T>()) {
            Some(ptr) => Ok(Self { ptr, cap }),
            None => Err(StoreError::OutOfMemory {
                bytes: layout.size(),
            }),
        }
    }

    #[inline]
    pub fn ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }

    fn layout(&self) -> Layout {
        // Checked at allocation time.
        Layout::array::<T>(self.cap).expect("buffer layout was valid at allocation")
    }

    /// Replace with an empty buffer, returning the current one.
    pub fn take(&mut self) -> RawBuf<T> {
        std::mem::replace(self, Self::empty())
    }

    /// Consume the buffer, returning the raw allocation. The caller becomes
    /// responsible for releasing it with the layout of `cap` values of `T`.
    pub fn into_raw(self) -> (NonNull<T>, usize) {
        let ptr = self.ptr;
        let cap = self.cap;
        std::mem::forget(self);
        (ptr, cap)
    }

    /// Hand the allocation to the reclamation policy and consume the buffer.
    pub fn dispose_into(self, bin: &RetireBin) {
        if self.cap > 0 {
            unsafe {
                dispose(bin, self.ptr.cast::<u8>(), self.layout());
            }
        }
        std::mem::forget(self);
    }
}

impl<T> Drop for RawBuf<T> {
    fn drop(&mut self) {
        if self.cap > 0 {
            unsafe {
                dealloc(self.ptr.as_ptr().cast::<u8>(), self.layout());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
