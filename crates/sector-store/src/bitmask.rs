//! Hierarchical bitmask over pinned sector ids.
//!
//! Three levels of 64-bit words: level 0 has one bit per id, level 1 one bit
//! per level-0 word, level 2 one bit per level-1 word. Structural writers use
//! it to answer "any pinned id in this range?" and "nearest pinned id"
//! without scanning the whole counter array; a zero summary word lets a query
//! skip 64 (level 1) or 4096 (level 2) detail words at once.
//!
//! Consistency protocol: `set` runs only while the store's shared gate is
//! held, `clear` (unpin) runs gate-free. `set` writes bottom-up and finishes
//! by re-asserting the summary bits, and `clear` heals a summary it cleared
//! if the detail word repopulated, so by the time a writer holds the
//! exclusive gate every summary bit covers its details. Summaries may carry
//! stale ones (queries re-verify at level 0); a settled stale zero cannot
//! occur.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::retire::RawBuf;
use crate::sync::{self, Ordering};
use crate::StoreError;

const WORD_BITS: usize = 64;

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

struct Level {
    ptr: sync::AtomicPtr<sync::AtomicU64>,
    words: sync::AtomicUsize,
}

impl Level {
    fn new() -> Self {
        Self {
            ptr: sync::AtomicPtr::new(NonNull::<sync::AtomicU64>::dangling().as_ptr()),
            words: sync::AtomicUsize::new(0),
        }
    }

    #[inline]
    fn as_slice(&self) -> &[sync::AtomicU64] {
        let len = self.words.load(Ordering::Acquire);
        let ptr = self.ptr.load(Ordering::Relaxed);
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    /// Swap in a fresh zeroed array of `words` words. Requires that no bit is
    /// currently set (growth happens with all pins drained), so nothing is
    /// copied and the old array is freed on the spot.
    fn replace(&self, words: usize) -> Result<(), StoreError> {
        debug_assert!(self.as_slice().iter().all(|w| w.load(Ordering::Relaxed) == 0));
        let old_words = self.words.load(Ordering::Relaxed);
        let old_ptr = self.ptr.load(Ordering::Relaxed);

        let (ptr, _) = RawBuf::<sync::AtomicU64>::alloc_zeroed(words)?.into_raw();
        self.ptr.store(ptr.as_ptr(), Ordering::Relaxed);
        self.words.store(words, Ordering::Release);

        if old_words > 0 {
            unsafe {
                let layout = Layout::array::<sync::AtomicU64>(old_words).expect("level layout");
                dealloc(old_ptr.cast::<u8>(), layout);
            }
        }
        Ok(())
    }
}

impl Drop for Level {
    fn drop(&mut self) {
        let words = self.words.load(Ordering::Relaxed);
        if words > 0 {
            unsafe {
                let layout = Layout::array::<sync::AtomicU64>(words).expect("level layout");
                dealloc(self.ptr.load(Ordering::Relaxed).cast::<u8>(), layout);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PinnedIdBitmask
// ---------------------------------------------------------------------------

pub struct PinnedIdBitmask {
    l0: Level,
    l1: Level,
    l2: Level,
    /// Ids addressable without growth; multiple of 64.
    cap: sync::AtomicUsize,
}

impl PinnedIdBitmask {
    pub fn new() -> Self {
        Self {
            l0: Level::new(),
            l1: Level::new(),
            l2: Level::new(),
            cap: sync::AtomicUsize::new(0),
        }
    }

    /// Ids currently addressable.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap.load(Ordering::Acquire)
    }

    /// Grow to cover ids `< cap_ids`. Gate-held, with all pins drained.
    pub(crate) fn grow(&self, cap_ids: usize) -> Result<(), StoreError> {
        if cap_ids <= self.capacity() {
            return Ok(());
        }
        let w0 = cap_ids.div_ceil(WORD_BITS);
        let w1 = w0.div_ceil(WORD_BITS);
        let w2 = w1.div_ceil(WORD_BITS);
        self.l0.replace(w0)?;
        self.l1.replace(w1)?;
        self.l2.replace(w2)?;
        self.cap.store(w0 * WORD_BITS, Ordering::Release);
        Ok(())
    }

    /// Mark `id` pinned. Must be called while the store's shared gate is
    /// held; `id` must be below [`capacity`](Self::capacity).
    pub fn set(&self, id: u32) {
        let id = id as usize;
        let w0 = id / WORD_BITS;
        let w1 = w0 / WORD_BITS;
        let l0 = self.l0.as_slice();
        let l1 = self.l1.as_slice();
        let l2 = self.l2.as_slice();

        // Bottom-up, then the summaries: once this returns, every summary bit
        // covering the id is set, and no concurrent clear can settle a zero
        // over it (clear re-checks the detail word after clearing a summary).
        l0[w0].fetch_or(1 << (id % WORD_BITS), Ordering::SeqCst);
        l1[w1].fetch_or(1 << (w0 % WORD_BITS), Ordering::SeqCst);
        l2[w1 / WORD_BITS].fetch_or(1 << (w1 % WORD_BITS), Ordering::SeqCst);
    }

    /// Mark `id` unpinned. May be called gate-free.
    pub fn clear(&self, id: u32) {
        let id = id as usize;
        let w0 = id / WORD_BITS;
        let w1 = w0 / WORD_BITS;
        let l0 = self.l0.as_slice();
        let l1 = self.l1.as_slice();
        let l2 = self.l2.as_slice();

        l0[w0].fetch_and(!(1 << (id % WORD_BITS)), Ordering::SeqCst);
        if l0[w0].load(Ordering::SeqCst) != 0 {
            return;
        }
        let bit1 = 1 << (w0 % WORD_BITS);
        l1[w1].fetch_and(!bit1, Ordering::SeqCst);
        if l0[w0].load(Ordering::SeqCst) != 0 {
            // A racing set repopulated the detail word; restore its summary.
            l1[w1].fetch_or(bit1, Ordering::SeqCst);
            return;
        }
        if l1[w1].load(Ordering::SeqCst) != 0 {
            return;
        }
        let bit2 = 1 << (w1 % WORD_BITS);
        l2[w1 / WORD_BITS].fetch_and(!bit2, Ordering::SeqCst);
        if l1[w1].load(Ordering::SeqCst) != 0 {
            l2[w1 / WORD_BITS].fetch_or(bit2, Ordering::SeqCst);
        }
    }

    /// Whether any id in `lo..=hi` is marked.
    pub fn any_in_range(&self, lo: u32, hi: u32) -> bool {
        let cap = self.capacity();
        if cap == 0 || lo > hi {
            return false;
        }
        let lo = lo as usize;
        let hi = (hi as usize).min(cap - 1);
        if lo > hi {
            return false;
        }

        let l0 = self.l0.as_slice();
        let l1 = self.l1.as_slice();
        let l2 = self.l2.as_slice();

        let w_lo = lo / WORD_BITS;
        let w_hi = hi / WORD_BITS;
        let mut w = w_lo;
        while w <= w_hi {
            // Skip over regions whose summary words are zero: one level-1
            // word covers 64 detail words, one level-2 word covers 4096. A
            // zero summary is authoritative once the exclusive gate is held.
            if w % (WORD_BITS * WORD_BITS) == 0
                && w + WORD_BITS * WORD_BITS - 1 <= w_hi
                && l2[w / (WORD_BITS * WORD_BITS)].load(Ordering::SeqCst) == 0
            {
                w += WORD_BITS * WORD_BITS;
                continue;
            }
            if w % WORD_BITS == 0
                && w + WORD_BITS - 1 <= w_hi
                && l1[w / WORD_BITS].load(Ordering::SeqCst) == 0
            {
                w += WORD_BITS;
                continue;
            }

            let mut word = l0[w].load(Ordering::SeqCst);
            if w == w_lo {
                word &= !0u64 << (lo % WORD_BITS);
            }
            if w == w_hi {
                word &= !0u64 >> (WORD_BITS - 1 - hi % WORD_BITS);
            }
            if word != 0 {
                return true;
            }
            w += 1;
        }
        false
    }

    /// Smallest marked id at or above `id`, if any.
    pub fn lowest_set_ge(&self, id: u32) -> Option<u32> {
        let cap = self.capacity();
        let id = id as usize;
        if cap == 0 || id >= cap {
            return None;
        }

        let l0 = self.l0.as_slice();
        let l1 = self.l1.as_slice();
        let l2 = self.l2.as_slice();

        let start = id / WORD_BITS;
        let words = l0.len();
        let mut w = start;
        while w < words {
            if w != start {
                if w % (WORD_BITS * WORD_BITS) == 0
                    && l2[w / (WORD_BITS * WORD_BITS)].load(Ordering::SeqCst) == 0
                {
                    w += WORD_BITS * WORD_BITS;
                    continue;
                }
                if w % WORD_BITS == 0 && l1[w / WORD_BITS].load(Ordering::SeqCst) == 0 {
                    w += WORD_BITS;
                    continue;
                }
            }
            let mut word = l0[w].load(Ordering::SeqCst);
            if w == start {
                word &= !0u64 << (id % WORD_BITS);
            }
            if word != 0 {
                return Some((w * WORD_BITS + word.trailing_zeros() as usize) as u32);
            }
            w += 1;
        }
        None
    }

    /// Largest marked id at or below `id`, if any.
    pub fn highest_set_le(&self, id: u32) -> Option<u32> {
        let cap = self.capacity();
        if cap == 0 {
            return None;
        }
        let id = (id as usize).min(cap - 1);

        let l0 = self.l0.as_slice();
        let l1 = self.l1.as_slice();
        let l2 = self.l2.as_slice();

        let top = id / WORD_BITS;
        let mut w = top as isize;
        while w >= 0 {
            let wi = w as usize;
            if wi != top {
                if wi % (WORD_BITS * WORD_BITS) == WORD_BITS * WORD_BITS - 1
                    && l2[wi / (WORD_BITS * WORD_BITS)].load(Ordering::SeqCst) == 0
                {
                    w -= (WORD_BITS * WORD_BITS) as isize;
                    continue;
                }
                if wi % WORD_BITS == WORD_BITS - 1
                    && l1[wi / WORD_BITS].load(Ordering::SeqCst) == 0
                {
                    w -= WORD_BITS as isize;
                    continue;
                }
            }
            let mut word = l0[wi].load(Ordering::SeqCst);
            if wi == top {
                word &= !0u64 >> (WORD_BITS - 1 - id % WORD_BITS);
            }
            if word != 0 {
                let bit = WORD_BITS - 1 - word.leading_zeros() as usize;
                return Some((wi * WORD_BITS + bit) as u32);
            }
            w -= 1;
        }
        None
    }

    /// Largest marked id overall, if any.
    pub fn max_set(&self) -> Option<u32> {
        let cap = self.capacity();
        if cap == 0 {
            None
        } else {
            self.highest_set_le(cap as u32 - 1)
        }
    }
}

impl Default for PinnedIdBitmask {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PinnedIdBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedIdBitmask")
            .field("capacity", &self.capacity())
            .field("max_set", &self.max_set())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
