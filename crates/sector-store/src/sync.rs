//! Concurrency primitives, selected by the `concurrent` cargo feature.
//!
//! The whole crate is written against the names exported here. With the
//! feature enabled they are real atomics plus `parking_lot` locks; without it
//! they are `Cell`/`RefCell`-backed shims with the same method surface, so the
//! single-threaded build carries no atomic operations, no lock words, and no
//! blocking paths. Borrow conflicts that would have been lock contention
//! become `RefCell` panics, which is the desired failure mode for misuse of a
//! single-threaded container.

pub use std::sync::atomic::Ordering;

#[cfg(feature = "concurrent")]
pub use self::concurrent::*;

#[cfg(not(feature = "concurrent"))]
pub use self::local::*;

#[cfg(feature = "concurrent")]
mod concurrent {
    pub use parking_lot::{
        Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
    };
    pub use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};
}

// The shims mirror the full atomic method surface; a build only calls the
// subset it needs.
#[cfg(not(feature = "concurrent"))]
#[allow(dead_code)]
mod local {
    use std::cell::{Cell, Ref, RefCell, RefMut};
    use std::ops::{Deref, DerefMut};
    use std::sync::atomic::Ordering;

    macro_rules! cell_atomic {
        ($name:ident, $ty:ty) => {
            /// Single-threaded stand-in for the std atomic of the same name.
            pub struct $name(Cell<$ty>);

            impl $name {
                pub const fn new(value: $ty) -> Self {
                    Self(Cell::new(value))
                }

                #[inline]
                pub fn load(&self, _order: Ordering) -> $ty {
                    self.0.get()
                }

                #[inline]
                pub fn store(&self, value: $ty, _order: Ordering) {
                    self.0.set(value);
                }

                #[inline]
                pub fn fetch_add(&self, value: $ty, _order: Ordering) -> $ty {
                    let prev = self.0.get();
                    self.0.set(prev.wrapping_add(value));
                    prev
                }

                #[inline]
                pub fn fetch_sub(&self, value: $ty, _order: Ordering) -> $ty {
                    let prev = self.0.get();
                    self.0.set(prev.wrapping_sub(value));
                    prev
                }

                #[inline]
                pub fn fetch_or(&self, value: $ty, _order: Ordering) -> $ty {
                    let prev = self.0.get();
                    self.0.set(prev | value);
                    prev
                }

                #[inline]
                pub fn fetch_and(&self, value: $ty, _order: Ordering) -> $ty {
                    let prev = self.0.get();
                    self.0.set(prev & value);
                    prev
                }
            }
        };
    }

    cell_atomic!(AtomicU32, u32);
    cell_atomic!(AtomicU64, u64);
    cell_atomic!(AtomicUsize, usize);

    /// Single-threaded stand-in for `std::sync::atomic::AtomicPtr`.
    pub struct AtomicPtr<T>(Cell<*mut T>);

    impl<T> AtomicPtr<T> {
        pub const fn new(ptr: *mut T) -> Self {
            Self(Cell::new(ptr))
        }

        #[inline]
        pub fn load(&self, _order: Ordering) -> *mut T {
            self.0.get()
        }

        #[inline]
        pub fn store(&self, ptr: *mut T, _order: Ordering) {
            self.0.set(ptr);
        }
    }

    /// `RefCell`-backed `RwLock` with the `parking_lot` call surface.
    pub struct RwLock<T>(RefCell<T>);

    pub struct RwLockReadGuard<'a, T>(Ref<'a, T>);
    pub struct RwLockWriteGuard<'a, T>(RefMut<'a, T>);

    impl<T> RwLock<T> {
        pub const fn new(value: T) -> Self {
            Self(RefCell::new(value))
        }

        #[inline]
        pub fn read(&self) -> RwLockReadGuard<'_, T> {
            RwLockReadGuard(self.0.borrow())
        }

        #[inline]
        pub fn read_recursive(&self) -> RwLockReadGuard<'_, T> {
            RwLockReadGuard(self.0.borrow())
        }

        #[inline]
        pub fn write(&self) -> RwLockWriteGuard<'_, T> {
            RwLockWriteGuard(self.0.borrow_mut())
        }

        #[inline]
        pub fn get_mut(&mut self) -> &mut T {
            self.0.get_mut()
        }
    }

    impl<T> Deref for RwLockReadGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.0
        }
    }

    impl<T> Deref for RwLockWriteGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.0
        }
    }

    impl<T> DerefMut for RwLockWriteGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.0
        }
    }

    /// `RefCell`-backed `Mutex` with the `parking_lot` call surface.
    pub struct Mutex<T>(RefCell<T>);

    pub struct MutexGuard<'a, T>(RefMut<'a, T>);

    impl<T> Mutex<T> {
        pub const fn new(value: T) -> Self {
            Self(RefCell::new(value))
        }

        #[inline]
        pub fn lock(&self) -> MutexGuard<'_, T> {
            MutexGuard(self.0.borrow_mut())
        }

        #[inline]
        pub fn get_mut(&mut self) -> &mut T {
            self.0.get_mut()
        }
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.0
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.0
        }
    }

    /// Condition variable stand-in. Waiting on a single thread can never be
    /// satisfied by another thread, so `wait` panics: reaching it means the
    /// caller tried to block on a pin that only the caller itself could
    /// release.
    pub struct Condvar;

    impl Condvar {
        pub const fn new() -> Self {
            Self
        }

        pub fn wait<T>(&self, _guard: &mut MutexGuard<'_, T>) {
            panic!(
                "deadlock: waiting for pinned sectors to drain in a single-threaded build; \
                 drop all pins before structural mutation"
            );
        }

        pub fn notify_all(&self) {}

        pub fn notify_one(&self) {}
    }
}
