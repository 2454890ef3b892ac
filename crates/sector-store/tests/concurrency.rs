//! Reader/writer behavior of the thread-safe build: coherent reads under
//! writer churn, pinned-payload stability, and writers blocking on pins.
#![cfg(feature = "concurrent")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sector_store::layout::SectorLayoutBuilder;
use sector_store::prelude::*;

/// Test component carrying its own coherence witness: `b == a + 1` always.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Pair {
    a: u64,
    b: u64,
}

impl Pair {
    fn of(seed: u64) -> Self {
        Self { a: seed, b: seed + 1 }
    }
}

fn pair_store(capacity: usize, chunk: usize) -> SectorStore {
    let layout = SectorLayoutBuilder::new().with::<Pair>().build();
    SectorStore::with_chunk_capacity(layout, capacity, chunk).unwrap()
}

#[test]
fn store_is_send_and_sync() {
    fn assert_sync<T: Send + Sync>() {}
    assert_sync::<SectorStore>();
}

#[test]
fn readers_see_coherent_components_under_writer_churn() {
    // Stable region 0..64 for readers; the writer churns 64..128. Capacity is
    // pre-reserved so the writer never needs a full pin drain.
    let store = pair_store(256, 8);
    for id in 0..64u32 {
        store.insert(id, (Pair::of(id as u64),)).unwrap();
    }
    // Touch the top of the id space so the sparse map is fully sized up
    // front; sparse growth drains every pin, which would serialize the
    // readers and the writer instead of overlapping them.
    store.insert(127, (Pair::of(127 * 7),)).unwrap();

    thread::scope(|scope| {
        for t in 0..4u64 {
            let store = &store;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                for _ in 0..20_000 {
                    let id = rng.gen_range(0..64u32);
                    let pinned = store.pin_component::<Pair>(id).expect("stable region");
                    let value = *pinned.get().expect("component alive");
                    assert_eq!(value.b, value.a + 1, "torn read on id {id}");
                }
            });
        }

        let store = &store;
        scope.spawn(move || {
            let mut rng = StdRng::seed_from_u64(0xC0FFEE);
            for _ in 0..4_000 {
                let id = rng.gen_range(64..128u32);
                if store.contains(id) {
                    assert!(store.erase(id));
                } else {
                    store.insert(id, (Pair::of(id as u64 * 7),)).unwrap();
                }
            }
        });
    });

    // Post-stress coherence over the whole store.
    assert_eq!(store.pin_counters().total(), 0);
    for id in 0..64u32 {
        assert_eq!(store.get_cloned::<Pair>(id), Some(Pair::of(id as u64)));
    }
    let mut prev = None;
    for sector in store.iter() {
        if let Some(p) = prev {
            assert!(p < sector.id());
        }
        prev = Some(sector.id());
    }
}

#[test]
fn pinned_payload_survives_concurrent_inserts() {
    let store = pair_store(512, 4);
    store.insert(50, (Pair::of(50),)).unwrap();
    // Size the sparse map past every id the writer will touch; growing it
    // mid-run would wait for the reader's pin.
    store.insert(400, (Pair::of(400),)).unwrap();

    let pinned = store.pin_component::<Pair>(50).expect("just inserted");
    let addr = pinned.as_ptr();

    thread::scope(|scope| {
        let store = &store;
        let writer = scope.spawn(move || {
            for id in 100..356u32 {
                store.insert(id, (Pair::of(id as u64),)).unwrap();
            }
        });

        // Read throughout the writer's run; the pinned payload must neither
        // move nor change.
        while !writer.is_finished() {
            assert_eq!(pinned.as_ptr(), addr);
            assert_eq!(pinned.get(), Some(&Pair::of(50)));
        }
        writer.join().unwrap();
    });

    assert_eq!(pinned.as_ptr(), addr, "address constant for the pin's lifetime");
    assert_eq!(pinned.get(), Some(&Pair::of(50)));
    drop(pinned);
    assert_eq!(store.len(), 258);
}

#[test]
fn erase_blocks_while_a_tail_sector_is_pinned() {
    let store = pair_store(16, 16);
    store.insert(5, (Pair::of(5),)).unwrap();
    store.insert(9, (Pair::of(9),)).unwrap();

    let pinned = store.pin_sector(9).expect("present");
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let store = &store;
        let done = &done;
        scope.spawn(move || {
            // Erasing 5 shifts 9 down one slot, so it must wait for the pin.
            assert!(store.erase(5));
            done.store(true, Ordering::Release);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(
            !done.load(Ordering::Acquire),
            "erase proceeded while the shifted sector was pinned"
        );
        drop(pinned);
    });

    assert!(done.load(Ordering::Acquire));
    assert!(!store.contains(5));
    assert!(store.contains(9));
    assert_eq!(store.slot_info(9).unwrap().index, 0);
}

#[test]
fn view_holds_its_upper_bound_until_dropped() {
    let store = pair_store(16, 16);
    for id in [1u32, 5, 9] {
        store.insert(id, (Pair::of(id as u64),)).unwrap();
    }

    let view = store.view::<Pair, ()>(()).unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let store = &store;
        let done = &done;
        scope.spawn(move || {
            assert!(store.erase(9));
            done.store(true, Ordering::Release);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::Acquire), "erase must wait for the view");

        // The view still observes its construction-time bounds.
        let mut seen = Vec::new();
        view.each(|id, pair, ()| {
            assert_eq!(pair.b, pair.a + 1);
            seen.push(id);
        });
        assert_eq!(seen, vec![1, 5, 9]);

        drop(view);
    });

    assert!(done.load(Ordering::Acquire));
    assert_eq!(store.len(), 2);
    assert!(!store.contains(9));
}

#[test]
fn concurrent_inserters_serialize_on_the_gate() {
    let store = pair_store(0, 8);

    thread::scope(|scope| {
        for t in 0..4u32 {
            let store = &store;
            scope.spawn(move || {
                let base = t * 1000;
                for i in 0..100u32 {
                    // Descending within each thread so the sort bubble runs
                    // under contention too.
                    let id = base + 99 - i;
                    store.insert(id, (Pair::of(id as u64),)).unwrap();
                }
            });
        }
    });

    assert_eq!(store.len(), 400);
    let mut prev = None;
    for sector in store.iter() {
        if let Some(p) = prev {
            assert!(p < sector.id(), "dense ids sorted after concurrent inserts");
        }
        prev = Some(sector.id());
        let expected = Pair::of(sector.id() as u64);
        assert_eq!(store.get_cloned::<Pair>(sector.id()), Some(expected));
    }
}

#[test]
fn pin_counters_drain_to_zero_after_stress() {
    let store = pair_store(512, 64);
    for id in 0..256u32 {
        store.insert(id, (Pair::of(id as u64),)).unwrap();
    }

    thread::scope(|scope| {
        for t in 0..8u64 {
            let store = &store;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t.wrapping_mul(0x9E3779B9));
                for _ in 0..10_000 {
                    let id = rng.gen_range(0..256u32);
                    let sector = store.pin_sector(id).expect("all present");
                    let pair = sector.get::<Pair>().expect("alive");
                    assert_eq!(pair.b, pair.a + 1);
                }
            });
        }
    });

    assert_eq!(store.pin_counters().total(), 0, "every pin released");
    assert_eq!(store.pin_counters().bitmask().max_set(), None);
}
