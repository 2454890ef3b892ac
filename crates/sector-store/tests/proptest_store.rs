//! Property tests for the sector container.
//!
//! Random operation sequences run against a `BTreeMap` model; after every
//! step the dense/sparse invariants and the full component contents must
//! match the model.

use std::collections::BTreeMap;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use sector_store::layout::SectorLayoutBuilder;
use sector_store::prelude::*;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Pos(i64);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Vel(i64);

/// Model entry: which components are alive and their values.
type Entry = (Option<i64>, Option<i64>);

#[derive(Debug, Clone)]
enum Op {
    /// Strict insert of both components.
    Insert(u32, i64, i64),
    /// Upsert of the position component only.
    UpsertPos(u32, i64),
    EmplacePos(u32, i64),
    EmplaceVel(u32, i64),
    Erase(u32),
    DestroyVel(u32),
    Reserve(u16),
    ShrinkToFit,
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let id = 0u32..64;
    prop_oneof![
        4 => (id.clone(), any::<i64>(), any::<i64>()).prop_map(|(i, a, b)| Op::Insert(i, a, b)),
        3 => (id.clone(), any::<i64>()).prop_map(|(i, a)| Op::UpsertPos(i, a)),
        3 => (id.clone(), any::<i64>()).prop_map(|(i, a)| Op::EmplacePos(i, a)),
        3 => (id.clone(), any::<i64>()).prop_map(|(i, a)| Op::EmplaceVel(i, a)),
        3 => id.clone().prop_map(Op::Erase),
        2 => id.clone().prop_map(Op::DestroyVel),
        1 => (1u16..64).prop_map(Op::Reserve),
        1 => Just(Op::ShrinkToFit),
        1 => Just(Op::Clear),
    ]
}

fn new_store() -> SectorStore {
    let layout = SectorLayoutBuilder::new().with::<Pos>().with::<Vel>().build();
    // Tiny chunks so growth and chunk boundaries are exercised constantly.
    SectorStore::with_chunk_capacity(layout, 0, 4).unwrap()
}

fn check_against_model(store: &SectorStore, model: &BTreeMap<u32, Entry>) -> Result<(), TestCaseError> {
    prop_assert_eq!(store.len(), model.len());

    // Dense ids are exactly the model keys, strictly increasing, and every
    // sparse entry points back at its dense slot.
    let mut slot = 0usize;
    for sector in store.iter() {
        let (expected_id, entry) = model
            .iter()
            .nth(slot)
            .expect("model has an entry per dense slot");
        prop_assert_eq!(sector.id(), *expected_id);
        prop_assert_eq!(sector.index(), slot);

        let info = store.slot_info(sector.id()).expect("sparse maps dense id");
        prop_assert_eq!(info.index, slot);
        prop_assert_eq!(info.data.as_ptr(), sector.payload_ptr());

        prop_assert_eq!(store.get_cloned::<Pos>(sector.id()), entry.0.map(Pos));
        prop_assert_eq!(store.get_cloned::<Vel>(sector.id()), entry.1.map(Vel));
        slot += 1;
    }

    // Ids outside the model are absent.
    for id in 0..64u32 {
        if !model.contains_key(&id) {
            prop_assert!(store.slot_info(id).is_none());
            prop_assert_eq!(store.get_cloned::<Pos>(id), None);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn random_ops_preserve_invariants(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let store = new_store();
        let mut model: BTreeMap<u32, Entry> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(id, a, b) => {
                    let result = store.insert(id, (Pos(a), Vel(b)));
                    if model.contains_key(&id) {
                        let is_already_present = matches!(result, Err(StoreError::AlreadyPresent { .. }));
                        prop_assert!(is_already_present);
                    } else {
                        prop_assert!(result.is_ok());
                        model.insert(id, (Some(a), Some(b)));
                    }
                }
                Op::UpsertPos(id, a) => {
                    store.insert_or_update(id, (Pos(a),)).unwrap();
                    let entry = model.entry(id).or_insert((None, None));
                    entry.0 = Some(a);
                }
                Op::EmplacePos(id, a) => {
                    store.emplace(id, Pos(a)).unwrap();
                    model.entry(id).or_insert((None, None)).0 = Some(a);
                }
                Op::EmplaceVel(id, b) => {
                    store.emplace(id, Vel(b)).unwrap();
                    model.entry(id).or_insert((None, None)).1 = Some(b);
                }
                Op::Erase(id) => {
                    let expected = model.remove(&id).is_some();
                    prop_assert_eq!(store.erase(id), expected);
                }
                Op::DestroyVel(id) => {
                    let mut expected = false;
                    if let Some(entry) = model.get_mut(&id) {
                        if entry.1.is_some() {
                            expected = true;
                            entry.1 = None;
                            if entry.0.is_none() {
                                model.remove(&id);
                            }
                        }
                    }
                    prop_assert_eq!(store.destroy_component::<Vel>(id).unwrap(), expected);
                }
                Op::Reserve(n) => {
                    let before = store.capacity();
                    store.reserve(n as usize).unwrap();
                    prop_assert!(store.capacity() >= before.max(n as usize));
                }
                Op::ShrinkToFit => {
                    store.shrink_to_fit().unwrap();
                    prop_assert!(store.capacity() >= store.len());
                }
                Op::Clear => {
                    store.clear();
                    model.clear();
                }
            }

            check_against_model(&store, &model)?;
        }
    }

    #[test]
    fn ranged_iteration_matches_model_filter(
        ids in prop::collection::btree_set(0u32..200, 0..40),
        ranges in prop::collection::vec(0u32..200, 1..6),
    ) {
        let store = new_store();
        for &id in &ids {
            store.insert(id, (Pos(id as i64), Vel(0))).unwrap();
        }

        // Build sorted, non-overlapping half-open ranges from the sample.
        let mut bounds: Vec<u32> = ranges;
        bounds.sort_unstable();
        bounds.dedup();
        let spans: Vec<std::ops::Range<u32>> = bounds
            .chunks(2)
            .filter(|pair| pair.len() == 2 && pair[0] < pair[1])
            .map(|pair| pair[0]..pair[1])
            .collect();

        let visited: Vec<u32> = store.iter_ranges(&spans).map(|s| s.id()).collect();
        let expected: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|id| spans.iter().any(|r| r.contains(id)))
            .collect();
        prop_assert_eq!(visited, expected);
    }

    #[test]
    fn values_survive_growth_and_shifts(
        ids in prop::collection::btree_set(0u32..500, 1..80),
        erase_mask in any::<u64>(),
    ) {
        let store = new_store();
        let insertion_order: Vec<u32> = {
            // Interleave from both ends so the sort bubble runs hard.
            let sorted: Vec<u32> = ids.iter().copied().collect();
            let mut order = Vec::with_capacity(sorted.len());
            let (mut lo, mut hi) = (0usize, sorted.len());
            while lo < hi {
                hi -= 1;
                order.push(sorted[hi]);
                if lo < hi {
                    order.push(sorted[lo]);
                    lo += 1;
                }
            }
            order
        };

        for &id in &insertion_order {
            store.insert(id, (Pos(id as i64 * 3), Vel(-(id as i64)))).unwrap();
        }

        let mut kept: Vec<u32> = Vec::new();
        for (i, &id) in insertion_order.iter().enumerate() {
            if erase_mask & (1 << (i % 64)) != 0 {
                prop_assert!(store.erase(id));
            } else {
                kept.push(id);
            }
        }
        kept.sort_unstable();

        let present: Vec<u32> = store.iter().map(|s| s.id()).collect();
        prop_assert_eq!(&present, &kept);
        for &id in &kept {
            prop_assert_eq!(store.get_cloned::<Pos>(id), Some(Pos(id as i64 * 3)));
            prop_assert_eq!(store.get_cloned::<Vel>(id), Some(Vel(-(id as i64))));
        }
    }
}
