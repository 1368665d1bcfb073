//! Property-based tests for the rubber allocator
//!
//! After any sequence of add/remove/shrink/compress operations the
//! accounting identity `netto + holes == brutto` must hold, no two live
//! objects may overlap, and every object's content must survive
//! relocation.

use edge_relay::Rubber;
use proptest::prelude::*;

const MAP_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
enum Op {
    Add(usize),
    Remove(usize),
    Shrink(usize, usize),
    Compress,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1usize..4096).prop_map(Op::Add),
        2 => any::<usize>().prop_map(Op::Remove),
        1 => (any::<usize>(), 1usize..4096).prop_map(|(i, s)| Op::Shrink(i, s)),
        1 => Just(Op::Compress),
    ]
}

fn fill_pattern(rubber: &Rubber, id: u32, seed: u8) {
    rubber.with_write(id, |data| {
        for (i, b) in data.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
    });
}

fn check_pattern(rubber: &Rubber, id: u32, seed: u8, len: usize) {
    rubber.with_read(id, |data| {
        assert!(data.len() >= len);
        for (i, b) in data[..len].iter().enumerate() {
            assert_eq!(*b, seed.wrapping_add(i as u8), "content of id {} damaged", id);
        }
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn accounting_and_content_hold(ops in prop::collection::vec(op_strategy(), 1..150)) {
        let rubber = Rubber::new(MAP_SIZE);
        // (id, seed, verified_len)
        let mut live: Vec<(u32, u8, usize)> = Vec::new();
        let mut next_seed = 0u8;

        for op in ops {
            match op {
                Op::Add(size) => {
                    let id = rubber.add(size);
                    if id != 0 {
                        next_seed = next_seed.wrapping_add(17);
                        fill_pattern(&rubber, id, next_seed);
                        live.push((id, next_seed, size));
                    }
                }
                Op::Remove(index) if !live.is_empty() => {
                    let (id, _, _) = live.swap_remove(index % live.len());
                    rubber.remove(id);
                }
                Op::Remove(_) => {}
                Op::Shrink(index, new_size) if !live.is_empty() => {
                    let live_len = live.len();
                    let entry = &mut live[index % live_len];
                    if new_size <= entry.2 {
                        rubber.shrink(entry.0, new_size);
                        entry.2 = new_size;
                    }
                }
                Op::Shrink(..) => {}
                Op::Compress => rubber.compress(),
            }

            prop_assert!(rubber.netto_size() <= rubber.brutto_size());
            prop_assert!(rubber.brutto_size() <= MAP_SIZE);
        }

        // compaction preserves the whole multiset of allocations
        rubber.compress();
        prop_assert_eq!(rubber.netto_size(), rubber.brutto_size());
        for (id, seed, len) in &live {
            check_pattern(&rubber, *id, *seed, *len);
        }

        for (id, _, _) in live {
            rubber.remove(id);
        }
        prop_assert_eq!(rubber.netto_size(), 0);
        prop_assert_eq!(rubber.brutto_size(), 0);
    }

    #[test]
    fn oversized_add_fails(extra in 1usize..4096) {
        let rubber = Rubber::new(4096);
        prop_assert_eq!(rubber.add(4096 + extra), 0);
    }

    #[test]
    fn ids_never_overlap(sizes in prop::collection::vec(1usize..2048, 1..32)) {
        let rubber = Rubber::new(MAP_SIZE);
        let ids: Vec<u32> = sizes
            .iter()
            .map(|&size| rubber.add(size))
            .filter(|&id| id != 0)
            .collect();

        // write a distinct byte through each id, then verify all of them;
        // overlap would tear an earlier pattern
        for (i, &id) in ids.iter().enumerate() {
            fill_pattern(&rubber, id, i as u8);
        }
        for (i, (&id, &size)) in ids.iter().zip(sizes.iter()).enumerate() {
            check_pattern(&rubber, id, i as u8, size);
        }
    }
}
