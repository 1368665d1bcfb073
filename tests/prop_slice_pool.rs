//! Property-based tests for the slice pool
//!
//! For any sequence of alloc/free operations the pool's accounting must
//! match the set of outstanding allocations, survivors must keep their
//! contents across `compress()`, and freeing everything must bring the
//! netto size back to zero.

use edge_relay::SlicePool;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Alloc(u8),
    Free(usize),
    Compress,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u8>().prop_map(Op::Alloc),
        any::<usize>().prop_map(Op::Free),
        Just(Op::Compress),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn netto_matches_outstanding(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let pool = SlicePool::new(512, 16);
        let mut live = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(marker) => {
                    let allocation = pool.alloc();
                    pool.with_write(&allocation, |buf| buf.fill(marker));
                    live.push((allocation, marker));
                }
                Op::Free(index) if !live.is_empty() => {
                    let (allocation, _) = live.swap_remove(index % live.len());
                    pool.free(allocation);
                }
                Op::Free(_) => {}
                Op::Compress => pool.compress(),
            }

            prop_assert_eq!(
                pool.stats().netto_size,
                live.len() * pool.slice_size()
            );
        }

        // every survivor still holds its marker byte
        for (allocation, marker) in &live {
            pool.with_read(allocation, |buf| {
                assert!(buf.iter().all(|&b| b == *marker));
            });
        }

        for (allocation, _) in live {
            pool.free(allocation);
        }
        prop_assert_eq!(pool.stats().netto_size, 0);

        // compress with nothing live returns all areas
        pool.compress();
        prop_assert_eq!(pool.stats().brutto_size, 0);
    }

    #[test]
    fn free_alloc_roundtrip_is_noop(count in 1usize..64) {
        let pool = SlicePool::new(256, 8);

        let mut allocations: Vec<_> = (0..count).map(|_| pool.alloc()).collect();
        let netto = pool.stats().netto_size;
        prop_assert_eq!(netto, count * pool.slice_size());

        // free one, allocate one: the accounting is unchanged
        let victim = allocations.pop().unwrap();
        pool.free(victim);
        allocations.push(pool.alloc());
        prop_assert_eq!(pool.stats().netto_size, netto);

        for allocation in allocations {
            pool.free(allocation);
        }
        prop_assert_eq!(pool.stats().netto_size, 0);
    }
}
