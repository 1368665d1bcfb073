//! Property-based tests for the FIFO buffers
//!
//! Bytes out must equal bytes in, in order, for any interleaving of
//! push/read/consume/skip operations.

use edge_relay::mem::fifo::{MultiFifoBuffer, SliceFifoBuffer};
use edge_relay::SlicePool;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Push(Vec<u8>),
    Consume(usize),
    Skip(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => prop::collection::vec(any::<u8>(), 0..600).prop_map(Op::Push),
        3 => (0usize..800).prop_map(Op::Consume),
        1 => (0usize..800).prop_map(Op::Skip),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn multi_fifo_conserves_bytes(ops in prop::collection::vec(op_strategy(), 1..100)) {
        let pool = SlicePool::new(256, 8);
        let mut multi = MultiFifoBuffer::new();

        // reference model
        let mut pushed: Vec<u8> = Vec::new();
        let mut consumed = 0usize;

        for op in ops {
            match op {
                Op::Push(data) => {
                    multi.push(&pool, &data);
                    pushed.extend_from_slice(&data);
                }
                Op::Consume(want) => {
                    let available = multi.available();
                    let n = want.min(available);
                    if n > 0 {
                        // what we read must match the model
                        let chunk = multi.read(&pool);
                        let take = chunk.len().min(n);
                        prop_assert_eq!(
                            &chunk[..take],
                            &pushed[consumed..consumed + take]
                        );
                        multi.consume(&pool, take);
                        consumed += take;
                    }
                }
                Op::Skip(want) => {
                    let expected = want.min(multi.available());
                    let skipped = multi.skip(&pool, want);
                    prop_assert_eq!(skipped, expected);
                    consumed += skipped;
                }
            }

            prop_assert_eq!(multi.available(), pushed.len() - consumed);
        }

        // drain the rest and compare against the model
        while !multi.is_empty() {
            let chunk = multi.read(&pool);
            prop_assert_eq!(&chunk[..], &pushed[consumed..consumed + chunk.len()]);
            let n = chunk.len();
            multi.consume(&pool, n);
            consumed += n;
        }
        prop_assert_eq!(consumed, pushed.len());

        multi.clear(&pool);
        prop_assert_eq!(pool.stats().netto_size, 0);
    }

    #[test]
    fn single_fifo_skip_semantics(available in 0usize..200, want in 0usize..400) {
        let pool = SlicePool::new(256, 8);
        let mut buffer = SliceFifoBuffer::new();
        let data = vec![0x5au8; available];
        let pushed = buffer.push(&pool, &data);
        prop_assert_eq!(pushed, available.min(pool.slice_size()));

        let mut multi = MultiFifoBuffer::new();
        multi.push(&pool, &data);
        let skipped = multi.skip(&pool, want);
        if want <= available {
            // full skip
            prop_assert_eq!(skipped, want);
        } else {
            // short skip empties the buffer
            prop_assert_eq!(skipped, available);
            prop_assert!(multi.is_empty());
        }

        buffer.free(&pool);
        multi.clear(&pool);
    }
}
