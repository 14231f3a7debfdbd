//! Property-based tests for the mirrored ring buffer using proptest.

use std::collections::VecDeque;

use proptest::prelude::*;
use ringsock::{Error, RingBuffer};

#[derive(Debug, Clone)]
enum Op {
    Write(Vec<u8>),
    Read(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 1..512).prop_map(Op::Write),
        (1usize..512).prop_map(Op::Read),
    ]
}

proptest! {
    /// Any interleaving of acquire/commit pairs that respects capacity
    /// yields exactly the byte stream that was written, bit for bit.
    #[test]
    fn interleaved_stream_is_preserved(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let buf = RingBuffer::with_initial_size(1024);
        let mut expected: VecDeque<u8> = VecDeque::new();

        for op in ops {
            match op {
                Op::Write(data) => match buf.acquire_write(data.len()) {
                    Ok(span) => {
                        span[..data.len()].copy_from_slice(&data);
                        buf.commit_write(data.len());
                        expected.extend(data);
                    }
                    Err(Error::WriteBufferFull) => {
                        // Backpressure may only appear while non-empty.
                        prop_assert!(buf.available() > 0);
                    }
                    Err(e) => return Err(TestCaseError::fail(format!("unexpected error: {}", e))),
                },
                Op::Read(n) => {
                    let span = buf.acquire_read();
                    let take = span.len().min(n);
                    for (i, byte) in span[..take].iter().enumerate() {
                        let want = expected.pop_front();
                        prop_assert_eq!(Some(*byte), want, "mismatch at offset {}", i);
                    }
                    buf.commit_read(take);
                }
            }
            prop_assert_eq!(buf.available(), expected.len());
        }

        // Drain whatever is left and compare the tail.
        let span = buf.acquire_read();
        prop_assert_eq!(span.len(), expected.len());
        for byte in span {
            prop_assert_eq!(Some(*byte), expected.pop_front());
        }
    }

    /// After a write that logically wraps, the single span returned by
    /// acquire_read covers the whole payload linearly.
    #[test]
    fn wrapped_region_reads_linear(
        park in 1usize..4096,
        data in prop::collection::vec(any::<u8>(), 1..4096),
    ) {
        let buf = RingBuffer::with_initial_size(1);

        // Materialize one page and learn the real capacity.
        let span = buf.acquire_write(1).unwrap();
        span[0] = 0;
        buf.commit_write(1);
        buf.commit_read(1);
        let cap = buf.capacity();

        // Park the cursors somewhere in the middle.
        let park = park % cap;
        if park > 0 {
            let span = buf.acquire_write(park).unwrap();
            span[..park].fill(0);
            buf.commit_write(park);
            buf.commit_read(park);
        }

        let n = data.len().min(cap);
        let span = buf.acquire_write(n).unwrap();
        span[..n].copy_from_slice(&data[..n]);
        buf.commit_write(n);

        let read = buf.acquire_read();
        prop_assert_eq!(read.len(), n);
        prop_assert_eq!(&read[..n], &data[..n]);
    }

    /// free_space + available always equals capacity, across any op mix.
    #[test]
    fn occupancy_arithmetic_is_consistent(ops in prop::collection::vec(op_strategy(), 1..48)) {
        let buf = RingBuffer::with_initial_size(2048);
        for op in ops {
            match op {
                Op::Write(data) => {
                    if let Ok(span) = buf.acquire_write(data.len()) {
                        span[..data.len()].copy_from_slice(&data);
                        buf.commit_write(data.len());
                    }
                }
                Op::Read(n) => {
                    let take = buf.acquire_read().len().min(n);
                    buf.commit_read(take);
                }
            }
            prop_assert_eq!(buf.available() + buf.free_space(), buf.capacity());
            prop_assert!(buf.available() <= buf.capacity());
        }
    }
}
