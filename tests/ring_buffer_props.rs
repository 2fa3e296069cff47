//! Property checks for `RingBuffer` cursor arithmetic.

use proptest::prelude::*;
use spindle_io::{Error, RingBuffer};

/// A buffer whose cursors both sit at `offset`.
fn rotated(capacity: usize, offset: usize) -> RingBuffer {
    let mut buf = RingBuffer::new(capacity);
    for _ in 0..offset {
        buf.put_u8(0).unwrap();
        buf.get_u8().unwrap();
    }
    buf
}

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>),
    Get(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        proptest::collection::vec(any::<u8>(), 0..24).prop_map(Op::Put),
        (0usize..24).prop_map(Op::Get),
    ]
}

proptest! {
    #[test]
    fn prop_fifo_sequences_match_model(
        capacity in 1usize..32,
        ops in proptest::collection::vec(op(), 0..64),
    ) {
        let mut buf = RingBuffer::new(capacity);
        let mut model = std::collections::VecDeque::new();

        for op in ops {
            match op {
                Op::Put(bytes) => {
                    let fits = bytes.len() <= capacity - model.len();
                    let result = buf.put_slice(&bytes);
                    prop_assert_eq!(result.is_ok(), fits);
                    if fits {
                        model.extend(bytes);
                    }
                }
                Op::Get(n) => {
                    let mut out = vec![0u8; n];
                    let result = buf.get_slice(&mut out);
                    if n <= model.len() {
                        prop_assert!(result.is_ok());
                        let expected: Vec<u8> = model.drain(..n).collect();
                        prop_assert_eq!(out, expected);
                    } else {
                        let underflow = matches!(result, Err(Error::BufferUnderflow { .. }));
                        prop_assert!(underflow);
                    }
                }
            }
            prop_assert_eq!(buf.remaining_can_get(), model.len());
            prop_assert_eq!(buf.remaining_can_put(), capacity - model.len());
        }
    }

    #[test]
    fn prop_round_trip_from_any_offset(
        capacity in 2usize..64,
        offset_seed in any::<usize>(),
        data in proptest::collection::vec(any::<u8>(), 1..64),
    ) {
        let offset = offset_seed % capacity;
        let data = &data[..data.len().min(capacity - 1)];
        let mut buf = rotated(capacity, offset);

        buf.put_slice(data).unwrap();
        let mut out = vec![0u8; data.len()];
        buf.get_slice(&mut out).unwrap();
        prop_assert_eq!(&out[..], data);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn prop_fill_to_exact_boundary(capacity in 1usize..64, offset_seed in any::<usize>()) {
        let mut buf = rotated(capacity, offset_seed % capacity);
        let free = buf.remaining_can_put();
        buf.put_slice(&vec![7u8; free]).unwrap();
        prop_assert!(buf.is_full());
        let overflow = matches!(buf.put_u8(1), Err(Error::BufferOverflow { .. }));
        prop_assert!(overflow);

        let mut out = vec![0u8; capacity];
        buf.get_slice(&mut out).unwrap();
        prop_assert!(buf.is_empty());
        let underflow = matches!(buf.get_u8(), Err(Error::BufferUnderflow { .. }));
        prop_assert!(underflow);
    }

    #[test]
    fn prop_fragments_cover_the_regions(
        capacity in 1usize..64,
        offset_seed in any::<usize>(),
        fill_seed in any::<usize>(),
    ) {
        let mut buf = rotated(capacity, offset_seed % capacity);
        let fill = fill_seed % (capacity + 1);
        buf.put_slice(&vec![1u8; fill]).unwrap();

        let readable = buf.readable_fragments();
        let writable = buf.writable_fragments();
        prop_assert_eq!(readable.total_len(), buf.remaining_can_get());
        prop_assert_eq!(writable.total_len(), capacity - buf.remaining_can_get());
        prop_assert!(readable.len() <= 2 && writable.len() <= 2);
        for fragment in readable.iter().chain(writable.iter()) {
            prop_assert!(fragment.len > 0);
            prop_assert!(fragment.offset + fragment.len <= capacity);
        }
    }

    #[test]
    fn prop_put_ring_transfers_in_order(
        src_offset in 0usize..16,
        dst_offset in 0usize..16,
        data in proptest::collection::vec(any::<u8>(), 0..16),
    ) {
        let mut src = rotated(16, src_offset);
        let mut dst = rotated(16, dst_offset);
        src.put_slice(&data).unwrap();

        dst.put_ring(&mut src, data.len()).unwrap();
        prop_assert!(src.is_empty());
        let mut out = vec![0u8; data.len()];
        dst.get_slice(&mut out).unwrap();
        prop_assert_eq!(out, data);
    }
}
