//! Property tests for the record allocator: exclusivity, conservation,
//! round trips and the class-list ordering audit after long random runs.

use std::collections::HashSet;

use flowmem_core::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    /// Allocate `1 << exp` records.
    Alloc(u8),
    /// Free the live allocation at this position (modulo the live count).
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..4).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

fn backing(max_records: u32, max_contig: u16) -> Vec<u8> {
    vec![0u8; RecordAllocator::size_query(max_records, max_contig).unwrap()]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn live_allocations_never_overlap_and_usage_is_conserved(
        max_records in 1u32..200,
        contig_exp in 0u32..4,
        ops in proptest::collection::vec(op(), 1..300),
    ) {
        let max_contig = 1u16 << contig_exp;
        let mut memory = backing(max_records, max_contig);
        let mut allocator = RecordAllocator::open(&mut memory, max_records, max_contig).unwrap();
        let mut live: Vec<(u32, u16)> = Vec::new();
        let mut occupied: HashSet<u32> = HashSet::new();

        for op in ops {
            match op {
                Op::Alloc(exp) => {
                    let n = 1u16 << exp;
                    match allocator.alloc(n) {
                        Ok(allocation) => {
                            prop_assert_eq!(allocation.records, n);
                            prop_assert_eq!(allocation.offset % u32::from(n), 0);
                            prop_assert!(allocation.offset + u32::from(n) <= allocator.max_records());
                            for record in allocation.offset..allocation.offset + u32::from(n) {
                                prop_assert!(occupied.insert(record), "record {} handed out twice", record);
                            }
                            live.push((allocation.offset, n));
                        }
                        Err(err) if n > max_contig => {
                            prop_assert!(matches!(err, AllocError::OutOfRange { .. }), "unexpected {:?}", err);
                        }
                        Err(err) => prop_assert_eq!(err.kind(), ErrorKind::Exhaustion),
                    }
                }
                Op::Free(pick) if !live.is_empty() => {
                    let (offset, n) = live.swap_remove(pick % live.len());
                    allocator.free(offset, n).unwrap();
                    for record in offset..offset + u32::from(n) {
                        occupied.remove(&record);
                    }
                }
                Op::Free(_) => {}
            }

            let expected: u32 = live.iter().map(|&(_, n)| u32::from(n)).sum();
            prop_assert_eq!(allocator.records_in_use(), expected);
        }

        prop_assert!(allocator.verify().is_ok(), "{:?}", allocator.verify());
        for &(offset, n) in &live {
            prop_assert_eq!(allocator.entry_size_get(offset).map(|class| class.records()), Ok(n));
        }
    }

    #[test]
    fn class_lists_stay_ordered_after_long_runs(
        seed_ops in proptest::collection::vec(op(), 500..2000),
    ) {
        let mut memory = backing(512, 8);
        let mut allocator = RecordAllocator::open(&mut memory, 512, 8).unwrap();
        let mut live: Vec<(u32, u16)> = Vec::new();

        for (step, op) in seed_ops.into_iter().enumerate() {
            match op {
                Op::Alloc(exp) => {
                    if let Ok(allocation) = allocator.alloc(1 << exp) {
                        live.push((allocation.offset, allocation.records));
                    }
                }
                Op::Free(pick) if !live.is_empty() => {
                    let (offset, n) = live.swap_remove(pick % live.len());
                    allocator.free(offset, n).unwrap();
                }
                Op::Free(_) => {}
            }
            if step % 50 == 0 {
                prop_assert!(allocator.verify().is_ok(), "step {}: {:?}", step, allocator.verify());
            }
        }
        prop_assert!(allocator.verify().is_ok(), "{:?}", allocator.verify());
    }

    #[test]
    fn alloc_then_free_restores_usage(
        prefill in proptest::collection::vec(0u8..4, 0..40),
        exp in 0u8..4,
    ) {
        let mut memory = backing(256, 8);
        let mut allocator = RecordAllocator::open(&mut memory, 256, 8).unwrap();
        for exp in prefill {
            let _ = allocator.alloc(1 << exp);
        }
        let before = allocator.usage();
        let n = 1u16 << exp;
        if let Ok(allocation) = allocator.alloc(n) {
            prop_assert_eq!(allocator.free(allocation.offset, n), Ok(before.used));
            prop_assert_eq!(allocator.usage(), before);
            for record in allocation.offset..allocation.offset + u32::from(n) {
                prop_assert_eq!(allocator.entry_size_get(record), Err(AllocError::NotFound));
            }
        }
    }

    #[test]
    fn non_power_of_two_sizes_are_rejected(n in 0u16..64) {
        let mut memory = backing(64, 8);
        let mut allocator = RecordAllocator::open(&mut memory, 64, 8).unwrap();
        let valid = n.is_power_of_two() && n <= 8;
        let result = allocator.alloc(n);
        prop_assert_eq!(result.is_ok(), valid);
        if !valid {
            prop_assert!(matches!(result, Err(AllocError::OutOfRange { .. })), "unexpected {:?}", result);
            prop_assert_eq!(allocator.records_in_use(), 0);
        }
    }
}

#[test]
fn three_records_fail_validation() {
    let mut memory = backing(64, 8);
    let mut allocator = RecordAllocator::open(&mut memory, 64, 8).unwrap();
    let err = allocator.alloc(3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
