use brk_alloc::allocators::{block_size, BlockInfo, Heap, Payload, ToyHeap};
use brk_alloc::blocklist::{BlockState, FreeBlock};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

fn validate(heap: &Heap<ToyHeap>, allocated_size: usize, freed_size: usize, live: &[Payload]) {
    let (validity, stats) = heap.stats();
    log::info!(
        "Allocated: {}, Freed: {}; heap_size: {}; Validity: {:?}, Stats: {:?}",
        allocated_size,
        freed_size,
        heap.heap_size(),
        validity,
        stats,
    );
    log::info!("Blocks: {}", heap);
    assert!(validity.is_valid());

    // Conservation
    assert_eq!(allocated_size - freed_size, heap.allocated());
    assert_eq!(heap.allocated(), heap.heap_size() - stats.size);

    // Every block is accounted for, in order, without gaps or overlaps
    let blocks: Vec<BlockInfo> = heap.walk().collect();
    let mut end = 0;
    for block in &blocks {
        assert_eq!(block.offset, end);
        assert_eq!(block.size % 8, 0);
        assert!(block.size >= 16);
        end += block.size;
    }
    assert_eq!(end, heap.heap_size());

    let free: Vec<FreeBlock> = blocks
        .iter()
        .filter(|b| b.state == BlockState::Free)
        .map(|b| FreeBlock {
            offset: b.offset,
            size: b.size,
        })
        .collect();
    assert_eq!(free, heap.free_blocks().collect::<Vec<_>>());

    let allocated = blocks
        .iter()
        .filter(|b| b.state == BlockState::Allocated)
        .count();
    assert_eq!(allocated, live.len());
}

#[test]
fn test_stress() {
    let mut heap = Heap::new(ToyHeap::default());

    // None means not allocated
    let mut slots: [Option<(Payload, usize, u8)>; 128] = [None; 128];
    let mut allocated_size: usize = 0;
    let mut freed_size: usize = 0;

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 16);

    for step in 0..1024 * 10 {
        let chosen = slots.choose_mut(&mut rng).unwrap();
        let current = *chosen;
        match current {
            None => {
                let requested = range.sample(&mut rng) * range.sample(&mut rng);
                let fill: u8 = rng.gen();
                log::info!("Acquiring {}", requested);
                let payload = heap.acquire(requested).unwrap();
                log::info!("  Acquired {:?}", payload);

                let bytes = heap.payload_mut(payload).unwrap();
                assert!(bytes.len() >= requested);
                for b in bytes[..requested].iter_mut() {
                    *b = fill;
                }

                *chosen = Some((payload, requested, fill));
                allocated_size += heap.payload(payload).unwrap().len() + 8;
                assert!(block_size(requested).unwrap() <= heap.payload(payload).unwrap().len() + 8);
            }
            Some((payload, requested, fill)) => {
                // Nobody else wrote over this allocation
                let bytes = heap.payload(payload).unwrap();
                assert!(bytes[..requested].iter().all(|&b| b == fill));
                let size = bytes.len() + 8;

                log::info!("Releasing {:?}", payload);
                heap.release(payload).unwrap();
                *chosen = None;
                freed_size += size;
            }
        }

        if step % 64 == 63 {
            heap.coalesce();
            assert!(heap.stats().0.is_coalesced());
        }

        // And validate that everything is ok
        let live: Vec<Payload> = slots.iter().flatten().map(|&(p, _, _)| p).collect();
        validate(&heap, allocated_size, freed_size, &live);
    }

    // Release everything; one coalesce folds the heap back into a single block
    for slot in slots.iter_mut() {
        if let Some((payload, _, _)) = slot.take() {
            let size = heap.payload(payload).unwrap().len() + 8;
            heap.release(payload).unwrap();
            freed_size += size;
        }
    }
    validate(&heap, allocated_size, freed_size, &[]);

    heap.coalesce();
    let (validity, stats) = heap.stats();
    assert!(validity.is_coalesced());
    assert_eq!(stats.length, 1);
    assert_eq!(stats.size, heap.heap_size());
    assert_eq!(heap.allocated(), 0);
}

#[test]
fn test_released_blocks_are_reused() {
    let mut heap = Heap::new(ToyHeap::default());

    let payloads: Vec<Payload> = (0..64).map(|_| heap.acquire(100).unwrap()).collect();
    let size = heap.heap_size();
    for &p in payloads.iter().rev() {
        heap.release(p).unwrap();
    }

    // The list is in address order no matter the release order
    let offsets: Vec<usize> = heap.free_blocks().map(|b| b.offset).collect();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    assert_eq!(offsets, sorted);

    // Without coalescing, same-sized requests fit the released blocks exactly
    for _ in 0..64 {
        heap.acquire(100).unwrap();
    }
    assert_eq!(heap.heap_size(), size);
}
