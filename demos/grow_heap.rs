//! This is a very minimal example to show a heap growing with sbrk.
//!
//! Run with `RUST_LOG=debug` to watch the heap grow and coalesce.

use brk_alloc::{Heap, SbrkHeapGrower};

fn main() {
    env_logger::init();

    let mut heap = Heap::new(SbrkHeapGrower::default());

    let small = heap.acquire(10).expect("growing the heap failed");
    heap.payload_mut(small).unwrap()[..5].copy_from_slice(b"hello");
    println!("Acquired {:?}; free list: {}", small, heap);

    // Larger than a page, so it gets a growth of its own
    let large = heap.acquire(10_000).expect("growing the heap failed");
    println!(
        "Acquired {:?}; heap is {} bytes after {} growths",
        large,
        heap.heap_size(),
        heap.growths()
    );

    heap.release(small).unwrap();
    heap.release(large).unwrap();
    println!("Released both; free list: {}", heap);

    let merges = heap.coalesce();
    let (validity, stats) = heap.stats();
    println!("Coalesced {} times; free list: {}", merges, heap);
    println!("    Stats: {:?}", stats);
    assert!(validity.is_coalesced());
}
