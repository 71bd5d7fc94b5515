#![cfg_attr(not(test), no_std)]

//! A first-fit memory allocator over a single heap grown with `sbrk`.
//!
//! The heap is one contiguous region that only ever grows. Free memory is
//! kept in a singly linked list sorted by address, threaded through the free
//! blocks themselves:
//!
//! - [`Heap::acquire`](allocators/struct.Heap.html#method.acquire) takes the
//!   first free block that is large enough, splitting off what it doesn't
//!   need, and grows the heap when nothing fits.
//! - [`Heap::release`](allocators/struct.Heap.html#method.release) puts a
//!   block back in address order.
//! - [`Heap::coalesce`](allocators/struct.Heap.html#method.coalesce) merges
//!   free blocks that touch in memory. Nothing else merges blocks.
//!
//! Each block carries an 8-byte header. Allocations are handed out as
//! [`Payload`](allocators/struct.Payload.html) handles, offsets into the heap
//! rather than raw pointers, and every access to heap memory is bounds
//! checked.
//!
//! ```
//! use brk_alloc::{Heap, ToyHeap};
//!
//! let mut heap = Heap::new(ToyHeap::default());
//! let p = heap.acquire(10).unwrap();
//! heap.payload_mut(p).unwrap()[..5].copy_from_slice(b"hello");
//! heap.release(p).unwrap();
//! heap.coalesce();
//! assert_eq!(heap.stats().1.length, 1);
//! ```

pub mod allocators;
pub mod blocklist;
pub mod error;

#[cfg(feature = "use_libc")]
pub use allocators::{SbrkError, SbrkHeapGrower};
pub use allocators::{Heap, HeapGrower, Payload, ToyHeap, GROWTH_SIZE};
pub use error::{HandleError, HeapError};
