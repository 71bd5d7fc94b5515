//! Heap types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`Heap`](struct.Heap.html)
//!
//! A `Heap` is a single-threaded first-fit allocator over one contiguous,
//! growable region. It hands out [`Payload`](struct.Payload.html) handles,
//! takes them back in address order, and merges neighbouring free blocks when
//! asked to with [`coalesce`](struct.Heap.html#method.coalesce).
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls to
//! the OS to expand the heap.
//!
//! ### [`SbrkHeapGrower`](struct.SbrkHeapGrower.html)
//!
//! Grows the heap by moving the program break with `sbrk`. Requires the
//! `use_libc` feature.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a static array that can pretend to be a heap, and implements
//! `HeapGrower` for such a purpose. It is mainly useful for testing.

use core::fmt;
#[cfg(feature = "use_libc")]
use core::ptr::NonNull;

use crate::blocklist::{
    BlockIter, BlockList, BlockState, Fit, FreeBlock, Header, Search, Stats, Validity,
    ALIGNMENT, HEADER_SIZE, MIN_BLOCK_SIZE,
};
use crate::error::{HandleError, HeapError};

/// The heap grows by at least this many bytes at a time.
pub const GROWTH_SIZE: usize = 8192;

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> Option<usize> {
    Some(value.checked_add(increment - 1)? / increment * increment)
}

/// Calculate the size of the block needed to satisfy a request of
/// `requested` bytes: the request rounded up to `ALIGNMENT`, plus the header,
/// and never less than `MIN_BLOCK_SIZE`.
///
/// Returns `None` for zero, or for requests whose block would not fit in an
/// `isize`.
pub fn block_size(requested: usize) -> Option<usize> {
    if requested == 0 {
        return None;
    }
    let size = round_up(requested, ALIGNMENT)?.checked_add(HEADER_SIZE)?;
    if size > isize::MAX as usize {
        return None;
    }

    Some(size.max(MIN_BLOCK_SIZE))
}

pub trait HeapGrower {
    type Err: fmt::Debug + fmt::Display;

    /// Grow the heap by exactly `size` bytes, and return the offset of the new
    /// region within [`memory`](#tymethod.memory). The new region follows
    /// directly after all memory handed out before.
    fn grow_heap(&mut self, size: usize) -> Result<usize, Self::Err>;

    /// All memory obtained so far.
    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];
}

/// Size of the array backing a [`ToyHeap`](struct.ToyHeap.html).
pub const TOY_HEAP_SIZE: usize = 256 * 1024;

#[repr(C, align(16))]
struct Arena([u8; TOY_HEAP_SIZE]);

pub struct ToyHeap {
    /// The break may not be moved past this point.
    pub limit: usize,
    size: usize,
    heap: Arena,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            limit: TOY_HEAP_SIZE,
            size: 0,
            heap: Arena([0; TOY_HEAP_SIZE]),
        }
    }
}

impl ToyHeap {
    pub fn with_limit(limit: usize) -> Self {
        ToyHeap {
            limit: limit.min(TOY_HEAP_SIZE),
            ..Default::default()
        }
    }

    /// Current position of the break.
    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("toy heap exhausted: {requested} bytes requested, {available} available")]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    fn grow_heap(&mut self, size: usize) -> Result<usize, Self::Err> {
        let available = self.limit.min(TOY_HEAP_SIZE).saturating_sub(self.size);
        if size > available {
            return Err(ToyHeapOverflowError {
                requested: size,
                available,
            });
        }

        let offset = self.size;
        self.size += size;
        Ok(offset)
    }

    fn memory(&self) -> &[u8] {
        &self.heap.0[..self.size]
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.heap.0[..self.size]
    }
}

#[cfg(feature = "use_libc")]
#[derive(Debug, thiserror::Error)]
pub enum SbrkError {
    #[error("sbrk failed: {0}")]
    Os(errno::Errno),
    #[error("cannot move the break by {0} bytes")]
    TooLarge(usize),
    #[error("the program break was moved outside of this heap")]
    Discontiguous,
}

/// SbrkHeapGrower moves the program break to grow the heap upon request.
///
/// The region it manages starts at the first break it sees, rounded up to
/// `ALIGNMENT`. Memory is never handed back to the OS.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct SbrkHeapGrower {
    base: Option<NonNull<u8>>,
    size: usize,
    // Just for tracking, not really needed
    growths: usize,
}

#[cfg(feature = "use_libc")]
impl SbrkHeapGrower {
    pub fn growths(&self) -> usize {
        self.growths
    }
}

#[cfg(feature = "use_libc")]
fn sbrk(increment: usize) -> Result<*mut u8, SbrkError> {
    let delta =
        libc::intptr_t::try_from(increment).map_err(|_| SbrkError::TooLarge(increment))?;
    let previous = unsafe { libc::sbrk(delta) };
    if previous as isize == -1 {
        return Err(SbrkError::Os(errno::errno()));
    }

    Ok(previous as *mut u8)
}

#[cfg(feature = "use_libc")]
impl HeapGrower for SbrkHeapGrower {
    type Err = SbrkError;

    fn grow_heap(&mut self, size: usize) -> Result<usize, SbrkError> {
        let padding = match self.base {
            Some(_) => 0,
            None => (sbrk(0)? as usize).wrapping_neg() % ALIGNMENT,
        };
        let increment = size
            .checked_add(padding)
            .ok_or(SbrkError::TooLarge(size))?;
        let previous = sbrk(increment)?;

        let start = match self.base {
            None => {
                let start = previous.wrapping_add(padding);
                self.base = NonNull::new(start);
                start
            }
            Some(base) => {
                let end = base.as_ptr().wrapping_add(self.size);
                if previous != end {
                    return Err(SbrkError::Discontiguous);
                }
                end
            }
        };

        // The bytes past the old break are ours alone now; zero them so the
        // region can be viewed as initialized memory.
        unsafe { core::ptr::write_bytes(start, 0, size) };

        let offset = self.size;
        self.size += size;
        self.growths += 1;
        Ok(offset)
    }

    fn memory(&self) -> &[u8] {
        match self.base {
            // The region base..base+size was obtained from sbrk by this grower
            // and is never released.
            Some(base) => unsafe { core::slice::from_raw_parts(base.as_ptr(), self.size) },
            None => &[],
        }
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        match self.base {
            Some(base) => unsafe { core::slice::from_raw_parts_mut(base.as_ptr(), self.size) },
            None => &mut [],
        }
    }
}

/// A handle to an allocation: the offset of its first usable byte within the
/// heap. It sits `HEADER_SIZE` bytes past the start of the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload(usize);

impl Payload {
    /// Build a handle from a raw offset. Handles not produced by
    /// [`Heap::acquire`](struct.Heap.html#method.acquire) are rejected by
    /// the heap.
    pub const fn from_offset(offset: usize) -> Payload {
        Payload(offset)
    }

    pub const fn offset(self) -> usize {
        self.0
    }
}

/// A block found while walking the whole heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: usize,
    pub size: usize,
    pub state: BlockState,
}

/// Walks every block in the heap, free or allocated, in address order.
pub struct Walk<'m> {
    mem: &'m [u8],
    offset: usize,
}

impl Iterator for Walk<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.offset.checked_add(MIN_BLOCK_SIZE)? > self.mem.len() {
            return None;
        }

        let header = Header::read(self.mem, self.offset);
        if !header.is_well_formed() || header.size > self.mem.len() - self.offset {
            // Corrupt header; there is no way to find the next block.
            self.offset = self.mem.len();
            return None;
        }

        let info = BlockInfo {
            offset: self.offset,
            size: header.size,
            state: header.state,
        };
        self.offset += header.size;
        Some(info)
    }
}

// Locate the allocated block behind `payload`. Its header must be tagged
// allocated, and its base must be a real block boundary: free blocks are known
// boundaries, so the tiled heap is walked up from the nearest one below.
fn allocated_block(
    mem: &[u8],
    blocks: &BlockList,
    payload: Payload,
) -> Result<FreeBlock, HandleError> {
    let offset = payload
        .offset()
        .checked_sub(HEADER_SIZE)
        .ok_or(HandleError::OutOfBounds)?;
    if offset % ALIGNMENT != 0 {
        return Err(HandleError::Misaligned);
    }
    let in_bounds = offset
        .checked_add(MIN_BLOCK_SIZE)
        .map_or(false, |end| end <= mem.len());
    if !in_bounds {
        return Err(HandleError::OutOfBounds);
    }

    let header = Header::read(mem, offset);
    if header.state != BlockState::Allocated {
        return Err(HandleError::NotAllocated);
    }
    if !header.is_well_formed() || header.size > mem.len() - offset {
        return Err(HandleError::Malformed);
    }

    let (previous, _) = blocks.insertion_point(mem, offset);
    let walk = Walk {
        mem,
        offset: previous.map_or(0, |p| p.offset),
    };
    let is_boundary = walk
        .take_while(|b| b.offset <= offset)
        .any(|b| b.offset == offset);
    if !is_boundary {
        return Err(HandleError::NotABlock);
    }

    Ok(FreeBlock {
        offset,
        size: header.size,
    })
}

/// A first-fit heap, capable of growing itself, handing out payloads, and
/// tracking and reusing released memory.
///
/// Note: It never returns memory to the OS; that is not implemented.
pub struct Heap<G> {
    pub grower: G,
    blocks: BlockList,
    growth_size: usize,
    // Bytes obtained from the grower
    grown: usize,
    // Bytes in blocks currently handed out
    allocated: usize,
    growths: usize,
}

impl<G: HeapGrower + Default> Default for Heap<G> {
    fn default() -> Self {
        Heap::new(G::default())
    }
}

impl<G: HeapGrower> Heap<G> {
    /// Create a new `Heap`, growing by `GROWTH_SIZE` bytes at a time.
    pub fn new(grower: G) -> Self {
        Heap {
            grower,
            blocks: BlockList::default(),
            growth_size: GROWTH_SIZE,
            grown: 0,
            allocated: 0,
            growths: 0,
        }
    }

    /// Grow by at least `growth_size` bytes at a time from now on. The size
    /// must be a multiple of `ALIGNMENT` and at least `MIN_BLOCK_SIZE`.
    pub fn set_growth_size(&mut self, growth_size: usize) -> Result<(), HeapError<G::Err>> {
        if growth_size < MIN_BLOCK_SIZE || growth_size % ALIGNMENT != 0 {
            return Err(HeapError::InvalidSize {
                requested: growth_size,
            });
        }

        self.growth_size = growth_size;
        Ok(())
    }

    pub fn growth_size(&self) -> usize {
        self.growth_size
    }

    fn arena(&self) -> &[u8] {
        &self.grower.memory()[..self.grown]
    }

    /// Total bytes obtained from the grower.
    pub fn heap_size(&self) -> usize {
        self.grown
    }

    /// Total bytes in blocks currently handed out, headers included.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Number of times the heap has grown.
    pub fn growths(&self) -> usize {
        self.growths
    }

    /// Offset of the first free block.
    pub fn begin(&self) -> Option<usize> {
        self.blocks.begin()
    }

    /// Offset of the free block after `block`, which must be a free block
    /// obtained from [`begin`](#method.begin) or `next`.
    pub fn next(&self, block: usize) -> Option<usize> {
        self.blocks.next(self.arena(), block)
    }

    /// Iterate over the free list.
    pub fn free_blocks(&self) -> BlockIter<'_> {
        self.blocks.iter(self.arena())
    }

    /// Iterate over every block in the heap.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            mem: self.arena(),
            offset: 0,
        }
    }

    /// Get statistics on the free list, and verify its validity.
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats(self.arena())
    }

    /// Hand out a block with room for at least `requested` bytes.
    ///
    /// The free list is searched first-fit, and the heap grows when nothing
    /// fits. The returned payload is aligned to `ALIGNMENT`.
    pub fn acquire(&mut self, requested: usize) -> Result<Payload, HeapError<G::Err>> {
        let mut size = match block_size(requested) {
            Some(size) => size,
            None => {
                log::debug!("Rejecting allocation of {} bytes", requested);
                return Err(HeapError::InvalidSize { requested });
            }
        };
        log::trace!("Acquiring {} bytes as a {}-byte block", requested, size);

        let fit = match self.blocks.first_fit(self.arena(), size) {
            Search::Found(fit) => fit,
            Search::Exhausted { last } => self.grow(size, last)?,
        };

        // A leftover of HEADER_SIZE bytes is too small to be a block; hand it
        // to the caller instead.
        if fit.block.size - size == HEADER_SIZE {
            size += HEADER_SIZE;
        }

        let mem = &mut self.grower.memory_mut()[..self.grown];
        self.blocks.carve(mem, fit, size);
        Header::allocated(size).write(mem, fit.block.offset);
        self.allocated += size;

        Ok(Payload(fit.block.offset + HEADER_SIZE))
    }

    // Grow the heap to fit a block of `size` bytes, and append the new memory
    // to the free list after `last`.
    fn grow(&mut self, size: usize, last: Option<usize>) -> Result<Fit, HeapError<G::Err>> {
        let amount = size.max(self.growth_size);
        let offset = match self.grower.grow_heap(amount) {
            Ok(offset) => offset,
            Err(cause) => {
                log::debug!("Failed to grow heap by {} bytes: {}", amount, cause);
                return Err(HeapError::OutOfMemory {
                    size: amount,
                    cause,
                });
            }
        };
        if offset != self.grown {
            log::debug!(
                "Heap growth landed at {:#x}, expected {:#x}",
                offset,
                self.grown
            );
            return Err(HeapError::Discontiguous {
                expected: self.grown,
                found: offset,
            });
        }

        self.grown += amount;
        self.growths += 1;
        log::debug!("Grew heap by {} bytes at {:#x}", amount, offset);

        let mem = &mut self.grower.memory_mut()[..self.grown];
        Ok(self.blocks.push_back(
            mem,
            last,
            FreeBlock {
                offset,
                size: amount,
            },
        ))
    }

    /// Return a block to the free list, in address order.
    ///
    /// Neighbouring free blocks are not merged; see
    /// [`coalesce`](#method.coalesce). Handles that were not handed out by
    /// this heap, or were already released, are rejected and leave the heap
    /// untouched.
    pub fn release(&mut self, payload: Payload) -> Result<(), HeapError<G::Err>> {
        let mem = &mut self.grower.memory_mut()[..self.grown];

        let block = match allocated_block(mem, &self.blocks, payload) {
            Ok(block) => block,
            Err(reason) => {
                log::debug!("Rejecting release of {:#x}: {}", payload.offset(), reason);
                return Err(HeapError::invalid_release(payload, reason));
            }
        };

        let (previous, _) = self.blocks.insertion_point(mem, block.offset);
        log::trace!("Releasing {:#x}:{}", block.offset, block.size);
        self.blocks.insert(mem, previous.map(|p| p.offset), block);
        self.allocated -= block.size;

        Ok(())
    }

    /// Merge every run of free blocks that touch in memory. Returns the number
    /// of merges.
    pub fn coalesce(&mut self) -> usize {
        let mem = &mut self.grower.memory_mut()[..self.grown];
        let merges = self.blocks.coalesce(mem);
        log::debug!("Coalesced {} free blocks", merges);
        merges
    }

    /// The usable bytes of an allocation.
    pub fn payload(&self, payload: Payload) -> Result<&[u8], HeapError<G::Err>> {
        let mem = self.arena();
        let block = allocated_block(mem, &self.blocks, payload)
            .map_err(|reason| HeapError::invalid_handle(payload, reason))?;
        Ok(&mem[payload.offset()..block.end()])
    }

    pub fn payload_mut(&mut self, payload: Payload) -> Result<&mut [u8], HeapError<G::Err>> {
        let mem = &mut self.grower.memory_mut()[..self.grown];
        let block = allocated_block(mem, &self.blocks, payload)
            .map_err(|reason| HeapError::invalid_handle(payload, reason))?;
        Ok(&mut mem[payload.offset()..block.end()])
    }
}

impl<G: HeapGrower> fmt::Display for Heap<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.blocks.display(self.arena()))
    }
}
