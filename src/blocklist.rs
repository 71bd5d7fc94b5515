//! The address-ordered free list.
//!
//! Every block in the heap begins with an 8-byte header holding the size of
//! the block (header included). While a block is free, the 8 bytes after the
//! header hold the offset of the next free block; once the block is handed
//! out, those same bytes are the first bytes of the caller's payload.
//!
//! Blocks are addressed by their offset into the heap's byte arena, and every
//! header or link access is a bounds-checked slice access.

use core::fmt;
use core::ops::Range;

use static_assertions::const_assert;

/// Bytes reserved at the start of every block for its size.
pub const HEADER_SIZE: usize = 8;

/// Bytes used by the forward link while a block is free.
pub const LINK_SIZE: usize = 8;

/// No block, free or allocated, is ever smaller than this.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + LINK_SIZE;

/// Every block size and block offset is a multiple of this.
pub const ALIGNMENT: usize = 8;

const WORD: usize = core::mem::size_of::<usize>();
const_assert!(WORD <= HEADER_SIZE);
const_assert!(WORD <= LINK_SIZE);
const_assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);

// Sizes are multiples of 8, so the low bit of the size word is free to tag
// blocks that are currently handed out.
const ALLOCATED_BIT: usize = 0b1;
const_assert!(ALLOCATED_BIT < ALIGNMENT);

// End-of-list marker stored in the link field.
const NIL: usize = usize::MAX;

fn read_word(mem: &[u8], at: usize) -> usize {
    let mut bytes = [0u8; WORD];
    bytes.copy_from_slice(&mem[at..at + WORD]);
    usize::from_ne_bytes(bytes)
}

fn write_word(mem: &mut [u8], at: usize, value: usize) {
    mem[at..at + WORD].copy_from_slice(&value.to_ne_bytes());
}

/// Whether a block is sitting in the free list or owned by a caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Allocated,
}

/// A decoded block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub size: usize,
    pub state: BlockState,
}

impl Header {
    pub const fn free(size: usize) -> Header {
        Header {
            size,
            state: BlockState::Free,
        }
    }

    pub const fn allocated(size: usize) -> Header {
        Header {
            size,
            state: BlockState::Allocated,
        }
    }

    /// Read the header of the block at `offset`.
    ///
    /// Panics if the header lies outside of `mem`.
    pub fn read(mem: &[u8], offset: usize) -> Header {
        let word = read_word(mem, offset);
        let state = if word & ALLOCATED_BIT == 0 {
            BlockState::Free
        } else {
            BlockState::Allocated
        };
        Header {
            size: word & !ALLOCATED_BIT,
            state,
        }
    }

    pub fn write(self, mem: &mut [u8], offset: usize) {
        let tag = match self.state {
            BlockState::Free => 0,
            BlockState::Allocated => ALLOCATED_BIT,
        };
        write_word(mem, offset, self.size | tag);
    }

    pub fn is_well_formed(&self) -> bool {
        self.size >= MIN_BLOCK_SIZE && self.size % ALIGNMENT == 0
    }
}

fn link(mem: &[u8], block: usize) -> Option<usize> {
    match read_word(mem, block + HEADER_SIZE) {
        NIL => None,
        next => Some(next),
    }
}

fn set_link(mem: &mut [u8], block: usize, next: Option<usize>) {
    write_word(mem, block + HEADER_SIZE, next.unwrap_or(NIL));
}

/// An enum for easy comparison of blocks and their order
enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A free block, as seen while walking the list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeBlock {
    /// Offset of the block header within the heap.
    pub offset: usize,
    /// Size of the block in bytes, header included.
    pub size: usize,
}

impl FreeBlock {
    /// Offset one past the last byte of this block.
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.size)
    }

    /// Get the offset range covered by this block.
    pub fn as_range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    /// Compare two blocks to see how they are ordered.
    fn relation(&self, other: &Self) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}

/// Where a request landed in the list: the chosen block, and the node linking
/// to it (`None` when the block is the head).
#[derive(Clone, Copy, Debug)]
pub(crate) struct Fit {
    pub previous: Option<usize>,
    pub block: FreeBlock,
}

/// Outcome of a first-fit search.
pub(crate) enum Search {
    Found(Fit),
    /// Nothing fit. `last` is the tail of the list, if there is one.
    Exhausted { last: Option<usize> },
}

/// A `BlockList` is a singly linked list of free blocks, threaded through the
/// heap memory itself. The list only stores its head; the links live in the
/// blocks.
///
/// It maintains a few internal invariants:
///
/// - Each block links to the next, with the last one linking to `NIL`.
/// - Each block has an offset < next.
/// - Every block is at least `MIN_BLOCK_SIZE` bytes and a multiple of
///   `ALIGNMENT`.
///
/// Unlike a list that merges on insertion, two blocks may sit next to each
/// other in memory until [`coalesce`](BlockList::coalesce) is called.
#[derive(Debug, Default)]
pub struct BlockList {
    first: Option<usize>,
}

pub struct BlockIter<'m> {
    mem: &'m [u8],
    next: Option<usize>,
}

impl<'m> Iterator for BlockIter<'m> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;
        let header = Header::read(self.mem, offset);
        self.next = link(self.mem, offset);

        Some(FreeBlock {
            offset,
            size: header.size,
        })
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Number of blocks overlapping other blocks.
    ///
    /// This likely indicates corruption.
    ///
    /// If there are also out of order blocks, this might undercount.
    pub overlaps: usize,

    /// Number of list neighbours that touch in memory and have not been
    /// coalesced yet. This is normal between calls to `coalesce`.
    pub adjacents: usize,

    /// Number of blocks that do not have an offset less than their next.
    ///
    /// This shouldn't occur.
    pub out_of_orders: usize,

    /// Number of blocks with a bad size, a bad offset, or an allocated tag.
    pub malformed: usize,
}

impl Validity {
    /// Returns a boolean - a simple check that the list is ordered and sane.
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.out_of_orders == 0 && self.malformed == 0
    }

    /// Valid, and no two list neighbours touch in memory.
    pub fn is_coalesced(&self) -> bool {
        self.is_valid() && self.adjacents == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Number of blocks in the list.
    pub length: usize,
    /// Total bytes across all blocks in the list.
    pub size: usize,
}

/// Renders a `BlockList` for logs.
pub struct Listing<'m> {
    list: &'m BlockList,
    mem: &'m [u8],
}

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self.list.iter(self.mem) {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "FreeBlock({:#x}, {})", block.offset, block.size)?;
        }

        write!(f, ")")
    }
}

impl BlockList {
    /// The first free block, if any.
    pub fn begin(&self) -> Option<usize> {
        self.first
    }

    /// The free block following `block`, if any.
    ///
    /// `block` should be a member of this list; an offset too close to the
    /// end of `mem` to hold a free block gives `None`.
    pub fn next(&self, mem: &[u8], block: usize) -> Option<usize> {
        if block.checked_add(MIN_BLOCK_SIZE)? > mem.len() {
            return None;
        }
        link(mem, block)
    }

    pub fn iter<'m>(&self, mem: &'m [u8]) -> BlockIter<'m> {
        BlockIter {
            mem,
            next: self.first,
        }
    }

    pub fn display<'m>(&'m self, mem: &'m [u8]) -> Listing<'m> {
        Listing { list: self, mem }
    }

    pub fn len(&self, mem: &[u8]) -> usize {
        self.iter(mem).count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Check current size of the list, and whether its valid.
    ///
    /// This never panics, even on a corrupt list: the walk stops at the
    /// first link pointing outside of `mem`, or once it has visited more
    /// blocks than could possibly fit.
    pub fn stats(&self, mem: &[u8]) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let limit = mem.len() / MIN_BLOCK_SIZE;
        let mut previous: Option<FreeBlock> = None;
        let mut cursor = self.first;
        while let Some(offset) = cursor {
            let in_bounds = offset
                .checked_add(MIN_BLOCK_SIZE)
                .map_or(false, |end| end <= mem.len());
            if offset % ALIGNMENT != 0 || !in_bounds {
                validity.malformed += 1;
                break;
            }

            let header = Header::read(mem, offset);
            let block = FreeBlock {
                offset,
                size: header.size,
            };
            if !header.is_well_formed()
                || header.state != BlockState::Free
                || block.end() > mem.len()
            {
                validity.malformed += 1;
            }

            match previous.map(|p| p.relation(&block)) {
                Some(Relation::Before) => {
                    // This is valid, do nothing.
                }
                Some(Relation::AdjacentBefore) => {
                    // Right order, waiting on a coalesce.
                    validity.adjacents += 1;
                }
                Some(Relation::Overlapping) => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) => {
                    // Wrong order, and touching.
                    validity.out_of_orders += 1;
                    validity.adjacents += 1;
                }
                Some(Relation::After) => {
                    // Wrong order.
                    validity.out_of_orders += 1;
                }
                None => {
                    // This is the first in the list. Valid, do nothing.
                }
            }

            stats.length += 1;
            stats.size += block.size;
            if stats.length > limit {
                // More blocks than fit in memory: the list loops.
                validity.out_of_orders += 1;
                break;
            }

            previous = Some(block);
            cursor = link(mem, offset);
        }

        (validity, stats)
    }

    /// Find the first block of at least `size` bytes.
    pub(crate) fn first_fit(&self, mem: &[u8], size: usize) -> Search {
        let mut previous = None;
        for block in self.iter(mem) {
            if block.size >= size {
                log::trace!(
                    "  First fit for {} bytes at {:#x}:{}",
                    size,
                    block.offset,
                    block.size
                );
                return Search::Found(Fit { previous, block });
            }
            previous = Some(block.offset);
        }

        Search::Exhausted { last: previous }
    }

    /// Find where a block at `offset` belongs: the last free block below it,
    /// and the first free block above it.
    pub(crate) fn insertion_point(
        &self,
        mem: &[u8],
        offset: usize,
    ) -> (Option<FreeBlock>, Option<FreeBlock>) {
        let mut previous = None;
        for block in self.iter(mem) {
            if block.offset > offset {
                return (previous, Some(block));
            }
            previous = Some(block);
        }

        (previous, None)
    }

    // Point `previous` (or the head, for `None`) at `target`.
    fn relink(&mut self, mem: &mut [u8], previous: Option<usize>, target: Option<usize>) {
        match previous {
            None => self.first = target,
            Some(p) => set_link(mem, p, target),
        }
    }

    /// Write a fresh free block and hang it off `last`, the current tail.
    ///
    /// The block must lie above every block already in the list.
    pub(crate) fn push_back(
        &mut self,
        mem: &mut [u8],
        last: Option<usize>,
        block: FreeBlock,
    ) -> Fit {
        Header::free(block.size).write(mem, block.offset);
        set_link(mem, block.offset, None);
        self.relink(mem, last, Some(block.offset));

        Fit {
            previous: last,
            block,
        }
    }

    /// Insert a block after `previous` (or at the head, for `None`),
    /// maintaining linked list invariants. No merging happens here.
    pub(crate) fn insert(&mut self, mem: &mut [u8], previous: Option<usize>, block: FreeBlock) {
        let successor = match previous {
            None => self.first,
            Some(p) => link(mem, p),
        };
        Header::free(block.size).write(mem, block.offset);
        set_link(mem, block.offset, successor);
        self.relink(mem, previous, Some(block.offset));
    }

    /// Take the lower `size` bytes of the block in `fit` out of the list.
    ///
    /// If the block is larger, the remainder becomes a free block in the same
    /// list position. The caller owns the taken bytes afterwards, including
    /// the header, which it must rewrite.
    ///
    /// Panics if the remainder would be smaller than `MIN_BLOCK_SIZE`.
    pub(crate) fn carve(&mut self, mem: &mut [u8], fit: Fit, size: usize) {
        let successor = link(mem, fit.block.offset);

        if fit.block.size == size {
            self.relink(mem, fit.previous, successor);
            return;
        }

        let remaining = fit.block.size - size;
        if remaining < MIN_BLOCK_SIZE {
            panic!(
                "Can't split {} bytes off of a block of size {} - need {} for the remainder",
                size, fit.block.size, MIN_BLOCK_SIZE,
            )
        }

        let remainder = fit.block.offset + size;
        log::trace!(
            "Splitting {} bytes off from {:#x}:{} leaving {:#x}:{}",
            size,
            fit.block.offset,
            fit.block.size,
            remainder,
            remaining,
        );
        Header::free(remaining).write(mem, remainder);
        set_link(mem, remainder, successor);
        self.relink(mem, fit.previous, Some(remainder));
    }

    /// Attempt to merge the block at `block` with the next.
    ///
    /// If the next block exists and starts exactly where this one ends, the
    /// two will merge and this will return true; otherwise, false.
    fn try_merge_next(mem: &mut [u8], block: usize) -> bool {
        let next = match link(mem, block) {
            None => return false,
            Some(n) => n,
        };
        let header = Header::read(mem, block);
        if block + header.size != next {
            return false;
        }

        let absorbed = Header::read(mem, next);
        let after = link(mem, next);
        Header::free(header.size + absorbed.size).write(mem, block);
        set_link(mem, block, after);

        true
    }

    /// Merge every run of free blocks that touch in memory.
    ///
    /// A merged block is examined again before moving on, so a run of any
    /// length collapses in a single pass. Returns the number of merges.
    pub fn coalesce(&mut self, mem: &mut [u8]) -> usize {
        let mut merges = 0;
        let mut cursor = self.first;
        while let Some(block) = cursor {
            if BlockList::try_merge_next(mem, block) {
                merges += 1;
                continue;
            }
            cursor = link(mem, block);
        }

        merges
    }
}
