//! Errors reported by the heap.

use crate::allocators::Payload;

/// Why a handle passed to `release` or to payload access was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("handle lies outside of the heap")]
    OutOfBounds,
    #[error("handle is not aligned to a block boundary")]
    Misaligned,
    #[error("block is not allocated")]
    NotAllocated,
    #[error("block header is corrupt")]
    Malformed,
    #[error("handle does not point at the start of a block")]
    NotABlock,
}

/// Errors from heap operations. `E` is the error type of the heap grower.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeapError<E> {
    /// Zero, or too large to describe as a block.
    #[error("invalid allocation size {requested}")]
    InvalidSize { requested: usize },

    /// The grower could not extend the heap.
    #[error("out of memory growing the heap by {size} bytes: {cause}")]
    OutOfMemory { size: usize, cause: E },

    #[error("invalid release of {offset:#x}")]
    InvalidRelease {
        offset: usize,
        #[source]
        reason: HandleError,
    },

    /// A payload was looked up through a handle the heap does not recognise.
    #[error("invalid handle {offset:#x}")]
    InvalidHandle {
        offset: usize,
        #[source]
        reason: HandleError,
    },

    /// The grower handed back memory that does not continue the heap.
    #[error("heap growth landed at {found:#x}, expected {expected:#x}")]
    Discontiguous { expected: usize, found: usize },
}

impl<E> HeapError<E> {
    pub(crate) fn invalid_release(payload: Payload, reason: HandleError) -> Self {
        HeapError::InvalidRelease {
            offset: payload.offset(),
            reason,
        }
    }

    pub(crate) fn invalid_handle(payload: Payload, reason: HandleError) -> Self {
        HeapError::InvalidHandle {
            offset: payload.offset(),
            reason,
        }
    }
}
