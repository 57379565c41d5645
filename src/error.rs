use std::{error, fmt};

/// Failures the allocator can report through its `Result`-returning surface.
///
/// The pointer-returning operations never unwind; they signal failure with a
/// null pointer instead. Only [`crate::TagAllocator::init`] surfaces one of
/// these values directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The initial arena padding could not be obtained, either because the
    /// address-space reservation failed or because the first extension did.
    InitFailed,
    /// The arena could not grow enough to satisfy an allocation request.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InitFailed => write!(f, "arena initialization failed"),
            AllocError::OutOfMemory => write!(f, "arena exhausted"),
        }
    }
}

impl error::Error for AllocError {}
