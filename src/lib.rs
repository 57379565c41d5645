//! tagalloc is a dynamic memory allocator that serves requests from a single
//! contiguous arena which only ever grows upward. We reserve the address
//! space once and commit pages lazily, using:
//!
//! [`mmap`](https://man7.org/linux/man-pages/man2/mmap.2.html) +
//! [`mprotect`](https://man7.org/linux/man-pages/man2/mprotect.2.html) on Unix
//! [`VirtualAlloc`](https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc)
//! on Windows.
//!
//! The internal structure of the heap looks like this:
//!
//! ```text
//!                               free list head
//!                  +------------------------------------+
//!                  |                                     |
//! +---------+------|-----+-----------+      +-----------|-----------+
//! |         | +----v---+ | +-------+ |      | +-------+ | +-------+ |
//! | padding | |  Free  |-+-> Block | | ...  | | Block | +-> Free  | |
//! |         | +--------+ | +-------+ |      | +-------+ | +-------+ |
//! +---------+------------+-----------+      +-----------------------+
//! ```
//!
//! Every block brackets its payload between two *boundary tags*: a header
//! word and an identical footer word, each packing the block size with an
//! allocated flag. The footer lets any block locate its left neighbor in
//! constant time, which is what makes immediate coalescing cheap.
//!
//! Free blocks additionally thread a doubly-linked list through their (by
//! definition unused) payload bytes, so finding a block to reuse never
//! touches the allocated parts of the heap.
//!
//! The main optimizations which are implemented are:
//! - **Block splitting**: a large free block is cut in two so the leftover
//!   stays reusable instead of being wasted as padding
//! - **Block coalescing**: freed blocks merge with free neighbors on both
//!   sides, so fragmentation cannot accumulate between adjacent frees
//!
//! The main structure is [`TagAllocator`]; [`TagAlloc`] wraps it in a lock
//! so it can serve as `#[global_allocator]`. [`TagAllocator::audit`] walks
//! the whole heap and reports every broken invariant, which the tests lean
//! on heavily.


mod arena;
mod block;
mod check;
mod error;
mod freelist;
mod heap;
mod utils;


pub use check::Violation;
pub use error::AllocError;
pub use heap::{TagAlloc, TagAllocator};
