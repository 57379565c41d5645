use crate::block::{BlockPtr, Link};

/// Explicit list of free blocks, threaded through their payloads.
///
/// Only free blocks are tracked; allocated blocks live implicitly in the
/// arena's block sequence and rejoin this list when they are freed. The
/// list stores nothing for itself: both links sit in the first payload
/// bytes of the member blocks, so the allocator never has to allocate in
/// order to bookkeep, which would otherwise be circular.
///
/// ```text
///                 free_head
///                     |
///                     v
///               +----------+   next   +----------+   next
///               |   Free   | -------> |   Free   | -------> null
///       null <- |  Block   | <------- |  Block   |
///               +----------+   prev   +----------+
/// ```
///
/// The list is unordered: [`FreeList::push_front`] inserts at the head, so
/// recently freed blocks are reused first.
pub(crate) struct FreeList {
    head: Link,
}

/// Forward traversal over the free blocks.
///
/// Construction is cheap and safe; advancing reads link words out of the
/// arena, so the iterator must only be driven while the list invariants
/// hold and no block is concurrently mutated.
pub(crate) struct Iter {
    current: Link,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    #[inline]
    pub fn head(&self) -> Link {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Inserts `block` at the head of the list.
    ///
    /// **SAFETY**: `block` must be a valid free block inside the arena and
    /// must not already be a member of the list.
    pub unsafe fn push_front(&mut self, block: BlockPtr) {
        unsafe {
            block.set_next_free(self.head);
            if let Some(old_head) = self.head {
                old_head.set_prev_free(Some(block));
            }
            block.set_prev_free(None);
            self.head = Some(block);
        }
    }

    /// Unlinks `block` in O(1) using its own `prev`/`next` fields.
    ///
    /// Works for any position, including the head and a list that shrinks
    /// to empty.
    ///
    /// **SAFETY**: `block` must currently be a member of this list.
    pub unsafe fn remove(&mut self, block: BlockPtr) {
        unsafe {
            let next = block.next_free();
            let prev = block.prev_free();

            match prev {
                Some(prev) => prev.set_next_free(next),
                None => self.head = next,
            }

            if let Some(next) = next {
                next.set_prev_free(prev);
            }
        }
    }

    /// Number of blocks in the list. Walks the whole list.
    pub unsafe fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn iter(&self) -> Iter {
        Iter { current: self.head }
    }
}

impl Iterator for Iter {
    type Item = BlockPtr;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;

        unsafe {
            self.current = block.next_free();
        }

        Some(block)
    }
}
