use std::{mem, ptr::NonNull};

/// Size of a single boundary tag (one header or one footer).
pub(crate) const WORD: usize = mem::size_of::<usize>();

/// Combined size of a header and a footer. Every block pays this overhead
/// on top of its payload.
pub(crate) const TAG_OVERHEAD: usize = 2 * WORD;

/// Alignment guarantee for every payload pointer handed to the caller, and
/// the granularity every block size is rounded to.
pub(crate) const ALIGNMENT: usize = 16;

/// Smallest representable block: header + footer around a payload just big
/// enough to hold the free-list links of [`Links`].
pub(crate) const MIN_BLOCK_SIZE: usize = TAG_OVERHEAD + mem::size_of::<Links>();

// The tag packing stores the allocated flag in the bits freed up by the
// size granularity, and the link overlay must fit the minimum payload.
const _: () = assert!(TAG_OVERHEAD == ALIGNMENT);
const _: () = assert!(MIN_BLOCK_SIZE == 2 * ALIGNMENT);
const _: () = assert!(mem::size_of::<Links>() == ALIGNMENT);

/// Nullable link between free blocks.
pub(crate) type Link = Option<BlockPtr>;

/// Overlay for the first 16 payload bytes of a *free* block: the explicit
/// free list threads its `next`/`prev` pointers through here. Allocated
/// blocks hand these bytes to the caller instead.
#[repr(C)]
pub(crate) struct Links {
    pub next: Link,
    pub prev: Link,
}

/// Handle to one block in the arena, pointing at its header word.
///
/// This is the structure of a block. A block carries no Rust-level fields;
/// everything lives in the arena bytes the handle points into:
///
/// ```text
/// +--------------------+
/// |  size | allocated  |  -> Header (one word)
/// +--------------------+ <--- payload(), the address given to the caller
/// |   next   |  prev   |  -> free blocks only: the Links overlay
/// |                    |
/// |      Payload       |
/// +--------------------+
/// |  size | allocated  |  -> Footer, an exact copy of the header
/// +--------------------+
/// ```
///
/// The footer lets a successor block find this block's header without any
/// out-of-band table, which is what makes constant-time coalescing work.
/// The footer is consulted for backward traversal only; every other read
/// goes through the header.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct BlockPtr {
    header: NonNull<usize>,
}

/// Extracts the block size from a raw tag word.
pub(crate) fn tag_size(tag: usize) -> usize {
    tag & !(ALIGNMENT - 1)
}

/// Extracts the allocated flag from a raw tag word.
pub(crate) fn tag_allocated(tag: usize) -> bool {
    tag & 0x1 == 0x1
}

impl BlockPtr {
    pub fn new(addr: NonNull<u8>) -> Self {
        Self { header: addr.cast() }
    }

    /// Recovers the block handle from a payload pointer previously handed
    /// to the caller.
    ///
    /// **SAFETY**: `payload` must be a non-null pointer returned by this
    /// allocator and not freed since.
    pub unsafe fn from_payload(payload: *mut u8) -> Self {
        unsafe { Self::new(NonNull::new_unchecked(payload.sub(WORD))) }
    }

    /// Address of the header word.
    pub fn addr(self) -> *mut u8 {
        self.header.as_ptr().cast()
    }

    /// Address handed to the caller: the first byte after the header.
    ///
    /// **SAFETY**: the handle must point into the arena.
    pub unsafe fn payload(self) -> *mut u8 {
        unsafe { self.addr().add(WORD) }
    }

    pub unsafe fn header_tag(self) -> usize {
        unsafe { self.header.as_ptr().read() }
    }

    /// Total block size in bytes, including both tags.
    pub unsafe fn size(self) -> usize {
        unsafe { tag_size(self.header_tag()) }
    }

    pub unsafe fn is_allocated(self) -> bool {
        unsafe { tag_allocated(self.header_tag()) }
    }

    /// Writes the header tag. The footer is *not* touched; callers follow
    /// up with [`BlockPtr::set_footer`] once the size is final.
    pub unsafe fn set_header(self, size: usize, allocated: bool) {
        unsafe { self.header.as_ptr().write(size | allocated as usize) }
    }

    /// Location of the footer word, derived from the current header.
    unsafe fn footer_ptr(self) -> *mut usize {
        unsafe { self.addr().add(self.size() - WORD).cast() }
    }

    /// Mirrors the header into the footer. Assumes the header has already
    /// been written.
    pub unsafe fn set_footer(self) {
        unsafe { self.footer_ptr().write(self.header_tag()) }
    }

    pub unsafe fn footer_tag(self) -> usize {
        unsafe { self.footer_ptr().read() }
    }

    /// The block starting where this one ends. The caller must check the
    /// result against the epilogue sentinel before reading its tags.
    pub unsafe fn next_in_heap(self) -> BlockPtr {
        unsafe { Self::new(NonNull::new_unchecked(self.addr().add(self.size()))) }
    }

    /// The word immediately before this block's header, read as the left
    /// neighbor's footer. Meaningless for the first block in the arena;
    /// callers guard with the prologue check first.
    pub unsafe fn left_footer_tag(self) -> usize {
        unsafe { self.addr().sub(WORD).cast::<usize>().read() }
    }

    /// The left neighbor, located through its footer.
    pub unsafe fn left_neighbor(self) -> BlockPtr {
        unsafe {
            let jump = tag_size(self.left_footer_tag());
            Self::new(NonNull::new_unchecked(self.addr().sub(jump)))
        }
    }

    unsafe fn links(self) -> *mut Links {
        unsafe { self.payload().cast() }
    }

    // Link accessors below assume the block is free: the overlay occupies
    // bytes an allocated block has handed to the caller.

    pub unsafe fn next_free(self) -> Link {
        unsafe { (*self.links()).next }
    }

    pub unsafe fn set_next_free(self, next: Link) {
        unsafe { (*self.links()).next = next }
    }

    pub unsafe fn prev_free(self) -> Link {
        unsafe { (*self.links()).prev }
    }

    pub unsafe fn set_prev_free(self, prev: Link) {
        unsafe { (*self.links()).prev = prev }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A little arena stand-in with the alignment real blocks have.
    #[repr(align(16))]
    struct Buffer([u8; 256]);

    fn block_at(buffer: &mut Buffer, offset: usize) -> BlockPtr {
        BlockPtr::new(NonNull::new(buffer.0[offset..].as_mut_ptr()).unwrap())
    }

    #[test]
    fn tag_packs_size_and_flag() {
        assert_eq!(48, tag_size(48 | 1));
        assert_eq!(48, tag_size(48));
        assert!(tag_allocated(48 | 1));
        assert!(!tag_allocated(48));
    }

    #[test]
    fn footer_mirrors_header() {
        let mut buffer = Buffer([0; 256]);
        let block = block_at(&mut buffer, 0);

        unsafe {
            block.set_header(64, true);
            block.set_footer();

            assert_eq!(64, block.size());
            assert!(block.is_allocated());
            assert_eq!(block.header_tag(), block.footer_tag());

            // The footer sits in the last word of the block.
            assert_eq!(64 | 1, usize::from_ne_bytes(buffer.0[56..64].try_into().unwrap()));
        }
    }

    #[test]
    fn payload_round_trips_through_from_payload() {
        let mut buffer = Buffer([0; 256]);
        let block = block_at(&mut buffer, 0);

        unsafe {
            block.set_header(32, true);
            let payload = block.payload();
            assert_eq!(WORD, payload as usize - block.addr() as usize);
            assert_eq!(block, BlockPtr::from_payload(payload));
        }
    }

    #[test]
    fn neighbors_are_found_through_tags() {
        let mut buffer = Buffer([0; 256]);
        let left = block_at(&mut buffer, 0);
        let right = block_at(&mut buffer, 48);

        unsafe {
            left.set_header(48, false);
            left.set_footer();
            right.set_header(32, true);
            right.set_footer();

            assert_eq!(right, left.next_in_heap());
            assert_eq!(left.header_tag(), right.left_footer_tag());
            assert_eq!(left, right.left_neighbor());
        }
    }

    #[test]
    fn links_live_in_the_payload() {
        let mut buffer = Buffer([0; 256]);
        let block = block_at(&mut buffer, 0);
        let other = block_at(&mut buffer, 64);

        unsafe {
            block.set_header(64, false);
            block.set_footer();

            block.set_next_free(Some(other));
            block.set_prev_free(None);

            assert_eq!(Some(other), block.next_free());
            assert_eq!(None, block.prev_free());

            // The links occupy the first payload bytes, not the tags.
            assert_eq!(64, block.size());
            assert_eq!(
                other.addr() as usize,
                usize::from_ne_bytes(buffer.0[8..16].try_into().unwrap())
            );
        }
    }
}
