use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{
    arena::{Arena, DEFAULT_CAPACITY},
    block::{BlockPtr, ALIGNMENT, TAG_OVERHEAD, WORD},
    error::AllocError,
    freelist::FreeList,
    utils::round_up,
};

/// The allocator core: one growable arena, two sentinels and an explicit
/// free list.
///
/// Blocks are placed first-fit: the free list is scanned from its head and
/// the first block large enough wins, split when the leftover is big enough
/// to stand on its own. Freed blocks are coalesced with both neighbors
/// immediately, using the boundary tags to find them, so the arena never
/// holds two adjacent free blocks.
///
/// ```text
///    lo                                                              hi
///    |                                                                |
///    +---------+----------+----------------+----------------+--------+
///    | padding | prologue |     Block      |      Block     |  ...   |
///    +---------+----------+----------------+----------------+--------+
///         8b        ^                                                ^
///                   |                                                |
///               heap_first                                   heap_last (one
///                                                        past the last block)
/// ```
///
/// `heap_first` and `heap_last` are positions, not blocks: their tags are
/// never read. The 8 bytes of leading padding put every block header 8 bytes
/// above a 16-byte boundary, which is exactly what lands the payloads *on*
/// 16-byte boundaries.
///
/// All operations take `&mut self`; see [`TagAlloc`] for the lock-protected
/// handle that can serve as the global allocator.
pub struct TagAllocator {
    pub(crate) arena: Option<Arena>,
    capacity: usize,
    pub(crate) heap_first: Option<BlockPtr>,
    pub(crate) heap_last: Option<BlockPtr>,
    pub(crate) free: FreeList,
}

// The raw block handles inside are only reachable through &mut self, and
// the arena they point into moves with the allocator.
unsafe impl Send for TagAllocator {}

impl TagAllocator {
    /// Creates an allocator that will reserve 1 GiB of address space on
    /// first use. No syscall happens here.
    pub const fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Same as [`TagAllocator::new`] with an explicit growth limit.
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            arena: None,
            capacity,
            heap_first: None,
            heap_last: None,
            free: FreeList::new(),
        }
    }

    /// Lays out a fresh, empty heap.
    ///
    /// Reserves the arena on first call; later calls rewind the same arena,
    /// which logically releases every prior allocation. The arena is padded
    /// with `2 * 16 + 8` bytes so that the prologue marker sits 8 bytes
    /// above the base and every payload lands on a 16-byte boundary.
    pub fn init(&mut self) -> Result<(), AllocError> {
        if self.arena.is_none() {
            self.arena = Some(Arena::reserve(self.capacity)?);
        }
        let Some(arena) = self.arena.as_mut() else {
            return Err(AllocError::InitFailed);
        };

        arena.reset();
        self.free = FreeList::new();
        self.heap_first = None;
        self.heap_last = None;

        unsafe {
            if arena.extend(2 * TAG_OVERHEAD + WORD).is_none() {
                return Err(AllocError::InitFailed);
            }

            let first = NonNull::new_unchecked(arena.lo().add(WORD));
            let last = NonNull::new_unchecked(arena.hi().sub(TAG_OVERHEAD - 1));
            self.heap_first = Some(BlockPtr::new(first));
            self.heap_last = Some(BlockPtr::new(last));
        }

        Ok(())
    }

    /// Bytes of arena the heap has grown into so far.
    pub fn heap_size(&self) -> usize {
        self.arena.as_ref().map_or(0, Arena::len)
    }

    fn ensure_init(&mut self) -> bool {
        self.heap_first.is_some() || self.init().is_ok()
    }

    /// Grows the arena by `size` bytes and carves an allocated block out of
    /// the new space, at the position the epilogue used to mark.
    unsafe fn create_space(&mut self, size: usize) -> Option<BlockPtr> {
        unsafe {
            let arena = self.arena.as_mut()?;
            arena.extend(size)?;

            let block = self.heap_last?;
            block.set_header(size, true);
            block.set_footer();
            self.heap_last = Some(block.next_in_heap());

            Some(block)
        }
    }

    /// Carves an allocated block of `size` bytes off the front of the free
    /// block `block`, returning the leftover to the free list.
    ///
    /// ```text
    ///  +--------------------------------+       +----------+---------------+
    ///  |                                | split |          |               |
    ///  |           Free block           | ----> | size, A  |    Free       |
    ///  |                                |       |          |               |
    ///  +--------------------------------+       +----------+---------------+
    /// ```
    ///
    /// Callers guarantee the leftover is at least a minimum block.
    unsafe fn split(&mut self, block: BlockPtr, size: usize) -> BlockPtr {
        unsafe {
            self.free.remove(block);

            let old_size = block.size();
            block.set_header(size, true);
            block.set_footer();

            let leftover = block.next_in_heap();
            leftover.set_header(old_size - size, false);
            leftover.set_footer();
            self.free.push_front(leftover);

            block
        }
    }

    /// First-fit search over the free list for a block of at least `size`
    /// total bytes. Splits when the candidate leaves room for a whole
    /// minimum block on top of the request; otherwise hands the candidate
    /// over as-is.
    unsafe fn find_fit(&mut self, size: usize) -> Option<BlockPtr> {
        unsafe {
            let mut current = self.free.head();

            while let Some(block) = current {
                let block_size = block.size();

                if block_size >= 2 * TAG_OVERHEAD + size {
                    return Some(self.split(block, size));
                }
                if block_size >= size {
                    self.free.remove(block);
                    block.set_header(block_size, true);
                    block.set_footer();
                    return Some(block);
                }

                current = block.next_free();
            }

            None
        }
    }

    /// Allocates `size` bytes and returns a 16-byte aligned pointer to
    /// them, or null when the arena cannot grow any further.
    ///
    /// `malloc(0)` returns null; that is the size-zero sentinel, not a
    /// failure.
    ///
    /// **SAFETY**: the returned memory is valid until it is passed to
    /// [`TagAllocator::free`] or the allocator is re-initialized.
    pub unsafe fn malloc(&mut self, size: usize) -> *mut u8 {
        if !self.ensure_init() {
            return ptr::null_mut();
        }
        if size == 0 {
            return ptr::null_mut();
        }
        // Requests the arena could never hold must fail before the size
        // rounding below, which would wrap on them.
        if size > self.capacity {
            return ptr::null_mut();
        }

        // Tag overhead plus the payload rounded up to block granularity.
        // The smallest request already yields the 32-byte block minimum.
        let adjusted = TAG_OVERHEAD + round_up(size, ALIGNMENT);

        unsafe {
            let block = match self.find_fit(adjusted) {
                Some(block) => block,
                None => match self.create_space(adjusted) {
                    Some(block) => block,
                    None => return ptr::null_mut(),
                },
            };

            block.payload()
        }
    }

    /// Merges `block` with its left neighbor if that neighbor exists and is
    /// free. Returns the handle of the block that now covers `block`'s
    /// bytes, which is the left neighbor after a merge.
    unsafe fn coalesce_left(&mut self, block: BlockPtr) -> BlockPtr {
        unsafe {
            let Some(first) = self.heap_first else {
                return block;
            };

            // The word before our header is the left neighbor's footer,
            // unless this is the first block and that word is the prologue.
            if block.addr().sub(WORD) == first.addr().add(WORD) {
                return block;
            }

            let left = block.left_neighbor();
            if left.is_allocated() {
                return block;
            }

            self.free.remove(block);
            self.free.remove(left);

            let merged_size = left.size() + block.size();
            left.set_header(merged_size, false);
            left.set_footer();
            self.free.push_front(left);

            left
        }
    }

    /// Merges the freshly freed `block` with both neighbors where possible.
    ///
    /// The right merge is expressed as a second left-merge, launched from
    /// the right neighbor's position; at that point `block` *is* the left
    /// neighbor. The order matters: merging left first means the right
    /// merge sees the final, already-widened block.
    unsafe fn coalesce(&mut self, block: BlockPtr) {
        unsafe {
            let block = self.coalesce_left(block);

            let Some(last) = self.heap_last else {
                return;
            };
            let right = block.next_in_heap();
            if right != last && !right.is_allocated() {
                self.coalesce_left(right);
            }
        }
    }

    /// Releases the allocation behind `ptr` back to the free list and
    /// coalesces it with its neighbors. `free(null)` is a no-op.
    ///
    /// **SAFETY**: `ptr` must be null or a pointer previously returned by
    /// this allocator and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if !self.ensure_init() {
            return;
        }
        if ptr.is_null() {
            return;
        }

        unsafe {
            let block = BlockPtr::from_payload(ptr);
            block.set_header(block.size(), false);
            block.set_footer();
            self.free.push_front(block);
            self.coalesce(block);
        }
    }

    /// Resizes the allocation behind `ptr` by allocating, copying the
    /// common prefix and freeing the old block. No in-place growth is
    /// attempted.
    ///
    /// `realloc(null, size)` behaves as `malloc(size)`; `realloc(ptr, 0)`
    /// frees and returns null. On failure the original allocation is left
    /// untouched and null is returned.
    ///
    /// **SAFETY**: same contract as [`TagAllocator::free`] for `ptr`.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe {
            if size == 0 {
                self.free(ptr);
                return ptr::null_mut();
            }
            if ptr.is_null() {
                return self.malloc(size);
            }

            let new_ptr = self.malloc(size);
            if new_ptr.is_null() {
                return ptr::null_mut();
            }

            let old_payload_size = BlockPtr::from_payload(ptr).size() - TAG_OVERHEAD;
            ptr::copy_nonoverlapping(ptr, new_ptr, old_payload_size.min(size));
            self.free(ptr);

            new_ptr
        }
    }

    /// Allocates `nmemb * size` zeroed bytes. Returns null when the product
    /// overflows or the arena cannot grow.
    pub unsafe fn calloc(&mut self, nmemb: usize, size: usize) -> *mut u8 {
        let Some(total) = nmemb.checked_mul(size) else {
            return ptr::null_mut();
        };

        unsafe {
            let new_ptr = self.malloc(total);
            if !new_ptr.is_null() {
                ptr::write_bytes(new_ptr, 0, total);
            }

            new_ptr
        }
    }
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-protected allocator handle, usable as `#[global_allocator]`.
///
/// The core in [`TagAllocator`] is strictly single-threaded; this wrapper
/// adds the external mutual exclusion it requires. Note that the lock is
/// held across the entire first-fit search, which is linear in the number
/// of free blocks, not O(1).
///
/// Payloads are 16-byte aligned; layouts requesting more than that are
/// refused with null.
pub struct TagAlloc {
    inner: spin::Mutex<TagAllocator>,
}

impl TagAlloc {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(TagAllocator::new()),
        }
    }

    /// See [`TagAllocator::init`].
    pub fn init(&self) -> Result<(), AllocError> {
        self.inner.lock().init()
    }

    /// See [`TagAllocator::malloc`].
    pub unsafe fn malloc(&self, size: usize) -> *mut u8 {
        unsafe { self.inner.lock().malloc(size) }
    }

    /// See [`TagAllocator::free`].
    pub unsafe fn free(&self, ptr: *mut u8) {
        unsafe { self.inner.lock().free(ptr) }
    }

    /// See [`TagAllocator::realloc`].
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe { self.inner.lock().realloc(ptr, size) }
    }

    /// See [`TagAllocator::calloc`].
    pub unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut u8 {
        unsafe { self.inner.lock().calloc(nmemb, size) }
    }

    /// Walks the heap and prints every invariant violation to stderr,
    /// tagged with `line`. Streams the report instead of collecting it, so
    /// it is safe to call even while this instance is the global allocator.
    pub fn check(&self, line: i32) {
        self.inner.lock().check(line);
    }
}

impl Default for TagAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for TagAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        // GlobalAlloc forbids the null sentinel for zero-size layouts.
        unsafe { self.inner.lock().malloc(layout.size().max(1)) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.inner.lock().free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        unsafe { self.inner.lock().realloc(ptr, new_size.max(1)) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        unsafe { self.inner.lock().calloc(1, layout.size().max(1)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MIN_BLOCK_SIZE;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn heap() -> TagAllocator {
        TagAllocator::with_capacity(1 << 20)
    }

    /// Sizes of the free blocks, in list order (most recently freed first).
    fn free_sizes(heap: &TagAllocator) -> Vec<usize> {
        unsafe { heap.free.iter().map(|block| block.size()).collect() }
    }

    fn assert_clean(heap: &TagAllocator) {
        let violations = heap.audit();
        assert!(violations.is_empty(), "heap audit failed: {violations:?}");
    }

    #[test]
    fn malloc_zero_returns_null() {
        let mut heap = heap();
        unsafe {
            assert!(heap.malloc(0).is_null());
        }
        assert_clean(&heap);
    }

    #[test]
    fn free_null_is_a_noop() {
        let mut heap = heap();
        unsafe {
            heap.free(ptr::null_mut());
        }
        assert_clean(&heap);
    }

    #[test]
    fn payloads_are_16_byte_aligned() {
        let mut heap = heap();

        unsafe {
            for size in [1, 7, 8, 15, 16, 17, 48, 100, 4096] {
                let ptr = heap.malloc(size);
                assert!(!ptr.is_null());
                assert_eq!(0, ptr as usize % 16, "size {size} broke alignment");
            }
        }
        assert_clean(&heap);
    }

    #[test]
    fn first_malloc_grows_the_arena() {
        let mut heap = heap();

        heap.init().unwrap();
        assert_eq!(40, heap.heap_size());

        unsafe {
            assert!(!heap.malloc(1).is_null());
        }
        // One minimum block on top of the initial padding.
        assert_eq!(40 + MIN_BLOCK_SIZE, heap.heap_size());
        assert_clean(&heap);
    }

    #[test]
    fn split_and_coalesce() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(48);
            let q = heap.malloc(48);
            assert!(!p.is_null() && !q.is_null());

            heap.free(p);
            assert_eq!(vec![64], free_sizes(&heap));

            heap.free(q);
        }

        // Both 64-byte blocks merged into a single 128-byte one.
        assert_eq!(vec![128], free_sizes(&heap));
        assert_clean(&heap);
    }

    #[test]
    fn fit_without_split_takes_the_whole_block() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(16);
            let separator = heap.malloc(16);
            let q = heap.malloc(32);

            heap.free(p);
            heap.free(q);
            assert_eq!(2, free_sizes(&heap).len());

            // 48 bytes fit q's old block without leaving room to split:
            // the whole block comes back, and the list shrinks by one.
            let r = heap.malloc(16);
            assert_eq!(q, r);
            assert_eq!(1, free_sizes(&heap).len());

            heap.free(separator);
            heap.free(r);
        }
        assert_clean(&heap);
    }

    #[test]
    fn adjacent_frees_all_merge() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(16);
            let q = heap.malloc(16);
            let r = heap.malloc(16);
            assert!(!p.is_null() && !q.is_null() && !r.is_null());

            heap.free(p);
            heap.free(q);
            heap.free(r);
        }

        // Three adjacent 32-byte blocks collapse into one.
        assert_eq!(vec![96], free_sizes(&heap));
        assert_clean(&heap);
    }

    #[test]
    fn realloc_grows_and_preserves_content() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(16);
            ptr::write_bytes(p, 0xAA, 16);

            let q = heap.realloc(p, 64);
            assert!(!q.is_null());
            assert_ne!(p, q);

            for i in 0..16 {
                assert_eq!(0xAA, q.add(i).read());
            }
        }
        assert_clean(&heap);
    }

    #[test]
    fn realloc_shrink_copies_the_prefix() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(64);
            for i in 0..64 {
                p.add(i).write(i as u8);
            }

            let q = heap.realloc(p, 16);
            assert!(!q.is_null());
            for i in 0..16 {
                assert_eq!(i as u8, q.add(i).read());
            }
        }
        assert_clean(&heap);
    }

    #[test]
    fn realloc_null_acts_as_malloc() {
        let mut heap = heap();

        unsafe {
            let p = heap.realloc(ptr::null_mut(), 32);
            assert!(!p.is_null());
            assert_eq!(0, p as usize % 16);
        }
        assert_clean(&heap);
    }

    #[test]
    fn realloc_to_zero_frees() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(32);
            assert!(free_sizes(&heap).is_empty());

            let q = heap.realloc(p, 0);
            assert!(q.is_null());
            assert_eq!(1, free_sizes(&heap).len());
        }
        assert_clean(&heap);
    }

    #[test]
    fn calloc_zeroes_and_aligns() {
        let mut heap = heap();

        unsafe {
            let p = heap.calloc(10, 8);
            assert!(!p.is_null());
            assert_eq!(0, p as usize % 16);

            for i in 0..80 {
                assert_eq!(0, p.add(i).read());
            }
        }
        assert_clean(&heap);
    }

    #[test]
    fn calloc_detects_overflow() {
        let mut heap = heap();

        unsafe {
            assert!(heap.calloc(usize::MAX, 2).is_null());
            assert!(heap.calloc(2, usize::MAX).is_null());
        }
        assert_clean(&heap);
    }

    #[test]
    fn freed_block_is_reused_lifo() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(100);
            heap.free(p);

            // Same request, exact fit: the block just freed comes back.
            let q = heap.malloc(100);
            assert_eq!(p, q);
            assert!(free_sizes(&heap).is_empty());
        }
        assert_clean(&heap);
    }

    #[test]
    fn distinct_allocations_do_not_alias() {
        let mut heap = heap();

        unsafe {
            let ptrs: Vec<*mut u8> = (0u8..8).map(|i| {
                let p = heap.malloc(24);
                ptr::write_bytes(p, i + 1, 24);
                p
            }).collect();

            for (i, &p) in ptrs.iter().enumerate() {
                for j in 0..24 {
                    assert_eq!(i as u8 + 1, p.add(j).read());
                }
            }
        }
        assert_clean(&heap);
    }

    #[test]
    fn fragmentation_does_not_force_growth() {
        let mut heap = TagAllocator::with_capacity(1 << 20);

        unsafe {
            let ptrs: Vec<*mut u8> = (0..1000).map(|_| heap.malloc(32)).collect();
            assert!(ptrs.iter().all(|p| !p.is_null()));

            for p in ptrs.iter().step_by(2) {
                heap.free(*p);
            }
            assert_eq!(500, free_sizes(&heap).len());

            let size_before = heap.heap_size();
            let p = heap.malloc(32);
            assert!(!p.is_null());

            // The request was served from the existing free blocks.
            assert_eq!(size_before, heap.heap_size());
            assert_eq!(499, free_sizes(&heap).len());
        }
        assert_clean(&heap);
    }

    #[test]
    fn requests_past_the_capacity_fail_cleanly() {
        let mut heap = TagAllocator::with_capacity(4096);

        unsafe {
            assert!(heap.malloc(1 << 20).is_null());
            assert!(heap.malloc(usize::MAX).is_null());

            // The allocator keeps working for requests that do fit.
            let p = heap.malloc(64);
            assert!(!p.is_null());
            heap.free(p);
        }
        assert_clean(&heap);
    }

    #[test]
    fn impossible_reservation_fails_to_init() {
        let mut heap = TagAllocator::with_capacity(usize::MAX);

        assert_eq!(Err(AllocError::InitFailed), heap.init());

        // The pointer surface degrades to null instead of panicking.
        unsafe {
            assert!(heap.malloc(16).is_null());
        }
    }

    #[test]
    fn reinit_resets_the_heap() {
        let mut heap = heap();

        unsafe {
            let p = heap.malloc(128);
            assert!(!p.is_null());
            let scratch = heap.malloc(64);
            heap.free(scratch);
            assert!(heap.heap_size() > 40);

            heap.init().unwrap();
            assert_eq!(40, heap.heap_size());
            assert!(free_sizes(&heap).is_empty());

            // The rewound heap serves fresh allocations from the start.
            let q = heap.malloc(16);
            assert_eq!(p, q);
        }
        assert_clean(&heap);
    }

    #[test]
    fn global_handle_round_trip() {
        let allocator = TagAlloc::new();

        unsafe {
            let layout = Layout::from_size_align(48, 16).unwrap();
            let p = allocator.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(0, p as usize % 16);

            let q = GlobalAlloc::realloc(&allocator, p, layout, 96);
            assert!(!q.is_null());
            allocator.dealloc(q, Layout::from_size_align(96, 16).unwrap());

            // Alignments beyond the 16-byte guarantee are refused.
            let over_aligned = Layout::from_size_align(48, 64).unwrap();
            assert!(allocator.alloc(over_aligned).is_null());

            let zeroed = allocator.alloc_zeroed(layout);
            assert!(!zeroed.is_null());
            assert!((0..48).all(|i| zeroed.add(i).read() == 0));
        }
    }

    #[test]
    fn randomized_workload_upholds_every_invariant() {
        let mut heap = TagAllocator::with_capacity(4 << 20);
        let mut rng = StdRng::seed_from_u64(0x7A6A110C);
        let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

        unsafe fn verify(entry: &(*mut u8, usize, u8)) {
            let (ptr, size, fill) = *entry;
            for i in 0..size {
                unsafe { assert_eq!(fill, ptr.add(i).read()) };
            }
        }

        unsafe {
            for step in 0..2000u32 {
                match rng.gen_range(0..10) {
                    // Allocate more often than anything else.
                    0..=4 => {
                        let size = rng.gen_range(1..=512);
                        let fill = (step % 251) as u8;
                        let ptr = heap.malloc(size);
                        assert!(!ptr.is_null());
                        ptr::write_bytes(ptr, fill, size);
                        live.push((ptr, size, fill));
                    }
                    5..=7 if !live.is_empty() => {
                        let entry = live.swap_remove(rng.gen_range(0..live.len()));
                        verify(&entry);
                        heap.free(entry.0);
                    }
                    8..=9 if !live.is_empty() => {
                        let index = rng.gen_range(0..live.len());
                        let entry = live[index];
                        verify(&entry);

                        let new_size = rng.gen_range(1..=512);
                        let new_ptr = heap.realloc(entry.0, new_size);
                        assert!(!new_ptr.is_null());

                        let kept = entry.1.min(new_size);
                        for i in 0..kept {
                            assert_eq!(entry.2, new_ptr.add(i).read());
                        }
                        ptr::write_bytes(new_ptr, entry.2, new_size);
                        live[index] = (new_ptr, new_size, entry.2);
                    }
                    _ => {}
                }

                assert_clean(&heap);
            }

            for entry in live.drain(..) {
                verify(&entry);
                heap.free(entry.0);
            }
        }
        assert_clean(&heap);
    }
}
