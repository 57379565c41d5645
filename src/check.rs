//! Traversal-based invariant audit.
//!
//! The heap carries enough redundancy to be checked from scratch: the block
//! sequence can be walked forward through the header tags, and the free
//! list can be walked through the payload links. [`TagAllocator::audit`]
//! does both and reports every disagreement, including the reconciliation
//! between the two walks (every free block in the sequence must show up in
//! the list exactly once).
//!
//! Violations are reported, never acted upon: the allocator keeps running
//! on whatever state it has, and recovery is left to the caller.

use std::{fmt, ptr::NonNull};

use crate::{
    block::{BlockPtr, ALIGNMENT, MIN_BLOCK_SIZE, TAG_OVERHEAD, WORD},
    heap::TagAllocator,
};

/// One invariant violation found by [`TagAllocator::audit`].
///
/// Addresses are reported as raw `usize` values so the variants stay
/// `Copy` and printable without touching the heap again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// The allocator has no prologue marker (it was never initialized).
    PrologueMissing,
    /// The prologue marker is not 8 bytes above the arena base.
    PrologueMoved { expected: usize, found: usize },
    /// The allocator has no epilogue marker.
    EpilogueMissing,
    /// The epilogue marker is not 15 bytes below the arena top.
    EpilogueMoved { expected: usize, found: usize },
    /// Two neighboring blocks are both free; coalescing failed.
    Uncoalesced { at: usize },
    /// A block's size is not a multiple of 16.
    SizeUnaligned { at: usize, size: usize },
    /// A block is smaller than the 32-byte minimum.
    SizeBelowMinimum { at: usize, size: usize },
    /// A block's footer does not mirror its header.
    TagMismatch { at: usize, header: usize, footer: usize },
    /// A block lies outside the arena bounds.
    OutOfBounds { at: usize },
    /// A block's offset from the prologue is not a multiple of 16.
    AddressUnaligned { at: usize },
    /// A free-list member is marked allocated.
    AllocatedOnFreeList { at: usize },
    /// A free-list member's `prev` does not point back to its predecessor.
    BrokenPrevLink { at: usize },
    /// The free list holds a block outside the arena bounds.
    FreeOutOfBounds { at: usize },
    /// The block walk and the free list disagree on how many blocks are
    /// free.
    FreeCountMismatch { walked: usize, listed: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::PrologueMissing => write!(f, "prologue is missing"),
            Violation::PrologueMoved { expected, found } => {
                write!(f, "prologue has moved: expected {expected:#x}, found {found:#x}")
            }
            Violation::EpilogueMissing => write!(f, "epilogue is missing"),
            Violation::EpilogueMoved { expected, found } => {
                write!(f, "epilogue has moved: expected {expected:#x}, found {found:#x}")
            }
            Violation::Uncoalesced { at } => {
                write!(f, "adjacent free blocks at {at:#x}")
            }
            Violation::SizeUnaligned { at, size } => {
                write!(f, "block at {at:#x} has unaligned size {size}")
            }
            Violation::SizeBelowMinimum { at, size } => {
                write!(f, "block at {at:#x} is below the minimum size: {size}")
            }
            Violation::TagMismatch { at, header, footer } => {
                write!(f, "block at {at:#x}: footer {footer:#x} does not mirror header {header:#x}")
            }
            Violation::OutOfBounds { at } => {
                write!(f, "block at {at:#x} is outside the arena")
            }
            Violation::AddressUnaligned { at } => {
                write!(f, "block address {at:#x} is not 16-byte aligned")
            }
            Violation::AllocatedOnFreeList { at } => {
                write!(f, "free list holds allocated block at {at:#x}")
            }
            Violation::BrokenPrevLink { at } => {
                write!(f, "free block at {at:#x}: prev does not match its predecessor")
            }
            Violation::FreeOutOfBounds { at } => {
                write!(f, "free block at {at:#x} is outside the arena")
            }
            Violation::FreeCountMismatch { walked, listed } => {
                write!(
                    f,
                    "free counts disagree: {walked} free in the block sequence, {listed} on the list"
                )
            }
        }
    }
}

impl TagAllocator {
    /// Walks the heap and streams every violation into `report`.
    ///
    /// This variant allocates nothing, so it is usable even while this
    /// allocator is serving as the global allocator.
    pub fn audit_with(&self, report: &mut dyn FnMut(Violation)) {
        let Some(arena) = self.arena.as_ref() else {
            report(Violation::PrologueMissing);
            report(Violation::EpilogueMissing);
            return;
        };

        let Some(first) = self.heap_first else {
            report(Violation::PrologueMissing);
            return;
        };
        let Some(last) = self.heap_last else {
            report(Violation::EpilogueMissing);
            return;
        };

        // Sentinels in place implies the arena holds at least the initial
        // padding, so its bounds are meaningful.
        let lo = arena.lo() as usize;
        let hi = arena.hi() as usize;

        if first.addr() as usize != lo + WORD {
            report(Violation::PrologueMoved {
                expected: lo + WORD,
                found: first.addr() as usize,
            });
        }

        if last.addr() as usize != hi - (TAG_OVERHEAD - 1) {
            report(Violation::EpilogueMoved {
                expected: hi - (TAG_OVERHEAD - 1),
                found: last.addr() as usize,
            });
        }

        let walked = self.audit_block_sequence(first, last, lo, hi, report);
        let listed = self.audit_free_list(arena.len(), lo, hi, report);

        if walked != listed {
            report(Violation::FreeCountMismatch { walked, listed });
        }
    }

    /// Walks the implicit block sequence, from the first block after the
    /// prologue up to the epilogue. Returns the number of free blocks seen.
    fn audit_block_sequence(
        &self,
        first: BlockPtr,
        last: BlockPtr,
        lo: usize,
        hi: usize,
        report: &mut dyn FnMut(Violation),
    ) -> usize {
        let mut walked = 0;

        unsafe {
            // The first real block sits one tag pair past the prologue.
            let mut current =
                BlockPtr::new(NonNull::new_unchecked(first.addr().add(TAG_OVERHEAD)));
            let mut previous: Option<BlockPtr> = None;

            while current != last {
                let at = current.addr() as usize;
                if at < lo || at > hi {
                    report(Violation::OutOfBounds { at });
                    break;
                }

                let size = current.size();

                if !current.is_allocated() {
                    walked += 1;
                    if let Some(previous) = previous {
                        if !previous.is_allocated() {
                            report(Violation::Uncoalesced { at });
                        }
                    }
                }
                if size % ALIGNMENT != 0 {
                    report(Violation::SizeUnaligned { at, size });
                }
                if size < MIN_BLOCK_SIZE {
                    report(Violation::SizeBelowMinimum { at, size });
                }
                if current.header_tag() != current.footer_tag() {
                    report(Violation::TagMismatch {
                        at,
                        header: current.header_tag(),
                        footer: current.footer_tag(),
                    });
                }
                if (at - first.addr() as usize) % ALIGNMENT != 0 {
                    report(Violation::AddressUnaligned { at });
                }

                if size == 0 {
                    // A corrupt zero-size tag cannot be walked past.
                    break;
                }
                previous = Some(current);
                current = current.next_in_heap();
            }
        }

        walked
    }

    /// Walks the explicit free list. Returns the number of members seen.
    fn audit_free_list(
        &self,
        arena_len: usize,
        lo: usize,
        hi: usize,
        report: &mut dyn FnMut(Violation),
    ) -> usize {
        // More members than could possibly fit means the links form a
        // cycle; stop there instead of walking forever.
        let most_possible = arena_len / MIN_BLOCK_SIZE + 1;
        let mut listed = 0;

        unsafe {
            let mut previous: Option<BlockPtr> = None;
            let mut current = self.free.head();

            while let Some(block) = current {
                let at = block.addr() as usize;
                if at < lo || at > hi {
                    report(Violation::FreeOutOfBounds { at });
                    break;
                }
                if block.prev_free() != previous {
                    report(Violation::BrokenPrevLink { at });
                }
                if block.is_allocated() {
                    report(Violation::AllocatedOnFreeList { at });
                }

                listed += 1;
                if listed > most_possible {
                    break;
                }
                previous = current;
                current = block.next_free();
            }
        }

        listed
    }

    /// Walks the heap and collects every violation.
    pub fn audit(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        self.audit_with(&mut |violation| violations.push(violation));
        violations
    }

    /// Prints every violation to stderr, tagged with the caller-supplied
    /// `line` so trace drivers can point at the operation that broke the
    /// heap.
    pub fn check(&self, line: i32) {
        self.audit_with(&mut |violation| {
            eprintln!("heap check failed at line {line}: {violation}");
        });
    }
}
