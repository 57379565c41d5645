use std::ptr::NonNull;

use crate::{error::AllocError, utils::round_up};

/// Address space reserved by default: 1 GiB. Reservation costs no physical
/// memory; pages are committed lazily as the arena extends into them.
pub(crate) const DEFAULT_CAPACITY: usize = 1 << 30;

/// The contiguous byte region the allocator carves blocks from.
///
/// The region is reserved once, at a fixed base, and then only ever grows
/// upward: `extend` advances a break pointer within the reservation,
/// committing pages on demand. Because the base never moves, every pointer
/// handed out stays valid for the lifetime of the arena.
///
/// ```text
///        base                    break                    base + reserved
///         |                        |                             |
///         v                        v                             v
///         +------------------------+---------------+-------------+
///         |     extended bytes     |   committed,  |  reserved,  |
///         |    (usable, [lo, hi])  |    unused     | uncommitted |
///         +------------------------+---------------+-------------+
/// ```
///
/// `reset` rewinds the break to zero so that a fresh heap can be laid out
/// over the same mapping; committed pages are kept.
pub(crate) struct Arena {
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
    len: usize,
    page_size: usize,
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The arena, our top level view of this, has nothing to do
/// with the concrete APIs offered by each kernel.
trait PlatformMemory {
    /// Reserves `len` bytes of address space, without backing memory.
    /// Returns the base of the reservation or None if the syscall fails.
    unsafe fn reserve_memory(len: usize) -> Option<NonNull<u8>>;

    /// Makes `len` bytes starting at `addr` readable and writable.
    /// `addr` and `len` must be page-aligned within a prior reservation.
    unsafe fn commit_memory(addr: *mut u8, len: usize) -> bool;

    /// Returns the whole reservation starting at `addr` back to the kernel.
    unsafe fn release_memory(addr: *mut u8, len: usize);

    /// Virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

impl Arena {
    /// Reserves an arena able to extend up to `capacity` bytes.
    pub fn reserve(capacity: usize) -> Result<Self, AllocError> {
        unsafe {
            let page_size = Arena::page_size();
            // Round to whole pages; a capacity too large to round fails.
            let reserved = match capacity.max(page_size).checked_add(page_size - 1) {
                Some(padded) => padded & !(page_size - 1),
                None => return Err(AllocError::InitFailed),
            };

            let base = Arena::reserve_memory(reserved).ok_or(AllocError::InitFailed)?;

            Ok(Self {
                base,
                reserved,
                committed: 0,
                len: 0,
                page_size,
            })
        }
    }

    /// First byte of the arena.
    pub fn lo(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Last usable byte of the arena (inclusive bound). Only meaningful
    /// once at least one `extend` has succeeded.
    pub fn hi(&self) -> *mut u8 {
        debug_assert!(self.len > 0);
        unsafe { self.base.as_ptr().add(self.len - 1) }
    }

    /// Bytes currently extended into.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Enlarges the arena by exactly `n` bytes and returns the previous
    /// high-water mark, i.e. the start of the newly usable range. Returns
    /// None when the reservation is exhausted or a page commit fails; the
    /// arena is unchanged in that case.
    pub unsafe fn extend(&mut self, n: usize) -> Option<NonNull<u8>> {
        let new_len = self.len.checked_add(n)?;
        if new_len > self.reserved {
            return None;
        }

        if new_len > self.committed {
            let grow = round_up(new_len - self.committed, self.page_size)
                .min(self.reserved - self.committed);

            unsafe {
                let at = self.base.as_ptr().add(self.committed);
                if !Arena::commit_memory(at, grow) {
                    return None;
                }
            }

            self.committed += grow;
        }

        unsafe {
            let previous_top = NonNull::new_unchecked(self.base.as_ptr().add(self.len));
            self.len = new_len;
            Some(previous_top)
        }
    }

    /// Rewinds the break to an empty arena so a fresh heap can be laid out.
    /// The reservation and any committed pages are kept.
    pub fn reset(&mut self) {
        self.len = 0;
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { Arena::release_memory(self.base.as_ptr(), self.reserved) }
    }
}

#[cfg(unix)]
mod unix {
    use super::{Arena, PlatformMemory};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Arena {
        unsafe fn reserve_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Address space only; pages become accessible on commit.
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
            const FD: c_int = -1;
            const OFFSET: libc::off_t = 0;

            unsafe {
                let addr = libc::mmap(ADDR, len as libc::size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn commit_memory(addr: *mut u8, len: usize) -> bool {
            unsafe {
                libc::mprotect(
                    addr as *mut c_void,
                    len as libc::size_t,
                    libc::PROT_READ | libc::PROT_WRITE,
                ) == 0
            }
        }

        unsafe fn release_memory(addr: *mut u8, len: usize) {
            unsafe {
                libc::munmap(addr as *mut c_void, len as libc::size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Arena, PlatformMemory};

    impl PlatformMemory for Arena {
        unsafe fn reserve_memory(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr =
                    Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit_memory(addr: *mut u8, len: usize) -> bool {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    Some(addr as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                !addr.is_null()
            }
        }

        unsafe fn release_memory(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
