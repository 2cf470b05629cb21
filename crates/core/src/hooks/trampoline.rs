//! Trampoline memory allocation
//!
//! Allocates executable memory within ±2GB of target addresses so relocated
//! RIP-relative instructions still reach their operands. Pages are split
//! into fixed-size slots; a page is returned to the OS once its last slot is
//! released.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Page size (4KB on most systems)
const PAGE_SIZE: usize = 4096;

/// Slot size; fits the relocated prologue plus the jump back
pub const TRAMPOLINE_SIZE: usize = 128;

const SLOTS_PER_PAGE: usize = PAGE_SIZE / TRAMPOLINE_SIZE;

/// Maximum search range for near allocation (2GB)
const MAX_RANGE: usize = 0x7FFF_0000;

/// Global trampoline allocator
static ALLOCATOR: Mutex<TrampolineAllocator> = Mutex::new(TrampolineAllocator::new());

/// Executable memory holding a relocated prologue
///
/// The slot is handed back to the allocator when this is dropped, so it must
/// outlive every patch that jumps into it.
#[derive(Debug)]
pub struct Trampoline {
    ptr: NonNull<u8>,
}

// SAFETY: The slot is exclusively owned; the allocator that tracks it is behind a mutex
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Trampoline {
    /// Allocate a slot within ±2GB of `target`
    pub fn alloc_near(target: usize) -> Option<Self> {
        ALLOCATOR
            .lock()
            .alloc_near(target)
            .map(|ptr| Trampoline { ptr })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub const fn capacity(&self) -> usize {
        TRAMPOLINE_SIZE
    }

    /// Copy `code` into the slot
    ///
    /// # Safety
    /// Nothing may be executing the slot while it is written.
    pub unsafe fn write(&mut self, code: &[u8]) -> bool {
        if code.len() > TRAMPOLINE_SIZE {
            return false;
        }
        std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
        true
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        ALLOCATOR.lock().free(self.ptr.as_ptr() as usize);
    }
}

/// Allocator for executable trampolines
struct TrampolineAllocator {
    /// Pages allocated, keyed by base address
    pages: BTreeMap<usize, PageInfo>,
}

struct PageInfo {
    base: *mut u8,
    /// Bit `i` set when slot `i` is in use
    used: u32,
}

// SAFETY: The allocator is protected by a mutex and pages are only accessed through it
unsafe impl Send for PageInfo {}

impl PageInfo {
    fn take_slot(&mut self) -> Option<*mut u8> {
        let free = (!self.used).trailing_zeros() as usize;
        if free >= SLOTS_PER_PAGE {
            return None;
        }
        self.used |= 1 << free;
        Some(unsafe { self.base.add(free * TRAMPOLINE_SIZE) })
    }
}

fn distance(a: usize, b: usize) -> usize {
    a.abs_diff(b)
}

impl TrampolineAllocator {
    const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Allocate a trampoline near the target address
    fn alloc_near(&mut self, target: usize) -> Option<NonNull<u8>> {
        // First, try to find an existing page within range
        for (&base, page) in &mut self.pages {
            if distance(base, target) < MAX_RANGE {
                if let Some(ptr) = page.take_slot() {
                    return NonNull::new(ptr);
                }
            }
        }

        // Allocate a new page near the target
        let new_page = self.alloc_page_near(target)?;
        let page = self.pages.get_mut(&(new_page as usize))?;
        page.take_slot().and_then(NonNull::new)
    }

    fn free(&mut self, ptr: usize) {
        let Some((&base, page)) = self.pages.range_mut(..=ptr).next_back() else {
            tracing::error!(target: "vrshim::hooks", "Freeing unknown trampoline {:x}", ptr);
            return;
        };
        let slot = (ptr - base) / TRAMPOLINE_SIZE;
        if slot >= SLOTS_PER_PAGE {
            tracing::error!(target: "vrshim::hooks", "Freeing unknown trampoline {:x}", ptr);
            return;
        }
        page.used &= !(1 << slot);
        if page.used == 0 {
            if let Some(page) = self.pages.remove(&base) {
                release_page(page.base);
            }
        }
    }

    #[cfg(unix)]
    fn alloc_page_near(&mut self, target: usize) -> Option<*mut u8> {
        use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
        use std::num::NonZeroUsize;

        let search_start = target.saturating_sub(MAX_RANGE);
        let search_end = target.saturating_add(MAX_RANGE);
        let length = NonZeroUsize::new(PAGE_SIZE)?;

        // Try allocating at hint addresses within range
        for hint in (search_start..search_end).step_by(PAGE_SIZE * 64) {
            if hint == 0 {
                continue;
            }

            let result = unsafe {
                mmap_anonymous(
                    NonZeroUsize::new(hint),
                    length,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                    MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                )
            };

            if let Ok(ptr) = result {
                let base = ptr.as_ptr() as *mut u8;
                let actual_addr = base as usize;

                if distance(actual_addr, target) < MAX_RANGE {
                    self.pages.insert(actual_addr, PageInfo { base, used: 0 });
                    return Some(base);
                }

                // Allocation was too far, unmap it
                unsafe {
                    let _ = nix::sys::mman::munmap(ptr, PAGE_SIZE);
                }
            }
        }

        // Try without hint as a fallback
        let result = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        };

        if let Ok(ptr) = result {
            let base = ptr.as_ptr() as *mut u8;
            let actual_addr = base as usize;
            self.pages.insert(actual_addr, PageInfo { base, used: 0 });
            tracing::warn!(
                target: "vrshim::hooks",
                "Trampoline allocation fallback: allocated at {:x} for target {:x}",
                actual_addr,
                target
            );
            return Some(base);
        }

        tracing::error!(target: "vrshim::hooks", "Failed to allocate page near {:x}", target);
        None
    }

    #[cfg(windows)]
    fn alloc_page_near(&mut self, target: usize) -> Option<*mut u8> {
        use windows::Win32::System::Memory::*;

        let search_start = target.saturating_sub(MAX_RANGE);
        let search_end = target.saturating_add(MAX_RANGE);

        // Allocation granularity is 64KB
        for hint in (search_start..search_end).step_by(PAGE_SIZE * 16) {
            if hint == 0 {
                continue;
            }

            let result = unsafe {
                VirtualAlloc(
                    Some(hint as *const std::ffi::c_void),
                    PAGE_SIZE,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_EXECUTE_READWRITE,
                )
            };

            if !result.is_null() {
                let base = result as *mut u8;
                let actual_addr = base as usize;

                if distance(actual_addr, target) < MAX_RANGE {
                    self.pages.insert(actual_addr, PageInfo { base, used: 0 });
                    return Some(base);
                }

                unsafe {
                    let _ = VirtualFree(result, 0, MEM_RELEASE);
                }
            }
        }

        tracing::error!(target: "vrshim::hooks", "Failed to allocate page near {:x}", target);
        None
    }
}

#[cfg(unix)]
fn release_page(base: *mut u8) {
    if let Some(ptr) = NonNull::new(base as *mut std::ffi::c_void) {
        unsafe {
            let _ = nix::sys::mman::munmap(ptr, PAGE_SIZE);
        }
    }
}

#[cfg(windows)]
fn release_page(base: *mut u8) {
    use windows::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

    unsafe {
        let _ = VirtualFree(base as *mut std::ffi::c_void, 0, MEM_RELEASE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_target() -> usize {
        local_target as usize
    }

    #[test]
    fn test_trampoline_allocation() {
        let trampoline = Trampoline::alloc_near(local_target());
        assert!(trampoline.is_some(), "Should allocate trampoline");

        let trampoline = trampoline.unwrap();
        assert!(!trampoline.as_ptr().is_null());
        assert_eq!(trampoline.capacity(), TRAMPOLINE_SIZE);
    }

    #[test]
    fn test_multiple_allocations_are_distinct() {
        let target = local_target();
        let t1 = Trampoline::alloc_near(target).unwrap();
        let t2 = Trampoline::alloc_near(target).unwrap();
        let t3 = Trampoline::alloc_near(target).unwrap();

        assert_ne!(t1.address(), t2.address());
        assert_ne!(t2.address(), t3.address());
        assert_ne!(t1.address(), t3.address());
    }

    #[test]
    fn test_write_fits_slot() {
        let mut t = Trampoline::alloc_near(local_target()).unwrap();
        unsafe {
            assert!(t.write(&[0x90; TRAMPOLINE_SIZE]));
            assert!(!t.write(&[0x90; TRAMPOLINE_SIZE + 1]));
            assert_eq!(*t.as_ptr(), 0x90);
        }
    }

    #[test]
    fn test_page_slot_bitmap() {
        let mut page = PageInfo {
            base: 0x1000 as *mut u8,
            used: 0,
        };
        assert_eq!(page.take_slot(), Some(0x1000 as *mut u8));
        assert_eq!(page.take_slot(), Some((0x1000 + TRAMPOLINE_SIZE) as *mut u8));
        page.used = u32::MAX >> (32 - SLOTS_PER_PAGE);
        assert_eq!(page.take_slot(), None);
    }
}
