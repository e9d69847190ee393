//! Trampoline slot pool
//!
//! Executable pages carved into fixed-size slots. Pages are one allocation
//! granule each and, in 64-bit mode, are placed inside a caller-specified
//! address range so every recorded displacement stays reachable through a
//! signed 32-bit field. In 32-bit mode any page works and the range is
//! ignored.

use std::collections::HashMap;
use std::sync::RwLock;

use log::debug;

use crate::addr::{AddrRange, CodeAddr, IntAddr};
use crate::arch::IS_64BIT;
use crate::mem::{self, MEM_COMMIT, MEM_RESERVE, MEM_RELEASE, PAGE_EXECUTE_READWRITE};

/// size of one trampoline slot
pub const SLOT_SIZE: usize = 40;

/// global pool singleton
static POOL: RwLock<Option<TrampolinePool>> = RwLock::new(None);

struct TrampolinePool {
    /// base address of each page
    pages: Vec<IntAddr>,
    /// free slot offsets, shared index with `pages`
    free_lists: Vec<Vec<u32>>,
    /// slot address to page index
    slots_in_use: HashMap<IntAddr, usize>,
    granularity: usize,
}

impl TrampolinePool {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            free_lists: Vec::new(),
            slots_in_use: HashMap::new(),
            granularity: mem::alloc_granularity(),
        }
    }

    fn register(&mut self, bytes: &[u8; SLOT_SIZE], range: AddrRange) -> Option<CodeAddr> {
        let page_index = match self.find_usable_page(range) {
            Some(index) => index,
            None => self.add_page(range)?,
        };

        let free_list = &mut self.free_lists[page_index];
        let offset = free_list.pop()?;

        let slot = CodeAddr::new(self.pages[page_index] + offset as IntAddr);
        // SAFETY: the slot lies inside a pool-owned RWX page
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.as_mut_ptr::<u8>(), SLOT_SIZE);
        }

        debug_assert!(!self.slots_in_use.contains_key(&slot.value()));
        self.slots_in_use.insert(slot.value(), page_index);
        Some(slot)
    }

    fn unregister(&mut self, slot: IntAddr) {
        let Some(page_index) = self.slots_in_use.remove(&slot) else {
            return;
        };

        let offset = slot - self.pages[page_index];
        debug_assert!(offset <= self.granularity - SLOT_SIZE);
        self.free_lists[page_index].push(offset as u32);
    }

    /// first page with a free slot whose base satisfies the range
    fn find_usable_page(&self, range: AddrRange) -> Option<usize> {
        (0..self.pages.len()).find(|&index| {
            if self.free_lists[index].is_empty() {
                return false;
            }
            if IS_64BIT {
                range.contains(self.pages[index])
            } else {
                true
            }
        })
    }

    fn add_page(&mut self, range: AddrRange) -> Option<usize> {
        let aligned = align_range(range, self.granularity);
        let base = acquire_page(aligned, self.granularity)?;
        debug!(
            "new trampoline page at {base:#x} for range [{:#x}, {:#x})",
            range.min, range.max
        );

        self.pages.push(base);
        let slots_per_page = self.granularity / SLOT_SIZE;
        self.free_lists
            .push((0..slots_per_page).map(|i| (i * SLOT_SIZE) as u32).collect());
        Some(self.pages.len() - 1)
    }
}

/// write a trampoline into a free slot inside `range`, returning its address
pub fn register(bytes: &[u8; SLOT_SIZE], range: AddrRange) -> Option<CodeAddr> {
    let mut guard = POOL.write().unwrap();
    guard
        .get_or_insert_with(TrampolinePool::new)
        .register(bytes, range)
}

/// return a slot to its page's free list
pub fn unregister(slot: IntAddr) {
    let mut guard = POOL.write().unwrap();
    if let Some(pool) = guard.as_mut() {
        pool.unregister(slot);
    }
}

fn align_down(value: IntAddr, granularity: usize) -> IntAddr {
    value & !(granularity - 1)
}

fn align_up(value: IntAddr, granularity: usize) -> IntAddr {
    align_down(value, granularity)
        + if value & (granularity - 1) != 0 {
            granularity
        } else {
            0
        }
}

/// snap a range to the allocation granule without growing past `range.max`
fn align_range(range: AddrRange, granularity: usize) -> AddrRange {
    AddrRange::new(
        align_up(range.min, granularity),
        align_down(range.max, granularity),
    )
}

/// reserve and commit one RWX granule inside `range`
///
/// walks the region map upwards from `range.min`, trying each free region
/// as an allocation hint; a grant outside the range is released and the
/// scan moves past the region.
fn acquire_page(range: AddrRange, granularity: usize) -> Option<IntAddr> {
    if !IS_64BIT {
        // a single 4 GiB space; anywhere is reachable
        // SAFETY: allocation with no placement constraint
        let base = unsafe {
            VirtualAlloc(
                core::ptr::null_mut(),
                granularity,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        return if base.is_null() {
            None
        } else {
            Some(base as IntAddr)
        };
    }

    let end = range.max.checked_sub(granularity)?;
    let mut addr = range.min;
    while addr < end {
        let Some(region) = mem::query_region(addr) else {
            addr += granularity;
            continue;
        };

        if region.is_free() {
            // SAFETY: hint-placed allocation; the OS may move it
            let base = unsafe {
                VirtualAlloc(
                    addr as *mut _,
                    granularity,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_EXECUTE_READWRITE,
                )
            };
            if !base.is_null() {
                let base = base as IntAddr;
                if range.contains(base) {
                    return Some(base);
                }
                // granted somewhere useless
                // SAFETY: base was just allocated by us
                unsafe {
                    VirtualFree(base as *mut _, 0, MEM_RELEASE);
                }
            }
        }

        addr = align_up(region.base.value() + region.size, granularity).max(addr + granularity);
    }

    None
}

#[link(name = "kernel32")]
extern "system" {
    fn VirtualAlloc(
        lpAddress: *mut core::ffi::c_void,
        dwSize: usize,
        flAllocationType: u32,
        flProtect: u32,
    ) -> *mut core::ffi::c_void;

    fn VirtualFree(lpAddress: *mut core::ffi::c_void, dwSize: usize, dwFreeType: u32) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn near_range(anchor: IntAddr) -> AddrRange {
        AddrRange::new(
            anchor.saturating_sub(0x7FFF_0000),
            anchor.saturating_add(0x7FFF_0000),
        )
    }

    #[test]
    fn test_register_within_range_and_content() {
        let anchor = test_register_within_range_and_content as IntAddr;
        let range = near_range(anchor);

        let mut bytes = [0xCCu8; SLOT_SIZE];
        bytes[0] = 0xB8; // mov eax, 2Ah
        bytes[1..5].copy_from_slice(&42u32.to_le_bytes());
        bytes[5] = 0xC3; // ret

        let slot = register(&bytes, range).expect("allocation should succeed");
        if IS_64BIT {
            assert!(range.contains(slot.value()));
        }

        let stored = unsafe { slot.as_const().as_bytes(SLOT_SIZE) };
        assert_eq!(stored, &bytes);

        // the slot is executable
        let stub: extern "C" fn() -> u32 = unsafe { core::mem::transmute(slot.value()) };
        assert_eq!(stub(), 42);

        unregister(slot.value());
    }

    #[test]
    fn test_slot_reuse_after_unregister() {
        let range = near_range(test_slot_reuse_after_unregister as IntAddr);
        let bytes = [0x90u8; SLOT_SIZE];

        let first = register(&bytes, range).unwrap();
        unregister(first.value());

        let second = register(&bytes, range).unwrap();
        assert_eq!(first, second);
        unregister(second.value());
    }

    #[test]
    fn test_distinct_live_slots() {
        let range = near_range(test_distinct_live_slots as IntAddr);
        let bytes = [0x90u8; SLOT_SIZE];

        let a = register(&bytes, range).unwrap();
        let b = register(&bytes, range).unwrap();
        assert_ne!(a, b);
        assert!(a.value().abs_diff(b.value()) >= SLOT_SIZE);

        unregister(a.value());
        unregister(b.value());
    }
}
