//! Code memory plumbing
//!
//! Page-protection transitions, the in-place code write used by the hook
//! engine, and the region query the trampoline pool scans with.

use crate::addr::{CodeAddr, ConstCodeAddr, IntAddr};
use crate::error::{Error, Result};

pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const MEM_COMMIT: u32 = 0x1000;
pub const MEM_RESERVE: u32 = 0x2000;
pub const MEM_RELEASE: u32 = 0x8000;
pub const MEM_FREE: u32 = 0x10000;

/// change memory protection, returning the previous protection
pub fn protect(address: IntAddr, size: usize, protection: u32) -> Result<u32> {
    let mut old_protect: u32 = 0;

    // SAFETY: VirtualProtect validates the range itself
    let result = unsafe {
        VirtualProtect(
            address as *mut _,
            size,
            protection,
            &mut old_protect,
        )
    };

    if result == 0 {
        Err(Error::ProtectionChangeFailed { address, size })
    } else {
        Ok(old_protect)
    }
}

/// RAII guard for memory protection changes
pub struct ProtectionGuard {
    address: IntAddr,
    size: usize,
    old_protection: u32,
}

impl ProtectionGuard {
    /// change protection, returning a guard that restores on drop
    pub fn new(address: IntAddr, size: usize, new_protection: u32) -> Result<Self> {
        let old_protection = protect(address, size, new_protection)?;
        Ok(Self {
            address,
            size,
            old_protection,
        })
    }
}

impl Drop for ProtectionGuard {
    fn drop(&mut self) {
        let _ = protect(self.address, self.size, self.old_protection);
    }
}

/// overwrite code bytes in place
///
/// relaxes page protection around a single copy and flushes the
/// instruction cache afterwards. The copy itself is not atomic; callers
/// must not be executing the written range on other threads.
///
/// # Safety
/// `target` must be a valid address with `bytes.len()` bytes of backing
/// memory in this process
pub unsafe fn write_code(target: CodeAddr, bytes: &[u8]) -> Result<()> {
    let _guard = ProtectionGuard::new(target.value(), bytes.len(), PAGE_EXECUTE_READWRITE)
        .map_err(|_| Error::AccessDenied {
            target: target.value(),
        })?;

    // SAFETY: protection relaxed above; caller guarantees the range
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), target.as_mut_ptr::<u8>(), bytes.len());
    }

    // SAFETY: the range was just written and is valid
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), target.as_ptr(), bytes.len());
    }
    Ok(())
}

/// one region as reported by the OS region query
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: ConstCodeAddr,
    pub size: usize,
    pub state: u32,
}

impl MemoryRegion {
    pub fn is_free(&self) -> bool {
        self.state == MEM_FREE
    }
}

/// query the region containing `address`
pub fn query_region(address: IntAddr) -> Option<MemoryRegion> {
    // SAFETY: all-zero bytes are a valid MEMORY_BASIC_INFORMATION
    let mut info: MemoryBasicInformation = unsafe { core::mem::zeroed() };

    // SAFETY: out-pointer and size describe a valid MEMORY_BASIC_INFORMATION
    let written = unsafe {
        VirtualQuery(
            address as *const _,
            &mut info,
            core::mem::size_of::<MemoryBasicInformation>(),
        )
    };

    if written == 0 {
        None
    } else {
        Some(MemoryRegion {
            base: ConstCodeAddr::new(info.base_address as IntAddr),
            size: info.region_size,
            state: info.state,
        })
    }
}

/// the OS allocation granule (typically 64 KiB)
pub fn alloc_granularity() -> usize {
    // SAFETY: all-zero bytes are a valid SYSTEM_INFO; filled by the call
    let mut info: SystemInfo = unsafe { core::mem::zeroed() };
    // SAFETY: out-pointer describes a valid SYSTEM_INFO
    unsafe {
        GetSystemInfo(&mut info);
    }
    info.allocation_granularity as usize
}

#[repr(C)]
struct MemoryBasicInformation {
    base_address: *const core::ffi::c_void,
    allocation_base: *const core::ffi::c_void,
    allocation_protect: u32,
    #[cfg(target_arch = "x86_64")]
    partition_id: u16,
    region_size: usize,
    state: u32,
    protect: u32,
    type_: u32,
}

#[repr(C)]
struct SystemInfo {
    processor_architecture: u16,
    reserved: u16,
    page_size: u32,
    minimum_application_address: usize,
    maximum_application_address: usize,
    active_processor_mask: usize,
    number_of_processors: u32,
    processor_type: u32,
    allocation_granularity: u32,
    processor_level: u16,
    processor_revision: u16,
}

#[link(name = "kernel32")]
extern "system" {
    fn VirtualProtect(
        lpAddress: *mut core::ffi::c_void,
        dwSize: usize,
        flNewProtect: u32,
        lpflOldProtect: *mut u32,
    ) -> i32;

    fn VirtualQuery(
        lpAddress: *const core::ffi::c_void,
        lpBuffer: *mut MemoryBasicInformation,
        dwLength: usize,
    ) -> usize;

    fn GetSystemInfo(lpSystemInfo: *mut SystemInfo);

    fn FlushInstructionCache(
        hProcess: *mut core::ffi::c_void,
        lpBaseAddress: *const core::ffi::c_void,
        dwSize: usize,
    ) -> i32;

    fn GetCurrentProcess() -> *mut core::ffi::c_void;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_granularity_is_power_of_two() {
        let granule = alloc_granularity();
        assert!(granule >= 0x1000);
        assert_eq!(granule & (granule - 1), 0);
    }

    #[test]
    fn test_query_region_of_own_code() {
        let region =
            query_region(test_query_region_of_own_code as usize).expect("query should succeed");
        assert!(!region.is_free());
        assert!(region.size > 0);
    }

    #[test]
    fn test_protection_guard_restores() {
        let data = Box::new([0u8; 4096]);
        let address = data.as_ptr() as usize;

        let original = protect(address, 16, PAGE_EXECUTE_READWRITE).unwrap();
        protect(address, 16, original).unwrap();

        {
            let _guard = ProtectionGuard::new(address, 16, PAGE_EXECUTE_READWRITE).unwrap();
        }

        let after_guard = protect(address, 16, PAGE_EXECUTE_READWRITE).unwrap();
        assert_eq!(after_guard, original);
        protect(address, 16, original).unwrap();
    }
}
