//! Module snapshot enumeration
//!
//! Toolhelp-based listing of the modules loaded in an arbitrary process.

use crate::addr::{ConstCodeAddr, IntAddr};
use crate::error::{Error, Result};
use crate::handle::{OwnedHandle, RawHandle};
use crate::wstr::from_wide;

const TH32CS_SNAPMODULE: u32 = 0x8;
const TH32CS_SNAPMODULE32: u32 = 0x10;
const ERROR_NO_MORE_FILES: u32 = 18;
const MAX_MODULE_NAME32: usize = 255;
const MAX_PATH: usize = 260;

/// one loaded module of a snapshot
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base: ConstCodeAddr,
    pub size: usize,
}

#[repr(C)]
struct ModuleEntry32W {
    size: u32,
    module_id: u32,
    process_id: u32,
    global_usage: u32,
    process_usage: u32,
    base_addr: *mut u8,
    base_size: u32,
    module_handle: RawHandle,
    module_name: [u16; MAX_MODULE_NAME32 + 1],
    exe_path: [u16; MAX_PATH],
}

/// list the modules loaded in process `pid`
pub fn snapshot(pid: u32) -> Result<Vec<ModuleInfo>> {
    // SAFETY: snapshot creation has no preconditions
    let raw = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) };
    // SAFETY: we own the snapshot handle from here on
    let snapshot = unsafe { OwnedHandle::from_raw(raw) };
    if !snapshot.is_valid() {
        return Err(Error::from_last_error("CreateToolhelp32Snapshot"));
    }

    // SAFETY: all-zero bytes form a valid entry; dwSize set below
    let mut entry: ModuleEntry32W = unsafe { core::mem::zeroed() };
    entry.size = core::mem::size_of::<ModuleEntry32W>() as u32;

    let mut modules = Vec::new();
    // SAFETY: entry out-pointer is valid for the walk
    let mut more = unsafe { Module32FirstW(snapshot.raw(), &mut entry) } != 0;
    while more {
        modules.push(ModuleInfo {
            name: from_wide(&entry.module_name),
            path: from_wide(&entry.exe_path),
            base: ConstCodeAddr::new(entry.base_addr as IntAddr),
            size: entry.base_size as usize,
        });
        // SAFETY: as above
        more = unsafe { Module32NextW(snapshot.raw(), &mut entry) } != 0;
    }

    // SAFETY: distinguishing normal end-of-list from a failed walk
    let last_error = unsafe { GetLastError() };
    if modules.is_empty() && last_error != ERROR_NO_MORE_FILES {
        return Err(Error::Win32Error {
            code: last_error,
            context: "Module32FirstW",
        });
    }
    Ok(modules)
}

/// true when `pid` has a module whose name contains `fragment`
/// (case-insensitive)
pub fn contains_module(pid: u32, fragment: &str) -> Result<bool> {
    let fragment = fragment.to_lowercase();
    Ok(snapshot(pid)?
        .iter()
        .any(|module| module.name.to_lowercase().contains(&fragment)))
}

#[link(name = "kernel32")]
extern "system" {
    fn CreateToolhelp32Snapshot(dwFlags: u32, th32ProcessID: u32) -> RawHandle;
    fn Module32FirstW(hSnapshot: RawHandle, lpme: *mut ModuleEntry32W) -> i32;
    fn Module32NextW(hSnapshot: RawHandle, lpme: *mut ModuleEntry32W) -> i32;
    fn GetLastError() -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_of_current_process() {
        let modules = snapshot(std::process::id()).unwrap();
        assert!(!modules.is_empty());
        assert!(modules
            .iter()
            .any(|m| m.name.to_lowercase() == "kernel32.dll"));

        for module in &modules {
            assert!(!module.base.is_null());
            assert!(module.size > 0);
        }
    }

    #[test]
    fn test_contains_module() {
        let pid = std::process::id();
        assert!(contains_module(pid, "NTDLL").unwrap());
        assert!(!contains_module(pid, "definitely_not_loaded_xyz").unwrap());
    }
}
