//! Dynamic library cache
//!
//! Resolves `(library, symbol)` pairs to addresses. A library already in
//! the process is used as-is; otherwise it is loaded once and the load is
//! remembered so the cache can release everything it owns.

use std::sync::Mutex;

use crate::addr::{ConstCodeAddr, IntAddr};
use crate::error::{Error, Result};
use crate::wstr::to_wide;

/// module handles this cache loaded itself
static OWNED_LIBRARIES: Mutex<Vec<IntAddr>> = Mutex::new(Vec::new());

/// resolve an exported symbol, loading the library if necessary
pub fn get(library: &str, symbol: &str) -> Result<ConstCodeAddr> {
    let module = module_handle(library)?;

    let mut name: Vec<u8> = symbol.bytes().collect();
    name.push(0);

    // SAFETY: module is a live handle; name is nul-terminated
    let address = unsafe { GetProcAddress(module as *mut _, name.as_ptr()) };
    if address.is_null() {
        return Err(Error::SymbolNotFound {
            library: library.into(),
            symbol: symbol.into(),
        });
    }
    Ok(ConstCodeAddr::new(address as IntAddr))
}

/// handle of `library`, loading it on first use
pub fn module_handle(library: &str) -> Result<IntAddr> {
    let wide = to_wide(library);

    // SAFETY: wide is nul-terminated
    let mut module = unsafe { GetModuleHandleW(wide.as_ptr()) };
    if module.is_null() {
        // SAFETY: as above
        module = unsafe { LoadLibraryW(wide.as_ptr()) };
        if module.is_null() {
            return Err(Error::ModuleNotFound {
                name: library.into(),
            });
        }
        OWNED_LIBRARIES.lock().unwrap().push(module as IntAddr);
    }
    Ok(module as IntAddr)
}

/// free every library this cache loaded
pub fn release_owned() {
    let mut owned = OWNED_LIBRARIES.lock().unwrap();
    for module in owned.drain(..) {
        // SAFETY: each handle came from our own LoadLibraryW
        unsafe {
            FreeLibrary(module as *mut _);
        }
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn GetModuleHandleW(lpModuleName: *const u16) -> *mut core::ffi::c_void;
    fn LoadLibraryW(lpLibFileName: *const u16) -> *mut core::ffi::c_void;
    fn FreeLibrary(hLibModule: *mut core::ffi::c_void) -> i32;
    fn GetProcAddress(
        hModule: *mut core::ffi::c_void,
        lpProcName: *const u8,
    ) -> *mut core::ffi::c_void;
}
