//! Scoped Win32 handle ownership

use crate::error::{Error, Result};

pub type RawHandle = *mut core::ffi::c_void;

const INVALID_HANDLE_VALUE: usize = usize::MAX;
const DUPLICATE_SAME_ACCESS: u32 = 0x0000_0002;

/// a Win32 handle closed on drop
///
/// exactly one wrapper owns a handle at a time; moving the wrapper moves
/// ownership.
pub struct OwnedHandle {
    raw: RawHandle,
}

impl OwnedHandle {
    /// take ownership of a raw handle
    ///
    /// # Safety
    /// `raw` must be a handle this wrapper may close, owned by no one else
    pub unsafe fn from_raw(raw: RawHandle) -> Self {
        Self { raw }
    }

    /// an explicitly invalid handle
    pub fn invalid() -> Self {
        Self {
            raw: INVALID_HANDLE_VALUE as RawHandle,
        }
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    /// false for null and the OS sentinel value
    pub fn is_valid(&self) -> bool {
        !self.raw.is_null() && self.raw as usize != INVALID_HANDLE_VALUE
    }

    /// duplicate a borrowed handle into a new owned one, same access
    pub fn duplicate(source: RawHandle) -> Result<Self> {
        // SAFETY: pseudo handle for the current process needs no closing
        let current = unsafe { GetCurrentProcess() };
        let mut duplicated: RawHandle = core::ptr::null_mut();

        // SAFETY: out-pointer is valid; source is caller-supplied
        let ok = unsafe {
            DuplicateHandle(
                current,
                source,
                current,
                &mut duplicated,
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if ok == 0 {
            return Err(Error::from_last_error("DuplicateHandle"));
        }
        Ok(Self { raw: duplicated })
    }

    /// give up ownership without closing
    pub fn into_raw(self) -> RawHandle {
        let raw = self.raw;
        core::mem::forget(self);
        raw
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.is_valid() {
            // SAFETY: we own the handle
            unsafe {
                CloseHandle(self.raw);
            }
        }
    }
}

// SAFETY: handles are process-global tokens, safe to move across threads
unsafe impl Send for OwnedHandle {}

#[link(name = "kernel32")]
extern "system" {
    fn CloseHandle(hObject: RawHandle) -> i32;
    fn GetCurrentProcess() -> RawHandle;
    fn DuplicateHandle(
        hSourceProcessHandle: RawHandle,
        hSourceHandle: RawHandle,
        hTargetProcessHandle: RawHandle,
        lpTargetHandle: *mut RawHandle,
        dwDesiredAccess: u32,
        bInheritHandle: i32,
        dwOptions: u32,
    ) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        assert!(!OwnedHandle::invalid().is_valid());
        let null = unsafe { OwnedHandle::from_raw(core::ptr::null_mut()) };
        assert!(!null.is_valid());
    }

    #[test]
    fn test_duplicate_own_process_handle() {
        let current = unsafe { GetCurrentProcess() };
        let duplicated = OwnedHandle::duplicate(current).unwrap();
        assert!(duplicated.is_valid());
    }
}
