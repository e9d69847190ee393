//! DLL injection by thread-context forgery
//!
//! Makes a suspended thread "call" the OS library loader: the payload path
//! is written into the debuggee, a return frame is spliced onto the
//! thread's stack, and the instruction pointer is pointed at
//! `LoadLibraryW`. On resume the loader runs and returns to the original
//! instruction pointer as if nothing happened.

use crate::addr::IntAddr;
use crate::dynlib;
use crate::error::{Error, Result};
use crate::handle::{OwnedHandle, RawHandle};
use crate::mem::MEM_COMMIT;
use crate::wstr::to_wide;

use super::context::{self, ThreadContext, CONTEXT_CONTROL, CONTEXT_INTEGER};

const PAGE_READWRITE: u32 = 0x04;
#[cfg(target_arch = "x86")]
const MEM_RELEASE: u32 = 0x8000;

/// injects a DLL into a process by rewriting one of its threads
///
/// both handles are duplicated at construction and closed on drop. The
/// target thread must be suspended (or stopped at a debug event) while
/// `inject` runs.
pub struct ContextInjector {
    process: OwnedHandle,
    thread: OwnedHandle,
}

impl ContextInjector {
    pub fn new(process: RawHandle, thread: RawHandle) -> Result<Self> {
        debug_assert!(!process.is_null());
        debug_assert!(!thread.is_null());
        Ok(Self {
            process: OwnedHandle::duplicate(process)?,
            thread: OwnedHandle::duplicate(thread)?,
        })
    }

    /// arm the thread to load `dll_path` on resume
    pub fn inject(&self, dll_path: &str) -> Result<()> {
        const FLAGS: u32 = CONTEXT_INTEGER | CONTEXT_CONTROL;

        let mut ctx = context::capture(self.thread.raw(), FLAGS)
            .map_err(|_| Error::GetContextFailed)?;

        // the payload path, in the debuggee
        let wide = to_wide(dll_path);
        let byte_len = wide.len() * core::mem::size_of::<u16>();
        // SAFETY: plain remote allocation
        let remote_path = unsafe {
            VirtualAllocEx(
                self.process.raw(),
                core::ptr::null_mut(),
                byte_len,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if remote_path.is_null() {
            return Err(Error::DllPathNotWritten);
        }
        // SAFETY: remote_path spans byte_len bytes in the debuggee
        let path_written = unsafe {
            WriteProcessMemory(
                self.process.raw(),
                remote_path,
                wide.as_ptr().cast(),
                byte_len,
                core::ptr::null_mut(),
            )
        };
        if path_written == 0 {
            return Err(Error::DllPathNotWritten);
        }

        // forge the call frame and registers
        let frame = forge_loader_call(&mut ctx, remote_path as IntAddr)?;
        ctx.set_sp(ctx.sp() - frame.len());
        // SAFETY: splicing the frame just below the debuggee's stack pointer
        let frame_written = unsafe {
            WriteProcessMemory(
                self.process.raw(),
                ctx.sp() as *mut _,
                frame.as_ptr().cast(),
                frame.len(),
                core::ptr::null_mut(),
            )
        };
        if frame_written == 0 {
            return Err(Error::StackFrameNotWritten);
        }

        ctx.context_flags = FLAGS;
        context::apply(self.thread.raw(), &ctx).map_err(|_| Error::SetContextFailed)
    }
}

/// x64 ABI: the path pointer rides in RCX and the frame is just the
/// return address back to the original instruction pointer
#[cfg(target_arch = "x86_64")]
fn forge_loader_call(ctx: &mut ThreadContext, remote_path: IntAddr) -> Result<Vec<u8>> {
    let loader = dynlib::get("kernel32.dll", "LoadLibraryW")
        .map_err(|_| Error::StackFrameNotWritten)?;

    let frame = (ctx.ip() as u64).to_le_bytes().to_vec();
    ctx.rcx = remote_path as u64;
    ctx.set_ip(loader.value());
    Ok(frame)
}

/// 32-bit ABI: everything rides on the stack. The loader "returns" into
/// `VirtualFree`, which releases the path buffer and in turn returns to
/// the original instruction pointer.
#[cfg(target_arch = "x86")]
fn forge_loader_call(ctx: &mut ThreadContext, remote_path: IntAddr) -> Result<Vec<u8>> {
    let loader = dynlib::get("kernel32.dll", "LoadLibraryW")
        .map_err(|_| Error::StackFrameNotWritten)?;
    let virtual_free = dynlib::get("kernel32.dll", "VirtualFree")
        .map_err(|_| Error::StackFrameNotWritten)?;

    #[repr(C)]
    struct LoaderFrame {
        // for LoadLibraryW
        ret_to_virtual_free: u32,
        dll_path: u32,
        // for VirtualFree
        ret_to_origin: u32,
        memory_to_free: u32,
        size: u32,
        free_type: u32,
    }

    let frame = LoaderFrame {
        ret_to_virtual_free: virtual_free.value() as u32,
        dll_path: remote_path as u32,
        ret_to_origin: ctx.ip() as u32,
        memory_to_free: remote_path as u32,
        size: 0,
        free_type: MEM_RELEASE,
    };
    ctx.set_ip(loader.value());

    // SAFETY: LoaderFrame is plain data
    let bytes = unsafe {
        core::slice::from_raw_parts(
            (&frame as *const LoaderFrame).cast::<u8>(),
            core::mem::size_of::<LoaderFrame>(),
        )
    };
    Ok(bytes.to_vec())
}

#[link(name = "kernel32")]
extern "system" {
    fn VirtualAllocEx(
        hProcess: RawHandle,
        lpAddress: *mut core::ffi::c_void,
        dwSize: usize,
        flAllocationType: u32,
        flProtect: u32,
    ) -> *mut core::ffi::c_void;

    fn WriteProcessMemory(
        hProcess: RawHandle,
        lpBaseAddress: *mut core::ffi::c_void,
        lpBuffer: *const core::ffi::c_void,
        nSize: usize,
        lpNumberOfBytesWritten: *mut usize,
    ) -> i32;
}
