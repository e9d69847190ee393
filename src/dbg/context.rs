//! Thread register-set access
//!
//! A `#[repr(C)]` CONTEXT for both architectures plus get/set wrappers.
//! Only the integer, control, and debug-register portions are modeled;
//! the extended state is opaque padding sized so the OS can write through
//! the whole structure.

use crate::addr::IntAddr;
use crate::error::{Error, Result};
use crate::handle::RawHandle;

#[cfg(target_arch = "x86_64")]
mod flags {
    const BASE: u32 = 0x0010_0000;
    pub const CONTEXT_CONTROL: u32 = BASE | 0x1;
    pub const CONTEXT_INTEGER: u32 = BASE | 0x2;
    pub const CONTEXT_DEBUG_REGISTERS: u32 = BASE | 0x10;
}

#[cfg(target_arch = "x86")]
mod flags {
    const BASE: u32 = 0x0001_0000;
    pub const CONTEXT_CONTROL: u32 = BASE | 0x1;
    pub const CONTEXT_INTEGER: u32 = BASE | 0x2;
    pub const CONTEXT_DEBUG_REGISTERS: u32 = BASE | 0x10;
}

pub use flags::{CONTEXT_CONTROL, CONTEXT_DEBUG_REGISTERS, CONTEXT_INTEGER};

/// hardware breakpoint slots DR0-DR3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugRegister {
    Dr0 = 0,
    Dr1 = 1,
    Dr2 = 2,
    Dr3 = 3,
}

#[cfg(target_arch = "x86_64")]
#[repr(C, align(16))]
pub struct ThreadContext {
    p1_home: u64,
    p2_home: u64,
    p3_home: u64,
    p4_home: u64,
    p5_home: u64,
    p6_home: u64,
    pub context_flags: u32,
    pub mx_csr: u32,
    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub seg_ss: u16,
    pub eflags: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    // floating point and XSAVE state; the OS writes through here
    _extended: [u8; 1024],
}

#[cfg(target_arch = "x86")]
#[repr(C)]
pub struct ThreadContext {
    pub context_flags: u32,
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
    _float_save: [u8; 112],
    pub seg_gs: u32,
    pub seg_fs: u32,
    pub seg_es: u32,
    pub seg_ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub seg_cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub seg_ss: u32,
    _extended: [u8; 512],
}

impl ThreadContext {
    /// instruction pointer
    pub fn ip(&self) -> IntAddr {
        #[cfg(target_arch = "x86_64")]
        {
            self.rip as IntAddr
        }
        #[cfg(target_arch = "x86")]
        {
            self.eip as IntAddr
        }
    }

    pub fn set_ip(&mut self, value: IntAddr) {
        #[cfg(target_arch = "x86_64")]
        {
            self.rip = value as u64;
        }
        #[cfg(target_arch = "x86")]
        {
            self.eip = value as u32;
        }
    }

    /// stack pointer
    pub fn sp(&self) -> IntAddr {
        #[cfg(target_arch = "x86_64")]
        {
            self.rsp as IntAddr
        }
        #[cfg(target_arch = "x86")]
        {
            self.esp as IntAddr
        }
    }

    pub fn set_sp(&mut self, value: IntAddr) {
        #[cfg(target_arch = "x86_64")]
        {
            self.rsp = value as u64;
        }
        #[cfg(target_arch = "x86")]
        {
            self.esp = value as u32;
        }
    }

    /// value of a debug-register slot
    pub fn debug_register(&self, slot: DebugRegister) -> IntAddr {
        let value = match slot {
            DebugRegister::Dr0 => self.dr0,
            DebugRegister::Dr1 => self.dr1,
            DebugRegister::Dr2 => self.dr2,
            DebugRegister::Dr3 => self.dr3,
        };
        value as IntAddr
    }

    pub fn set_debug_register(&mut self, slot: DebugRegister, value: IntAddr) {
        let target = match slot {
            DebugRegister::Dr0 => &mut self.dr0,
            DebugRegister::Dr1 => &mut self.dr1,
            DebugRegister::Dr2 => &mut self.dr2,
            DebugRegister::Dr3 => &mut self.dr3,
        };
        #[cfg(target_arch = "x86_64")]
        {
            *target = value as u64;
        }
        #[cfg(target_arch = "x86")]
        {
            *target = value as u32;
        }
    }
}

/// capture the register portions selected by `flags`
pub fn capture(thread: RawHandle, flags: u32) -> Result<Box<ThreadContext>> {
    // SAFETY: all-zero bytes are a valid CONTEXT before flags are set
    let mut context: Box<ThreadContext> = unsafe { Box::new(core::mem::zeroed()) };
    context.context_flags = flags;

    // SAFETY: out-pointer is a full-size CONTEXT
    let ok = unsafe { GetThreadContext(thread, &mut *context) };
    if ok == 0 {
        return Err(Error::from_last_error("GetThreadContext"));
    }
    Ok(context)
}

/// write back the register portions selected by `context.context_flags`
pub fn apply(thread: RawHandle, context: &ThreadContext) -> Result<()> {
    // SAFETY: context is a valid CONTEXT with its flags set
    let ok = unsafe { SetThreadContext(thread, context) };
    if ok == 0 {
        return Err(Error::from_last_error("SetThreadContext"));
    }
    Ok(())
}

#[link(name = "kernel32")]
extern "system" {
    fn GetThreadContext(hThread: RawHandle, lpContext: *mut ThreadContext) -> i32;
    fn SetThreadContext(hThread: RawHandle, lpContext: *const ThreadContext) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_sp_round_trip() {
        // SAFETY: zeroed CONTEXT is valid for field twiddling
        let mut context: ThreadContext = unsafe { core::mem::zeroed() };
        context.set_ip(0x1234_5678);
        context.set_sp(0x8765_4320);
        assert_eq!(context.ip(), 0x1234_5678);
        assert_eq!(context.sp(), 0x8765_4320);
    }

    #[test]
    fn test_debug_register_slots() {
        let mut context: ThreadContext = unsafe { core::mem::zeroed() };
        for (index, slot) in [
            DebugRegister::Dr0,
            DebugRegister::Dr1,
            DebugRegister::Dr2,
            DebugRegister::Dr3,
        ]
        .into_iter()
        .enumerate()
        {
            context.set_debug_register(slot, 0x1000 + index);
            assert_eq!(context.debug_register(slot), 0x1000 + index);
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_layout_matches_os_context() {
        // offsets the VEH tests and the OS both rely on
        use core::mem::offset_of;
        assert_eq!(offset_of!(ThreadContext, context_flags), 48);
        assert_eq!(offset_of!(ThreadContext, eflags), 68);
        assert_eq!(offset_of!(ThreadContext, dr0), 72);
        assert_eq!(offset_of!(ThreadContext, dr7), 112);
        assert_eq!(offset_of!(ThreadContext, rax), 120);
        assert_eq!(offset_of!(ThreadContext, rip), 248);
    }
}
