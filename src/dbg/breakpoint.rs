//! Hardware breakpoints
//!
//! Pokes DR0-DR3 and the DR7 control bits of a thread. Only the
//! execute-type, one-byte, locally-enabled configuration is supported.

use crate::addr::ConstCodeAddr;
use crate::error::{Error, Result};
use crate::handle::RawHandle;

use super::context::{self, DebugRegister, CONTEXT_DEBUG_REGISTERS};

enum Dr7Update {
    Enable,
    Disable,
}

/// local-enable bit for a slot; LEN=0 and R/W=0 select one-byte execution
fn dr7_mask(slot: DebugRegister) -> usize {
    1 << ((slot as u8) << 1)
}

fn update(
    thread: RawHandle,
    address: ConstCodeAddr,
    slot: DebugRegister,
    op: Dr7Update,
) -> Result<()> {
    let mut ctx = context::capture(thread, CONTEXT_DEBUG_REGISTERS)
        .map_err(|_| Error::BreakpointUpdateFailed)?;

    ctx.set_debug_register(slot, address.value());
    match op {
        Dr7Update::Enable => ctx.dr7 |= dr7_mask(slot) as _,
        Dr7Update::Disable => ctx.dr7 &= !dr7_mask(slot) as _,
    }

    ctx.context_flags = CONTEXT_DEBUG_REGISTERS;
    context::apply(thread, &ctx).map_err(|_| Error::BreakpointUpdateFailed)
}

/// arm `slot` to break on execution of `address`
pub fn enable(thread: RawHandle, address: ConstCodeAddr, slot: DebugRegister) -> Result<()> {
    update(thread, address, slot, Dr7Update::Enable)
}

/// disarm `slot`
pub fn disable(thread: RawHandle, slot: DebugRegister) -> Result<()> {
    update(thread, ConstCodeAddr::new(0), slot, Dr7Update::Disable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbg::context::ThreadContext;
    use crate::dbg::event::EXCEPTION_SINGLE_STEP;
    use std::cell::Cell;

    thread_local! {
        static BP_HIT: Cell<bool> = const { Cell::new(false) };
    }

    #[repr(C)]
    struct ExceptionRecordRaw {
        code: u32,
        flags: u32,
        record: usize,
        address: usize,
        number_parameters: u32,
        information: [usize; 15],
    }

    #[repr(C)]
    struct ExceptionPointers {
        exception_record: *mut ExceptionRecordRaw,
        context_record: *mut ThreadContext,
    }

    const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
    const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

    unsafe extern "system" fn on_single_step(info: *mut ExceptionPointers) -> i32 {
        // SAFETY: the OS hands a valid pointer pair to VEH handlers
        unsafe {
            if (*(*info).exception_record).code != EXCEPTION_SINGLE_STEP {
                return EXCEPTION_CONTINUE_SEARCH;
            }
            BP_HIT.with(|hit| hit.set(true));
            (*(*info).context_record).dr7 = 0; // remove all breakpoints
        }
        EXCEPTION_CONTINUE_EXECUTION
    }

    struct VehGuard(*mut core::ffi::c_void);

    impl VehGuard {
        fn install() -> Self {
            // SAFETY: handler stays alive for the guard's lifetime
            let cookie = unsafe { AddVectoredExceptionHandler(1, on_single_step) };
            assert!(!cookie.is_null());
            Self(cookie)
        }
    }

    impl Drop for VehGuard {
        fn drop(&mut self) {
            // SAFETY: cookie came from AddVectoredExceptionHandler
            unsafe { RemoveVectoredExceptionHandler(self.0) };
        }
    }

    #[test]
    fn test_breakpoint_fires_and_clears() {
        let _veh = VehGuard::install();
        let target = ConstCodeAddr::new(GetCurrentProcessId as usize);
        // SAFETY: pseudo handle, no ownership
        let thread = unsafe { GetCurrentThread() };

        enable(thread, target, DebugRegister::Dr3).unwrap();
        BP_HIT.with(|hit| hit.set(false));
        // SAFETY: plain API call; the breakpoint fires on its first byte
        unsafe { GetCurrentProcessId() };
        assert!(BP_HIT.with(|hit| hit.get()));

        // the VEH already wiped DR7; disable still succeeds and stays quiet
        disable(thread, DebugRegister::Dr3).unwrap();
        BP_HIT.with(|hit| hit.set(false));
        unsafe { GetCurrentProcessId() };
        assert!(!BP_HIT.with(|hit| hit.get()));
    }

    #[test]
    fn test_disable_before_hit() {
        let _veh = VehGuard::install();
        let target = ConstCodeAddr::new(GetCurrentThreadId as usize);
        let thread = unsafe { GetCurrentThread() };

        enable(thread, target, DebugRegister::Dr2).unwrap();
        disable(thread, DebugRegister::Dr2).unwrap();

        BP_HIT.with(|hit| hit.set(false));
        unsafe { GetCurrentThreadId() };
        assert!(!BP_HIT.with(|hit| hit.get()));
    }

    #[link(name = "kernel32")]
    extern "system" {
        fn GetCurrentThread() -> RawHandle;
        fn GetCurrentProcessId() -> u32;
        fn GetCurrentThreadId() -> u32;
        fn AddVectoredExceptionHandler(
            first: u32,
            handler: unsafe extern "system" fn(*mut ExceptionPointers) -> i32,
        ) -> *mut core::ffi::c_void;
        fn RemoveVectoredExceptionHandler(handle: *mut core::ffi::c_void) -> u32;
    }
}
