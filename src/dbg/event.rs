//! Native debug events
//!
//! The raw `DEBUG_EVENT` record as the OS delivers it, plus the safe
//! per-kind views handed to session callbacks. Handle fields inside the
//! views are borrowed; the debugger closes the file handles the OS conveys
//! for process-create and DLL-load events after the callback returns.

use crate::addr::{ConstCodeAddr, IntAddr};
use crate::handle::RawHandle;

pub const EXCEPTION_DEBUG_EVENT: u32 = 1;
pub const CREATE_THREAD_DEBUG_EVENT: u32 = 2;
pub const CREATE_PROCESS_DEBUG_EVENT: u32 = 3;
pub const EXIT_THREAD_DEBUG_EVENT: u32 = 4;
pub const EXIT_PROCESS_DEBUG_EVENT: u32 = 5;
pub const LOAD_DLL_DEBUG_EVENT: u32 = 6;
pub const UNLOAD_DLL_DEBUG_EVENT: u32 = 7;
pub const OUTPUT_DEBUG_STRING_EVENT: u32 = 8;
pub const RIP_EVENT: u32 = 9;

pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;

const EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExceptionRecord {
    pub exception_code: u32,
    pub exception_flags: u32,
    pub exception_record: IntAddr,
    pub exception_address: IntAddr,
    pub number_parameters: u32,
    pub exception_information: [IntAddr; EXCEPTION_MAXIMUM_PARAMETERS],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExceptionDebugInfo {
    pub exception_record: ExceptionRecord,
    pub first_chance: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CreateThreadDebugInfo {
    pub thread: RawHandle,
    pub thread_local_base: IntAddr,
    pub start_address: IntAddr,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CreateProcessDebugInfo {
    pub file: RawHandle,
    pub process: RawHandle,
    pub thread: RawHandle,
    pub base_of_image: IntAddr,
    pub debug_info_file_offset: u32,
    pub debug_info_size: u32,
    pub thread_local_base: IntAddr,
    pub start_address: IntAddr,
    pub image_name: IntAddr,
    pub unicode: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExitThreadDebugInfo {
    pub exit_code: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExitProcessDebugInfo {
    pub exit_code: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct LoadDllDebugInfo {
    pub file: RawHandle,
    pub base_of_dll: IntAddr,
    pub debug_info_file_offset: u32,
    pub debug_info_size: u32,
    pub image_name: IntAddr,
    pub unicode: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UnloadDllDebugInfo {
    pub base_of_dll: IntAddr,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct OutputDebugStringInfo {
    pub debug_string_data: IntAddr,
    pub unicode: u16,
    pub debug_string_length: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RipInfo {
    pub error: u32,
    pub kind: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union DebugEventInfo {
    pub exception: ExceptionDebugInfo,
    pub create_thread: CreateThreadDebugInfo,
    pub create_process: CreateProcessDebugInfo,
    pub exit_thread: ExitThreadDebugInfo,
    pub exit_process: ExitProcessDebugInfo,
    pub load_dll: LoadDllDebugInfo,
    pub unload_dll: UnloadDllDebugInfo,
    pub debug_string: OutputDebugStringInfo,
    pub rip: RipInfo,
}

/// the OS event record
#[repr(C)]
pub struct DebugEventRaw {
    pub event_code: u32,
    pub process_id: u32,
    pub thread_id: u32,
    pub info: DebugEventInfo,
}

impl DebugEventRaw {
    pub fn zeroed() -> Self {
        // SAFETY: DEBUG_EVENT is plain data; all-zero is a valid value
        unsafe { core::mem::zeroed() }
    }

    /// decode the union according to the event code
    pub fn decode(&self) -> DebugEvent {
        // SAFETY: each arm reads the union member the event code selects
        unsafe {
            match self.event_code {
                EXCEPTION_DEBUG_EVENT => DebugEvent::Exception(self.info.exception),
                CREATE_THREAD_DEBUG_EVENT => DebugEvent::ThreadCreated(self.info.create_thread),
                CREATE_PROCESS_DEBUG_EVENT => DebugEvent::ProcessCreated(self.info.create_process),
                EXIT_THREAD_DEBUG_EVENT => DebugEvent::ThreadExited(self.info.exit_thread),
                EXIT_PROCESS_DEBUG_EVENT => DebugEvent::ProcessExited(self.info.exit_process),
                LOAD_DLL_DEBUG_EVENT => DebugEvent::DllLoaded(self.info.load_dll),
                UNLOAD_DLL_DEBUG_EVENT => DebugEvent::DllUnloaded(self.info.unload_dll),
                OUTPUT_DEBUG_STRING_EVENT => DebugEvent::StringOutput(self.info.debug_string),
                RIP_EVENT => DebugEvent::Rip(self.info.rip),
                other => DebugEvent::Unknown(other),
            }
        }
    }
}

/// one debug event, decoded
pub enum DebugEvent {
    Exception(ExceptionDebugInfo),
    ThreadCreated(CreateThreadDebugInfo),
    ProcessCreated(CreateProcessDebugInfo),
    ThreadExited(ExitThreadDebugInfo),
    ProcessExited(ExitProcessDebugInfo),
    DllLoaded(LoadDllDebugInfo),
    DllUnloaded(UnloadDllDebugInfo),
    StringOutput(OutputDebugStringInfo),
    Rip(RipInfo),
    Unknown(u32),
}

impl ExceptionDebugInfo {
    pub fn code(&self) -> u32 {
        self.exception_record.exception_code
    }

    pub fn address(&self) -> ConstCodeAddr {
        ConstCodeAddr::new(self.exception_record.exception_address)
    }

    pub fn is_first_chance(&self) -> bool {
        self.first_chance != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_selects_by_code() {
        let mut raw = DebugEventRaw::zeroed();
        raw.event_code = EXIT_PROCESS_DEBUG_EVENT;
        raw.info.exit_process = ExitProcessDebugInfo { exit_code: 7 };

        match raw.decode() {
            DebugEvent::ProcessExited(info) => assert_eq!(info.exit_code, 7),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_unknown_event_code() {
        let mut raw = DebugEventRaw::zeroed();
        raw.event_code = 0xFF;
        assert!(matches!(raw.decode(), DebugEvent::Unknown(0xFF)));
    }
}
