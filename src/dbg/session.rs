//! Debug sessions
//!
//! A [`Debuggee`] is one process spawned under the debug API. Session
//! types wrap a debuggee and override the per-event callbacks they care
//! about; everything else falls through to the defaults.

use crate::error::{Error, Result};
use crate::handle::{OwnedHandle, RawHandle};
use crate::wstr::to_wide;

use super::event::{
    CreateProcessDebugInfo, CreateThreadDebugInfo, ExceptionDebugInfo, ExitProcessDebugInfo,
    ExitThreadDebugInfo, LoadDllDebugInfo, OutputDebugStringInfo, RipInfo, UnloadDllDebugInfo,
};

const DEBUG_PROCESS: u32 = 0x1;
const DEBUG_ONLY_THIS_PROCESS: u32 = 0x2;

// CreateProcessW caps lpCommandLine at 32,767 characters
const MAX_CMDLINE_CHARS: usize = 32_767;

/// what a session callback tells the event loop to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueStatus {
    /// resume the reporting thread
    ContinueThread,
    /// pass the exception back to the debuggee
    NotHandled,
    /// detach this session after continuing the event
    CloseSession,
}

/// how to part with a debuggee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOption {
    Kill,
    Detach,
}

/// shown to `on_pre_event` before the typed dispatch
#[derive(Debug, Clone, Copy)]
pub struct PreEvent {
    pub event_code: u32,
    pub thread_id: u32,
}

/// optional STARTUPINFO overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct StartupParams {
    pub flags: u32,
    pub show_window: u16,
}

/// how to spawn a debuggee
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnParams<'a> {
    pub image_path: &'a str,
    pub args: Option<&'a str>,
    pub current_dir: Option<&'a str>,
    pub startup: Option<StartupParams>,
}

/// one process being debugged by this process
pub struct Debuggee {
    pid: u32,
    process: OwnedHandle,
}

impl Debuggee {
    /// spawn a new process attached to our debug event queue
    pub fn spawn(params: &SpawnParams) -> Result<Self> {
        let image = to_wide(params.image_path);

        // the command line may legally run to 32,767 characters, which is
        // far too large for the stack
        let mut cmdline: Option<Vec<u16>> = params.args.map(|args| {
            let mut buffer = Vec::with_capacity(MAX_CMDLINE_CHARS);
            buffer.extend("\"".encode_utf16());
            buffer.extend(params.image_path.encode_utf16());
            buffer.extend("\" ".encode_utf16());
            buffer.extend(args.encode_utf16());
            buffer.truncate(MAX_CMDLINE_CHARS - 1);
            buffer.push(0);
            buffer
        });
        let current_dir = params.current_dir.map(to_wide);

        // SAFETY: all-zero STARTUPINFOW is valid once cb is set
        let mut startup: StartupInfoW = unsafe { core::mem::zeroed() };
        startup.cb = core::mem::size_of::<StartupInfoW>() as u32;
        if let Some(overrides) = params.startup {
            startup.flags = overrides.flags;
            startup.show_window = overrides.show_window;
        }

        let mut proc_info = ProcessInformation {
            process: core::ptr::null_mut(),
            thread: core::ptr::null_mut(),
            process_id: 0,
            thread_id: 0,
        };

        // SAFETY: every buffer outlives the call; out-structs are valid
        let created = unsafe {
            CreateProcessW(
                image.as_ptr(),
                cmdline
                    .as_mut()
                    .map_or(core::ptr::null_mut(), |buffer| buffer.as_mut_ptr()),
                core::ptr::null_mut(),
                core::ptr::null_mut(),
                0,
                DEBUG_PROCESS | DEBUG_ONLY_THIS_PROCESS,
                core::ptr::null_mut(),
                current_dir
                    .as_ref()
                    .map_or(core::ptr::null(), |dir| dir.as_ptr()),
                &startup,
                &mut proc_info,
            )
        };
        if created == 0 {
            return Err(Error::SpawnFailed {
                // SAFETY: immediately after the failed call
                code: unsafe { GetLastError() },
            });
        }

        // only the process handle is kept
        // SAFETY: both handles were just handed to us
        unsafe {
            CloseHandle(proc_info.thread);
            Ok(Self {
                pid: proc_info.process_id,
                process: OwnedHandle::from_raw(proc_info.process),
            })
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn process(&self) -> RawHandle {
        self.process.raw()
    }

    pub fn is_valid(&self) -> bool {
        self.pid != 0
    }

    /// detach from the debuggee, optionally terminating it
    pub fn end(&mut self, option: EndOption) {
        if !self.is_valid() {
            return;
        }

        // SAFETY: pid and handle are live until the fields are reset below
        unsafe {
            DebugActiveProcessStop(self.pid);
            if option == EndOption::Kill {
                TerminateProcess(self.process.raw(), 0);
            }
        }
        self.pid = 0;
        self.process = OwnedHandle::invalid();
    }
}

impl Drop for Debuggee {
    fn drop(&mut self) {
        self.end(EndOption::Kill);
    }
}

/// per-event callbacks of one debug session
///
/// callbacks must not close handles carried in the event info structures;
/// the debugger owns those.
pub trait DebugSession {
    fn debuggee(&self) -> &Debuggee;
    fn debuggee_mut(&mut self) -> &mut Debuggee;

    /// session identifier; the debuggee's process id
    fn id(&self) -> u32 {
        self.debuggee().pid()
    }

    /// informational peek at every event before its typed handler runs
    fn on_pre_event(&mut self, _event: PreEvent) {}

    fn on_exception(&mut self, _info: &ExceptionDebugInfo) -> ContinueStatus {
        ContinueStatus::ContinueThread
    }

    fn on_thread_created(&mut self, _info: &CreateThreadDebugInfo) -> ContinueStatus {
        ContinueStatus::ContinueThread
    }

    fn on_process_created(&mut self, _info: &CreateProcessDebugInfo) -> ContinueStatus {
        ContinueStatus::ContinueThread
    }

    fn on_thread_exited(&mut self, _info: &ExitThreadDebugInfo) -> ContinueStatus {
        ContinueStatus::ContinueThread
    }

    fn on_process_exited(&mut self, _info: &ExitProcessDebugInfo) -> ContinueStatus {
        ContinueStatus::CloseSession
    }

    fn on_dll_loaded(&mut self, _info: &LoadDllDebugInfo) -> ContinueStatus {
        ContinueStatus::ContinueThread
    }

    fn on_dll_unloaded(&mut self, _info: &UnloadDllDebugInfo) -> ContinueStatus {
        ContinueStatus::ContinueThread
    }

    fn on_debug_string(&mut self, _info: &OutputDebugStringInfo) -> ContinueStatus {
        ContinueStatus::ContinueThread
    }

    fn on_rip_event(&mut self, _info: &RipInfo) -> ContinueStatus {
        ContinueStatus::ContinueThread
    }
}

/// a session with only the default behaviors
pub struct BasicSession {
    debuggee: Debuggee,
}

impl BasicSession {
    pub fn spawn(params: &SpawnParams) -> Result<Self> {
        Ok(Self {
            debuggee: Debuggee::spawn(params)?,
        })
    }
}

impl DebugSession for BasicSession {
    fn debuggee(&self) -> &Debuggee {
        &self.debuggee
    }

    fn debuggee_mut(&mut self) -> &mut Debuggee {
        &mut self.debuggee
    }
}

#[repr(C)]
struct StartupInfoW {
    cb: u32,
    reserved: *mut u16,
    desktop: *mut u16,
    title: *mut u16,
    x: u32,
    y: u32,
    x_size: u32,
    y_size: u32,
    x_count_chars: u32,
    y_count_chars: u32,
    fill_attribute: u32,
    flags: u32,
    show_window: u16,
    cb_reserved2: u16,
    lp_reserved2: *mut u8,
    std_input: RawHandle,
    std_output: RawHandle,
    std_error: RawHandle,
}

#[repr(C)]
struct ProcessInformation {
    process: RawHandle,
    thread: RawHandle,
    process_id: u32,
    thread_id: u32,
}

#[link(name = "kernel32")]
extern "system" {
    fn CreateProcessW(
        lpApplicationName: *const u16,
        lpCommandLine: *mut u16,
        lpProcessAttributes: *mut core::ffi::c_void,
        lpThreadAttributes: *mut core::ffi::c_void,
        bInheritHandles: i32,
        dwCreationFlags: u32,
        lpEnvironment: *mut core::ffi::c_void,
        lpCurrentDirectory: *const u16,
        lpStartupInfo: *const StartupInfoW,
        lpProcessInformation: *mut ProcessInformation,
    ) -> i32;

    fn DebugActiveProcessStop(dwProcessId: u32) -> i32;
    fn TerminateProcess(hProcess: RawHandle, uExitCode: u32) -> i32;
    fn CloseHandle(hObject: RawHandle) -> i32;
    fn GetLastError() -> u32;
}
