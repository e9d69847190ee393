//! DLL preloading session
//!
//! Spawns a process and injects a payload DLL before its first user
//! instruction runs: a hardware breakpoint is armed at the OS-reported
//! entry point, and when it fires the injection primitive forges a call
//! to the library loader. The debuggee never has to cooperate.

use log::warn;

use crate::addr::ConstCodeAddr;
use crate::error::Result;
use crate::handle::RawHandle;
use crate::wstr::from_wide;

use super::breakpoint;
use super::context::DebugRegister;
use super::event::{
    CreateProcessDebugInfo, ExceptionDebugInfo, LoadDllDebugInfo, EXCEPTION_BREAKPOINT,
    EXCEPTION_SINGLE_STEP,
};
use super::inject::ContextInjector;
use super::session::{ContinueStatus, DebugSession, Debuggee, SpawnParams};

const MAX_PATH: usize = 260;
const FILE_NAME_NORMALIZED: u32 = 0;

/// when a preload session considers itself done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadOption {
    /// close once the debuggee's loader reports a module matching the
    /// payload path
    EndSync,
    /// close as soon as the injection has been armed
    EndAsync,
    /// stay attached
    KeepAlive,
}

/// a [`DebugSession`] that preloads one DLL at the debuggee's entry point
pub struct DllPreloadSession {
    debuggee: Debuggee,
    main_thread: RawHandle,
    payload_path: String,
    option: PreloadOption,
}

impl DllPreloadSession {
    pub fn spawn(
        params: &SpawnParams,
        payload_path: &str,
        option: PreloadOption,
    ) -> Result<Self> {
        Ok(Self {
            debuggee: Debuggee::spawn(params)?,
            main_thread: core::ptr::null_mut(),
            payload_path: payload_path.to_string(),
            option,
        })
    }
}

impl DebugSession for DllPreloadSession {
    fn debuggee(&self) -> &Debuggee {
        &self.debuggee
    }

    fn debuggee_mut(&mut self) -> &mut Debuggee {
        &mut self.debuggee
    }

    fn on_process_created(&mut self, info: &CreateProcessDebugInfo) -> ContinueStatus {
        self.main_thread = info.thread;

        // arm the entry point; the OS reports it in the create event
        let entry = ConstCodeAddr::new(info.start_address);
        if let Err(error) = breakpoint::enable(self.main_thread, entry, DebugRegister::Dr0) {
            warn!("failed to arm entry breakpoint for pid {}: {error}", self.id());
        }

        ContinueStatus::ContinueThread
    }

    fn on_exception(&mut self, info: &ExceptionDebugInfo) -> ContinueStatus {
        match info.code() {
            // the entry-point hardware breakpoint
            EXCEPTION_SINGLE_STEP => {
                if let Err(error) = breakpoint::disable(self.main_thread, DebugRegister::Dr0) {
                    warn!("failed to disarm entry breakpoint: {error}");
                }

                let armed = ContextInjector::new(self.debuggee.process(), self.main_thread)
                    .and_then(|injector| injector.inject(&self.payload_path));
                if let Err(error) = armed {
                    warn!("preload injection into pid {} failed: {error}", self.id());
                }

                if self.option == PreloadOption::EndAsync {
                    ContinueStatus::CloseSession
                } else {
                    ContinueStatus::ContinueThread
                }
            }

            // the initial breakpoint the OS raises on attach; swallow it
            EXCEPTION_BREAKPOINT => ContinueStatus::ContinueThread,

            _ => ContinueStatus::NotHandled,
        }
    }

    fn on_dll_loaded(&mut self, info: &LoadDllDebugInfo) -> ContinueStatus {
        if self.option != PreloadOption::EndSync {
            return ContinueStatus::ContinueThread;
        }

        if let Some(path) = final_path_of(info.file) {
            if path
                .to_lowercase()
                .contains(&self.payload_path.to_lowercase())
            {
                return ContinueStatus::CloseSession;
            }
        }
        ContinueStatus::ContinueThread
    }
}

/// resolve the path behind a file handle the loader event conveyed
fn final_path_of(file: RawHandle) -> Option<String> {
    if file.is_null() {
        return None;
    }

    let mut buffer = [0u16; MAX_PATH];
    // SAFETY: out-buffer has MAX_PATH slots
    let length = unsafe {
        GetFinalPathNameByHandleW(
            file,
            buffer.as_mut_ptr(),
            buffer.len() as u32,
            FILE_NAME_NORMALIZED,
        )
    };
    if length == 0 || length as usize > buffer.len() {
        return None;
    }
    Some(from_wide(&buffer))
}

#[link(name = "kernel32")]
extern "system" {
    fn GetFinalPathNameByHandleW(
        hFile: RawHandle,
        lpszFilePath: *mut u16,
        cchFilePath: u32,
        dwFlags: u32,
    ) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbg::debugger::{Debugger, EventLoopResult};
    use crate::modules;

    fn system_binary(name: &str) -> String {
        let mut buffer = [0u16; MAX_PATH];
        // SAFETY: out-buffer has MAX_PATH slots
        let length = unsafe { GetSystemDirectoryW(buffer.as_mut_ptr(), buffer.len() as u32) };
        assert!(length > 0 && (length as usize) < buffer.len());
        format!("{}\\{}", from_wide(&buffer), name)
    }

    // spawn notepad and have it pull calc.exe into memory before its
    // entry point runs
    #[test]
    fn test_preload_into_fresh_process() {
        const PAYLOAD: &str = "calc.exe";

        let image = system_binary("notepad.exe");
        let params = SpawnParams {
            image_path: &image,
            ..Default::default()
        };

        let mut debugger = Debugger::new();
        let session = debugger
            .add_session(
                DllPreloadSession::spawn(&params, PAYLOAD, PreloadOption::EndSync).unwrap(),
            )
            .expect("session should register");

        let strong = session.upgrade().unwrap();
        let pid = strong.borrow().id();
        let process = crate::handle::OwnedHandle::duplicate(strong.borrow().debuggee().process())
            .unwrap();
        drop(strong);

        assert_eq!(debugger.run(), EventLoopResult::AllDetached);

        let loaded = modules::contains_module(pid, PAYLOAD).unwrap();
        assert!(loaded, "payload not present in module snapshot");

        // SAFETY: we hold a duplicated handle with terminate rights
        unsafe { TerminateProcess(process.raw(), 0) };
    }

    #[link(name = "kernel32")]
    extern "system" {
        fn GetSystemDirectoryW(lpBuffer: *mut u16, uSize: u32) -> u32;
        fn TerminateProcess(hProcess: RawHandle, uExitCode: u32) -> i32;
    }
}
