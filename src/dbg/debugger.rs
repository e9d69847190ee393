//! Debug event loop
//!
//! Multiplexes one native debug event queue over any number of sessions.
//! Sessions are shared-ownership so callers can keep weak handles while
//! the debugger drives them; the whole loop is single-threaded.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use log::warn;

use crate::handle::RawHandle;

use super::event::{DebugEvent, DebugEventRaw};
use super::session::{ContinueStatus, DebugSession, EndOption, PreEvent};

const INFINITE: u32 = 0xFFFF_FFFF;
const DBG_CONTINUE: u32 = 0x0001_0002;
const DBG_EXCEPTION_NOT_HANDLED: u32 = 0x8001_0001;

/// why the event loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopResult {
    /// every session closed or detached
    AllDetached,
    /// `request_exit` was called
    ExitRequested,
    /// the OS event wait failed; sessions are left as they were
    ErrorOccurred,
}

/// routes debug events to their owning sessions
pub struct Debugger {
    sessions: HashMap<u32, Rc<RefCell<dyn DebugSession>>>,
    exit_requested: bool,
}

impl Debugger {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            exit_requested: false,
        }
    }

    /// register a session, returning a weak handle to it
    ///
    /// fails when the session's debuggee is invalid or its process id is
    /// already registered.
    pub fn add_session<S: DebugSession + 'static>(&mut self, session: S) -> Option<Weak<RefCell<S>>> {
        if !session.debuggee().is_valid() {
            return None;
        }

        let id = session.id();
        if self.sessions.contains_key(&id) {
            return None;
        }

        let shared = Rc::new(RefCell::new(session));
        let weak = Rc::downgrade(&shared);
        self.sessions.insert(id, shared);
        Some(weak)
    }

    /// end and drop one session
    pub fn remove_session(&mut self, id: u32, option: EndOption) -> bool {
        match self.sessions.remove(&id) {
            Some(session) => {
                session.borrow_mut().debuggee_mut().end(option);
                true
            }
            None => false,
        }
    }

    /// end and drop every session
    pub fn remove_all_sessions(&mut self, option: EndOption) {
        for session in self.sessions.values() {
            session.borrow_mut().debuggee_mut().end(option);
        }
        self.sessions.clear();
    }

    /// ids of the registered sessions
    pub fn session_ids(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    /// ask the event loop to return after the current event
    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    /// wait on the debug event queue and dispatch until all sessions are
    /// gone, an exit is requested, or the wait fails
    ///
    /// must run on the thread that spawned the debuggees; the OS binds a
    /// debuggee to its creator's event queue.
    pub fn run(&mut self) -> EventLoopResult {
        self.exit_requested = false;
        while !self.exit_requested {
            if self.sessions.is_empty() {
                return EventLoopResult::AllDetached;
            }

            let mut raw = DebugEventRaw::zeroed();
            // SAFETY: out-pointer is a valid DEBUG_EVENT; the call suspends
            // until a debuggee reports
            if unsafe { WaitForDebugEvent(&mut raw, INFINITE) } == 0 {
                return EventLoopResult::ErrorOccurred;
            }

            let Some(session) = self.sessions.get(&raw.process_id).cloned() else {
                warn!("debug event {} for unknown pid {}", raw.event_code, raw.process_id);
                continue;
            };

            session.borrow_mut().on_pre_event(PreEvent {
                event_code: raw.event_code,
                thread_id: raw.thread_id,
            });

            let status = dispatch(&mut *session.borrow_mut(), &raw);

            // SAFETY: echoes back the ids of the event just waited on
            unsafe {
                ContinueDebugEvent(
                    raw.process_id,
                    raw.thread_id,
                    if status == ContinueStatus::NotHandled {
                        DBG_EXCEPTION_NOT_HANDLED
                    } else {
                        DBG_CONTINUE
                    },
                );
            }

            if status == ContinueStatus::CloseSession {
                self.remove_session(raw.process_id, EndOption::Detach);
            }
        }

        EventLoopResult::ExitRequested
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.remove_all_sessions(EndOption::Kill);
    }
}

/// call the matching handler and release the handles the OS handed over
fn dispatch(session: &mut dyn DebugSession, raw: &DebugEventRaw) -> ContinueStatus {
    match raw.decode() {
        DebugEvent::Exception(info) => session.on_exception(&info),
        DebugEvent::ThreadCreated(info) => session.on_thread_created(&info),
        DebugEvent::ProcessCreated(info) => {
            let status = session.on_process_created(&info);
            close_conveyed_handle(info.file);
            status
        }
        DebugEvent::ThreadExited(info) => session.on_thread_exited(&info),
        DebugEvent::ProcessExited(info) => session.on_process_exited(&info),
        DebugEvent::DllLoaded(info) => {
            let status = session.on_dll_loaded(&info);
            close_conveyed_handle(info.file);
            status
        }
        DebugEvent::DllUnloaded(info) => session.on_dll_unloaded(&info),
        DebugEvent::StringOutput(info) => session.on_debug_string(&info),
        DebugEvent::Rip(info) => session.on_rip_event(&info),
        DebugEvent::Unknown(_) => ContinueStatus::ContinueThread,
    }
}

fn close_conveyed_handle(handle: RawHandle) {
    if !handle.is_null() {
        // SAFETY: the OS transferred this handle to the debugger
        unsafe {
            CloseHandle(handle);
        }
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn WaitForDebugEvent(lpDebugEvent: *mut DebugEventRaw, dwMilliseconds: u32) -> i32;
    fn ContinueDebugEvent(dwProcessId: u32, dwThreadId: u32, dwContinueStatus: u32) -> i32;
    fn CloseHandle(hObject: RawHandle) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_loop_detaches_immediately() {
        let mut debugger = Debugger::new();
        assert_eq!(debugger.run(), EventLoopResult::AllDetached);
    }

    #[test]
    fn test_remove_unknown_session() {
        let mut debugger = Debugger::new();
        assert!(!debugger.remove_session(0xFFFF_FFF0, EndOption::Detach));
        assert!(debugger.session_ids().is_empty());
    }
}
