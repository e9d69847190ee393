//! Debugging support
//!
//! A single-threaded event loop over the native debug API, session types
//! with overridable per-event callbacks, hardware breakpoints, and the
//! thread-context DLL injection primitive.

pub mod breakpoint;
pub mod context;
pub mod debugger;
pub mod event;
pub mod inject;
pub mod preload;
pub mod session;

pub use context::DebugRegister;
pub use debugger::{Debugger, EventLoopResult};
pub use inject::ContextInjector;
pub use preload::{DllPreloadSession, PreloadOption};
pub use session::{
    BasicSession, ContinueStatus, DebugSession, Debuggee, EndOption, PreEvent, SpawnParams,
};
