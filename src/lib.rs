#![cfg(windows)]
#![deny(unsafe_op_in_unsafe_fn)]

//! gossamer: in-process instrumentation for x86/x64 Windows
//!
//! This library observes, modifies, and redirects the execution of
//! user-mode processes at the level of individual machine instructions:
//!
//! - Inline hooks with per-hook trampolines and automatic displacement
//!   fixups
//! - A partial instruction-length decoder covering compiler-generated
//!   prologs
//! - Trampoline slot pools kept within 32-bit displacement reach
//! - A debug-event loop over any number of debuggee processes
//! - DLL preloading into freshly spawned processes via forged loader calls
//!
//! # Hooking
//!
//! ```ignore
//! let mut hook = unsafe { gossamer::Hook::new(target as usize, detour as usize) };
//! hook.install()?;
//! // ... the detour chains onward through gossamer::trampoline_of(target as usize)
//! hook.uninstall()?;
//! ```
//!
//! # DLL preloading
//!
//! ```ignore
//! use gossamer::dbg::{Debugger, DllPreloadSession, PreloadOption, SpawnParams};
//!
//! let params = SpawnParams { image_path: r"C:\target.exe", ..Default::default() };
//! let session = DllPreloadSession::spawn(&params, r"C:\payload.dll", PreloadOption::EndSync)?;
//!
//! let mut debugger = Debugger::new();
//! debugger.add_session(session);
//! debugger.run();
//! ```

pub mod addr;
pub mod arch;
pub mod dbg;
pub mod decode;
pub mod dynlib;
pub mod error;
pub mod handle;
pub mod hook;
pub mod mem;
pub mod modules;
pub mod pe;
pub mod wstr;

// re-exports for convenience
pub use addr::{AddrRange, CodeAddr, ConstCodeAddr};
pub use arch::Arch;
pub use dbg::{Debugger, DllPreloadSession};
pub use error::{Error, Result};
pub use hook::{trampoline_of, Hook};

/// library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
