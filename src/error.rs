//! Unified error types

use core::fmt;

use crate::addr::IntAddr;

/// all errors that can occur in gossamer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // === hook installation ===
    /// a hook is already installed at the target address
    AddressInUse { target: IntAddr },

    /// failed to decode the instructions of the target prolog
    PrologUnsupported { target: IntAddr },

    /// failed to allocate a trampoline slot reachable from the prolog
    TrampolineAllocFailed,

    /// the bytes at the target no longer match the prolog we installed
    PrologMismatched { target: IntAddr },

    /// failed to write to code memory
    AccessDenied { target: IntAddr },

    /// no hook is installed at the target address
    NotHooked { target: IntAddr },

    // === dll injection ===
    /// failed to capture the debuggee thread's register set
    GetContextFailed,

    /// failed to allocate or write the payload path in the debuggee
    DllPathNotWritten,

    /// failed to splice the forged frame into the debuggee stack
    StackFrameNotWritten,

    /// failed to write the mutated register set back
    SetContextFailed,

    // === process / module plumbing ===
    /// failed to spawn a debuggee process
    SpawnFailed { code: u32 },

    /// module with given name not found
    ModuleNotFound { name: String },

    /// symbol not exported by the library
    SymbolNotFound { library: String, symbol: String },

    /// loaded image does not carry a well-formed PE header
    InvalidPeImage { reason: &'static str },

    // === memory ===
    /// failed to change memory protection
    ProtectionChangeFailed { address: IntAddr, size: usize },

    /// failed to update a thread's debug registers
    BreakpointUpdateFailed,

    // === win32 ===
    /// underlying Win32 API returned error
    Win32Error { code: u32, context: &'static str },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressInUse { target } => {
                write!(f, "hook already installed at {target:#x}")
            }
            Self::PrologUnsupported { target } => {
                write!(f, "unsupported instruction in prolog at {target:#x}")
            }
            Self::TrampolineAllocFailed => {
                write!(f, "failed to allocate a reachable trampoline slot")
            }
            Self::PrologMismatched { target } => {
                write!(f, "installed prolog at {target:#x} was modified by someone else")
            }
            Self::AccessDenied { target } => {
                write!(f, "failed to write code bytes at {target:#x}")
            }
            Self::NotHooked { target } => {
                write!(f, "no hook installed at {target:#x}")
            }
            Self::GetContextFailed => {
                write!(f, "failed to capture debuggee thread context")
            }
            Self::DllPathNotWritten => {
                write!(f, "failed to write payload path into debuggee")
            }
            Self::StackFrameNotWritten => {
                write!(f, "failed to write forged stack frame into debuggee")
            }
            Self::SetContextFailed => {
                write!(f, "failed to write back debuggee thread context")
            }
            Self::SpawnFailed { code } => {
                write!(f, "failed to spawn debuggee process (error {code:#x})")
            }
            Self::ModuleNotFound { name } => {
                write!(f, "module not found: {name}")
            }
            Self::SymbolNotFound { library, symbol } => {
                write!(f, "symbol {library}!{symbol} not found")
            }
            Self::InvalidPeImage { reason } => {
                write!(f, "invalid PE image: {reason}")
            }
            Self::ProtectionChangeFailed { address, size } => {
                write!(
                    f,
                    "failed to change protection for {size} bytes at {address:#x}"
                )
            }
            Self::BreakpointUpdateFailed => {
                write!(f, "failed to update debug registers")
            }
            Self::Win32Error { code, context } => {
                write!(f, "Win32 error {code:#x} in {context}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// result type alias using Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// create Win32Error from GetLastError
    pub fn from_last_error(context: &'static str) -> Self {
        // SAFETY: GetLastError is always safe to call
        let code = unsafe { GetLastError() };
        Self::Win32Error { code, context }
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn GetLastError() -> u32;
}
