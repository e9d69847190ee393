//! Architecture selection

/// true if compiling for 64-bit
#[cfg(target_arch = "x86_64")]
pub const IS_64BIT: bool = true;

/// true if compiling for 64-bit
#[cfg(target_arch = "x86")]
pub const IS_64BIT: bool = false;

/// pointer size in bytes for current architecture
pub const PTR_SIZE: usize = core::mem::size_of::<usize>();

/// instruction-set mode a decoder operates in
///
/// most of the crate infers the mode from the build target; the length
/// decoder takes it explicitly so 32-bit code can be decoded from a
/// 64-bit process and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// 32-bit protected mode (IA-32)
    X86,
    /// 64-bit long mode
    X64,
}

impl Arch {
    /// the mode matching the build target
    pub const fn native() -> Self {
        if IS_64BIT {
            Self::X64
        } else {
            Self::X86
        }
    }

    pub const fn is_64bit(self) -> bool {
        matches!(self, Self::X64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_matches_build() {
        assert_eq!(Arch::native().is_64bit(), IS_64BIT);
        assert_eq!(PTR_SIZE == 8, IS_64BIT);
    }
}
