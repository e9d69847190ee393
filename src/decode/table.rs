//! Closed opcode table for length decoding
//!
//! Covers the instructions that dominate compiler-generated prologs. Each
//! entry carries the opcode bytes, an optional `/digit` (ModR/M `reg` field
//! used as an opcode extension), the operand kinds, and decode quirks.

use bitflags::bitflags;

bitflags! {
    /// operand kinds an opcode may carry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Operands: u8 {
        const IMM8 = 1;
        const IMM16 = 1 << 1;
        const IMM32 = 1 << 2;
        const REG = 1 << 3;
        const RM = 1 << 4;
        /// memory offsets; only used in MOV (A0-A3)
        const MOFFS = 1 << 5;
        /// operand encoded in the lowest 3 bits of the opcode byte
        const IN_OPCODE = 1 << 6;
    }
}

bitflags! {
    /// decode quirks
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Quirks: u8 {
        /// imm32 widens to imm64 under REX.W
        const IMM64_WITH_REXW = 1;
        /// the immediate is really an IP-relative displacement; applies to
        /// instructions that do not use ModR/M for it, on every arch
        const IMM_AS_DISP = 1 << 1;
        /// valid in 32-bit mode only
        const X86_ONLY = 1 << 2;
    }
}

/// one or two opcode bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub len: u8,
    pub bytes: [u8; 2],
}

impl Opcode {
    pub const fn one(byte: u8) -> Self {
        Self { len: 1, bytes: [byte, 0] }
    }

    pub const fn two(first: u8, second: u8) -> Self {
        Self { len: 2, bytes: [first, second] }
    }

    pub const fn last(self) -> u8 {
        self.bytes[self.len as usize - 1]
    }
}

/// one table entry
#[derive(Debug, Clone, Copy)]
pub struct OpcodeDef {
    pub opcode: Opcode,
    /// ModR/M `reg` digit required for a match, if any
    pub digit: Option<u8>,
    pub operands: Operands,
    pub quirks: Quirks,
}

const fn plain(opcode: Opcode) -> OpcodeDef {
    with(opcode, Operands::empty())
}

const fn with(opcode: Opcode, operands: Operands) -> OpcodeDef {
    OpcodeDef { opcode, digit: None, operands, quirks: Quirks::empty() }
}

const fn quirky(opcode: Opcode, operands: Operands, quirks: Quirks) -> OpcodeDef {
    OpcodeDef { opcode, digit: None, operands, quirks }
}

const fn digit(opcode: Opcode, digit: u8, operands: Operands) -> OpcodeDef {
    OpcodeDef { opcode, digit: Some(digit), operands, quirks: Quirks::empty() }
}

const RM_REG: Operands = Operands::RM.union(Operands::REG);
const REG_RM: Operands = Operands::REG.union(Operands::RM);
const RM_IMM8: Operands = Operands::RM.union(Operands::IMM8);
const RM_IMM32: Operands = Operands::RM.union(Operands::IMM32);

const fn op1(byte: u8) -> Opcode {
    Opcode::one(byte)
}

const fn op2(second: u8) -> Opcode {
    Opcode::two(0x0F, second)
}

pub const OPCODE_TABLE: &[OpcodeDef] = &[
    // ADD
    with(op1(0x00), RM_REG),
    with(op1(0x01), RM_REG),
    with(op1(0x02), REG_RM),
    with(op1(0x03), REG_RM),
    with(op1(0x04), Operands::IMM8),
    with(op1(0x05), Operands::IMM32),
    digit(op1(0x80), 0, RM_IMM8),
    digit(op1(0x81), 0, RM_IMM32),
    digit(op1(0x83), 0, RM_IMM8),
    // AND
    with(op1(0x20), RM_REG),
    with(op1(0x21), RM_REG),
    with(op1(0x22), REG_RM),
    with(op1(0x23), REG_RM),
    with(op1(0x24), Operands::IMM8),
    with(op1(0x25), Operands::IMM32),
    digit(op1(0x80), 4, RM_IMM8),
    digit(op1(0x81), 4, RM_IMM32),
    digit(op1(0x83), 4, RM_IMM8),
    // BSWAP
    with(op2(0xC8), Operands::IN_OPCODE),
    // BTR
    with(op2(0xB3), RM_REG),
    digit(op2(0xBA), 6, RM_IMM8),
    // CALL; far "9A" and "FF /3" are unsupported
    quirky(op1(0xE8), Operands::IMM32, Quirks::IMM_AS_DISP),
    digit(op1(0xFF), 2, Operands::RM),
    // CBW
    plain(op1(0x98)),
    // CMP
    with(op1(0x38), RM_REG),
    with(op1(0x39), RM_REG),
    with(op1(0x3A), REG_RM),
    with(op1(0x3B), REG_RM),
    with(op1(0x3C), Operands::IMM8),
    with(op1(0x3D), Operands::IMM32),
    digit(op1(0x80), 7, RM_IMM8),
    digit(op1(0x81), 7, RM_IMM32),
    digit(op1(0x83), 7, RM_IMM8),
    // DEC; "48+r" decodes as a REX prefix in 64-bit mode
    quirky(op1(0x48), Operands::IN_OPCODE, Quirks::X86_ONLY),
    digit(op1(0xFE), 1, Operands::RM),
    digit(op1(0xFF), 1, Operands::RM),
    // INT3
    plain(op1(0xCC)),
    // Jcc, short forms
    quirky(op1(0x70), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x71), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x72), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x73), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x74), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x75), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x76), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x77), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x78), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x79), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x7A), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x7B), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x7C), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x7D), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x7E), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0x7F), Operands::IMM8, Quirks::IMM_AS_DISP),
    quirky(op1(0xE3), Operands::IMM8, Quirks::IMM_AS_DISP),
    // Jcc, near forms
    quirky(op2(0x80), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x81), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x82), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x83), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x84), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x85), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x86), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x87), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x88), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x89), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x8A), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x8B), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x8C), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x8D), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x8E), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op2(0x8F), Operands::IMM32, Quirks::IMM_AS_DISP),
    // JMP; far "EA" and "FF /5" are unsupported
    quirky(op1(0xE9), Operands::IMM32, Quirks::IMM_AS_DISP),
    quirky(op1(0xEB), Operands::IMM8, Quirks::IMM_AS_DISP),
    digit(op1(0xFF), 4, Operands::RM),
    // LEA
    with(op1(0x8D), REG_RM),
    // LEAVE
    plain(op1(0xC9)),
    // MOV
    with(op1(0x88), RM_REG),
    with(op1(0x89), RM_REG),
    with(op1(0x8A), REG_RM),
    with(op1(0x8B), REG_RM),
    with(op1(0x8C), RM_REG),
    with(op1(0x8E), REG_RM),
    with(op1(0xA0), Operands::MOFFS),
    with(op1(0xA1), Operands::MOFFS),
    with(op1(0xA2), Operands::MOFFS),
    with(op1(0xA3), Operands::MOFFS),
    with(op1(0xB0), Operands::IN_OPCODE.union(Operands::IMM8)),
    quirky(
        op1(0xB8),
        Operands::IN_OPCODE.union(Operands::IMM32),
        Quirks::IMM64_WITH_REXW,
    ),
    digit(op1(0xC6), 0, RM_IMM8),
    digit(op1(0xC7), 0, RM_IMM32),
    // MOVSX/MOVSXD
    with(op2(0xBE), REG_RM),
    with(op2(0xBF), REG_RM),
    with(op1(0x63), REG_RM),
    // MOVUPS
    with(op2(0x10), REG_RM),
    with(op2(0x11), RM_REG),
    // MOVZX
    with(op2(0xB6), REG_RM),
    with(op2(0xB7), REG_RM),
    // NOP
    plain(op1(0x90)),
    digit(op2(0x1F), 0, Operands::RM),
    // OR
    with(op1(0x08), RM_REG),
    with(op1(0x09), RM_REG),
    with(op1(0x0A), REG_RM),
    with(op1(0x0B), REG_RM),
    with(op1(0x0C), Operands::IMM8),
    with(op1(0x0D), Operands::IMM32),
    digit(op1(0x80), 1, RM_IMM8),
    digit(op1(0x81), 1, RM_IMM32),
    digit(op1(0x83), 1, RM_IMM8),
    // PUSH
    plain(op1(0x06)),
    plain(op1(0x0E)),
    plain(op1(0x16)),
    plain(op1(0x1E)),
    with(op1(0x50), Operands::IN_OPCODE),
    with(op1(0x68), Operands::IMM32),
    with(op1(0x6A), Operands::IMM8),
    digit(op1(0xFF), 6, Operands::RM),
    // RET
    with(op1(0xC2), Operands::IMM16),
    plain(op1(0xC3)),
    with(op1(0xCA), Operands::IMM16),
    plain(op1(0xCB)),
    // SAL/SHL
    digit(op1(0xC0), 4, RM_IMM8),
    digit(op1(0xC1), 4, RM_IMM8),
    digit(op1(0xD0), 4, Operands::RM),
    digit(op1(0xD1), 4, Operands::RM),
    digit(op1(0xD2), 4, Operands::RM),
    digit(op1(0xD3), 4, Operands::RM),
    // SAR
    digit(op1(0xC0), 7, RM_IMM8),
    digit(op1(0xC1), 7, RM_IMM8),
    digit(op1(0xD0), 7, Operands::RM),
    digit(op1(0xD1), 7, Operands::RM),
    digit(op1(0xD2), 7, Operands::RM),
    digit(op1(0xD3), 7, Operands::RM),
    // SHR
    digit(op1(0xC0), 5, RM_IMM8),
    digit(op1(0xC1), 5, RM_IMM8),
    digit(op1(0xD0), 5, Operands::RM),
    digit(op1(0xD1), 5, Operands::RM),
    digit(op1(0xD2), 5, Operands::RM),
    digit(op1(0xD3), 5, Operands::RM),
    // SUB
    with(op1(0x28), RM_REG),
    with(op1(0x29), RM_REG),
    with(op1(0x2A), REG_RM),
    with(op1(0x2B), REG_RM),
    with(op1(0x2C), Operands::IMM8),
    with(op1(0x2D), Operands::IMM32),
    digit(op1(0x80), 5, RM_IMM8),
    digit(op1(0x81), 5, RM_IMM32),
    digit(op1(0x83), 5, RM_IMM8),
    // TEST
    with(op1(0x84), RM_REG),
    with(op1(0x85), RM_REG),
    with(op1(0xA8), Operands::IMM8),
    with(op1(0xA9), Operands::IMM32),
    digit(op1(0xF6), 0, RM_IMM8),
    digit(op1(0xF7), 0, RM_IMM32),
    // XOR
    with(op1(0x30), RM_REG),
    with(op1(0x31), RM_REG),
    with(op1(0x32), REG_RM),
    with(op1(0x33), REG_RM),
    with(op1(0x34), Operands::IMM8),
    with(op1(0x35), Operands::IMM32),
    digit(op1(0x80), 6, RM_IMM8),
    digit(op1(0x81), 6, RM_IMM32),
    digit(op1(0x83), 6, RM_IMM8),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_last_byte() {
        assert_eq!(op1(0x50).last(), 0x50);
        assert_eq!(op2(0xB6).last(), 0xB6);
    }

    #[test]
    fn test_digit_entries_always_use_rm() {
        // a /digit lives in the ModR/M reg field, so every entry carrying one
        // must also consume a ModR/M byte
        for def in OPCODE_TABLE {
            if def.digit.is_some() {
                assert!(def.operands.contains(Operands::RM), "{:02x?}", def.opcode);
            }
        }
    }

    #[test]
    fn test_digits_in_range() {
        for def in OPCODE_TABLE {
            if let Some(d) = def.digit {
                assert!(d < 8);
            }
        }
    }
}
