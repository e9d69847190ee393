//! Instruction length decoding
//!
//! A partial x86/x64 decoder that computes the byte length and structural
//! layout of one instruction at a time. It does not interpret operands; it
//! only needs to know how long an instruction is and whether it carries an
//! IP-relative displacement that would go stale if the bytes were copied
//! somewhere else. The supported opcode set lives in [`table`] and covers
//! what compilers emit in function prologs.

pub mod table;

use crate::addr::ConstCodeAddr;
use crate::arch::Arch;

use table::{Opcode, Operands, Quirks, OPCODE_TABLE};

/// structural layout of a single decoded instruction
///
/// total length is the sum of the component lengths plus one byte for each
/// present prefix, ModR/M, and SIB flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructionLayout {
    /// segment override: any of 2E, 36, 3E, 26, 64, 65
    pub prefix_seg: bool,
    /// operand-size override (0x66)
    pub prefix_66: bool,
    /// address-size override (0x67)
    pub prefix_67: bool,
    /// REX prefix (64-bit mode only)
    pub prefix_rex: bool,
    pub modrm: bool,
    pub sib: bool,
    /// set when the displacement is IP-based and must be rewritten if the
    /// instruction is relocated
    pub disp_needs_fixup: bool,
    /// opcode length in bytes (1 or 2)
    pub len_opcode: u8,
    /// displacement length in bytes (0/1/2/4)
    pub len_disp: u8,
    /// immediate length in bytes (0/1/2/4/8)
    pub len_imm: u8,
}

impl InstructionLayout {
    /// total instruction length in bytes
    pub fn total_len(&self) -> u8 {
        u8::from(self.prefix_seg)
            + u8::from(self.prefix_66)
            + u8::from(self.prefix_67)
            + u8::from(self.prefix_rex)
            + u8::from(self.modrm)
            + u8::from(self.sib)
            + self.len_opcode
            + self.len_disp
            + self.len_imm
    }
}

/// decoding cursor over a run of instructions
///
/// each call to [`Iterator::next`] decodes one instruction and advances the
/// cursor by its length; decoding stops at the first unsupported opcode.
pub struct LengthDecoder {
    arch: Arch,
    cursor: ConstCodeAddr,
}

impl LengthDecoder {
    /// create a decoder for the given mode
    ///
    /// # Safety
    /// `addr` must point at readable memory holding valid machine code for
    /// as long as the decoder is advanced
    pub unsafe fn new(arch: Arch, addr: ConstCodeAddr) -> Self {
        Self { arch, cursor: addr }
    }

    /// create a decoder using the build target's mode
    ///
    /// # Safety
    /// see [`LengthDecoder::new`]
    pub unsafe fn native(addr: ConstCodeAddr) -> Self {
        // SAFETY: forwarded to the caller
        unsafe { Self::new(Arch::native(), addr) }
    }

    /// address of the next undecoded instruction
    pub fn position(&self) -> ConstCodeAddr {
        self.cursor
    }
}

impl Iterator for LengthDecoder {
    type Item = InstructionLayout;

    fn next(&mut self) -> Option<InstructionLayout> {
        if self.cursor.is_null() {
            return None;
        }

        let layout = decode_at(self.arch, self.cursor)?;
        self.cursor = self.cursor.offset(layout.total_len() as isize);
        Some(layout)
    }
}

/// decode the layout of the instruction at `addr`
///
/// returns None when the opcode matches no table entry.
fn decode_at(arch: Arch, addr: ConstCodeAddr) -> Option<InstructionLayout> {
    let mut layout = InstructionLayout::default();
    let mut cursor = addr;
    let mut rex_w = false;

    // consume legacy prefixes, each kind at most once; REX must be the last
    // prefix before the opcode
    loop {
        // SAFETY: caller of the decoder guarantees readable code at the cursor
        let byte = unsafe { cursor.read::<u8>() };
        match byte {
            0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 if !layout.prefix_seg => {
                layout.prefix_seg = true;
            }
            0x66 if !layout.prefix_66 => layout.prefix_66 = true,
            0x67 if !layout.prefix_67 => layout.prefix_67 = true,
            byte if arch == Arch::X64 && byte & 0xF0 == 0x40 => {
                layout.prefix_rex = true;
                rex_w = byte & 0x08 != 0;
                cursor = cursor.offset(1);
                break;
            }
            _ => break,
        }
        cursor = cursor.offset(1);
    }

    // SAFETY: same as above
    let first = unsafe { cursor.read::<u8>() };
    let opcode = if first == 0x0F {
        // SAFETY: a 0x0F escape byte is always followed by the second opcode byte
        Opcode::two(0x0F, unsafe { cursor.offset(1).read::<u8>() })
    } else {
        Opcode::one(first)
    };

    // ModR/M follows the opcode; read lazily so instructions without one
    // never touch the byte
    let modrm_addr = cursor.offset(opcode.len as isize);
    // SAFETY: only invoked for opcodes whose encoding includes ModR/M
    let read_modrm = || unsafe { modrm_addr.read::<u8>() };

    let mut matched = None;
    for def in OPCODE_TABLE {
        if def.quirks.contains(Quirks::X86_ONLY) && arch != Arch::X86 {
            continue;
        }

        if def.operands.contains(Operands::IN_OPCODE) {
            // operand lives in the low 3 bits; match the high 5 only
            if opcode.len == def.opcode.len && opcode.last() & 0xF8 == def.opcode.last() {
                matched = Some(def);
                break;
            }
        } else if opcode == def.opcode {
            if let Some(required) = def.digit {
                if (read_modrm() >> 3) & 0x07 != required {
                    continue;
                }
            }
            matched = Some(def);
            break;
        }
    }
    let def = matched?;

    layout.len_opcode = opcode.len;
    layout.modrm = def.operands.intersects(Operands::REG | Operands::RM);

    let (modrm_mod, modrm_rm) = if layout.modrm {
        let byte = read_modrm();
        (byte >> 6, byte & 0x07)
    } else {
        (0, 0)
    };
    layout.sib = def.operands.contains(Operands::RM) && modrm_mod != 0b11 && modrm_rm == 0b100;

    // displacement
    if def.operands.contains(Operands::RM) {
        if modrm_mod == 0b01 {
            layout.len_disp = 1;
        } else if modrm_mod == 0b10 {
            layout.len_disp = if layout.prefix_66 { 2 } else { 4 };
        } else if modrm_mod == 0b00 && modrm_rm == 0b101 {
            // the IP-relative form in 64-bit mode; plain disp32 in 32-bit
            layout.disp_needs_fixup = arch == Arch::X64;
            layout.len_disp = 4;
        } else if layout.sib {
            // SAFETY: sib is only set for encodings that carry the byte
            let sib = unsafe { modrm_addr.offset(1).read::<u8>() };
            if sib & 0x07 == 0b101 {
                layout.len_disp = if modrm_mod == 0b01 { 1 } else { 4 };
            }
        }
    }

    // immediate
    if def.operands.contains(Operands::IMM8) {
        layout.len_imm = 1;
    } else if def.operands.contains(Operands::IMM16) {
        layout.len_imm = 2;
    } else if def.operands.contains(Operands::IMM32) {
        layout.len_imm = if def.quirks.contains(Quirks::IMM64_WITH_REXW) && rex_w {
            8
        } else if layout.prefix_66 {
            2
        } else {
            4
        };
    } else if def.operands.contains(Operands::MOFFS) {
        // rare, but cheap to support; the 0x67 prefix halves the offset width
        layout.len_imm = match arch {
            Arch::X64 => {
                if layout.prefix_67 {
                    4
                } else {
                    8
                }
            }
            Arch::X86 => {
                if layout.prefix_67 {
                    2
                } else {
                    4
                }
            }
        };
    }

    if def.quirks.contains(Quirks::IMM_AS_DISP) {
        // instruction must not already carry a displacement
        debug_assert_eq!(layout.len_disp, 0);
        layout.disp_needs_fixup = true;
        layout.len_disp = layout.len_imm;
        layout.len_imm = 0;
    }

    Some(layout)
}
