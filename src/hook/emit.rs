//! Jump idiom emitters
//!
//! Byte-exact encoders for the five jump forms used by hooks and
//! trampolines. Each writes into a caller-supplied buffer and returns the
//! number of bytes written; buffers shorter than the emitted sequence are a
//! programmer error.

/// length of [`abs_jmp_rax`]
pub const ABS_JMP_RAX_LEN: usize = 12;
/// length of [`abs_jmp_noclobber_64`]
pub const ABS_JMP_NOCLOBBER_64_LEN: usize = 14;
/// length of [`abs_jmp_noclobber_32`]
pub const ABS_JMP_NOCLOBBER_32_LEN: usize = 6;
/// length of [`rel_near_jmp32`]
pub const REL_NEAR_JMP32_LEN: usize = 5;
/// length of [`rel_short_jmp8`]
pub const REL_SHORT_JMP8_LEN: usize = 2;

/// `mov rax, imm64` + `jmp rax`
///
/// clobbers RAX, so this form is reserved for hook prologs where the
/// register holds nothing of value at function entry.
pub fn abs_jmp_rax(target: u64, out: &mut [u8]) -> usize {
    out[0] = 0x48; // REX.W
    out[1] = 0xB8; // mov rax, imm64
    out[2..10].copy_from_slice(&target.to_le_bytes());
    out[10] = 0xFF;
    out[11] = 0xE0; // jmp rax; mod=11b, reg=4, r/m=0
    ABS_JMP_RAX_LEN
}

/// `push imm32` + `mov dword ptr [rsp+4], imm32` + `ret`
///
/// longer than [`abs_jmp_rax`] but side-effect free; trampolines use this
/// form so the relocated prolog sees untouched registers.
pub fn abs_jmp_noclobber_64(target: u64, out: &mut [u8]) -> usize {
    let low = target as u32;
    let high = (target >> 32) as u32;

    out[0] = 0x68; // push imm32 (sign-extended; low half of the address)
    out[1..5].copy_from_slice(&low.to_le_bytes());
    out[5] = 0xC7; // mov /0
    out[6] = 0x44; // mod=01b, reg=0, r/m=100b
    out[7] = 0x24; // ss=00b, index=100b, base=100b
    out[8] = 0x04; // disp8: the high half of the pushed slot
    out[9..13].copy_from_slice(&high.to_le_bytes());
    out[13] = 0xC3; // ret
    ABS_JMP_NOCLOBBER_64_LEN
}

/// `push imm32` + `ret`, the 32-bit trampoline jump
pub fn abs_jmp_noclobber_32(target: u32, out: &mut [u8]) -> usize {
    out[0] = 0x68; // push imm32
    out[1..5].copy_from_slice(&target.to_le_bytes());
    out[5] = 0xC3; // ret
    ABS_JMP_NOCLOBBER_32_LEN
}

/// `jmp rel32`; the displacement is relative to the end of the instruction
pub fn rel_near_jmp32(origin: u64, target: u64, out: &mut [u8]) -> usize {
    let disp = target
        .wrapping_sub(origin)
        .wrapping_sub(REL_NEAR_JMP32_LEN as u64) as u32;

    out[0] = 0xE9;
    out[1..5].copy_from_slice(&disp.to_le_bytes());
    REL_NEAR_JMP32_LEN
}

/// `jmp rel8`
pub fn rel_short_jmp8(offset: i8, out: &mut [u8]) -> usize {
    out[0] = 0xEB;
    out[1] = offset as u8;
    REL_SHORT_JMP8_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abs_jmp_rax_encoding() {
        let mut buf = [0u8; ABS_JMP_RAX_LEN];
        let written = abs_jmp_rax(0xBBAA_7856_0000_3412, &mut buf);
        assert_eq!(written, 12);
        assert_eq!(
            buf,
            [0x48, 0xB8, 0x12, 0x34, 0x00, 0x00, 0x56, 0x78, 0xAA, 0xBB, 0xFF, 0xE0]
        );
    }

    #[test]
    fn test_abs_jmp_noclobber_64_encoding() {
        let mut buf = [0u8; ABS_JMP_NOCLOBBER_64_LEN];
        let written = abs_jmp_noclobber_64(0x1122_3344_5566_7788, &mut buf);
        assert_eq!(written, 14);
        assert_eq!(
            buf,
            [
                0x68, 0x88, 0x77, 0x66, 0x55, // push 55667788h
                0xC7, 0x44, 0x24, 0x04, 0x44, 0x33, 0x22, 0x11, // mov [rsp+4], 11223344h
                0xC3,
            ]
        );
    }

    #[test]
    fn test_abs_jmp_noclobber_32_encoding() {
        let mut buf = [0u8; ABS_JMP_NOCLOBBER_32_LEN];
        let written = abs_jmp_noclobber_32(0x4433_2211, &mut buf);
        assert_eq!(written, 6);
        assert_eq!(buf, [0x68, 0x11, 0x22, 0x33, 0x44, 0xC3]);
    }

    #[test]
    fn test_rel_near_jmp32_forward_and_back() {
        let mut buf = [0u8; REL_NEAR_JMP32_LEN];
        rel_near_jmp32(0x1000, 0x1100, &mut buf);
        assert_eq!(buf[0], 0xE9);
        assert_eq!(i32::from_le_bytes(buf[1..5].try_into().unwrap()), 0xFB);

        rel_near_jmp32(0x2000, 0x1105, &mut buf);
        assert_eq!(i32::from_le_bytes(buf[1..5].try_into().unwrap()), -0xF00);
    }

    #[test]
    fn test_rel_short_jmp8_encoding() {
        let mut buf = [0u8; REL_SHORT_JMP8_LEN];
        let written = rel_short_jmp8(-2, &mut buf);
        assert_eq!(written, 2);
        assert_eq!(buf, [0xEB, 0xFE]);
    }
}
