//! Inline function hooking
//!
//! Redirects the first bytes of a target function to a user function and
//! synthesizes a per-hook trampoline that replays the displaced prolog
//! before resuming the original body. Strategy selection honors the
//! reachability limits of 32-bit displacements on x64.
//!
//! The following Win32 functions are used internally and must not be
//! hooked: `GetSystemInfo`, `VirtualProtect`, `VirtualQuery`.
//!
//! # Example
//!
//! ```ignore
//! static mut ORIGINAL: Option<extern "C" fn(i32) -> i32> = None;
//!
//! extern "C" fn detour(x: i32) -> i32 {
//!     let original = unsafe { ORIGINAL.unwrap() };
//!     original(x) + 1
//! }
//!
//! let mut hook = unsafe { Hook::new(target as usize, detour as usize) };
//! hook.install()?;
//! unsafe {
//!     ORIGINAL = Some(core::mem::transmute(trampoline_of(target as usize).unwrap()));
//! }
//! ```

pub mod emit;
pub mod registry;
pub mod trampoline;

use log::{debug, warn};

use crate::addr::{AddrRange, CodeAddr, ConstCodeAddr, IntAddr};
use crate::arch::IS_64BIT;
use crate::decode::LengthDecoder;
use crate::error::{Error, Result};
use crate::mem;

use registry::HookRecord;
use trampoline::SLOT_SIZE;

/// most bytes a hook may displace from a target prolog
pub const MAX_PROLOG_LEN: usize = 24;

// the relocated prolog and the resume jump must share one slot
const _: () = assert!(SLOT_SIZE >= MAX_PROLOG_LEN + emit::ABS_JMP_NOCLOBBER_64_LEN);

/// jump idiom chosen for one hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// 5-byte `jmp rel32`; the only strategy in 32-bit mode, and the x64
    /// fast path when the hook function is within ±2 GiB
    NearRel32,
    /// x64 only: a 2-byte short jump into nearby 0xCC padding where a full
    /// absolute jump is parked; `aux_offset` is the distance from the end
    /// of the short jump to that auxiliary slot
    ShortRelToAux { aux_offset: u8 },
    /// x64 fallback: `mov rax, imm64` + `jmp rax` written in place
    Absolute64,
}

/// raw prolog bytes with their length
#[derive(Debug, Clone, Copy)]
pub struct Prolog {
    pub(crate) bytes: [u8; MAX_PROLOG_LEN],
    pub(crate) len: u8,
}

impl Prolog {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Prolog {
    fn default() -> Self {
        Self {
            bytes: [0; MAX_PROLOG_LEN],
            len: 0,
        }
    }
}

/// one IP-relative displacement found in a copied prolog
#[derive(Debug, Clone, Copy)]
struct DispFixup {
    /// offset in the prolog where the disp32 field sits
    offset_data: u8,
    /// offset of the following instruction; displacements are relative to it
    offset_next: u8,
    /// absolute address the displacement resolves to
    target: IntAddr,
}

#[derive(Default)]
struct CopiedProlog {
    prolog: Prolog,
    fixups: Vec<DispFixup>,
}

/// an inline hook between two functions
///
/// `install` and `uninstall` are not safe to call concurrently with each
/// other, but a live hook may be invoked from any number of threads.
pub struct Hook {
    target: CodeAddr,
    detour: ConstCodeAddr,
    installed: bool,
}

impl Hook {
    /// pair a target function with its replacement
    ///
    /// # Safety
    /// both addresses must point at the entry of a function in this
    /// process, and stay valid for the lifetime of the hook
    pub unsafe fn new(target: IntAddr, detour: IntAddr) -> Self {
        debug_assert!(target != 0);
        debug_assert!(detour != 0);
        debug_assert!(target != detour);
        Self {
            target: CodeAddr::new(target),
            detour: ConstCodeAddr::new(detour),
            installed: false,
        }
    }

    /// redirect the target to the hook function
    pub fn install(&mut self) -> Result<()> {
        if self.installed {
            return Ok(());
        }

        let target = self.target.value();
        if registry::trampoline_of(target).is_some() {
            return Err(Error::AddressInUse { target });
        }

        // decide what gets written over the target prolog
        let mut strategy = determine_strategy(self.target.as_const(), self.detour);
        if let Strategy::ShortRelToAux { aux_offset } = strategy {
            // park the full jump in the padding first; fall back if the
            // padding is not writable
            if write_aux_jump(self.target, self.detour, aux_offset).is_err() {
                warn!("aux padding near {target:#x} not writable, using absolute jump");
                strategy = Strategy::Absolute64;
            }
        }

        let hook_prolog = emit_hook_prolog(self.target.as_const(), self.detour, strategy);
        let copied = copy_prolog(self.target.as_const(), hook_prolog.len)
            .ok_or(Error::PrologUnsupported { target })?;

        // relocated prolog plus the jump back to the rest of the function
        let slot_bytes = build_trampoline(self.target.as_const(), &copied.prolog);
        let range = addressable_range(target, &copied.fixups);
        let slot =
            trampoline::register(&slot_bytes, range).ok_or(Error::TrampolineAllocFailed)?;
        fixup_displacements(slot, &copied.fixups);

        let record = HookRecord {
            original: copied.prolog,
            installed: hook_prolog,
            trampoline: slot.value(),
            strategy,
        };
        if registry::insert(target, record) {
            // the redirect write is the last mutation; concurrent callers see
            // either the old bytes or the finished hook
            // SAFETY: target points at patchable code per Hook::new contract
            if unsafe { mem::write_code(self.target, hook_prolog.as_slice()) }.is_ok() {
                debug!(
                    "hooked {target:#x} -> {:#x} via {strategy:?}, trampoline at {:#x}",
                    self.detour.value(),
                    slot.value()
                );
                self.installed = true;
                return Ok(());
            }
            registry::remove(target);
        }

        trampoline::unregister(slot.value());
        if let Strategy::ShortRelToAux { aux_offset } = strategy {
            let _ = clear_aux_jump(self.target, aux_offset);
        }
        Err(Error::AccessDenied { target })
    }

    /// restore the original prolog
    pub fn uninstall(&mut self) -> Result<()> {
        let target = self.target.value();
        if !self.installed {
            return Err(Error::NotHooked { target });
        }

        let record = registry::lookup(target).ok_or(Error::NotHooked { target })?;

        // make sure nothing hooked over us in the meantime
        // SAFETY: target stayed valid per Hook::new contract
        let current = unsafe { self.target.as_const().as_bytes(record.installed.len()) };
        if current != record.installed.as_slice() {
            return Err(Error::PrologMismatched { target });
        }

        // install/uninstall are not expected to race each other, so the gap
        // between lookup and remove goes unguarded
        registry::remove(target);

        // SAFETY: as above
        if unsafe { mem::write_code(self.target, record.original.as_slice()) }.is_ok() {
            trampoline::unregister(record.trampoline);
        } else {
            registry::insert(target, record);
            return Err(Error::AccessDenied { target });
        }

        if let Strategy::ShortRelToAux { aux_offset } = record.strategy {
            let _ = clear_aux_jump(self.target, aux_offset);
        }

        self.installed = false;
        Ok(())
    }

    pub fn target(&self) -> ConstCodeAddr {
        self.target.as_const()
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

/// trampoline address for a hooked function
///
/// hook functions call this on the hot path to chain to the original body;
/// it only takes the registry's read lock.
pub fn trampoline_of(target: IntAddr) -> Option<ConstCodeAddr> {
    registry::trampoline_of(target).map(ConstCodeAddr::new)
}

fn determine_strategy(target: ConstCodeAddr, detour: ConstCodeAddr) -> Strategy {
    if !IS_64BIT {
        return Strategy::NearRel32;
    }

    let distance = target.value().abs_diff(detour.value());
    if distance < 0x7FFF_FFFF - emit::REL_NEAR_JMP32_LEN {
        return Strategy::NearRel32;
    }

    // hunt for a contiguous run of 0xCC padding reachable by a short jump
    let first = emit::REL_SHORT_JMP8_LEN as isize;
    let last = 127 + emit::REL_SHORT_JMP8_LEN as isize - emit::ABS_JMP_RAX_LEN as isize;
    for offset in first..last {
        // SAFETY: scanning the bytes right after a function entry; the
        // Hook::new contract keeps them mapped
        let run = unsafe { target.offset(offset).as_bytes(emit::ABS_JMP_RAX_LEN) };
        if run.iter().all(|&byte| byte == 0xCC) {
            return Strategy::ShortRelToAux {
                aux_offset: (offset - emit::REL_SHORT_JMP8_LEN as isize) as u8,
            };
        }
    }

    Strategy::Absolute64
}

/// address of the auxiliary slot for a given short-jump offset
fn aux_slot(target: CodeAddr, aux_offset: u8) -> CodeAddr {
    target.offset(emit::REL_SHORT_JMP8_LEN as isize + aux_offset as isize)
}

fn write_aux_jump(target: CodeAddr, detour: ConstCodeAddr, aux_offset: u8) -> Result<()> {
    let mut jump = [0u8; emit::ABS_JMP_RAX_LEN];
    emit::abs_jmp_rax(detour.value() as u64, &mut jump);
    // SAFETY: the aux slot was just verified to be 0xCC padding
    unsafe { mem::write_code(aux_slot(target, aux_offset), &jump) }
}

fn clear_aux_jump(target: CodeAddr, aux_offset: u8) -> Result<()> {
    let padding = [0xCCu8; emit::ABS_JMP_RAX_LEN];
    // SAFETY: restores bytes this hook previously overwrote
    unsafe { mem::write_code(aux_slot(target, aux_offset), &padding) }
}

fn emit_hook_prolog(target: ConstCodeAddr, detour: ConstCodeAddr, strategy: Strategy) -> Prolog {
    let mut prolog = Prolog::default();
    prolog.len = match strategy {
        Strategy::NearRel32 => emit::rel_near_jmp32(
            target.value() as u64,
            detour.value() as u64,
            &mut prolog.bytes,
        ),
        Strategy::ShortRelToAux { aux_offset } => {
            emit::rel_short_jmp8(aux_offset as i8, &mut prolog.bytes)
        }
        Strategy::Absolute64 => emit::abs_jmp_rax(detour.value() as u64, &mut prolog.bytes),
    } as u8;
    prolog
}

/// copy whole instructions from `addr` until at least `needed` bytes are
/// covered, recording every IP-relative disp32 for later fixup
///
/// short (disp8) IP-relative instructions survive only when they jump
/// inside the copied block; anything else is unsupported.
fn copy_prolog(addr: ConstCodeAddr, needed: u8) -> Option<CopiedProlog> {
    let mut copied = CopiedProlog::default();
    let mut short_jumps: Vec<(u8, i8)> = Vec::new();

    // SAFETY: addr points at a live function per the engine's contract
    let mut decoder = unsafe { LengthDecoder::native(addr) };
    while copied.prolog.len < needed {
        let layout = decoder.next()?;
        let inst_len = layout.total_len();
        let start = copied.prolog.len as usize;
        if start + inst_len as usize > MAX_PROLOG_LEN {
            return None;
        }

        // SAFETY: decoded length means the bytes exist
        let source = unsafe { addr.offset(start as isize).as_bytes(inst_len as usize) };
        copied.prolog.bytes[start..start + inst_len as usize].copy_from_slice(source);
        copied.prolog.len += inst_len;

        if layout.disp_needs_fixup {
            let offset_data = copied.prolog.len - layout.len_imm - layout.len_disp;
            match layout.len_disp {
                4 => {
                    let disp = i32::from_le_bytes(
                        copied.prolog.bytes[offset_data as usize..offset_data as usize + 4]
                            .try_into()
                            .unwrap(),
                    );
                    copied.fixups.push(DispFixup {
                        offset_data,
                        offset_next: copied.prolog.len,
                        target: addr
                            .offset(copied.prolog.len as isize)
                            .offset(disp as isize)
                            .value(),
                    });
                }
                1 => {
                    let disp = copied.prolog.bytes[offset_data as usize] as i8;
                    short_jumps.push((copied.prolog.len, disp));
                }
                _ => return None, // only 4-byte displacements are patchable
            }
        }
    }

    // a relocated short jump keeps working only if it lands inside the
    // relocated block itself
    for (offset_next, disp) in short_jumps {
        let landing = offset_next as isize + disp as isize;
        if landing < 0 || landing as usize > copied.prolog.len() {
            return None;
        }
    }

    Some(copied)
}

/// intersection of the ±disp32 windows around the target and every fixup
/// destination, with deliberate 0x7FFF_0000 slack instead of the full
/// 0x7FFF_FFFF reach
fn addressable_range(target: IntAddr, fixups: &[DispFixup]) -> AddrRange {
    if !IS_64BIT {
        return AddrRange::new(0x1_0000, 0x7FFF_0000);
    }

    let mut lowest = target;
    let mut highest = target;
    for fixup in fixups {
        lowest = lowest.min(fixup.target);
        highest = highest.max(fixup.target);
    }

    let range = AddrRange::new(
        highest.saturating_sub(0x7FFF_0000),
        lowest.saturating_add(0x7FFF_0000),
    );
    debug_assert!(range.max > range.min);
    range
}

fn build_trampoline(target: ConstCodeAddr, prolog: &Prolog) -> [u8; SLOT_SIZE] {
    let mut bytes = [0xCCu8; SLOT_SIZE];
    bytes[..prolog.len()].copy_from_slice(prolog.as_slice());

    let resume = target.offset(prolog.len() as isize).value() as u64;
    if IS_64BIT {
        emit::abs_jmp_noclobber_64(resume, &mut bytes[prolog.len()..]);
    } else {
        emit::abs_jmp_noclobber_32(resume as u32, &mut bytes[prolog.len()..]);
    }
    bytes
}

/// rewrite each copied disp32 so it resolves to the same absolute address
/// from its new home
fn fixup_displacements(slot: CodeAddr, fixups: &[DispFixup]) {
    for fixup in fixups {
        let new_disp = fixup
            .target
            .wrapping_sub(slot.value() + fixup.offset_next as usize) as u32;
        // SAFETY: the slot is a pool-owned RWX page and offset_data lies
        // inside the copied prolog
        unsafe {
            slot.offset(fixup.offset_data as isize).write::<u32>(new_disp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hint::black_box;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // keeps the arithmetic below out of reach of constant folding
    static ZERO: AtomicUsize = AtomicUsize::new(0);

    #[inline(never)]
    extern "C" fn add(a: usize, b: usize) -> usize {
        a.wrapping_add(b).wrapping_add(ZERO.load(Ordering::Relaxed))
    }

    #[inline(never)]
    extern "C" fn mul(a: usize, b: usize) -> usize {
        a.wrapping_mul(b).wrapping_add(ZERO.load(Ordering::Relaxed))
    }

    type BinOp = extern "C" fn(usize, usize) -> usize;

    #[test]
    fn test_install_and_uninstall_round_trip() {
        let target: BinOp = add;
        let call = black_box(target);

        let before = unsafe { ConstCodeAddr::new(target as usize).as_bytes(MAX_PROLOG_LEN) }
            .to_vec();

        let mut hook = unsafe { Hook::new(target as usize, mul as usize) };
        assert_eq!(call(123, 321), 444);
        hook.install().unwrap();
        assert_eq!(call(123, 321), 39483);

        // chaining through the trampoline runs the original
        let tramp = trampoline_of(target as usize).unwrap();
        let original: BinOp = unsafe { core::mem::transmute(tramp.value()) };
        assert_eq!(original(123, 321), 444);

        hook.uninstall().unwrap();
        assert_eq!(call(123, 321), 444);

        let after = unsafe { ConstCodeAddr::new(target as usize).as_bytes(MAX_PROLOG_LEN) };
        assert_eq!(before, after);
        assert!(trampoline_of(target as usize).is_none());
    }

    #[inline(never)]
    extern "C" fn sub(a: usize, b: usize) -> usize {
        a.wrapping_sub(b).wrapping_add(ZERO.load(Ordering::Relaxed))
    }

    #[test]
    fn test_double_install_is_address_in_use() {
        let mut first = unsafe { Hook::new(sub as usize, mul as usize) };
        first.install().unwrap();

        let mut second = unsafe { Hook::new(sub as usize, mul as usize) };
        assert_eq!(
            second.install(),
            Err(Error::AddressInUse { target: sub as usize })
        );

        first.uninstall().unwrap();
    }

    #[inline(never)]
    extern "C" fn never_installed(a: usize, b: usize) -> usize {
        a.wrapping_add(b ^ ZERO.load(Ordering::Relaxed))
    }

    #[test]
    fn test_uninstall_without_install() {
        let mut hook = unsafe { Hook::new(never_installed as usize, mul as usize) };
        assert_eq!(
            hook.uninstall(),
            Err(Error::NotHooked {
                target: never_installed as usize
            })
        );
    }

    // hooking a live system API, chaining to it through the trampoline
    extern "system" fn user_name_detour(buffer: *mut u16, size: *mut u32) -> i32 {
        let original: extern "system" fn(*mut u16, *mut u32) -> i32 = unsafe {
            core::mem::transmute(trampoline_of(GetUserNameW as usize).unwrap().value())
        };
        let result = original(buffer, size);
        if result != 0 {
            // SAFETY: the API just filled at least one character
            unsafe { *buffer = b'?' as u16 };
        }
        result
    }

    #[test]
    fn test_hook_system_api() {
        let mut hook = unsafe { Hook::new(GetUserNameW as usize, user_name_detour as usize) };
        hook.install().unwrap();

        let mut buffer = [0u16; 64];
        let mut size = buffer.len() as u32;
        let ok = unsafe { GetUserNameW(buffer.as_mut_ptr(), &mut size) };
        assert!(ok != 0);
        assert_eq!(buffer[0], b'?' as u16);

        hook.uninstall().unwrap();
    }

    #[link(name = "advapi32")]
    extern "system" {
        fn GetUserNameW(lpBuffer: *mut u16, pcbBuffer: *mut u32) -> i32;
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_addressable_range_formula() {
        let fixups = [
            DispFixup { offset_data: 2, offset_next: 6, target: 0x2_0000_0000 },
            DispFixup { offset_data: 8, offset_next: 12, target: 0x2_1000_0000 },
        ];
        let range = addressable_range(0x2_0800_0000, &fixups);
        assert_eq!(range.min, 0x2_1000_0000 - 0x7FFF_0000);
        assert_eq!(range.max, 0x2_0000_0000 + 0x7FFF_0000);
    }

    #[test]
    fn test_copy_prolog_records_rip_fixup() {
        // mov rax, [rip+10h] / ret, padded so decoding never leaves the array
        let code: &[u8] = &[
            0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, // mov rax, [rip+10h]
            0xC3, // ret
            0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        ];
        if !IS_64BIT {
            return;
        }

        let copied = copy_prolog(ConstCodeAddr::from_ptr(code.as_ptr()), 8).unwrap();
        assert_eq!(copied.prolog.len(), 8);
        assert_eq!(copied.fixups.len(), 1);

        let fixup = &copied.fixups[0];
        assert_eq!(fixup.offset_data, 3);
        assert_eq!(fixup.offset_next, 7);
        assert_eq!(fixup.target, code.as_ptr() as usize + 7 + 0x10);
    }

    #[test]
    fn test_copy_prolog_rejects_escaping_short_jump() {
        // jne +40h jumps far outside anything we could copy
        let code: &[u8] = &[0x75, 0x40, 0x90, 0x90, 0x90, 0x90, 0x90];
        assert!(copy_prolog(ConstCodeAddr::from_ptr(code.as_ptr()), 5).is_none());
    }

    // hook an entire API surface at once, then take it all down again
    #[test]
    fn test_bulk_hook_library_exports() {
        use crate::dynlib;
        use crate::pe::PeImage;

        extern "system" fn dead_end_detour() {}

        let base = dynlib::module_handle("xinput1_4.dll").unwrap();
        // SAFETY: the cache holds the module loaded for the whole test run
        let image = unsafe { PeImage::from_loaded(base).unwrap() };
        let text = image.section(".text").unwrap();
        let exports = image.exports().unwrap();
        assert!(!exports.is_empty());

        let mut hooks = Vec::new();
        for export in exports
            .iter()
            .filter(|e| !e.forwarded && text.contains_rva(e.rva))
        {
            let mut hook = unsafe {
                Hook::new(image.rva_to_addr(export.rva).value(), dead_end_detour as usize)
            };
            match hook.install() {
                Ok(()) => hooks.push(hook),
                // aliased exports share an address
                Err(Error::AddressInUse { .. }) => {}
                // a prolog the decoder's closed table cannot cover
                Err(Error::PrologUnsupported { .. }) => {}
                Err(other) => panic!("hooking {} failed: {other}", export.name),
            }
        }
        assert!(!hooks.is_empty());

        for mut hook in hooks {
            hook.uninstall().unwrap();
        }
    }
}
