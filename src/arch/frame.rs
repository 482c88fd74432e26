//! Guest trap frame
//!
//! Layout shared with `arch/aarch64/entry.S`: the vectors push this
//! structure on the EL2 stack on every exception taken from the guest.

use core::fmt;

use super::defs::*;

/// Register state saved on exception entry from EL1/EL0.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ExceptionStackFrame {
    /// x0-x30
    pub x: [u64; 31],
    pub sp_el1: u64,
    pub sp_el0: u64,
    pub elr_el2: u64,
    pub spsr_el2: u64,
    pub esr_el2: u64,
    pub far_el2: u64,
    /// Physical counter sampled on entry, for hypervisor time accounting.
    pub cntpct_el0: u64,
}

impl ExceptionStackFrame {
    /// Read a general purpose register; index 31 reads as XZR.
    pub fn reg(&self, n: usize) -> u64 {
        if n < 31 {
            self.x[n]
        } else {
            0
        }
    }

    /// Write a general purpose register; writes to XZR are dropped.
    pub fn set_reg(&mut self, n: usize, value: u64) {
        if n < 31 {
            self.x[n] = value;
        }
    }

    pub fn pc(&self) -> u64 {
        self.elr_el2
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.elr_el2 = pc;
    }

    pub fn skip_instruction(&mut self) {
        self.elr_el2 = self.elr_el2.wrapping_add(AARCH64_INSN_SIZE);
    }

    /// Stack pointer the guest was using when it trapped.
    pub fn guest_sp(&self) -> u64 {
        if self.uses_sp_elx() {
            self.sp_el1
        } else {
            self.sp_el0
        }
    }

    pub fn set_guest_sp(&mut self, sp: u64) {
        if self.uses_sp_elx() {
            self.sp_el1 = sp;
        } else {
            self.sp_el0 = sp;
        }
    }

    fn uses_sp_elx(&self) -> bool {
        self.spsr_el2 & SPSR_EL_MASK != 0 && self.spsr_el2 & SPSR_SP_SEL != 0
    }

    pub fn exception_class(&self) -> u32 {
        ((self.esr_el2 >> ESR_EC_SHIFT) & ESR_EC_MASK) as u32
    }

    pub fn iss(&self) -> u32 {
        (self.esr_el2 & ESR_ISS_MASK) as u32
    }

    pub fn set_single_step(&mut self, enabled: bool) {
        if enabled {
            self.spsr_el2 |= SPSR_SS;
        } else {
            self.spsr_el2 &= !SPSR_SS;
        }
    }
}

impl fmt::Debug for ExceptionStackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pc={:#018x} spsr={:#010x} esr={:#010x} far={:#018x}",
            self.elr_el2, self.spsr_el2, self.esr_el2, self.far_el2)?;
        writeln!(f, "sp_el1={:#018x} sp_el0={:#018x}", self.sp_el1, self.sp_el0)?;
        for (i, pair) in self.x.chunks(2).enumerate() {
            match pair {
                [a, b] => writeln!(f, "x{:<2}={:#018x} x{:<2}={:#018x}", 2 * i, a, 2 * i + 1, b)?,
                [a] => writeln!(f, "x{:<2}={:#018x}", 2 * i, a)?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// SIMD/FP register file, saved only while a core is parked for the debugger.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct FpuRegisters {
    pub q: [u128; 32],
    pub fpsr: u32,
    pub fpcr: u32,
}

impl FpuRegisters {
    pub const fn zeroed() -> Self {
        Self {
            q: [0; 32],
            fpsr: 0,
            fpcr: 0,
        }
    }
}

impl Default for FpuRegisters {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xzr_reads_zero() {
        let mut frame = ExceptionStackFrame::default();
        frame.set_reg(31, 0xdead);
        assert_eq!(frame.reg(31), 0);
        frame.set_reg(30, 7);
        assert_eq!(frame.reg(30), 7);
    }

    #[test]
    fn test_guest_sp_follows_spsr() {
        let mut frame = ExceptionStackFrame {
            sp_el1: 0x1000,
            sp_el0: 0x2000,
            spsr_el2: 0x3C5, // EL1h
            ..Default::default()
        };
        assert_eq!(frame.guest_sp(), 0x1000);
        frame.spsr_el2 = 0x3C4; // EL1t
        assert_eq!(frame.guest_sp(), 0x2000);
        frame.spsr_el2 = 0x3C0; // EL0t
        frame.set_guest_sp(0x3000);
        assert_eq!(frame.sp_el0, 0x3000);
    }

    #[test]
    fn test_frame_layout_matches_entry_code() {
        assert_eq!(core::mem::size_of::<ExceptionStackFrame>(), 304);
        assert_eq!(core::mem::offset_of!(ExceptionStackFrame, elr_el2), 264);
    }
}
