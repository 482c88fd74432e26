//! System-register backed hardware: generic timer, debug comparators,
//! secure monitor and core-local CPU control.

use core::arch::asm;

use crate::arch::defs::{DAIF_I, MDSCR_SS};
use crate::arch::{CpuControl, DebugRegisterFile, FpuRegisters, GenericTimer, SecureMonitor};

macro_rules! read_sysreg {
    ($name:literal) => {{
        let value: u64;
        unsafe {
            asm!(concat!("mrs {}, ", $name), out(reg) value, options(nostack, nomem));
        }
        value
    }};
}

macro_rules! write_sysreg {
    ($name:literal, $value:expr) => {{
        let value: u64 = $value;
        unsafe {
            asm!(concat!("msr ", $name, ", {}"), "isb", in(reg) value, options(nostack, nomem));
        }
    }};
}

pub(crate) use write_sysreg;

/// Write one of the numbered debug register pairs.
macro_rules! write_debug_pair {
    ($index:expr, $ctl:literal, $val:literal, $control:expr, $value:expr, [$($n:literal),*]) => {
        match $index {
            $(
                $n => unsafe {
                    // Disable first so a half-written pair never matches.
                    asm!(
                        concat!("msr ", $ctl, stringify!($n), "_el1, xzr"),
                        concat!("msr ", $val, stringify!($n), "_el1, {0}"),
                        concat!("msr ", $ctl, stringify!($n), "_el1, {1}"),
                        "isb",
                        in(reg) $value,
                        in(reg) $control,
                        options(nostack, nomem),
                    );
                },
            )*
            _ => panic!("debug: no comparator {}", $index),
        }
    };
}

pub struct Timer;

impl GenericTimer for Timer {
    fn counter(&self) -> u64 {
        read_sysreg!("cntpct_el0")
    }

    fn frequency(&self) -> u64 {
        read_sysreg!("cntfrq_el0")
    }

    fn physical_cval(&self) -> u64 {
        read_sysreg!("cntp_cval_el0")
    }

    fn set_physical_cval(&self, cval: u64) {
        write_sysreg!("cntp_cval_el0", cval);
    }

    fn physical_ctl(&self) -> u32 {
        read_sysreg!("cntp_ctl_el0") as u32
    }

    fn set_physical_ctl(&self, ctl: u32) {
        write_sysreg!("cntp_ctl_el0", u64::from(ctl));
    }

    fn set_virtual_offset(&self, offset: u64) {
        write_sysreg!("cntvoff_el2", offset);
    }
}

pub struct DebugRegisters;

impl DebugRegisterFile for DebugRegisters {
    fn debug_feature_register(&self) -> u64 {
        read_sysreg!("id_aa64dfr0_el1")
    }

    fn set_breakpoint(&self, index: usize, control: u64, value: u64) {
        write_debug_pair!(
            index, "dbgbcr", "dbgbvr", control, value,
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
        );
    }

    fn set_watchpoint(&self, index: usize, control: u64, value: u64) {
        write_debug_pair!(
            index, "dbgwcr", "dbgwvr", control, value,
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
        );
    }

    fn set_single_step(&self, enabled: bool) {
        let mdscr = read_sysreg!("mdscr_el1");
        let mdscr = if enabled { mdscr | MDSCR_SS } else { mdscr & !MDSCR_SS };
        write_sysreg!("mdscr_el1", mdscr);
    }
}

pub struct SmcMonitor;

impl SecureMonitor for SmcMonitor {
    fn call(&self, args: &mut [u64; 8]) {
        unsafe {
            asm!(
                "smc #0",
                inout("x0") args[0],
                inout("x1") args[1],
                inout("x2") args[2],
                inout("x3") args[3],
                inout("x4") args[4],
                inout("x5") args[5],
                inout("x6") args[6],
                inout("x7") args[7],
                options(nostack),
            );
        }
    }
}

extern "C" {
    /// Secondary core entry in `entry.S`; x0 carries the core id.
    fn _warm_start();
}

pub struct Cpu;

impl CpuControl for Cpu {
    fn park(&self) {
        unsafe {
            asm!("msr daifclr, #2", "wfi", "msr daifset, #2", options(nostack));
        }
    }

    fn unmask_interrupts(&self) {
        unsafe { asm!("msr daifclr, #2", options(nostack, nomem)) };
    }

    fn mask_interrupts(&self) {
        unsafe { asm!("msr daifset, #2", options(nostack, nomem)) };
    }

    fn interrupts_masked(&self) -> bool {
        let daif: u64;
        unsafe { asm!("mrs {}, daif", out(reg) daif, options(nostack, nomem)) };
        daif & DAIF_I != 0
    }

    fn save_fpu(&self, regs: &mut FpuRegisters) {
        let fpsr: u64;
        let fpcr: u64;
        unsafe {
            asm!(
                "stp q0, q1, [{0}, #0x000]",
                "stp q2, q3, [{0}, #0x020]",
                "stp q4, q5, [{0}, #0x040]",
                "stp q6, q7, [{0}, #0x060]",
                "stp q8, q9, [{0}, #0x080]",
                "stp q10, q11, [{0}, #0x0a0]",
                "stp q12, q13, [{0}, #0x0c0]",
                "stp q14, q15, [{0}, #0x0e0]",
                "stp q16, q17, [{0}, #0x100]",
                "stp q18, q19, [{0}, #0x120]",
                "stp q20, q21, [{0}, #0x140]",
                "stp q22, q23, [{0}, #0x160]",
                "stp q24, q25, [{0}, #0x180]",
                "stp q26, q27, [{0}, #0x1a0]",
                "stp q28, q29, [{0}, #0x1c0]",
                "stp q30, q31, [{0}, #0x1e0]",
                "mrs {1}, fpsr",
                "mrs {2}, fpcr",
                in(reg) regs.q.as_mut_ptr(),
                out(reg) fpsr,
                out(reg) fpcr,
                options(nostack),
            );
        }
        regs.fpsr = fpsr as u32;
        regs.fpcr = fpcr as u32;
    }

    fn restore_fpu(&self, regs: &FpuRegisters) {
        unsafe {
            asm!(
                "ldp q0, q1, [{0}, #0x000]",
                "ldp q2, q3, [{0}, #0x020]",
                "ldp q4, q5, [{0}, #0x040]",
                "ldp q6, q7, [{0}, #0x060]",
                "ldp q8, q9, [{0}, #0x080]",
                "ldp q10, q11, [{0}, #0x0a0]",
                "ldp q12, q13, [{0}, #0x0c0]",
                "ldp q14, q15, [{0}, #0x0e0]",
                "ldp q16, q17, [{0}, #0x100]",
                "ldp q18, q19, [{0}, #0x120]",
                "ldp q20, q21, [{0}, #0x140]",
                "ldp q22, q23, [{0}, #0x160]",
                "ldp q24, q25, [{0}, #0x180]",
                "ldp q26, q27, [{0}, #0x1a0]",
                "ldp q28, q29, [{0}, #0x1c0]",
                "ldp q30, q31, [{0}, #0x1e0]",
                "msr fpsr, {1}",
                "msr fpcr, {2}",
                in(reg) regs.q.as_ptr(),
                in(reg) u64::from(regs.fpsr),
                in(reg) u64::from(regs.fpcr),
                options(nostack),
            );
        }
    }

    fn warm_entrypoint(&self) -> u64 {
        _warm_start as usize as u64
    }
}

/// Core id from MPIDR_EL1.Aff0.
pub fn current_core_id() -> u32 {
    (read_sysreg!("mpidr_el1") & 0xFF) as u32
}
