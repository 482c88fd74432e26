//! EL2 implementations of the hardware traits for the QEMU `virt` board.

pub mod gic;
pub mod memory;
pub mod stage2;
pub mod sysreg;

use crate::arch::defs::*;
use crate::arch::{ExceptionStackFrame, Platform};
use crate::dtb::PlatformInfo;

pub use gic::Gicv2;
pub use memory::Stage12Translator;
pub use sysreg::{current_core_id, Cpu, DebugRegisters, SmcMonitor, Timer};

use sysreg::write_sysreg;

pub struct QemuVirt;

impl Platform for QemuVirt {
    type Gic = Gicv2;
    type Timer = Timer;
    type DebugRegs = DebugRegisters;
    type Memory = Stage12Translator;
    type Monitor = SmcMonitor;
    type Cpu = Cpu;
}

// entry.S
extern "C" {
    static exception_vectors: u8;
    /// Load `frame` and `eret` into the guest.
    pub fn enter_guest(frame: *const ExceptionStackFrame) -> !;
    static device_copy_load: u8;
    static device_copy_store: u8;
    static device_copy_fixup: u8;
}

/// Configure the calling core's EL2 traps and stage-2 translation.
pub fn init_el2() {
    let vbar = unsafe { &exception_vectors as *const u8 as u64 };
    write_sysreg!("vbar_el2", vbar);

    write_sysreg!(
        "hcr_el2",
        HCR_VM | HCR_SWIO | HCR_FMO | HCR_IMO | HCR_AMO | HCR_FB | HCR_BSU_INNER | HCR_TSC | HCR_RW
    );
    // Debug exceptions come to EL2, debug register accesses trap.
    write_sysreg!("mdcr_el2", MDCR_TDE | MDCR_TDA | MDCR_TDOSA | MDCR_TDRA);
    write_sysreg!("mdscr_el1", MDSCR_MDE | MDSCR_KDE);
    // The EL1 physical counter and timer are emulated.
    write_sysreg!("cnthctl_el2", 0);
    write_sysreg!("cntvoff_el2", 0);
    write_sysreg!("cptr_el2", 0x33FF);

    stage2::install();
}

/// Boot core: device tree derived setup shared by every core.
pub fn init_platform(info: &PlatformInfo, gic: &Gicv2, memory: &Stage12Translator) {
    gic.set_bases(info);
    memory.set_gicd_base(info.gicd_base);
    stage2::build(info);
}

/// A device copy faulted: resume at its fixup, which returns the bytes
/// copied so far. Returns false for any other EL2 abort.
pub fn fixup_device_copy(frame: &mut ExceptionStackFrame) -> bool {
    let (load, store, fixup) = unsafe {
        (
            &device_copy_load as *const u8 as u64,
            &device_copy_store as *const u8 as u64,
            &device_copy_fixup as *const u8 as u64,
        )
    };
    if frame.elr_el2 == load || frame.elr_el2 == store {
        frame.elr_el2 = fixup;
        true
    } else {
        false
    }
}
