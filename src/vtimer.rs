//! Emulated EL1 physical timer
//!
//! The guest should not see time pass while a core is inside the
//! hypervisor. Each core accumulates its EL2 residency and the guest's
//! physical counter and timer are shifted back by that amount: CNTVOFF_EL2
//! does it in hardware for the virtual timer, the trapped CNTP* accesses
//! below do it for the physical one.

use crate::arch::decode::{sysreg, SysregIss};
use crate::arch::{ExceptionStackFrame, GenericTimer};
use crate::core_ctx::CoreContext;

/// Guest view of the physical counter at the time of the trap.
pub fn emulated_counter(core: &CoreContext, frame: &ExceptionStackFrame) -> u64 {
    frame
        .cntpct_el0
        .wrapping_sub(core.total_time_in_hypervisor())
}

/// Whether the guest's emulated compare value has been reached.
pub fn deadline_elapsed<T: GenericTimer>(core: &CoreContext, timer: &T) -> bool {
    let now = timer.counter().wrapping_sub(core.total_time_in_hypervisor());
    now >= core.emul_ptimer_cval()
}

/// Program the physical compare value matching the emulated one.
pub fn program_physical_deadline<T: GenericTimer>(core: &CoreContext, timer: &T) {
    let cval = core
        .emul_ptimer_cval()
        .saturating_add(core.total_time_in_hypervisor());
    timer.set_physical_cval(cval);
}

fn write_compare_value<T: GenericTimer>(core: &CoreContext, timer: &T, cval: u64) {
    core.set_emul_ptimer_cval(cval);
    program_physical_deadline(core, timer);
}

/// Account the time spent handling this trap, just before returning to the guest.
pub fn exit_hypervisor<T: GenericTimer>(core: &CoreContext, timer: &T, frame: &ExceptionStackFrame) {
    let delta = timer.counter().wrapping_sub(frame.cntpct_el0);
    let total = core.add_time_in_hypervisor(delta);
    timer.set_virtual_offset(total);
}

/// Emulate a trapped access to a CNTP* register. Returns `false` when the
/// register is not a physical timer register.
pub fn handle_sysreg_access<T: GenericTimer>(
    core: &CoreContext,
    timer: &T,
    frame: &mut ExceptionStackFrame,
    access: &SysregIss,
) -> bool {
    let reg = usize::from(access.reg);

    if access.is_read {
        let value = match access.encoding {
            sysreg::CNTPCT_EL0 => emulated_counter(core, frame),
            sysreg::CNTP_CVAL_EL0 => core.emul_ptimer_cval(),
            sysreg::CNTP_TVAL_EL0 => {
                let remaining = core
                    .emul_ptimer_cval()
                    .wrapping_sub(emulated_counter(core, frame));
                remaining & 0xFFFF_FFFF
            }
            sysreg::CNTP_CTL_EL0 => u64::from(timer.physical_ctl()),
            _ => return false,
        };
        frame.set_reg(reg, value);
    } else {
        let value = frame.reg(reg);
        match access.encoding {
            sysreg::CNTPCT_EL0 => {
                log::warn!("trap: core {} write to CNTPCT_EL0 ignored", core.core_id());
            }
            sysreg::CNTP_CVAL_EL0 => write_compare_value(core, timer, value),
            sysreg::CNTP_TVAL_EL0 => {
                // TimerValue is a signed 32-bit down-counter.
                let delta = value as u32 as i32 as i64 as u64;
                let cval = emulated_counter(core, frame).wrapping_add(delta);
                write_compare_value(core, timer, cval);
            }
            sysreg::CNTP_CTL_EL0 => timer.set_physical_ctl(value as u32),
            _ => return false,
        }
    }
    true
}
