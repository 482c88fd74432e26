//! Lower EL exception dispatch
//!
//! Synchronous traps from the guest are decoded from ESR_EL2 and either
//! emulated (system registers, distributor MMIO, PSCI) or turned into debug
//! events. Every path leaves through [`Hypervisor::exit_to_guest`].

use crate::arch::decode::{DataAbortIss, SysregIss};
use crate::arch::defs::*;
use crate::arch::{
    CpuControl, DebugRegisterFile, ExceptionStackFrame, GuestPageAccess, PageTranslation, Platform,
    SecureMonitor,
};
use crate::core_ctx::CoreContext;
use crate::debug::{DebugEventKind, WatchpointDirection};
use crate::guest_memory::GuestMemory;
use crate::hypervisor::Hypervisor;
use crate::vtimer;

/// Core id targeted by a PSCI `CPU_ON`: Aff0 of the MPIDR.
pub fn psci_target_core(mpidr: u64) -> u32 {
    (mpidr & 0xFF) as u32
}

/// PSCI calls that make a core enter the guest at a new address: whether
/// x1 names the target core, then the entrypoint and context id registers.
fn psci_entry_registers(function: u64) -> Option<(bool, usize, usize)> {
    match function {
        PSCI_CPU_ON_32 | PSCI_CPU_ON_64 => Some((true, 2, 3)),
        PSCI_CPU_SUSPEND_32 | PSCI_CPU_SUSPEND_64 => Some((false, 2, 3)),
        PSCI_SYSTEM_SUSPEND_32 | PSCI_SYSTEM_SUSPEND_64 => Some((false, 1, 2)),
        _ => None,
    }
}

impl<P: Platform> Hypervisor<P> {
    /// Synchronous exception from EL1/EL0.
    pub fn handle_lower_el_sync(&self, core_id: u32, frame: &mut ExceptionStackFrame) {
        let core = self.cores().get(core_id);
        core.set_guest_frame(frame);

        let ec = frame.exception_class();
        let iss = frame.iss();
        match ec {
            EC_MSR_MRS => {
                self.handle_sysreg_trap(core, frame, &SysregIss::decode(iss));
                frame.skip_instruction();
            }
            EC_HVC64 => {
                log::debug!("trap: core {} hvc #{:#x} unsupported", core_id, iss & 0xFFFF);
                frame.x[0] = u64::MAX;
            }
            EC_SMC64 => {
                self.handle_smc(core, frame);
                frame.skip_instruction();
            }
            EC_DABT_LOWER => self.handle_data_abort(core, frame),
            EC_BRK64 => self.handle_brk(core, frame, (iss & 0xFFFF) as u16),
            EC_BREAKPOINT_LOWER => {
                let addr = frame.pc();
                self.report_debug_event(core, DebugEventKind::HwBreakpoint { addr });
            }
            EC_WATCHPOINT_LOWER => self.handle_watchpoint(core, frame),
            EC_SOFTWARE_STEP_LOWER => self.handle_software_step(core, frame),
            _ => panic!(
                "trap: core {} unhandled exception class {:#x}\n{:?}",
                core_id, ec, frame
            ),
        }

        self.exit_to_guest(core, frame);
    }

    /// IRQ taken while the guest was running.
    pub fn handle_lower_el_irq(&self, core_id: u32, frame: &mut ExceptionStackFrame) {
        let core = self.cores().get(core_id);
        core.set_guest_frame(frame);
        self.handle_irq(core);
        self.exit_to_guest(core, frame);
    }

    /// IRQ taken in EL2, while parked or running a bottom half.
    pub fn handle_current_el_irq(&self, core_id: u32) {
        self.handle_irq(self.cores().get(core_id));
    }

    fn handle_sysreg_trap(&self, core: &CoreContext, frame: &mut ExceptionStackFrame, access: &SysregIss) {
        if vtimer::handle_sysreg_access(core, self.timer(), frame, access) {
            return;
        }

        // The debugger owns the debug registers: the guest sees none.
        let is_debug = access.op0() == 2;
        if !is_debug {
            log::warn!(
                "trap: core {} unhandled {} of sysreg {:#x} at {:#x}",
                core.core_id(),
                if access.is_read { "read" } else { "write" },
                access.encoding,
                frame.pc()
            );
        }
        if access.is_read {
            frame.set_reg(usize::from(access.reg), 0);
        }
    }

    fn handle_smc(&self, core: &CoreContext, frame: &mut ExceptionStackFrame) {
        let function = frame.x[0] & 0xFFFF_FFFF;
        if let Some((targets_other, entry_reg, arg_reg)) = psci_entry_registers(function) {
            let target = if targets_other {
                psci_target_core(frame.x[1])
            } else {
                core.core_id()
            };
            if (target as usize) < crate::platform::MAX_CORE {
                // The core comes back through the hypervisor, which then
                // enters the guest where it asked to.
                self.cores()
                    .get(target)
                    .set_boot_parameters(frame.x[entry_reg], frame.x[arg_reg]);
                frame.x[entry_reg] = self.cpu().warm_entrypoint();
                frame.x[arg_reg] = u64::from(target);
                log::debug!("trap: core {} psci {:#x} for core {}", core.core_id(), function, target);
            }
        }

        let mut args = [0u64; 8];
        args.copy_from_slice(&frame.x[..8]);
        self.monitor().call(&mut args);
        frame.x[..8].copy_from_slice(&args);
    }

    fn handle_data_abort(&self, core: &CoreContext, frame: &mut ExceptionStackFrame) {
        let core_id = core.core_id();
        let PageTranslation::Gicd { offset } = self.memory().translate(frame.far_el2) else {
            panic!(
                "trap: core {} data abort at {:#x}\n{:?}",
                core_id, frame.far_el2, frame
            );
        };

        let insn = self.guest_memory(core_id).read_u32(frame.pc());
        let Some(access) = DataAbortIss::decode(frame.iss(), insn) else {
            panic!(
                "trap: core {} undecodable distributor access at {:#x}\n{:?}",
                core_id,
                frame.pc(),
                frame
            );
        };
        self.irq()
            .handle_gicd_mmio(core_id, self.active_core_mask(), frame, &access, offset);
        frame.skip_instruction();
    }

    fn handle_brk(&self, core: &CoreContext, frame: &mut ExceptionStackFrame, uid: u16) {
        let addr = frame.pc();
        if self.sw_breakpoints().find_by_uid(uid) != Some(addr) {
            log::debug!("trap: core {} guest brk #{:#x} at {:#x}", core.core_id(), uid, addr);
        }
        if !self.report_debug_event(core, DebugEventKind::SwBreakpoint { uid, addr }) {
            // Nobody to report to: step over it.
            frame.skip_instruction();
        }
    }

    fn handle_watchpoint(&self, core: &CoreContext, frame: &ExceptionStackFrame) {
        let far = frame.far_el2;
        let direction = match self.watchpoints().find_matching(core.core_id(), far) {
            Some(wp) => wp.direction,
            None => {
                log::warn!("trap: core {} no watchpoint matches {:#x}", core.core_id(), far);
                WatchpointDirection::LoadStore
            }
        };
        self.report_debug_event(core, DebugEventKind::Watchpoint { addr: far, direction });
    }

    fn handle_software_step(&self, core: &CoreContext, frame: &mut ExceptionStackFrame) {
        let (start, end) = core.stepping_range();
        let pc = frame.pc();
        if self.debug_manager().is_reporting_enabled() && (start..end).contains(&pc) {
            frame.set_single_step(true);
            return;
        }
        if !self.report_debug_event(core, DebugEventKind::SingleStep) {
            frame.set_single_step(false);
            self.debug_regs().set_single_step(false);
        }
    }

    fn report_debug_event(&self, core: &CoreContext, kind: DebugEventKind) -> bool {
        self.debug_manager()
            .report_event(core.core_id(), self.active_core_mask(), kind, self.irq())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psci_entry_registers() {
        assert_eq!(psci_entry_registers(PSCI_CPU_ON_64), Some((true, 2, 3)));
        assert_eq!(psci_entry_registers(PSCI_CPU_SUSPEND_32), Some((false, 2, 3)));
        assert_eq!(psci_entry_registers(PSCI_SYSTEM_SUSPEND_64), Some((false, 1, 2)));
        // PSCI_VERSION
        assert_eq!(psci_entry_registers(0x8400_0000), None);
    }

    #[test]
    fn test_psci_target_core() {
        assert_eq!(psci_target_core(0x8000_0002), 2);
        assert_eq!(psci_target_core(0x0100), 0);
    }
}
