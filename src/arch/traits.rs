//! Hardware Trait Definitions
//!
//! These traits abstract the hardware the hypervisor core drives, so the
//! interrupt, debug and gdb logic runs unchanged against the real EL2
//! MMIO/sysreg implementations in `arch::aarch64` or against software
//! models in host tests.
//!
//! Banked state (GICD SGI/PPI registers, GICC, GICH, debug registers) is
//! implicitly that of the calling core, as it is on hardware.

use super::gicv2::SgiTargetFilter;
use super::frame::FpuRegisters;

/// Physical GICv2 distributor and CPU interface.
pub trait InterruptController: Sync {
    // Distributor
    fn distributor_type(&self) -> u32;
    fn set_distributor_enabled(&self, enabled: bool);
    fn set_enabled(&self, id: u32, enabled: bool);
    fn is_enabled(&self, id: u32) -> bool;
    fn set_priority(&self, id: u32, priority: u8);
    fn priority(&self, id: u32) -> u8;
    fn set_targets(&self, id: u32, targets: u8);
    fn targets(&self, id: u32) -> u8;
    fn set_edge_triggered(&self, id: u32, edge: bool);
    fn is_edge_triggered(&self, id: u32) -> bool;
    fn is_pending(&self, id: u32) -> bool;
    fn clear_pending(&self, id: u32);
    fn clear_active(&self, id: u32);
    fn send_sgi(&self, sgi_id: u32, filter: SgiTargetFilter, target_list: u8);

    // CPU interface
    fn set_cpu_interface_control(&self, ctlr: u32);
    fn set_priority_mask(&self, pmr: u8);
    fn set_binary_point(&self, bpr: u32);
    fn acknowledge(&self) -> u32;
    fn end_of_interrupt(&self, iar: u32);
    fn deactivate(&self, iar: u32);
}

/// GICv2 virtual interface control (GICH) and virtual CPU interface (GICV).
pub trait VirtualInterfaceController: Sync {
    fn vgic_type(&self) -> u32;
    fn hypervisor_control(&self) -> u32;
    fn set_hypervisor_control(&self, hcr: u32);
    fn maintenance_status(&self) -> u32;
    fn empty_list_register_status(&self) -> u64;
    fn list_register(&self, index: usize) -> u32;
    fn set_list_register(&self, index: usize, value: u32);
    fn virtual_cpu_control(&self) -> u32;
    fn set_virtual_cpu_control(&self, ctlr: u32);
}

/// ARM generic timer, as seen from EL2.
pub trait GenericTimer: Sync {
    /// Physical counter (CNTPCT_EL0).
    fn counter(&self) -> u64;
    fn frequency(&self) -> u64;
    /// EL1 physical timer compare value (CNTP_CVAL_EL0).
    fn physical_cval(&self) -> u64;
    fn set_physical_cval(&self, cval: u64);
    fn physical_ctl(&self) -> u32;
    fn set_physical_ctl(&self, ctl: u32);
    /// Virtual offset applied to the guest's virtual counter (CNTVOFF_EL2).
    fn set_virtual_offset(&self, offset: u64);
}

/// Architectural debug comparators.
pub trait DebugRegisterFile: Sync {
    /// Raw ID_AA64DFR0_EL1.
    fn debug_feature_register(&self) -> u64;
    fn set_breakpoint(&self, index: usize, control: u64, value: u64);
    fn set_watchpoint(&self, index: usize, control: u64, value: u64);
    /// MDSCR_EL1.SS
    fn set_single_step(&self, enabled: bool);
}

/// Result of translating one guest virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTranslation {
    /// Backed by physical memory; `device` selects the fault-safe copy path.
    Mapped { pa: u64, device: bool },
    /// IPA of the emulated distributor; `offset` is relative to its base.
    Gicd { offset: u32 },
    /// No stage-1 or stage-2 mapping.
    Fault,
}

/// Guest address translation and physical access primitives.
pub trait GuestPageAccess: Sync {
    fn translate(&self, va: u64) -> PageTranslation;
    /// Copy from normal memory.
    fn read_normal(&self, pa: u64, buf: &mut [u8]);
    /// Copy to normal memory, then clean/invalidate caches and TLBs for the range.
    fn write_normal(&self, pa: u64, data: &[u8]);
    /// Fault-safe device read; returns the number of bytes transferred.
    fn read_device(&self, pa: u64, buf: &mut [u8]) -> usize;
    /// Fault-safe device write; returns the number of bytes transferred.
    fn write_device(&self, pa: u64, data: &[u8]) -> usize;
}

/// Secure monitor call forwarding.
pub trait SecureMonitor: Sync {
    /// Issue an SMC with `args` in x0-x7; results are written back in place.
    fn call(&self, args: &mut [u64; 8]);
}

/// Core-local CPU control: IRQ masking, parking for the debugger, FPU state.
pub trait CpuControl: Sync {
    /// Wait for an event or interrupt with IRQs unmasked, then mask them again.
    fn park(&self);
    fn unmask_interrupts(&self);
    fn mask_interrupts(&self);
    /// Whether IRQs are masked on the calling core.
    fn interrupts_masked(&self) -> bool;
    fn save_fpu(&self, regs: &mut FpuRegisters);
    fn restore_fpu(&self, regs: &FpuRegisters);
    /// Entry point secondary cores use when brought up through PSCI.
    fn warm_entrypoint(&self) -> u64;
}

/// Bundle of the hardware a [`crate::hypervisor::Hypervisor`] is built on.
pub trait Platform: Sync + 'static {
    type Gic: InterruptController + VirtualInterfaceController;
    type Timer: GenericTimer;
    type DebugRegs: DebugRegisterFile;
    type Memory: GuestPageAccess;
    type Monitor: SecureMonitor;
    type Cpu: CpuControl;
}
