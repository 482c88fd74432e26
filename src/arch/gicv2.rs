//! GICv2 architectural definitions
//!
//! Register offsets and bit layouts for the distributor (GICD), CPU
//! interface (GICC), virtual interface control (GICH) and virtual CPU
//! interface (GICV). Packed registers are converted with explicit
//! `from_bits`/`bits` pairs instead of relying on struct layout.
//!
//! Interrupt Types:
//! - SGI (0-15): Software Generated Interrupts
//! - PPI (16-31): Private Peripheral Interrupts (per-CPU, includes timers)
//! - SPI (32-1019): Shared Peripheral Interrupts

// ── Interrupt ID space ──────────────────────────────────────────────
pub const NUM_SGIS: u32 = 16;
pub const NUM_PRIVATE_IRQS: u32 = 32;
pub const MAX_IRQ_ID: u32 = 1019;
pub const SPURIOUS_IRQ_ID: u32 = 1023;

/// GICH maintenance interrupt (PPI 9)
pub const MAINTENANCE_IRQ: u32 = 25;
/// EL2 physical timer (PPI 10)
pub const HYP_TIMER_IRQ: u32 = 26;
/// EL1 virtual timer (PPI 11)
pub const VTIMER_IRQ: u32 = 27;
/// EL1 physical timer (PPI 14)
pub const PTIMER_IRQ: u32 = 30;

// ── GICD register offsets ───────────────────────────────────────────
pub const GICD_CTLR: u32 = 0x000;
pub const GICD_TYPER: u32 = 0x004;
pub const GICD_IIDR: u32 = 0x008;
pub const GICD_IGROUPR: u32 = 0x080;
pub const GICD_ISENABLER: u32 = 0x100;
pub const GICD_ICENABLER: u32 = 0x180;
pub const GICD_ISPENDR: u32 = 0x200;
pub const GICD_ICPENDR: u32 = 0x280;
pub const GICD_ISACTIVER: u32 = 0x300;
pub const GICD_ICACTIVER: u32 = 0x380;
pub const GICD_IPRIORITYR: u32 = 0x400;
pub const GICD_ITARGETSR: u32 = 0x800;
pub const GICD_ICFGR: u32 = 0xC00;
pub const GICD_SGIR: u32 = 0xF00;
pub const GICD_CPENDSGIR: u32 = 0xF10;
pub const GICD_SPENDSGIR: u32 = 0xF20;
pub const GICD_ICPIDR2: u32 = 0xFE8;

/// Size of the bit-per-interrupt register banks (1024 interrupts).
pub const GICD_BITMAP_BANK_SIZE: u32 = 1024 / 8;
/// Size of the byte-per-interrupt register banks.
pub const GICD_BYTE_BANK_SIZE: u32 = 1024;
/// Size of ICFGR (2 bits per interrupt).
pub const GICD_ICFGR_BANK_SIZE: u32 = 1024 / 4;
/// Size of CPENDSGIR/SPENDSGIR.
pub const GICD_SGI_PENDING_BANK_SIZE: u32 = 16;

pub const GICD_CTLR_ENABLE: u32 = 1 << 0;

// ── GICC register offsets ───────────────────────────────────────────
pub const GICC_CTLR: u32 = 0x000;
pub const GICC_PMR: u32 = 0x004;
pub const GICC_BPR: u32 = 0x008;
pub const GICC_IAR: u32 = 0x00C;
pub const GICC_EOIR: u32 = 0x010;
pub const GICC_DIR: u32 = 0x1000;

pub const GICC_CTLR_ENABLE_GRP0: u32 = 1 << 0;
pub const GICC_CTLR_ENABLE_GRP1: u32 = 1 << 1;
/// Split priority drop (EOIR) from deactivation (DIR).
pub const GICC_CTLR_EOIMODE: u32 = 1 << 9;

// ── GICH register offsets ───────────────────────────────────────────
pub const GICH_HCR: u32 = 0x000;
pub const GICH_VTR: u32 = 0x004;
pub const GICH_VMCR: u32 = 0x008;
pub const GICH_MISR: u32 = 0x010;
pub const GICH_EISR0: u32 = 0x020;
pub const GICH_ELRSR0: u32 = 0x030;
pub const GICH_ELRSR1: u32 = 0x034;
pub const GICH_APR: u32 = 0x0F0;
pub const GICH_LR0: u32 = 0x100;

/// Architectural maximum number of list registers.
pub const MAX_NUM_LIST_REGISTERS: usize = 64;

// ── GICV register offsets ───────────────────────────────────────────
pub const GICV_CTLR: u32 = 0x000;
/// Bits the hypervisor lets the guest keep in GICV_CTLR: EnableGrp0 and EOImode.
pub const GICV_CTLR_ALLOWED_MASK: u32 = (1 << 9) | (1 << 0);

/// GICD_SGIR TargetListFilter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgiTargetFilter {
    /// Send to the cores in the target list
    List = 0,
    /// Send to every core except the requester
    AllOthers = 1,
    /// Send to the requester only
    SelfOnly = 2,
}

impl SgiTargetFilter {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::List),
            1 => Some(Self::AllOthers),
            2 => Some(Self::SelfOnly),
            _ => None,
        }
    }
}

/// GICD_SGIR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sgir {
    pub sgi_id: u32,
    pub target_list: u8,
    pub filter: u32,
}

impl Sgir {
    pub fn from_bits(v: u32) -> Self {
        Self {
            sgi_id: v & 0xF,
            target_list: ((v >> 16) & 0xFF) as u8,
            filter: (v >> 24) & 0x3,
        }
    }

    pub fn bits(&self) -> u32 {
        (self.filter & 0x3) << 24 | u32::from(self.target_list) << 16 | (self.sgi_id & 0xF)
    }
}

/// GICC_IAR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iar {
    pub irq_id: u32,
    pub src_core: u32,
}

impl Iar {
    pub fn from_bits(v: u32) -> Self {
        Self {
            irq_id: v & 0x3FF,
            src_core: (v >> 10) & 0x7,
        }
    }

    pub fn bits(&self) -> u32 {
        (self.src_core & 0x7) << 10 | (self.irq_id & 0x3FF)
    }

    pub fn is_spurious(&self) -> bool {
        self.irq_id >= 1020
    }
}

/// GICH_LRn.
///
/// `[9:0]` VirtualID, `[19:10]` PhysicalID, `[27:23]` Priority,
/// `[28]` pending, `[29]` active, `[30]` Grp1, `[31]` HW.
/// With HW clear, PhysicalID bit 9 requests an EOI maintenance interrupt
/// and bits `[2:0]` carry the SGI source core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListRegister {
    pub virtual_id: u32,
    pub physical_id: u32,
    pub priority: u8,
    pub pending: bool,
    pub active: bool,
    pub group1: bool,
    pub hw: bool,
}

/// PhysicalID bit asking for a maintenance interrupt on guest EOI (HW=0).
pub const LR_EOI_NOTIFICATION: u32 = 1 << 9;

impl ListRegister {
    pub fn from_bits(v: u32) -> Self {
        Self {
            virtual_id: v & 0x3FF,
            physical_id: (v >> 10) & 0x3FF,
            priority: ((v >> 23) & 0x1F) as u8,
            pending: v & (1 << 28) != 0,
            active: v & (1 << 29) != 0,
            group1: v & (1 << 30) != 0,
            hw: v & (1 << 31) != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        (self.virtual_id & 0x3FF)
            | (self.physical_id & 0x3FF) << 10
            | u32::from(self.priority & 0x1F) << 23
            | u32::from(self.pending) << 28
            | u32::from(self.active) << 29
            | u32::from(self.group1) << 30
            | u32::from(self.hw) << 31
    }

    pub fn is_empty(&self) -> bool {
        !self.pending && !self.active
    }
}

/// GICH_HCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HypervisorControl {
    pub enable: bool,
    pub underflow_ie: bool,
    pub lr_entry_not_present_ie: bool,
    pub no_pending_ie: bool,
    pub vgrp0_enable_ie: bool,
    pub vgrp0_disable_ie: bool,
    pub vgrp1_enable_ie: bool,
    pub vgrp1_disable_ie: bool,
    pub eoi_count: u8,
}

impl HypervisorControl {
    pub fn from_bits(v: u32) -> Self {
        Self {
            enable: v & (1 << 0) != 0,
            underflow_ie: v & (1 << 1) != 0,
            lr_entry_not_present_ie: v & (1 << 2) != 0,
            no_pending_ie: v & (1 << 3) != 0,
            vgrp0_enable_ie: v & (1 << 4) != 0,
            vgrp0_disable_ie: v & (1 << 5) != 0,
            vgrp1_enable_ie: v & (1 << 6) != 0,
            vgrp1_disable_ie: v & (1 << 7) != 0,
            eoi_count: ((v >> 27) & 0x1F) as u8,
        }
    }

    pub fn bits(&self) -> u32 {
        u32::from(self.enable)
            | u32::from(self.underflow_ie) << 1
            | u32::from(self.lr_entry_not_present_ie) << 2
            | u32::from(self.no_pending_ie) << 3
            | u32::from(self.vgrp0_enable_ie) << 4
            | u32::from(self.vgrp0_disable_ie) << 5
            | u32::from(self.vgrp1_enable_ie) << 6
            | u32::from(self.vgrp1_disable_ie) << 7
            | u32::from(self.eoi_count & 0x1F) << 27
    }
}

/// GICH_MISR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceStatus {
    pub eoi: bool,
    pub underflow: bool,
    pub lr_entry_not_present: bool,
    pub no_pending: bool,
    pub vgrp0_enabled: bool,
    pub vgrp0_disabled: bool,
    pub vgrp1_enabled: bool,
    pub vgrp1_disabled: bool,
}

impl MaintenanceStatus {
    pub fn from_bits(v: u32) -> Self {
        Self {
            eoi: v & (1 << 0) != 0,
            underflow: v & (1 << 1) != 0,
            lr_entry_not_present: v & (1 << 2) != 0,
            no_pending: v & (1 << 3) != 0,
            vgrp0_enabled: v & (1 << 4) != 0,
            vgrp0_disabled: v & (1 << 5) != 0,
            vgrp1_enabled: v & (1 << 6) != 0,
            vgrp1_disabled: v & (1 << 7) != 0,
        }
    }

    pub fn any_group_change(&self) -> bool {
        self.vgrp0_enabled || self.vgrp0_disabled || self.vgrp1_enabled || self.vgrp1_disabled
    }
}

/// GICH_VTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgicTypeRegister {
    pub num_list_registers: u32,
    pub pre_bits: u32,
    pub pri_bits: u32,
}

impl VgicTypeRegister {
    pub fn from_bits(v: u32) -> Self {
        Self {
            num_list_registers: (v & 0x3F) + 1,
            pre_bits: ((v >> 26) & 0x7) + 1,
            pri_bits: ((v >> 29) & 0x7) + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_register_layout() {
        let lr = ListRegister {
            virtual_id: 33,
            physical_id: 33,
            priority: 0x1F,
            pending: true,
            hw: true,
            ..Default::default()
        };
        let bits = lr.bits();
        assert_eq!(bits & 0x3FF, 33);
        assert_eq!((bits >> 10) & 0x3FF, 33);
        assert_eq!((bits >> 23) & 0x1F, 0x1F);
        assert_eq!(bits >> 28, 0b1001);
        assert_eq!(ListRegister::from_bits(bits), lr);
    }

    #[test]
    fn test_sgi_list_register_carries_source() {
        let lr = ListRegister {
            virtual_id: 3,
            physical_id: LR_EOI_NOTIFICATION | 2,
            priority: 4,
            pending: true,
            ..Default::default()
        };
        let bits = lr.bits();
        assert_eq!(bits & (1 << 19), 1 << 19);
        assert_eq!((bits >> 10) & 0x7, 2);
        assert_eq!(bits & (1 << 31), 0);
    }

    #[test]
    fn test_hcr_underflow_bit() {
        let hcr = HypervisorControl {
            enable: true,
            underflow_ie: true,
            ..Default::default()
        };
        assert_eq!(hcr.bits(), 0b11);
        assert_eq!(HypervisorControl::from_bits(0b11), hcr);
    }

    #[test]
    fn test_vtr_and_iar() {
        // 4 LRs, 5 priority bits
        let vtr = VgicTypeRegister::from_bits(3 | (4 << 26) | (4 << 29));
        assert_eq!(vtr.num_list_registers, 4);
        assert_eq!(vtr.pri_bits, 5);
        let iar = Iar::from_bits((3 << 10) | 5);
        assert_eq!((iar.irq_id, iar.src_core), (5, 3));
        assert!(Iar::from_bits(1023).is_spurious());
    }

    #[test]
    fn test_sgir_fields() {
        let sgir = Sgir::from_bits((1 << 24) | (0b1010 << 16) | 7);
        assert_eq!(sgir.sgi_id, 7);
        assert_eq!(sgir.target_list, 0b1010);
        assert_eq!(SgiTargetFilter::from_bits(sgir.filter), Some(SgiTargetFilter::AllOthers));
        assert_eq!(SgiTargetFilter::from_bits(3), None);
    }
}
