//! GICv2 MMIO driver
//!
//! GICD is shared; GICC, GICH, GICV and the SGI/PPI banks of GICD are
//! banked per core by the hardware, so the same base addresses serve every
//! core.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::gicv2::*;
use crate::arch::{InterruptController, VirtualInterfaceController};
use crate::dtb::PlatformInfo;

pub struct Gicv2 {
    gicd: AtomicU64,
    gicc: AtomicU64,
    gich: AtomicU64,
    gicv: AtomicU64,
}

impl Gicv2 {
    pub const fn new(info: PlatformInfo) -> Self {
        Self {
            gicd: AtomicU64::new(info.gicd_base),
            gicc: AtomicU64::new(info.gicc_base),
            gich: AtomicU64::new(info.gich_base),
            gicv: AtomicU64::new(info.gicv_base),
        }
    }

    /// Switch to the addresses found in the device tree. Boot core, before
    /// the GIC is first touched.
    pub fn set_bases(&self, info: &PlatformInfo) {
        self.gicd.store(info.gicd_base, Ordering::Relaxed);
        self.gicc.store(info.gicc_base, Ordering::Relaxed);
        self.gich.store(info.gich_base, Ordering::Relaxed);
        self.gicv.store(info.gicv_base, Ordering::Relaxed);
    }

    fn read32(base: &AtomicU64, offset: u32) -> u32 {
        let addr = base.load(Ordering::Relaxed) + u64::from(offset);
        unsafe { read_volatile(addr as *const u32) }
    }

    fn write32(base: &AtomicU64, offset: u32, value: u32) {
        let addr = base.load(Ordering::Relaxed) + u64::from(offset);
        unsafe { write_volatile(addr as *mut u32, value) }
    }

    fn read8(base: &AtomicU64, offset: u32) -> u8 {
        let addr = base.load(Ordering::Relaxed) + u64::from(offset);
        unsafe { read_volatile(addr as *const u8) }
    }

    fn write8(base: &AtomicU64, offset: u32, value: u8) {
        let addr = base.load(Ordering::Relaxed) + u64::from(offset);
        unsafe { write_volatile(addr as *mut u8, value) }
    }

    fn bit_reg(bank: u32, id: u32) -> (u32, u32) {
        (bank + (id / 32) * 4, 1 << (id % 32))
    }
}

impl InterruptController for Gicv2 {
    fn distributor_type(&self) -> u32 {
        Self::read32(&self.gicd, GICD_TYPER)
    }

    fn set_distributor_enabled(&self, enabled: bool) {
        Self::write32(&self.gicd, GICD_CTLR, if enabled { GICD_CTLR_ENABLE } else { 0 });
    }

    fn set_enabled(&self, id: u32, enabled: bool) {
        let bank = if enabled { GICD_ISENABLER } else { GICD_ICENABLER };
        let (offset, bit) = Self::bit_reg(bank, id);
        Self::write32(&self.gicd, offset, bit);
    }

    fn is_enabled(&self, id: u32) -> bool {
        let (offset, bit) = Self::bit_reg(GICD_ISENABLER, id);
        Self::read32(&self.gicd, offset) & bit != 0
    }

    fn set_priority(&self, id: u32, priority: u8) {
        Self::write8(&self.gicd, GICD_IPRIORITYR + id, priority);
    }

    fn priority(&self, id: u32) -> u8 {
        Self::read8(&self.gicd, GICD_IPRIORITYR + id)
    }

    fn set_targets(&self, id: u32, targets: u8) {
        Self::write8(&self.gicd, GICD_ITARGETSR + id, targets);
    }

    fn targets(&self, id: u32) -> u8 {
        Self::read8(&self.gicd, GICD_ITARGETSR + id)
    }

    fn set_edge_triggered(&self, id: u32, edge: bool) {
        let offset = GICD_ICFGR + (id / 16) * 4;
        let bit = 2 << ((id % 16) * 2);
        let cfg = Self::read32(&self.gicd, offset);
        Self::write32(&self.gicd, offset, if edge { cfg | bit } else { cfg & !bit });
    }

    fn is_edge_triggered(&self, id: u32) -> bool {
        let offset = GICD_ICFGR + (id / 16) * 4;
        Self::read32(&self.gicd, offset) & (2 << ((id % 16) * 2)) != 0
    }

    fn is_pending(&self, id: u32) -> bool {
        let (offset, bit) = Self::bit_reg(GICD_ISPENDR, id);
        Self::read32(&self.gicd, offset) & bit != 0
    }

    fn clear_pending(&self, id: u32) {
        let (offset, bit) = Self::bit_reg(GICD_ICPENDR, id);
        Self::write32(&self.gicd, offset, bit);
    }

    fn clear_active(&self, id: u32) {
        let (offset, bit) = Self::bit_reg(GICD_ICACTIVER, id);
        Self::write32(&self.gicd, offset, bit);
    }

    fn send_sgi(&self, sgi_id: u32, filter: SgiTargetFilter, target_list: u8) {
        let sgir = Sgir {
            sgi_id,
            target_list,
            filter: filter as u32,
        };
        Self::write32(&self.gicd, GICD_SGIR, sgir.bits());
    }

    fn set_cpu_interface_control(&self, ctlr: u32) {
        Self::write32(&self.gicc, GICC_CTLR, ctlr);
    }

    fn set_priority_mask(&self, pmr: u8) {
        Self::write32(&self.gicc, GICC_PMR, u32::from(pmr));
    }

    fn set_binary_point(&self, bpr: u32) {
        Self::write32(&self.gicc, GICC_BPR, bpr);
    }

    fn acknowledge(&self) -> u32 {
        Self::read32(&self.gicc, GICC_IAR)
    }

    fn end_of_interrupt(&self, iar: u32) {
        Self::write32(&self.gicc, GICC_EOIR, iar);
    }

    fn deactivate(&self, iar: u32) {
        Self::write32(&self.gicc, GICC_DIR, iar);
    }
}

impl VirtualInterfaceController for Gicv2 {
    fn vgic_type(&self) -> u32 {
        Self::read32(&self.gich, GICH_VTR)
    }

    fn hypervisor_control(&self) -> u32 {
        Self::read32(&self.gich, GICH_HCR)
    }

    fn set_hypervisor_control(&self, hcr: u32) {
        Self::write32(&self.gich, GICH_HCR, hcr);
    }

    fn maintenance_status(&self) -> u32 {
        Self::read32(&self.gich, GICH_MISR)
    }

    fn empty_list_register_status(&self) -> u64 {
        let lo = u64::from(Self::read32(&self.gich, GICH_ELRSR0));
        let hi = u64::from(Self::read32(&self.gich, GICH_ELRSR1));
        hi << 32 | lo
    }

    fn list_register(&self, index: usize) -> u32 {
        Self::read32(&self.gich, GICH_LR0 + 4 * index as u32)
    }

    fn set_list_register(&self, index: usize, value: u32) {
        Self::write32(&self.gich, GICH_LR0 + 4 * index as u32, value);
    }

    fn virtual_cpu_control(&self) -> u32 {
        Self::read32(&self.gicv, GICV_CTLR)
    }

    fn set_virtual_cpu_control(&self, ctlr: u32) {
        Self::write32(&self.gicv, GICV_CTLR, ctlr);
    }
}
