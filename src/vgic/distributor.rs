//! Guest view of the GICv2 distributor
//!
//! Guest accesses to the GICD page trap here. Enable, priority, target and
//! SGI registers act on the virtual interrupt states; pending, active,
//! group and configuration writes are ignored. Host-owned interrupts read
//! as zero and ignore writes.

use super::virq::{state_index, PRIORITY_SHIFT};
use super::{VgicContext, VirtualGic};
use crate::arch::decode::DataAbortIss;
use crate::arch::gicv2::*;
use crate::arch::{ExceptionStackFrame, InterruptController};

const IGROUPR_END: u32 = GICD_IGROUPR + GICD_BITMAP_BANK_SIZE - 1;
const ISENABLER_END: u32 = GICD_ISENABLER + GICD_BITMAP_BANK_SIZE - 1;
const ICENABLER_END: u32 = GICD_ICENABLER + GICD_BITMAP_BANK_SIZE - 1;
const ISPENDR_END: u32 = GICD_ISPENDR + GICD_BITMAP_BANK_SIZE - 1;
const ICPENDR_END: u32 = GICD_ICPENDR + GICD_BITMAP_BANK_SIZE - 1;
const ISACTIVER_END: u32 = GICD_ISACTIVER + GICD_BITMAP_BANK_SIZE - 1;
const ICACTIVER_END: u32 = GICD_ICACTIVER + GICD_BITMAP_BANK_SIZE - 1;
const IPRIORITYR_END: u32 = GICD_IPRIORITYR + GICD_BYTE_BANK_SIZE - 1;
const ITARGETSR_END: u32 = GICD_ITARGETSR + GICD_BYTE_BANK_SIZE - 1;
const ICFGR_END: u32 = GICD_ICFGR + GICD_ICFGR_BANK_SIZE - 1;
const CPENDSGIR_END: u32 = GICD_CPENDSGIR + GICD_SGI_PENDING_BANK_SIZE - 1;
const SPENDSGIR_END: u32 = GICD_SPENDSGIR + GICD_SGI_PENDING_BANK_SIZE - 1;

/// Implementer ARM, revision 2, product 'A'.
const VIRTUAL_GICD_IIDR: u32 = (b'A' as u32) << 24 | 2 << 16 | 0x43B;
/// ArchRev = GICv2
const VIRTUAL_GICD_ICPIDR2: u32 = 2 << 4;
/// CPUNumber and ITLinesNumber
const GICD_TYPER_VISIBLE_MASK: u32 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GicdRegister {
    Ctlr,
    Typer,
    Iidr,
    Igroupr,
    Isenabler,
    Icenabler,
    Ispendr,
    Icpendr,
    Isactiver,
    Icactiver,
    Ipriorityr,
    Itargetsr,
    Icfgr,
    Sgir,
    Cpendsgir,
    Spendsgir,
    Icpidr2,
    Reserved,
}

impl GicdRegister {
    fn allows_byte_access(self) -> bool {
        matches!(
            self,
            Self::Ipriorityr | Self::Itargetsr | Self::Cpendsgir | Self::Spendsgir
        )
    }
}

/// Map a GICD offset to its register and the offset within that register bank.
fn decode_offset(offset: u32) -> (GicdRegister, u32) {
    use GicdRegister::*;
    match offset {
        GICD_CTLR => (Ctlr, 0),
        GICD_TYPER => (Typer, 0),
        GICD_IIDR => (Iidr, 0),
        GICD_IGROUPR..=IGROUPR_END => (Igroupr, offset - GICD_IGROUPR),
        GICD_ISENABLER..=ISENABLER_END => (Isenabler, offset - GICD_ISENABLER),
        GICD_ICENABLER..=ICENABLER_END => (Icenabler, offset - GICD_ICENABLER),
        GICD_ISPENDR..=ISPENDR_END => (Ispendr, offset - GICD_ISPENDR),
        GICD_ICPENDR..=ICPENDR_END => (Icpendr, offset - GICD_ICPENDR),
        GICD_ISACTIVER..=ISACTIVER_END => (Isactiver, offset - GICD_ISACTIVER),
        GICD_ICACTIVER..=ICACTIVER_END => (Icactiver, offset - GICD_ICACTIVER),
        GICD_IPRIORITYR..=IPRIORITYR_END => (Ipriorityr, offset - GICD_IPRIORITYR),
        GICD_ITARGETSR..=ITARGETSR_END => (Itargetsr, offset - GICD_ITARGETSR),
        GICD_ICFGR..=ICFGR_END => (Icfgr, offset - GICD_ICFGR),
        GICD_SGIR => (Sgir, 0),
        GICD_CPENDSGIR..=CPENDSGIR_END => (Cpendsgir, offset - GICD_CPENDSGIR),
        GICD_SPENDSGIR..=SPENDSGIR_END => (Spendsgir, offset - GICD_SPENDSGIR),
        GICD_ICPIDR2 => (Icpidr2, 0),
        _ => (Reserved, 0),
    }
}

/// Whether a guest access of `size` bytes at `offset` is architecturally valid.
///
/// Everything is word-accessible at word alignment; IPRIORITYR, ITARGETSR,
/// CPENDSGIR and SPENDSGIR also take single bytes.
pub fn validate_gicd_register_access(offset: u32, size: u8) -> bool {
    let (reg, _) = decode_offset(offset);
    match size {
        4 => offset & 3 == 0,
        1 => reg.allows_byte_access(),
        _ => false,
    }
}

/// Combine `size` bytes produced by `f(i)` into a little-endian word.
fn gather_bytes(size: u8, mut f: impl FnMut(u32) -> u8) -> u32 {
    (0..u32::from(size)).fold(0, |acc, i| acc | u32::from(f(i)) << (8 * i))
}

impl VirtualGic {
    /// Emulate one trapped guest access to the distributor page.
    pub fn handle_mmio<G>(
        &mut self,
        ctx: &VgicContext<'_, G>,
        frame: &mut ExceptionStackFrame,
        access: &DataAbortIss,
        offset: u32,
    ) where
        G: InterruptController,
    {
        let reg = usize::from(access.reg);
        if access.is_write {
            let mask = if access.size >= 4 {
                u32::MAX
            } else {
                (1u32 << (8 * access.size)) - 1
            };
            let value = frame.reg(reg) as u32 & mask;
            self.write_gicd_register(ctx, offset, access.size, value);
        } else {
            let value = self.read_gicd_register(ctx, offset, access.size);
            frame.set_reg(reg, access.extend(u64::from(value)));
        }
    }

    /// Read a distributor register. Invalid accesses read as zero.
    pub fn read_gicd_register<G>(&self, ctx: &VgicContext<'_, G>, offset: u32, size: u8) -> u32
    where
        G: InterruptController,
    {
        if !validate_gicd_register_access(offset, size) {
            log::warn!(
                "vgicd: core {} invalid {}-byte read at {:#x}",
                ctx.core_id,
                size,
                offset
            );
            return 0;
        }

        let (reg, rel) = decode_offset(offset);
        match reg {
            GicdRegister::Ctlr => u32::from(self.distributor_enabled),
            GicdRegister::Typer => ctx.gic.distributor_type() & GICD_TYPER_VISIBLE_MASK,
            GicdRegister::Iidr => VIRTUAL_GICD_IIDR,
            GicdRegister::Icpidr2 => VIRTUAL_GICD_ICPIDR2,
            GicdRegister::Isenabler | GicdRegister::Icenabler => {
                let first = rel * 8;
                (0..32).fold(0, |acc, i| {
                    let id = first + i;
                    let enabled = id <= MAX_IRQ_ID
                        && ctx.classifier.is_guest_interrupt(id)
                        && self.state(ctx.core_id, id).enabled;
                    acc | u32::from(enabled) << i
                })
            }
            GicdRegister::Ipriorityr => gather_bytes(size, |i| {
                let id = rel + i;
                if id <= MAX_IRQ_ID && ctx.classifier.is_guest_interrupt(id) {
                    self.state(ctx.core_id, id).priority << PRIORITY_SHIFT
                } else {
                    0
                }
            }),
            GicdRegister::Itargetsr => gather_bytes(size, |i| {
                let id = rel + i;
                if id > MAX_IRQ_ID || !ctx.classifier.is_guest_interrupt(id) {
                    0
                } else if id < NUM_PRIVATE_IRQS {
                    1 << ctx.core_id
                } else {
                    self.state(ctx.core_id, id).target_list
                }
            }),
            GicdRegister::Icfgr => {
                let first = rel * 4;
                (0..16).fold(0, |acc, i| {
                    let id = first + i;
                    let edge = id <= MAX_IRQ_ID
                        && ctx.classifier.is_guest_interrupt(id)
                        && self.state(ctx.core_id, id).edge_triggered;
                    acc | u32::from(edge) << (2 * i + 1)
                })
            }
            GicdRegister::Sgir => {
                log::warn!("vgicd: core {} read of write-only GICD_SGIR", ctx.core_id);
                0
            }
            GicdRegister::Igroupr
            | GicdRegister::Ispendr
            | GicdRegister::Icpendr
            | GicdRegister::Isactiver
            | GicdRegister::Icactiver
            | GicdRegister::Cpendsgir
            | GicdRegister::Spendsgir => 0,
            GicdRegister::Reserved => {
                log::warn!("vgicd: core {} read of reserved offset {:#x}", ctx.core_id, offset);
                0
            }
        }
    }

    /// Write a distributor register. Invalid accesses are ignored.
    pub fn write_gicd_register<G>(&mut self, ctx: &VgicContext<'_, G>, offset: u32, size: u8, value: u32)
    where
        G: InterruptController,
    {
        if !validate_gicd_register_access(offset, size) {
            log::warn!(
                "vgicd: core {} invalid {}-byte write at {:#x}",
                ctx.core_id,
                size,
                offset
            );
            return;
        }

        let (reg, rel) = decode_offset(offset);
        match reg {
            GicdRegister::Ctlr => self.set_distributor_enabled(ctx, value & GICD_CTLR_ENABLE != 0),
            GicdRegister::Isenabler | GicdRegister::Icenabler => {
                let first = rel * 8;
                let mut bits = value;
                while bits != 0 {
                    let i = bits.trailing_zeros();
                    bits &= !(1 << i);
                    if reg == GicdRegister::Isenabler {
                        self.set_interrupt_enabled(ctx, first + i);
                    } else {
                        self.clear_interrupt_enabled(ctx, first + i);
                    }
                }
            }
            GicdRegister::Ipriorityr => {
                for i in 0..u32::from(size) {
                    self.set_interrupt_priority_byte(ctx, rel + i, (value >> (8 * i)) as u8);
                }
            }
            GicdRegister::Itargetsr => {
                for i in 0..u32::from(size) {
                    self.set_interrupt_targets(ctx, rel + i, (value >> (8 * i)) as u8);
                }
            }
            GicdRegister::Sgir => {
                let sgir = Sgir::from_bits(value);
                let filter = SgiTargetFilter::from_bits(sgir.filter);
                self.send_sgi(ctx, sgir.sgi_id, filter, sgir.target_list);
            }
            GicdRegister::Typer | GicdRegister::Iidr | GicdRegister::Icpidr2 => {
                log::warn!("vgicd: core {} write to read-only offset {:#x}", ctx.core_id, offset);
            }
            GicdRegister::Igroupr
            | GicdRegister::Icfgr
            | GicdRegister::Ispendr
            | GicdRegister::Icpendr
            | GicdRegister::Isactiver
            | GicdRegister::Icactiver
            | GicdRegister::Cpendsgir
            | GicdRegister::Spendsgir => {
                log::trace!("vgicd: ignoring write {:#x} to {:?}", value, reg);
            }
            GicdRegister::Reserved => {
                log::warn!("vgicd: core {} write to reserved offset {:#x}", ctx.core_id, offset);
            }
        }
    }

    fn set_distributor_enabled<G>(&mut self, ctx: &VgicContext<'_, G>, enabled: bool)
    where
        G: InterruptController,
    {
        if self.distributor_enabled == enabled {
            return;
        }
        self.distributor_enabled = enabled;
        log::debug!("vgicd: distributor {}", if enabled { "enabled" } else { "disabled" });
        self.notify_all_other_cores(ctx);
    }

    fn set_interrupt_enabled<G>(&mut self, ctx: &VgicContext<'_, G>, irq_id: u32)
    where
        G: InterruptController,
    {
        if irq_id < NUM_SGIS || irq_id > MAX_IRQ_ID || !ctx.classifier.is_guest_interrupt(irq_id) {
            return;
        }
        let st = &mut self.states[state_index(ctx.core_id, irq_id)];
        if st.enabled {
            return;
        }
        st.enabled = true;
        let notify = if st.is_pending() { st.targets() } else { 0 };
        ctx.gic.set_enabled(irq_id, true);
        self.notify_other_core_list(ctx, notify);
    }

    fn clear_interrupt_enabled<G>(&mut self, ctx: &VgicContext<'_, G>, irq_id: u32)
    where
        G: InterruptController,
    {
        if irq_id < NUM_SGIS || irq_id > MAX_IRQ_ID || !ctx.classifier.is_guest_interrupt(irq_id) {
            return;
        }
        let st = &mut self.states[state_index(ctx.core_id, irq_id)];
        if !st.enabled {
            return;
        }
        st.enabled = false;
        // Whoever holds it in a list register has to pull it back.
        let notify = if st.handled { 1 << st.core_id } else { 0 };
        ctx.gic.set_enabled(irq_id, false);
        self.notify_other_core_list(ctx, notify);
    }

    fn set_interrupt_priority_byte<G>(&mut self, ctx: &VgicContext<'_, G>, irq_id: u32, byte: u8)
    where
        G: InterruptController,
    {
        if irq_id > MAX_IRQ_ID || !ctx.classifier.is_guest_interrupt(irq_id) {
            return;
        }
        let idx = state_index(ctx.core_id, irq_id);
        let priority = byte >> PRIORITY_SHIFT;
        let st = &mut self.states[idx];
        if st.priority == priority {
            return;
        }
        st.priority = priority;
        let pending = st.is_pending();
        let targets = st.targets();
        if st.is_queued() {
            // Keep the queue sorted.
            self.dequeue(idx);
            self.enqueue(idx);
        }
        if pending {
            self.notify_other_core_list(ctx, targets);
        }
    }

    fn set_interrupt_targets<G>(&mut self, ctx: &VgicContext<'_, G>, irq_id: u32, targets: u8)
    where
        G: InterruptController,
    {
        // Private interrupts have fixed targets.
        if irq_id < NUM_PRIVATE_IRQS || irq_id > MAX_IRQ_ID || !ctx.classifier.is_guest_interrupt(irq_id) {
            return;
        }
        let st = &mut self.states[state_index(ctx.core_id, irq_id)];
        if st.target_list == targets {
            return;
        }
        let changed = u32::from(st.target_list ^ targets);
        let notify = if st.is_pending() { changed } else { 0 };
        st.target_list = targets;
        ctx.gic.set_targets(irq_id, targets);
        self.notify_other_core_list(ctx, notify);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_access_only_on_byte_banks() {
        assert!(validate_gicd_register_access(GICD_IPRIORITYR + 3, 1));
        assert!(validate_gicd_register_access(GICD_ITARGETSR + 33, 1));
        assert!(validate_gicd_register_access(GICD_SPENDSGIR + 1, 1));
        assert!(!validate_gicd_register_access(GICD_ISENABLER + 1, 1));
        assert!(!validate_gicd_register_access(GICD_CTLR, 1));
    }

    #[test]
    fn test_word_access_requires_alignment() {
        assert!(validate_gicd_register_access(GICD_ISENABLER + 4, 4));
        assert!(!validate_gicd_register_access(GICD_IPRIORITYR + 2, 4));
        assert!(!validate_gicd_register_access(GICD_CTLR, 2));
        assert!(!validate_gicd_register_access(GICD_CTLR, 8));
    }

    #[test]
    fn test_offset_decoding() {
        assert_eq!(decode_offset(0x104), (GicdRegister::Isenabler, 4));
        assert_eq!(decode_offset(0x820), (GicdRegister::Itargetsr, 0x20));
        assert_eq!(decode_offset(0xF00), (GicdRegister::Sgir, 0));
        assert_eq!(decode_offset(0x00C).0, GicdRegister::Reserved);
    }
}
