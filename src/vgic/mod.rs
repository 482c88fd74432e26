//! Virtual GICv2 distributor backed by the hardware list registers
//!
//! Every guest-visible interrupt has a [`VirqState`]. Pending states wait
//! in one priority queue shared by all cores; each core moves the entries
//! it may take into its own list registers and reconciles what the guest
//! did with them on the next pass through [`VirtualGic::update_state`].
//!
//! Cross-core changes (a target, enable or priority moving under a
//! pending interrupt) are made visible by sending the VgicUpdate SGI,
//! which makes the destination run `update_state` itself.
//!
//! All methods run under the interrupt manager lock.

mod distributor;
pub mod virq;

use core::sync::atomic::{fence, Ordering};

pub use distributor::validate_gicd_register_access;
use virq::{state_index, VirqQueue, VirqState, MAX_NUM_INT_STATES};

use crate::arch::gicv2::{
    HypervisorControl, ListRegister, MaintenanceStatus, SgiTargetFilter, VgicTypeRegister,
    GICV_CTLR_ALLOWED_MASK, LR_EOI_NOTIFICATION, MAX_IRQ_ID, MAX_NUM_LIST_REGISTERS, NUM_PRIVATE_IRQS,
    NUM_SGIS,
};
use crate::arch::{InterruptController, VirtualInterfaceController};
use crate::irq_manager::{IrqClassifier, ThermosphereSgi};
use crate::platform::MAX_CORE;

/// Environment of one vGIC operation: the hardware and the calling core.
pub struct VgicContext<'a, G> {
    pub gic: &'a G,
    pub core_id: u32,
    pub active_core_mask: u32,
    pub classifier: &'a IrqClassifier,
}

impl<G> VgicContext<'_, G> {
    fn core_bit(&self) -> u32 {
        1 << self.core_id
    }
}

pub struct VirtualGic {
    states: [VirqState; MAX_NUM_INT_STATES],
    queue: VirqQueue,
    distributor_enabled: bool,
    /// Per core: bit `n` set while list register `n` holds an interrupt.
    used_lr_map: [u64; MAX_CORE],
    /// Per destination core and SGI id: source cores still waiting to be delivered.
    sgi_pending_sources: [[u8; NUM_SGIS as usize]; MAX_CORE],
    num_list_registers: u32,
}

impl VirtualGic {
    pub const fn new() -> Self {
        Self {
            states: [VirqState::INIT; MAX_NUM_INT_STATES],
            queue: VirqQueue::new(),
            distributor_enabled: false,
            used_lr_map: [0; MAX_CORE],
            sgi_pending_sources: [[0; NUM_SGIS as usize]; MAX_CORE],
            num_list_registers: 0,
        }
    }

    /// Reset shared interrupt state. Boot core only, before any other core
    /// touches the vGIC.
    pub fn init_shared<G>(&mut self, ctx: &VgicContext<'_, G>)
    where
        G: InterruptController + VirtualInterfaceController,
    {
        self.distributor_enabled = false;
        self.queue = VirqQueue::new();
        for id in NUM_PRIVATE_IRQS..=MAX_IRQ_ID {
            let st = &mut self.states[state_index(0, id)];
            *st = VirqState::INIT;
            st.irq_id = id as u16;
            st.edge_triggered = ctx.classifier.is_guest_interrupt(id) && ctx.gic.is_edge_triggered(id);
        }
    }

    /// Reset this core's SGI/PPI states and its virtual interface.
    pub fn init_core<G>(&mut self, ctx: &VgicContext<'_, G>)
    where
        G: InterruptController + VirtualInterfaceController,
    {
        let core = ctx.core_id;
        for id in 0..NUM_PRIVATE_IRQS {
            let st = &mut self.states[state_index(core, id)];
            *st = VirqState::INIT;
            st.irq_id = id as u16;
            st.core_id = core as u8;
            if id < NUM_SGIS {
                st.edge_triggered = true;
                st.enabled = true;
            } else {
                st.edge_triggered = ctx.gic.is_edge_triggered(id);
            }
        }
        self.sgi_pending_sources[core as usize] = [0; NUM_SGIS as usize];
        self.used_lr_map[core as usize] = 0;

        let vtr = VgicTypeRegister::from_bits(ctx.gic.vgic_type());
        self.num_list_registers = vtr.num_list_registers.min(MAX_NUM_LIST_REGISTERS as u32);
        for i in 0..self.num_list_registers as usize {
            ctx.gic.set_list_register(i, 0);
        }

        let hcr = HypervisorControl {
            enable: true,
            vgrp0_enable_ie: true,
            vgrp1_enable_ie: true,
            ..Default::default()
        };
        ctx.gic.set_hypervisor_control(hcr.bits());
        log::debug!(
            "vgic: core {} has {} list registers",
            core,
            self.num_list_registers
        );
    }

    pub fn num_list_registers(&self) -> u32 {
        self.num_list_registers
    }

    pub fn is_distributor_enabled(&self) -> bool {
        self.distributor_enabled
    }

    /// State of `irq_id` as seen from `core_id`.
    pub fn state(&self, core_id: u32, irq_id: u32) -> &VirqState {
        &self.states[state_index(core_id, irq_id)]
    }

    pub fn used_list_registers(&self, core_id: u32) -> u64 {
        self.used_lr_map[core_id as usize]
    }

    /// Interrupt ids in pending-queue order, with their owning core.
    pub fn queued(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.queue.iter(&self.states).map(|idx| {
            let st = &self.states[idx];
            (u32::from(st.core_id), u32::from(st.irq_id))
        })
    }

    pub fn sgi_pending_sources(&self, core_id: u32, sgi_id: u32) -> u8 {
        self.sgi_pending_sources[core_id as usize][sgi_id as usize]
    }

    fn lr_mask(&self) -> u64 {
        if self.num_list_registers as usize >= MAX_NUM_LIST_REGISTERS {
            u64::MAX
        } else {
            (1u64 << self.num_list_registers) - 1
        }
    }

    fn enqueue(&mut self, idx: usize) {
        self.queue.insert(&mut self.states, idx);
    }

    fn dequeue(&mut self, idx: usize) {
        self.queue.erase(&mut self.states, idx);
    }

    // ── Notifications ────────────────────────────────────────────────

    /// Ask the cores in `core_list` (excluding ourselves) to refresh their
    /// list registers.
    fn notify_other_core_list<G>(&self, ctx: &VgicContext<'_, G>, core_list: u32)
    where
        G: InterruptController,
    {
        let list = core_list & !ctx.core_bit() & ctx.active_core_mask;
        if list != 0 {
            fence(Ordering::SeqCst);
            ctx.gic
                .send_sgi(ThermosphereSgi::VgicUpdate as u32, SgiTargetFilter::List, list as u8);
        }
    }

    fn notify_all_other_cores<G>(&self, ctx: &VgicContext<'_, G>)
    where
        G: InterruptController,
    {
        fence(Ordering::SeqCst);
        ctx.gic
            .send_sgi(ThermosphereSgi::VgicUpdate as u32, SgiTargetFilter::AllOthers, 0);
    }

    // ── Incoming interrupts ──────────────────────────────────────────

    /// Record a physical guest interrupt taken on this core.
    pub fn enqueue_physical_irq<G>(&mut self, ctx: &VgicContext<'_, G>, irq_id: u32) {
        let idx = state_index(ctx.core_id, irq_id);
        let st = &mut self.states[idx];
        st.set_pending();
        if !st.is_queued() && !st.handled {
            self.enqueue(idx);
        }
    }

    /// Make SGI `sgi_id` pending on `dst_core`, sent by `src_core`.
    pub fn set_sgi_pending_state<G>(
        &mut self,
        ctx: &VgicContext<'_, G>,
        sgi_id: u32,
        dst_core: u32,
        src_core: u32,
    ) where
        G: InterruptController,
    {
        let sources = &mut self.sgi_pending_sources[dst_core as usize][sgi_id as usize];
        *sources |= 1 << src_core;

        let idx = state_index(dst_core, sgi_id);
        let st = &mut self.states[idx];
        if st.handled || st.is_queued() {
            // Picked up when the current instance leaves its list register.
            return;
        }
        st.pending_latch = true;
        st.src_core_id = src_core as u8;
        *sources &= !(1 << src_core);
        self.enqueue(idx);
        self.notify_other_core_list(ctx, 1 << dst_core);
    }

    /// Deliver a guest-requested SGI according to its target filter.
    pub fn send_sgi<G>(
        &mut self,
        ctx: &VgicContext<'_, G>,
        sgi_id: u32,
        filter: Option<SgiTargetFilter>,
        target_list: u8,
    ) where
        G: InterruptController,
    {
        let dst_mask = match filter {
            Some(SgiTargetFilter::List) => u32::from(target_list),
            Some(SgiTargetFilter::AllOthers) => !ctx.core_bit(),
            Some(SgiTargetFilter::SelfOnly) => ctx.core_bit(),
            None => {
                log::warn!("vgic: core {} used reserved SGI target filter", ctx.core_id);
                return;
            }
        } & ctx.active_core_mask;

        let mut mask = dst_mask;
        while mask != 0 {
            let dst = mask.trailing_zeros();
            mask &= !(1 << dst);
            self.set_sgi_pending_state(ctx, sgi_id, dst, ctx.core_id);
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// Handle the GICH maintenance interrupt. EOI and underflow conditions
    /// need no work here: the `update_state` that follows every interrupt
    /// reclaims the list registers.
    pub fn maintenance_interrupt<G>(&mut self, ctx: &VgicContext<'_, G>)
    where
        G: VirtualInterfaceController,
    {
        let misr = MaintenanceStatus::from_bits(ctx.gic.maintenance_status());
        assert!(
            !misr.lr_entry_not_present,
            "vgic: EOI for an interrupt missing from the list registers"
        );

        if misr.any_group_change() {
            let mut hcr = HypervisorControl::from_bits(ctx.gic.hypervisor_control());
            let ctlr = ctx.gic.virtual_cpu_control();
            ctx.gic.set_virtual_cpu_control(ctlr & GICV_CTLR_ALLOWED_MASK);
            // Only one of the two notifications is armed at a time.
            if misr.vgrp0_enabled {
                hcr.vgrp0_enable_ie = false;
                hcr.vgrp0_disable_ie = true;
            } else if misr.vgrp0_disabled {
                hcr.vgrp0_disable_ie = false;
                hcr.vgrp0_enable_ie = true;
            }
            ctx.gic.set_hypervisor_control(hcr.bits());
            log::trace!("vgic: core {} GICV_CTLR {:#x}", ctx.core_id, ctlr);
        }
    }

    // ── List register reconciliation ─────────────────────────────────

    /// Refresh this core's list registers: reclaim what the guest finished,
    /// drop stale queue entries, then load the best eligible interrupts.
    pub fn update_state<G>(&mut self, ctx: &VgicContext<'_, G>)
    where
        G: InterruptController + VirtualInterfaceController,
    {
        let core = ctx.core_id as usize;

        let mut used = self.used_lr_map[core];
        let mut remaining = used;
        while remaining != 0 {
            let lr = 63 - remaining.leading_zeros() as usize;
            remaining &= !(1 << lr);
            if !self.update_list_register(ctx, lr) {
                used &= !(1 << lr);
            }
        }
        self.used_lr_map[core] = used;

        self.cleanup_pending_queue(ctx);

        let free = self.num_list_registers - used.count_ones();
        let mut chosen = [0usize; MAX_NUM_LIST_REGISTERS];
        let n = self.choose_pending_interrupts(ctx, &mut chosen[..free as usize]);
        self.push_list_registers(ctx, &chosen[..n]);

        let mut hcr = HypervisorControl::from_bits(ctx.gic.hypervisor_control());
        hcr.underflow_ie = self.used_lr_map[core].count_ones() > 1;
        ctx.gic.set_hypervisor_control(hcr.bits());
    }

    /// Reconcile one used list register. Returns whether it stays in use.
    fn update_list_register<G>(&mut self, ctx: &VgicContext<'_, G>, index: usize) -> bool
    where
        G: VirtualInterfaceController,
    {
        let core = ctx.core_id;
        let mut lr = ListRegister::from_bits(ctx.gic.list_register(index));
        let irq_id = lr.virtual_id;
        let idx = state_index(core, irq_id);
        let sources = &mut self.sgi_pending_sources[core as usize];
        let st = &mut self.states[idx];
        assert!(
            st.handled,
            "vgic: LR{} holds vIRQ {} which is not marked handled",
            index, irq_id
        );

        st.active = lr.active;

        if lr.active {
            if irq_id < NUM_SGIS {
                // Same-source SGI raised again: fold it into active+pending.
                let src_bit = 1u8 << st.src_core_id;
                if !lr.pending && sources[irq_id as usize] & src_bit != 0 {
                    sources[irq_id as usize] &= !src_bit;
                    lr.pending = true;
                    ctx.gic.set_list_register(index, lr.bits());
                }
            }
            if !lr.pending {
                st.clear_pending();
            }
            return true;
        }

        if lr.pending {
            // Not acknowledged yet: give it back to the queue so it competes
            // with whatever arrived since.
            st.handled = false;
            st.set_pending();
            ctx.gic.set_list_register(index, 0);
            self.enqueue(idx);
            return false;
        }

        // Completed.
        if irq_id < NUM_SGIS && sources[irq_id as usize] != 0 {
            let src = sources[irq_id as usize].trailing_zeros();
            sources[irq_id as usize] &= !(1 << src);
            st.src_core_id = src as u8;
            lr.physical_id = LR_EOI_NOTIFICATION | src;
            lr.pending = true;
            ctx.gic.set_list_register(index, lr.bits());
            return true;
        }

        st.handled = false;
        ctx.gic.set_list_register(index, 0);
        if st.is_pending() && !st.is_queued() {
            // Raised again while it sat in the list register.
            self.enqueue(idx);
        }
        false
    }

    /// Drop queue entries that are no longer pending. Level-sensitive lines
    /// are re-sampled where this core can observe them.
    fn cleanup_pending_queue<G>(&mut self, ctx: &VgicContext<'_, G>)
    where
        G: InterruptController,
    {
        let mut cur = self.queue.first();
        while let Some(idx) = cur {
            cur = self.queue.next(&self.states, idx);
            let st = &mut self.states[idx];
            let irq_id = u32::from(st.irq_id);

            if !st.edge_triggered {
                let observable = irq_id >= NUM_PRIVATE_IRQS || u32::from(st.core_id) == ctx.core_id;
                if observable && !ctx.gic.is_pending(irq_id) {
                    st.pending = false;
                    // Physical priority drop happened on entry; finish it now.
                    ctx.gic.clear_active(irq_id);
                }
            }

            if !st.is_pending() {
                self.dequeue(idx);
            }
        }
    }

    fn is_eligible<G>(&self, ctx: &VgicContext<'_, G>, st: &VirqState) -> bool {
        if !self.distributor_enabled || !st.enabled {
            return false;
        }
        if st.is_private() {
            u32::from(st.core_id) == ctx.core_id
        } else {
            u32::from(st.target_list) & ctx.core_bit() != 0
        }
    }

    /// Take up to `out.len()` eligible interrupts out of the queue, best first.
    fn choose_pending_interrupts<G>(&mut self, ctx: &VgicContext<'_, G>, out: &mut [usize]) -> usize {
        let mut n = 0;
        let mut cur = self.queue.first();
        while let Some(idx) = cur {
            if n == out.len() {
                break;
            }
            cur = self.queue.next(&self.states, idx);
            if !self.is_eligible(ctx, &self.states[idx]) {
                continue;
            }
            self.dequeue(idx);
            let st = &mut self.states[idx];
            st.handled = true;
            st.core_id = ctx.core_id as u8;
            out[n] = idx;
            n += 1;
        }
        n
    }

    fn push_list_registers<G>(&mut self, ctx: &VgicContext<'_, G>, chosen: &[usize])
    where
        G: VirtualInterfaceController,
    {
        let core = ctx.core_id as usize;
        for &idx in chosen {
            let free = !self.used_lr_map[core] & self.lr_mask();
            assert!(free != 0, "vgic: core {} ran out of list registers", core);
            let index = free.trailing_zeros() as usize;

            let st = &mut self.states[idx];
            let irq_id = u32::from(st.irq_id);
            let lr = if st.is_sgi() {
                ListRegister {
                    virtual_id: irq_id,
                    physical_id: LR_EOI_NOTIFICATION | u32::from(st.src_core_id),
                    priority: st.priority,
                    pending: true,
                    ..Default::default()
                }
            } else {
                ListRegister {
                    virtual_id: irq_id,
                    physical_id: irq_id,
                    priority: st.priority,
                    pending: true,
                    hw: true,
                    ..Default::default()
                }
            };
            // The list register now carries the pending state.
            st.clear_pending();

            ctx.gic.set_list_register(index, lr.bits());
            self.used_lr_map[core] |= 1 << index;
        }
    }
}

impl Default for VirtualGic {
    fn default() -> Self {
        Self::new()
    }
}
