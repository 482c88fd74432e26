//! List register reconciliation and the virtual interrupt queue.

mod common;

use common::*;
use thermosphere::arch::gicv2::*;

/// Route SPI `irq_id` to `targets` with `priority` and enable it.
fn configure_spi(hv: &TestHypervisor, irq_id: u32, priority: u8, targets: u8) {
    let irq = hv.irq();
    let mask = hv.active_core_mask();
    irq.write_gicd(0, mask, GICD_ITARGETSR + irq_id, 1, u32::from(targets));
    irq.write_gicd(0, mask, GICD_IPRIORITYR + irq_id, 1, u32::from(priority));
    irq.write_gicd(0, mask, GICD_ISENABLER + (irq_id / 32) * 4, 4, 1 << (irq_id % 32));
}

fn enable_distributor(hv: &TestHypervisor) {
    hv.irq().write_gicd(0, hv.active_core_mask(), GICD_CTLR, 4, GICD_CTLR_ENABLE);
    hv.irq().gic().clear_sent_sgis();
}

/// Assert level lines and hand them to the vGIC in one pass.
fn deliver(hv: &TestHypervisor, core_id: u32, irqs: &[u32]) {
    for &id in irqs {
        hv.irq().gic().set_line_level(core_id, id, true);
    }
    hv.irq().with_vgic(core_id, hv.active_core_mask(), |vgic, ctx| {
        for &id in irqs {
            vgic.enqueue_physical_irq(ctx, id);
        }
        vgic.update_state(ctx);
    });
}

fn update(hv: &TestHypervisor, core_id: u32) {
    hv.irq()
        .with_vgic(core_id, hv.active_core_mask(), |vgic, ctx| vgic.update_state(ctx));
}

/// Virtual ids held in the list registers, by register index.
fn lr_ids(hv: &TestHypervisor, core_id: u32) -> Vec<u32> {
    hv.irq()
        .gic()
        .list_registers(core_id)
        .iter()
        .filter(|lr| !lr.is_empty())
        .map(|lr| lr.virtual_id)
        .collect()
}

fn queued_ids(hv: &TestHypervisor) -> Vec<u32> {
    hv.irq().with_vgic(0, hv.active_core_mask(), |vgic, _| {
        vgic.queued().map(|(_, id)| id).collect()
    })
}

#[test]
fn test_list_registers_filled_by_priority() {
    let hv = booted(1);
    enable_distributor(hv);
    configure_spi(hv, 40, 0xA0, 0b01);
    configure_spi(hv, 41, 0x20, 0b01);
    configure_spi(hv, 42, 0x60, 0b01);

    deliver(hv, 0, &[40, 41, 42]);

    assert_eq!(lr_ids(hv, 0), [41, 42, 40]);
    let lrs = hv.irq().gic().list_registers(0);
    assert_eq!(lrs[0].priority, 0x20 >> 3);
    assert!(lrs.iter().take(3).all(|lr| lr.hw && lr.pending && lr.physical_id == lr.virtual_id));
    assert!(queued_ids(hv).is_empty());
}

#[test]
fn test_overflow_waits_in_queue() {
    let hv = booted(1);
    enable_distributor(hv);
    for (i, id) in (40..46).enumerate() {
        configure_spi(hv, id, (i as u8 + 1) * 8, 0b01);
    }

    deliver(hv, 0, &[40, 41, 42, 43, 44, 45]);

    assert_eq!(lr_ids(hv, 0), [40, 41, 42, 43]);
    assert_eq!(queued_ids(hv), [44, 45]);
    let hcr = HypervisorControl::from_bits(hv.irq().gic().hcr(0));
    assert!(hcr.underflow_ie);
    hv.irq().with_vgic(0, 1, |vgic, _| {
        assert_eq!(vgic.used_list_registers(0), 0b1111);
    });
}

#[test]
fn test_completed_interrupt_frees_its_list_register() {
    let hv = booted(1);
    enable_distributor(hv);
    for (i, id) in (40..46).enumerate() {
        configure_spi(hv, id, (i as u8 + 1) * 8, 0b01);
    }
    deliver(hv, 0, &[40, 41, 42, 43, 44, 45]);

    // Guest acknowledges and completes vIRQ 40; the device drops the line.
    let gic = hv.irq().gic();
    gic.guest_update_lr(0, 0, |lr| {
        lr.pending = false;
        lr.active = false;
    });
    gic.set_line_level(0, 40, false);
    update(hv, 0);

    assert_eq!(lr_ids(hv, 0), [41, 42, 43, 44]);
    assert_eq!(queued_ids(hv), [45]);
    hv.irq().with_vgic(0, 1, |vgic, _| {
        assert!(!vgic.state(0, 40).handled);
        assert!(!vgic.state(0, 40).is_queued());
    });
}

#[test]
fn test_unacknowledged_entries_yield_to_higher_priority() {
    let hv = booted(1);
    enable_distributor(hv);
    for (i, id) in (40..46).enumerate() {
        configure_spi(hv, id, (i as u8 + 1) * 8, 0b01);
    }
    configure_spi(hv, 46, 0x00, 0b01);
    deliver(hv, 0, &[40, 41, 42, 43, 44, 45]);

    deliver(hv, 0, &[46]);

    assert_eq!(lr_ids(hv, 0), [46, 40, 41, 42]);
    assert_eq!(queued_ids(hv), [43, 44, 45]);
}

#[test]
fn test_active_interrupt_keeps_its_list_register() {
    let hv = booted(1);
    enable_distributor(hv);
    configure_spi(hv, 40, 0x80, 0b01);
    configure_spi(hv, 41, 0x00, 0b01);
    deliver(hv, 0, &[40]);

    hv.irq().gic().guest_update_lr(0, 0, |lr| {
        lr.pending = false;
        lr.active = true;
    });
    deliver(hv, 0, &[41]);

    // 40 is in service and stays put even though 41 is more urgent.
    assert_eq!(lr_ids(hv, 0), [40, 41]);
    let lr = hv.irq().gic().list_registers(0)[0];
    assert!(lr.active && !lr.pending);
}

#[test]
fn test_spi_waits_for_its_target_core() {
    let hv = booted(2);
    enable_distributor(hv);
    configure_spi(hv, 40, 0x80, 0b10);
    hv.irq().gic().clear_sent_sgis();

    deliver(hv, 0, &[40]);
    assert!(lr_ids(hv, 0).is_empty());
    assert_eq!(queued_ids(hv), [40]);

    set_current_core(1);
    update(hv, 1);
    assert_eq!(lr_ids(hv, 1), [40]);
    hv.irq().with_vgic(1, 0b11, |vgic, _| {
        assert_eq!(vgic.state(1, 40).core_id, 1);
    });
}

#[test]
fn test_guest_sgi_reaches_target_core() {
    let hv = booted(2);
    enable_distributor(hv);
    let gic = hv.irq().gic();

    // SGI 5 to core 1, target list filter.
    hv.irq().write_gicd(0, 0b11, GICD_SGIR, 4, 0b10 << 16 | 5);

    assert_eq!(
        gic.sent_sgis(),
        [SentSgi { sender: 0, sgi_id: 0, targets: 0b10 }]
    );
    assert!(lr_ids(hv, 0).is_empty());

    set_current_core(1);
    drain_irqs(hv);
    let lr = gic.list_registers(1)[0];
    assert_eq!(lr.virtual_id, 5);
    assert_eq!(lr.physical_id, LR_EOI_NOTIFICATION);
    assert!(!lr.hw);
    assert!(lr.pending);
}

#[test]
fn test_same_source_sgi_coalesces_into_active_pending() {
    let hv = booted(2);
    enable_distributor(hv);
    let gic = hv.irq().gic();
    hv.irq().write_gicd(0, 0b11, GICD_SGIR, 4, 0b10 << 16 | 5);
    set_current_core(1);
    drain_irqs(hv);

    // Guest on core 1 takes it; core 0 sends it again meanwhile.
    gic.guest_update_lr(1, 0, |lr| {
        lr.pending = false;
        lr.active = true;
    });
    set_current_core(0);
    hv.irq().write_gicd(0, 0b11, GICD_SGIR, 4, 0b10 << 16 | 5);
    hv.irq().with_vgic(0, 0b11, |vgic, _| {
        assert_eq!(vgic.sgi_pending_sources(1, 5), 0b01);
    });

    set_current_core(1);
    update(hv, 1);
    let lr = gic.list_registers(1)[0];
    assert!(lr.active && lr.pending);
    hv.irq().with_vgic(1, 0b11, |vgic, _| {
        assert_eq!(vgic.sgi_pending_sources(1, 5), 0);
    });
}

#[test]
fn test_completed_sgi_reloads_next_source() {
    let hv = booted(2);
    enable_distributor(hv);
    let gic = hv.irq().gic();
    hv.irq().write_gicd(0, 0b11, GICD_SGIR, 4, 0b10 << 16 | 5);
    set_current_core(1);
    drain_irqs(hv);
    gic.guest_update_lr(1, 0, |lr| {
        lr.pending = false;
        lr.active = true;
    });

    // Core 1 sends SGI 5 to itself while the first instance is active.
    hv.irq().write_gicd(1, 0b11, GICD_SGIR, 4, 2 << 24 | 5);
    gic.guest_update_lr(1, 0, |lr| lr.active = false);
    update(hv, 1);

    let lr = gic.list_registers(1)[0];
    assert_eq!(lr.virtual_id, 5);
    assert_eq!(lr.physical_id, LR_EOI_NOTIFICATION | 1);
    assert!(lr.pending);
    hv.irq().with_vgic(1, 0b11, |vgic, _| {
        assert_eq!(vgic.state(1, 5).src_core_id, 1);
        assert_eq!(vgic.sgi_pending_sources(1, 5), 0);
    });
}

#[test]
fn test_disabling_pulls_interrupt_back() {
    let hv = booted(1);
    enable_distributor(hv);
    configure_spi(hv, 40, 0x80, 0b01);
    deliver(hv, 0, &[40]);
    assert_eq!(lr_ids(hv, 0), [40]);

    hv.irq().write_gicd(0, 1, GICD_ICENABLER + 4, 4, 1 << (40 - 32));

    assert!(lr_ids(hv, 0).is_empty());
    assert_eq!(queued_ids(hv), [40]);
    assert!(!hv.irq().gic().is_enabled_on(0, 40));

    // Enabling it again puts it back.
    hv.irq().write_gicd(0, 1, GICD_ISENABLER + 4, 4, 1 << (40 - 32));
    assert_eq!(lr_ids(hv, 0), [40]);
}

#[test]
fn test_dropped_level_line_is_retired() {
    let hv = booted(1);
    enable_distributor(hv);
    configure_spi(hv, 40, 0x80, 0b01);
    let gic = hv.irq().gic();

    gic.raise(0, 40);
    hv.handle_irq(hv.cores().get(0));
    assert_eq!(lr_ids(hv, 0), [40]);
    assert!(gic.is_active_on(0, 40));

    gic.set_line_level(0, 40, false);
    update(hv, 0);

    assert!(lr_ids(hv, 0).is_empty());
    assert!(queued_ids(hv).is_empty());
    assert!(!gic.is_active_on(0, 40));
}

#[test]
fn test_disabled_distributor_holds_everything() {
    let hv = booted(1);
    configure_spi(hv, 40, 0x80, 0b01);
    deliver(hv, 0, &[40]);
    assert!(lr_ids(hv, 0).is_empty());
    assert_eq!(queued_ids(hv), [40]);

    enable_distributor(hv);
    assert_eq!(lr_ids(hv, 0), [40]);
}

#[test]
fn test_group_enable_maintenance_flips_notification() {
    let hv = booted(1);
    let gic = hv.irq().gic();
    gic.set_misr(0, 1 << 4);
    gic.set_gicv_ctlr(0, 0x3FF);

    gic.raise(0, MAINTENANCE_IRQ);
    hv.handle_irq(hv.cores().get(0));

    assert_eq!(gic.gicv_ctlr(0), 0x201);
    let hcr = HypervisorControl::from_bits(gic.hcr(0));
    assert!(!hcr.vgrp0_enable_ie);
    assert!(hcr.vgrp0_disable_ie);
    assert_eq!(gic.deactivations(0), [MAINTENANCE_IRQ]);
}

#[test]
#[should_panic(expected = "missing from the list registers")]
fn test_eoi_for_unknown_entry_is_fatal() {
    let hv = booted(1);
    hv.irq().gic().set_misr(0, 1 << 2);
    hv.irq().gic().raise(0, MAINTENANCE_IRQ);
    hv.handle_irq(hv.cores().get(0));
}

#[test]
fn test_group_disable_maintenance_rearms_enable_notification() {
    let hv = booted(1);
    let gic = hv.irq().gic();
    gic.set_misr(0, 1 << 4);
    gic.raise(0, MAINTENANCE_IRQ);
    hv.handle_irq(hv.cores().get(0));

    gic.set_misr(0, 1 << 5);
    gic.raise(0, MAINTENANCE_IRQ);
    hv.handle_irq(hv.cores().get(0));

    let hcr = HypervisorControl::from_bits(gic.hcr(0));
    assert!(hcr.vgrp0_enable_ie);
    assert!(!hcr.vgrp0_disable_ie);
}

#[test]
fn test_group_enable_wins_when_both_are_reported() {
    let hv = booted(1);
    let gic = hv.irq().gic();
    gic.set_misr(0, 1 << 4 | 1 << 5);
    gic.raise(0, MAINTENANCE_IRQ);
    hv.handle_irq(hv.cores().get(0));

    let hcr = HypervisorControl::from_bits(gic.hcr(0));
    assert!(!hcr.vgrp0_enable_ie);
    assert!(hcr.vgrp0_disable_ie);
}

const VGIC_UPDATE: u32 = 0;

fn vgic_update_to(targets: u32) -> SentSgi {
    SentSgi { sender: 0, sgi_id: VGIC_UPDATE, targets }
}

#[test]
fn test_enabling_pending_spi_notifies_its_targets() {
    let hv = booted(3);
    enable_distributor(hv);
    let irq = hv.irq();
    irq.write_gicd(0, 0b111, GICD_ITARGETSR + 40, 1, 0b110);
    irq.write_gicd(0, 0b111, GICD_IPRIORITYR + 40, 1, 0x80);
    // Pending but disabled: parked in the queue.
    deliver(hv, 0, &[40]);
    assert_eq!(queued_ids(hv), [40]);
    irq.gic().clear_sent_sgis();

    irq.write_gicd(0, 0b111, GICD_ISENABLER + 4, 4, 1 << (40 - 32));

    assert_eq!(irq.gic().sent_sgis(), [vgic_update_to(0b110)]);
    assert!(irq.gic().is_enabled_on(0, 40));

    // Nothing pending behind 41: nobody to tell.
    irq.gic().clear_sent_sgis();
    irq.write_gicd(0, 0b111, GICD_ISENABLER + 4, 4, 1 << (41 - 32));
    assert!(irq.gic().sent_sgis().is_empty());
}

#[test]
fn test_disabling_listed_spi_notifies_its_holder() {
    let hv = booted(2);
    enable_distributor(hv);
    configure_spi(hv, 40, 0x80, 0b10);
    deliver(hv, 0, &[40]);
    set_current_core(1);
    update(hv, 1);
    assert_eq!(lr_ids(hv, 1), [40]);

    set_current_core(0);
    let irq = hv.irq();
    irq.gic().clear_sent_sgis();
    irq.write_gicd(0, 0b11, GICD_ICENABLER + 4, 4, 1 << (40 - 32));

    assert_eq!(irq.gic().sent_sgis(), [vgic_update_to(0b10)]);
    // Core 1 pulls it back on its next pass.
    set_current_core(1);
    update(hv, 1);
    assert!(lr_ids(hv, 1).is_empty());
    assert_eq!(queued_ids(hv), [40]);
}

#[test]
fn test_disabling_idle_spi_is_silent() {
    let hv = booted(2);
    enable_distributor(hv);
    configure_spi(hv, 40, 0x80, 0b10);
    hv.irq().gic().clear_sent_sgis();

    hv.irq().write_gicd(0, 0b11, GICD_ICENABLER + 4, 4, 1 << (40 - 32));

    assert!(hv.irq().gic().sent_sgis().is_empty());
    assert!(!hv.irq().gic().is_enabled_on(0, 40));
}

#[test]
fn test_priority_change_on_pending_spi_notifies_and_requeues() {
    let hv = booted(3);
    enable_distributor(hv);
    configure_spi(hv, 40, 0x80, 0b100);
    configure_spi(hv, 41, 0x40, 0b100);
    deliver(hv, 0, &[40, 41]);
    assert_eq!(queued_ids(hv), [41, 40]);
    let irq = hv.irq();
    irq.gic().clear_sent_sgis();

    irq.write_gicd(0, 0b111, GICD_IPRIORITYR + 40, 1, 0x00);

    assert_eq!(irq.gic().sent_sgis(), [vgic_update_to(0b100)]);
    assert_eq!(queued_ids(hv), [40, 41]);

    // Same value again changes nothing.
    irq.gic().clear_sent_sgis();
    irq.write_gicd(0, 0b111, GICD_IPRIORITYR + 40, 1, 0x00);
    assert!(irq.gic().sent_sgis().is_empty());
}

#[test]
fn test_retargeting_pending_spi_notifies_old_and_new_targets() {
    let hv = booted(4);
    enable_distributor(hv);
    configure_spi(hv, 40, 0x80, 0b0110);
    deliver(hv, 0, &[40]);
    let irq = hv.irq();
    irq.gic().clear_sent_sgis();

    irq.write_gicd(0, 0b1111, GICD_ITARGETSR + 40, 1, 0b1100);

    // Core 1 loses it, core 3 gains it, core 2 keeps it.
    assert_eq!(irq.gic().sent_sgis(), [vgic_update_to(0b1010)]);
    assert_eq!(irq.gic().targets_of(40), 0b1100);
}

#[test]
fn test_retargeting_idle_spi_only_moves_the_line() {
    let hv = booted(4);
    enable_distributor(hv);
    configure_spi(hv, 40, 0x80, 0b0010);
    hv.irq().gic().clear_sent_sgis();

    hv.irq().write_gicd(0, 0b1111, GICD_ITARGETSR + 40, 1, 0b1000);

    assert!(hv.irq().gic().sent_sgis().is_empty());
    assert_eq!(hv.irq().gic().targets_of(40), 0b1000);
}

#[test]
fn test_full_list_registers_arm_underflow_and_yield_to_urgent_spi() {
    let hv = booted(1);
    enable_distributor(hv);
    for (i, id) in (40..44).enumerate() {
        configure_spi(hv, id, (i as u8 + 1) * 0x10, 0b01);
    }
    configure_spi(hv, 44, 0x00, 0b01);
    let gic = hv.irq().gic();

    deliver(hv, 0, &[40, 41, 42, 43]);
    assert_eq!(lr_ids(hv, 0), [40, 41, 42, 43]);
    assert!(queued_ids(hv).is_empty());
    assert!(HypervisorControl::from_bits(gic.hcr(0)).underflow_ie);

    // The least urgent unacknowledged entry makes room.
    deliver(hv, 0, &[44]);
    assert_eq!(lr_ids(hv, 0), [44, 40, 41, 42]);
    assert_eq!(gic.list_registers(0)[0].priority, 0);
    assert_eq!(queued_ids(hv), [43]);
    assert!(HypervisorControl::from_bits(gic.hcr(0)).underflow_ie);

    // Everything handled and the lines dropped: nothing left to refill.
    for lr in 0..NUM_LIST_REGISTERS {
        gic.guest_update_lr(0, lr, |lr| {
            lr.pending = false;
            lr.active = false;
        });
    }
    for id in 40..45 {
        gic.set_line_level(0, id, false);
    }
    update(hv, 0);
    assert!(lr_ids(hv, 0).is_empty());
    assert!(queued_ids(hv).is_empty());
    assert!(!HypervisorControl::from_bits(gic.hcr(0)).underflow_ie);
}
