//! Debugger reads and writes of guest virtual memory.

mod common;

use common::*;
use thermosphere::arch::gicv2::*;
use thermosphere::guest_memory::GuestMemory;

const GICD_VA: u64 = 0x8000_0000;

fn mapped() -> &'static TestHypervisor {
    let hv = booted(1);
    let mem = hv.memory();
    mem.map_normal(0x1000, 0x4000_0000);
    mem.map_normal(0x2000, 0x4000_5000);
    mem.map_device(0x3000, 0x0900_0000, 2);
    mem.map_gicd(GICD_VA);
    hv
}

#[test]
fn test_read_follows_each_page_translation() {
    let hv = mapped();
    hv.memory().poke(0x4000_0FFC, &[1, 2, 3, 4]);
    hv.memory().poke(0x4000_5000, &[5, 6, 7, 8]);

    let mut buf = [0u8; 8];
    assert_eq!(hv.guest_memory(0).read(0x1FFC, &mut buf), 8);
    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_transfer_stops_at_unmapped_page() {
    let hv = mapped();
    let mem = hv.guest_memory(0);
    let mut buf = [0u8; 8];
    // Neither 0x4000 nor 0x9000 is mapped.
    assert_eq!(mem.read(0x4FFC, &mut buf), 0);
    assert_eq!(mem.read(0x9000, &mut buf), 0);
    assert!(!mem.write_u32(0x9000, 1));
    assert_eq!(mem.read_u32(0x9000), None);
}

#[test]
fn test_write_cleans_each_chunk() {
    let hv = mapped();
    assert_eq!(hv.guest_memory(0).write(0x1FFE, &[0xAA; 4]), 4);
    assert_eq!(hv.memory().peek(0x4000_0FFE, 2), [0xAA, 0xAA]);
    assert_eq!(hv.memory().peek(0x4000_5000, 2), [0xAA, 0xAA]);
    assert_eq!(
        hv.memory().maintained_ranges(),
        [(0x4000_0FFE, 2), (0x4000_5000, 2)]
    );
}

#[test]
fn test_device_fault_stops_transfer() {
    let hv = mapped();
    let mem = hv.guest_memory(0);
    let mut buf = [0u8; 4];
    assert_eq!(mem.read(0x3000, &mut buf), 2);
    assert_eq!(mem.write(0x3000, &[1, 2, 3, 4]), 2);
    assert_eq!(hv.memory().peek(0x0900_0000, 4), [1, 2, 0, 0]);
    // Normal memory ahead of the device page still counts.
    assert_eq!(mem.read(0x2FFE, &mut buf), 4);
    assert_eq!(mem.read(0x2FFC, &mut [0u8; 8]), 6);
}

#[test]
fn test_distributor_read_uses_register_accesses() {
    let hv = mapped();
    let mem = hv.guest_memory(0);

    assert_eq!(mem.read_u32(GICD_VA + u64::from(GICD_TYPER)), Some(GICD_TYPER_VALUE));

    // Byte, byte, then a whole word.
    let mut buf = [0u8; 6];
    assert_eq!(mem.read(GICD_VA + u64::from(GICD_IPRIORITYR) + 2, &mut buf), 6);
    assert_eq!(buf, [0xF8; 6]);

    // ISENABLER has no byte access.
    let mut buf = [0u8; 2];
    assert_eq!(mem.read(GICD_VA + u64::from(GICD_ISENABLER) + 1, &mut buf), 0);
}

#[test]
fn test_distributor_sgir_reads_zero() {
    let hv = mapped();
    let mut buf = [0xFFu8; 4];
    assert_eq!(hv.guest_memory(0).read(GICD_VA + u64::from(GICD_SGIR), &mut buf), 4);
    assert_eq!(buf, [0; 4]);
}

#[test]
fn test_distributor_write_reaches_vgic() {
    let hv = mapped();
    let mem = hv.guest_memory(0);
    assert!(mem.write_u32(GICD_VA + u64::from(GICD_CTLR), 1));
    hv.irq().with_vgic(0, 1, |vgic, _| assert!(vgic.is_distributor_enabled()));

    assert_eq!(mem.write(GICD_VA + u64::from(GICD_IPRIORITYR) + 40, &[0x40]), 1);
    hv.irq().with_vgic(0, 1, |vgic, _| assert_eq!(vgic.state(0, 40).priority, 0x40 >> 3));
}
