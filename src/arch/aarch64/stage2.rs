//! Identity stage-2 translation for the guest
//!
//! 4KB granule, 4GB IPA space starting at level 1. The first gigabyte is
//! device memory; the 2MB block holding the GIC gets its own page table so
//! that the distributor page faults (and is emulated) and the guest's CPU
//! interface window is backed by GICV. Everything above 1GB is normal memory.

use core::cell::UnsafeCell;

use crate::dtb::PlatformInfo;
use crate::platform::PAGE_SIZE;

const ENTRIES: usize = 512;
const BLOCK_1G: u64 = 1 << 30;
const BLOCK_2M: u64 = 1 << 21;
const IPA_GB: usize = 4;

const DESC_VALID: u64 = 1 << 0;
const DESC_TABLE: u64 = 1 << 1;
const DESC_AF: u64 = 1 << 10;
const DESC_S2AP_RW: u64 = 0b11 << 6;
const DESC_SH_INNER: u64 = 0b11 << 8;
const MEMATTR_NORMAL_WB: u64 = 0b1111 << 2;
const MEMATTR_DEVICE_NGNRE: u64 = 0b0001 << 2;

const NORMAL: u64 = DESC_AF | DESC_S2AP_RW | DESC_SH_INNER | MEMATTR_NORMAL_WB;
const DEVICE: u64 = DESC_AF | DESC_S2AP_RW | MEMATTR_DEVICE_NGNRE;

// T0SZ = 32 (4GB), SL0 = 1 (start at level 1), inner/outer WB, inner
// shareable, 4KB granule, PS = 40 bits.
const VTCR: u64 = 32 | (1 << 6) | (1 << 8) | (1 << 10) | (3 << 12) | (2 << 16) | (1 << 31);

/// GICv2 CPU interfaces span two pages.
const GIC_CPU_INTERFACE_SIZE: u64 = 0x2000;

#[repr(C, align(4096))]
struct Table([u64; ENTRIES]);

struct Tables {
    level1: Table,
    level2: Table,
    level3: Table,
}

struct TablesCell(UnsafeCell<Tables>);

// Safety: built by the boot core before any other core runs, read-only
// (by the MMU) afterwards.
unsafe impl Sync for TablesCell {}

static TABLES: TablesCell = TablesCell(UnsafeCell::new(Tables {
    level1: Table([0; ENTRIES]),
    level2: Table([0; ENTRIES]),
    level3: Table([0; ENTRIES]),
}));

fn block(addr: u64, attrs: u64) -> u64 {
    addr | attrs | DESC_VALID
}

fn page(addr: u64, attrs: u64) -> u64 {
    addr | attrs | DESC_TABLE | DESC_VALID
}

fn table(table: &Table) -> u64 {
    table as *const Table as u64 | DESC_TABLE | DESC_VALID
}

/// Build the tables. Boot core only, before [`install`] runs anywhere.
pub fn build(info: &PlatformInfo) {
    let tables = unsafe { &mut *TABLES.0.get() };

    let gic_block = info.gicd_base & !(BLOCK_2M - 1);
    for (i, entry) in tables.level3.0.iter_mut().enumerate() {
        let ipa = gic_block + i as u64 * PAGE_SIZE;
        *entry = if (info.gicd_base..info.gicd_base + PAGE_SIZE).contains(&ipa) {
            0
        } else if (info.gicc_base..info.gicc_base + GIC_CPU_INTERFACE_SIZE).contains(&ipa) {
            page(info.gicv_base + (ipa - info.gicc_base), DEVICE)
        } else if (info.gich_base..info.gich_base + PAGE_SIZE).contains(&ipa) {
            0
        } else {
            page(ipa, DEVICE)
        };
    }

    for (i, entry) in tables.level2.0.iter_mut().enumerate() {
        let ipa = i as u64 * BLOCK_2M;
        *entry = if ipa == gic_block {
            table(&tables.level3)
        } else {
            block(ipa, DEVICE)
        };
    }

    tables.level1.0[0] = table(&tables.level2);
    for gb in 1..IPA_GB {
        tables.level1.0[gb] = block(gb as u64 * BLOCK_1G, NORMAL);
    }
    log::debug!(target: "mm", "stage-2: gic block {:#x} remapped", gic_block);
}

/// Point VTTBR_EL2 at the tables on the calling core.
pub fn install() {
    let vttbr = unsafe { &(*TABLES.0.get()).level1 } as *const Table as u64;
    unsafe {
        core::arch::asm!(
            "msr vtcr_el2, {vtcr}",
            "msr vttbr_el2, {vttbr}",
            "isb",
            "tlbi vmalls12e1",
            "dsb nsh",
            "isb",
            vtcr = in(reg) VTCR,
            vttbr = in(reg) vttbr,
            options(nostack),
        );
    }
}
