//! Platform/Board Constants (QEMU virt machine, GICv2 + virtualization extensions)
//!
//! All board-specific addresses and sizes live here so they can be
//! changed in one place when targeting a different platform. `dtb.rs`
//! overrides the MMIO bases at boot when a device tree is available.

// ── Cores ────────────────────────────────────────────────────────────
/// Maximum number of physical cores the hypervisor tracks.
pub const MAX_CORE: usize = 4;

// ── UART (PL011) ─────────────────────────────────────────────────────
pub const UART_BASE: usize = 0x0900_0000;
pub const UART_SIZE: u64 = 0x1000;
/// PL011 interrupt (SPI 1).
pub const UART_IRQ: u32 = 33;

// ── GICv2 ────────────────────────────────────────────────────────────
pub const GICD_BASE: u64 = 0x0800_0000;
pub const GICD_SIZE: u64 = 0x1000;
pub const GICC_BASE: u64 = 0x0801_0000;
pub const GICH_BASE: u64 = 0x0803_0000;
pub const GICV_BASE: u64 = 0x0804_0000;

// ── Memory ───────────────────────────────────────────────────────────
pub const PAGE_SIZE: u64 = 0x1000;
pub const GUEST_RAM_BASE: u64 = 0x4000_0000;

// ── GDB stub ─────────────────────────────────────────────────────────
/// Largest packet payload exchanged with the debugger.
pub const GDB_BUF_LEN: usize = 0x800;

// ── Guest ────────────────────────────────────────────────────────────
/// Where the boot core enters the guest kernel (loaded by the firmware
/// or `-device loader`), with the DTB address in x0.
pub const GUEST_KERNEL_ENTRY: u64 = GUEST_RAM_BASE + 0x8_0000;
