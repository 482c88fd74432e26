//! Host DTB (Device Tree Blob) runtime parsing
//!
//! Parses the host DTB passed in x0 at boot to discover the GICv2
//! distributor/CPU/hypervisor/virtual-CPU interfaces, the UART and the
//! CPU count. The `fdt` crate does zero-copy parsing, so no heap is needed.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::platform;

/// Runtime-discovered platform information from host DTB.
///
/// Fields start out with QEMU virt defaults so everything works even if
/// DTB parsing fails (invalid DTB address, host tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfo {
    pub uart_base: u64,
    pub gicd_base: u64,
    pub gicc_base: u64,
    pub gich_base: u64,
    pub gicv_base: u64,
    pub num_cpus: usize,
    pub ram_base: u64,
    pub ram_size: u64,
}

impl PlatformInfo {
    pub const fn qemu_virt() -> Self {
        Self {
            uart_base: platform::UART_BASE as u64,
            gicd_base: platform::GICD_BASE,
            gicc_base: platform::GICC_BASE,
            gich_base: platform::GICH_BASE,
            gicv_base: platform::GICV_BASE,
            num_cpus: platform::MAX_CORE,
            ram_base: platform::GUEST_RAM_BASE,
            ram_size: 0x4000_0000,
        }
    }
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self::qemu_virt()
    }
}

struct PlatformInfoCell {
    inner: UnsafeCell<PlatformInfo>,
    initialized: AtomicBool,
}

// Safety: Written once during single-threaded boot, read-only after.
unsafe impl Sync for PlatformInfoCell {}

static PLATFORM_INFO: PlatformInfoCell = PlatformInfoCell {
    inner: UnsafeCell::new(PlatformInfo::qemu_virt()),
    initialized: AtomicBool::new(false),
};

/// Initialize platform info from the host DTB. Called once by the boot core.
///
/// If the DTB address is invalid or parsing fails, the defaults are retained.
pub fn init(dtb_addr: usize) {
    if !validate_dtb_address(dtb_addr) {
        log::warn!(target: "dtb", "no valid DTB at {:#x}, using QEMU virt defaults", dtb_addr);
        return;
    }
    let fdt = match unsafe { fdt::Fdt::from_ptr(dtb_addr as *const u8) } {
        Ok(fdt) => fdt,
        Err(e) => {
            log::warn!(target: "dtb", "DTB parse failed: {:?}", e);
            return;
        }
    };
    let info = parse(&fdt);
    unsafe { *PLATFORM_INFO.inner.get() = info };
    PLATFORM_INFO.initialized.store(true, Ordering::Release);
}

/// Returns true if DTB was successfully parsed.
pub fn is_initialized() -> bool {
    PLATFORM_INFO.initialized.load(Ordering::Acquire)
}

/// Get platform info. Always available; returns defaults if DTB parsing failed.
pub fn platform_info() -> &'static PlatformInfo {
    unsafe { &*PLATFORM_INFO.inner.get() }
}

fn validate_dtb_address(addr: usize) -> bool {
    if addr == 0 || addr & 7 != 0 {
        return false;
    }
    // Check FDT magic (0xD00DFEED big-endian)
    let magic = unsafe { core::ptr::read_volatile(addr as *const u32) };
    u32::from_be(magic) == 0xD00D_FEED
}

/// Extract platform information from a parsed device tree.
///
/// GICv2 nodes carry `reg = <GICD GICC GICH GICV>`.
pub fn parse(fdt: &fdt::Fdt<'_>) -> PlatformInfo {
    let mut info = PlatformInfo::qemu_virt();

    if let Some(region) = fdt.memory().regions().next() {
        info.ram_base = region.starting_address as u64;
        if let Some(size) = region.size {
            info.ram_size = size as u64;
        }
    }

    if let Some(uart_node) = fdt.find_compatible(&["arm,pl011"]) {
        if let Some(reg) = uart_node.reg().and_then(|mut r| r.next()) {
            info.uart_base = reg.starting_address as u64;
        }
    }

    if let Some(gic_node) = fdt.find_compatible(&["arm,gic-400", "arm,cortex-a15-gic"]) {
        if let Some(mut regs) = gic_node.reg() {
            let bases = [
                &mut info.gicd_base,
                &mut info.gicc_base,
                &mut info.gich_base,
                &mut info.gicv_base,
            ];
            for base in bases {
                match regs.next() {
                    Some(reg) => *base = reg.starting_address as u64,
                    None => break,
                }
            }
        }
    }

    let cpu_count = fdt.cpus().count();
    if cpu_count > 0 {
        info.num_cpus = cpu_count.min(platform::MAX_CORE);
    }

    info
}
