//! Guest address translation with the AT instructions, and physical copies.
//!
//! EL2 runs with its MMU off, so physical addresses are used directly.

use core::arch::asm;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{GuestPageAccess, PageTranslation};
use crate::platform::PAGE_SIZE;

const PAR_FAULT: u64 = 1 << 0;
const PAR_PA_MASK: u64 = 0x0000_FFFF_FFFF_F000;
const PAR_ATTR_SHIFT: u32 = 56;
const CACHE_LINE: u64 = 64;

extern "C" {
    /// Byte copies in `entry.S`; a synchronous abort on the device side
    /// ends the copy early. Both return the number of bytes copied.
    fn device_copy_from(dst: *mut u8, src: *const u8, len: usize) -> usize;
    fn device_copy_to(dst: *mut u8, src: *const u8, len: usize) -> usize;
}

pub struct Stage12Translator {
    gicd_base: AtomicU64,
}

impl Stage12Translator {
    pub const fn new(gicd_base: u64) -> Self {
        Self {
            gicd_base: AtomicU64::new(gicd_base),
        }
    }

    pub fn set_gicd_base(&self, base: u64) {
        self.gicd_base.store(base, Ordering::Relaxed);
    }

    fn stage1(va: u64) -> u64 {
        let par: u64;
        unsafe {
            asm!(
                "at s1e1r, {va}",
                "isb",
                "mrs {par}, par_el1",
                va = in(reg) va,
                par = out(reg) par,
                options(nostack),
            );
        }
        par
    }

    fn stage12(va: u64) -> u64 {
        let par: u64;
        unsafe {
            asm!(
                "at s12e1r, {va}",
                "isb",
                "mrs {par}, par_el1",
                va = in(reg) va,
                par = out(reg) par,
                options(nostack),
            );
        }
        par
    }
}

impl GuestPageAccess for Stage12Translator {
    fn translate(&self, va: u64) -> PageTranslation {
        let offset = va & (PAGE_SIZE - 1);
        let par = Self::stage1(va);
        if par & PAR_FAULT != 0 {
            return PageTranslation::Fault;
        }
        // The distributor has no stage-2 mapping: recognize its IPA first.
        let ipa = (par & PAR_PA_MASK) | offset;
        let gicd_base = self.gicd_base.load(Ordering::Relaxed);
        if (gicd_base..gicd_base + PAGE_SIZE).contains(&ipa) {
            return PageTranslation::Gicd {
                offset: (ipa - gicd_base) as u32,
            };
        }

        let par = Self::stage12(va);
        if par & PAR_FAULT != 0 {
            return PageTranslation::Fault;
        }
        // Device-nGnRnE..Device-GRE have a zero outer attribute nibble.
        let attr = (par >> PAR_ATTR_SHIFT) as u8;
        PageTranslation::Mapped {
            pa: (par & PAR_PA_MASK) | offset,
            device: attr & 0xF0 == 0,
        }
    }

    fn read_normal(&self, pa: u64, buf: &mut [u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(pa as *const u8, buf.as_mut_ptr(), buf.len());
        }
    }

    fn write_normal(&self, pa: u64, data: &[u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), pa as *mut u8, data.len());
        }

        // The guest may be patching code or page tables.
        let end = pa + data.len() as u64;
        let mut line = pa & !(CACHE_LINE - 1);
        while line < end {
            unsafe { asm!("dc civac, {}", in(reg) line, options(nostack)) };
            line += CACHE_LINE;
        }
        unsafe {
            asm!(
                "dsb ish",
                "ic ialluis",
                "tlbi vmalle1is",
                "dsb ish",
                "isb",
                options(nostack),
            );
        }
    }

    fn read_device(&self, pa: u64, buf: &mut [u8]) -> usize {
        unsafe { device_copy_from(buf.as_mut_ptr(), pa as *const u8, buf.len()) }
    }

    fn write_device(&self, pa: u64, data: &[u8]) -> usize {
        unsafe { device_copy_to(pa as *mut u8, data.as_ptr(), data.len()) }
    }
}
