//! Debugger access to guest memory
//!
//! Addresses are guest virtual addresses, translated one page at a time
//! through stage 1 and stage 2. Transfers stop at the first page that does
//! not translate or at the first device access that faults; callers get
//! the number of bytes actually transferred.

use crate::arch::gicv2::GICD_SGIR;
use crate::arch::{CpuControl, GuestPageAccess, InterruptController, PageTranslation, VirtualInterfaceController};
use crate::irq_manager::IrqManager;
use crate::platform::PAGE_SIZE;
use crate::vgic::validate_gicd_register_access;

/// Byte-level access to the guest address space.
pub trait GuestMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> usize;
    fn write(&self, addr: u64, data: &[u8]) -> usize;

    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut bytes = [0u8; 4];
        (self.read(addr, &mut bytes) == bytes.len()).then(|| u32::from_le_bytes(bytes))
    }

    fn write_u32(&self, addr: u64, value: u32) -> bool {
        let bytes = value.to_le_bytes();
        self.write(addr, &bytes) == bytes.len()
    }
}

enum Transfer<'b> {
    Read(&'b mut [u8]),
    Write(&'b [u8]),
}

impl Transfer<'_> {
    fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(data) => data.len(),
        }
    }
}

/// Guest memory as seen from one core.
pub struct GuestMemoryView<'a, M, G, C> {
    pages: &'a M,
    irq: &'a IrqManager<G, C>,
    core_id: u32,
    active_core_mask: u32,
}

impl<'a, M, G, C> GuestMemoryView<'a, M, G, C>
where
    M: GuestPageAccess,
    G: InterruptController + VirtualInterfaceController,
    C: CpuControl,
{
    pub fn new(pages: &'a M, irq: &'a IrqManager<G, C>, core_id: u32, active_core_mask: u32) -> Self {
        Self {
            pages,
            irq,
            core_id,
            active_core_mask,
        }
    }

    fn transfer(&self, addr: u64, mut xfer: Transfer<'_>) -> usize {
        let total = xfer.len();
        let mut done = 0;

        while done < total {
            let va = addr.wrapping_add(done as u64);
            let page_left = (PAGE_SIZE - (va & (PAGE_SIZE - 1))) as usize;
            let chunk = page_left.min(total - done);
            let range = done..done + chunk;

            let n = match self.pages.translate(va) {
                PageTranslation::Fault => 0,
                PageTranslation::Mapped { pa, device: false } => {
                    match &mut xfer {
                        Transfer::Read(buf) => self.pages.read_normal(pa, &mut buf[range]),
                        Transfer::Write(data) => self.pages.write_normal(pa, &data[range]),
                    }
                    chunk
                }
                PageTranslation::Mapped { pa, device: true } => match &mut xfer {
                    Transfer::Read(buf) => self.pages.read_device(pa, &mut buf[range]),
                    Transfer::Write(data) => self.pages.write_device(pa, &data[range]),
                },
                PageTranslation::Gicd { offset } => match &mut xfer {
                    Transfer::Read(buf) => self.read_gicd(offset, &mut buf[range]),
                    Transfer::Write(data) => self.write_gicd(offset, &data[range]),
                },
            };

            done += n;
            if n < chunk {
                break;
            }
        }
        done
    }

    /// Size of the next distributor access at `offset` with `left` bytes
    /// remaining: a word when aligned, else a byte where bytes are allowed.
    fn gicd_access_size(offset: u32, left: usize) -> Option<u8> {
        if offset & 3 == 0 && left >= 4 {
            Some(4)
        } else if validate_gicd_register_access(offset, 1) {
            Some(1)
        } else {
            None
        }
    }

    fn read_gicd(&self, offset: u32, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            let off = offset + n as u32;
            let Some(size) = Self::gicd_access_size(off, buf.len() - n) else {
                break;
            };
            // Reading SGIR has no side effects but is reported as a guest error.
            let value = if off == GICD_SGIR {
                0
            } else {
                self.irq
                    .read_gicd(self.core_id, self.active_core_mask, off, size)
            };
            let size = usize::from(size);
            buf[n..n + size].copy_from_slice(&value.to_le_bytes()[..size]);
            n += size;
        }
        n
    }

    fn write_gicd(&self, offset: u32, data: &[u8]) -> usize {
        let mut n = 0;
        while n < data.len() {
            let off = offset + n as u32;
            let Some(size) = Self::gicd_access_size(off, data.len() - n) else {
                break;
            };
            let size = usize::from(size);
            let mut word = [0u8; 4];
            word[..size].copy_from_slice(&data[n..n + size]);
            self.irq.write_gicd(
                self.core_id,
                self.active_core_mask,
                off,
                size as u8,
                u32::from_le_bytes(word),
            );
            n += size;
        }
        n
    }
}

impl<M, G, C> GuestMemory for GuestMemoryView<'_, M, G, C>
where
    M: GuestPageAccess,
    G: InterruptController + VirtualInterfaceController,
    C: CpuControl,
{
    fn read(&self, addr: u64, buf: &mut [u8]) -> usize {
        self.transfer(addr, Transfer::Read(buf))
    }

    fn write(&self, addr: u64, data: &[u8]) -> usize {
        self.transfer(addr, Transfer::Write(data))
    }
}
