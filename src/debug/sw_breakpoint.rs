//! Software breakpoints
//!
//! A software breakpoint replaces the guest instruction with `BRK #uid`.
//! Entries are kept sorted by address in a fixed table.
//!
//! Addresses are guest virtual addresses: if the guest remaps the page
//! afterwards, the patch stays wherever it was written.

use crate::arch::defs::BRK_INSN_BASE;
use crate::error::{Errno, Result};
use crate::guest_memory::GuestMemory;
use crate::sync::SpinLock;

pub const MAX_SW_BREAKPOINTS: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct SwBreakpoint {
    address: u64,
    saved_insn: u32,
    uid: u16,
    persistent: bool,
    applied: bool,
}

impl SwBreakpoint {
    fn brk_insn(&self) -> u32 {
        BRK_INSN_BASE | u32::from(self.uid) << 5
    }
}

struct SwBreakpointTable {
    entries: [SwBreakpoint; MAX_SW_BREAKPOINTS],
    count: usize,
    next_uid: u16,
}

impl SwBreakpointTable {
    /// Index of the first entry at or above `addr`.
    fn find_closest(&self, addr: u64) -> usize {
        self.entries[..self.count].partition_point(|bp| bp.address < addr)
    }

    fn find(&self, addr: u64) -> Option<usize> {
        let pos = self.find_closest(addr);
        (pos < self.count && self.entries[pos].address == addr).then_some(pos)
    }

    fn alloc_uid(&mut self) -> u16 {
        let uid = self.next_uid;
        // imm16 of BRK; 0 is left for the guest's own BRK #0.
        self.next_uid = self.next_uid.checked_add(1).unwrap_or(1);
        uid
    }

    fn insert(&mut self, pos: usize, bp: SwBreakpoint) {
        self.entries.copy_within(pos..self.count, pos + 1);
        self.entries[pos] = bp;
        self.count += 1;
    }

    fn erase(&mut self, pos: usize) {
        self.entries.copy_within(pos + 1..self.count, pos);
        self.count -= 1;
        self.entries[self.count] = SwBreakpoint::default();
    }
}

pub struct SwBreakpointManager {
    table: SpinLock<SwBreakpointTable>,
}

fn apply<M: GuestMemory + ?Sized>(mem: &M, bp: &mut SwBreakpoint) -> Result<()> {
    let saved = mem.read_u32(bp.address).ok_or(Errno::Fault)?;
    if !mem.write_u32(bp.address, bp.brk_insn()) {
        // A partial write must not leave half an instruction behind.
        mem.write_u32(bp.address, saved);
        return Err(Errno::Fault);
    }
    bp.saved_insn = saved;
    bp.applied = true;
    Ok(())
}

fn revert<M: GuestMemory + ?Sized>(mem: &M, bp: &mut SwBreakpoint) -> Result<()> {
    if !bp.applied {
        return Ok(());
    }
    if !mem.write_u32(bp.address, bp.saved_insn) {
        return Err(Errno::Fault);
    }
    bp.applied = false;
    Ok(())
}

impl SwBreakpointManager {
    pub const fn new() -> Self {
        Self {
            table: SpinLock::new(SwBreakpointTable {
                entries: [SwBreakpoint {
                    address: 0,
                    saved_insn: 0,
                    uid: 0,
                    persistent: false,
                    applied: false,
                }; MAX_SW_BREAKPOINTS],
                count: 0,
                next_uid: 1,
            }),
        }
    }

    /// Patch a breakpoint at `addr`; returns the uid encoded in the trap.
    /// Nothing is recorded when the guest memory cannot be patched.
    pub fn add<M: GuestMemory + ?Sized>(&self, mem: &M, addr: u64, persistent: bool) -> Result<u16> {
        if addr & 3 != 0 {
            return Err(Errno::Inval);
        }
        let mut table = self.table.lock();
        if table.count == MAX_SW_BREAKPOINTS {
            return Err(Errno::Busy);
        }
        let pos = table.find_closest(addr);
        if pos < table.count && table.entries[pos].address == addr {
            return Err(Errno::Exist);
        }

        let mut bp = SwBreakpoint {
            address: addr,
            persistent,
            ..Default::default()
        };
        bp.uid = table.alloc_uid();
        apply(mem, &mut bp)?;
        table.insert(pos, bp);
        log::debug!("debug: sw breakpoint {} at {:#x}", bp.uid, addr);
        Ok(bp.uid)
    }

    /// Restore the original instruction and forget the breakpoint. With
    /// `keep_persistent`, persistent breakpoints stay patched and recorded.
    pub fn remove<M: GuestMemory + ?Sized>(&self, mem: &M, addr: u64, keep_persistent: bool) -> Result<()> {
        if addr & 3 != 0 {
            return Err(Errno::Inval);
        }
        let mut table = self.table.lock();
        let pos = table.find(addr).ok_or(Errno::NoEnt)?;
        if keep_persistent && table.entries[pos].persistent {
            return Ok(());
        }
        let result = revert(mem, &mut table.entries[pos]);
        table.erase(pos);
        result
    }

    /// [`Self::remove`] applied to every breakpoint. Returns the first error.
    pub fn remove_all<M: GuestMemory + ?Sized>(&self, mem: &M, keep_persistent: bool) -> Result<()> {
        let mut table = self.table.lock();
        let mut result = Ok(());
        let mut pos = 0;
        while pos < table.count {
            if keep_persistent && table.entries[pos].persistent {
                pos += 1;
                continue;
            }
            let r = revert(mem, &mut table.entries[pos]);
            if result.is_ok() {
                result = r;
            }
            table.erase(pos);
        }
        result
    }

    /// Address of the breakpoint that trapped with `BRK #uid`.
    pub fn find_by_uid(&self, uid: u16) -> Option<u64> {
        let table = self.table.lock();
        table.entries[..table.count]
            .iter()
            .find(|bp| bp.uid == uid)
            .map(|bp| bp.address)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.table.lock().find(addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.table.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted addresses, for diagnostics.
    pub fn addresses(&self, out: &mut [u64]) -> usize {
        let table = self.table.lock();
        let n = table.count.min(out.len());
        for (dst, bp) in out.iter_mut().zip(table.entries[..n].iter()) {
            *dst = bp.address;
        }
        n
    }
}

impl Default for SwBreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}
