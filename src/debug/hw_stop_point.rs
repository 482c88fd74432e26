//! Shared machinery for hardware breakpoints and watchpoints
//!
//! The comparators are per-core registers but one logical configuration:
//! a stop point must trap on whichever core runs the code. Every change is
//! therefore published, loaded locally, and then loaded by every other
//! active core before the caller continues.
//!
//! Only one core may modify stop points at a time (the debugger); cores
//! servicing a reload request never take the table lock.

use core::cell::RefCell;
use core::marker::PhantomData;
use core::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use crate::arch::DebugRegisterFile;
use crate::irq_manager::{SgiSender, ThermosphereSgi};
use crate::sync::{Barrier, RecursiveSpinLock};

pub const MAX_STOP_POINTS: usize = 16;

/// One comparator: control register and address value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugRegisterPair {
    pub control: u64,
    pub value: u64,
}

impl DebugRegisterPair {
    pub const ENABLE: u64 = 1 << 0;
    /// PMC/PAC = 0b11: match at EL1 and EL0
    pub const PRIVILEGE_EL1_EL0: u64 = 0b11 << 1;

    pub fn is_enabled(&self) -> bool {
        self.control & Self::ENABLE != 0
    }
}

/// Breakpoints or watchpoints.
pub trait StopPointKind: Sync {
    const NAME: &'static str;
    const RELOAD_SGI: ThermosphereSgi;
    /// Number of comparators, from ID_AA64DFR0_EL1.
    fn num_comparators(dfr0: u64) -> usize;
    fn load<D: DebugRegisterFile>(regs: &D, index: usize, pair: &DebugRegisterPair);
}

/// Registers and signalling needed to propagate a change.
pub struct ReloadContext<'a, D> {
    pub regs: &'a D,
    pub core_id: u32,
    pub active_core_mask: u32,
    pub sgi: &'a dyn SgiSender,
}

pub struct StopPointTable {
    pub(super) pairs: [DebugRegisterPair; MAX_STOP_POINTS],
    used: u16,
    max: usize,
}

impl StopPointTable {
    const fn new() -> Self {
        Self {
            pairs: [DebugRegisterPair {
                control: 0,
                value: 0,
            }; MAX_STOP_POINTS],
            used: 0,
            max: 0,
        }
    }

    pub(super) fn allocate(&mut self) -> Option<usize> {
        let free = !self.used & self.capacity_mask();
        if free == 0 {
            return None;
        }
        let index = free.trailing_zeros() as usize;
        self.used |= 1 << index;
        Some(index)
    }

    pub(super) fn free(&mut self, index: usize) {
        self.used &= !(1 << index);
        self.pairs[index] = DebugRegisterPair::default();
    }

    /// Used comparators and their contents.
    pub(super) fn iter_used(&self) -> impl Iterator<Item = (usize, &DebugRegisterPair)> {
        self.pairs
            .iter()
            .enumerate()
            .filter(move |(i, _)| self.used & (1 << i) != 0)
    }

    pub(super) fn find(&self, pair: &DebugRegisterPair) -> Option<usize> {
        self.iter_used().find(|(_, p)| *p == pair).map(|(i, _)| i)
    }

    fn capacity_mask(&self) -> u16 {
        if self.max >= 16 {
            u16::MAX
        } else {
            (1 << self.max) - 1
        }
    }

    fn clear(&mut self) {
        self.used = 0;
        self.pairs = [DebugRegisterPair::default(); MAX_STOP_POINTS];
    }
}

struct PublishedPair {
    control: AtomicU64,
    value: AtomicU64,
}

impl PublishedPair {
    const fn new() -> Self {
        Self {
            control: AtomicU64::new(0),
            value: AtomicU64::new(0),
        }
    }
}

pub struct HwStopPointManager<K> {
    table: RecursiveSpinLock<RefCell<StopPointTable>>,
    published: [PublishedPair; MAX_STOP_POINTS],
    num_comparators: AtomicUsize,
    reload_barrier: Barrier,
    _kind: PhantomData<K>,
}

impl<K: StopPointKind> HwStopPointManager<K> {
    pub const fn new() -> Self {
        Self {
            table: RecursiveSpinLock::new(RefCell::new(StopPointTable::new())),
            published: [const { PublishedPair::new() }; MAX_STOP_POINTS],
            num_comparators: AtomicUsize::new(0),
            reload_barrier: Barrier::new(),
            _kind: PhantomData,
        }
    }

    /// Size the pool from the hardware. Boot core, before any stop point exists.
    pub fn init<D: DebugRegisterFile>(&self, core_id: u32, regs: &D) {
        let max = K::num_comparators(regs.debug_feature_register()).min(MAX_STOP_POINTS);
        let guard = self.table.lock(core_id);
        let mut table = guard.borrow_mut();
        table.clear();
        table.max = max;
        self.num_comparators.store(max, Ordering::Relaxed);
        log::info!("debug: {} {}s", max, K::NAME);
    }

    pub fn num_comparators(&self) -> usize {
        self.num_comparators.load(Ordering::Relaxed)
    }

    /// Number of comparators currently in use.
    pub fn count(&self, core_id: u32) -> usize {
        self.table.lock(core_id).borrow().iter_used().count()
    }

    /// Run `f` on the table under the lock and, if it changed anything,
    /// propagate the new configuration to every active core.
    pub(super) fn modify<D, R>(
        &self,
        rc: &ReloadContext<'_, D>,
        f: impl FnOnce(&mut StopPointTable) -> crate::error::Result<R>,
    ) -> crate::error::Result<R>
    where
        D: DebugRegisterFile,
    {
        let guard = self.table.lock(rc.core_id);
        let result = f(&mut guard.borrow_mut())?;
        self.publish(&guard.borrow());
        self.reload_on_all_cores(rc);
        Ok(result)
    }

    pub(super) fn with_table<R>(&self, core_id: u32, f: impl FnOnce(&StopPointTable) -> R) -> R {
        let guard = self.table.lock(core_id);
        let table = guard.borrow();
        f(&table)
    }

    /// Disable every stop point on every core.
    pub fn remove_all<D: DebugRegisterFile>(&self, rc: &ReloadContext<'_, D>) {
        // Infallible closure.
        let _ = self.modify(rc, |table| {
            table.clear();
            Ok(())
        });
    }

    fn publish(&self, table: &StopPointTable) {
        for (slot, pair) in self.published.iter().zip(table.pairs.iter()) {
            slot.control.store(pair.control, Ordering::Relaxed);
            slot.value.store(pair.value, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }

    /// Load the published configuration into this core's comparators.
    pub fn reload_on_this_core<D: DebugRegisterFile>(&self, regs: &D) {
        let n = self.num_comparators();
        for (i, slot) in self.published.iter().take(n).enumerate() {
            let pair = DebugRegisterPair {
                control: slot.control.load(Ordering::Relaxed),
                value: slot.value.load(Ordering::Relaxed),
            };
            K::load(regs, i, &pair);
        }
    }

    fn reload_on_all_cores<D: DebugRegisterFile>(&self, rc: &ReloadContext<'_, D>) {
        self.reload_on_this_core(rc.regs);

        let self_bit = 1 << rc.core_id;
        let others = rc.active_core_mask & !self_bit;
        self.reload_barrier.reset(rc.active_core_mask | self_bit);
        if others != 0 {
            rc.sgi.send_sgi_to_list(K::RELOAD_SGI, others);
        }
        self.reload_barrier.join(rc.core_id);
    }

    /// Service a reload request from another core.
    pub fn handle_reload_request<D: DebugRegisterFile>(&self, regs: &D, core_id: u32) {
        fence(Ordering::SeqCst);
        self.reload_on_this_core(regs);
        self.reload_barrier.join(core_id);
    }
}

impl<K: StopPointKind> Default for HwStopPointManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_respects_capacity() {
        let mut table = StopPointTable::new();
        table.max = 2;
        assert_eq!(table.allocate(), Some(0));
        assert_eq!(table.allocate(), Some(1));
        assert_eq!(table.allocate(), None);
        table.free(0);
        assert_eq!(table.allocate(), Some(0));
    }

    #[test]
    fn test_find_matches_whole_pair() {
        let mut table = StopPointTable::new();
        table.max = 4;
        let i = table.allocate().unwrap();
        table.pairs[i] = DebugRegisterPair {
            control: 0x1E7,
            value: 0x8000,
        };
        assert_eq!(table.find(&table.pairs[i].clone()), Some(i));
        let other = DebugRegisterPair {
            control: 0x1E7,
            value: 0x8004,
        };
        assert_eq!(table.find(&other), None);
    }
}
