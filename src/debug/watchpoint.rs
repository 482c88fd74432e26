//! Hardware watchpoints
//!
//! A watchpoint either selects bytes within one aligned doubleword (BAS)
//! or covers a naturally aligned power-of-two region of at least 16 bytes
//! (MASK).

use super::hw_stop_point::{DebugRegisterPair, HwStopPointManager, ReloadContext, StopPointKind};
use crate::arch::DebugRegisterFile;
use crate::error::{Errno, Result};
use crate::irq_manager::ThermosphereSgi;

const DBGWCR_LSC_SHIFT: u64 = 3;
const DBGWCR_BAS_SHIFT: u64 = 5;
const DBGWCR_MASK_SHIFT: u64 = 24;
/// BAS selecting the whole doubleword, required with MASK.
const DBGWCR_BAS_ALL: u64 = 0xFF;

/// Accesses that trigger a watchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointDirection {
    Load = 1,
    Store = 2,
    LoadStore = 3,
}

impl WatchpointDirection {
    fn from_lsc(lsc: u64) -> Option<Self> {
        match lsc {
            1 => Some(Self::Load),
            2 => Some(Self::Store),
            3 => Some(Self::LoadStore),
            _ => None,
        }
    }
}

/// A watchpoint as the debugger requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchpoint {
    pub addr: u64,
    pub size: u64,
    pub direction: WatchpointDirection,
}

pub struct WatchpointKind;

impl StopPointKind for WatchpointKind {
    const NAME: &'static str = "watchpoint";
    const RELOAD_SGI: ThermosphereSgi = ThermosphereSgi::ReloadWatchpoints;

    fn num_comparators(dfr0: u64) -> usize {
        (((dfr0 >> 20) & 0xF) + 1) as usize
    }

    fn load<D: DebugRegisterFile>(regs: &D, index: usize, pair: &DebugRegisterPair) {
        regs.set_watchpoint(index, pair.control, pair.value);
    }
}

pub type WatchpointManager = HwStopPointManager<WatchpointKind>;

/// Power-of-two region of at least 16 bytes, aligned to its size.
pub fn is_range_mask_watchpoint(addr: u64, size: u64) -> bool {
    size >= 16 && size.is_power_of_two() && addr & (size - 1) == 0
}

/// Whether `(addr, size)` can be expressed by one watchpoint comparator.
pub fn check_watchpoint_address_and_size_params(addr: u64, size: u64) -> bool {
    match size {
        0 => false,
        1..=8 => match addr.checked_add(size - 1) {
            Some(last) => last & !7 == addr & !7,
            None => false,
        },
        _ => is_range_mask_watchpoint(addr, size),
    }
}

fn encode(wp: &Watchpoint) -> DebugRegisterPair {
    let common = DebugRegisterPair::ENABLE
        | DebugRegisterPair::PRIVILEGE_EL1_EL0
        | (wp.direction as u64) << DBGWCR_LSC_SHIFT;
    if is_range_mask_watchpoint(wp.addr, wp.size) {
        let mask = u64::from(wp.size.trailing_zeros());
        DebugRegisterPair {
            control: common | DBGWCR_BAS_ALL << DBGWCR_BAS_SHIFT | mask << DBGWCR_MASK_SHIFT,
            value: wp.addr,
        }
    } else {
        let bas = ((1u64 << wp.size) - 1) << (wp.addr & 7);
        DebugRegisterPair {
            control: common | bas << DBGWCR_BAS_SHIFT,
            value: wp.addr & !7,
        }
    }
}

fn decode(pair: &DebugRegisterPair) -> Option<Watchpoint> {
    let direction = WatchpointDirection::from_lsc((pair.control >> DBGWCR_LSC_SHIFT) & 3)?;
    let bas = (pair.control >> DBGWCR_BAS_SHIFT) & 0xFF;
    let mask = (pair.control >> DBGWCR_MASK_SHIFT) & 0x1F;
    let (addr, size) = if mask != 0 {
        (pair.value, 1u64 << mask)
    } else {
        (pair.value + u64::from(bas.trailing_zeros()), u64::from(bas.count_ones()))
    };
    Some(Watchpoint {
        addr,
        size,
        direction,
    })
}

impl HwStopPointManager<WatchpointKind> {
    pub fn add<D: DebugRegisterFile>(&self, wp: Watchpoint, rc: &ReloadContext<'_, D>) -> Result<()> {
        if !check_watchpoint_address_and_size_params(wp.addr, wp.size) {
            return Err(Errno::Inval);
        }
        let pair = encode(&wp);
        self.modify(rc, |table| {
            if table.find(&pair).is_some() {
                return Err(Errno::Exist);
            }
            let index = table.allocate().ok_or(Errno::Busy)?;
            table.pairs[index] = pair;
            log::debug!("debug: watchpoint {} {:?}", index, wp);
            Ok(())
        })
    }

    pub fn remove<D: DebugRegisterFile>(&self, wp: Watchpoint, rc: &ReloadContext<'_, D>) -> Result<()> {
        if !check_watchpoint_address_and_size_params(wp.addr, wp.size) {
            return Err(Errno::Inval);
        }
        let pair = encode(&wp);
        self.modify(rc, |table| {
            let index = table.find(&pair).ok_or(Errno::NoEnt)?;
            table.free(index);
            Ok(())
        })
    }

    /// The watchpoint whose granule contains the faulting address.
    pub fn find_matching(&self, core_id: u32, far: u64) -> Option<Watchpoint> {
        self.with_table(core_id, |table| {
            table.iter_used().find_map(|(_, pair)| {
                let wp = decode(pair)?;
                let granule = if is_range_mask_watchpoint(wp.addr, wp.size) {
                    wp.size
                } else {
                    8
                };
                (far & !(granule - 1) == pair.value).then_some(wp)
            })
        })
    }
}
