//! Hardware instruction breakpoints

use super::hw_stop_point::{DebugRegisterPair, HwStopPointManager, ReloadContext, StopPointKind};
use crate::arch::DebugRegisterFile;
use crate::error::{Errno, Result};
use crate::irq_manager::ThermosphereSgi;

/// DBGBCR: BAS = 0b1111, match any A64 instruction at the address
const DBGBCR_BAS_A64: u64 = 0xF << 5;

pub struct BreakpointKind;

impl StopPointKind for BreakpointKind {
    const NAME: &'static str = "breakpoint";
    const RELOAD_SGI: ThermosphereSgi = ThermosphereSgi::ReloadHwBreakpoints;

    fn num_comparators(dfr0: u64) -> usize {
        (((dfr0 >> 12) & 0xF) + 1) as usize
    }

    fn load<D: DebugRegisterFile>(regs: &D, index: usize, pair: &DebugRegisterPair) {
        regs.set_breakpoint(index, pair.control, pair.value);
    }
}

pub type HwBreakpointManager = HwStopPointManager<BreakpointKind>;

fn breakpoint_pair(addr: u64) -> DebugRegisterPair {
    DebugRegisterPair {
        control: DebugRegisterPair::ENABLE | DebugRegisterPair::PRIVILEGE_EL1_EL0 | DBGBCR_BAS_A64,
        value: addr,
    }
}

impl HwStopPointManager<BreakpointKind> {
    pub fn add<D: DebugRegisterFile>(&self, addr: u64, rc: &ReloadContext<'_, D>) -> Result<()> {
        if addr & 3 != 0 {
            return Err(Errno::Inval);
        }
        let pair = breakpoint_pair(addr);
        self.modify(rc, |table| {
            if table.find(&pair).is_some() {
                return Err(Errno::Exist);
            }
            let index = table.allocate().ok_or(Errno::Busy)?;
            table.pairs[index] = pair;
            log::debug!("debug: hw breakpoint {} at {:#x}", index, addr);
            Ok(())
        })
    }

    pub fn remove<D: DebugRegisterFile>(&self, addr: u64, rc: &ReloadContext<'_, D>) -> Result<()> {
        if addr & 3 != 0 {
            return Err(Errno::Inval);
        }
        let pair = breakpoint_pair(addr);
        self.modify(rc, |table| {
            let index = table.find(&pair).ok_or(Errno::NoEnt)?;
            table.free(index);
            Ok(())
        })
    }

    pub fn contains(&self, core_id: u32, addr: u64) -> bool {
        let pair = breakpoint_pair(addr);
        self.with_table(core_id, |table| table.find(&pair).is_some())
    }
}
