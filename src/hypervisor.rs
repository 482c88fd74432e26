//! The hypervisor instance
//!
//! One [`Hypervisor`] owns every core component and the hardware it runs
//! on. Nothing in the crate reaches for globals: the firmware keeps the
//! instance in a static and the trap entry points pass it along, tests
//! build one over software models.

use crate::arch::defs::SPSR_EL1H_DAIF_MASKED;
use crate::arch::{CpuControl, ExceptionStackFrame, GenericTimer, Platform};
use crate::core_ctx::{CoreContext, CoreContexts};
use crate::debug::{
    DebugManager, HwBreakpointManager, ReloadContext, SwBreakpointManager, Watchpoint,
    WatchpointManager,
};
use crate::error::Result;
use crate::gdb::DebugTarget;
use crate::guest_memory::{GuestMemory, GuestMemoryView};
use crate::irq_manager::{BottomHalf, InterruptTask, IrqManager, SgiSender, ThermosphereSgi, HOST_PRIORITY};
use crate::vtimer;

pub struct Hypervisor<P: Platform> {
    cores: CoreContexts,
    irq: IrqManager<P::Gic, P::Cpu>,
    timer: P::Timer,
    debug_regs: P::DebugRegs,
    memory: P::Memory,
    monitor: P::Monitor,
    debug: DebugManager,
    hw_breakpoints: HwBreakpointManager,
    watchpoints: WatchpointManager,
    sw_breakpoints: SwBreakpointManager,
}

impl<P: Platform> Hypervisor<P> {
    pub const fn new(
        gic: P::Gic,
        timer: P::Timer,
        debug_regs: P::DebugRegs,
        memory: P::Memory,
        monitor: P::Monitor,
        cpu: P::Cpu,
    ) -> Self {
        Self {
            cores: CoreContexts::new(),
            irq: IrqManager::new(gic, cpu),
            timer,
            debug_regs,
            memory,
            monitor,
            debug: DebugManager::new(),
            hw_breakpoints: HwBreakpointManager::new(),
            watchpoints: WatchpointManager::new(),
            sw_breakpoints: SwBreakpointManager::new(),
        }
    }

    pub fn cores(&self) -> &CoreContexts {
        &self.cores
    }

    pub fn irq(&self) -> &IrqManager<P::Gic, P::Cpu> {
        &self.irq
    }

    pub fn timer(&self) -> &P::Timer {
        &self.timer
    }

    pub fn debug_regs(&self) -> &P::DebugRegs {
        &self.debug_regs
    }

    pub fn memory(&self) -> &P::Memory {
        &self.memory
    }

    pub fn debug_manager(&self) -> &DebugManager {
        &self.debug
    }

    pub fn monitor(&self) -> &P::Monitor {
        &self.monitor
    }

    pub fn cpu(&self) -> &P::Cpu {
        self.irq.cpu()
    }

    pub fn hw_breakpoints(&self) -> &HwBreakpointManager {
        &self.hw_breakpoints
    }

    pub fn watchpoints(&self) -> &WatchpointManager {
        &self.watchpoints
    }

    pub fn sw_breakpoints(&self) -> &SwBreakpointManager {
        &self.sw_breakpoints
    }

    pub fn active_core_mask(&self) -> u32 {
        self.cores.active_core_mask()
    }

    /// Bring `core_id` up. The boot core goes first, before any other core
    /// is released.
    pub fn init_core(&'static self, core_id: u32, is_boot_core: bool) {
        self.cores.mark_active(core_id, is_boot_core);
        let active = self.active_core_mask();
        self.irq.initialize(core_id, is_boot_core, active);

        if is_boot_core {
            self.hw_breakpoints.init(core_id, &self.debug_regs);
            self.watchpoints.init(core_id, &self.debug_regs);
        }
        // Late cores pick up whatever the debugger already set.
        self.hw_breakpoints.reload_on_this_core(&self.debug_regs);
        self.watchpoints.reload_on_this_core(&self.debug_regs);

        for sgi in [
            ThermosphereSgi::DebugPause,
            ThermosphereSgi::ReloadHwBreakpoints,
            ThermosphereSgi::ReloadWatchpoints,
        ] {
            self.irq.register(core_id, self, sgi.id(), false, HOST_PRIORITY);
        }
        log::info!("core {} up (active {:#x})", core_id, self.active_core_mask());
    }

    /// Stop points are propagated from `core_id` to every active core.
    pub fn reload_context(&self, core_id: u32) -> ReloadContext<'_, P::DebugRegs> {
        ReloadContext {
            regs: &self.debug_regs,
            core_id,
            active_core_mask: self.active_core_mask(),
            sgi: &self.irq,
        }
    }

    pub fn guest_memory(&self, core_id: u32) -> GuestMemoryView<'_, P::Memory, P::Gic, P::Cpu> {
        GuestMemoryView::new(&self.memory, &self.irq, core_id, self.active_core_mask())
    }

    /// Take one physical interrupt; the bottom half, if any, runs with
    /// interrupts unmasked.
    pub fn handle_irq(&self, core: &CoreContext) {
        let bottom_half = self
            .irq
            .handle_interrupt(core, self.active_core_mask(), &self.timer);
        if let Some(bottom_half) = bottom_half {
            self.run_bottom_half(bottom_half);
        }
    }

    fn run_bottom_half(&self, bottom_half: BottomHalf) {
        let cpu = self.irq.cpu();
        cpu.unmask_interrupts();
        bottom_half.run();
        cpu.mask_interrupts();
    }

    /// Register state for the first entry into the guest on `core_id`,
    /// from the boot parameters in its context.
    pub fn initial_guest_frame(&self, core_id: u32) -> ExceptionStackFrame {
        let core = self.cores.get(core_id);
        let mut frame = ExceptionStackFrame {
            elr_el2: core.kernel_entrypoint(),
            spsr_el2: SPSR_EL1H_DAIF_MASKED,
            cntpct_el0: self.timer.counter(),
            ..Default::default()
        };
        frame.x[0] = core.kernel_argument();
        frame
    }

    /// Last step before returning to the guest: park if the debugger wants
    /// this core, then hide the time spent in EL2.
    pub fn exit_to_guest(&self, core: &CoreContext, frame: &ExceptionStackFrame) {
        self.debug
            .handle_pause(core, self.irq.cpu(), &self.debug_regs, &self.irq);
        vtimer::exit_hypervisor(core, &self.timer, frame);
        core.clear_guest_frame();
    }
}

impl<P: Platform> InterruptTask for Hypervisor<P> {
    fn interrupt_top_half(&self, core_id: u32, irq_id: u32, _src_core: u32) -> Option<bool> {
        match ThermosphereSgi::from_id(irq_id)? {
            // Parking happens on the way back to the guest.
            ThermosphereSgi::DebugPause => Some(false),
            ThermosphereSgi::ReloadHwBreakpoints => {
                self.hw_breakpoints
                    .handle_reload_request(&self.debug_regs, core_id);
                Some(false)
            }
            ThermosphereSgi::ReloadWatchpoints => {
                self.watchpoints
                    .handle_reload_request(&self.debug_regs, core_id);
                Some(false)
            }
            ThermosphereSgi::VgicUpdate | ThermosphereSgi::ReportDebuggerBreak => None,
        }
    }
}

impl<P: Platform> DebugTarget for Hypervisor<P> {
    fn active_core_mask(&self) -> u32 {
        self.cores.active_core_mask()
    }

    fn core(&self, core_id: u32) -> &CoreContext {
        self.cores.get(core_id)
    }

    fn debug_manager(&self) -> &DebugManager {
        &self.debug
    }

    fn sgi(&self) -> &dyn SgiSender {
        &self.irq
    }

    fn read_memory(&self, core_id: u32, addr: u64, buf: &mut [u8]) -> usize {
        self.guest_memory(core_id).read(addr, buf)
    }

    fn write_memory(&self, core_id: u32, addr: u64, data: &[u8]) -> usize {
        self.guest_memory(core_id).write(addr, data)
    }

    fn add_sw_breakpoint(&self, core_id: u32, addr: u64, persistent: bool) -> Result<()> {
        self.sw_breakpoints
            .add(&self.guest_memory(core_id), addr, persistent)
            .map(|_| ())
    }

    fn remove_sw_breakpoint(&self, core_id: u32, addr: u64) -> Result<()> {
        self.sw_breakpoints
            .remove(&self.guest_memory(core_id), addr, false)
    }

    fn add_hw_breakpoint(&self, core_id: u32, addr: u64) -> Result<()> {
        self.hw_breakpoints.add(addr, &self.reload_context(core_id))
    }

    fn remove_hw_breakpoint(&self, core_id: u32, addr: u64) -> Result<()> {
        self.hw_breakpoints.remove(addr, &self.reload_context(core_id))
    }

    fn add_watchpoint(&self, core_id: u32, wp: Watchpoint) -> Result<()> {
        self.watchpoints.add(wp, &self.reload_context(core_id))
    }

    fn remove_watchpoint(&self, core_id: u32, wp: Watchpoint) -> Result<()> {
        self.watchpoints.remove(wp, &self.reload_context(core_id))
    }

    fn remove_all_stop_points(&self, core_id: u32) {
        let rc = self.reload_context(core_id);
        self.watchpoints.remove_all(&rc);
        self.hw_breakpoints.remove_all(&rc);
        if let Err(e) = self
            .sw_breakpoints
            .remove_all(&self.guest_memory(core_id), true)
        {
            log::warn!("debug: could not restore every software breakpoint: {}", e);
        }
    }
}
