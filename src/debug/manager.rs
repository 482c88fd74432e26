//! Debug event sink
//!
//! Traps that the debugger cares about end up here. Reporting an event
//! stops the whole guest: every active core is asked to park, and the
//! reporting core signals itself so the gdb layer picks the event up once
//! the core is parked.

use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use super::watchpoint::WatchpointDirection;
use crate::arch::{CpuControl, DebugRegisterFile};
use crate::core_ctx::CoreContext;
use crate::irq_manager::{SgiSender, ThermosphereSgi};
use crate::platform::MAX_CORE;
use crate::sync::{send_event, SpinLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEventKind {
    /// Stopped on the debugger's request (Ctrl-C, attach).
    DebuggerBreak,
    SwBreakpoint { uid: u16, addr: u64 },
    HwBreakpoint { addr: u64 },
    Watchpoint { addr: u64, direction: WatchpointDirection },
    SingleStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEventInfo {
    pub kind: DebugEventKind,
    pub core_id: u32,
    /// Already sent to the debugger.
    pub handled: bool,
}

pub struct DebugManager {
    reporting_enabled: AtomicBool,
    paused_cores: AtomicU32,
    single_step_cores: AtomicU32,
    events: [SpinLock<Option<DebugEventInfo>>; MAX_CORE],
}

impl DebugManager {
    pub const fn new() -> Self {
        Self {
            reporting_enabled: AtomicBool::new(false),
            paused_cores: AtomicU32::new(0),
            single_step_cores: AtomicU32::new(0),
            events: [const { SpinLock::new(None) }; MAX_CORE],
        }
    }

    pub fn set_reporting_enabled(&self, enabled: bool) {
        self.reporting_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_reporting_enabled(&self) -> bool {
        self.reporting_enabled.load(Ordering::SeqCst)
    }

    pub fn paused_cores(&self) -> u32 {
        self.paused_cores.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self, core_id: u32) -> bool {
        self.paused_cores() & (1 << core_id) != 0
    }

    pub fn single_step_cores(&self) -> u32 {
        self.single_step_cores.load(Ordering::SeqCst)
    }

    /// Record an event for `core_id` and stop the guest.
    /// Returns false if no debugger is listening.
    pub fn report_event(
        &self,
        core_id: u32,
        active_core_mask: u32,
        kind: DebugEventKind,
        sgi: &dyn SgiSender,
    ) -> bool {
        if !self.is_reporting_enabled() {
            return false;
        }

        *self.events[core_id as usize].lock() = Some(DebugEventInfo {
            kind,
            core_id,
            handled: false,
        });
        log::debug!("debug: core {} event {:?}", core_id, kind);

        self.pause_cores(active_core_mask | 1 << core_id, core_id, sgi);
        sgi.send_sgi_to_list(ThermosphereSgi::ReportDebuggerBreak, 1 << core_id);
        true
    }

    /// Ask every core in `core_mask` to park. The calling core parks on its
    /// way back to the guest; the others are interrupted.
    pub fn pause_cores(&self, core_mask: u32, core_id: u32, sgi: &dyn SgiSender) {
        self.paused_cores.fetch_or(core_mask, Ordering::SeqCst);
        let others = core_mask & !(1 << core_id);
        if others != 0 {
            sgi.send_sgi_to_list(ThermosphereSgi::DebugPause, others);
        }
    }

    /// Debugger break: pause `core_mask` and give every core that has no
    /// event yet a [`DebugEventKind::DebuggerBreak`]. The stop is reported
    /// through the calling core once it has parked.
    pub fn break_cores(&self, core_mask: u32, core_id: u32, sgi: &dyn SgiSender) {
        self.record_debugger_break(core_mask);
        self.pause_cores(core_mask, core_id, sgi);
        sgi.send_sgi_to_list(ThermosphereSgi::ReportDebuggerBreak, 1 << core_id);
    }

    /// Give every core in `core_mask` without an event a debugger break.
    pub fn record_debugger_break(&self, core_mask: u32) {
        for id in (0..MAX_CORE as u32).filter(|id| core_mask & (1 << id) != 0) {
            let mut event = self.events[id as usize].lock();
            if event.is_none() {
                *event = Some(DebugEventInfo {
                    kind: DebugEventKind::DebuggerBreak,
                    core_id: id,
                    handled: false,
                });
            }
        }
    }

    /// Resume `core_mask`. Cores also in `single_step_mask` execute one
    /// instruction and trap again.
    pub fn unpause_cores(&self, core_mask: u32, single_step_mask: u32) {
        let step = single_step_mask & core_mask;
        let _ = self
            .single_step_cores
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |old| {
                Some((old & !core_mask) | step)
            });
        self.paused_cores.fetch_and(!core_mask, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        send_event();
    }

    pub fn event(&self, core_id: u32) -> Option<DebugEventInfo> {
        *self.events[core_id as usize].lock()
    }

    /// Mark the event of `core_id` as sent to the debugger.
    pub fn acknowledge_event(&self, core_id: u32) {
        if let Some(event) = self.events[core_id as usize].lock().as_mut() {
            event.handled = true;
        }
    }

    pub fn clear_events(&self, core_mask: u32) {
        for (id, event) in self.events.iter().enumerate() {
            if core_mask & (1 << id) != 0 {
                *event.lock() = None;
            }
        }
    }

    /// Lowest-numbered core in `core_mask` with an event not yet reported.
    pub fn first_unhandled_event(&self, core_mask: u32) -> Option<DebugEventInfo> {
        self.events
            .iter()
            .enumerate()
            .filter(|(id, _)| core_mask & (1 << id) != 0)
            .find_map(|(_, event)| event.lock().filter(|e| !e.handled))
    }

    /// Lowest-numbered core in `core_mask` with any event.
    pub fn first_event(&self, core_mask: u32) -> Option<DebugEventInfo> {
        self.events
            .iter()
            .enumerate()
            .filter(|(id, _)| core_mask & (1 << id) != 0)
            .find_map(|(_, event)| *event.lock())
    }

    /// Park this core while the debugger holds it, on the way back to the
    /// guest. Interrupts are taken while parked, so stop point reloads and
    /// debugger traffic are still serviced. Once parked the core pokes the
    /// debugger, which may have held back work until it got here.
    ///
    /// The trap frame registered in `core` is handed to the debugger for
    /// the duration; the caller must not touch it until this returns.
    pub fn handle_pause<C: CpuControl, D: DebugRegisterFile>(
        &self,
        core: &CoreContext,
        cpu: &C,
        regs: &D,
        sgi: &dyn SgiSender,
    ) {
        let bit = 1 << core.core_id();
        if self.paused_cores() & bit == 0 {
            return;
        }

        {
            let mut fpu = core.fpu().lock();
            cpu.save_fpu(&mut fpu);
        }
        core.set_was_paused(true);
        fence(Ordering::SeqCst);
        sgi.send_sgi_to_list(ThermosphereSgi::ReportDebuggerBreak, bit);

        while self.paused_cores() & bit != 0 {
            cpu.park();
        }

        core.set_was_paused(false);
        cpu.restore_fpu(&core.fpu().lock());

        let step = self.single_step_cores() & bit != 0;
        // SAFETY: the debugger released the frame when it unpaused us.
        if let Some(frame) = unsafe { core.guest_frame_mut() } {
            frame.set_single_step(step);
        }
        regs.set_single_step(step);
    }
}

impl Default for DebugManager {
    fn default() -> Self {
        Self::new()
    }
}
