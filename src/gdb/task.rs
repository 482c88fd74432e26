//! Interrupt glue for the stub
//!
//! The stub runs in bottom halves: on transport receive interrupts, and on
//! `ReportDebuggerBreak`, which a core sends itself once it has something
//! to report or has parked. Only one core runs the stub at a time; a core
//! finding it busy leaves a note for the current holder instead of
//! spinning, as the holder may be waiting for that very core to park.

use core::sync::atomic::{AtomicBool, Ordering};

use super::{DebugTarget, GdbContext, Transport};
use crate::irq_manager::{InterruptTask, ThermosphereSgi};
use crate::sync::SpinLock;

pub struct GdbTransportTask<T: 'static, X: 'static> {
    context: SpinLock<GdbContext<'static, T, X>>,
    transport: &'static X,
    irq_id: u32,
    work_pending: AtomicBool,
}

impl<T: DebugTarget, X: Transport> GdbTransportTask<T, X> {
    pub const fn new(target: &'static T, transport: &'static X, irq_id: u32) -> Self {
        Self {
            context: SpinLock::new(GdbContext::new(target, transport)),
            transport,
            irq_id,
            work_pending: AtomicBool::new(false),
        }
    }

    pub fn irq_id(&self) -> u32 {
        self.irq_id
    }

    /// Process input and pending debug events on `core_id`.
    pub fn run(&self, core_id: u32) {
        self.work_pending.store(true, Ordering::SeqCst);
        let mut deferred = false;
        while self.work_pending.load(Ordering::SeqCst) {
            let Some(mut ctx) = self.context.try_lock() else {
                return;
            };
            while self.work_pending.swap(false, Ordering::SeqCst) {
                deferred = !ctx.handle_input(core_id);
                ctx.poll_debug_events(core_id);
            }
        }
        // Deferred input is picked up when the core parks.
        if !deferred {
            self.transport.set_rx_interrupt_enabled(true);
        }
    }
}

impl<T: DebugTarget, X: Transport> InterruptTask for GdbTransportTask<T, X> {
    fn interrupt_top_half(&self, _core_id: u32, irq_id: u32, _src_core: u32) -> Option<bool> {
        if irq_id == self.irq_id {
            // Level-triggered: quiet until the bottom half drained the FIFO.
            self.transport.set_rx_interrupt_enabled(false);
            Some(true)
        } else if irq_id == ThermosphereSgi::ReportDebuggerBreak.id() {
            Some(true)
        } else {
            None
        }
    }

    fn interrupt_bottom_half(&self, core_id: u32, _irq_id: u32, _src_core: u32) {
        self.run(core_id);
    }
}
