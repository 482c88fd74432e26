//! Physical interrupt ownership and dispatch
//!
//! Every physical interrupt is either owned by the hypervisor (its SGIs,
//! the GICH maintenance interrupt, the debugger UART...) or forwarded to
//! the guest through the [`VirtualGic`]. Host interrupts are handed to the
//! [`InterruptTask`] that registered for them.
//!
//! The GIC runs with EOImode=1: priority drop happens as soon as an
//! interrupt is taken, deactivation is deferred for guest interrupts until
//! the guest itself deactivates them through a hardware list register.

use core::cell::RefCell;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::arch::decode::DataAbortIss;
use crate::arch::gicv2::*;
use crate::arch::{
    CpuControl, ExceptionStackFrame, GenericTimer, InterruptController, VirtualInterfaceController,
};
use crate::core_ctx::CoreContext;
use crate::sync::{RecursiveSpinLock, RecursiveSpinLockGuard};
use crate::vgic::{VgicContext, VirtualGic};
use crate::vtimer;

/// SGIs the hypervisor sends to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThermosphereSgi {
    /// Refresh the list registers of the target core
    VgicUpdate = 0,
    /// Park the target core for the debugger
    DebugPause = 1,
    /// Report a debug event on the target core
    ReportDebuggerBreak = 2,
    ReloadHwBreakpoints = 3,
    ReloadWatchpoints = 4,
}

impl ThermosphereSgi {
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::VgicUpdate),
            1 => Some(Self::DebugPause),
            2 => Some(Self::ReportDebuggerBreak),
            3 => Some(Self::ReloadHwBreakpoints),
            4 => Some(Self::ReloadWatchpoints),
            _ => None,
        }
    }

    pub fn id(self) -> u32 {
        self as u32
    }
}

/// Priority of hypervisor-owned interrupts, before shifting.
pub const HOST_PRIORITY: u8 = 0;
/// Priority of interrupts forwarded to the guest, before shifting.
pub const GUEST_PRIORITY: u8 = 1;
/// Lowest programmable priority.
const IDLE_PRIORITY: u8 = 0xFF;

pub const MAX_INTERRUPT_TASKS: usize = 8;

/// A hypervisor component that owns one or more physical interrupts.
pub trait InterruptTask: Sync {
    /// Runs with interrupts masked, without the interrupt manager lock.
    ///
    /// `None`: not ours. `Some(true)`: ours, run the bottom half.
    fn interrupt_top_half(&self, core_id: u32, irq_id: u32, src_core: u32) -> Option<bool>;

    /// Runs after the interrupt is completed, without the lock.
    fn interrupt_bottom_half(&self, _core_id: u32, _irq_id: u32, _src_core: u32) {}
}

/// Cross-core signalling used by components that do not own the GIC.
pub trait SgiSender: Sync {
    fn send_sgi_to_list(&self, sgi: ThermosphereSgi, core_list: u32);
    fn send_sgi_to_all_others(&self, sgi: ThermosphereSgi);
}

/// Deferred half of a host interrupt.
pub struct BottomHalf {
    task: &'static dyn InterruptTask,
    core_id: u32,
    irq_id: u32,
    src_core: u32,
}

impl BottomHalf {
    pub fn irq_id(&self) -> u32 {
        self.irq_id
    }

    pub fn run(self) {
        self.task
            .interrupt_bottom_half(self.core_id, self.irq_id, self.src_core);
    }
}

/// Which physical interrupts belong to the guest.
#[derive(Debug)]
pub struct IrqClassifier {
    num_shared_interrupts: u32,
    host_owned: [u32; 32],
}

impl IrqClassifier {
    pub const fn new() -> Self {
        Self {
            num_shared_interrupts: 0,
            host_owned: [0; 32],
        }
    }

    pub fn set_num_shared_interrupts(&mut self, n: u32) {
        self.num_shared_interrupts = n;
    }

    pub fn num_shared_interrupts(&self) -> u32 {
        self.num_shared_interrupts
    }

    /// Claim `irq_id` for the hypervisor.
    pub fn reserve(&mut self, irq_id: u32) {
        self.host_owned[(irq_id / 32) as usize] |= 1 << (irq_id % 32);
    }

    pub fn is_host_owned(&self, irq_id: u32) -> bool {
        self.host_owned[(irq_id / 32) as usize] & (1 << (irq_id % 32)) != 0
    }

    /// Guest-visible interrupt ids. Virtual SGIs count; whether a physical
    /// SGI is routed is a separate question (it never is).
    pub fn is_guest_interrupt(&self, irq_id: u32) -> bool {
        irq_id < NUM_PRIVATE_IRQS + self.num_shared_interrupts
            && irq_id != MAINTENANCE_IRQ
            && irq_id != HYP_TIMER_IRQ
            && !self.is_host_owned(irq_id)
    }
}

impl Default for IrqClassifier {
    fn default() -> Self {
        Self::new()
    }
}

enum Dispatch {
    Guest,
    Handled,
    Tasks([Option<&'static dyn InterruptTask>; MAX_INTERRUPT_TASKS]),
}

struct IrqState {
    vgic: VirtualGic,
    classifier: IrqClassifier,
    tasks: [Option<&'static dyn InterruptTask>; MAX_INTERRUPT_TASKS],
    priority_shift: u32,
}

/// The state lock, held with IRQs masked on the owning core.
///
/// The lock is recursive, so an interrupt taken while a borrow of the state
/// is live would get straight back in and trip the `RefCell`.
struct StateGuard<'a, C: CpuControl> {
    inner: ManuallyDrop<RecursiveSpinLockGuard<'a, RefCell<IrqState>>>,
    cpu: &'a C,
    unmask_on_drop: bool,
}

impl<C: CpuControl> Deref for StateGuard<'_, C> {
    type Target = RefCell<IrqState>;

    fn deref(&self) -> &RefCell<IrqState> {
        &self.inner
    }
}

impl<C: CpuControl> Drop for StateGuard<'_, C> {
    fn drop(&mut self) {
        // SAFETY: `inner` is not used again.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        if self.unmask_on_drop {
            self.cpu.unmask_interrupts();
        }
    }
}

pub struct IrqManager<G, C> {
    gic: G,
    cpu: C,
    state: RecursiveSpinLock<RefCell<IrqState>>,
}

impl<G, C> IrqManager<G, C>
where
    G: InterruptController + VirtualInterfaceController,
    C: CpuControl,
{
    pub const fn new(gic: G, cpu: C) -> Self {
        Self {
            gic,
            cpu,
            state: RecursiveSpinLock::new(RefCell::new(IrqState {
                vgic: VirtualGic::new(),
                classifier: IrqClassifier::new(),
                tasks: [None; MAX_INTERRUPT_TASKS],
                priority_shift: 0,
            })),
        }
    }

    pub fn gic(&self) -> &G {
        &self.gic
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    fn lock_state(&self, core_id: u32) -> StateGuard<'_, C> {
        let unmask_on_drop = !self.cpu.interrupts_masked();
        if unmask_on_drop {
            self.cpu.mask_interrupts();
        }
        StateGuard {
            inner: ManuallyDrop::new(self.state.lock(core_id)),
            cpu: &self.cpu,
            unmask_on_drop,
        }
    }

    /// Bring up the GIC for `core_id`. The boot core also resets the
    /// distributor and must run first.
    pub fn initialize(&self, core_id: u32, is_boot_core: bool, active_core_mask: u32) {
        let guard = self.lock_state(core_id);
        let st = &mut *guard.borrow_mut();
        let gic = &self.gic;

        if is_boot_core {
            gic.set_distributor_enabled(false);
            let lines = ((gic.distributor_type() & 0x1F) + 1) * 32;
            let num_shared = lines.min(MAX_IRQ_ID + 1) - NUM_PRIVATE_IRQS;
            st.classifier.set_num_shared_interrupts(num_shared);
            for id in NUM_PRIVATE_IRQS..NUM_PRIVATE_IRQS + num_shared {
                gic.set_enabled(id, false);
                gic.clear_pending(id);
                gic.clear_active(id);
                gic.set_priority(id, IDLE_PRIORITY);
                gic.set_targets(id, 0);
            }
            gic.set_distributor_enabled(true);
            log::info!("irq: {} shared interrupts", num_shared);
        }

        for id in 0..NUM_PRIVATE_IRQS {
            gic.set_enabled(id, false);
            gic.clear_pending(id);
            gic.clear_active(id);
            gic.set_priority(id, IDLE_PRIORITY);
        }

        // Unimplemented low priority bits read as zero.
        st.priority_shift = gic.priority(0).trailing_zeros().min(7);
        let shift = st.priority_shift;

        for id in 0..NUM_SGIS {
            gic.set_priority(id, HOST_PRIORITY << shift);
            gic.set_enabled(id, true);
        }
        gic.set_priority(MAINTENANCE_IRQ, HOST_PRIORITY << shift);
        gic.set_enabled(MAINTENANCE_IRQ, true);

        let guest_range = if is_boot_core {
            NUM_SGIS..NUM_PRIVATE_IRQS + st.classifier.num_shared_interrupts()
        } else {
            NUM_SGIS..NUM_PRIVATE_IRQS
        };
        for id in guest_range.filter(|&id| st.classifier.is_guest_interrupt(id)) {
            gic.set_priority(id, GUEST_PRIORITY << shift);
        }

        gic.set_binary_point(0);
        gic.set_priority_mask(IDLE_PRIORITY);
        gic.set_cpu_interface_control(GICC_CTLR_ENABLE_GRP0 | GICC_CTLR_ENABLE_GRP1 | GICC_CTLR_EOIMODE);

        let ctx = VgicContext {
            gic,
            core_id,
            active_core_mask,
            classifier: &st.classifier,
        };
        if is_boot_core {
            st.vgic.init_shared(&ctx);
        }
        st.vgic.init_core(&ctx);
    }

    /// Claim `irq_id` for `task` and route it to the calling core.
    /// Registering the same task again only configures the new interrupt.
    pub fn register(
        &self,
        core_id: u32,
        task: &'static dyn InterruptTask,
        irq_id: u32,
        level_sensitive: bool,
        priority: u8,
    ) {
        let guard = self.lock_state(core_id);
        let st = &mut *guard.borrow_mut();

        let known = st
            .tasks
            .iter()
            .flatten()
            .any(|t| ptr::addr_eq(*t as *const dyn InterruptTask, task as *const dyn InterruptTask));
        if !known {
            let slot = st.tasks.iter_mut().find(|t| t.is_none());
            match slot {
                Some(slot) => *slot = Some(task),
                None => panic!("irq: too many interrupt tasks"),
            }
        }

        if irq_id >= NUM_SGIS {
            st.classifier.reserve(irq_id);
        }

        let gic = &self.gic;
        gic.set_enabled(irq_id, false);
        gic.set_priority(irq_id, priority << st.priority_shift);
        if irq_id >= NUM_SGIS {
            gic.set_edge_triggered(irq_id, !level_sensitive);
        }
        if irq_id >= NUM_PRIVATE_IRQS {
            gic.set_targets(irq_id, 1 << core_id);
        }
        gic.set_enabled(irq_id, true);
        log::debug!("irq: core {} registered irq {}", core_id, irq_id);
    }

    pub fn is_guest_interrupt(&self, core_id: u32, irq_id: u32) -> bool {
        self.lock_state(core_id).borrow().classifier.is_guest_interrupt(irq_id)
    }

    /// Run `f` on the vGIC with this core's context, under the lock and
    /// with IRQs masked.
    pub fn with_vgic<R>(
        &self,
        core_id: u32,
        active_core_mask: u32,
        f: impl FnOnce(&mut VirtualGic, &VgicContext<'_, G>) -> R,
    ) -> R {
        let guard = self.lock_state(core_id);
        let st = &mut *guard.borrow_mut();
        let ctx = VgicContext {
            gic: &self.gic,
            core_id,
            active_core_mask,
            classifier: &st.classifier,
        };
        f(&mut st.vgic, &ctx)
    }

    /// Take and dispatch one physical interrupt, then refresh this core's
    /// list registers. A host task's bottom half is returned to the caller
    /// to run once interrupts may be unmasked.
    pub fn handle_interrupt<T: GenericTimer>(
        &self,
        core: &CoreContext,
        active_core_mask: u32,
        timer: &T,
    ) -> Option<BottomHalf> {
        let core_id = core.core_id();
        // GICC is banked: acknowledging needs no lock.
        let raw = self.gic.acknowledge();
        let iar = Iar::from_bits(raw);
        if iar.is_spurious() {
            return None;
        }
        let irq_id = iar.irq_id;

        let dispatch = {
            let guard = self.lock_state(core_id);
            if irq_id == PTIMER_IRQ && !vtimer::deadline_elapsed(core, timer) {
                // Fired against the physical deadline only; time spent in EL2
                // has since moved the emulated one.
                vtimer::program_physical_deadline(core, timer);
                Dispatch::Handled
            } else if irq_id >= NUM_SGIS && guard.borrow().classifier.is_guest_interrupt(irq_id) {
                Dispatch::Guest
            } else if irq_id == ThermosphereSgi::VgicUpdate.id() {
                Dispatch::Handled
            } else if irq_id == MAINTENANCE_IRQ {
                let st = &mut *guard.borrow_mut();
                let ctx = VgicContext {
                    gic: &self.gic,
                    core_id,
                    active_core_mask,
                    classifier: &st.classifier,
                };
                st.vgic.maintenance_interrupt(&ctx);
                Dispatch::Handled
            } else {
                Dispatch::Tasks(guard.borrow().tasks)
            }
        };

        // Top halves run unlocked: stop point reloads wait for other cores,
        // which need the lock to take their own interrupts.
        let mut claimed = !matches!(dispatch, Dispatch::Tasks(_));
        let mut bottom_half = None;
        if let Dispatch::Tasks(tasks) = &dispatch {
            for task in tasks.iter().flatten() {
                if let Some(run_bottom_half) = task.interrupt_top_half(core_id, irq_id, iar.src_core) {
                    claimed = true;
                    bottom_half = run_bottom_half.then_some(BottomHalf {
                        task: *task,
                        core_id,
                        irq_id,
                        src_core: iar.src_core,
                    });
                    break;
                }
            }
        }

        self.gic.end_of_interrupt(raw);
        let guard = self.lock_state(core_id);
        let st = &mut *guard.borrow_mut();
        let ctx = VgicContext {
            gic: &self.gic,
            core_id,
            active_core_mask,
            classifier: &st.classifier,
        };
        if matches!(dispatch, Dispatch::Guest) {
            st.vgic.enqueue_physical_irq(&ctx, irq_id);
        } else {
            self.gic.deactivate(raw);
            if !claimed {
                log::warn!("irq: core {} unhandled interrupt {}", core_id, irq_id);
            }
        }
        st.vgic.update_state(&ctx);
        bottom_half
    }

    /// Emulate a trapped guest access to the distributor page.
    pub fn handle_gicd_mmio(
        &self,
        core_id: u32,
        active_core_mask: u32,
        frame: &mut ExceptionStackFrame,
        access: &DataAbortIss,
        offset: u32,
    ) {
        self.with_vgic(core_id, active_core_mask, |vgic, ctx| {
            vgic.handle_mmio(ctx, frame, access, offset);
            vgic.update_state(ctx);
        });
    }

    /// Distributor read on behalf of a debugger memory access.
    pub fn read_gicd(&self, core_id: u32, active_core_mask: u32, offset: u32, size: u8) -> u32 {
        self.with_vgic(core_id, active_core_mask, |vgic, ctx| {
            vgic.read_gicd_register(ctx, offset, size)
        })
    }

    /// Distributor write on behalf of a debugger memory access.
    pub fn write_gicd(&self, core_id: u32, active_core_mask: u32, offset: u32, size: u8, value: u32) {
        self.with_vgic(core_id, active_core_mask, |vgic, ctx| {
            vgic.write_gicd_register(ctx, offset, size, value);
            vgic.update_state(ctx);
        });
    }

    pub fn generate_sgi_for_list(&self, sgi: ThermosphereSgi, core_list: u32) {
        fence(Ordering::SeqCst);
        self.gic
            .send_sgi(sgi.id(), SgiTargetFilter::List, core_list as u8);
    }

    pub fn generate_sgi_for_all_others(&self, sgi: ThermosphereSgi) {
        fence(Ordering::SeqCst);
        self.gic.send_sgi(sgi.id(), SgiTargetFilter::AllOthers, 0);
    }

    pub fn generate_sgi_for_self(&self, sgi: ThermosphereSgi) {
        fence(Ordering::SeqCst);
        self.gic.send_sgi(sgi.id(), SgiTargetFilter::SelfOnly, 0);
    }
}

impl<G, C> SgiSender for IrqManager<G, C>
where
    G: InterruptController + VirtualInterfaceController,
    C: CpuControl,
{
    fn send_sgi_to_list(&self, sgi: ThermosphereSgi, core_list: u32) {
        self.generate_sgi_for_list(sgi, core_list);
    }

    fn send_sgi_to_all_others(&self, sgi: ThermosphereSgi) {
        self.generate_sgi_for_all_others(sgi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_interrupts_are_not_guest() {
        let mut c = IrqClassifier::new();
        c.set_num_shared_interrupts(64);
        assert!(c.is_guest_interrupt(3));
        assert!(c.is_guest_interrupt(27));
        assert!(!c.is_guest_interrupt(MAINTENANCE_IRQ));
        assert!(!c.is_guest_interrupt(HYP_TIMER_IRQ));
        assert!(c.is_guest_interrupt(95));
        assert!(!c.is_guest_interrupt(96));
        c.reserve(33);
        assert!(c.is_host_owned(33));
        assert!(!c.is_guest_interrupt(33));
    }

    #[test]
    fn test_sgi_ids() {
        for id in 0..5 {
            assert_eq!(ThermosphereSgi::from_id(id).map(ThermosphereSgi::id), Some(id));
        }
        assert_eq!(ThermosphereSgi::from_id(5), None);
    }
}
