//! Per-core state
//!
//! One [`CoreContext`] per physical core, never destroyed. The trap entry
//! path resolves the current core once (from MPIDR_EL1) and passes the
//! context explicitly from there on.
//!
//! Fields are atomics so other cores may read them. Writers:
//! - `guest_frame`: the owning core's entry/exit path
//! - `kernel_*`: boot, or a PSCI call targeting a core that is off
//! - `was_paused`, `stepping_range_*`, `fpu`: debugger, while the core is parked
//! - timer bookkeeping: the owning core during its own trap handling

use core::ops::Index;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::arch::{ExceptionStackFrame, FpuRegisters};
use crate::platform::MAX_CORE;
use crate::sync::SpinLock;

pub struct CoreContext {
    core_id: u32,
    is_boot_core: AtomicBool,
    guest_frame: AtomicPtr<ExceptionStackFrame>,
    kernel_entrypoint: AtomicU64,
    kernel_argument: AtomicU64,
    was_paused: AtomicBool,
    stepping_range_start: AtomicU64,
    stepping_range_end: AtomicU64,
    total_time_in_hypervisor: AtomicU64,
    emul_ptimer_cval: AtomicU64,
    fpu: SpinLock<FpuRegisters>,
}

impl CoreContext {
    pub const fn new(core_id: u32) -> Self {
        Self {
            core_id,
            is_boot_core: AtomicBool::new(false),
            guest_frame: AtomicPtr::new(ptr::null_mut()),
            kernel_entrypoint: AtomicU64::new(0),
            kernel_argument: AtomicU64::new(0),
            was_paused: AtomicBool::new(false),
            stepping_range_start: AtomicU64::new(0),
            stepping_range_end: AtomicU64::new(0),
            total_time_in_hypervisor: AtomicU64::new(0),
            emul_ptimer_cval: AtomicU64::new(0),
            fpu: SpinLock::new(FpuRegisters::zeroed()),
        }
    }

    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    pub fn is_boot_core(&self) -> bool {
        self.is_boot_core.load(Ordering::Relaxed)
    }

    /// Record the frame of the trap being handled on this core.
    pub fn set_guest_frame(&self, frame: *mut ExceptionStackFrame) {
        self.guest_frame.store(frame, Ordering::Release);
    }

    pub fn clear_guest_frame(&self) {
        self.guest_frame.store(ptr::null_mut(), Ordering::Release);
    }

    pub fn has_guest_frame(&self) -> bool {
        !self.guest_frame.load(Ordering::Acquire).is_null()
    }

    /// Mutable access to another core's saved frame.
    ///
    /// # Safety
    /// The owning core must be parked (paused by the debug manager) for the
    /// whole lifetime of the returned reference, and no other reference to
    /// the frame may exist.
    pub unsafe fn guest_frame_mut(&self) -> Option<&mut ExceptionStackFrame> {
        self.guest_frame.load(Ordering::Acquire).as_mut()
    }

    pub fn kernel_entrypoint(&self) -> u64 {
        self.kernel_entrypoint.load(Ordering::Acquire)
    }

    pub fn kernel_argument(&self) -> u64 {
        self.kernel_argument.load(Ordering::Acquire)
    }

    pub fn set_boot_parameters(&self, entrypoint: u64, argument: u64) {
        self.kernel_entrypoint.store(entrypoint, Ordering::Relaxed);
        self.kernel_argument.store(argument, Ordering::Release);
    }

    pub fn was_paused(&self) -> bool {
        self.was_paused.load(Ordering::Relaxed)
    }

    pub fn set_was_paused(&self, paused: bool) {
        self.was_paused.store(paused, Ordering::Relaxed);
    }

    /// Address range `[start, end)` within which single-stepping continues silently.
    pub fn stepping_range(&self) -> (u64, u64) {
        (
            self.stepping_range_start.load(Ordering::Relaxed),
            self.stepping_range_end.load(Ordering::Relaxed),
        )
    }

    pub fn set_stepping_range(&self, start: u64, end: u64) {
        self.stepping_range_start.store(start, Ordering::Relaxed);
        self.stepping_range_end.store(end, Ordering::Relaxed);
    }

    pub fn total_time_in_hypervisor(&self) -> u64 {
        self.total_time_in_hypervisor.load(Ordering::Relaxed)
    }

    /// Account `ticks` spent in EL2; returns the new total.
    pub fn add_time_in_hypervisor(&self, ticks: u64) -> u64 {
        self.total_time_in_hypervisor
            .fetch_add(ticks, Ordering::Relaxed)
            .wrapping_add(ticks)
    }

    pub fn emul_ptimer_cval(&self) -> u64 {
        self.emul_ptimer_cval.load(Ordering::Relaxed)
    }

    pub fn set_emul_ptimer_cval(&self, cval: u64) {
        self.emul_ptimer_cval.store(cval, Ordering::Relaxed);
    }

    /// SIMD/FP state captured while parked.
    pub fn fpu(&self) -> &SpinLock<FpuRegisters> {
        &self.fpu
    }
}

/// All core contexts plus the set of cores brought up so far.
pub struct CoreContexts {
    cores: [CoreContext; MAX_CORE],
    active_core_mask: AtomicU32,
}

impl CoreContexts {
    pub const fn new() -> Self {
        Self {
            cores: [
                CoreContext::new(0),
                CoreContext::new(1),
                CoreContext::new(2),
                CoreContext::new(3),
            ],
            active_core_mask: AtomicU32::new(0),
        }
    }

    pub fn get(&self, core_id: u32) -> &CoreContext {
        &self.cores[core_id as usize]
    }

    /// Mark a core as up. Set once per core, never cleared.
    pub fn mark_active(&self, core_id: u32, is_boot_core: bool) {
        let ctx = self.get(core_id);
        ctx.is_boot_core.store(is_boot_core, Ordering::Relaxed);
        self.active_core_mask
            .fetch_or(1 << core_id, Ordering::SeqCst);
    }

    pub fn active_core_mask(&self) -> u32 {
        self.active_core_mask.load(Ordering::SeqCst)
    }

    pub fn boot_core_id(&self) -> Option<u32> {
        self.cores
            .iter()
            .find(|c| c.is_boot_core())
            .map(|c| c.core_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoreContext> {
        self.cores.iter()
    }
}

impl Default for CoreContexts {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<u32> for CoreContexts {
    type Output = CoreContext;

    fn index(&self, core_id: u32) -> &CoreContext {
        self.get(core_id)
    }
}
