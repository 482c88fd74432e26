//! Software models of the hardware a `Hypervisor` runs on.
//!
//! Banked registers (SGI/PPI distributor state, GICC, GICH, debug
//! comparators, FPU) belong to the "current core", a thread-local each test
//! thread sets with [`set_current_core`], the way a physical core only ever
//! sees its own bank.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thermosphere::arch::gicv2::{Iar, ListRegister, SgiTargetFilter, NUM_PRIVATE_IRQS, SPURIOUS_IRQ_ID};
use thermosphere::arch::{
    CpuControl, DebugRegisterFile, ExceptionStackFrame, FpuRegisters, GenericTimer, GuestPageAccess,
    InterruptController, PageTranslation, Platform, SecureMonitor, VirtualInterfaceController,
};
use thermosphere::gdb::packet::checksum;
use thermosphere::gdb::Transport;
use thermosphere::Hypervisor;

pub const NUM_CORES: usize = 4;
pub const NUM_LIST_REGISTERS: usize = 4;
/// ITLinesNumber = 2: 96 interrupt lines.
pub const GICD_TYPER_VALUE: u32 = 2;
const NUM_LINES: usize = 96;
/// Five implemented priority bits.
const PRIORITY_MASK: u8 = 0xF8;

pub const WARM_ENTRYPOINT: u64 = 0x7FC0_0100;
pub const TIMER_FREQUENCY: u64 = 62_500_000;
/// 6 breakpoints, 4 watchpoints.
pub const DFR0: u64 = 5 << 12 | 3 << 20;

thread_local! {
    static CURRENT_CORE: Cell<u32> = const { Cell::new(0) };
}

pub fn set_current_core(core_id: u32) {
    CURRENT_CORE.with(|c| c.set(core_id));
}

pub fn current_core() -> u32 {
    CURRENT_CORE.with(|c| c.get())
}

fn cur() -> usize {
    current_core() as usize
}

// ── GIC ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Line {
    enabled: bool,
    priority: u8,
    targets: u8,
    edge: bool,
    pending: bool,
    active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentSgi {
    pub sender: u32,
    pub sgi_id: u32,
    /// Resolved destination cores.
    pub targets: u32,
}

struct GicState {
    distributor_enabled: bool,
    private: [[Line; NUM_PRIVATE_IRQS as usize]; NUM_CORES],
    shared: [Line; NUM_LINES],
    cpu_ctlr: [u32; NUM_CORES],
    pmr: [u8; NUM_CORES],
    iar_queue: [VecDeque<u32>; NUM_CORES],
    eoi: [Vec<u32>; NUM_CORES],
    dir: [Vec<u32>; NUM_CORES],
    lrs: [[u32; NUM_LIST_REGISTERS]; NUM_CORES],
    hcr: [u32; NUM_CORES],
    misr: [u32; NUM_CORES],
    gicv_ctlr: [u32; NUM_CORES],
    sgis: Vec<SentSgi>,
}

impl GicState {
    fn line(&mut self, core: usize, id: u32) -> &mut Line {
        if id < NUM_PRIVATE_IRQS {
            &mut self.private[core][id as usize]
        } else {
            &mut self.shared[id as usize]
        }
    }
}

pub struct MockGic {
    state: Mutex<GicState>,
}

impl MockGic {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GicState {
                distributor_enabled: false,
                private: [[Line::default(); NUM_PRIVATE_IRQS as usize]; NUM_CORES],
                shared: [Line::default(); NUM_LINES],
                cpu_ctlr: [0; NUM_CORES],
                pmr: [0; NUM_CORES],
                iar_queue: Default::default(),
                eoi: Default::default(),
                dir: Default::default(),
                lrs: [[0; NUM_LIST_REGISTERS]; NUM_CORES],
                hcr: [0; NUM_CORES],
                misr: [0; NUM_CORES],
                gicv_ctlr: [0; NUM_CORES],
                sgis: Vec::new(),
            }),
        }
    }

    /// Assert `irq_id` towards `core_id`: the line goes pending and the
    /// core's CPU interface will acknowledge it next.
    pub fn raise(&self, core_id: u32, irq_id: u32) {
        let mut st = self.state.lock().unwrap();
        st.line(core_id as usize, irq_id).pending = true;
        st.iar_queue[core_id as usize].push_back(irq_id);
    }

    /// Drive a level-sensitive line without signalling any core.
    pub fn set_line_level(&self, core_id: u32, irq_id: u32, level: bool) {
        self.state.lock().unwrap().line(core_id as usize, irq_id).pending = level;
    }

    pub fn has_pending_irq(&self, core_id: u32) -> bool {
        !self.state.lock().unwrap().iar_queue[core_id as usize].is_empty()
    }

    pub fn is_enabled_on(&self, core_id: u32, irq_id: u32) -> bool {
        self.state.lock().unwrap().line(core_id as usize, irq_id).enabled
    }

    pub fn priority_on(&self, core_id: u32, irq_id: u32) -> u8 {
        self.state.lock().unwrap().line(core_id as usize, irq_id).priority
    }

    pub fn targets_of(&self, irq_id: u32) -> u8 {
        self.state.lock().unwrap().shared[irq_id as usize].targets
    }

    pub fn is_edge_on(&self, core_id: u32, irq_id: u32) -> bool {
        self.state.lock().unwrap().line(core_id as usize, irq_id).edge
    }

    pub fn is_active_on(&self, core_id: u32, irq_id: u32) -> bool {
        self.state.lock().unwrap().line(core_id as usize, irq_id).active
    }

    pub fn cpu_control(&self, core_id: u32) -> u32 {
        self.state.lock().unwrap().cpu_ctlr[core_id as usize]
    }

    pub fn eois(&self, core_id: u32) -> Vec<u32> {
        self.state.lock().unwrap().eoi[core_id as usize].clone()
    }

    pub fn deactivations(&self, core_id: u32) -> Vec<u32> {
        self.state.lock().unwrap().dir[core_id as usize].clone()
    }

    pub fn list_registers(&self, core_id: u32) -> [ListRegister; NUM_LIST_REGISTERS] {
        self.state.lock().unwrap().lrs[core_id as usize].map(ListRegister::from_bits)
    }

    /// What the guest did with a list register: acknowledge, EOI...
    pub fn guest_update_lr(&self, core_id: u32, index: usize, f: impl FnOnce(&mut ListRegister)) {
        let mut st = self.state.lock().unwrap();
        let mut lr = ListRegister::from_bits(st.lrs[core_id as usize][index]);
        f(&mut lr);
        st.lrs[core_id as usize][index] = lr.bits();
    }

    pub fn hcr(&self, core_id: u32) -> u32 {
        self.state.lock().unwrap().hcr[core_id as usize]
    }

    pub fn set_misr(&self, core_id: u32, misr: u32) {
        self.state.lock().unwrap().misr[core_id as usize] = misr;
    }

    pub fn gicv_ctlr(&self, core_id: u32) -> u32 {
        self.state.lock().unwrap().gicv_ctlr[core_id as usize]
    }

    pub fn set_gicv_ctlr(&self, core_id: u32, ctlr: u32) {
        self.state.lock().unwrap().gicv_ctlr[core_id as usize] = ctlr;
    }

    pub fn sent_sgis(&self) -> Vec<SentSgi> {
        self.state.lock().unwrap().sgis.clone()
    }

    pub fn clear_sent_sgis(&self) {
        self.state.lock().unwrap().sgis.clear();
    }

    /// Drop everything the CPU interfaces have not acknowledged yet.
    pub fn drain_pending(&self) {
        let mut st = self.state.lock().unwrap();
        for q in st.iar_queue.iter_mut() {
            q.clear();
        }
    }
}

impl Default for MockGic {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController for MockGic {
    fn distributor_type(&self) -> u32 {
        GICD_TYPER_VALUE
    }

    fn set_distributor_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().distributor_enabled = enabled;
    }

    fn set_enabled(&self, id: u32, enabled: bool) {
        self.state.lock().unwrap().line(cur(), id).enabled = enabled;
    }

    fn is_enabled(&self, id: u32) -> bool {
        self.state.lock().unwrap().line(cur(), id).enabled
    }

    fn set_priority(&self, id: u32, priority: u8) {
        self.state.lock().unwrap().line(cur(), id).priority = priority & PRIORITY_MASK;
    }

    fn priority(&self, id: u32) -> u8 {
        self.state.lock().unwrap().line(cur(), id).priority
    }

    fn set_targets(&self, id: u32, targets: u8) {
        self.state.lock().unwrap().line(cur(), id).targets = targets;
    }

    fn targets(&self, id: u32) -> u8 {
        self.state.lock().unwrap().line(cur(), id).targets
    }

    fn set_edge_triggered(&self, id: u32, edge: bool) {
        self.state.lock().unwrap().line(cur(), id).edge = edge;
    }

    fn is_edge_triggered(&self, id: u32) -> bool {
        self.state.lock().unwrap().line(cur(), id).edge
    }

    fn is_pending(&self, id: u32) -> bool {
        self.state.lock().unwrap().line(cur(), id).pending
    }

    fn clear_pending(&self, id: u32) {
        self.state.lock().unwrap().line(cur(), id).pending = false;
    }

    fn clear_active(&self, id: u32) {
        self.state.lock().unwrap().line(cur(), id).active = false;
    }

    fn send_sgi(&self, sgi_id: u32, filter: SgiTargetFilter, target_list: u8) {
        let sender = current_core();
        let all = (1u32 << NUM_CORES) - 1;
        let targets = match filter {
            SgiTargetFilter::List => u32::from(target_list) & all,
            SgiTargetFilter::AllOthers => all & !(1 << sender),
            SgiTargetFilter::SelfOnly => 1 << sender,
        };
        let mut st = self.state.lock().unwrap();
        st.sgis.push(SentSgi {
            sender,
            sgi_id,
            targets,
        });
        let iar = Iar {
            irq_id: sgi_id,
            src_core: sender,
        };
        for core in (0..NUM_CORES).filter(|c| targets & (1 << c) != 0) {
            st.iar_queue[core].push_back(iar.bits());
        }
    }

    fn set_cpu_interface_control(&self, ctlr: u32) {
        self.state.lock().unwrap().cpu_ctlr[cur()] = ctlr;
    }

    fn set_priority_mask(&self, pmr: u8) {
        self.state.lock().unwrap().pmr[cur()] = pmr;
    }

    fn set_binary_point(&self, _bpr: u32) {}

    fn acknowledge(&self) -> u32 {
        let core = cur();
        let mut st = self.state.lock().unwrap();
        let Some(raw) = st.iar_queue[core].pop_front() else {
            return SPURIOUS_IRQ_ID;
        };
        let id = Iar::from_bits(raw).irq_id;
        let line = st.line(core, id);
        line.active = true;
        if line.edge || id < 16 {
            line.pending = false;
        }
        raw
    }

    fn end_of_interrupt(&self, iar: u32) {
        self.state.lock().unwrap().eoi[cur()].push(Iar::from_bits(iar).irq_id);
    }

    fn deactivate(&self, iar: u32) {
        let core = cur();
        let id = Iar::from_bits(iar).irq_id;
        let mut st = self.state.lock().unwrap();
        st.line(core, id).active = false;
        st.dir[core].push(id);
    }
}

impl VirtualInterfaceController for MockGic {
    fn vgic_type(&self) -> u32 {
        (NUM_LIST_REGISTERS as u32 - 1) | 4 << 26 | 4 << 29
    }

    fn hypervisor_control(&self) -> u32 {
        self.state.lock().unwrap().hcr[cur()]
    }

    fn set_hypervisor_control(&self, hcr: u32) {
        self.state.lock().unwrap().hcr[cur()] = hcr;
    }

    fn maintenance_status(&self) -> u32 {
        self.state.lock().unwrap().misr[cur()]
    }

    fn empty_list_register_status(&self) -> u64 {
        let st = self.state.lock().unwrap();
        st.lrs[cur()]
            .iter()
            .enumerate()
            .filter(|(_, lr)| ListRegister::from_bits(**lr).is_empty())
            .fold(0, |acc, (i, _)| acc | 1 << i)
    }

    fn list_register(&self, index: usize) -> u32 {
        self.state.lock().unwrap().lrs[cur()][index]
    }

    fn set_list_register(&self, index: usize, value: u32) {
        self.state.lock().unwrap().lrs[cur()][index] = value;
    }

    fn virtual_cpu_control(&self) -> u32 {
        self.state.lock().unwrap().gicv_ctlr[cur()]
    }

    fn set_virtual_cpu_control(&self, ctlr: u32) {
        self.state.lock().unwrap().gicv_ctlr[cur()] = ctlr;
    }
}

// ── Generic timer ────────────────────────────────────────────────────

pub struct MockTimer {
    counter: AtomicU64,
    cval: AtomicU64,
    ctl: AtomicU32,
    voff: AtomicU64,
}

impl MockTimer {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1_000),
            cval: AtomicU64::new(0),
            ctl: AtomicU32::new(0),
            voff: AtomicU64::new(0),
        }
    }

    pub fn set_counter(&self, value: u64) {
        self.counter.store(value, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: u64) {
        self.counter.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn virtual_offset(&self) -> u64 {
        self.voff.load(Ordering::SeqCst)
    }
}

impl Default for MockTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericTimer for MockTimer {
    fn counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    fn frequency(&self) -> u64 {
        TIMER_FREQUENCY
    }

    fn physical_cval(&self) -> u64 {
        self.cval.load(Ordering::SeqCst)
    }

    fn set_physical_cval(&self, cval: u64) {
        self.cval.store(cval, Ordering::SeqCst);
    }

    fn physical_ctl(&self) -> u32 {
        self.ctl.load(Ordering::SeqCst)
    }

    fn set_physical_ctl(&self, ctl: u32) {
        self.ctl.store(ctl, Ordering::SeqCst);
    }

    fn set_virtual_offset(&self, offset: u64) {
        self.voff.store(offset, Ordering::SeqCst);
    }
}

// ── Debug registers ──────────────────────────────────────────────────

type Comparators = [(u64, u64); 16];

pub struct MockDebugRegs {
    breakpoints: Mutex<[Comparators; NUM_CORES]>,
    watchpoints: Mutex<[Comparators; NUM_CORES]>,
    single_step: [AtomicBool; NUM_CORES],
}

impl MockDebugRegs {
    pub fn new() -> Self {
        Self {
            breakpoints: Mutex::new([[(0, 0); 16]; NUM_CORES]),
            watchpoints: Mutex::new([[(0, 0); 16]; NUM_CORES]),
            single_step: Default::default(),
        }
    }

    /// (control, value) of breakpoint comparator `index` on `core_id`.
    pub fn breakpoint(&self, core_id: u32, index: usize) -> (u64, u64) {
        self.breakpoints.lock().unwrap()[core_id as usize][index]
    }

    pub fn watchpoint(&self, core_id: u32, index: usize) -> (u64, u64) {
        self.watchpoints.lock().unwrap()[core_id as usize][index]
    }

    pub fn is_single_stepping(&self, core_id: u32) -> bool {
        self.single_step[core_id as usize].load(Ordering::SeqCst)
    }
}

impl Default for MockDebugRegs {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugRegisterFile for MockDebugRegs {
    fn debug_feature_register(&self) -> u64 {
        DFR0
    }

    fn set_breakpoint(&self, index: usize, control: u64, value: u64) {
        self.breakpoints.lock().unwrap()[cur()][index] = (control, value);
    }

    fn set_watchpoint(&self, index: usize, control: u64, value: u64) {
        self.watchpoints.lock().unwrap()[cur()][index] = (control, value);
    }

    fn set_single_step(&self, enabled: bool) {
        self.single_step[cur()].store(enabled, Ordering::SeqCst);
    }
}

// ── Guest memory ─────────────────────────────────────────────────────

const PAGE: u64 = 0x1000;

#[derive(Debug, Clone, Copy)]
enum Mapping {
    Normal(u64),
    Device(u64),
    Gicd,
}

struct MemoryState {
    pages: HashMap<u64, Mapping>,
    phys: HashMap<u64, u8>,
    /// Bytes of a device page accessible before the access faults.
    device_limits: HashMap<u64, usize>,
    maintained: Vec<(u64, usize)>,
}

/// Guest virtual pages over a sparse physical byte store.
pub struct MockMemory {
    state: Mutex<MemoryState>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                pages: HashMap::new(),
                phys: HashMap::new(),
                device_limits: HashMap::new(),
                maintained: Vec::new(),
            }),
        }
    }

    pub fn map_normal(&self, va: u64, pa: u64) {
        self.state.lock().unwrap().pages.insert(va & !(PAGE - 1), Mapping::Normal(pa & !(PAGE - 1)));
    }

    /// Device page whose accesses fault after `limit` bytes.
    pub fn map_device(&self, va: u64, pa: u64, limit: usize) {
        let mut st = self.state.lock().unwrap();
        st.pages.insert(va & !(PAGE - 1), Mapping::Device(pa & !(PAGE - 1)));
        st.device_limits.insert(pa & !(PAGE - 1), limit);
    }

    pub fn map_gicd(&self, va: u64) {
        self.state.lock().unwrap().pages.insert(va & !(PAGE - 1), Mapping::Gicd);
    }

    pub fn poke(&self, pa: u64, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        for (i, &b) in data.iter().enumerate() {
            st.phys.insert(pa + i as u64, b);
        }
    }

    pub fn peek(&self, pa: u64, len: usize) -> Vec<u8> {
        let st = self.state.lock().unwrap();
        (0..len as u64).map(|i| st.phys.get(&(pa + i)).copied().unwrap_or(0)).collect()
    }

    pub fn peek_u32(&self, pa: u64) -> u32 {
        let b = self.peek(pa, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Ranges written through the normal-memory path, i.e. cleaned.
    pub fn maintained_ranges(&self) -> Vec<(u64, usize)> {
        self.state.lock().unwrap().maintained.clone()
    }

    fn device_room(&self, pa: u64) -> usize {
        let st = self.state.lock().unwrap();
        let page = pa & !(PAGE - 1);
        let limit = st.device_limits.get(&page).copied().unwrap_or(PAGE as usize);
        limit.saturating_sub((pa - page) as usize)
    }
}

impl Default for MockMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestPageAccess for MockMemory {
    fn translate(&self, va: u64) -> PageTranslation {
        let page = va & !(PAGE - 1);
        let offset = va & (PAGE - 1);
        match self.state.lock().unwrap().pages.get(&page) {
            Some(Mapping::Normal(pa)) => PageTranslation::Mapped {
                pa: pa + offset,
                device: false,
            },
            Some(Mapping::Device(pa)) => PageTranslation::Mapped {
                pa: pa + offset,
                device: true,
            },
            Some(Mapping::Gicd) => PageTranslation::Gicd {
                offset: offset as u32,
            },
            None => PageTranslation::Fault,
        }
    }

    fn read_normal(&self, pa: u64, buf: &mut [u8]) {
        let data = self.peek(pa, buf.len());
        buf.copy_from_slice(&data);
    }

    fn write_normal(&self, pa: u64, data: &[u8]) {
        self.poke(pa, data);
        self.state.lock().unwrap().maintained.push((pa, data.len()));
    }

    fn read_device(&self, pa: u64, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.device_room(pa));
        let data = self.peek(pa, n);
        buf[..n].copy_from_slice(&data);
        n
    }

    fn write_device(&self, pa: u64, data: &[u8]) -> usize {
        let n = data.len().min(self.device_room(pa));
        self.poke(pa, &data[..n]);
        n
    }
}

// ── Secure monitor, CPU ──────────────────────────────────────────────

#[derive(Default)]
pub struct MockMonitor {
    calls: Mutex<Vec<[u64; 8]>>,
}

impl MockMonitor {
    pub fn calls(&self) -> Vec<[u64; 8]> {
        self.calls.lock().unwrap().clone()
    }
}

impl SecureMonitor for MockMonitor {
    fn call(&self, args: &mut [u64; 8]) {
        self.calls.lock().unwrap().push(*args);
        // PSCI_SUCCESS
        args[0] = 0;
    }
}

pub struct MockCpu {
    fpu: Mutex<[FpuRegisters; NUM_CORES]>,
    parks: AtomicU32,
    unmasks: AtomicU32,
    /// One bit per core; EL2 is entered with IRQs masked.
    masked: AtomicU32,
}

impl MockCpu {
    pub fn new() -> Self {
        Self {
            fpu: Mutex::new([FpuRegisters::zeroed(); NUM_CORES]),
            parks: AtomicU32::new(0),
            unmasks: AtomicU32::new(0),
            masked: AtomicU32::new(u32::MAX),
        }
    }

    /// Live SIMD/FP registers of `core_id`.
    pub fn fpu(&self, core_id: u32) -> FpuRegisters {
        self.fpu.lock().unwrap()[core_id as usize]
    }

    pub fn set_fpu(&self, core_id: u32, regs: FpuRegisters) {
        self.fpu.lock().unwrap()[core_id as usize] = regs;
    }

    pub fn parks(&self) -> u32 {
        self.parks.load(Ordering::SeqCst)
    }

    pub fn unmasks(&self) -> u32 {
        self.unmasks.load(Ordering::SeqCst)
    }
}

impl Default for MockCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuControl for MockCpu {
    fn park(&self) {
        self.parks.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
    }

    fn unmask_interrupts(&self) {
        self.unmasks.fetch_add(1, Ordering::SeqCst);
        self.masked.fetch_and(!(1 << current_core()), Ordering::SeqCst);
    }

    fn mask_interrupts(&self) {
        self.masked.fetch_or(1 << current_core(), Ordering::SeqCst);
    }

    fn interrupts_masked(&self) -> bool {
        self.masked.load(Ordering::SeqCst) & (1 << current_core()) != 0
    }

    fn save_fpu(&self, regs: &mut FpuRegisters) {
        *regs = self.fpu(current_core());
    }

    fn restore_fpu(&self, regs: &FpuRegisters) {
        self.set_fpu(current_core(), *regs);
    }

    fn warm_entrypoint(&self) -> u64 {
        WARM_ENTRYPOINT
    }
}

// ── Platform and hypervisor ──────────────────────────────────────────

pub struct MockPlatform;

impl Platform for MockPlatform {
    type Gic = MockGic;
    type Timer = MockTimer;
    type DebugRegs = MockDebugRegs;
    type Memory = MockMemory;
    type Monitor = MockMonitor;
    type Cpu = MockCpu;
}

pub type TestHypervisor = Hypervisor<MockPlatform>;

/// A fresh hypervisor; leaked, interrupt tasks need `'static`.
pub fn hypervisor() -> &'static TestHypervisor {
    Box::leak(Box::new(Hypervisor::new(
        MockGic::new(),
        MockTimer::new(),
        MockDebugRegs::new(),
        MockMemory::new(),
        MockMonitor::default(),
        MockCpu::new(),
    )))
}

/// Bring up cores `0..num_cores`, core 0 first as the boot core. Leaves
/// the calling thread on core 0 with nothing left to acknowledge.
pub fn booted(num_cores: u32) -> &'static TestHypervisor {
    let hv = hypervisor();
    for id in 0..num_cores {
        set_current_core(id);
        hv.init_core(id, id == 0);
    }
    set_current_core(0);
    hv.irq().gic().drain_pending();
    hv.irq().gic().clear_sent_sgis();
    hv
}

/// Take every interrupt queued for the current core.
pub fn drain_irqs(hv: &TestHypervisor) {
    let core_id = current_core();
    while hv.irq().gic().has_pending_irq(core_id) {
        hv.handle_irq(hv.cores().get(core_id));
    }
}

/// Make `core_id` look parked for the debugger inside a trap with `frame`.
pub fn park_core(hv: &TestHypervisor, core_id: u32, frame: &mut ExceptionStackFrame) {
    let core = hv.cores().get(core_id);
    core.set_guest_frame(frame);
    core.set_was_paused(true);
}

// ── GDB transport ────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockTransport {
    rx: Mutex<VecDeque<u8>>,
    tx: Mutex<Vec<u8>>,
    rx_irq: AtomicBool,
}

impl MockTransport {
    pub fn feed(&self, data: &[u8]) {
        self.rx.lock().unwrap().extend(data.iter().copied());
    }

    /// Feed one framed packet.
    pub fn feed_packet(&self, payload: &str) {
        self.feed(frame_packet(payload).as_bytes());
    }

    pub fn take_output(&self) -> String {
        let out = std::mem::take(&mut *self.tx.lock().unwrap());
        String::from_utf8_lossy(&out).into_owned()
    }

    pub fn unread(&self) -> usize {
        self.rx.lock().unwrap().len()
    }

    pub fn rx_interrupt_enabled(&self) -> bool {
        self.rx_irq.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn read_byte(&self) -> Option<u8> {
        self.rx.lock().unwrap().pop_front()
    }

    fn write_all(&self, data: &[u8]) {
        self.tx.lock().unwrap().extend_from_slice(data);
    }

    fn set_rx_interrupt_enabled(&self, enabled: bool) {
        self.rx_irq.store(enabled, Ordering::SeqCst);
    }
}

/// `$payload#cc`
pub fn frame_packet(payload: &str) -> String {
    format!("${}#{:02x}", payload, checksum(payload.as_bytes()))
}

// ── Traps ────────────────────────────────────────────────────────────

/// Guest pc used by trap frames.
pub const GUEST_PC: u64 = 0x4008_0000;

/// A frame for a trap of class `ec`, entered at the current counter value.
pub fn trap_frame(hv: &TestHypervisor, ec: u32, iss: u32) -> ExceptionStackFrame {
    ExceptionStackFrame {
        elr_el2: GUEST_PC,
        spsr_el2: 0x3C5,
        esr_el2: u64::from(ec) << 26 | 1 << 25 | u64::from(iss),
        cntpct_el0: hv.timer().counter(),
        ..Default::default()
    }
}

/// Data abort syndrome with a valid ISS: `size` bytes through register `reg`.
pub fn dabt_iss(size: u8, reg: u32, is_write: bool) -> u32 {
    1 << 24 | (size.trailing_zeros()) << 22 | reg << 16 | u32::from(is_write) << 6
}

// ── Other cores ──────────────────────────────────────────────────────

/// Spin until `cond` holds; fails the test after a few seconds.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::yield_now();
    }
}

/// Take the trap `frame` on `core_id` from a thread of its own; the
/// handler may park there until the debugger lets go.
pub fn spawn_trap(
    hv: &'static TestHypervisor,
    core_id: u32,
    mut frame: ExceptionStackFrame,
) -> JoinHandle<ExceptionStackFrame> {
    std::thread::spawn(move || {
        set_current_core(core_id);
        hv.handle_lower_el_sync(core_id, &mut frame);
        frame
    })
}

/// A core running guest code: it takes every interrupt sent to it, the
/// way the guest would be interrupted, until `stop` is set.
pub fn spawn_core(hv: &'static TestHypervisor, core_id: u32, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        set_current_core(core_id);
        while !stop.load(Ordering::SeqCst) {
            if hv.irq().gic().has_pending_irq(core_id) {
                let mut frame = ExceptionStackFrame {
                    elr_el2: GUEST_PC,
                    cntpct_el0: hv.timer().counter(),
                    ..Default::default()
                };
                hv.handle_lower_el_irq(core_id, &mut frame);
            } else {
                std::thread::yield_now();
            }
        }
    })
}
