//! GDB remote serial protocol stub
//!
//! All-stop only: a debug event on any core stops every attached core, and
//! resuming always starts from a fully stopped guest. Threads are cores,
//! thread id = core id + 1.
//!
//! The stub runs from interrupt bottom halves (transport input, debug event
//! notifications) on whichever core takes them. Registers of a core are
//! only touched while that core is parked in [`DebugManager::handle_pause`].

mod exec;
mod mem;
pub mod packet;
mod query;
pub mod regs;
mod stop_points;
pub mod task;
mod thread;

use crate::arch::{ExceptionStackFrame, FpuRegisters};
use crate::core_ctx::CoreContext;
use crate::debug::{DebugManager, Watchpoint};
use crate::error::{Errno, Result};
use crate::irq_manager::SgiSender;
use crate::platform::GDB_BUF_LEN;
use crate::sync::wait_for_event;
use packet::{PacketBuffer, PacketReceiver, RxEvent};

pub use task::GdbTransportTask;

const TX_BUF_LEN: usize = GDB_BUF_LEN + 4;

/// Byte stream to the debugger.
pub trait Transport: Sync {
    /// Next received byte, if one is available.
    fn read_byte(&self) -> Option<u8>;
    fn write_all(&self, data: &[u8]);
    /// Gate the receive interrupt while input is being processed.
    fn set_rx_interrupt_enabled(&self, _enabled: bool) {}
}

/// What the stub needs from the hypervisor.
pub trait DebugTarget: Sync {
    fn active_core_mask(&self) -> u32;
    fn core(&self, core_id: u32) -> &CoreContext;
    fn debug_manager(&self) -> &DebugManager;
    fn sgi(&self) -> &dyn SgiSender;

    /// Guest virtual memory, translated on `core_id`. Returns the number of
    /// bytes transferred.
    fn read_memory(&self, core_id: u32, addr: u64, buf: &mut [u8]) -> usize;
    fn write_memory(&self, core_id: u32, addr: u64, data: &[u8]) -> usize;

    fn add_sw_breakpoint(&self, core_id: u32, addr: u64, persistent: bool) -> Result<()>;
    fn remove_sw_breakpoint(&self, core_id: u32, addr: u64) -> Result<()>;
    fn add_hw_breakpoint(&self, core_id: u32, addr: u64) -> Result<()>;
    fn remove_hw_breakpoint(&self, core_id: u32, addr: u64) -> Result<()>;
    fn add_watchpoint(&self, core_id: u32, wp: Watchpoint) -> Result<()>;
    fn remove_watchpoint(&self, core_id: u32, wp: Watchpoint) -> Result<()>;

    /// Drop watchpoints, hardware breakpoints and the software breakpoints
    /// not marked persistent.
    fn remove_all_stop_points(&self, core_id: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Disconnected,
    Connected,
    Attached,
    Detaching,
}

/// How a command handler wants to be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Response {
    /// Send the reply buffer.
    Packet,
    Ok,
    /// Not supported.
    Empty,
    /// The guest is running, the answer comes later as a stop reply.
    NoReply,
}

pub struct GdbContext<'t, T, X> {
    target: &'t T,
    transport: &'t X,
    state: State,
    /// Core running the stub right now.
    core_id: u32,
    attached_cores: u32,
    /// `Hg`: core whose registers are accessed.
    selected_core: Option<u32>,
    /// `Hc`: core stepped by `s`; `None` is the selected core.
    continue_core: Option<u32>,
    no_ack: bool,
    thread_events: bool,
    waiting_for_stop: bool,
    rx: PacketReceiver<GDB_BUF_LEN>,
    reply: PacketBuffer<GDB_BUF_LEN>,
    /// Last framed packet, replayed on nack.
    tx: PacketBuffer<TX_BUF_LEN>,
}

impl<'t, T: DebugTarget, X: Transport> GdbContext<'t, T, X> {
    pub const fn new(target: &'t T, transport: &'t X) -> Self {
        Self {
            target,
            transport,
            state: State::Disconnected,
            core_id: 0,
            attached_cores: 0,
            selected_core: None,
            continue_core: None,
            no_ack: false,
            thread_events: false,
            waiting_for_stop: false,
            rx: PacketReceiver::new(),
            reply: PacketBuffer::new(),
            tx: PacketBuffer::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn attached_cores(&self) -> u32 {
        self.attached_cores
    }

    /// `QThreadEvents` as last set by the debugger. Cores never come or go
    /// while attached, so there is nothing to report either way.
    pub fn thread_events_enabled(&self) -> bool {
        self.thread_events
    }

    /// The guest was resumed and no stop has been reported since.
    pub fn is_waiting_for_stop(&self) -> bool {
        self.waiting_for_stop
    }

    /// Drain the transport. Returns false if input was left unread because
    /// this core has to park before the next command may run.
    pub fn handle_input(&mut self, core_id: u32) -> bool {
        self.core_id = core_id;
        loop {
            if self.rx.is_idle() && self.must_park_first() {
                return false;
            }
            let Some(b) = self.transport.read_byte() else {
                return true;
            };
            if self.state == State::Disconnected {
                self.state = State::Connected;
            }

            match self.rx.push(b) {
                RxEvent::None | RxEvent::Ack => {}
                RxEvent::Nack => {
                    if !self.no_ack && !self.tx.is_empty() {
                        self.transport.write_all(self.tx.as_bytes());
                    }
                }
                RxEvent::Interrupt => self.interrupt(),
                RxEvent::Packet { valid: false } => {
                    log::debug!("gdb: bad packet checksum");
                    if !self.no_ack {
                        self.transport.write_all(b"-");
                    }
                }
                RxEvent::Packet { valid: true } => {
                    if !self.no_ack {
                        self.transport.write_all(b"+");
                    }
                    let mut packet = [0u8; GDB_BUF_LEN];
                    let len = self.rx.payload().len();
                    packet[..len].copy_from_slice(self.rx.payload());
                    if self.state < State::Attached {
                        self.attach();
                    }
                    self.process_packet(&packet[..len]);
                }
            }
        }
    }

    /// Report the first debug event the debugger has not seen, if the
    /// guest is running from its point of view.
    pub fn poll_debug_events(&mut self, core_id: u32) {
        self.core_id = core_id;
        if self.state != State::Attached || !self.waiting_for_stop {
            return;
        }
        let debug = self.target.debug_manager();
        if let Some(event) = debug.first_unhandled_event(self.attached_cores) {
            self.waiting_for_stop = false;
            self.reply.clear();
            let response = self.stop_reply(event);
            self.send_response(response);
        }
    }

    /// Commands may touch this core's registers, so once the guest is
    /// stopped they wait until the core has actually parked.
    fn must_park_first(&self) -> bool {
        self.state == State::Attached
            && self.target.debug_manager().is_paused(self.core_id)
            && !self.target.core(self.core_id).was_paused()
    }

    fn attach(&mut self) {
        let mask = self.target.active_core_mask();
        let debug = self.target.debug_manager();

        self.attached_cores = mask;
        debug.set_reporting_enabled(true);
        debug.record_debugger_break(mask);
        for id in cores_in(mask) {
            debug.acknowledge_event(id);
        }
        debug.pause_cores(mask, self.core_id, self.target.sgi());

        self.selected_core = cores_in(mask).next();
        self.continue_core = None;
        self.waiting_for_stop = false;
        self.state = State::Attached;
        log::info!("gdb: attached to cores {:#x}", mask);
    }

    fn detach(&mut self) {
        self.state = State::Detaching;
        let debug = self.target.debug_manager();

        self.target.remove_all_stop_points(self.core_id);
        debug.set_reporting_enabled(false);
        debug.clear_events(self.attached_cores);
        for id in cores_in(self.attached_cores) {
            self.target.core(id).set_stepping_range(0, 0);
        }
        debug.unpause_cores(self.target.active_core_mask() | self.attached_cores, 0);

        log::info!("gdb: detached");
        self.attached_cores = 0;
        self.selected_core = None;
        self.continue_core = None;
        self.waiting_for_stop = false;
        self.no_ack = false;
        self.thread_events = false;
        self.rx.reset();
        self.state = State::Disconnected;
    }

    /// Ctrl-C
    fn interrupt(&mut self) {
        if self.state < State::Attached {
            self.attach();
        } else if self.state == State::Attached && self.waiting_for_stop {
            self.target
                .debug_manager()
                .break_cores(self.attached_cores, self.core_id, self.target.sgi());
        }
    }

    fn process_packet(&mut self, packet: &[u8]) {
        self.reply.clear();
        let Some((&cmd, args)) = packet.split_first() else {
            self.send_packet(b"");
            return;
        };

        let result = match cmd {
            b'?' => self.get_stop_reason(),
            b'c' | b'C' | b's' | b'S' => self.legacy_resume(cmd, args),
            b'D' => self.detach_command(),
            b'g' => self.read_registers(),
            b'G' => self.write_registers(args),
            b'H' => self.set_thread_id(args),
            b'k' => self.kill(),
            b'm' => self.read_memory(args),
            b'M' => self.write_memory_hex(args),
            b'p' => self.read_one_register(args),
            b'P' => self.write_one_register(args),
            b'q' => self.query(args),
            b'Q' => self.set_query(args),
            b'T' => self.is_thread_alive(args),
            b'v' => self.verbose(args),
            b'X' => self.write_memory_binary(args),
            b'z' => self.toggle_stop_point(false, args),
            b'Z' => self.toggle_stop_point(true, args),
            // File-I/O replies and anything else
            _ => Ok(Response::Empty),
        };

        match result {
            Ok(response) => self.send_response(response),
            Err(e) => {
                log::debug!("gdb: '{}' failed: {}", cmd as char, e);
                self.send_error(e);
            }
        }
    }

    fn send_response(&mut self, response: Response) {
        match response {
            Response::Packet if self.reply.overflowed() => self.send_error(Errno::NoMem),
            Response::Packet => {
                self.tx.frame(self.reply.as_bytes());
                self.transport.write_all(self.tx.as_bytes());
            }
            Response::Ok => self.send_packet(b"OK"),
            Response::Empty => self.send_packet(b""),
            Response::NoReply => {}
        }
    }

    fn send_packet(&mut self, payload: &[u8]) {
        self.tx.frame(payload);
        self.transport.write_all(self.tx.as_bytes());
    }

    fn send_error(&mut self, e: Errno) {
        let code = e.code();
        let payload = [b'E', packet::HEX[usize::from(code >> 4)], packet::HEX[usize::from(code & 0xF)]];
        self.send_packet(&payload);
    }

    fn selected_core(&self) -> Result<u32> {
        self.selected_core.ok_or(Errno::Srch)
    }

    /// Run `f` on the saved state of a parked core.
    fn with_parked_core<R>(
        &self,
        core_id: u32,
        f: impl FnOnce(&mut ExceptionStackFrame, &mut FpuRegisters) -> R,
    ) -> Result<R> {
        if self.attached_cores & (1 << core_id) == 0 {
            return Err(Errno::Srch);
        }
        assert!(
            self.target.debug_manager().is_paused(core_id),
            "gdb: register access to running core {}",
            core_id
        );
        let core = self.target.core(core_id);
        // Paused cores park as soon as they take the pause request.
        while !core.was_paused() {
            wait_for_event();
        }

        // SAFETY: the core stays parked until the stub resumes it, and the
        // stub is serialized by its task lock.
        let Some(frame) = (unsafe { core.guest_frame_mut() }) else {
            panic!("gdb: core {} parked without a guest frame", core_id);
        };
        let mut fpu = core.fpu().lock();
        Ok(f(frame, &mut *fpu))
    }
}

/// Core ids set in `mask`, lowest first.
fn cores_in(mask: u32) -> impl Iterator<Item = u32> {
    (0..u32::BITS).filter(move |id| mask & (1 << id) != 0)
}
