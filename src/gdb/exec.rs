//! Stop replies and execution control: `?`, `c`, `s`, `vCont`, `D`, `k`

use core::fmt::Write;

use super::packet::{parse_hex_list, parse_hex_u64};
use super::thread::{parse_thread_id, ThreadId};
use super::{cores_in, DebugTarget, GdbContext, Response, Transport};
use crate::debug::{DebugEventInfo, DebugEventKind, WatchpointDirection};
use crate::error::{Errno, Result};

const SIGINT: u8 = 2;
const SIGTRAP: u8 = 5;

impl<T: DebugTarget, X: Transport> GdbContext<'_, T, X> {
    /// Build the `T` stop reply for `event` and mark it reported.
    pub(super) fn stop_reply(&mut self, event: DebugEventInfo) -> Response {
        self.target.debug_manager().acknowledge_event(event.core_id);
        self.selected_core = Some(event.core_id);

        let signal = match event.kind {
            DebugEventKind::DebuggerBreak => SIGINT,
            _ => SIGTRAP,
        };
        self.reply.clear();
        // Overflow is caught when the reply is sent.
        let _ = write!(
            self.reply,
            "T{:02x}thread:{:x};core:{:x};",
            signal,
            event.core_id + 1,
            event.core_id
        );
        let _ = match event.kind {
            DebugEventKind::SwBreakpoint { .. } => write!(self.reply, "swbreak:;"),
            DebugEventKind::HwBreakpoint { .. } => write!(self.reply, "hwbreak:;"),
            DebugEventKind::Watchpoint { addr, direction } => {
                let name = match direction {
                    WatchpointDirection::Store => "watch",
                    WatchpointDirection::Load => "rwatch",
                    WatchpointDirection::LoadStore => "awatch",
                };
                write!(self.reply, "{}:{:x};", name, addr)
            }
            DebugEventKind::DebuggerBreak | DebugEventKind::SingleStep => Ok(()),
        };
        Response::Packet
    }

    /// Reply describing why the guest is stopped: the selected core's
    /// event if it has one, else the first event of any attached core.
    fn current_stop_reply(&mut self) -> Response {
        let debug = self.target.debug_manager();
        let event = self
            .selected_core
            .and_then(|id| debug.event(id))
            .or_else(|| debug.first_event(self.attached_cores));
        match event {
            Some(event) => self.stop_reply(event),
            None => {
                self.reply.clear();
                let _ = write!(self.reply, "S{:02x}", SIGTRAP);
                Response::Packet
            }
        }
    }

    /// `?`
    pub(super) fn get_stop_reason(&mut self) -> Result<Response> {
        Ok(self.current_stop_reply())
    }

    /// Resume `continue_mask` and single-step `step_mask`. Events the
    /// debugger has not seen yet are reported instead of resuming, the
    /// guest being stopped already.
    fn resume(&mut self, continue_mask: u32, step_mask: u32) -> Result<Response> {
        let debug = self.target.debug_manager();
        if let Some(event) = debug.first_unhandled_event(self.attached_cores) {
            return Ok(self.stop_reply(event));
        }

        let mask = (continue_mask | step_mask) & self.attached_cores;
        if mask == 0 {
            return Ok(self.current_stop_reply());
        }

        debug.clear_events(mask);
        self.waiting_for_stop = true;
        debug.unpause_cores(mask, step_mask & mask);
        log::trace!("gdb: resume {:#x} step {:#x}", mask, step_mask & mask);
        Ok(Response::NoReply)
    }

    /// `c [addr]`, `C sig[;addr]`, `s [addr]`, `S sig[;addr]`
    pub(super) fn legacy_resume(&mut self, cmd: u8, args: &[u8]) -> Result<Response> {
        let addr = match cmd {
            b'C' | b'S' => {
                let end = args.iter().position(|&b| b == b';');
                let sig = &args[..end.unwrap_or(args.len())];
                // Signals are not delivered to the guest.
                parse_hex_u64(sig)?;
                end.map(|e| &args[e + 1..]).unwrap_or(&[])
            }
            _ => args,
        };

        let stepped = self.continue_core.or(self.selected_core).ok_or(Errno::Srch)?;
        if !addr.is_empty() {
            let pc = parse_hex_u64(addr)?;
            let core_id = if matches!(cmd, b's' | b'S') {
                stepped
            } else {
                self.selected_core()?
            };
            self.with_parked_core(core_id, |frame, _| frame.set_pc(pc))?;
        }

        if matches!(cmd, b's' | b'S') {
            self.target.core(stepped).set_stepping_range(0, 0);
            self.resume(0, 1 << stepped)
        } else {
            self.resume(self.attached_cores, 0)
        }
    }

    /// `vCont;action[:thread]...`. For each core the leftmost matching
    /// action applies; cores no action matches stay stopped.
    fn vcont(&mut self, args: &[u8]) -> Result<Response> {
        let actions = args.strip_prefix(b";").ok_or(Errno::Ilseq)?;
        let mut remaining = self.attached_cores;
        let mut continue_mask = 0;
        let mut step_mask = 0;

        for action in actions.split(|&b| b == b';') {
            let (action, thread) = match action.iter().position(|&b| b == b':') {
                Some(i) => (&action[..i], Some(&action[i + 1..])),
                None => (action, None),
            };
            let mask = match thread {
                None => remaining,
                Some(tid) => match parse_thread_id(tid)? {
                    ThreadId::All => remaining,
                    ThreadId::Any => self.selected_core().map(|id| 1 << id)? & remaining,
                    ThreadId::Core(id) => (1 << id) & remaining,
                },
            };

            let (&op, rest) = action.split_first().ok_or(Errno::Ilseq)?;
            match op {
                b'c' => continue_mask |= mask,
                b'C' => {
                    parse_hex_u64(rest)?;
                    continue_mask |= mask;
                }
                b's' | b'S' => {
                    if op == b'S' {
                        parse_hex_u64(rest)?;
                    }
                    for id in cores_in(mask) {
                        self.target.core(id).set_stepping_range(0, 0);
                    }
                    step_mask |= mask;
                }
                b'r' => {
                    let ([start, end], _) = parse_hex_list::<2>(rest, None)?;
                    for id in cores_in(mask) {
                        self.target.core(id).set_stepping_range(start, end);
                    }
                    step_mask |= mask;
                }
                // Stopped already.
                b't' => {}
                _ => return Err(Errno::Ilseq),
            }
            remaining &= !mask;
        }

        self.resume(continue_mask, step_mask)
    }

    /// `v...`
    pub(super) fn verbose(&mut self, args: &[u8]) -> Result<Response> {
        if args == b"Cont?" {
            self.reply.extend(b"vCont;c;C;s;S;t;r");
            Ok(Response::Packet)
        } else if let Some(rest) = args.strip_prefix(b"Cont") {
            self.vcont(rest)
        } else if args.starts_with(b"Kill") {
            self.send_packet(b"OK");
            self.detach();
            Ok(Response::NoReply)
        } else {
            Ok(Response::Empty)
        }
    }

    /// `D`: acknowledge first, the connection is gone afterwards.
    pub(super) fn detach_command(&mut self) -> Result<Response> {
        self.send_packet(b"OK");
        self.detach();
        Ok(Response::NoReply)
    }

    /// `k`: there is nothing to kill, the guest just runs on undebugged.
    pub(super) fn kill(&mut self) -> Result<Response> {
        self.detach();
        Ok(Response::NoReply)
    }
}
