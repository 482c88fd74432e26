//! Threads are cores: `H`, `T` and the thread list queries

use core::fmt::Write;

use super::packet::parse_hex_u64;
use super::{cores_in, DebugTarget, GdbContext, Response, Transport};
use crate::error::{Errno, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ThreadId {
    /// `-1`
    All,
    /// `0`
    Any,
    Core(u32),
}

pub(super) fn parse_thread_id(src: &[u8]) -> Result<ThreadId> {
    match src {
        b"-1" => Ok(ThreadId::All),
        b"0" => Ok(ThreadId::Any),
        _ => {
            let tid = parse_hex_u64(src)?;
            let core_id = tid
                .checked_sub(1)
                .and_then(|id| u32::try_from(id).ok())
                .ok_or(Errno::Srch)?;
            if core_id >= u32::BITS {
                return Err(Errno::Srch);
            }
            Ok(ThreadId::Core(core_id))
        }
    }
}

impl<T: DebugTarget, X: Transport> GdbContext<'_, T, X> {
    fn attached_thread(&self, src: &[u8]) -> Result<ThreadId> {
        let thread = parse_thread_id(src)?;
        match thread {
            ThreadId::Core(id) if self.attached_cores & (1 << id) == 0 => Err(Errno::Srch),
            _ => Ok(thread),
        }
    }

    /// `Hg<tid>`, `Hc<tid>`
    pub(super) fn set_thread_id(&mut self, args: &[u8]) -> Result<Response> {
        let (&op, tid) = args.split_first().ok_or(Errno::Ilseq)?;
        let thread = self.attached_thread(tid)?;
        match (op, thread) {
            (b'g', ThreadId::Core(id)) => self.selected_core = Some(id),
            (b'g', _) => {}
            (b'c', ThreadId::Core(id)) => self.continue_core = Some(id),
            (b'c', _) => self.continue_core = None,
            _ => return Err(Errno::Ilseq),
        }
        Ok(Response::Ok)
    }

    /// `T<tid>`
    pub(super) fn is_thread_alive(&mut self, args: &[u8]) -> Result<Response> {
        match self.attached_thread(args)? {
            ThreadId::Core(_) => Ok(Response::Ok),
            _ => Err(Errno::Srch),
        }
    }

    /// `qfThreadInfo`
    pub(super) fn first_thread_info(&mut self) -> Result<Response> {
        self.reply.push(b'm');
        for (i, id) in cores_in(self.attached_cores).enumerate() {
            if i != 0 {
                self.reply.push(b',');
            }
            let _ = write!(self.reply, "{:x}", id + 1);
        }
        Ok(Response::Packet)
    }

    /// `qsThreadInfo`: everything fit in the first reply.
    pub(super) fn subsequent_thread_info(&mut self) -> Result<Response> {
        self.reply.push(b'l');
        Ok(Response::Packet)
    }

    /// `qC`
    pub(super) fn current_thread(&mut self) -> Result<Response> {
        let core_id = self.selected_core()?;
        let _ = write!(self.reply, "QC{:x}", core_id + 1);
        Ok(Response::Packet)
    }

    /// `qThreadExtraInfo,<tid>`
    pub(super) fn thread_extra_info(&mut self, args: &[u8]) -> Result<Response> {
        let ThreadId::Core(core_id) = self.attached_thread(args)? else {
            return Err(Errno::Srch);
        };
        let mut text = super::packet::PacketBuffer::<32>::new();
        let status = if self.target.debug_manager().is_paused(core_id) {
            "paused"
        } else {
            "running"
        };
        let _ = write!(text, "core {} ({})", core_id, status);
        self.reply.push_hex(text.as_bytes());
        Ok(Response::Packet)
    }
}
