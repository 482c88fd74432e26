//! Breakpoints and watchpoints: `z`, `Z`

use super::packet::parse_hex_list;
use super::{DebugTarget, GdbContext, Response, Transport};
use crate::debug::{Watchpoint, WatchpointDirection};
use crate::error::{Errno, Result};

impl<T: DebugTarget, X: Transport> GdbContext<'_, T, X> {
    /// `Ztype,addr,kind[;cond...]`. Conditions and commands are ignored.
    pub(super) fn toggle_stop_point(&mut self, insert: bool, args: &[u8]) -> Result<Response> {
        let (&kind, rest) = args.split_first().ok_or(Errno::Ilseq)?;
        let rest = rest.strip_prefix(b",").ok_or(Errno::Ilseq)?;
        let end = rest.iter().position(|&b| b == b';').unwrap_or(rest.len());
        let ([addr, size], _) = parse_hex_list::<2>(&rest[..end], None)?;

        let direction = match kind {
            b'2' => Some(WatchpointDirection::Store),
            b'3' => Some(WatchpointDirection::Load),
            b'4' => Some(WatchpointDirection::LoadStore),
            _ => None,
        };

        let target = self.target;
        let core_id = self.core_id;
        match (kind, direction) {
            (b'0', _) if insert => target.add_sw_breakpoint(core_id, addr, false)?,
            (b'0', _) => target.remove_sw_breakpoint(core_id, addr)?,
            (b'1', _) if insert => target.add_hw_breakpoint(core_id, addr)?,
            (b'1', _) => target.remove_hw_breakpoint(core_id, addr)?,
            (_, Some(direction)) => {
                let wp = Watchpoint {
                    addr,
                    size,
                    direction,
                };
                if insert {
                    target.add_watchpoint(core_id, wp)?;
                } else {
                    target.remove_watchpoint(core_id, wp)?;
                }
            }
            _ => return Ok(Response::Empty),
        }
        log::debug!(
            "gdb: {} stop point type {} at {:#x}",
            if insert { "set" } else { "cleared" },
            kind as char,
            addr
        );
        Ok(Response::Ok)
    }
}
