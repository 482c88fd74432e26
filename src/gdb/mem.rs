//! Guest memory access: `m`, `M`, `X`

use super::packet::{decode_hex, parse_hex_list, unescape_binary};
use super::{DebugTarget, GdbContext, Response, Transport};
use crate::error::{Errno, Result};
use crate::platform::GDB_BUF_LEN;

/// Largest transfer whose hex encoding fits in one packet.
const MAX_TRANSFER: usize = GDB_BUF_LEN / 2;

fn transfer_len(len: u64) -> Result<usize> {
    usize::try_from(len)
        .ok()
        .filter(|&len| len <= MAX_TRANSFER)
        .ok_or(Errno::NoMem)
}

impl<T: DebugTarget, X: Transport> GdbContext<'_, T, X> {
    /// `m addr,length`. Partial reads return what could be read.
    pub(super) fn read_memory(&mut self, args: &[u8]) -> Result<Response> {
        let ([addr, len], _) = parse_hex_list::<2>(args, None)?;
        let len = transfer_len(len)?;
        let core_id = self.selected_core()?;

        let mut buf = [0u8; MAX_TRANSFER];
        let n = self.target.read_memory(core_id, addr, &mut buf[..len]);
        if n == 0 && len != 0 {
            return Err(Errno::Fault);
        }
        self.reply.push_hex(&buf[..n]);
        Ok(Response::Packet)
    }

    /// `M addr,length:XX...`
    pub(super) fn write_memory_hex(&mut self, args: &[u8]) -> Result<Response> {
        let ([addr, len], data) = parse_hex_list::<2>(args, Some(b':'))?;
        let len = transfer_len(len)?;
        let mut buf = [0u8; MAX_TRANSFER];
        if decode_hex(data, &mut buf)? != len {
            return Err(Errno::Inval);
        }
        self.write_all_memory(addr, &buf[..len])
    }

    /// `X addr,length:binary`
    pub(super) fn write_memory_binary(&mut self, args: &[u8]) -> Result<Response> {
        let ([addr, len], data) = parse_hex_list::<2>(args, Some(b':'))?;
        let len = transfer_len(len)?;
        let mut buf = [0u8; MAX_TRANSFER];
        if unescape_binary(data, &mut buf)? != len {
            return Err(Errno::Inval);
        }
        self.write_all_memory(addr, &buf[..len])
    }

    fn write_all_memory(&mut self, addr: u64, data: &[u8]) -> Result<Response> {
        let core_id = self.selected_core()?;
        if !data.is_empty() && self.target.write_memory(core_id, addr, data) != data.len() {
            return Err(Errno::Fault);
        }
        Ok(Response::Ok)
    }
}
