//! General queries and settings: `q`, `Q`

use core::fmt::Write;

use super::packet::parse_hex_list;
use super::regs::TARGET_XML;
use super::{DebugTarget, GdbContext, Response, Transport};
use crate::error::{Errno, Result};
use crate::platform::GDB_BUF_LEN;

impl<T: DebugTarget, X: Transport> GdbContext<'_, T, X> {
    /// `q...`
    pub(super) fn query(&mut self, args: &[u8]) -> Result<Response> {
        let (name, rest) = split_query(args);
        match name {
            b"Supported" => self.supported(),
            b"Xfer" => self.xfer(rest),
            b"Attached" => {
                self.reply.push(b'1');
                Ok(Response::Packet)
            }
            b"C" => self.current_thread(),
            b"fThreadInfo" => self.first_thread_info(),
            b"sThreadInfo" => self.subsequent_thread_info(),
            b"ThreadExtraInfo" => self.thread_extra_info(rest),
            b"Symbol" => Ok(Response::Ok),
            _ => Ok(Response::Empty),
        }
    }

    /// `Q...`
    pub(super) fn set_query(&mut self, args: &[u8]) -> Result<Response> {
        let (name, rest) = split_query(args);
        match name {
            // Our ack for this packet is out already; the OK is the last
            // reply the debugger acknowledges.
            b"StartNoAckMode" => {
                self.no_ack = true;
                Ok(Response::Ok)
            }
            b"ThreadEvents" => {
                self.thread_events = match rest {
                    b"0" => false,
                    b"1" => true,
                    _ => return Err(Errno::Inval),
                };
                Ok(Response::Ok)
            }
            _ => Ok(Response::Empty),
        }
    }

    fn supported(&mut self) -> Result<Response> {
        let _ = write!(
            self.reply,
            "PacketSize={:x};qXfer:features:read+;QStartNoAckMode+;QThreadEvents+;\
             vContSupported+;swbreak+;hwbreak+",
            GDB_BUF_LEN
        );
        Ok(Response::Packet)
    }

    /// `qXfer:features:read:target.xml:offset,length`
    fn xfer(&mut self, args: &[u8]) -> Result<Response> {
        let Some(args) = args.strip_prefix(b"features:read:") else {
            return Ok(Response::Empty);
        };
        let annex_end = args.iter().position(|&b| b == b':').ok_or(Errno::Ilseq)?;
        if &args[..annex_end] != b"target.xml" {
            return Err(Errno::NoEnt);
        }
        let ([offset, length], _) = parse_hex_list::<2>(&args[annex_end + 1..], None)?;

        let xml = TARGET_XML.as_bytes();
        let start = usize::try_from(offset).map_err(|_| Errno::Inval)?.min(xml.len());
        // Escaping may double every byte.
        let max = (self.reply.remaining() - 1) / 2;
        let length = usize::try_from(length).unwrap_or(usize::MAX).min(max);
        let end = start.saturating_add(length).min(xml.len());

        self.reply.push(if end == xml.len() { b'l' } else { b'm' });
        self.reply.push_escaped(&xml[start..end]);
        Ok(Response::Packet)
    }
}

/// Split `Name[:,;]rest` at the first separator.
fn split_query(args: &[u8]) -> (&[u8], &[u8]) {
    match args.iter().position(|&b| matches!(b, b':' | b',' | b';')) {
        Some(i) => (&args[..i], &args[i + 1..]),
        None => (args, &[]),
    }
}
