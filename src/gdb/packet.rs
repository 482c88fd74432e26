//! RSP framing, hex and binary encodings

use core::fmt;

use crate::error::{Errno, Result};

pub const HEX: &[u8; 16] = b"0123456789abcdef";

/// Ctrl-C, sent unframed to interrupt the target.
pub const INTERRUPT: u8 = 0x03;

/// Bytes that must be escaped in binary data.
const ESCAPE: u8 = b'}';

pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

pub fn from_hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(10 + b - b'a'),
        b'A'..=b'F' => Some(10 + b - b'A'),
        _ => None,
    }
}

pub fn decode_hex_byte(hi: u8, lo: u8) -> Option<u8> {
    Some(from_hex_digit(hi)? << 4 | from_hex_digit(lo)?)
}

/// Hex-encode `src` into `dst`; returns the number of characters written.
pub fn encode_hex(src: &[u8], dst: &mut [u8]) -> usize {
    let mut n = 0;
    for (&b, out) in src.iter().zip(dst.chunks_exact_mut(2)) {
        out[0] = HEX[usize::from(b >> 4)];
        out[1] = HEX[usize::from(b & 0xF)];
        n += 2;
    }
    n
}

/// Decode hex `src` into `dst`; returns the number of bytes produced.
pub fn decode_hex(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    if src.len() % 2 != 0 {
        return Err(Errno::Ilseq);
    }
    if src.len() / 2 > dst.len() {
        return Err(Errno::NoMem);
    }
    for (pair, out) in src.chunks_exact(2).zip(dst.iter_mut()) {
        *out = decode_hex_byte(pair[0], pair[1]).ok_or(Errno::Ilseq)?;
    }
    Ok(src.len() / 2)
}

pub fn parse_hex_u64(src: &[u8]) -> Result<u64> {
    if src.is_empty() || src.len() > 16 {
        return Err(Errno::Ilseq);
    }
    src.iter().try_fold(0u64, |acc, &b| {
        let digit = from_hex_digit(b).ok_or(Errno::Ilseq)?;
        Ok(acc << 4 | u64::from(digit))
    })
}

/// Parse `N` comma-separated hex integers. The last field ends at
/// `terminator` (or at the end of input when `None`); the rest of the
/// input is returned.
pub fn parse_hex_list<'a, const N: usize>(
    src: &'a [u8],
    terminator: Option<u8>,
) -> Result<([u64; N], &'a [u8])> {
    let mut out = [0u64; N];
    let mut rest = src;
    for (i, slot) in out.iter_mut().enumerate() {
        let end = if i + 1 < N {
            rest.iter().position(|&b| b == b',').ok_or(Errno::Ilseq)?
        } else {
            match terminator {
                Some(t) => rest.iter().position(|&b| b == t).ok_or(Errno::Ilseq)?,
                None => rest.len(),
            }
        };
        *slot = parse_hex_u64(&rest[..end])?;
        rest = rest.get(end + 1..).unwrap_or(&[]);
    }
    Ok((out, rest))
}

/// Undo RSP binary escaping; returns the number of bytes produced.
pub fn unescape_binary(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    let mut n = 0;
    let mut bytes = src.iter();
    while let Some(&b) = bytes.next() {
        let value = if b == ESCAPE {
            bytes.next().ok_or(Errno::Ilseq)? ^ 0x20
        } else {
            b
        };
        *dst.get_mut(n).ok_or(Errno::NoMem)? = value;
        n += 1;
    }
    Ok(n)
}

fn needs_escape(b: u8) -> bool {
    matches!(b, b'$' | b'#' | b'}' | b'*')
}

/// Fixed-capacity byte buffer for packet payloads.
pub struct PacketBuffer<const N: usize> {
    buf: [u8; N],
    len: usize,
    overflow: bool,
}

impl<const N: usize> PacketBuffer<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            overflow: false,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.overflow = false;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        N - self.len
    }

    /// Whether something was dropped for lack of space.
    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    pub fn push(&mut self, b: u8) {
        if self.len < N {
            self.buf[self.len] = b;
            self.len += 1;
        } else {
            self.overflow = true;
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        for &b in data {
            self.push(b);
        }
    }

    pub fn push_hex(&mut self, data: &[u8]) {
        for &b in data {
            self.push(HEX[usize::from(b >> 4)]);
            self.push(HEX[usize::from(b & 0xF)]);
        }
    }

    /// Append `data` with binary escaping.
    pub fn push_escaped(&mut self, data: &[u8]) {
        for &b in data {
            if needs_escape(b) {
                self.push(ESCAPE);
                self.push(b ^ 0x20);
            } else {
                self.push(b);
            }
        }
    }

    /// Replace the contents with `$payload#cc`.
    pub fn frame(&mut self, payload: &[u8]) {
        self.clear();
        self.push(b'$');
        self.extend(payload);
        self.push(b'#');
        let sum = checksum(payload);
        self.push(HEX[usize::from(sum >> 4)]);
        self.push(HEX[usize::from(sum & 0xF)]);
    }
}

impl<const N: usize> Default for PacketBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for PacketBuffer<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.extend(s.as_bytes());
        if self.overflow {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

/// What a received byte completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxEvent {
    None,
    Ack,
    Nack,
    Interrupt,
    /// A full packet is in the receive buffer; `valid` reflects the checksum.
    Packet { valid: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    Payload,
    Checksum { hi: Option<u8> },
}

/// Incremental receiver: bytes arrive a few at a time from interrupts.
pub struct PacketReceiver<const N: usize> {
    state: RxState,
    payload: PacketBuffer<N>,
}

impl<const N: usize> PacketReceiver<N> {
    pub const fn new() -> Self {
        Self {
            state: RxState::Idle,
            payload: PacketBuffer::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = RxState::Idle;
        self.payload.clear();
    }

    /// Between packets.
    pub fn is_idle(&self) -> bool {
        self.state == RxState::Idle
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    pub fn push(&mut self, b: u8) -> RxEvent {
        match self.state {
            RxState::Idle => match b {
                b'$' => {
                    self.payload.clear();
                    self.state = RxState::Payload;
                    RxEvent::None
                }
                b'+' => RxEvent::Ack,
                b'-' => RxEvent::Nack,
                INTERRUPT => RxEvent::Interrupt,
                _ => RxEvent::None,
            },
            RxState::Payload => {
                match b {
                    b'#' => self.state = RxState::Checksum { hi: None },
                    // Lost the end of the previous packet: start over.
                    b'$' => self.payload.clear(),
                    _ => self.payload.push(b),
                }
                RxEvent::None
            }
            RxState::Checksum { hi: None } => {
                self.state = RxState::Checksum { hi: Some(b) };
                RxEvent::None
            }
            RxState::Checksum { hi: Some(hi) } => {
                self.state = RxState::Idle;
                let valid = !self.payload.overflowed()
                    && decode_hex_byte(hi, b) == Some(checksum(self.payload.as_bytes()));
                RxEvent::Packet { valid }
            }
        }
    }
}

impl<const N: usize> Default for PacketReceiver<N> {
    fn default() -> Self {
        Self::new()
    }
}
