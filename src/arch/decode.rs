//! ESR_EL2 syndrome decoding for trapped guest accesses
//!
//! Data aborts on emulated MMIO and MSR/MRS traps carry everything the
//! emulation needs in the ISS field; a few guest load/store forms are
//! decoded from the instruction itself when the syndrome is not valid.

/// Decoded load/store that caused a data abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAbortIss {
    /// Access size in bytes (1, 2, 4, 8)
    pub size: u8,
    /// Transfer register; 31 is XZR
    pub reg: u8,
    pub is_write: bool,
    pub sign_extend: bool,
    /// 64-bit register width
    pub sixty_four: bool,
}

impl DataAbortIss {
    /// Decode an ISS; falls back to the faulting instruction when ISV is 0.
    pub fn decode(iss: u32, insn: Option<u32>) -> Option<Self> {
        if (iss >> 24) & 1 == 0 {
            return insn.and_then(Self::decode_instruction);
        }

        let sas = (iss >> 22) & 0x3; // 00=byte, 01=half, 10=word, 11=double
        Some(Self {
            size: 1 << sas,
            reg: ((iss >> 16) & 0x1F) as u8,
            is_write: (iss >> 6) & 1 != 0,
            sign_extend: (iss >> 21) & 1 != 0,
            sixty_four: (iss >> 15) & 1 != 0,
        })
    }

    /// Load/store register (unsigned immediate): `xx|111|V|01|opc|imm12|Rn|Rt`,
    /// general-purpose registers only (V=0).
    fn decode_instruction(insn: u32) -> Option<Self> {
        if insn & 0x3F00_0000 != 0x3900_0000 {
            return None;
        }
        let size_bits = (insn >> 30) & 0x3;
        let opc = (insn >> 22) & 0x3;
        let rt = (insn & 0x1F) as u8;
        let (is_write, sign_extend, sixty_four) = match opc {
            0 => (true, false, size_bits == 3),
            1 => (false, false, size_bits == 3),
            2 => (false, true, true),
            _ => (false, true, false),
        };
        Some(Self {
            size: 1 << size_bits,
            reg: rt,
            is_write,
            sign_extend,
            sixty_four,
        })
    }

    /// Extend a value read from the device into the destination register width.
    pub fn extend(&self, value: u64) -> u64 {
        let bits = u32::from(self.size) * 8;
        if bits >= 64 {
            return value;
        }
        let value = value & ((1u64 << bits) - 1);
        let value = if self.sign_extend {
            let shift = 64 - bits;
            (((value << shift) as i64) >> shift) as u64
        } else {
            value
        };
        if self.sixty_four {
            value
        } else {
            value & 0xFFFF_FFFF
        }
    }
}

/// `MSR`/`MRS` trap syndrome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysregIss {
    /// Encoding with Rt and direction cleared, comparable with [`encode_sysreg_iss`].
    pub encoding: u32,
    pub reg: u8,
    pub is_read: bool,
}

/// Mask selecting Op0/Op2/Op1/CRn/CRm in an EC 0x18 ISS.
pub const SYSREG_ISS_ENCODING_MASK: u32 = 0x3F_FC1E;

/// Build the ISS pattern of a system register access.
pub const fn encode_sysreg_iss(op0: u32, op1: u32, crn: u32, crm: u32, op2: u32) -> u32 {
    (op0 << 20) | (op2 << 17) | (op1 << 14) | (crn << 10) | (crm << 1)
}

impl SysregIss {
    pub fn decode(iss: u32) -> Self {
        Self {
            encoding: iss & SYSREG_ISS_ENCODING_MASK,
            reg: ((iss >> 5) & 0x1F) as u8,
            is_read: iss & 1 != 0,
        }
    }

    pub fn op0(&self) -> u32 {
        (self.encoding >> 20) & 0x3
    }
}

/// Named system registers the hypervisor emulates or inspects.
pub mod sysreg {
    use super::encode_sysreg_iss as enc;

    pub const CNTPCT_EL0: u32 = enc(3, 3, 14, 0, 1);
    pub const CNTP_TVAL_EL0: u32 = enc(3, 3, 14, 2, 0);
    pub const CNTP_CTL_EL0: u32 = enc(3, 3, 14, 2, 1);
    pub const CNTP_CVAL_EL0: u32 = enc(3, 3, 14, 2, 2);

    pub const MDSCR_EL1: u32 = enc(2, 0, 0, 2, 2);
    pub const OSLAR_EL1: u32 = enc(2, 0, 1, 0, 4);
    pub const OSLSR_EL1: u32 = enc(2, 0, 1, 1, 4);

    pub const fn dbgbvr_el1(n: u32) -> u32 {
        enc(2, 0, 0, n, 4)
    }
    pub const fn dbgbcr_el1(n: u32) -> u32 {
        enc(2, 0, 0, n, 5)
    }
    pub const fn dbgwvr_el1(n: u32) -> u32 {
        enc(2, 0, 0, n, 6)
    }
    pub const fn dbgwcr_el1(n: u32) -> u32 {
        enc(2, 0, 0, n, 7)
    }
}
