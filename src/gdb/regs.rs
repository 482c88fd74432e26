//! Register access (`g`, `G`, `p`, `P`) and the target description
//!
//! Register numbers follow `target.xml`:
//! x0-x30, sp, pc, cpsr, v0-v31, fpsr, fpcr.

use super::{DebugTarget, GdbContext, Response, Transport};
use crate::arch::{ExceptionStackFrame, FpuRegisters};
use crate::error::{Errno, Result};
use crate::gdb::packet::{decode_hex, parse_hex_u64};

pub const REG_SP: usize = 31;
pub const REG_PC: usize = 32;
pub const REG_CPSR: usize = 33;
pub const REG_V0: usize = 34;
pub const REG_FPSR: usize = REG_V0 + 32;
pub const REG_FPCR: usize = REG_FPSR + 1;
pub const NUM_REGS: usize = REG_FPCR + 1;

/// Size of the `g` packet, in bytes.
pub const G_PACKET_BYTES: usize = 31 * 8 + 8 + 8 + 4 + 32 * 16 + 4 + 4;

pub const TARGET_XML: &str = r#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target version="1.0">
<architecture>aarch64</architecture>
<feature name="org.gnu.gdb.aarch64.core">
<reg name="x0" bitsize="64"/>
<reg name="x1" bitsize="64"/>
<reg name="x2" bitsize="64"/>
<reg name="x3" bitsize="64"/>
<reg name="x4" bitsize="64"/>
<reg name="x5" bitsize="64"/>
<reg name="x6" bitsize="64"/>
<reg name="x7" bitsize="64"/>
<reg name="x8" bitsize="64"/>
<reg name="x9" bitsize="64"/>
<reg name="x10" bitsize="64"/>
<reg name="x11" bitsize="64"/>
<reg name="x12" bitsize="64"/>
<reg name="x13" bitsize="64"/>
<reg name="x14" bitsize="64"/>
<reg name="x15" bitsize="64"/>
<reg name="x16" bitsize="64"/>
<reg name="x17" bitsize="64"/>
<reg name="x18" bitsize="64"/>
<reg name="x19" bitsize="64"/>
<reg name="x20" bitsize="64"/>
<reg name="x21" bitsize="64"/>
<reg name="x22" bitsize="64"/>
<reg name="x23" bitsize="64"/>
<reg name="x24" bitsize="64"/>
<reg name="x25" bitsize="64"/>
<reg name="x26" bitsize="64"/>
<reg name="x27" bitsize="64"/>
<reg name="x28" bitsize="64"/>
<reg name="x29" bitsize="64"/>
<reg name="x30" bitsize="64"/>
<reg name="sp" bitsize="64" type="data_ptr"/>
<reg name="pc" bitsize="64" type="code_ptr"/>
<reg name="cpsr" bitsize="32"/>
</feature>
<feature name="org.gnu.gdb.aarch64.fpu">
<vector id="v2d" type="ieee_double" count="2"/>
<vector id="v2u" type="uint64" count="2"/>
<vector id="v2i" type="int64" count="2"/>
<vector id="v4f" type="ieee_single" count="4"/>
<vector id="v4u" type="uint32" count="4"/>
<vector id="v4i" type="int32" count="4"/>
<vector id="v8u" type="uint16" count="8"/>
<vector id="v8i" type="int16" count="8"/>
<vector id="v16u" type="uint8" count="16"/>
<vector id="v16i" type="int8" count="16"/>
<vector id="v1u" type="uint128" count="1"/>
<vector id="v1i" type="int128" count="1"/>
<union id="vnd"><field name="f" type="v2d"/><field name="u" type="v2u"/><field name="s" type="v2i"/></union>
<union id="vns"><field name="f" type="v4f"/><field name="u" type="v4u"/><field name="s" type="v4i"/></union>
<union id="vnh"><field name="u" type="v8u"/><field name="s" type="v8i"/></union>
<union id="vnb"><field name="u" type="v16u"/><field name="s" type="v16i"/></union>
<union id="vnq"><field name="u" type="v1u"/><field name="s" type="v1i"/></union>
<union id="aarch64v"><field name="d" type="vnd"/><field name="s" type="vns"/><field name="h" type="vnh"/><field name="b" type="vnb"/><field name="q" type="vnq"/></union>
<reg name="v0" bitsize="128" type="aarch64v" regnum="34"/>
<reg name="v1" bitsize="128" type="aarch64v"/>
<reg name="v2" bitsize="128" type="aarch64v"/>
<reg name="v3" bitsize="128" type="aarch64v"/>
<reg name="v4" bitsize="128" type="aarch64v"/>
<reg name="v5" bitsize="128" type="aarch64v"/>
<reg name="v6" bitsize="128" type="aarch64v"/>
<reg name="v7" bitsize="128" type="aarch64v"/>
<reg name="v8" bitsize="128" type="aarch64v"/>
<reg name="v9" bitsize="128" type="aarch64v"/>
<reg name="v10" bitsize="128" type="aarch64v"/>
<reg name="v11" bitsize="128" type="aarch64v"/>
<reg name="v12" bitsize="128" type="aarch64v"/>
<reg name="v13" bitsize="128" type="aarch64v"/>
<reg name="v14" bitsize="128" type="aarch64v"/>
<reg name="v15" bitsize="128" type="aarch64v"/>
<reg name="v16" bitsize="128" type="aarch64v"/>
<reg name="v17" bitsize="128" type="aarch64v"/>
<reg name="v18" bitsize="128" type="aarch64v"/>
<reg name="v19" bitsize="128" type="aarch64v"/>
<reg name="v20" bitsize="128" type="aarch64v"/>
<reg name="v21" bitsize="128" type="aarch64v"/>
<reg name="v22" bitsize="128" type="aarch64v"/>
<reg name="v23" bitsize="128" type="aarch64v"/>
<reg name="v24" bitsize="128" type="aarch64v"/>
<reg name="v25" bitsize="128" type="aarch64v"/>
<reg name="v26" bitsize="128" type="aarch64v"/>
<reg name="v27" bitsize="128" type="aarch64v"/>
<reg name="v28" bitsize="128" type="aarch64v"/>
<reg name="v29" bitsize="128" type="aarch64v"/>
<reg name="v30" bitsize="128" type="aarch64v"/>
<reg name="v31" bitsize="128" type="aarch64v"/>
<reg name="fpsr" bitsize="32"/>
<reg name="fpcr" bitsize="32"/>
</feature>
</target>
"#;

/// Width of register `n` in bytes.
pub fn register_size(n: usize) -> Option<usize> {
    match n {
        0..=REG_PC => Some(8),
        REG_CPSR => Some(4),
        n if (REG_V0..REG_FPSR).contains(&n) => Some(16),
        REG_FPSR | REG_FPCR => Some(4),
        _ => None,
    }
}

/// Serialize register `n` (target byte order) into `out`; returns its size.
pub fn read_register(
    frame: &ExceptionStackFrame,
    fpu: &FpuRegisters,
    n: usize,
    out: &mut [u8],
) -> Option<usize> {
    let size = register_size(n)?;
    let out = out.get_mut(..size)?;
    match n {
        0..=30 => out.copy_from_slice(&frame.x[n].to_le_bytes()),
        REG_SP => out.copy_from_slice(&frame.guest_sp().to_le_bytes()),
        REG_PC => out.copy_from_slice(&frame.pc().to_le_bytes()),
        REG_CPSR => out.copy_from_slice(&(frame.spsr_el2 as u32).to_le_bytes()),
        REG_FPSR => out.copy_from_slice(&fpu.fpsr.to_le_bytes()),
        REG_FPCR => out.copy_from_slice(&fpu.fpcr.to_le_bytes()),
        _ => out.copy_from_slice(&fpu.q[n - REG_V0].to_le_bytes()),
    }
    Some(size)
}

/// Store register `n` from `data`, which must be exactly its size.
pub fn write_register(
    frame: &mut ExceptionStackFrame,
    fpu: &mut FpuRegisters,
    n: usize,
    data: &[u8],
) -> Result<()> {
    let size = register_size(n).ok_or(Errno::Inval)?;
    if data.len() != size {
        return Err(Errno::Inval);
    }
    let mut wide = [0u8; 16];
    wide[..size].copy_from_slice(data);
    let lo = u64::from_le_bytes([
        wide[0], wide[1], wide[2], wide[3], wide[4], wide[5], wide[6], wide[7],
    ]);
    match n {
        0..=30 => frame.x[n] = lo,
        REG_SP => frame.set_guest_sp(lo),
        REG_PC => frame.set_pc(lo),
        // Only the low 32 bits are exposed.
        REG_CPSR => frame.spsr_el2 = (frame.spsr_el2 & !0xFFFF_FFFF) | (lo & 0xFFFF_FFFF),
        REG_FPSR => fpu.fpsr = lo as u32,
        REG_FPCR => fpu.fpcr = lo as u32,
        _ => fpu.q[n - REG_V0] = u128::from_le_bytes(wide),
    }
    Ok(())
}

impl<T: DebugTarget, X: Transport> GdbContext<'_, T, X> {
    /// `g`
    pub(super) fn read_registers(&mut self) -> Result<Response> {
        let core_id = self.selected_core()?;
        let mut raw = [0u8; G_PACKET_BYTES];
        self.with_parked_core(core_id, |frame, fpu| {
            let mut off = 0;
            for n in 0..NUM_REGS {
                // Every number below NUM_REGS has a size.
                off += read_register(frame, fpu, n, &mut raw[off..]).unwrap_or(0);
            }
        })?;
        self.reply.push_hex(&raw);
        Ok(Response::Packet)
    }

    /// `G XX...`
    pub(super) fn write_registers(&mut self, args: &[u8]) -> Result<Response> {
        let core_id = self.selected_core()?;
        let mut raw = [0u8; G_PACKET_BYTES];
        if decode_hex(args, &mut raw)? != G_PACKET_BYTES {
            return Err(Errno::Inval);
        }
        self.with_parked_core(core_id, |frame, fpu| {
            let mut off = 0;
            for n in 0..NUM_REGS {
                let size = register_size(n).unwrap_or(0);
                write_register(frame, fpu, n, &raw[off..off + size])?;
                off += size;
            }
            Ok(())
        })??;
        Ok(Response::Ok)
    }

    /// `p n`
    pub(super) fn read_one_register(&mut self, args: &[u8]) -> Result<Response> {
        let n = parse_hex_u64(args)? as usize;
        register_size(n).ok_or(Errno::Inval)?;
        let core_id = self.selected_core()?;
        let mut raw = [0u8; 16];
        let size = self
            .with_parked_core(core_id, |frame, fpu| read_register(frame, fpu, n, &mut raw))?
            .ok_or(Errno::Inval)?;
        self.reply.push_hex(&raw[..size]);
        Ok(Response::Packet)
    }

    /// `P n=XX...`
    pub(super) fn write_one_register(&mut self, args: &[u8]) -> Result<Response> {
        let eq = args.iter().position(|&b| b == b'=').ok_or(Errno::Ilseq)?;
        let n = parse_hex_u64(&args[..eq])? as usize;
        let size = register_size(n).ok_or(Errno::Inval)?;
        let mut raw = [0u8; 16];
        if decode_hex(&args[eq + 1..], &mut raw)? != size {
            return Err(Errno::Inval);
        }
        let core_id = self.selected_core()?;
        self.with_parked_core(core_id, |frame, fpu| {
            write_register(frame, fpu, n, &raw[..size])
        })??;
        Ok(Response::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_sizes_add_up() {
        let total: usize = (0..NUM_REGS).map(|n| register_size(n).unwrap()).sum();
        assert_eq!(total, G_PACKET_BYTES);
        assert_eq!(register_size(NUM_REGS), None);
    }

    #[test]
    fn test_cpsr_is_32_bits() {
        let mut frame = ExceptionStackFrame {
            spsr_el2: 0x1_2000_03C5,
            ..Default::default()
        };
        let mut fpu = FpuRegisters::zeroed();
        let mut out = [0u8; 16];
        assert_eq!(read_register(&frame, &fpu, REG_CPSR, &mut out), Some(4));
        assert_eq!(&out[..4], &0x2000_03C5u32.to_le_bytes());
        write_register(&mut frame, &mut fpu, REG_CPSR, &0x3C4u32.to_le_bytes()).unwrap();
        assert_eq!(frame.spsr_el2, 0x1_0000_03C4);
    }

    #[test]
    fn test_vector_register_round_trip() {
        let mut frame = ExceptionStackFrame::default();
        let mut fpu = FpuRegisters::zeroed();
        let value = 0x0011_2233_4455_6677_8899_aabb_ccdd_eeffu128;
        write_register(&mut frame, &mut fpu, REG_V0 + 3, &value.to_le_bytes()).unwrap();
        assert_eq!(fpu.q[3], value);
        assert_eq!(
            write_register(&mut frame, &mut fpu, REG_V0, &[0u8; 8]),
            Err(Errno::Inval)
        );
    }

    #[test]
    fn test_sp_follows_current_stack() {
        let mut frame = ExceptionStackFrame {
            spsr_el2: 0x3C5,
            ..Default::default()
        };
        let mut fpu = FpuRegisters::zeroed();
        write_register(&mut frame, &mut fpu, REG_SP, &0x8000u64.to_le_bytes()).unwrap();
        assert_eq!(frame.sp_el1, 0x8000);
        assert_eq!(frame.sp_el0, 0);
    }
}
