//! ARM64 Architecture Constants
//!
//! Named constants for system register fields, exception classes, PSCI
//! function identifiers and other architectural definitions.

// ── HCR_EL2 (Hypervisor Configuration Register) ─────────────────────
pub const HCR_VM: u64 = 1 << 0;
pub const HCR_SWIO: u64 = 1 << 1;
pub const HCR_FMO: u64 = 1 << 3;
pub const HCR_IMO: u64 = 1 << 4;
pub const HCR_AMO: u64 = 1 << 5;
pub const HCR_FB: u64 = 1 << 9;
pub const HCR_BSU_INNER: u64 = 1 << 10;
pub const HCR_TSC: u64 = 1 << 19;
pub const HCR_RW: u64 = 1 << 31;

// ── MDCR_EL2 (Monitor Debug Configuration Register) ──────────────────
pub const MDCR_TDE: u64 = 1 << 8;
pub const MDCR_TDA: u64 = 1 << 9;
pub const MDCR_TDOSA: u64 = 1 << 10;
pub const MDCR_TDRA: u64 = 1 << 11;

// ── MDSCR_EL1 ────────────────────────────────────────────────────────
pub const MDSCR_SS: u64 = 1 << 0;
pub const MDSCR_KDE: u64 = 1 << 13;
pub const MDSCR_MDE: u64 = 1 << 15;

// ── CNTHCTL_EL2 bits ─────────────────────────────────────────────────
pub const CNTHCTL_EL1PCTEN: u64 = 1 << 0;
pub const CNTHCTL_EL1PCEN: u64 = 1 << 1;

// ── Timer control bits (CNTx_CTL_EL0) ────────────────────────────────
pub const TIMER_ENABLE: u32 = 1 << 0;
pub const TIMER_IMASK: u32 = 1 << 1;
pub const TIMER_ISTATUS: u32 = 1 << 2;

// ── ESR_EL2 (Exception Syndrome Register) ────────────────────────────
pub const ESR_EC_SHIFT: u32 = 26;
pub const ESR_EC_MASK: u64 = 0x3F;
pub const ESR_IL: u64 = 1 << 25;
pub const ESR_ISS_MASK: u64 = 0x1FF_FFFF;

// ── Exception Class (EC) values ──────────────────────────────────────
pub const EC_UNKNOWN: u32 = 0x00;
pub const EC_WFI_WFE: u32 = 0x01;
pub const EC_HVC64: u32 = 0x16;
pub const EC_SMC64: u32 = 0x17;
pub const EC_MSR_MRS: u32 = 0x18;
pub const EC_IABT_LOWER: u32 = 0x20;
pub const EC_DABT_LOWER: u32 = 0x24;
pub const EC_BREAKPOINT_LOWER: u32 = 0x30;
pub const EC_SOFTWARE_STEP_LOWER: u32 = 0x32;
pub const EC_WATCHPOINT_LOWER: u32 = 0x34;
pub const EC_BRK64: u32 = 0x3C;

// ── SPSR_EL2 ─────────────────────────────────────────────────────────
/// M[0]: 1 = SP_ELx selected, 0 = SP_EL0
pub const SPSR_SP_SEL: u64 = 1 << 0;
pub const SPSR_EL_MASK: u64 = 0b1100;
pub const SPSR_SS: u64 = 1 << 21;
pub const SPSR_EL1H_DAIF_MASKED: u64 = 0x3C5;
/// DAIF.I: IRQs masked.
pub const DAIF_I: u64 = 1 << 7;

// ── Instructions ─────────────────────────────────────────────────────
pub const AARCH64_INSN_SIZE: u64 = 4;
/// `BRK #0`; the 16-bit immediate lives in bits [20:5].
pub const BRK_INSN_BASE: u32 = 0xD420_0000;

// ── PSCI (SMC calling convention) ────────────────────────────────────
pub const PSCI_CPU_SUSPEND_32: u64 = 0x8400_0001;
pub const PSCI_CPU_SUSPEND_64: u64 = 0xC400_0001;
pub const PSCI_CPU_ON_32: u64 = 0x8400_0003;
pub const PSCI_CPU_ON_64: u64 = 0xC400_0003;
pub const PSCI_SYSTEM_SUSPEND_32: u64 = 0x8400_000E;
pub const PSCI_SYSTEM_SUSPEND_64: u64 = 0xC400_000E;
