//! Errno-style error codes returned by the debug managers and the gdb layer.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Errno {
    #[error("operation not permitted")]
    Perm,
    #[error("no such entry")]
    NoEnt,
    #[error("no such thread")]
    Srch,
    #[error("bad address")]
    Fault,
    #[error("resource busy")]
    Busy,
    #[error("already exists")]
    Exist,
    #[error("invalid argument")]
    Inval,
    #[error("out of memory")]
    NoMem,
    #[error("illegal byte sequence")]
    Ilseq,
}

impl Errno {
    /// Linux errno value, as reported in gdb `E<nn>` replies.
    pub const fn code(self) -> u8 {
        match self {
            Errno::Perm => 1,
            Errno::NoEnt => 2,
            Errno::Srch => 3,
            Errno::Fault => 14,
            Errno::Busy => 16,
            Errno::Exist => 17,
            Errno::Inval => 22,
            Errno::NoMem => 12,
            Errno::Ilseq => 84,
        }
    }
}

pub type Result<T> = core::result::Result<T, Errno>;
