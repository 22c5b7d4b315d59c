//! VM error codes.
//!
//! Every trap the interpreter can raise has a fixed wire value, returned
//! to embedders and written by guest programs that halt with a chosen
//! exit code. The wire values are part of the external interface and are
//! never renumbered.

use thiserror::Error;

use crate::word::Word;

/// An error code raised by the interpreter.
///
/// Values that do not name a specific trap are user-raised halt codes,
/// carried by the `Halt` variant (including zero, the conventional
/// successful exit).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("invalid opcode")]
    InvalidOpcode,
    #[error("stack overflow")]
    StackOverflow,
    #[error("invalid stack read")]
    InvalidStackRead,
    #[error("invalid stack write")]
    InvalidStackWrite,
    #[error("invalid memory read")]
    InvalidMemoryRead,
    #[error("invalid memory write")]
    InvalidMemoryWrite,
    #[error("unaligned address")]
    UnalignedAddress,
    #[error("division by zero")]
    DivisionByZero,
    #[error("break")]
    Break,
    #[error("halt ({0})")]
    Halt(Word),
}

impl VmError {
    /// The wire value of this error code.
    pub fn code(&self) -> Word {
        match self {
            VmError::InvalidOpcode => -1,
            VmError::StackOverflow => -2,
            VmError::InvalidStackRead => -3,
            VmError::InvalidStackWrite => -4,
            VmError::InvalidMemoryRead => -5,
            VmError::InvalidMemoryWrite => -6,
            VmError::UnalignedAddress => -7,
            VmError::DivisionByZero => -8,
            VmError::Break => -127,
            VmError::Halt(n) => *n,
        }
    }

    /// Interpret a wire value as an error code.
    pub fn from_code(code: Word) -> VmError {
        match code {
            -1 => VmError::InvalidOpcode,
            -2 => VmError::StackOverflow,
            -3 => VmError::InvalidStackRead,
            -4 => VmError::InvalidStackWrite,
            -5 => VmError::InvalidMemoryRead,
            -6 => VmError::InvalidMemoryWrite,
            -7 => VmError::UnalignedAddress,
            -8 => VmError::DivisionByZero,
            -127 => VmError::Break,
            n => VmError::Halt(n),
        }
    }
}
