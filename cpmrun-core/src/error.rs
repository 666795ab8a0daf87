//! Error types for the emulator host side.
//!
//! Guest-visible failures never appear here: BDOS and BIOS collapse every
//! host error into the documented error byte returned in A. These variants
//! cover the conditions that abort the emulator process itself.

use thiserror::Error;

/// Host-fatal emulation errors.
#[derive(Error, Debug)]
pub enum CpmError {
    #[error("unimplemented opcode {opcode:#04x} at pc={pc:#06x}")]
    UnknownOpcode { opcode: u8, pc: u16 },

    #[error("BIOS disk function at offset {0} with disk policy 'error'")]
    BiosDisk(usize),

    #[error("config file {path}: {reason}")]
    Config { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for CP/M operations.
pub type CpmResult<T> = Result<T, CpmError>;
