//! CP/M 2.2 emulator core.
//!
//! This crate runs unmodified CP/M 2.2 `.COM` binaries on a modern host:
//! - A dual-mode 8080/Z80 interpreter with exact flag semantics,
//!   including the undocumented X/Y bits and half-index registers.
//! - A BDOS/BIOS bridge translating FCB file operations onto the host
//!   filesystem, with 8.3 name mapping and text-mode EOL translation.
//! - Console, printer and auxiliary device plumbing behind the
//!   `CpmConsole` trait and `DeviceStreams`.
//!
//! # Architecture
//!
//! `CpmEmulator` owns the CPU, the 64 KiB guest memory and the file
//! tables, and drives the step loop: trap interception for BDOS/BIOS
//! calls, one instruction per step, interrupt delivery at instruction
//! boundaries.

pub mod bdos;
pub mod config;
pub mod console;
pub mod cpu;
pub mod devices;
pub mod emulator;
pub mod error;
pub mod filemap;
pub mod memory;

pub use config::Config;
pub use console::{CpmConsole, ScriptedConsole};
pub use cpu::registers::CpuMode;
pub use cpu::{Cpu, Step};
pub use devices::DeviceStreams;
pub use emulator::{BiosDiskPolicy, CpmEmulator};
pub use error::{CpmError, CpmResult};
pub use filemap::{FileMap, FileMode};

/// Why the guest stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean exit: JMP 0, BDOS function 0, or BIOS WBOOT.
    WarmBoot,
    /// Five consecutive ^C bytes arrived on a console read path.
    CtrlC,
    /// The CPU executed HLT.
    Halted,
    /// The safety instruction ceiling was reached.
    InstructionLimit,
}

/// Information about a finished run.
#[derive(Debug, Clone)]
pub struct CpmExitInfo {
    pub reason: ExitReason,
    pub pc: u16,
    pub instructions: u64,
    pub cycles: u64,
}
