//! BDOS (Basic Disk Operating System) function numbers and the guest
//! memory layout.
//!
//! The emulator intercepts the jump through 0x0005 when PC reaches the
//! BDOS trap address and dispatches on the function number in C.

pub mod fcb;

pub use fcb::Fcb;

/// CP/M 2.2 BDOS function numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BdosFunction {
    /// 0: System reset / warm boot
    SystemReset = 0,
    /// 1: Console input (blocking)
    ConsoleInput = 1,
    /// 2: Console output
    ConsoleOutput = 2,
    /// 3: Reader (auxiliary) input
    ReaderInput = 3,
    /// 4: Punch (auxiliary) output
    PunchOutput = 4,
    /// 5: List (printer) output
    ListOutput = 5,
    /// 6: Direct console I/O
    DirectConsoleIo = 6,
    /// 7: Get IOBYTE
    GetIoByte = 7,
    /// 8: Set IOBYTE
    SetIoByte = 8,
    /// 9: Print $-terminated string
    PrintString = 9,
    /// 10: Read console buffer with line editing
    ReadConsoleBuffer = 10,
    /// 11: Get console status
    ConsoleStatus = 11,
    /// 12: Return version number
    ReturnVersion = 12,
    /// 13: Reset disk system
    ResetDiskSystem = 13,
    /// 14: Select disk
    SelectDisk = 14,
    /// 15: Open file
    OpenFile = 15,
    /// 16: Close file
    CloseFile = 16,
    /// 17: Search for first
    SearchFirst = 17,
    /// 18: Search for next
    SearchNext = 18,
    /// 19: Delete file
    DeleteFile = 19,
    /// 20: Read sequential
    ReadSequential = 20,
    /// 21: Write sequential
    WriteSequential = 21,
    /// 22: Make (create) file
    MakeFile = 22,
    /// 23: Rename file
    RenameFile = 23,
    /// 24: Return login vector
    ReturnLoginVector = 24,
    /// 25: Return current disk
    ReturnCurrentDisk = 25,
    /// 26: Set DMA address
    SetDmaAddress = 26,
    /// 27: Get allocation vector address
    GetAllocationVector = 27,
    /// 28: Write protect disk
    WriteProtectDisk = 28,
    /// 29: Get read-only vector
    GetReadOnlyVector = 29,
    /// 30: Set file attributes
    SetFileAttributes = 30,
    /// 31: Get disk parameter block address
    GetDiskParameters = 31,
    /// 32: Get/set user code
    UserCode = 32,
    /// 33: Read random
    ReadRandom = 33,
    /// 34: Write random
    WriteRandom = 34,
    /// 35: Compute file size
    ComputeFileSize = 35,
    /// 36: Set random record
    SetRandomRecord = 36,
    /// 37: Reset drive
    ResetDrive = 37,
    /// 38: Access drive
    AccessDrive = 38,
    /// 39: Free drive
    FreeDrive = 39,
    /// 40: Write random with zero fill
    WriteRandomZeroFill = 40,
}

impl TryFrom<u8> for BdosFunction {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::SystemReset),
            1 => Ok(Self::ConsoleInput),
            2 => Ok(Self::ConsoleOutput),
            3 => Ok(Self::ReaderInput),
            4 => Ok(Self::PunchOutput),
            5 => Ok(Self::ListOutput),
            6 => Ok(Self::DirectConsoleIo),
            7 => Ok(Self::GetIoByte),
            8 => Ok(Self::SetIoByte),
            9 => Ok(Self::PrintString),
            10 => Ok(Self::ReadConsoleBuffer),
            11 => Ok(Self::ConsoleStatus),
            12 => Ok(Self::ReturnVersion),
            13 => Ok(Self::ResetDiskSystem),
            14 => Ok(Self::SelectDisk),
            15 => Ok(Self::OpenFile),
            16 => Ok(Self::CloseFile),
            17 => Ok(Self::SearchFirst),
            18 => Ok(Self::SearchNext),
            19 => Ok(Self::DeleteFile),
            20 => Ok(Self::ReadSequential),
            21 => Ok(Self::WriteSequential),
            22 => Ok(Self::MakeFile),
            23 => Ok(Self::RenameFile),
            24 => Ok(Self::ReturnLoginVector),
            25 => Ok(Self::ReturnCurrentDisk),
            26 => Ok(Self::SetDmaAddress),
            27 => Ok(Self::GetAllocationVector),
            28 => Ok(Self::WriteProtectDisk),
            29 => Ok(Self::GetReadOnlyVector),
            30 => Ok(Self::SetFileAttributes),
            31 => Ok(Self::GetDiskParameters),
            32 => Ok(Self::UserCode),
            33 => Ok(Self::ReadRandom),
            34 => Ok(Self::WriteRandom),
            35 => Ok(Self::ComputeFileSize),
            36 => Ok(Self::SetRandomRecord),
            37 => Ok(Self::ResetDrive),
            38 => Ok(Self::AccessDrive),
            39 => Ok(Self::FreeDrive),
            40 => Ok(Self::WriteRandomZeroFill),
            _ => Err(value),
        }
    }
}

/// Record size in CP/M (always 128 bytes).
pub const RECORD_SIZE: usize = 128;

/// The CP/M end-of-file marker (^Z).
pub const CPM_EOF: u8 = 0x1A;

/// Guest memory layout.
///
/// The BDOS and BIOS regions only hold jump stubs, so they are packed
/// into high memory and the trap window sits in the otherwise unused
/// 0xFF00 page, where a PC match uniquely identifies a system call.
pub mod addr {
    /// Warm-boot jump.
    pub const BOOT: u16 = 0x0000;
    /// IOBYTE.
    pub const IOBYTE: u16 = 0x0003;
    /// Current drive/user nibbles.
    pub const DRIVE_USER: u16 = 0x0004;
    /// `JP` into the BDOS dispatch trap.
    pub const BDOS_ENTRY: u16 = 0x0005;
    /// Default FCB 1.
    pub const FCB1: u16 = 0x005C;
    /// Default FCB 2.
    pub const FCB2: u16 = 0x006C;
    /// Default DMA buffer, shared with the command tail.
    pub const DEFAULT_DMA: u16 = 0x0080;
    /// Transient Program Area: where `.COM` images load and run.
    pub const TPA: u16 = 0x0100;
    /// Largest `.COM` image accepted at load time.
    pub const TPA_CAPACITY: usize = 0xE000;

    /// Disk Parameter Header, returned by BIOS SELDSK.
    pub const DPH: u16 = 0xFAE0;
    /// Disk Parameter Block.
    pub const DPB: u16 = 0xFAF0;
    /// Directory buffer.
    pub const DIRBUF: u16 = 0xFB00;
    /// Allocation vector.
    pub const ALV: u16 = 0xFB80;
    /// Check vector (referenced by the DPH, otherwise unused).
    pub const CSV: u16 = 0xFBC0;

    /// BDOS dispatch trap: the jump at 0x0005 lands here.
    pub const BDOS_BASE: u16 = 0xFD00;
    /// BIOS jump table base.
    pub const BIOS_BASE: u16 = 0xFE00;
    /// First BIOS trap address; entry i traps at `BIOS_TRAP_BASE + i`.
    pub const BIOS_TRAP_BASE: u16 = 0xFF00;
    /// Number of BIOS jump-table entries.
    pub const BIOS_FUNCTIONS: u16 = 17;

    /// Initial guest stack pointer.
    pub const STACK_TOP: u16 = 0xFFF0;
}

/// BIOS jump-table byte offsets.
pub mod bios {
    pub const BOOT: usize = 0;
    pub const WBOOT: usize = 3;
    pub const CONST: usize = 6;
    pub const CONIN: usize = 9;
    pub const CONOUT: usize = 12;
    pub const LIST: usize = 15;
    pub const PUNCH: usize = 18;
    pub const READER: usize = 21;
    pub const HOME: usize = 24;
    pub const SELDSK: usize = 27;
    pub const SETTRK: usize = 30;
    pub const SETSEC: usize = 33;
    pub const SETDMA: usize = 36;
    pub const READ: usize = 39;
    pub const WRITE: usize = 42;
    pub const LISTST: usize = 45;
    pub const SECTRAN: usize = 48;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_numbers_round_trip() {
        assert_eq!(BdosFunction::try_from(9), Ok(BdosFunction::PrintString));
        assert_eq!(BdosFunction::try_from(40), Ok(BdosFunction::WriteRandomZeroFill));
        assert_eq!(BdosFunction::try_from(99), Err(99));
    }
}
