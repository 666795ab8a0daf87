//! The CP/M machine: guest memory image, trap interception, BDOS and
//! BIOS services, and the instruction step loop.
//!
//! The loop checks PC against the trap addresses before every
//! instruction: 0x0000 is a clean exit, the BDOS base dispatches on the
//! function number in C, and the 0xFF00 window maps back onto the BIOS
//! jump table. Everything else is one CPU step plus interrupt delivery
//! at the boundary.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::bdos::fcb::{field_matches, FCB_SIZE};
use crate::bdos::{addr, bios, BdosFunction, Fcb, CPM_EOF, RECORD_SIZE};
use crate::console::CpmConsole;
use crate::cpu::registers::CpuMode;
use crate::cpu::{Cpu, Step};
use crate::devices::DeviceStreams;
use crate::error::{CpmError, CpmResult};
use crate::filemap::{self, FileMap, FileMode, OpenFile};
use crate::{CpmExitInfo, ExitReason};

/// Consecutive ^C bytes on any console read path that force an exit.
const CTRL_C_EXIT_COUNT: u32 = 5;

/// Runaway-guest backstop.
const DEFAULT_MAX_INSTRUCTIONS: u64 = 9_000_000_000;

/// What the stubbed BIOS disk primitives do when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BiosDiskPolicy {
    /// Report success (default). File I/O happens at the BDOS level.
    #[default]
    Ok,
    /// Report failure to the guest.
    Fail,
    /// Abort the emulator with a diagnostic.
    Error,
}

impl BiosDiskPolicy {
    /// Parse the `ok`/`fail`/`error` configuration value.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "ok" => Some(Self::Ok),
            "fail" => Some(Self::Fail),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One materialized directory-search candidate.
struct SearchEntry {
    name: [u8; 8],
    ext: [u8; 3],
    path: PathBuf,
}

/// CP/M emulator state.
pub struct CpmEmulator<C: CpmConsole> {
    cpu: Cpu,
    console: C,
    devices: DeviceStreams,
    file_map: FileMap,
    /// Open host files keyed by guest FCB address.
    open_files: HashMap<u16, OpenFile>,
    current_drive: u8,
    current_user: u8,
    iobyte: u8,
    dma: u16,

    // Directory search state: rebuilt by Search First, consumed by
    // Search Next.
    search_entries: Vec<SearchEntry>,
    search_index: usize,
    search_user: u8,

    ctrl_c_run: u32,
    bios_disk_policy: BiosDiskPolicy,

    /// Trace every system call.
    pub debug: bool,
    /// BDOS function numbers to trace selectively.
    pub debug_bdos: HashSet<u8>,
    /// BIOS offsets to trace selectively.
    pub debug_bios: HashSet<usize>,

    int_cycles: u64,
    int_rst: u8,
    next_tick: u64,

    progress_interval: u64,
    last_progress: u64,
    max_instructions: u64,
    instructions: u64,
}

impl<C: CpmConsole> CpmEmulator<C> {
    pub fn new(mode: CpuMode, console: C) -> Self {
        let mut emu = Self {
            cpu: Cpu::new(mode),
            console,
            devices: DeviceStreams::new(),
            file_map: FileMap::new(),
            open_files: HashMap::new(),
            current_drive: 0,
            current_user: 0,
            iobyte: 0,
            dma: addr::DEFAULT_DMA,
            search_entries: Vec::new(),
            search_index: 0,
            search_user: 0,
            ctrl_c_run: 0,
            bios_disk_policy: BiosDiskPolicy::default(),
            debug: false,
            debug_bdos: HashSet::new(),
            debug_bios: HashSet::new(),
            int_cycles: 0,
            int_rst: 7,
            next_tick: 0,
            progress_interval: 0,
            last_progress: 0,
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            instructions: 0,
        };
        emu.init_memory();
        emu
    }

    /// Install the reserved low-memory vectors, the BIOS jump table and
    /// the disk parameter tables.
    fn init_memory(&mut self) {
        let mem = &mut self.cpu.mem;

        // JP to the BIOS warm-boot stub at 0x0000.
        mem.store(addr::BOOT, 0xC3);
        mem.store_word(addr::BOOT + 1, addr::BIOS_BASE + bios::WBOOT as u16);

        mem.store(addr::IOBYTE, 0x00);
        mem.store(addr::DRIVE_USER, 0x00);

        // JP to the BDOS dispatch trap at 0x0005.
        mem.store(addr::BDOS_ENTRY, 0xC3);
        mem.store_word(addr::BDOS_ENTRY + 1, addr::BDOS_BASE);

        // BIOS jump table: 17 three-byte JPs into the trap window.
        for i in 0..addr::BIOS_FUNCTIONS {
            let at = addr::BIOS_BASE + i * 3;
            mem.store(at, 0xC3);
            mem.store_word(at + 1, addr::BIOS_TRAP_BASE + i);
        }

        // Disk Parameter Header: scratch words zero, then DIRBUF, DPB,
        // CSV and ALV pointers.
        for i in 0..8 {
            mem.store(addr::DPH + i, 0x00);
        }
        mem.store_word(addr::DPH + 8, addr::DIRBUF);
        mem.store_word(addr::DPH + 10, addr::DPB);
        mem.store_word(addr::DPH + 12, addr::CSV);
        mem.store_word(addr::DPH + 14, addr::ALV);

        // Disk Parameter Block for a simulated 8 MB drive:
        // SPT BSH BLM EXM DSM DRM AL0 AL1 CKS OFF.
        let dpb: [u8; 15] = [
            128, 0, 4, 15, 0, 0xFF, 0x0F, 0xFF, 0x03, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for (i, &b) in dpb.iter().enumerate() {
            mem.store(addr::DPB + i as u16, b);
        }

        // Directory buffer reads as empty entries.
        for i in 0..RECORD_SIZE as u16 {
            mem.store(addr::DIRBUF + i, 0xE5);
        }

        self.cpu.regs.sp = addr::STACK_TOP;
    }

    // === host-side configuration ===

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    pub fn file_map_mut(&mut self) -> &mut FileMap {
        &mut self.file_map
    }

    pub fn devices_mut(&mut self) -> &mut DeviceStreams {
        &mut self.devices
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn set_bios_disk_policy(&mut self, policy: BiosDiskPolicy) {
        self.bios_disk_policy = policy;
    }

    /// Arm a periodic maskable interrupt: RST `rst_num` every `cycles`
    /// approximate cycles. The guest still has to EI.
    pub fn set_interrupt_tick(&mut self, cycles: u64, rst_num: u8) {
        self.int_cycles = cycles;
        self.int_rst = rst_num & 7;
        self.next_tick = self.cpu.cycles + cycles;
        self.cpu.regs.im = 1;
    }

    /// Report progress to stderr every `interval` instructions (0 = off).
    pub fn set_progress_interval(&mut self, interval: u64) {
        self.progress_interval = interval;
    }

    /// Stop after this many instructions.
    pub fn set_max_instructions(&mut self, limit: u64) {
        self.max_instructions = limit;
    }

    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    // === loading ===

    /// Load bytes into guest memory at an address.
    pub fn load_at(&mut self, address: u16, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            let at = address as usize + i;
            if at >= crate::memory::MEMORY_SIZE {
                break;
            }
            self.cpu.mem.store(at as u16, b);
        }
    }

    /// Load a `.COM` image at the TPA base. Images larger than the TPA
    /// are truncated.
    pub fn load_com(&mut self, data: &[u8]) {
        let len = data.len().min(addr::TPA_CAPACITY);
        self.load_at(addr::TPA, &data[..len]);
        self.cpu.regs.pc = addr::TPA;
    }

    /// Build the command tail at 0x0080 and parse the first two
    /// positional arguments into the default FCBs.
    pub fn set_command_tail(&mut self, args: &[String]) {
        let mut tail = String::new();
        for arg in args {
            tail.push(' ');
            tail.push_str(&filemap::to_8_3(basename(arg)));
        }

        let bytes = tail.as_bytes();
        let len = bytes.len().min(127);
        self.cpu.mem.store(addr::DEFAULT_DMA, len as u8);
        for (i, &b) in bytes[..len].iter().enumerate() {
            self.cpu
                .mem
                .store(addr::DEFAULT_DMA + 1 + i as u16, b.to_ascii_uppercase());
        }

        if let Some(arg) = args.first() {
            self.parse_into_fcb(addr::FCB1, basename(arg));
        }
        if let Some(arg) = args.get(1) {
            self.parse_into_fcb(addr::FCB2, basename(arg));
        }
    }

    fn parse_into_fcb(&mut self, fcb_addr: u16, filename: &str) {
        let mut raw = [0u8; FCB_SIZE];
        Fcb::new(&mut raw).parse_filename(filename);
        self.write_fcb(fcb_addr, &raw);
    }

    // === run loop ===

    pub fn run(&mut self) -> CpmResult<CpmExitInfo> {
        loop {
            let pc = self.cpu.regs.pc;

            if pc == addr::BOOT {
                return Ok(self.finish(ExitReason::WarmBoot));
            }

            if pc == addr::BDOS_BASE {
                if let Some(reason) = self.bdos_call()? {
                    return Ok(self.finish(reason));
                }
                let ret = self.cpu.pop_word();
                self.cpu.regs.pc = ret;
                continue;
            }

            if (addr::BIOS_TRAP_BASE..addr::BIOS_TRAP_BASE + addr::BIOS_FUNCTIONS).contains(&pc) {
                let offset = (pc - addr::BIOS_TRAP_BASE) as usize * 3;
                if let Some(reason) = self.bios_call(offset)? {
                    return Ok(self.finish(reason));
                }
                let ret = self.cpu.pop_word();
                self.cpu.regs.pc = ret;
                continue;
            }

            if self.int_cycles > 0 && self.cpu.cycles >= self.next_tick {
                self.next_tick = self.cpu.cycles + self.int_cycles;
                self.cpu.request_rst(self.int_rst);
            }
            self.cpu.check_interrupts();

            match self.cpu.execute()? {
                Step::Continue => {}
                Step::Halted => {
                    eprintln!("HALT: {}", self.cpu.format_state());
                    return Ok(self.finish(ExitReason::Halted));
                }
            }

            self.instructions += 1;

            if self.progress_interval > 0
                && self.instructions - self.last_progress >= self.progress_interval
            {
                eprintln!("progress: {}M instructions", self.instructions / 1_000_000);
                self.last_progress = self.instructions;
            }

            if self.instructions >= self.max_instructions {
                eprintln!(
                    "instruction limit reached, pc={:#06x}",
                    self.cpu.regs.pc
                );
                return Ok(self.finish(ExitReason::InstructionLimit));
            }
        }
    }

    fn finish(&mut self, reason: ExitReason) -> CpmExitInfo {
        self.close_all_files();
        CpmExitInfo {
            reason,
            pc: self.cpu.regs.pc,
            instructions: self.instructions,
            cycles: self.cpu.cycles,
        }
    }

    fn close_all_files(&mut self) {
        self.open_files.clear();
    }

    // === console plumbing shared by BDOS and BIOS ===

    /// Count consecutive ^C bytes; at the threshold the emulator leaves
    /// through an orderly exit instead of passing the byte on.
    fn track_ctrl_c(&mut self, ch: u8) -> bool {
        if ch == 0x03 {
            self.ctrl_c_run += 1;
            if self.ctrl_c_run >= CTRL_C_EXIT_COUNT {
                eprintln!("exiting after {CTRL_C_EXIT_COUNT} consecutive ^C");
                return true;
            }
        } else {
            self.ctrl_c_run = 0;
        }
        false
    }

    /// Blocking console read with LF-to-CR translation. The bool asks
    /// for an orderly ^C exit.
    fn console_read_blocking(&mut self) -> (u8, bool) {
        let mut ch = self.console.read_key();
        let exit = self.track_ctrl_c(ch);
        if ch == b'\n' {
            ch = b'\r';
        }
        (ch & 0x7F, exit)
    }

    // === BDOS dispatch ===

    fn bdos_call(&mut self) -> CpmResult<Option<ExitReason>> {
        let func_num = self.cpu.regs.c();
        let e = self.cpu.regs.e();
        let de = self.cpu.regs.de;

        if self.debug || self.debug_bdos.contains(&func_num) {
            eprintln!("[BDOS] function {func_num} (DE={de:#06x})");
        }

        let func = match BdosFunction::try_from(func_num) {
            Ok(f) => f,
            Err(n) => {
                eprintln!("[BDOS] unimplemented function {n}");
                self.cpu.regs.set_a(0xFF);
                return Ok(None);
            }
        };

        use BdosFunction::*;
        match func {
            SystemReset => return Ok(Some(ExitReason::WarmBoot)),

            ConsoleInput => {
                let (ch, exit) = self.console_read_blocking();
                if exit {
                    return Ok(Some(ExitReason::CtrlC));
                }
                self.cpu.regs.set_a(ch);
            }

            ConsoleOutput => self.console.emit(e & 0x7F),

            ReaderInput => {
                let ch = self.devices.aux_in_char();
                self.cpu.regs.set_a(ch & 0x7F);
            }

            PunchOutput => self.devices.aux_out_char(e & 0x7F),

            ListOutput => self.devices.print_char(e & 0x7F),

            DirectConsoleIo => match e {
                0xFF => {
                    if let Some(mut ch) = self.console.poll_key() {
                        if self.track_ctrl_c(ch) {
                            return Ok(Some(ExitReason::CtrlC));
                        }
                        if ch == b'\n' {
                            ch = b'\r';
                        }
                        self.cpu.regs.set_a(ch & 0x7F);
                    } else {
                        self.cpu.regs.set_a(0);
                    }
                }
                0xFE => {
                    let status = if self.console.input_ready() { 0xFF } else { 0 };
                    self.cpu.regs.set_a(status);
                }
                _ => self.console.emit(e & 0x7F),
            },

            GetIoByte => self.cpu.regs.set_a(self.iobyte),
            SetIoByte => self.iobyte = e,

            PrintString => {
                let mut at = de;
                for _ in 0..crate::memory::MEMORY_SIZE {
                    let ch = self.cpu.mem.fetch(at);
                    if ch == b'$' {
                        break;
                    }
                    self.console.emit(ch & 0x7F);
                    at = at.wrapping_add(1);
                }
            }

            ReadConsoleBuffer => {
                if let Some(reason) = self.read_console_buffer(de) {
                    return Ok(Some(reason));
                }
            }

            ConsoleStatus => {
                let status = if self.console.input_ready() { 0xFF } else { 0 };
                self.cpu.regs.set_a(status);
            }

            ReturnVersion => {
                // CP/M 2.2 in both HL and BA.
                self.cpu.regs.hl = 0x0022;
                self.cpu.regs.set_b(0x00);
                self.cpu.regs.set_a(0x22);
            }

            ResetDiskSystem => {
                self.close_all_files();
                self.current_drive = 0;
                self.current_user = 0;
                self.cpu.regs.set_a(0);
            }

            SelectDisk => {
                self.current_drive = e & 0x0F;
                self.cpu.regs.set_a(0);
            }

            OpenFile => {
                let a = self.open_host_file(de);
                self.cpu.regs.set_a(a);
            }

            CloseFile => {
                // Idempotent: closing an unknown FCB also reports success.
                self.open_files.remove(&de);
                self.cpu.regs.set_a(0);
            }

            SearchFirst => self.search_first(de),
            SearchNext => self.search_next(),

            DeleteFile => {
                let filename = self.fcb_filename(de);
                let a = match self.file_map.resolve(&filename) {
                    Some(resolved) if fs::remove_file(&resolved.path).is_ok() => 0,
                    _ => 0xFF,
                };
                self.cpu.regs.set_a(a);
            }

            ReadSequential => self.read_sequential(de),
            WriteSequential => self.write_sequential(de),

            MakeFile => {
                let a = self.make_host_file(de);
                self.cpu.regs.set_a(a);
            }

            RenameFile => self.rename_file(de),

            ReturnLoginVector => self.cpu.regs.hl = 0x0001,
            ReturnCurrentDisk => self.cpu.regs.set_a(self.current_drive),
            SetDmaAddress => self.dma = de,
            GetAllocationVector => self.cpu.regs.hl = addr::ALV,
            WriteProtectDisk => {}
            GetReadOnlyVector => self.cpu.regs.hl = 0x0000,
            SetFileAttributes => self.cpu.regs.set_a(0),
            GetDiskParameters => self.cpu.regs.hl = addr::DPB,

            UserCode => {
                if e == 0xFF {
                    self.cpu.regs.set_a(self.current_user);
                } else {
                    self.current_user = e & 0x0F;
                }
            }

            ReadRandom => self.read_random(de),
            WriteRandom | WriteRandomZeroFill => self.write_random(de),
            ComputeFileSize => self.compute_file_size(de),
            SetRandomRecord => self.set_random_record(de),

            ResetDrive => {
                self.close_all_files();
                self.cpu.regs.set_a(0);
            }

            AccessDrive => self.cpu.regs.set_a(0),
            FreeDrive => {}
        }

        Ok(None)
    }

    /// BDOS 10: buffered line input with backspace, ^U cancel and CR/LF
    /// termination. ^C is stored and counted; ^Z (or a dead console)
    /// ends the line.
    fn read_console_buffer(&mut self, buf_addr: u16) -> Option<ExitReason> {
        let max_chars = self.cpu.mem.fetch(buf_addr) as usize;
        if max_chars == 0 {
            self.cpu.mem.store(buf_addr.wrapping_add(1), 0);
            self.cpu.regs.set_a(0);
            return None;
        }

        let mut count: usize = 0;
        loop {
            let ch = self.console.read_key();
            let exit = self.track_ctrl_c(ch);
            if exit {
                return Some(ExitReason::CtrlC);
            }

            match ch {
                b'\r' | b'\n' => {
                    self.console.emit(b'\r');
                    self.console.emit(b'\n');
                    break;
                }
                0x08 | 0x7F => {
                    if count > 0 {
                        count -= 1;
                        self.console.emit(0x08);
                        self.console.emit(b' ');
                        self.console.emit(0x08);
                    }
                }
                0x15 => {
                    // ^U cancels the line.
                    while count > 0 {
                        self.console.emit(0x08);
                        self.console.emit(b' ');
                        self.console.emit(0x08);
                        count -= 1;
                    }
                }
                0x03 => {
                    if count < max_chars {
                        self.cpu
                            .mem
                            .store(buf_addr.wrapping_add(2 + count as u16), ch);
                        count += 1;
                        self.console.emit(b'^');
                        self.console.emit(b'C');
                    }
                }
                0x00 | CPM_EOF => break,
                ch if (0x20..0x7F).contains(&ch) => {
                    if count < max_chars {
                        self.cpu
                            .mem
                            .store(buf_addr.wrapping_add(2 + count as u16), ch);
                        count += 1;
                        self.console.emit(ch);
                    }
                }
                _ => {}
            }
        }

        self.cpu.mem.store(buf_addr.wrapping_add(1), count as u8);
        self.cpu.regs.set_a(0);
        None
    }

    // === FCB helpers ===

    fn read_fcb(&self, fcb_addr: u16) -> [u8; FCB_SIZE] {
        let mut raw = [0u8; FCB_SIZE];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = self.cpu.mem.fetch(fcb_addr.wrapping_add(i as u16));
        }
        raw
    }

    fn write_fcb(&mut self, fcb_addr: u16, raw: &[u8; FCB_SIZE]) {
        for (i, &b) in raw.iter().enumerate() {
            self.cpu.mem.store(fcb_addr.wrapping_add(i as u16), b);
        }
    }

    fn fcb_filename(&self, fcb_addr: u16) -> String {
        let mut raw = self.read_fcb(fcb_addr);
        Fcb::new(&mut raw).filename()
    }

    // === file operations ===

    /// BDOS 15: resolve the FCB name and open the host file read-write,
    /// falling back to read-only. Reopening an FCB address drops the
    /// previous handle.
    fn open_host_file(&mut self, fcb_addr: u16) -> u8 {
        let filename = self.fcb_filename(fcb_addr);
        let resolved = match self.file_map.resolve(&filename) {
            Some(r) => r,
            None => {
                if self.debug || self.debug_bdos.contains(&15) {
                    eprintln!("[BDOS] open '{filename}': not found");
                }
                return 0xFF;
            }
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&resolved.path)
            .or_else(|_| File::open(&resolved.path));
        let file = match file {
            Ok(f) => f,
            Err(_) => return 0xFF,
        };

        if self.debug || self.debug_bdos.contains(&15) {
            eprintln!(
                "[BDOS] open '{}' -> '{}' ({:?})",
                filename, resolved.path, resolved.mode
            );
        }

        self.open_files.insert(
            fcb_addr,
            OpenFile::new(file, resolved.mode, resolved.eol_convert),
        );

        let mut raw = self.read_fcb(fcb_addr);
        {
            let mut fcb = Fcb::new(&mut raw);
            fcb.init();
            fcb.set_rc(0x80);
        }
        self.write_fcb(fcb_addr, &raw);
        0
    }

    /// BDOS 22: create the host file (lowercased name) read-write and
    /// register the open entry.
    fn make_host_file(&mut self, fcb_addr: u16) -> u8 {
        let filename = self.fcb_filename(fcb_addr);
        let host_name = filename.to_lowercase();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&host_name);
        let file = match file {
            Ok(f) => f,
            Err(_) => return 0xFF,
        };

        let mode = self
            .file_map
            .concrete_mode(FileMode::Auto, &filemap::normalize_name(&filename));
        let mut open = OpenFile::new(file, mode, self.file_map.default_eol_convert);
        open.write_mode = true;
        self.open_files.insert(fcb_addr, open);

        // Later opens and searches must find the new file by name.
        self.file_map.add_name(&filename, &host_name);

        let mut raw = self.read_fcb(fcb_addr);
        Fcb::new(&mut raw).init();
        self.write_fcb(fcb_addr, &raw);
        0
    }

    /// BDOS 20: read one 128-byte record through the EOL translator.
    fn read_sequential(&mut self, fcb_addr: u16) {
        let Some(open) = self.open_files.get_mut(&fcb_addr) else {
            self.cpu.regs.set_a(0xFF);
            return;
        };

        let mut record = [0u8; RECORD_SIZE];
        let n = open.read_converted(&mut record).unwrap_or(0);

        if n == 0 || open.eof_seen {
            self.cpu.regs.set_a(1);
        } else {
            filemap::pad_record(&mut record, n);
            let dma = self.dma;
            for (i, &b) in record.iter().enumerate() {
                self.cpu.mem.store(dma.wrapping_add(i as u16), b);
            }
            self.cpu.regs.set_a(0);
        }

        self.advance_record(fcb_addr);
    }

    /// BDOS 21: write one record from the DMA buffer, auto-opening the
    /// file when the guest skipped BDOS 15.
    fn write_sequential(&mut self, fcb_addr: u16) {
        if !self.open_files.contains_key(&fcb_addr) && self.open_host_file(fcb_addr) != 0 {
            self.cpu.regs.set_a(0xFF);
            return;
        }

        let dma = self.dma;
        let mut record = [0u8; RECORD_SIZE];
        for (i, b) in record.iter_mut().enumerate() {
            *b = self.cpu.mem.fetch(dma.wrapping_add(i as u16));
        }

        let open = match self.open_files.get_mut(&fcb_addr) {
            Some(o) => o,
            None => {
                self.cpu.regs.set_a(0xFF);
                return;
            }
        };
        open.write_mode = true;
        let written = open.write_converted(&record).unwrap_or(0);
        self.cpu.regs.set_a(if written > 0 { 0 } else { 0xFF });

        self.advance_record(fcb_addr);
    }

    /// Advance the FCB's sequential position. The host handle holds the
    /// authoritative file offset; this is guest-visible bookkeeping.
    fn advance_record(&mut self, fcb_addr: u16) {
        let mut raw = self.read_fcb(fcb_addr);
        {
            let mut fcb = Fcb::new(&mut raw);
            let cr = fcb.cr();
            fcb.set_cr(cr.wrapping_add(1));
        }
        self.write_fcb(fcb_addr, &raw);
    }

    /// BDOS 33: random reads seek the host handle explicitly and move
    /// raw bytes, with ^Z padding on a short tail.
    fn read_random(&mut self, fcb_addr: u16) {
        let record = {
            let mut raw = self.read_fcb(fcb_addr);
            Fcb::new(&mut raw).random_record()
        };
        let Some(open) = self.open_files.get_mut(&fcb_addr) else {
            self.cpu.regs.set_a(0xFF);
            return;
        };

        if open.seek_record(record).is_err() {
            self.cpu.regs.set_a(0xFF);
            return;
        }

        let mut buf = [0u8; RECORD_SIZE];
        let n = open.read_raw(&mut buf).unwrap_or(0);
        if n == 0 {
            self.cpu.regs.set_a(1);
            return;
        }
        filemap::pad_record(&mut buf, n);
        let dma = self.dma;
        for (i, &b) in buf.iter().enumerate() {
            self.cpu.mem.store(dma.wrapping_add(i as u16), b);
        }
        self.cpu.regs.set_a(0);
    }

    /// BDOS 34/40: random write of one raw record.
    fn write_random(&mut self, fcb_addr: u16) {
        let record = {
            let mut raw = self.read_fcb(fcb_addr);
            Fcb::new(&mut raw).random_record()
        };

        let dma = self.dma;
        let mut buf = [0u8; RECORD_SIZE];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.cpu.mem.fetch(dma.wrapping_add(i as u16));
        }

        let Some(open) = self.open_files.get_mut(&fcb_addr) else {
            self.cpu.regs.set_a(0xFF);
            return;
        };

        if open.seek_record(record).is_err() || open.write_raw(&buf).is_err() {
            self.cpu.regs.set_a(0xFF);
            return;
        }
        open.write_mode = true;
        self.cpu.regs.set_a(0);
    }

    /// BDOS 35: fill R0..R2 with the record count of the host file.
    fn compute_file_size(&mut self, fcb_addr: u16) {
        let filename = self.fcb_filename(fcb_addr);
        let size = self
            .file_map
            .resolve(&filename)
            .and_then(|r| fs::metadata(&r.path).ok())
            .map(|m| m.len());

        match size {
            Some(size) => {
                let records = ((size + RECORD_SIZE as u64 - 1) / RECORD_SIZE as u64) as u32;
                let mut raw = self.read_fcb(fcb_addr);
                Fcb::new(&mut raw).set_random_record(records);
                self.write_fcb(fcb_addr, &raw);
                self.cpu.regs.set_a(0);
            }
            None => self.cpu.regs.set_a(0xFF),
        }
    }

    /// BDOS 36: project the sequential position into R0..R2.
    fn set_random_record(&mut self, fcb_addr: u16) {
        let mut raw = self.read_fcb(fcb_addr);
        {
            let mut fcb = Fcb::new(&mut raw);
            let record = u32::from(fcb.ex()) * 128 + u32::from(fcb.cr());
            fcb.set_random_record(record);
        }
        self.write_fcb(fcb_addr, &raw);
    }

    /// BDOS 23: rename into the same host directory, lowercased, and
    /// record the new name in the secondary map.
    fn rename_file(&mut self, fcb_addr: u16) {
        let old_name = self.fcb_filename(fcb_addr);
        let resolved = match self.file_map.resolve(&old_name) {
            Some(r) => r,
            None => {
                self.cpu.regs.set_a(0xFF);
                return;
            }
        };

        // The rename FCB carries the new name at offset 16.
        let new_name = self.fcb_filename(fcb_addr.wrapping_add(16));
        let new_path = match Path::new(&resolved.path).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(new_name.to_lowercase()),
            _ => PathBuf::from(new_name.to_lowercase()),
        };

        if fs::rename(&resolved.path, &new_path).is_ok() {
            self.file_map
                .add_name(&new_name, &new_path.to_string_lossy());
            self.cpu.regs.set_a(0);
        } else {
            self.cpu.regs.set_a(0xFF);
        }
    }

    // === directory search ===

    /// BDOS 17: materialize the candidate list from the mapping rules,
    /// the secondary map, and the current directory, deduplicated by
    /// 8.3 name, then emit the first match.
    fn search_first(&mut self, fcb_addr: u16) {
        let raw = self.read_fcb(fcb_addr);
        let mut pattern_name = [0u8; 8];
        let mut pattern_ext = [0u8; 3];
        pattern_name.copy_from_slice(&raw[1..9]);
        pattern_ext.copy_from_slice(&raw[9..12]);

        self.search_index = 0;
        self.search_user = self.current_user;

        let mut entries = Vec::new();
        let mut seen: HashSet<([u8; 8], [u8; 3])> = HashSet::new();

        // Pattern rules first: the guest-visible name is the rule's own
        // pattern, so wildcard rules cannot appear in a listing.
        for rule in self.file_map.rules() {
            if !Path::new(&rule.host_path).is_file() {
                continue;
            }
            let Some((name, ext)) = filemap::host_name_to_83(&rule.pattern) else {
                continue;
            };
            if field_matches(&pattern_name, &name)
                && field_matches(&pattern_ext, &ext)
                && seen.insert((name, ext))
            {
                entries.push(SearchEntry {
                    name,
                    ext,
                    path: PathBuf::from(&rule.host_path),
                });
            }
        }

        for (guest, path) in self.file_map.names() {
            if !Path::new(path).is_file() {
                continue;
            }
            let Some((name, ext)) = filemap::host_name_to_83(guest) else {
                continue;
            };
            if field_matches(&pattern_name, &name)
                && field_matches(&pattern_ext, &ext)
                && seen.insert((name, ext))
            {
                entries.push(SearchEntry {
                    name,
                    ext,
                    path: PathBuf::from(path),
                });
            }
        }

        // Current directory, sorted for a stable listing. Hidden files,
        // directories and names that do not project to 8.3 are skipped.
        let mut dir_names: Vec<String> = Vec::new();
        if let Ok(dir) = fs::read_dir(".") {
            for entry in dir.flatten() {
                let Ok(file_name) = entry.file_name().into_string() else {
                    continue;
                };
                if file_name.starts_with('.') {
                    continue;
                }
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                dir_names.push(file_name);
            }
        }
        dir_names.sort();

        for file_name in dir_names {
            let Some((name, ext)) = filemap::host_name_to_83(&file_name) else {
                continue;
            };
            if field_matches(&pattern_name, &name)
                && field_matches(&pattern_ext, &ext)
                && seen.insert((name, ext))
            {
                entries.push(SearchEntry {
                    name,
                    ext,
                    path: PathBuf::from(file_name),
                });
            }
        }

        self.search_entries = entries;

        if self.debug || self.debug_bdos.contains(&17) {
            eprintln!("[BDOS] search first: {} matches", self.search_entries.len());
        }

        self.search_next();
    }

    /// BDOS 18: emit the entry under the cursor, 0xFF when exhausted.
    fn search_next(&mut self) {
        if self.search_index >= self.search_entries.len() {
            self.cpu.regs.set_a(0xFF);
            return;
        }

        let entry = &self.search_entries[self.search_index];
        let name = entry.name;
        let ext = entry.ext;
        let size = fs::metadata(&entry.path).map(|m| m.len()).unwrap_or(0);
        self.search_index += 1;

        let records = ((size + RECORD_SIZE as u64 - 1) / RECORD_SIZE as u64) as u32;
        let rc = records.min(128) as u8;

        // Synthesize a 32-byte directory entry at the DMA base: user,
        // name, extension, extent 0, record count, and a plausible
        // allocation map.
        let dma = self.dma;
        for i in 0..32u16 {
            self.cpu.mem.store(dma.wrapping_add(i), 0);
        }
        self.cpu.mem.store(dma, self.search_user);
        for (i, &b) in name.iter().enumerate() {
            self.cpu.mem.store(dma.wrapping_add(1 + i as u16), b);
        }
        for (i, &b) in ext.iter().enumerate() {
            self.cpu.mem.store(dma.wrapping_add(9 + i as u16), b);
        }
        self.cpu.mem.store(dma.wrapping_add(15), rc);
        let blocks = (records + 7) / 8;
        for i in 0..16u32 {
            let used = if i < blocks.min(16) { 0x01 } else { 0x00 };
            self.cpu.mem.store(dma.wrapping_add(16 + i as u16), used);
        }

        self.cpu.regs.set_a(0);
    }

    // === BIOS dispatch ===

    fn bios_call(&mut self, offset: usize) -> CpmResult<Option<ExitReason>> {
        if self.debug || self.debug_bios.contains(&offset) {
            eprintln!("[BIOS] offset {offset}");
        }

        match offset {
            bios::BOOT | bios::WBOOT => return Ok(Some(ExitReason::WarmBoot)),

            bios::CONST => {
                let status = if self.console.input_ready() { 0xFF } else { 0 };
                self.cpu.regs.set_a(status);
            }

            bios::CONIN => {
                let (ch, exit) = self.console_read_blocking();
                if exit {
                    return Ok(Some(ExitReason::CtrlC));
                }
                self.cpu.regs.set_a(ch);
            }

            bios::CONOUT => {
                let ch = self.cpu.regs.c();
                self.console.emit(ch & 0x7F);
            }

            bios::LIST => {
                let ch = self.cpu.regs.c();
                self.devices.print_char(ch & 0x7F);
            }

            bios::PUNCH => {
                let ch = self.cpu.regs.c();
                self.devices.aux_out_char(ch & 0x7F);
            }

            bios::READER => {
                let ch = self.devices.aux_in_char();
                self.cpu.regs.set_a(ch & 0x7F);
            }

            bios::LISTST => self.cpu.regs.set_a(0xFF),

            bios::SELDSK => {
                // Only drive A exists; its DPH address goes back in HL.
                if self.cpu.regs.c() == 0 {
                    self.cpu.regs.hl = addr::DPH;
                } else {
                    self.cpu.regs.hl = 0x0000;
                }
            }

            bios::HOME | bios::SETTRK | bios::SETSEC | bios::SETDMA | bios::READ
            | bios::WRITE | bios::SECTRAN => match self.bios_disk_policy {
                BiosDiskPolicy::Ok => self.cpu.regs.set_a(0x00),
                BiosDiskPolicy::Fail => self.cpu.regs.set_a(0x01),
                BiosDiskPolicy::Error => {
                    eprintln!(
                        "fatal: BIOS disk function at offset {offset}; file I/O is served at \
                         the BDOS level (set CPM_BIOS_DISK=ok or fail to continue)"
                    );
                    return Err(CpmError::BiosDisk(offset));
                }
            },

            _ => {}
        }

        Ok(None)
    }
}

/// Final path component, for command-tail words and FCB parsing.
fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ScriptedConsole;

    fn new_emulator() -> CpmEmulator<ScriptedConsole> {
        CpmEmulator::new(CpuMode::Z80, ScriptedConsole::new())
    }

    #[test]
    fn memory_image_has_system_vectors() {
        let emu = new_emulator();
        // JP BDOS at 0x0005.
        assert_eq!(emu.cpu().mem.fetch(0x0005), 0xC3);
        assert_eq!(emu.cpu().mem.fetch_word(0x0006), addr::BDOS_BASE);
        // Warm boot vector points into the BIOS jump table.
        assert_eq!(emu.cpu().mem.fetch(0x0000), 0xC3);
        assert_eq!(
            emu.cpu().mem.fetch_word(0x0001),
            addr::BIOS_BASE + bios::WBOOT as u16
        );
        // Every BIOS entry jumps into the trap window.
        for i in 0..addr::BIOS_FUNCTIONS {
            let at = addr::BIOS_BASE + i * 3;
            assert_eq!(emu.cpu().mem.fetch(at), 0xC3);
            assert_eq!(emu.cpu().mem.fetch_word(at + 1), addr::BIOS_TRAP_BASE + i);
        }
        // The DPH points at the DPB.
        assert_eq!(emu.cpu().mem.fetch_word(addr::DPH + 10), addr::DPB);
    }

    #[test]
    fn console_output_via_bdos_2() {
        // LD C,2 ; LD E,'H' ; CALL 5 ; LD E,'i' ; CALL 5 ; JP 0
        let program = [
            0x0E, 0x02, 0x1E, b'H', 0xCD, 0x05, 0x00, 0x1E, b'i', 0xCD, 0x05, 0x00, 0xC3, 0x00,
            0x00,
        ];
        let mut emu = new_emulator();
        emu.load_com(&program);
        let info = emu.run().unwrap();
        assert_eq!(info.reason, ExitReason::WarmBoot);
        assert_eq!(emu.console().output_text(), "Hi");
    }

    #[test]
    fn bdos_version_and_drive_calls() {
        // LD C,12 ; CALL 5 ; LD C,25 ; CALL 5 ; JP 0
        let program = [
            0x0E, 0x0C, 0xCD, 0x05, 0x00, 0x0E, 0x19, 0xCD, 0x05, 0x00, 0xC3, 0x00, 0x00,
        ];
        let mut emu = new_emulator();
        emu.load_com(&program);
        emu.run().unwrap();
        assert_eq!(emu.cpu().regs.hl, 0x0022);
        assert_eq!(emu.cpu().regs.a(), 0); // current drive A
    }

    #[test]
    fn command_tail_layout() {
        let mut emu = new_emulator();
        emu.set_command_tail(&["input.txt".to_string(), "out.dat".to_string()]);

        let len = emu.cpu().mem.fetch(addr::DEFAULT_DMA) as usize;
        let tail: Vec<u8> = (0..len)
            .map(|i| emu.cpu().mem.fetch(addr::DEFAULT_DMA + 1 + i as u16))
            .collect();
        assert_eq!(tail, b" INPUT.TXT OUT.DAT");

        // First two arguments also land in the default FCBs.
        let fcb1 = emu.read_fcb(addr::FCB1);
        assert_eq!(&fcb1[1..9], b"INPUT   ");
        assert_eq!(&fcb1[9..12], b"TXT");
        let fcb2 = emu.read_fcb(addr::FCB2);
        assert_eq!(&fcb2[1..9], b"OUT     ");
        assert_eq!(&fcb2[9..12], b"DAT");
    }

    #[test]
    fn close_is_idempotent() {
        // LD C,16 ; LD DE,0x005C ; CALL 5 ; JP 0 - nothing was opened.
        let program = [0x0E, 0x10, 0x11, 0x5C, 0x00, 0xCD, 0x05, 0x00, 0xC3, 0x00, 0x00];
        let mut emu = new_emulator();
        emu.load_com(&program);
        emu.run().unwrap();
        assert_eq!(emu.cpu().regs.a(), 0);
    }

    #[test]
    fn bios_disk_policies() {
        // CALL the HOME entry in the BIOS jump table, then JP 0.
        let home = addr::BIOS_BASE + bios::HOME as u16;
        let program = [
            0xCD,
            (home & 0xFF) as u8,
            (home >> 8) as u8,
            0xC3,
            0x00,
            0x00,
        ];

        let mut emu = new_emulator();
        emu.load_com(&program);
        emu.run().unwrap();
        assert_eq!(emu.cpu().regs.a(), 0x00);

        let mut emu = new_emulator();
        emu.set_bios_disk_policy(BiosDiskPolicy::Fail);
        emu.load_com(&program);
        emu.run().unwrap();
        assert_eq!(emu.cpu().regs.a(), 0x01);

        let mut emu = new_emulator();
        emu.set_bios_disk_policy(BiosDiskPolicy::Error);
        emu.load_com(&program);
        assert!(matches!(emu.run(), Err(CpmError::BiosDisk(_))));
    }

    #[test]
    fn sequential_read_pads_and_reports_eof() {
        let path = std::env::temp_dir().join(format!("cpmrun-emu-eof-{}", std::process::id()));
        std::fs::write(&path, b"hi").unwrap();

        // Open NOTES.TXT, read twice, store each status byte.
        let program = [
            0x0E, 0x0F, 0x11, 0x5C, 0x00, 0xCD, 0x05, 0x00, // open
            0x0E, 0x14, 0x11, 0x5C, 0x00, 0xCD, 0x05, 0x00, // read #1
            0x32, 0x00, 0x20, // LD (0x2000),A
            0x0E, 0x14, 0x11, 0x5C, 0x00, 0xCD, 0x05, 0x00, // read #2
            0x32, 0x01, 0x20, // LD (0x2001),A
            0xC3, 0x00, 0x00, // JP 0
        ];

        let mut emu = new_emulator();
        emu.file_map_mut().add_rule(
            "NOTES.TXT",
            path.to_str().unwrap(),
            crate::filemap::FileMode::Text,
            true,
        );
        emu.set_command_tail(&["NOTES.TXT".to_string()]);
        emu.load_com(&program);
        emu.run().unwrap();

        assert_eq!(emu.cpu().mem.fetch(0x2000), 0x00);
        assert_eq!(emu.cpu().mem.fetch(0x2001), 0x01); // EOF status

        // The short record was padded with ^Z up to 128 bytes.
        assert_eq!(emu.cpu().mem.fetch(0x0080), b'h');
        assert_eq!(emu.cpu().mem.fetch(0x0081), b'i');
        for i in 2..RECORD_SIZE as u16 {
            assert_eq!(emu.cpu().mem.fetch(0x0080 + i), CPM_EOF);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn com_images_truncate_at_tpa_capacity() {
        let image = vec![0xAAu8; addr::TPA_CAPACITY + 0x1000];
        let mut emu = new_emulator();
        emu.load_com(&image);
        let end = addr::TPA + addr::TPA_CAPACITY as u16;
        assert_eq!(emu.cpu().mem.fetch(end - 1), 0xAA);
        assert_eq!(emu.cpu().mem.fetch(end), 0x00);
    }
}
