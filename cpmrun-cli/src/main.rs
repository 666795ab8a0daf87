//! cpmrun - run unmodified CP/M 2.2 `.COM` programs from the command
//! line.
//!
//! Usage:
//!   cpmrun [options] <program.com|config.cfg> [args...]
//!
//! Examples:
//!   cpmrun mbasic.com                 # run in Z80 mode
//!   cpmrun --8080 asm.com prog.asm    # 8080 mode with a guest argument
//!   cpmrun project.cfg                # file mappings from a config file
//!   cpmrun --int-cycles=50000 game.com

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::tty::IsTty;

use cpmrun_core::{
    BiosDiskPolicy, Config, CpmConsole, CpmEmulator, CpmExitInfo, CpmResult, CpuMode, ExitReason,
};

/// Run CP/M 2.2 programs
#[derive(Parser, Debug)]
#[command(name = "cpmrun")]
#[command(about = "Run CP/M 2.2 .COM programs on the host")]
struct Args {
    /// Run in Intel 8080 mode
    #[arg(long = "8080", conflicts_with = "z80")]
    mode_8080: bool,

    /// Run in Z80 mode (default)
    #[arg(long)]
    z80: bool,

    /// Report progress every N million instructions
    #[arg(
        long,
        value_name = "N",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "100"
    )]
    progress: Option<u64>,

    /// Save guest memory to PATH on exit
    #[arg(long = "save-memory", value_name = "PATH")]
    save_memory: Option<PathBuf>,

    /// Restrict the memory dump to a START-END range (hex)
    #[arg(long = "save-range", value_name = "HEX-HEX")]
    save_range: Option<String>,

    /// Arm a periodic maskable interrupt every N cycles
    #[arg(long = "int-cycles", value_name = "N")]
    int_cycles: Option<u64>,

    /// RST number used as the interrupt vector
    #[arg(long = "int-rst", value_name = "0-7", default_value_t = 7)]
    int_rst: u8,

    /// `.COM` program or `.cfg` configuration file
    program: PathBuf,

    /// Guest command-line arguments
    args: Vec<String>,
}

/// Console fed by the input pump through a channel.
struct ChannelConsole {
    key_rx: mpsc::Receiver<u8>,
    key_buffer: Vec<u8>,
}

impl ChannelConsole {
    fn new(key_rx: mpsc::Receiver<u8>) -> Self {
        Self {
            key_rx,
            key_buffer: Vec::new(),
        }
    }
}

impl CpmConsole for ChannelConsole {
    fn emit(&mut self, ch: u8) {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        match ch {
            0x0D => {
                let _ = handle.write_all(b"\r");
            }
            0x0A => {
                let _ = handle.write_all(b"\n");
            }
            0x08 => {
                let _ = handle.write_all(b"\x08");
            }
            _ => {
                let _ = handle.write_all(&[ch]);
            }
        }
        let _ = handle.flush();
    }

    fn input_ready(&self) -> bool {
        !self.key_buffer.is_empty()
    }

    fn poll_key(&mut self) -> Option<u8> {
        if !self.key_buffer.is_empty() {
            return Some(self.key_buffer.remove(0));
        }
        self.key_rx.try_recv().ok()
    }

    fn read_key(&mut self) -> u8 {
        if !self.key_buffer.is_empty() {
            return self.key_buffer.remove(0);
        }
        // A closed channel reads as ^Z, the CP/M end-of-input.
        self.key_rx.recv().unwrap_or(0x1A)
    }
}

/// Translate a crossterm key event to a CP/M byte.
fn translate_key(code: KeyCode, modifiers: KeyModifiers) -> Option<u8> {
    if modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char(c) = code {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() {
                return Some(upper as u8 - 64); // Ctrl+A=1, Ctrl+C=3, ...
            }
        }
    }

    match code {
        KeyCode::Char(c) => Some(c as u8),
        KeyCode::Enter => Some(13),
        KeyCode::Backspace => Some(8),
        KeyCode::Tab => Some(9),
        KeyCode::Esc => Some(27),
        KeyCode::Up => Some(11),
        KeyCode::Down => Some(10),
        KeyCode::Left => Some(8),
        KeyCode::Right => Some(12),
        _ => None,
    }
}

/// Parse a `START-END` hex range.
fn parse_save_range(spec: &str) -> Option<(u16, u16)> {
    let (start, end) = spec.split_once('-')?;
    let start = u16::from_str_radix(start.trim_start_matches("0x"), 16).ok()?;
    let end = u16::from_str_radix(end.trim_start_matches("0x"), 16).ok()?;
    Some((start, end))
}

/// Dump a slice of guest memory to a host file.
fn save_memory<C: CpmConsole>(
    emu: &CpmEmulator<C>,
    path: &PathBuf,
    range: Option<(u16, u16)>,
) {
    let (start, end) = range.unwrap_or((0x0000, 0xFFFF));
    let (start, end) = (start as usize, end as usize);
    if end < start {
        eprintln!("save-range end below start, skipping memory dump");
        return;
    }
    let bytes = &emu.cpu().mem.as_slice()[start..=end];
    match std::fs::write(path, bytes) {
        Ok(()) => eprintln!(
            "saved {} bytes ({:#06x}-{:#06x}) to {}",
            bytes.len(),
            start,
            end,
            path.display()
        ),
        Err(e) => eprintln!("failed to save memory to {}: {}", path.display(), e),
    }
}

/// Parse a comma-separated number list from a debug environment variable.
fn parse_debug_list<T: std::str::FromStr>(value: &str) -> Vec<T> {
    value.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}

/// Apply environment-variable configuration to a fresh emulator.
fn apply_environment<C: CpmConsole>(emu: &mut CpmEmulator<C>) {
    if let Ok(path) = std::env::var("CPM_PRINTER") {
        emu.devices_mut().set_printer_path(&path);
    }
    if let Ok(path) = std::env::var("CPM_AUX_IN") {
        emu.devices_mut().set_aux_input_path(&path);
    }
    if let Ok(path) = std::env::var("CPM_AUX_OUT") {
        emu.devices_mut().set_aux_output_path(&path);
    }

    if let Ok(value) = std::env::var("CPM_BIOS_DISK") {
        match BiosDiskPolicy::parse(&value) {
            Some(policy) => emu.set_bios_disk_policy(policy),
            None => eprintln!(
                "warning: invalid CPM_BIOS_DISK value '{value}' (use ok, fail, or error)"
            ),
        }
    }

    if let Ok(value) = std::env::var("CPM_DEBUG_BDOS") {
        emu.debug_bdos.extend(parse_debug_list::<u8>(&value));
    }
    if let Ok(value) = std::env::var("CPM_DEBUG_BIOS") {
        emu.debug_bios.extend(parse_debug_list::<usize>(&value));
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mode = if args.mode_8080 && !args.z80 {
        CpuMode::I8080
    } else {
        CpuMode::Z80
    };

    let (key_tx, key_rx) = mpsc::channel::<u8>();
    let console = ChannelConsole::new(key_rx);
    let mut emu = CpmEmulator::new(mode, console);

    apply_environment(&mut emu);

    // A .cfg positional configures mappings and names the program.
    let is_config = args
        .program
        .extension()
        .map(|e| e.eq_ignore_ascii_case("cfg"))
        .unwrap_or(false);

    let program_path = if is_config {
        let config = match Config::load(&args.program) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        };

        emu.debug = config.debug;
        emu.file_map_mut().default_mode = config.default_mode;
        emu.file_map_mut().default_eol_convert = config.default_eol_convert;
        for mapping in &config.mappings {
            emu.file_map_mut().add_rule(
                &mapping.pattern,
                &mapping.host_path,
                mapping.mode,
                mapping.eol_convert,
            );
        }
        if let Some(path) = &config.printer {
            emu.devices_mut().set_printer_path(path);
        }
        if let Some(path) = &config.aux_input {
            emu.devices_mut().set_aux_input_path(path);
        }
        if let Some(path) = &config.aux_output {
            emu.devices_mut().set_aux_output_path(path);
        }

        match config.program {
            Some(p) => PathBuf::from(p),
            None => {
                eprintln!("error: no 'program' directive in {}", args.program.display());
                return ExitCode::FAILURE;
            }
        }
    } else {
        args.program.clone()
    };

    // Guest arguments naming real host files become name mappings, both
    // under the full name and its 8.3 truncation.
    for arg in &args.args {
        if std::path::Path::new(arg).is_file() {
            let base = arg.rsplit(['/', '\\']).next().unwrap_or(arg).to_uppercase();
            emu.file_map_mut().add_name(&base, arg);
            let truncated = cpmrun_core::filemap::to_8_3(&base);
            if truncated != base {
                emu.file_map_mut().add_name(&truncated, arg);
            }
        }
    }

    let image = match std::fs::read(&program_path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("error: cannot open {}: {}", program_path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    emu.load_com(&image);
    emu.set_command_tail(&args.args);
    eprintln!(
        "loaded {} bytes from {} ({} mode)",
        image.len().min(0xE000),
        program_path.display(),
        if args.mode_8080 { "8080" } else { "Z80" }
    );

    // Progress: CLI value in millions wins over CPM_PROGRESS.
    let progress_millions = args.progress.or_else(|| {
        std::env::var("CPM_PROGRESS")
            .ok()
            .and_then(|v| v.parse().ok())
    });
    if let Some(millions) = progress_millions {
        emu.set_progress_interval(millions.saturating_mul(1_000_000));
    }

    if let Some(cycles) = args.int_cycles {
        eprintln!("interrupts: RST {} every {} cycles", args.int_rst & 7, cycles);
        emu.set_interrupt_tick(cycles, args.int_rst);
    }

    // Raw mode and the input pump. A real terminal is polled through
    // crossterm events; piped stdin is pumped byte by byte.
    let stdin_is_tty = std::io::stdin().is_tty();
    let raw_mode_enabled = stdin_is_tty && enable_raw_mode().is_ok();

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    let input_handle = if stdin_is_tty {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {
                        while event::poll(Duration::from_millis(0)).unwrap_or(false) {
                            if let Ok(Event::Key(key)) = event::read() {
                                if let Some(ch) = translate_key(key.code, key.modifiers) {
                                    if key_tx.send(ch).is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        })
    } else {
        tokio::task::spawn_blocking(move || {
            let mut stdin = std::io::stdin().lock();
            let mut byte = [0u8; 1];
            while let Ok(1) = stdin.read(&mut byte) {
                if key_tx.send(byte[0]).is_err() {
                    break;
                }
            }
        })
    };

    // The emulator itself is synchronous and single-threaded.
    let (emu, result) = match tokio::task::spawn_blocking(move || {
        let result = emu.run();
        (emu, result)
    })
    .await
    {
        Ok(pair) => pair,
        Err(e) => {
            if raw_mode_enabled {
                let _ = disable_raw_mode();
            }
            eprintln!("error: emulator task failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _ = shutdown_tx.send(()).await;
    input_handle.abort();

    if raw_mode_enabled {
        let _ = disable_raw_mode();
    }

    let save_range = args.save_range.as_deref().and_then(parse_save_range);
    exit_code(&emu, result, args.save_memory.as_ref(), save_range)
}

fn exit_code<C: CpmConsole>(
    emu: &CpmEmulator<C>,
    result: CpmResult<CpmExitInfo>,
    dump_path: Option<&PathBuf>,
    dump_range: Option<(u16, u16)>,
) -> ExitCode {
    match result {
        Ok(info) => {
            if let Some(path) = dump_path {
                save_memory(emu, path, dump_range);
            }
            match info.reason {
                ExitReason::WarmBoot | ExitReason::CtrlC | ExitReason::InstructionLimit => {
                    ExitCode::SUCCESS
                }
                ExitReason::Halted => ExitCode::FAILURE,
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_range_parsing() {
        assert_eq!(parse_save_range("DC00-FFFF"), Some((0xDC00, 0xFFFF)));
        assert_eq!(parse_save_range("0x100-0x1FF"), Some((0x0100, 0x01FF)));
        assert_eq!(parse_save_range("nope"), None);
    }

    #[test]
    fn control_keys_translate_to_low_bytes() {
        assert_eq!(
            translate_key(KeyCode::Char('c'), KeyModifiers::CONTROL),
            Some(3)
        );
        assert_eq!(translate_key(KeyCode::Enter, KeyModifiers::NONE), Some(13));
        assert_eq!(
            translate_key(KeyCode::Char('A'), KeyModifiers::NONE),
            Some(b'A')
        );
    }

    #[test]
    fn debug_lists_parse_comma_separated_numbers() {
        assert_eq!(parse_debug_list::<u8>("1, 2,15"), vec![1, 2, 15]);
        assert_eq!(parse_debug_list::<usize>("9,junk,12"), vec![9, 12]);
    }
}
