//! Console I/O abstraction.
//!
//! The emulator talks to its terminal through `CpmConsole` and keeps the
//! CP/M-side conventions (LF-to-CR translation, ^C accounting) in the
//! BDOS layer, so implementations deal in raw bytes only. The scripted
//! implementation drives whole guest programs in tests: input comes from
//! a pre-written script, and when the script runs dry a blocking read
//! reports `^Z`, the CP/M end-of-input byte, instead of hanging the
//! test.

use crate::bdos::CPM_EOF;

/// Console interface for CP/M character I/O.
pub trait CpmConsole: Send {
    /// Send one byte to the display.
    fn emit(&mut self, ch: u8);

    /// True when a key is waiting to be read.
    fn input_ready(&self) -> bool;

    /// Take the next key without blocking.
    fn poll_key(&mut self) -> Option<u8>;

    /// Block until a key arrives. The default implementation spins on
    /// `poll_key`.
    fn read_key(&mut self) -> u8 {
        loop {
            if let Some(key) = self.poll_key() {
                return key;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

/// Test console driven by a pre-written input script.
#[derive(Default)]
pub struct ScriptedConsole {
    script: Vec<u8>,
    cursor: usize,
    output: Vec<u8>,
}

impl ScriptedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Console whose input script is fixed up front.
    pub fn from_script(script: &[u8]) -> Self {
        Self {
            script: script.to_vec(),
            cursor: 0,
            output: Vec::new(),
        }
    }

    /// Append bytes to the input script.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.script.extend_from_slice(bytes);
    }

    /// Everything the guest wrote, as raw bytes.
    pub fn output_bytes(&self) -> &[u8] {
        &self.output
    }

    /// Everything the guest wrote, as text.
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl CpmConsole for ScriptedConsole {
    fn emit(&mut self, ch: u8) {
        self.output.push(ch);
    }

    fn input_ready(&self) -> bool {
        self.cursor < self.script.len()
    }

    fn poll_key(&mut self) -> Option<u8> {
        let key = self.script.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(key)
    }

    fn read_key(&mut self) -> u8 {
        // End of script reads as ^Z rather than blocking forever.
        self.poll_key().unwrap_or(CPM_EOF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_guest_output() {
        let mut console = ScriptedConsole::new();
        for &b in b"READY\r\n" {
            console.emit(b);
        }
        assert_eq!(console.output_bytes(), b"READY\r\n");
        assert_eq!(console.output_text(), "READY\r\n");
    }

    #[test]
    fn script_drains_in_order_then_reads_eof() {
        let mut console = ScriptedConsole::from_script(b"OK");
        assert!(console.input_ready());
        assert_eq!(console.poll_key(), Some(b'O'));
        assert_eq!(console.read_key(), b'K');
        assert!(!console.input_ready());
        assert_eq!(console.poll_key(), None);
        assert_eq!(console.read_key(), CPM_EOF);
    }

    #[test]
    fn feed_extends_a_drained_script() {
        let mut console = ScriptedConsole::new();
        assert_eq!(console.read_key(), CPM_EOF);
        console.feed(&[0x03]);
        assert!(console.input_ready());
        assert_eq!(console.read_key(), 0x03);
    }
}
