//! Guest-filename to host-path translation, mode inference, and the
//! text-mode EOL/^Z translator.
//!
//! Resolution walks, in order: the configured pattern rules, the
//! secondary name map (late-bound additions such as rename targets and
//! command-line files), the lowercased name in the current directory,
//! and finally the name as-is.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::bdos::{CPM_EOF, RECORD_SIZE};

/// How a guest file's bytes are translated to and from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Text,
    Binary,
    /// Inferred from the extension at resolution time.
    Auto,
}

/// Extensions treated as text under `Auto`.
const TEXT_EXTENSIONS: &[&str] = &["BAS", "MAC", "ASM", "TXT", "DOC", "LST", "PRN"];

/// Infer `Text` or `Binary` from a normalized guest name. Unknown
/// extensions are binary; a heuristic content sniff misfires too often.
pub fn infer_mode(guest_name: &str) -> FileMode {
    let ext = match guest_name.rsplit_once('.') {
        Some((_, ext)) => ext,
        None => return FileMode::Binary,
    };
    if TEXT_EXTENSIONS.contains(&ext) {
        FileMode::Text
    } else {
        FileMode::Binary
    }
}

/// Normalize a guest filename: uppercase, spaces stripped.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|&c| c != ' ')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// One configured mapping rule.
#[derive(Debug, Clone)]
pub struct FileMapping {
    /// Normalized guest pattern (exact, `*`, `*.*`, `*.EXT` or `NAME*`).
    pub pattern: String,
    pub host_path: String,
    pub mode: FileMode,
    pub eol_convert: bool,
}

/// A resolved guest name: host path plus concrete translation mode.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub path: String,
    pub mode: FileMode,
    pub eol_convert: bool,
}

/// Ordered mapping rules plus the secondary name map.
pub struct FileMap {
    mappings: Vec<FileMapping>,
    names: BTreeMap<String, String>,
    pub default_mode: FileMode,
    pub default_eol_convert: bool,
}

impl Default for FileMap {
    fn default() -> Self {
        Self {
            mappings: Vec::new(),
            names: BTreeMap::new(),
            default_mode: FileMode::Auto,
            default_eol_convert: true,
        }
    }
}

impl FileMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pattern rule.
    pub fn add_rule(&mut self, pattern: &str, host_path: &str, mode: FileMode, eol_convert: bool) {
        self.mappings.push(FileMapping {
            pattern: normalize_name(pattern),
            host_path: host_path.to_string(),
            mode,
            eol_convert,
        });
    }

    /// Bind a single guest name to a host path in the secondary map.
    pub fn add_name(&mut self, guest_name: &str, host_path: &str) {
        self.names
            .insert(normalize_name(guest_name), host_path.to_string());
    }

    pub fn rules(&self) -> &[FileMapping] {
        &self.mappings
    }

    pub fn names(&self) -> &BTreeMap<String, String> {
        &self.names
    }

    /// Resolve a guest name to a host path and translation mode.
    pub fn resolve(&self, guest_name: &str) -> Option<Resolved> {
        let normalized = normalize_name(guest_name);

        for rule in &self.mappings {
            if pattern_matches(&rule.pattern, &normalized)
                && Path::new(&rule.host_path).exists()
            {
                return Some(Resolved {
                    path: rule.host_path.clone(),
                    mode: self.concrete_mode(rule.mode, &normalized),
                    eol_convert: rule.eol_convert,
                });
            }
        }

        if let Some(path) = self.names.get(&normalized) {
            return Some(Resolved {
                path: path.clone(),
                mode: self.concrete_mode(FileMode::Auto, &normalized),
                eol_convert: self.default_eol_convert,
            });
        }

        let lowercase = normalized.to_lowercase();
        if Path::new(&lowercase).exists() {
            return Some(Resolved {
                path: lowercase,
                mode: self.concrete_mode(FileMode::Auto, &normalized),
                eol_convert: self.default_eol_convert,
            });
        }

        if Path::new(&normalized).exists() {
            return Some(Resolved {
                path: normalized.clone(),
                mode: self.concrete_mode(FileMode::Auto, &normalized),
                eol_convert: self.default_eol_convert,
            });
        }

        None
    }

    /// Collapse `Auto` (first against the map default, then by extension
    /// inference) so open files always carry a concrete mode.
    pub fn concrete_mode(&self, mode: FileMode, guest_name: &str) -> FileMode {
        let mode = match mode {
            FileMode::Auto => self.default_mode,
            other => other,
        };
        match mode {
            FileMode::Auto => infer_mode(guest_name),
            other => other,
        }
    }
}

/// Mapping-pattern match over normalized names: exact, `*`, `*.*`,
/// `*.EXT`, or a trailing `*` on the name portion.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == name || pattern == "*" || pattern == "*.*" {
        return true;
    }

    if let Some(pat_ext) = pattern.strip_prefix("*.") {
        if let Some((_, ext)) = name.rsplit_once('.') {
            return ext == pat_ext;
        }
        return false;
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }

    false
}

/// Characters legal in CP/M filenames.
pub fn valid_cpm_char(c: u8) -> bool {
    let c = c.to_ascii_uppercase();
    c.is_ascii_uppercase()
        || c.is_ascii_digit()
        || matches!(
            c,
            b'$' | b'#' | b'@' | b'!' | b'%' | b'\'' | b'(' | b')' | b'-' | b'{' | b'}' | b'~'
        )
}

/// Project a host filename onto space-padded 8.3 fields. Returns None
/// when the name does not fit or contains characters CP/M cannot show;
/// directory search silently skips such files.
pub fn host_name_to_83(host_name: &str) -> Option<([u8; 8], [u8; 3])> {
    let (name_part, ext_part) = match host_name.rfind('.') {
        Some(pos) if pos > 0 => (&host_name[..pos], &host_name[pos + 1..]),
        _ => (host_name, ""),
    };

    if name_part.len() > 8 || ext_part.len() > 3 {
        return None;
    }

    let mut name = [b' '; 8];
    for (i, &b) in name_part.as_bytes().iter().enumerate() {
        if !valid_cpm_char(b) {
            return None;
        }
        name[i] = b.to_ascii_uppercase();
    }

    let mut ext = [b' '; 3];
    for (i, &b) in ext_part.as_bytes().iter().enumerate() {
        if !valid_cpm_char(b) {
            return None;
        }
        ext[i] = b.to_ascii_uppercase();
    }

    Some((name, ext))
}

/// Truncate a filename to CP/M 8.3 form: uppercased, invalid characters
/// dropped, name cut to 8 and extension to 3.
pub fn to_8_3(filename: &str) -> String {
    let upper = filename.to_uppercase();
    let (name, ext) = match upper.rfind('.') {
        Some(pos) => (&upper[..pos], &upper[pos + 1..]),
        None => (upper.as_str(), ""),
    };

    fn clean(s: &str) -> String {
        s.bytes()
            .filter(|&b| valid_cpm_char(b))
            .map(char::from)
            .collect()
    }

    let clean_name: String = clean(name).chars().take(8).collect();
    let clean_ext: String = clean(ext).chars().take(3).collect();

    let final_name = if clean_name.is_empty() {
        "_".to_string()
    } else {
        clean_name
    };

    if clean_ext.is_empty() {
        final_name
    } else {
        format!("{}.{}", final_name, clean_ext)
    }
}

/// Fill the tail of a 128-byte record with ^Z.
pub fn pad_record(buffer: &mut [u8], len: usize) {
    for byte in buffer.iter_mut().skip(len) {
        *byte = CPM_EOF;
    }
}

/// One open host file, owned by the table entry for its FCB address.
pub struct OpenFile {
    file: File,
    pub mode: FileMode,
    pub eol_convert: bool,
    /// Set on hitting ^Z in text mode; reads report EOF from then on.
    pub eof_seen: bool,
    pub write_mode: bool,
    /// One byte of read pushback used when an expanded `\r\n` pair does
    /// not fit the current record.
    pending: Option<u8>,
}

impl OpenFile {
    /// Wrap a host handle. `mode` must already be concrete.
    pub fn new(file: File, mode: FileMode, eol_convert: bool) -> Self {
        debug_assert!(mode != FileMode::Auto);
        Self {
            file,
            mode,
            eol_convert,
            eof_seen: false,
            write_mode: false,
            pending: None,
        }
    }

    fn next_byte(&mut self) -> std::io::Result<Option<u8>> {
        if let Some(b) = self.pending.take() {
            return Ok(Some(b));
        }
        let mut byte = [0u8; 1];
        match self.file.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Sequential read through the EOL translator. In text mode host
    /// `\n` expands to `\r\n` and a `^Z` sets the sticky EOF marker.
    pub fn read_converted(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        if self.eof_seen {
            return Ok(0);
        }

        if self.mode == FileMode::Binary || !self.eol_convert {
            let n = self.read_raw(buffer)?;
            if self.mode == FileMode::Text {
                for i in 0..n {
                    if buffer[i] == CPM_EOF {
                        self.eof_seen = true;
                        return Ok(i);
                    }
                }
            }
            return Ok(n);
        }

        let mut out = 0;
        while out < buffer.len() {
            let ch = match self.next_byte()? {
                Some(ch) => ch,
                None => break,
            };
            match ch {
                b'\n' => {
                    if out + 1 < buffer.len() {
                        buffer[out] = b'\r';
                        buffer[out + 1] = b'\n';
                        out += 2;
                    } else {
                        // No room for the pair; hold the byte for the
                        // next record.
                        self.pending = Some(b'\n');
                        break;
                    }
                }
                CPM_EOF => {
                    self.eof_seen = true;
                    break;
                }
                _ => {
                    buffer[out] = ch;
                    out += 1;
                }
            }
        }
        Ok(out)
    }

    /// Sequential write through the EOL translator. In text mode `\r\n`
    /// collapses to `\n` and the record ends at the first `^Z`.
    pub fn write_converted(&mut self, buffer: &[u8]) -> std::io::Result<usize> {
        if self.mode == FileMode::Binary || !self.eol_convert {
            self.file.write_all(buffer)?;
            self.file.flush()?;
            return Ok(buffer.len());
        }

        let mut converted = Vec::with_capacity(buffer.len());
        for (i, &ch) in buffer.iter().enumerate() {
            if ch == CPM_EOF {
                break;
            }
            if ch == b'\r' && buffer.get(i + 1) == Some(&b'\n') {
                continue;
            }
            converted.push(ch);
        }
        self.file.write_all(&converted)?;
        self.file.flush()?;
        Ok(converted.len())
    }

    /// Seek the host handle to a 128-byte record boundary. Random access
    /// always seeks explicitly; guest bookkeeping is not trusted.
    pub fn seek_record(&mut self, record: u32) -> std::io::Result<()> {
        self.file
            .seek(SeekFrom::Start(u64::from(record) * RECORD_SIZE as u64))?;
        Ok(())
    }

    /// Raw read that fills as much of the buffer as the file allows.
    pub fn read_raw(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        let mut total = 0;
        while total < buffer.len() {
            match self.file.read(&mut buffer[total..])? {
                0 => break,
                n => total += n,
            }
        }
        Ok(total)
    }

    /// Raw write of a full buffer.
    pub fn write_raw(&mut self, buffer: &[u8]) -> std::io::Result<()> {
        self.file.write_all(buffer)?;
        self.file.flush()?;
        Ok(())
    }
}
