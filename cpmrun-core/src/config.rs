//! Line-oriented `key = value` configuration files.
//!
//! Recognized keys: `program`, `cd`/`chdir`, `default_mode`, `debug`,
//! `eol_convert`, `printer`, `aux_input`, `aux_output`. Any other key is
//! a guest-name pattern mapping whose value is a host path, optionally
//! followed by `text` or `binary`. Values may reference host environment
//! variables as `$VAR` or `${VAR}`. Invalid lines warn to stderr and are
//! skipped. `cd` takes effect while loading so that later relative
//! mappings resolve against the new directory.

use std::fs;
use std::path::Path;

use crate::error::{CpmError, CpmResult};
use crate::filemap::FileMode;

/// One pattern mapping from a config file, with its mode resolved
/// against the defaults in force at that line.
#[derive(Debug, Clone)]
pub struct ConfigMapping {
    pub pattern: String,
    pub host_path: String,
    pub mode: FileMode,
    pub eol_convert: bool,
}

/// Parsed configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub program: Option<String>,
    pub default_mode: FileMode,
    pub default_eol_convert: bool,
    pub debug: bool,
    pub printer: Option<String>,
    pub aux_input: Option<String>,
    pub aux_output: Option<String>,
    pub mappings: Vec<ConfigMapping>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            program: None,
            default_mode: FileMode::Auto,
            default_eol_convert: true,
            debug: false,
            printer: None,
            aux_input: None,
            aux_output: None,
            mappings: Vec::new(),
        }
    }
}

impl Config {
    /// Load a config file, applying `cd` directives as they appear.
    pub fn load(path: &Path) -> CpmResult<Config> {
        let text = fs::read_to_string(path).map_err(|e| CpmError::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::parse(&text, &path.display().to_string()))
    }

    /// Parse config text. Separated from `load` so tests can feed
    /// literal text without touching the filesystem.
    pub fn parse(text: &str, origin: &str) -> Config {
        let mut config = Config::default();

        for (index, raw_line) in text.lines().enumerate() {
            let line_num = index + 1;

            let line = match raw_line.find('#') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => {
                    eprintln!("{origin}:{line_num}: invalid line (missing =), skipped");
                    continue;
                }
            };

            let value = expand_env_vars(value);

            match key {
                "program" => config.program = Some(value),
                "cd" | "chdir" => {
                    if let Err(e) = std::env::set_current_dir(&value) {
                        eprintln!("{origin}:{line_num}: cannot change directory to '{value}': {e}");
                    }
                }
                "default_mode" => {
                    config.default_mode = match value.as_str() {
                        "text" => FileMode::Text,
                        "binary" => FileMode::Binary,
                        _ => FileMode::Auto,
                    }
                }
                "debug" => config.debug = is_truthy(&value),
                "eol_convert" => config.default_eol_convert = is_truthy(&value),
                "printer" => config.printer = Some(value),
                "aux_input" => config.aux_input = Some(value),
                "aux_output" => config.aux_output = Some(value),
                pattern => {
                    // A mapping line: path with an optional trailing mode
                    // word.
                    let mut host_path = value.as_str();
                    let mut mode = config.default_mode;
                    let mut eol_convert = config.default_eol_convert;
                    if let Some((head, tail)) = value.rsplit_once(' ') {
                        match tail {
                            "text" => {
                                mode = FileMode::Text;
                                host_path = head.trim_end();
                            }
                            "binary" => {
                                mode = FileMode::Binary;
                                eol_convert = false;
                                host_path = head.trim_end();
                            }
                            _ => {}
                        }
                    }
                    config.mappings.push(ConfigMapping {
                        pattern: pattern.to_string(),
                        host_path: host_path.to_string(),
                        mode,
                        eol_convert,
                    });
                }
            }
        }

        config
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes")
}

/// Expand `$VAR` and `${VAR}` references from the host environment.
/// Unknown variables expand to nothing.
pub fn expand_env_vars(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = String::with_capacity(input.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            result.push(bytes[i] as char);
            i += 1;
            continue;
        }
        i += 1;

        let name: String = if i < bytes.len() && bytes[i] == b'{' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i] != b'}' {
                i += 1;
            }
            let name = input[start..i].to_string();
            if i < bytes.len() {
                i += 1; // closing brace
            }
            name
        } else {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            input[start..i].to_string()
        };

        if let Ok(value) = std::env::var(&name) {
            result.push_str(&value);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_directives_and_mappings() {
        let text = "\
# comment line
program = hello.com
default_mode = text
debug = yes
INPUT.TXT = ./data/input.txt
*.DAT = ./blobs/any.dat binary
";
        let config = Config::parse(text, "test.cfg");
        assert_eq!(config.program.as_deref(), Some("hello.com"));
        assert_eq!(config.default_mode, FileMode::Text);
        assert!(config.debug);

        assert_eq!(config.mappings.len(), 2);
        let first = &config.mappings[0];
        assert_eq!(first.pattern, "INPUT.TXT");
        assert_eq!(first.host_path, "./data/input.txt");
        assert_eq!(first.mode, FileMode::Text); // default in force

        let second = &config.mappings[1];
        assert_eq!(second.host_path, "./blobs/any.dat");
        assert_eq!(second.mode, FileMode::Binary);
        assert!(!second.eol_convert);
    }

    #[test]
    fn invalid_lines_are_skipped() {
        let config = Config::parse("no equals sign here\nprogram = x.com\n", "test.cfg");
        assert_eq!(config.program.as_deref(), Some("x.com"));
        assert!(config.mappings.is_empty());
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let config = Config::parse("\n# only a comment\nprogram = y.com # trailing\n", "t.cfg");
        assert_eq!(config.program.as_deref(), Some("y.com"));
    }

    #[test]
    fn env_var_expansion() {
        std::env::set_var("CPMRUN_TEST_VAR", "expanded");
        assert_eq!(expand_env_vars("$CPMRUN_TEST_VAR/file"), "expanded/file");
        assert_eq!(
            expand_env_vars("pre${CPMRUN_TEST_VAR}post"),
            "preexpandedpost"
        );
        assert_eq!(expand_env_vars("$CPMRUN_UNSET_VAR_X/f"), "/f");
        assert_eq!(expand_env_vars("plain"), "plain");
    }
}
