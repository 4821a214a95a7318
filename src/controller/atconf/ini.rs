//! Minimal INI reader/writer for admintools.conf
//!
//! Sections and keys keep their file order so that a rewritten file diffs
//! cleanly against the original. Keys are case sensitive. Comment lines
//! (`#` or `;`) are dropped on load.

use std::fmt::Write as _;

use crate::error::{Error, Result};

/// Name of the implicit section holding keys that appear before any header
pub const DEFAULT_SECTION: &str = "DEFAULT";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or overwrite a key; new keys are appended
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        before != self.entries.len()
    }

    pub fn items(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An INI document, owned and mutated by a single caller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IniFile {
    sections: Vec<Section>,
}

impl IniFile {
    pub fn parse(text: &str) -> Result<Self> {
        let mut ini = IniFile::default();
        let mut current: Option<usize> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let Some(name) = rest.strip_suffix(']') else {
                    return Err(Error::ConfigParseError {
                        line: line_no,
                        message: format!("unterminated section header: {line}"),
                    });
                };
                let name = name.trim();
                if name.is_empty() {
                    return Err(Error::ConfigParseError {
                        line: line_no,
                        message: "empty section name".to_string(),
                    });
                }
                current = Some(ini.section_index_or_insert(name));
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::ConfigParseError {
                    line: line_no,
                    message: format!("expected key = value, got: {line}"),
                });
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::ConfigParseError {
                    line: line_no,
                    message: "missing key before '='".to_string(),
                });
            }
            let section = match current {
                Some(i) => i,
                None => ini.section_index_or_insert(DEFAULT_SECTION),
            };
            ini.sections[section].set(key, value.trim());
        }
        Ok(ini)
    }

    fn section_index_or_insert(&mut self, name: &str) -> usize {
        match self.sections.iter().position(|s| s.name == name) {
            Some(i) => i,
            None => {
                self.sections.push(Section::new(name));
                self.sections.len() - 1
            }
        }
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Mutable access to a section, creating it at the end if missing
    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        let i = self.section_index_or_insert(name);
        &mut self.sections[i]
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?.get(key)
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.section_mut(section).set(key, value);
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    /// Serialize using `delimiter` between key and value (e.g. `" = "`)
    pub fn write_to_string(&self, delimiter: &str) -> String {
        let mut out = String::new();
        let mut first = true;
        for section in &self.sections {
            if section.name == DEFAULT_SECTION && section.is_empty() {
                continue;
            }
            if !first {
                out.push('\n');
            }
            first = false;
            let _ = writeln!(out, "[{}]", section.name);
            for (k, v) in section.items() {
                let _ = writeln!(out, "{k}{delimiter}{v}");
            }
        }
        out
    }
}
