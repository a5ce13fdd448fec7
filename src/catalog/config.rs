//! INI-style catalog file reader
//!
//! Groups are `[name]` headers followed by `key=value` lines. Group order is
//! preserved because it determines activation order.

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Group '{0}' appears more than once")]
    DuplicateGroup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only view of a parsed catalog file.
#[derive(Debug, Default)]
pub struct ConfigFile {
    order: Vec<String>,
    groups: HashMap<String, HashMap<String, String>>,
}

impl ConfigFile {
    /// Parse a catalog from a string.
    pub fn from_str(content: &str) -> Result<Self, ParseError> {
        let mut config = ConfigFile::default();
        let mut current: Option<String> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim().to_string();
                if config.groups.contains_key(&name) {
                    return Err(ParseError::DuplicateGroup(name));
                }
                config.order.push(name.clone());
                config.groups.insert(name.clone(), HashMap::new());
                current = Some(name);
                continue;
            }

            // Key/value lines outside any group are ignored, like comments.
            let Some(group) = &current else { continue };
            let Some((key, value)) = line.split_once('=') else { continue };
            if let Some(entries) = config.groups.get_mut(group) {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        Ok(config)
    }

    /// Read and parse a catalog file from disk.
    pub fn open(path: &Path) -> Result<Self, ParseError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Group names in file order.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn read_entry(&self, group: &str, key: &str) -> Option<&str> {
        self.groups.get(group)?.get(key).map(String::as_str)
    }

    pub fn read_entry_or(&self, group: &str, key: &str, default: &str) -> String {
        self.read_entry(group, key).unwrap_or(default).to_string()
    }

    pub fn read_bool_entry(&self, group: &str, key: &str) -> bool {
        self.read_entry(group, key).map_or(false, string_to_bool)
    }
}

/// Convert "yes/true/1/on" to bool
fn string_to_bool(s: &str) -> bool {
    matches!(s.to_uppercase().as_str(), "YES" | "TRUE" | "1" | "ON")
}
