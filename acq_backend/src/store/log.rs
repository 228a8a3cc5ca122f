//! The `.log` file: an append-only, newline-delimited JSON record per directory.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use crate::error::Result;

pub const LOG_FILE: &str = ".log";

/// Keys owned by [`LogEntry`] itself; extras may not use them.
pub const RESERVED_KEYS: [&str; 4] = ["__timestamp__", "__message__", "source", "subdir"];

/// One line of a directory log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "__timestamp__")]
    pub timestamp: f64,
    #[serde(rename = "__message__")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Path of the originating descendant relative to the directory that was read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogEntry {
    pub fn new(message: &str) -> Self {
        Self {
            timestamp: crate::clock::now(),
            message: message.to_string(),
            source: None,
            subdir: None,
            extra: Map::new(),
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra.extend(extra);
        self
    }
}

/// First extra key that would collide with an entry field.
pub(crate) fn reserved_extra(entry: &LogEntry) -> Option<&str> {
    entry
        .extra
        .keys()
        .map(String::as_str)
        .find(|k| RESERVED_KEYS.contains(k))
}

pub(crate) fn append(dir: &Path, entry: &LogEntry) -> Result<()> {
    let line = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))?;
    file.write_all(format!("{}\n", line).as_bytes())?;
    Ok(())
}

/// Reads the complete raw log; a missing file is an empty log.
pub(crate) fn read_raw(dir: &Path) -> Result<String> {
    match fs::read_to_string(dir.join(LOG_FILE)) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Parses raw log text. Unparseable lines (e.g. a torn final line) are skipped.
pub(crate) fn parse(text: &str) -> Vec<LogEntry> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str::<LogEntry>(l) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed log line");
                None
            }
        })
        .collect()
}

/// Stable time ordering; ties broken by subdirectory path (own entries first).
pub(crate) fn sort_entries(entries: &mut [LogEntry]) {
    entries.sort_by(|a, b| {
        a.timestamp
            .total_cmp(&b.timestamp)
            .then_with(|| a.subdir.as_deref().unwrap_or("").cmp(b.subdir.as_deref().unwrap_or("")))
    });
}
