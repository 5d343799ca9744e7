//! Append-only event log.
//!
//! Operational events (milestones, warnings, task failures) are recorded
//! as JSON lines so the Status and Events tasks can report them back to
//! the control plane. The file handle lives behind a mutex; writers
//! append and sync, readers re-open the file.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hostagent_proto::envelope::{current_timestamp, parse_timestamp};
use serde::{Deserialize, Serialize};

pub const SEVERITY_INFO: &str = "info";
pub const SEVERITY_WARN: &str = "warn";
pub const SEVERITY_CRITICAL: &str = "critical";

pub const TAG_MILESTONE: &str = "milestone";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Event {
    pub timestamp: String,
    pub source: String,
    pub message: String,
    pub severity: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Event {
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

pub struct EventLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl EventLog {
    /// Open or create the event log file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn append(&self, source: &str, message: &str, severity: &str) -> Result<()> {
        self.append_tagged(source, message, severity, Vec::new())
    }

    pub fn append_tagged(
        &self,
        source: &str,
        message: &str,
        severity: &str,
        tags: Vec<String>,
    ) -> Result<()> {
        let event = Event {
            timestamp: current_timestamp(),
            source: source.to_string(),
            message: message.to_string(),
            severity: severity.to_string(),
            tags,
        };
        let line = serde_json::to_string(&event)? + "\n";
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn info(&self, source: &str, message: &str) -> Result<()> {
        self.append(source, message, SEVERITY_INFO)
    }

    pub fn warn(&self, source: &str, message: &str) -> Result<()> {
        self.append(source, message, SEVERITY_WARN)
    }

    pub fn critical(&self, source: &str, message: &str) -> Result<()> {
        self.append(source, message, SEVERITY_CRITICAL)
    }

    pub fn milestone(&self, source: &str, message: &str) -> Result<()> {
        self.append_tagged(
            source,
            message,
            SEVERITY_INFO,
            vec![TAG_MILESTONE.to_string()],
        )
    }

    /// Events strictly newer than `since`, oldest first. Unparseable
    /// lines are skipped rather than failing the whole read.
    pub fn load_since(&self, since: DateTime<Utc>) -> Result<Vec<Event>> {
        let file = File::open(&self.path)
            .with_context(|| format!("failed to read event log {}", self.path.display()))?;
        let reader = BufReader::new(file);

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Event>(&line) else {
                continue;
            };
            match event.parsed_timestamp() {
                Some(t) if t > since => events.push(event),
                _ => {}
            }
        }
        Ok(events)
    }

    /// Events with `start <= timestamp <= end`.
    pub fn load_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut events = self.load_since(start - chrono::Duration::seconds(1))?;
        events.retain(|e| {
            e.parsed_timestamp()
                .map(|t| t >= start && t <= end)
                .unwrap_or(false)
        });
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn append_and_load() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let log = EventLog::open(temp.path())?;

        log.info("test", "first message")?;
        log.warn("test", "second message")?;

        let since = Utc::now() - Duration::minutes(1);
        let events = log.load_since(since)?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first message");
        assert_eq!(events[0].severity, SEVERITY_INFO);
        assert_eq!(events[1].severity, SEVERITY_WARN);
        Ok(())
    }

    #[test]
    fn load_since_filters_old_events() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let log = EventLog::open(temp.path())?;
        log.info("test", "already seen")?;

        let events = log.load_since(Utc::now() + Duration::minutes(1))?;
        assert!(events.is_empty());
        Ok(())
    }

    #[test]
    fn milestone_carries_tag() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let log = EventLog::open(temp.path())?;
        log.milestone("agent", "startup complete")?;

        let events = log.load_since(Utc::now() - Duration::minutes(1))?;
        assert_eq!(events[0].tags, vec![TAG_MILESTONE.to_string()]);
        Ok(())
    }

    #[test]
    fn corrupt_lines_are_skipped() -> Result<()> {
        let temp = NamedTempFile::new()?;
        let log = EventLog::open(temp.path())?;
        log.info("test", "good")?;
        {
            let mut file = OpenOptions::new().append(true).open(temp.path())?;
            file.write_all(b"{broken json\n")?;
        }
        log.info("test", "also good")?;

        let events = log.load_since(Utc::now() - Duration::minutes(1))?;
        assert_eq!(events.len(), 2);
        Ok(())
    }
}
