// src/utils/error_log.rs
//
// Append-only run error log, one `<subject>|<tag>|<ISO-8601 timestamp>`
// line per failed code.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RunErrorLog {
    path: PathBuf,
}

impl RunErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, subject: &str, tag: &str) -> Result<()> {
        self.append_at(subject, tag, Local::now())
    }

    pub fn append_at(&self, subject: &str, tag: &str, at: DateTime<Local>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create error log dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open error log {}", self.path.display()))?;
        writeln!(file, "{}", format_line(subject, tag, at))
            .with_context(|| format!("Failed to append to error log {}", self.path.display()))
    }
}

pub fn format_line(subject: &str, tag: &str, at: DateTime<Local>) -> String {
    format!("{}|{}|{}", subject, tag, at.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_format_line() {
        let at = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let line = format_line("3003.csv", "create_project_fail", at);
        assert!(line.starts_with("3003.csv|create_project_fail|2024-03-01T12:30:00"));
    }

    #[test]
    fn test_append_creates_dir_and_appends() {
        let dir = tempdir().unwrap();
        let log = RunErrorLog::new(dir.path().join("log").join("log.txt"));
        log.append("3003.csv", "create_project_fail").unwrap();
        log.append("4004", "persist_fail").unwrap();

        let content = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("3003.csv|create_project_fail|"));
        assert!(lines[1].starts_with("4004|persist_fail|"));
    }
}
