//! Append-only JSONL journal of transfer-session events

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::openmode::OpenMode;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Opened,
    Closed,
    Push,
    Pull,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JournalEntry {
    pub timestamp: String,
    pub uuid: String,
    pub path: PathBuf,
    pub open_mode: String,
    pub event: SessionEvent,
    pub bytes: i64,
}

/// One journal file per daemon, shared by all sessions. Entries are
/// line-delimited JSON so an interrupted daemon leaves a readable log.
pub struct TransferJournal {
    log_file_path: PathBuf,
}

impl TransferJournal {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        TransferJournal {
            log_file_path: path.as_ref().to_path_buf(),
        }
    }

    fn add_entry(&self, entry: JournalEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn entry(uuid: &Uuid, path: &Path, mode: OpenMode, event: SessionEvent, bytes: i64) -> JournalEntry {
        JournalEntry {
            timestamp: Utc::now().to_rfc3339(),
            uuid: uuid.to_string(),
            path: path.to_path_buf(),
            open_mode: mode.to_string(),
            event,
            bytes,
        }
    }

    pub fn opened(&self, uuid: &Uuid, path: &Path, mode: OpenMode, size: i64) -> Result<()> {
        self.add_entry(Self::entry(uuid, path, mode, SessionEvent::Opened, size))
    }

    pub fn closed(&self, uuid: &Uuid, path: &Path, mode: OpenMode) -> Result<()> {
        self.add_entry(Self::entry(uuid, path, mode, SessionEvent::Closed, 0))
    }

    pub fn pushed(&self, uuid: &Uuid, path: &Path, mode: OpenMode, bytes: i64) -> Result<()> {
        self.add_entry(Self::entry(uuid, path, mode, SessionEvent::Push, bytes))
    }

    pub fn pulled(&self, uuid: &Uuid, path: &Path, mode: OpenMode, bytes: i64) -> Result<()> {
        self.add_entry(Self::entry(uuid, path, mode, SessionEvent::Pull, bytes))
    }

    pub fn read_log(&self) -> Result<Vec<JournalEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path).context("Failed to open transfer journal")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}
