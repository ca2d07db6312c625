use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::pool::WorkItem;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Claimed,
    Transferred,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LedgerEntry {
    pub timestamp: String,
    pub session_id: String,
    pub worker: String,
    pub path: PathBuf,
    pub size: u64,
    pub status: TransferStatus,
    pub error: Option<String>,
}

impl LedgerEntry {
    pub fn new(session_id: &str, worker: &str, item: &WorkItem, status: TransferStatus) -> Self {
        LedgerEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            worker: worker.to_string(),
            path: item.path.clone(),
            size: item.size,
            status,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Append-only JSONL record of work-item transitions on the coordinator
pub struct TransferLedger {
    log_file_path: PathBuf,
    lock: Mutex<()>,
}

impl TransferLedger {
    pub fn new(path: &Path) -> Self {
        TransferLedger {
            log_file_path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn add_entry(&self, entry: &LedgerEntry) -> Result<()> {
        let _guard = self.lock.lock();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer ledger")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<LedgerEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer ledger for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
