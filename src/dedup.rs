//! Persistent `message id -> archive id` records used to make retried deliveries idempotent.
//!
//! The store is an append-only log of JSON lines. It is replayed on open and
//! rewritten without dead lines at startup and whenever dead lines outnumber
//! live records. Records older than the retention period are dropped by that
//! rewrite.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Log length below which the file is never compacted.
const COMPACT_MIN_LINES: usize = 1024;

/// One log line: a record, or a removal when `aid` is absent.
#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    mid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aid: Option<String>,
    #[serde(default)]
    at: i64,
}

#[derive(Debug, Clone)]
struct Record {
    archive_id: String,
    at: i64,
}

/// State of a message id, as seen by [`DedupStore::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// A backend write already succeeded under this archive id.
    Stored(String),
    /// Another delivery of the same message is being archived.
    Pending,
    /// The id was free and is now marked pending for the caller.
    Acquired,
}

/// One store per stage. Every mutation is synced to disk before returning.
///
/// Pending marks live in memory only: nothing is in flight after a restart.
#[derive(Debug)]
pub struct DedupStore {
    path: PathBuf,
    log: File,
    lines: usize,
    records: HashMap<String, Record>,
    pending: HashSet<String>,
    retention: Option<Duration>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn replay(path: &Path) -> Result<HashMap<String, Record>, Error> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = HashMap::new();
    let mut lines = content.split(|&b| b == b'\n').peekable();
    while let Some(line) = lines.next() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let line: LogLine = match serde_json::from_slice(line) {
            Ok(line) => line,
            // torn write at the tail
            Err(e) if lines.peek().is_none() => {
                log::warn!("Ignoring truncated record at the end of {}: {e}", path.display());
                break;
            }
            Err(e) => return Err(e.into()),
        };
        match line.aid {
            Some(archive_id) => {
                records.insert(line.mid, Record { archive_id, at: line.at });
            }
            None => {
                records.remove(&line.mid);
            }
        }
    }
    Ok(records)
}

impl DedupStore {
    /// Opens the store at `path`, creating an empty one if missing.
    pub fn open(path: impl AsRef<Path>, retention: Option<Duration>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let records = replay(&path)?;
        let log = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut store = Self {
            path,
            log,
            lines: 0,
            records,
            pending: HashSet::new(),
            retention,
        };
        store.compact()?;
        log::debug!(
            "Opened dedup store {} with {} records",
            store.path.display(),
            store.records.len()
        );
        Ok(store)
    }

    pub fn get(&self, message_id: &str) -> Option<&str> {
        self.records
            .get(message_id)
            .map(|record| record.archive_id.as_str())
    }

    /// Returns the stored archive id, or marks the id pending if nobody holds it.
    pub fn claim(&mut self, message_id: &str) -> Claim {
        if let Some(archive_id) = self.get(message_id) {
            return Claim::Stored(archive_id.to_string());
        }
        if self.pending.insert(message_id.to_string()) {
            Claim::Acquired
        } else {
            Claim::Pending
        }
    }

    /// Drops the pending mark without recording anything.
    pub fn release(&mut self, message_id: &str) {
        self.pending.remove(message_id);
    }

    /// Records the archive id, replacing any pending mark.
    pub fn insert(&mut self, message_id: &str, archive_id: &str) -> Result<(), Error> {
        let at = now();
        self.append(&LogLine {
            mid: message_id.to_string(),
            aid: Some(archive_id.to_string()),
            at,
        })?;
        self.records.insert(
            message_id.to_string(),
            Record {
                archive_id: archive_id.to_string(),
                at,
            },
        );
        self.pending.remove(message_id);
        self.maybe_compact();
        Ok(())
    }

    /// Removes a record, returning whether it existed.
    pub fn remove(&mut self, message_id: &str) -> Result<bool, Error> {
        if !self.records.contains_key(message_id) {
            return Ok(false);
        }
        self.append(&LogLine {
            mid: message_id.to_string(),
            aid: None,
            at: now(),
        })?;
        self.records.remove(message_id);
        self.maybe_compact();
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    fn append(&mut self, line: &LogLine) -> Result<(), Error> {
        let mut buf = serde_json::to_vec(line)?;
        buf.push(b'\n');
        self.log.write_all(&buf)?;
        self.log.sync_data()?;
        self.lines += 1;
        Ok(())
    }

    fn maybe_compact(&mut self) {
        if self.lines <= COMPACT_MIN_LINES.max(2 * self.records.len()) {
            return;
        }
        if let Err(e) = self.compact() {
            log::warn!("Cannot compact dedup store {}: {e}", self.path.display());
        }
    }

    /// Drops expired records and atomically replaces the log with one line per
    /// live record: a crash leaves either the old or the new file.
    fn compact(&mut self) -> Result<(), Error> {
        if let Some(retention) = self.retention {
            let age = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
            let cutoff = now().saturating_sub(age);
            let before = self.records.len();
            self.records.retain(|_, record| record.at >= cutoff);
            let expired = before - self.records.len();
            if expired > 0 {
                log::info!(
                    "Dropped {expired} expired records from {}",
                    self.path.display()
                );
            }
        }

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut temp = NamedTempFile::new_in(dir)?;
        for (mid, record) in &self.records {
            let line = LogLine {
                mid: mid.clone(),
                aid: Some(record.archive_id.clone()),
                at: record.at,
            };
            serde_json::to_writer(&mut temp, &line)?;
            temp.write_all(b"\n")?;
        }
        temp.as_file_mut().sync_data()?;
        temp.persist(&self.path).map_err(|e| e.error)?;

        self.log = OpenOptions::new().append(true).open(&self.path)?;
        self.lines = self.records.len();
        Ok(())
    }
}
