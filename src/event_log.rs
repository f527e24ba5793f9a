use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Local, LocalResult, TimeZone};
use serde::{Deserialize, Serialize};

use crate::tracker::TrackerOutcome;

/// One terminal sync outcome, as shown in the sync history.
#[derive(Clone, Debug)]
pub struct SyncEventEntry {
    pub timestamp: DateTime<Local>,
    pub job: String,
    pub outcome: String,
    pub message: String,
}

impl SyncEventEntry {
    pub fn from_outcome(job: impl Into<String>, outcome: &TrackerOutcome) -> Self {
        let message = match outcome {
            TrackerOutcome::Finished { message, .. } => message.clone(),
            TrackerOutcome::Failed(message) => message.clone(),
            TrackerOutcome::TimedOut => "no terminal status before timeout".to_string(),
            TrackerOutcome::Cancelled => "tracking stopped by user".to_string(),
        };
        SyncEventEntry {
            timestamp: Local::now(),
            job: job.into(),
            outcome: outcome.label().to_string(),
            message,
        }
    }

    fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

#[derive(Clone, Debug)]
pub struct SyncEventStore {
    path: PathBuf,
    max_entries: usize,
}

impl SyncEventStore {
    pub fn new(path: PathBuf) -> Self {
        SyncEventStore {
            path,
            max_entries: 256,
        }
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("sync_events.jsonl")
    }

    pub fn append(&self, entry: &SyncEventEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        serde_json::to_writer(&mut file, &StoredSyncEvent::from(entry))?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Most recent entries, oldest first. Unreadable lines are skipped.
    pub fn load(&self) -> Result<Vec<SyncEventEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(stored) = serde_json::from_str::<StoredSyncEvent>(&line) {
                entries.push(stored.into_entry());
            }
        }
        if entries.len() > self.max_entries {
            entries = entries.split_off(entries.len() - self.max_entries);
        }
        Ok(entries)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredSyncEvent {
    timestamp_ms: i64,
    job: String,
    outcome: String,
    message: String,
}

impl StoredSyncEvent {
    fn into_entry(self) -> SyncEventEntry {
        let timestamp = match Local.timestamp_millis_opt(self.timestamp_ms) {
            LocalResult::Single(dt) => dt,
            _ => Local::now(),
        };
        SyncEventEntry {
            timestamp,
            job: self.job,
            outcome: self.outcome,
            message: self.message,
        }
    }
}

impl From<&SyncEventEntry> for StoredSyncEvent {
    fn from(entry: &SyncEventEntry) -> Self {
        StoredSyncEvent {
            timestamp_ms: entry.timestamp_ms(),
            job: entry.job.clone(),
            outcome: entry.outcome.clone(),
            message: entry.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_loads_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncEventStore::new(dir.path().join("logs").join("sync_events.jsonl"));
        assert!(store.load().unwrap().is_empty());

        store
            .append(&SyncEventEntry::from_outcome(
                "daily",
                &TrackerOutcome::Failed("disk full".to_string()),
            ))
            .unwrap();
        store
            .append(&SyncEventEntry::from_outcome(
                "stocks",
                &TrackerOutcome::Finished {
                    message: "Completed. Synced 12 stocks.".to_string(),
                    refresh_listing: true,
                },
            ))
            .unwrap();

        let entries = store.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, "error");
        assert_eq!(entries[0].message, "disk full");
        assert_eq!(entries[1].job, "stocks");
        assert_eq!(entries[1].outcome, "finished");
    }

    #[test]
    fn skips_corrupt_lines_and_caps_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_events.jsonl");
        let mut store = SyncEventStore::new(path.clone());
        store.max_entries = 2;
        for _ in 0..3 {
            store
                .append(&SyncEventEntry::from_outcome("daily", &TrackerOutcome::TimedOut))
                .unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not json\n").unwrap();

        let entries = store.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| entry.outcome == "timeout"));
    }
}
