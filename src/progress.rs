//! In-memory registry of per-file ingestion progress.
//!
//! Backs the polling endpoint. Entries are created when an upload is accepted,
//! updated as the file's progress events flow past, and swept once they have
//! been in a terminal state for longer than the retention window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::{FileProgress, FileStatus, ProgressEvent};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
pub struct ProgressRegistry {
    entries: Mutex<HashMap<Uuid, FileProgress>>,
    retention: chrono::Duration,
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl ProgressRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Tracks a newly accepted file and returns its id.
    pub fn register(&self, file_index: usize, file_name: &str) -> Uuid {
        let file_id = Uuid::new_v4();
        let now = Utc::now();
        let entry = FileProgress {
            file_id,
            file_name: file_name.to_string(),
            file_index,
            total_records: 0,
            records_processed: 0,
            progress: 0,
            status: FileStatus::Pending,
            error: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(file_id, entry);
        }
        file_id
    }

    /// Folds one progress event into the file's entry. Unknown ids are ignored.
    pub fn apply(&self, file_id: Uuid, event: &ProgressEvent) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let Some(entry) = entries.get_mut(&file_id) else {
            return;
        };
        if entry.status.is_terminal() {
            return;
        }

        let now = Utc::now();
        entry.updated_at = now;
        match event {
            ProgressEvent::Parsed { total_records, .. } => {
                entry.status = FileStatus::Processing;
                entry.total_records = *total_records;
            }
            ProgressEvent::RecordsInserted {
                records_inserted, ..
            } => {
                entry.status = FileStatus::Processing;
                entry.records_processed = (*records_inserted).max(entry.records_processed);
            }
            ProgressEvent::Progress { percent, .. } => {
                entry.status = FileStatus::Processing;
                entry.progress = (*percent).max(entry.progress);
            }
            ProgressEvent::Completed { .. } => {
                entry.status = FileStatus::Completed;
                entry.progress = 100;
                entry.finished_at = Some(now);
            }
            ProgressEvent::Failed { message, .. } => {
                entry.status = FileStatus::Failed;
                entry.error = Some(message.clone());
                entry.finished_at = Some(now);
            }
        }
    }

    pub fn get(&self, file_id: Uuid) -> Option<FileProgress> {
        self.entries.lock().ok()?.get(&file_id).cloned()
    }

    /// All tracked files, oldest upload first.
    pub fn snapshot(&self) -> Vec<FileProgress> {
        let mut files: Vec<FileProgress> = self
            .entries
            .lock()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        files.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then(a.file_index.cmp(&b.file_index))
        });
        files
    }

    /// Removes files that finished more than the retention window before `now`.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let retention = self.retention;
        let before = entries.len();
        entries.retain(|_, entry| match entry.finished_at {
            Some(finished_at) => now - finished_at <= retention,
            None => true,
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the periodic sweep. Abort the handle on shutdown.
    pub fn spawn_sweeper(registry: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = registry.sweep_expired(Utc::now());
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = registry.len(),
                        "swept finished uploads"
                    );
                }
            }
        })
    }
}
