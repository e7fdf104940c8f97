use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use uuid::Uuid;

/// One row of an uploaded grades CSV, keyed by `id` in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeRecord {
    pub id: String,
    pub student_name: String,
    pub subject: String,
    pub grade: i32,
}

/// Output of the batch upserter: records committed so far, or the terminal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressTick {
    Committed(usize),
    Failed(String),
}

/// A unit of progress information about one uploaded file.
///
/// Serialises to the wire shapes streamed back to the uploader, one JSON
/// object per line: `{"fileIndex":0,"processingProgress":40}`,
/// `{"fileIndex":0,"processingComplete":true}`, `{"fileIndex":0,"error":"..."}`
/// plus the internal `{"fileIndex":0,"totalRecords":1000}` and
/// `{"fileIndex":0,"recordsInserted":400}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Parsed { file_index: usize, total_records: usize },
    RecordsInserted { file_index: usize, records_inserted: usize },
    Progress { file_index: usize, percent: u8 },
    Completed { file_index: usize },
    Failed { file_index: usize, message: String },
}

impl ProgressEvent {
    pub fn file_index(&self) -> usize {
        match self {
            ProgressEvent::Parsed { file_index, .. }
            | ProgressEvent::RecordsInserted { file_index, .. }
            | ProgressEvent::Progress { file_index, .. }
            | ProgressEvent::Completed { file_index }
            | ProgressEvent::Failed { file_index, .. } => *file_index,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. }
        )
    }

    /// Raw record counts are kept for the progress registry and the CLI; the
    /// upload response only carries percentages, completion and errors.
    pub fn is_streamed_to_uploader(&self) -> bool {
        !matches!(
            self,
            ProgressEvent::Parsed { .. } | ProgressEvent::RecordsInserted { .. }
        )
    }
}

impl Serialize for ProgressEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("fileIndex", &self.file_index())?;
        match self {
            ProgressEvent::Parsed { total_records, .. } => {
                map.serialize_entry("totalRecords", total_records)?
            }
            ProgressEvent::RecordsInserted {
                records_inserted, ..
            } => map.serialize_entry("recordsInserted", records_inserted)?,
            ProgressEvent::Progress { percent, .. } => {
                map.serialize_entry("processingProgress", percent)?
            }
            ProgressEvent::Completed { .. } => map.serialize_entry("processingComplete", &true)?,
            ProgressEvent::Failed { message, .. } => map.serialize_entry("error", message)?,
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Failed)
    }
}

/// Snapshot of one file's ingestion, as served by the progress endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FileProgress {
    pub file_id: Uuid,
    pub file_name: String,
    pub file_index: usize,
    pub total_records: usize,
    pub records_processed: usize,
    pub progress: u8,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
