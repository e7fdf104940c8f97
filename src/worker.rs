use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, warn};

use crate::db::SharedStore;
use crate::error::ParseError;
use crate::models::{GradeRecord, ProgressEvent, ProgressTick};
use crate::parser;
use crate::upsert::{self, UpsertOptions};

/// Parses and stores one uploaded file, reporting progress tagged with `file_index`.
///
/// Emits a single error event if the CSV does not parse, a single completion
/// event for a file without data rows, and otherwise the parsed row count
/// followed by one record count plus one percentage (or completion) per
/// committed batch.
pub fn ingest(
    file_index: usize,
    contents: Bytes,
    store: SharedStore,
    options: UpsertOptions,
) -> BoxStream<'static, ProgressEvent> {
    stream::once(parse_off_runtime(contents))
        .flat_map(move |parsed| match parsed {
            Err(err) => {
                warn!(file_index, error = %err, "grades file rejected");
                stream::iter([ProgressEvent::Failed {
                    file_index,
                    message: err.to_string(),
                }])
                .boxed()
            }
            Ok(records) if records.is_empty() => {
                debug!(file_index, "grades file has no rows");
                stream::iter([ProgressEvent::Completed { file_index }]).boxed()
            }
            Ok(records) => {
                let total = records.len();
                debug!(file_index, records = total, "grades file parsed");
                let parsed = ProgressEvent::Parsed {
                    file_index,
                    total_records: total,
                };
                stream::iter([parsed])
                    .chain(
                        upsert::upsert(store.clone(), records, options).flat_map(move |tick| {
                            stream::iter(events_for_tick(file_index, tick, total))
                        }),
                    )
                    .boxed()
            }
        })
        .boxed()
}

async fn parse_off_runtime(contents: Bytes) -> Result<Vec<GradeRecord>, ParseError> {
    tokio::task::spawn_blocking(move || parser::parse(contents.as_ref()))
        .await
        .map_err(|err| ParseError::Io(std::io::Error::other(err)))?
}

fn events_for_tick(file_index: usize, tick: ProgressTick, total: usize) -> Vec<ProgressEvent> {
    match tick {
        ProgressTick::Committed(inserted) => {
            let progress = if inserted >= total {
                ProgressEvent::Completed { file_index }
            } else {
                ProgressEvent::Progress {
                    file_index,
                    percent: percent_complete(inserted, total),
                }
            };
            vec![
                ProgressEvent::RecordsInserted {
                    file_index,
                    records_inserted: inserted,
                },
                progress,
            ]
        }
        ProgressTick::Failed(message) => vec![ProgressEvent::Failed {
            file_index,
            message,
        }],
    }
}

/// `ceil(100 * inserted / total)`, held at 99 until every record is in so
/// that 100 always coincides with completion.
pub fn percent_complete(inserted: usize, total: usize) -> u8 {
    if total == 0 || inserted >= total {
        return 100;
    }
    let percent = (inserted * 100).div_ceil(total);
    percent.min(99) as u8
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::memory::MemoryGradeStore;
    use crate::upsert::InsertMode;

    fn csv_with_rows(rows: usize) -> Bytes {
        let mut csv = String::from("student_id,student_name,subject,grade\n");
        for n in 0..rows {
            csv.push_str(&format!("s-{n},Student {n},math,{}\n", 50 + n % 50));
        }
        Bytes::from(csv)
    }

    fn batched(batch_size: usize) -> UpsertOptions {
        UpsertOptions {
            batch_size,
            mode: InsertMode::Batched,
        }
    }

    #[test]
    fn percent_rounds_up() {
        assert_eq!(percent_complete(1, 3), 34);
        assert_eq!(percent_complete(2, 3), 67);
        assert_eq!(percent_complete(200, 450), 45);
        assert_eq!(percent_complete(3, 3), 100);
    }

    #[test]
    fn percent_reaches_100_only_when_done() {
        assert_eq!(percent_complete(20_000, 20_001), 99);
        assert_eq!(percent_complete(20_001, 20_001), 100);
    }

    #[tokio::test]
    async fn reports_progress_then_completion() {
        let store = Arc::new(MemoryGradeStore::new());
        let events: Vec<_> = ingest(3, csv_with_rows(10), store.clone(), batched(4))
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                ProgressEvent::Parsed {
                    file_index: 3,
                    total_records: 10
                },
                ProgressEvent::RecordsInserted {
                    file_index: 3,
                    records_inserted: 4
                },
                ProgressEvent::Progress {
                    file_index: 3,
                    percent: 40
                },
                ProgressEvent::RecordsInserted {
                    file_index: 3,
                    records_inserted: 8
                },
                ProgressEvent::Progress {
                    file_index: 3,
                    percent: 80
                },
                ProgressEvent::RecordsInserted {
                    file_index: 3,
                    records_inserted: 10
                },
                ProgressEvent::Completed { file_index: 3 },
            ]
        );
        assert_eq!(store.rows().len(), 10);
    }

    #[tokio::test]
    async fn parse_error_is_a_single_error_event() {
        let store = Arc::new(MemoryGradeStore::new());
        let csv = Bytes::from_static(b"student_id,student_name,grade\ns-1,Avery Lee,90\n");
        let events: Vec<_> = ingest(0, csv, store.clone(), batched(4)).collect().await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            ProgressEvent::Failed {
                file_index,
                message,
            } => {
                assert_eq!(*file_index, 0);
                assert!(message.contains("subject"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(store.transactions(), 0);
    }

    #[tokio::test]
    async fn empty_file_completes_immediately() {
        let store = Arc::new(MemoryGradeStore::new());
        let events: Vec<_> = ingest(1, csv_with_rows(0), store.clone(), batched(4))
            .collect()
            .await;

        assert_eq!(events, vec![ProgressEvent::Completed { file_index: 1 }]);
        assert_eq!(store.transactions(), 0);
    }

    #[tokio::test]
    async fn storage_failure_ends_with_error() {
        let store = Arc::new(MemoryGradeStore::failing_on(2));
        let events: Vec<_> = ingest(0, csv_with_rows(10), store.clone(), batched(4))
            .collect()
            .await;

        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            ProgressEvent::Parsed {
                file_index: 0,
                total_records: 10
            }
        );
        assert_eq!(
            events[2],
            ProgressEvent::Progress {
                file_index: 0,
                percent: 40
            }
        );
        assert!(matches!(events[3], ProgressEvent::Failed { file_index: 0, .. }));
        assert_eq!(store.rows().len(), 4);
    }
}
