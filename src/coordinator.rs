use std::sync::Arc;

use bytes::Bytes;
use futures::stream::StreamExt;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::db::SharedStore;
use crate::models::ProgressEvent;
use crate::progress::ProgressRegistry;
use crate::upsert::UpsertOptions;
use crate::worker;

/// One file taken from an upload, fully buffered.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub contents: Bytes,
}

/// Fans uploaded files out to concurrent ingestion workers and merges their events.
#[derive(Clone)]
pub struct Coordinator {
    store: SharedStore,
    options: UpsertOptions,
    registry: Arc<ProgressRegistry>,
}

impl Coordinator {
    pub fn new(
        store: SharedStore,
        options: UpsertOptions,
        registry: Arc<ProgressRegistry>,
    ) -> Self {
        Self {
            store,
            options,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ProgressRegistry> {
        &self.registry
    }

    /// Starts one worker task per file and returns their merged progress events.
    ///
    /// Events of one file arrive in the order its worker produced them; events
    /// of different files interleave as they become ready. The stream ends
    /// once every worker has finished. Dropping it early stops delivery only:
    /// workers keep writing to storage until their file is done.
    pub fn ingest_all(
        &self,
        files: Vec<UploadedFile>,
    ) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();

        let workers: Vec<(usize, Uuid, JoinHandle<()>)> = files
            .into_iter()
            .enumerate()
            .map(|(file_index, file)| {
                let file_id = self.registry.register(file_index, &file.name);
                debug!(
                    file_index,
                    %file_id,
                    file_name = %file.name,
                    bytes = file.contents.len(),
                    "starting grades worker"
                );
                let handle = tokio::spawn(run_worker(
                    file_index,
                    file_id,
                    file.contents,
                    self.store.clone(),
                    self.options,
                    self.registry.clone(),
                    tx.clone(),
                ));
                (file_index, file_id, handle)
            })
            .collect();
        drop(tx);

        tokio::spawn(watch_workers(workers, self.registry.clone()));

        UnboundedReceiverStream::new(rx)
    }
}

async fn run_worker(
    file_index: usize,
    file_id: Uuid,
    contents: Bytes,
    store: SharedStore,
    options: UpsertOptions,
    registry: Arc<ProgressRegistry>,
    tx: mpsc::UnboundedSender<ProgressEvent>,
) {
    let mut events = worker::ingest(file_index, contents, store, options);
    let mut detached = false;

    while let Some(event) = events.next().await {
        registry.apply(file_id, &event);
        if event.is_terminal() {
            info!(file_index, %file_id, event = ?event, "grades file finished");
        }
        if !detached && tx.send(event).is_err() {
            detached = true;
            debug!(
                file_index,
                %file_id,
                "progress receiver gone, finishing ingestion in background"
            );
        }
    }
}

/// Waits for every worker. A worker that panicked or was cancelled never sent
/// its terminal event, so its registry entry is failed here instead.
async fn watch_workers(
    workers: Vec<(usize, Uuid, JoinHandle<()>)>,
    registry: Arc<ProgressRegistry>,
) {
    let count = workers.len();
    for (file_index, file_id, handle) in workers {
        if let Err(err) = handle.await {
            error!(file_index, %file_id, error = %err, "grades worker task failed");
            registry.apply(
                file_id,
                &ProgressEvent::Failed {
                    file_index,
                    message: format!("worker task failed: {err}"),
                },
            );
        }
    }
    debug!(files = count, "all grades workers finished");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::db::memory::MemoryGradeStore;
    use crate::models::FileStatus;
    use crate::upsert::InsertMode;

    fn csv_file(name: &str, prefix: &str, rows: usize) -> UploadedFile {
        let mut csv = String::from("student_id,student_name,subject,grade\n");
        for n in 0..rows {
            csv.push_str(&format!("{prefix}-{n},Student {n},math,{}\n", 60 + n));
        }
        UploadedFile {
            name: name.to_string(),
            contents: Bytes::from(csv),
        }
    }

    fn coordinator(store: Arc<MemoryGradeStore>, batch_size: usize) -> Coordinator {
        Coordinator::new(
            store,
            UpsertOptions {
                batch_size,
                mode: InsertMode::Batched,
            },
            Arc::new(ProgressRegistry::default()),
        )
    }

    fn by_file(events: &[ProgressEvent]) -> HashMap<usize, Vec<ProgressEvent>> {
        let mut grouped: HashMap<usize, Vec<ProgressEvent>> = HashMap::new();
        for event in events {
            grouped.entry(event.file_index()).or_default().push(event.clone());
        }
        grouped
    }

    fn assert_monotonic(events: &[ProgressEvent]) {
        let mut last_percent = 0u8;
        let mut last_count = 0usize;
        for (position, event) in events.iter().enumerate() {
            match event {
                ProgressEvent::Parsed { .. } => assert_eq!(position, 0, "row count comes first"),
                ProgressEvent::Progress { percent, .. } => {
                    assert!(*percent > last_percent);
                    last_percent = *percent;
                }
                ProgressEvent::RecordsInserted {
                    records_inserted, ..
                } => {
                    assert!(*records_inserted > last_count);
                    last_count = *records_inserted;
                }
                ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. } => {
                    assert_eq!(position, events.len() - 1, "terminal event must be last");
                }
            }
        }
    }

    #[tokio::test]
    async fn concurrent_files_both_complete() {
        let store = Arc::new(MemoryGradeStore::new());
        let coordinator = coordinator(store.clone(), 3);

        let events: Vec<_> = coordinator
            .ingest_all(vec![csv_file("f1.csv", "a", 10), csv_file("f2.csv", "b", 10)])
            .collect()
            .await;

        let grouped = by_file(&events);
        assert_eq!(grouped.len(), 2);
        for file_index in [0, 1] {
            let file_events = &grouped[&file_index];
            assert_monotonic(file_events);
            assert_eq!(
                file_events.last(),
                Some(&ProgressEvent::Completed { file_index })
            );
        }
        assert_eq!(store.rows().len(), 20);
    }

    #[tokio::test]
    async fn bad_file_does_not_affect_siblings() {
        let store = Arc::new(MemoryGradeStore::new());
        let coordinator = coordinator(store.clone(), 200);
        let broken = UploadedFile {
            name: "broken.csv".to_string(),
            contents: Bytes::from_static(
                b"student_id,student_name,subject,grade\ns-1,Avery Lee,math,high\n",
            ),
        };

        let events: Vec<_> = coordinator
            .ingest_all(vec![broken, csv_file("good.csv", "g", 3)])
            .collect()
            .await;

        let grouped = by_file(&events);
        assert!(matches!(
            grouped[&0].as_slice(),
            [ProgressEvent::Failed { file_index: 0, .. }]
        ));
        assert_eq!(
            grouped[&1].last(),
            Some(&ProgressEvent::Completed { file_index: 1 })
        );
        assert_eq!(store.rows().len(), 3);

        let snapshot = coordinator.registry().snapshot();
        let statuses: Vec<_> = snapshot.iter().map(|f| (f.file_index, f.status)).collect();
        assert!(statuses.contains(&(0, FileStatus::Failed)));
        assert!(statuses.contains(&(1, FileStatus::Completed)));
    }

    #[tokio::test]
    async fn no_files_ends_immediately() {
        let store = Arc::new(MemoryGradeStore::new());
        let events: Vec<_> = coordinator(store, 200).ingest_all(Vec::new()).collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn dropped_receiver_lets_workers_finish() {
        let store = Arc::new(MemoryGradeStore::new().with_latency(Duration::from_millis(5)));
        let coordinator = coordinator(store.clone(), 2);

        let mut events = Box::pin(coordinator.ingest_all(vec![csv_file("slow.csv", "s", 10)]));
        let first = events.next().await;
        assert!(first.is_some());
        drop(events);

        for _ in 0..200 {
            if coordinator.registry().snapshot()[0].status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let snapshot = coordinator.registry().snapshot();
        assert_eq!(snapshot[0].status, FileStatus::Completed);
        assert_eq!(snapshot[0].records_processed, 10);
        assert_eq!(store.rows().len(), 10);
    }

    #[tokio::test]
    async fn files_ingest_in_parallel() {
        let store = Arc::new(MemoryGradeStore::new().with_latency(Duration::from_millis(50)));
        let coordinator = coordinator(store.clone(), 1);

        let started = Instant::now();
        let events: Vec<_> = coordinator
            .ingest_all(vec![csv_file("four.csv", "a", 4), csv_file("five.csv", "b", 5)])
            .collect()
            .await;
        let elapsed = started.elapsed();

        // Nine 50ms transactions take ~450ms back to back.
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
        assert_eq!(store.transactions(), 9);

        let first_of_second = events
            .iter()
            .position(|e| matches!(e, ProgressEvent::RecordsInserted { file_index: 1, .. }))
            .unwrap();
        let end_of_first = events
            .iter()
            .position(|e| *e == ProgressEvent::Completed { file_index: 0 })
            .unwrap();
        assert!(first_of_second < end_of_first, "events: {events:?}");
    }

    #[tokio::test]
    async fn crashed_worker_is_marked_failed() {
        let registry = Arc::new(ProgressRegistry::default());
        let file_id = registry.register(0, "crash.csv");
        let handle = tokio::spawn(async {
            panic!("worker blew up");
        });

        watch_workers(vec![(0, file_id, handle)], registry.clone()).await;

        let entry = registry.get(file_id).unwrap();
        assert_eq!(entry.status, FileStatus::Failed);
        assert!(entry.finished_at.is_some());
        assert!(entry
            .error
            .as_deref()
            .is_some_and(|message| message.starts_with("worker task failed")));
    }
}
