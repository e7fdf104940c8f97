use clap::ValueEnum;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, warn};

use crate::db::SharedStore;
use crate::models::{GradeRecord, ProgressTick};

pub const DEFAULT_BATCH_SIZE: usize = 200;

/// How a file's records are grouped into storage transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum InsertMode {
    /// One transaction per batch; committed batches survive a later failure.
    #[default]
    Batched,
    /// The whole file in one transaction; a failure leaves nothing behind.
    SingleTransaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOptions {
    pub batch_size: usize,
    pub mode: InsertMode,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            mode: InsertMode::default(),
        }
    }
}

struct BatchCursor {
    store: SharedStore,
    records: Vec<GradeRecord>,
    batch_size: usize,
    committed: usize,
    failed: bool,
}

/// Persists `records` and reports the cumulative number committed.
///
/// The returned stream is lazy: nothing touches storage until it is polled,
/// and batches run strictly one after another. It ends after the last
/// commit, or right after the first [`ProgressTick::Failed`].
pub fn upsert(
    store: SharedStore,
    records: Vec<GradeRecord>,
    options: UpsertOptions,
) -> BoxStream<'static, ProgressTick> {
    if records.is_empty() {
        return stream::empty().boxed();
    }
    let batch_size = options.batch_size.max(1);

    match options.mode {
        InsertMode::Batched => {
            let cursor = BatchCursor {
                store,
                records,
                batch_size,
                committed: 0,
                failed: false,
            };
            stream::unfold(cursor, next_batch).boxed()
        }
        InsertMode::SingleTransaction => stream::once(async move {
            let chunks: Vec<&[GradeRecord]> = records.chunks(batch_size).collect();
            match store.upsert_atomic(&chunks).await {
                Ok(()) => {
                    debug!(records = records.len(), "grades transaction committed");
                    ProgressTick::Committed(records.len())
                }
                Err(err) => {
                    warn!(error = %err, records = records.len(), "grades transaction failed");
                    ProgressTick::Failed(err.to_string())
                }
            }
        })
        .boxed(),
    }
}

async fn next_batch(mut cursor: BatchCursor) -> Option<(ProgressTick, BatchCursor)> {
    if cursor.failed || cursor.committed >= cursor.records.len() {
        return None;
    }

    let start = cursor.committed;
    let end = (start + cursor.batch_size).min(cursor.records.len());
    let result = cursor
        .store
        .upsert_atomic(&[&cursor.records[start..end]])
        .await;

    let tick = match result {
        Ok(()) => {
            cursor.committed = end;
            debug!(
                batch = start / cursor.batch_size + 1,
                committed = end,
                "grades batch committed"
            );
            ProgressTick::Committed(end)
        }
        Err(err) => {
            cursor.failed = true;
            warn!(
                error = %err,
                batch = start / cursor.batch_size + 1,
                committed = start,
                "grades batch failed, skipping remaining batches"
            );
            ProgressTick::Failed(err.to_string())
        }
    };
    Some((tick, cursor))
}
