use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::StoreError;
use crate::models::GradeRecord;

/// Postgres caps bind parameters per statement at 65535; each row binds four.
pub const MAX_ROWS_PER_STATEMENT: usize = u16::MAX as usize / 4;

pub type SharedStore = Arc<dyn GradeStore>;

#[async_trait]
pub trait GradeStore: Send + Sync {
    /// Upserts every chunk inside a single transaction: all rows land, or none do.
    async fn upsert_atomic(&self, chunks: &[&[GradeRecord]]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgGradeStore {
    pool: PgPool,
}

impl PgGradeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GradeStore for PgGradeStore {
    async fn upsert_atomic(&self, chunks: &[&[GradeRecord]]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Begin)?;

        for chunk in chunks {
            let rows = last_write_wins(chunk);
            if rows.is_empty() {
                continue;
            }

            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO student_grades (id, subject, grade, student_name) ",
            );
            query.push_values(rows, |mut row, grade| {
                row.push_bind(grade.id.clone())
                    .push_bind(grade.subject.clone())
                    .push_bind(grade.grade)
                    .push_bind(grade.student_name.clone());
            });
            query.push(
                r#"
                ON CONFLICT (id) DO UPDATE
                SET subject = EXCLUDED.subject,
                    grade = EXCLUDED.grade,
                    student_name = EXCLUDED.student_name
                "#,
            );

            let executed = query.build().execute(&mut *tx).await;
            if let Err(err) = executed {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "failed to roll back grades transaction");
                }
                return Err(StoreError::Execute(err));
            }
        }

        tx.commit().await.map_err(StoreError::Commit)
    }
}

/// Collapses repeated ids within one statement, keeping the last occurrence.
///
/// Postgres refuses an `ON CONFLICT DO UPDATE` that touches the same row twice,
/// so duplicates inside a chunk must be folded before the insert is built.
pub fn last_write_wins(chunk: &[GradeRecord]) -> Vec<&GradeRecord> {
    let mut last_seen: HashMap<&str, usize> = HashMap::with_capacity(chunk.len());
    for (position, grade) in chunk.iter().enumerate() {
        last_seen.insert(grade.id.as_str(), position);
    }

    chunk
        .iter()
        .enumerate()
        .filter(|(position, grade)| last_seen.get(grade.id.as_str()) == Some(position))
        .map(|(_, grade)| grade)
        .collect()
}
