//! Persistence gateway for stored facts: a Postgres store (sqlx) and an
//! in-memory store with the same transactional semantics.

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use factsync_core::{Category, FactUpdate, MutationBatch, StoredFact};
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "factsync-storage";

/// Advisory lock key serializing reconciliation runs against one database.
pub const RUN_LOCK_KEY: i64 = 0x6661_6374_7379_6e63;

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored fact {text:?} is no longer at version {expected}; batch rolled back")]
    VersionConflict { text: String, expected: i32 },
    #[error("unrecognized category {0:?} in facts table")]
    UnknownCategory(String),
}

/// Rows touched by one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
    pub soft_deleted: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledRun {
    pub existing: usize,
    pub batch: MutationBatch,
    pub applied: ApplyReport,
}

/// Pure planning step run by [`FactStore::reconcile_with`] on the active rows.
pub type PlanFn<'p> = dyn for<'a> Fn(&'a [StoredFact]) -> MutationBatch + Send + Sync + 'p;

#[async_trait]
pub trait FactStore: Send + Sync {
    /// Active rows in insertion order.
    async fn load_active_facts(&self) -> Result<Vec<StoredFact>, StorageError>;

    /// Applies the whole batch or nothing.
    async fn apply(&self, batch: &MutationBatch) -> Result<ApplyReport, StorageError>;

    /// Loads the active rows, asks `plan` for a batch and applies it, all in
    /// one transaction.
    async fn reconcile_with(
        &self,
        plan: &PlanFn<'_>,
    ) -> Result<ReconciledRun, StorageError>;
}

#[derive(Debug, Clone)]
pub struct PgFactStore {
    pool: PgPool,
}

impl PgFactStore {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;
        info!("facts schema is up to date");
        Ok(())
    }

    async fn begin_locked(&self) -> Result<Transaction<'static, Postgres>, StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(RUN_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

#[async_trait]
impl FactStore for PgFactStore {
    async fn load_active_facts(&self) -> Result<Vec<StoredFact>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        load_active(&mut conn).await
    }

    async fn apply(&self, batch: &MutationBatch) -> Result<ApplyReport, StorageError> {
        let mut tx = self.begin_locked().await?;
        let outcome = match load_active_rows(&mut tx).await {
            Ok(active) => apply_batch(&mut tx, &active, batch, Utc::now()).await,
            Err(err) => Err(err),
        };
        finish(tx, outcome).await
    }

    async fn reconcile_with(
        &self,
        plan: &PlanFn<'_>,
    ) -> Result<ReconciledRun, StorageError> {
        let mut tx = self.begin_locked().await?;
        let active = match load_active_rows(&mut tx).await {
            Ok(active) => active,
            Err(err) => return finish(tx, Err(err)).await,
        };
        let existing: Vec<StoredFact> = active.iter().map(|(_, fact)| fact.clone()).collect();
        let batch = plan(&existing);
        let outcome = apply_batch(&mut tx, &active, &batch, Utc::now()).await;
        let applied = finish(tx, outcome).await?;
        Ok(ReconciledRun {
            existing: existing.len(),
            batch,
            applied,
        })
    }
}

async fn finish<T>(
    tx: Transaction<'static, Postgres>,
    outcome: Result<T, StorageError>,
) -> Result<T, StorageError> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            warn!(error = %err, "rolling back fact batch");
            tx.rollback().await?;
            Err(err)
        }
    }
}

async fn load_active(conn: &mut PgConnection) -> Result<Vec<StoredFact>, StorageError> {
    let rows = load_active_rows(conn).await?;
    Ok(rows.into_iter().map(|(_, fact)| fact).collect())
}

async fn load_active_rows(conn: &mut PgConnection) -> Result<Vec<(i64, StoredFact)>, StorageError> {
    let rows = sqlx::query(
        r#"
        SELECT id, fact, category, version, is_deleted, created_at, updated_at
          FROM facts
         WHERE is_deleted = FALSE
         ORDER BY id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;
    rows.iter()
        .map(|row| -> Result<(i64, StoredFact), StorageError> {
            Ok((row.try_get("id")?, row_to_stored_fact(row)?))
        })
        .collect()
}

fn row_to_stored_fact(row: &PgRow) -> Result<StoredFact, StorageError> {
    let category: String = row.try_get("category")?;
    Ok(StoredFact {
        text: row.try_get("fact")?,
        category: Category::parse(&category).ok_or(StorageError::UnknownCategory(category))?,
        version: row.try_get("version")?,
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Rows one batch writes to, keyed by row identity.
#[derive(Debug)]
struct WriteTargets<'b, K> {
    updates: Vec<(&'b FactUpdate, Vec<K>)>,
    soft_deletes: Vec<K>,
}

/// Resolves every write of `batch` against the active rows as they were
/// before the batch, so no write can redirect a later one.
///
/// An update reaches the rows holding its matched text at the expected
/// version; a soft delete reaches the rows holding its text that no update
/// reaches.
fn resolve_targets<'b, K: Copy + Eq + Hash>(
    active: &[(K, &StoredFact)],
    batch: &'b MutationBatch,
) -> Result<WriteTargets<'b, K>, StorageError> {
    let mut rewritten: HashSet<K> = HashSet::new();
    let mut updates = Vec::new();
    for update in batch.effective_updates() {
        let keys: Vec<K> = active
            .iter()
            .filter(|(_, row)| {
                row.text == update.matched_text && row.version == update.expected_version()
            })
            .map(|(key, _)| *key)
            .collect();
        if keys.is_empty() {
            return Err(StorageError::VersionConflict {
                text: update.matched_text.clone(),
                expected: update.expected_version(),
            });
        }
        rewritten.extend(keys.iter().copied());
        updates.push((update, keys));
    }

    let stale: HashSet<&str> = batch.soft_deletes.iter().map(String::as_str).collect();
    let soft_deletes = active
        .iter()
        .filter(|(key, row)| stale.contains(row.text.as_str()) && !rewritten.contains(key))
        .map(|(key, _)| *key)
        .collect();

    Ok(WriteTargets {
        updates,
        soft_deletes,
    })
}

async fn apply_batch(
    conn: &mut PgConnection,
    active: &[(i64, StoredFact)],
    batch: &MutationBatch,
    now: DateTime<Utc>,
) -> Result<ApplyReport, StorageError> {
    let keyed: Vec<(i64, &StoredFact)> = active.iter().map(|(id, fact)| (*id, fact)).collect();
    let targets = resolve_targets(&keyed, batch)?;
    let mut report = ApplyReport::default();

    for (update, ids) in &targets.updates {
        let result = sqlx::query(
            r#"
            UPDATE facts
               SET fact = $1, category = $2, version = $3, updated_at = $4
             WHERE id = ANY($5)
               AND version = $6
               AND is_deleted = FALSE
            "#,
        )
        .bind(&update.text)
        .bind(update.category.as_str())
        .bind(update.new_version)
        .bind(now)
        .bind(ids.as_slice())
        .bind(update.expected_version())
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() != ids.len() as u64 {
            return Err(StorageError::VersionConflict {
                text: update.matched_text.clone(),
                expected: update.expected_version(),
            });
        }
        report.updated += ids.len();
    }

    for insert in &batch.inserts {
        sqlx::query(
            r#"
            INSERT INTO facts (fact, category, version, created_at, updated_at)
            VALUES ($1, $2, 1, $3, $3)
            "#,
        )
        .bind(&insert.text)
        .bind(insert.category.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        report.inserted += 1;
    }

    if !targets.soft_deletes.is_empty() {
        let result = sqlx::query(
            r#"
            UPDATE facts
               SET is_deleted = TRUE, updated_at = $2
             WHERE id = ANY($1)
               AND is_deleted = FALSE
            "#,
        )
        .bind(targets.soft_deletes.as_slice())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        report.soft_deleted += result.rows_affected() as usize;
    }

    debug!(?report, "fact batch written");
    Ok(report)
}

/// Process-local store; each apply works on a copy that replaces the rows only
/// when the whole batch succeeded.
#[derive(Debug, Default)]
pub struct MemoryFactStore {
    rows: Mutex<Vec<StoredFact>>,
}

impl MemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_facts(rows: Vec<StoredFact>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    /// Every row, deleted ones included.
    pub async fn snapshot(&self) -> Vec<StoredFact> {
        self.rows.lock().await.clone()
    }
}

fn apply_to_rows(
    rows: &mut Vec<StoredFact>,
    batch: &MutationBatch,
    now: DateTime<Utc>,
) -> Result<ApplyReport, StorageError> {
    let active: Vec<(usize, &StoredFact)> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| !row.is_deleted)
        .collect();
    let targets = resolve_targets(&active, batch)?;
    let mut staged = rows.clone();
    let mut report = ApplyReport::default();

    for (update, indices) in &targets.updates {
        for &index in indices {
            let row = &mut staged[index];
            row.text = update.text.clone();
            row.category = update.category;
            row.version = update.new_version;
            row.updated_at = now;
        }
        report.updated += indices.len();
    }

    for insert in &batch.inserts {
        staged.push(StoredFact::inserted(insert.text.clone(), insert.category, now));
        report.inserted += 1;
    }

    for &index in &targets.soft_deletes {
        let row = &mut staged[index];
        row.is_deleted = true;
        row.updated_at = now;
        report.soft_deleted += 1;
    }

    *rows = staged;
    Ok(report)
}

#[async_trait]
impl FactStore for MemoryFactStore {
    async fn load_active_facts(&self) -> Result<Vec<StoredFact>, StorageError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().filter(|row| !row.is_deleted).cloned().collect())
    }

    async fn apply(&self, batch: &MutationBatch) -> Result<ApplyReport, StorageError> {
        let mut rows = self.rows.lock().await;
        apply_to_rows(&mut rows, batch, Utc::now())
    }

    async fn reconcile_with(
        &self,
        plan: &PlanFn<'_>,
    ) -> Result<ReconciledRun, StorageError> {
        let mut rows = self.rows.lock().await;
        let existing: Vec<StoredFact> = rows.iter().filter(|row| !row.is_deleted).cloned().collect();
        let batch = plan(&existing);
        let applied = apply_to_rows(&mut rows, &batch, Utc::now())?;
        Ok(ReconciledRun {
            existing: existing.len(),
            batch,
            applied,
        })
    }
}
