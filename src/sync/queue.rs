//! Durable job records in the `sync_jobs` table.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;

use super::types::{JobState, OperationKind, SyncConfig, SyncContext, SyncOperation};
use super::worker::WorkerOutcome;
use crate::db::Database;

/// One persisted attempt-able mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
  pub id: i64,
  pub operation: SyncOperation,
  pub config: SyncConfig,
  pub context: SyncContext,
  pub state: JobState,
  /// Attempts started so far, including a running one
  pub attempts: u32,
  /// Earliest time (ms since epoch) the job may be claimed
  pub run_at: i64,
  pub last_error: Option<String>,
  pub created_at: i64,
  pub updated_at: i64,
}

impl SyncJob {
  pub fn entity_type(&self) -> &str {
    self.operation.entity_type()
  }

  pub fn entity_id(&self) -> &str {
    self.operation.entity_id()
  }
}

/// Raw column values, decoded outside the rusqlite closure so JSON errors
/// surface with context.
struct JobRow {
  id: i64,
  entity_type: String,
  entity_id: String,
  operation: String,
  config: String,
  context: String,
  state: String,
  attempts: u32,
  run_at: i64,
  last_error: Option<String>,
  created_at: i64,
  updated_at: i64,
}

const JOB_COLUMNS: &str = "id, entity_type, entity_id, operation, config, context, state, \
                           attempts, run_at, last_error, created_at, updated_at";

impl JobRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      entity_type: row.get(1)?,
      entity_id: row.get(2)?,
      operation: row.get(3)?,
      config: row.get(4)?,
      context: row.get(5)?,
      state: row.get(6)?,
      attempts: row.get(7)?,
      run_at: row.get(8)?,
      last_error: row.get(9)?,
      created_at: row.get(10)?,
      updated_at: row.get(11)?,
    })
  }

  fn into_job(self) -> Result<SyncJob> {
    let kind: OperationKind = self
      .operation
      .parse()
      .map_err(|e| eyre!("Job {}: {}", self.id, e))?;
    let state: JobState = self
      .state
      .parse()
      .map_err(|e| eyre!("Job {}: {}", self.id, e))?;
    let config = serde_json::from_str(&self.config)
      .map_err(|e| eyre!("Job {}: invalid config: {}", self.id, e))?;
    let context = serde_json::from_str(&self.context)
      .map_err(|e| eyre!("Job {}: invalid context: {}", self.id, e))?;

    Ok(SyncJob {
      id: self.id,
      operation: SyncOperation::new(kind, &self.entity_type, &self.entity_id),
      config,
      context,
      state,
      attempts: self.attempts,
      run_at: self.run_at,
      last_error: self.last_error,
      created_at: self.created_at,
      updated_at: self.updated_at,
    })
  }
}

fn collect_jobs(rows: Vec<JobRow>) -> Result<Vec<SyncJob>> {
  rows.into_iter().map(JobRow::into_job).collect()
}

/// Queue operations over the shared database.
#[derive(Clone)]
pub struct JobStore {
  db: Arc<Database>,
}

impl JobStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Persist a new job due immediately. With `replace_existing` the pending
  /// jobs for the same key and operation kind are removed in the same
  /// transaction; a pending create survives a replacing update.
  ///
  /// Returns the new job id and the number of jobs it superseded.
  pub fn insert(
    &self,
    operation: &SyncOperation,
    config: &SyncConfig,
    context: &SyncContext,
    replace_existing: bool,
    now: i64,
  ) -> Result<(i64, usize)> {
    let config_json =
      serde_json::to_string(config).map_err(|e| eyre!("Failed to encode config: {}", e))?;
    let context_json =
      serde_json::to_string(context).map_err(|e| eyre!("Failed to encode context: {}", e))?;

    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let superseded = if replace_existing {
      tx.execute(
        "DELETE FROM sync_jobs
         WHERE entity_type = ? AND entity_id = ? AND operation = ?
           AND state IN ('enqueued', 'retrying')",
        params![
          operation.entity_type(),
          operation.entity_id(),
          operation.kind().as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to supersede jobs: {}", e))?
    } else {
      0
    };

    tx.execute(
      "INSERT INTO sync_jobs
         (entity_type, entity_id, operation, config, context, state, attempts, run_at, created_at, updated_at)
       VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
      params![
        operation.entity_type(),
        operation.entity_id(),
        operation.kind().as_str(),
        config_json,
        context_json,
        JobState::Enqueued.as_str(),
        now,
        now,
        now
      ],
    )
    .map_err(|e| eyre!("Failed to insert job: {}", e))?;
    let id = tx.last_insert_rowid();

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok((id, superseded))
  }

  /// Move up to `limit` due jobs to `Running` and return them.
  ///
  /// A key with a running job is skipped. Jobs of one key run in enqueue
  /// order: only the oldest pending job of a key is a candidate.
  pub fn claim_due(&self, now: i64, limit: usize) -> Result<Vec<SyncJob>> {
    if limit == 0 {
      return Ok(Vec::new());
    }

    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let candidates = {
      let mut stmt = tx
        .prepare(&format!(
          "SELECT {} FROM sync_jobs j
           WHERE j.state IN ('enqueued', 'retrying') AND j.run_at <= ?
             AND NOT EXISTS (
               SELECT 1 FROM sync_jobs r
               WHERE r.entity_type = j.entity_type AND r.entity_id = j.entity_id
                 AND r.state = 'running')
             AND NOT EXISTS (
               SELECT 1 FROM sync_jobs p
               WHERE p.entity_type = j.entity_type AND p.entity_id = j.entity_id
                 AND p.state IN ('enqueued', 'retrying') AND p.id < j.id)
           ORDER BY j.run_at, j.id",
          JOB_COLUMNS
        ))
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let rows = stmt
        .query_map(params![now], JobRow::from_row)
        .map_err(|e| eyre!("Failed to query due jobs: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read job: {}", e))?;
      rows
    };

    let mut claimed = Vec::new();
    for row in candidates.into_iter().take(limit) {
      tx.execute(
        "UPDATE sync_jobs SET state = 'running', attempts = attempts + 1, updated_at = ?
         WHERE id = ?",
        params![now, row.id],
      )
      .map_err(|e| eyre!("Failed to claim job {}: {}", row.id, e))?;

      let mut job = row.into_job()?;
      job.state = JobState::Running;
      job.attempts += 1;
      job.updated_at = now;
      claimed.push(job);
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(claimed)
  }

  /// Record the result of an attempt.
  pub fn complete(&self, id: i64, outcome: &WorkerOutcome, now: i64) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "UPDATE sync_jobs
         SET state = ?, run_at = COALESCE(?, run_at), last_error = ?, updated_at = ?
         WHERE id = ?",
        params![
          outcome.state.as_str(),
          outcome.run_at,
          outcome.error,
          now,
          id
        ],
      )
      .map_err(|e| eyre!("Failed to update job {}: {}", id, e))?;
    Ok(())
  }

  /// Remove jobs for the key that have not started. Returns the count.
  pub fn cancel(&self, entity_type: &str, entity_id: &str) -> Result<usize> {
    self
      .db
      .conn()?
      .execute(
        "DELETE FROM sync_jobs
         WHERE entity_type = ? AND entity_id = ? AND state IN ('enqueued', 'retrying')",
        params![entity_type, entity_id],
      )
      .map_err(|e| eyre!("Failed to cancel jobs: {}", e))
  }

  /// Most recently enqueued job for the key.
  pub fn latest(&self, entity_type: &str, entity_id: &str) -> Result<Option<SyncJob>> {
    let row = self
      .db
      .conn()?
      .query_row(
        &format!(
          "SELECT {} FROM sync_jobs WHERE entity_type = ? AND entity_id = ?
           ORDER BY id DESC LIMIT 1",
          JOB_COLUMNS
        ),
        params![entity_type, entity_id],
        JobRow::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query job: {}", e))?;
    row.map(JobRow::into_job).transpose()
  }

  /// Every job for the key, oldest first.
  pub fn jobs_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<SyncJob>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM sync_jobs WHERE entity_type = ? AND entity_id = ? ORDER BY id",
        JOB_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let rows = stmt
      .query_map(params![entity_type, entity_id], JobRow::from_row)
      .map_err(|e| eyre!("Failed to query jobs: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read job: {}", e))?;
    collect_jobs(rows)
  }

  /// Put jobs left `Running` by a previous process back in the queue.
  pub fn recover_interrupted(&self, now: i64) -> Result<usize> {
    self
      .db
      .conn()?
      .execute(
        "UPDATE sync_jobs SET state = 'enqueued', run_at = ?, updated_at = ?
         WHERE state = 'running'",
        params![now, now],
      )
      .map_err(|e| eyre!("Failed to recover interrupted jobs: {}", e))
  }

  pub fn pending_count(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM sync_jobs WHERE state IN ('enqueued', 'retrying', 'running')",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count jobs: {}", e))?;
    Ok(count as usize)
  }

  /// Earliest `run_at` among pending jobs.
  pub fn next_due_at(&self) -> Result<Option<i64>> {
    self
      .db
      .conn()?
      .query_row(
        "SELECT MIN(run_at) FROM sync_jobs WHERE state IN ('enqueued', 'retrying')",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to query next due job: {}", e))
  }

  /// Delete finished jobs last touched more than `older_than` ago.
  pub fn purge_finished(&self, older_than: Duration, now: i64) -> Result<usize> {
    let cutoff = now - older_than.as_millis() as i64;
    self
      .db
      .conn()?
      .execute(
        "DELETE FROM sync_jobs
         WHERE state IN ('succeeded', 'conflicted', 'permanently_failed') AND updated_at < ?",
        params![cutoff],
      )
      .map_err(|e| eyre!("Failed to purge jobs: {}", e))
  }
}
