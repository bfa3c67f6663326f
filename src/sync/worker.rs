//! One attempt of one job.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::handler::{AttemptOutcome, HandlerRegistry};
use super::queue::SyncJob;
use super::types::{JobState, RetryPolicy};
use crate::cache::now_millis;
use crate::telemetry::{RemoteLog, SyncEvent};

/// State the job moves to after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
  pub state: JobState,
  /// Next attempt time when the job is retried
  pub run_at: Option<i64>,
  pub error: Option<String>,
}

impl WorkerOutcome {
  fn finished(state: JobState, error: Option<String>) -> Self {
    Self {
      state,
      run_at: None,
      error,
    }
  }
}

/// Apply the retry policy to what an attempt amounted to.
///
/// `attempts` counts the attempt that just finished.
pub fn resolve(
  outcome: AttemptOutcome,
  attempts: u32,
  policy: &RetryPolicy,
  now: i64,
) -> WorkerOutcome {
  match outcome {
    AttemptOutcome::Synced | AttemptOutcome::NothingToSync => {
      WorkerOutcome::finished(JobState::Succeeded, None)
    }
    AttemptOutcome::Conflicted(conflict_type) => WorkerOutcome::finished(
      JobState::Conflicted,
      Some(format!("conflict: {}", conflict_type)),
    ),
    AttemptOutcome::Permanent(message) => {
      WorkerOutcome::finished(JobState::PermanentlyFailed, Some(message))
    }
    AttemptOutcome::Transient(cause) if policy.allows_retry(attempts) => {
      let delay = policy.backoff(attempts).as_millis() as i64;
      WorkerOutcome {
        state: JobState::Retrying,
        run_at: Some(now + delay),
        error: Some(cause),
      }
    }
    AttemptOutcome::Transient(cause) => WorkerOutcome::finished(
      JobState::PermanentlyFailed,
      Some(format!("gave up after {} attempts: {}", attempts, cause)),
    ),
  }
}

/// Runs claimed jobs against their registered handler.
#[derive(Clone)]
pub struct SyncWorker {
  registry: Arc<HandlerRegistry>,
  remote_log: Arc<dyn RemoteLog>,
}

impl SyncWorker {
  pub fn new(registry: Arc<HandlerRegistry>, remote_log: Arc<dyn RemoteLog>) -> Self {
    Self {
      registry,
      remote_log,
    }
  }

  /// Run one attempt of a claimed job. Never fails; every problem is folded
  /// into the returned outcome.
  pub async fn execute(&self, job: &SyncJob) -> WorkerOutcome {
    let outcome = match self.registry.get(job.entity_type()) {
      Some(handler) => {
        let attempt = handler.run(&job.operation, &job.config, &job.context);
        let result = AssertUnwindSafe(attempt).catch_unwind().await;
        let attempt_outcome = result
          .unwrap_or_else(|_| AttemptOutcome::Transient("sync handler panicked".to_string()));
        resolve(
          attempt_outcome,
          job.attempts,
          &job.config.retry_policy,
          now_millis(),
        )
      }
      None => WorkerOutcome::finished(
        JobState::PermanentlyFailed,
        Some(format!("no handler registered for {}", job.entity_type())),
      ),
    };

    self.report(job, &outcome);
    outcome
  }

  fn report(&self, job: &SyncJob, outcome: &WorkerOutcome) {
    let detail = outcome.error.as_deref().unwrap_or("");
    match outcome.state {
      JobState::Succeeded => info!(
        "Job {} ({} {} {}) succeeded",
        job.id,
        job.operation.kind(),
        job.entity_type(),
        job.entity_id()
      ),
      JobState::Retrying => warn!(
        "Job {} ({} {}) attempt {} failed, retrying: {}",
        job.id,
        job.entity_type(),
        job.entity_id(),
        job.attempts,
        detail
      ),
      JobState::Conflicted => warn!(
        "Job {} ({} {}) conflicted: {}",
        job.id,
        job.entity_type(),
        job.entity_id(),
        detail
      ),
      _ => error!(
        "Job {} ({} {}) failed permanently: {}",
        job.id,
        job.entity_type(),
        job.entity_id(),
        detail
      ),
    }

    self.remote_log.record(SyncEvent {
      job_id: job.id,
      entity_type: job.entity_type().to_string(),
      entity_id: job.entity_id().to_string(),
      operation: job.operation.kind(),
      attempt: job.attempts,
      state: outcome.state,
      detail: outcome.error.clone(),
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::handler::tests::ScriptedHandler;
  use crate::sync::handler::SyncRequest;
  use crate::sync::types::{
    Conflict, ConflictType, SyncConfig, SyncContext, SyncOperation, SyncResult,
  };
  use crate::sync::SyncHandler;
  use async_trait::async_trait;
  use color_eyre::Result;
  use std::sync::Mutex;

  #[derive(Default)]
  struct RecordingLog(Mutex<Vec<SyncEvent>>);

  impl RemoteLog for RecordingLog {
    fn record(&self, event: SyncEvent) {
      self.0.lock().unwrap().push(event);
    }
  }

  fn policy() -> RetryPolicy {
    RetryPolicy {
      max_attempts: 3,
      base_delay_ms: 1_000,
      max_delay_ms: 60_000,
    }
  }

  fn job(entity_type: &str, attempts: u32) -> SyncJob {
    SyncJob {
      id: 1,
      operation: SyncOperation::create(entity_type, "e-1"),
      config: SyncConfig::standard(entity_type).with_retry_policy(policy()),
      context: SyncContext::new(),
      state: JobState::Running,
      attempts,
      run_at: 0,
      last_error: None,
      created_at: 0,
      updated_at: 0,
    }
  }

  #[test]
  fn test_resolve_mapping() {
    let policy = policy();
    assert_eq!(
      resolve(AttemptOutcome::Synced, 1, &policy, 0).state,
      JobState::Succeeded
    );
    assert_eq!(
      resolve(AttemptOutcome::NothingToSync, 1, &policy, 0).state,
      JobState::Succeeded
    );
    assert_eq!(
      resolve(AttemptOutcome::Permanent("400".into()), 1, &policy, 0).state,
      JobState::PermanentlyFailed
    );

    let retry = resolve(AttemptOutcome::Transient("timeout".into()), 2, &policy, 10_000);
    assert_eq!(retry.state, JobState::Retrying);
    assert_eq!(retry.run_at, Some(12_000));
    assert_eq!(retry.error.as_deref(), Some("timeout"));
  }

  #[test]
  fn test_retry_ceiling() {
    let outcome = resolve(AttemptOutcome::Transient("timeout".into()), 3, &policy(), 0);
    assert_eq!(outcome.state, JobState::PermanentlyFailed);
    assert!(outcome.run_at.is_none());
  }

  #[test]
  fn test_conflict_is_never_retried() {
    let outcome = resolve(
      AttemptOutcome::Conflicted(ConflictType::Duplicate),
      1,
      &policy(),
      0,
    );
    assert_eq!(outcome.state, JobState::Conflicted);
    assert!(outcome.run_at.is_none());
  }

  #[tokio::test]
  async fn test_execute_records_event() {
    let mut registry = HandlerRegistry::new();
    registry.register(ScriptedHandler::new(
      "things",
      vec![SyncResult::TransientError("timeout".into())],
    ));
    let log = Arc::new(RecordingLog::default());
    let worker = SyncWorker::new(Arc::new(registry), log.clone());

    let outcome = worker.execute(&job("things", 1)).await;
    assert_eq!(outcome.state, JobState::Retrying);

    let events = log.0.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, JobState::Retrying);
    assert_eq!(events[0].attempt, 1);
    assert_eq!(events[0].detail.as_deref(), Some("timeout"));
  }

  #[tokio::test]
  async fn test_missing_handler_fails_permanently() {
    let worker = SyncWorker::new(
      Arc::new(HandlerRegistry::new()),
      Arc::new(RecordingLog::default()),
    );
    let outcome = worker.execute(&job("payments", 1)).await;
    assert_eq!(outcome.state, JobState::PermanentlyFailed);
  }

  struct PanickingHandler;

  #[async_trait]
  impl SyncHandler for PanickingHandler {
    type Entity = ();
    type Response = ();

    fn entity_type(&self) -> &str {
      "panics"
    }

    async fn get_entity(&self, _entity_id: &str) -> Result<Option<()>> {
      panic!("row decoder bug");
    }

    async fn prepare_request(
      &self,
      _entity: &(),
      _operation: &SyncOperation,
      _config: &SyncConfig,
      _context: &SyncContext,
    ) -> Result<SyncRequest> {
      unreachable!()
    }

    async fn execute_sync(
      &self,
      _entity: &(),
      _operation: &SyncOperation,
      _request: SyncRequest,
    ) -> SyncResult<()> {
      unreachable!()
    }

    async fn on_sync_success(&self, _entity: &(), _response: ()) -> Result<()> {
      Ok(())
    }

    async fn on_conflict(&self, _entity: &(), _conflict: &Conflict) -> Result<()> {
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_panicking_handler_is_retried() {
    let mut registry = HandlerRegistry::new();
    registry.register(PanickingHandler);
    let worker = SyncWorker::new(Arc::new(registry), Arc::new(RecordingLog::default()));

    let outcome = worker.execute(&job("panics", 1)).await;
    assert_eq!(outcome.state, JobState::Retrying);
    assert_eq!(outcome.error.as_deref(), Some("sync handler panicked"));
  }
}
