//! Public entry point of the sync engine.
//!
//! Business code enqueues mutations here; the scheduler loop started by
//! [`SyncManager::start`] claims due jobs from the store and runs a
//! [`SyncWorker`] attempt for each, writing the outcome back.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::queue::{JobStore, SyncJob};
use super::types::{JobState, OperationKind, SyncConfig, SyncContext, SyncOperation};
use super::worker::SyncWorker;
use crate::cache::now_millis;
use crate::config::SyncSettings;
use crate::db::Database;

struct Inner {
  store: JobStore,
  worker: SyncWorker,
  poll_interval: Duration,
  concurrency: usize,
  wake: Notify,
}

impl Inner {
  async fn run_job(&self, job: SyncJob) {
    let outcome = self.worker.execute(&job).await;
    if let Err(e) = self.store.complete(job.id, &outcome, now_millis()) {
      error!("Failed to record outcome of job {}: {}", job.id, e);
    }
  }

  /// Time until the scheduler should look at the queue again.
  fn next_wake(&self) -> Duration {
    let now = now_millis();
    match self.store.next_due_at() {
      Ok(Some(due)) if due > now => self
        .poll_interval
        .min(Duration::from_millis((due - now) as u64)),
      Ok(_) => self.poll_interval,
      Err(e) => {
        warn!("Failed to read next due job: {}", e);
        self.poll_interval
      }
    }
  }
}

struct Scheduler {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

/// Durable background synchronization of local mutations.
pub struct SyncManager {
  inner: Arc<Inner>,
  scheduler: Mutex<Option<Scheduler>>,
}

impl SyncManager {
  pub fn new(db: Arc<Database>, worker: SyncWorker, settings: &SyncSettings) -> Self {
    Self {
      inner: Arc::new(Inner {
        store: JobStore::new(db),
        worker,
        poll_interval: settings.poll_interval(),
        concurrency: settings.concurrency.max(1),
        wake: Notify::new(),
      }),
      scheduler: Mutex::new(None),
    }
  }

  /// Persist a mutation for background synchronization.
  ///
  /// The job is keyed by `(config.entity_type, entity_id)`. With
  /// `replace_existing` any not-yet-started job for that key is dropped, so
  /// only the latest state is sent.
  pub async fn enqueue(
    &self,
    entity_id: &str,
    operation: OperationKind,
    config: SyncConfig,
    context: SyncContext,
    replace_existing: bool,
  ) -> Result<i64> {
    if entity_id.is_empty() {
      return Err(eyre!("Cannot enqueue a job without an entity id"));
    }
    let operation = SyncOperation::new(operation, &config.entity_type, entity_id);
    let (id, superseded) =
      self
        .inner
        .store
        .insert(&operation, &config, &context, replace_existing, now_millis())?;

    info!(
      "Enqueued job {} ({} {} {})",
      id,
      operation.kind(),
      operation.entity_type(),
      entity_id
    );
    if superseded > 0 {
      debug!(
        "Job {} superseded {} pending job(s) for {} {}",
        id,
        superseded,
        operation.entity_type(),
        entity_id
      );
    }

    self.inner.wake.notify_one();
    Ok(id)
  }

  /// Drop not-yet-started jobs for the key. Returns how many were removed.
  pub async fn cancel(&self, entity_type: &str, entity_id: &str) -> Result<usize> {
    let removed = self.inner.store.cancel(entity_type, entity_id)?;
    if removed > 0 {
      info!("Cancelled {} job(s) for {} {}", removed, entity_type, entity_id);
    }
    Ok(removed)
  }

  /// State of the most recent job for the key.
  pub async fn get_status(&self, entity_type: &str, entity_id: &str) -> Result<Option<JobState>> {
    Ok(
      self
        .inner
        .store
        .latest(entity_type, entity_id)?
        .map(|job| job.state),
    )
  }

  pub async fn jobs_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<SyncJob>> {
    self.inner.store.jobs_for(entity_type, entity_id)
  }

  /// Jobs that are enqueued, waiting to retry, or running.
  pub async fn pending_count(&self) -> Result<usize> {
    self.inner.store.pending_count()
  }

  pub async fn purge_finished(&self, older_than: Duration) -> Result<usize> {
    self.inner.store.purge_finished(older_than, now_millis())
  }

  /// Run every currently due job in the foreground until none are left.
  ///
  /// Returns the number of attempts made. Jobs scheduled for a later retry
  /// are left in the queue.
  pub async fn run_pending(&self) -> Result<usize> {
    let mut attempts = 0;
    loop {
      let jobs = self
        .inner
        .store
        .claim_due(now_millis(), self.inner.concurrency)?;
      if jobs.is_empty() {
        return Ok(attempts);
      }
      attempts += jobs.len();
      join_all(jobs.into_iter().map(|job| self.inner.run_job(job))).await;
    }
  }

  /// Replay interrupted jobs and start the background scheduler.
  pub async fn start(&self) -> Result<()> {
    let mut scheduler = self.scheduler.lock().await;
    if scheduler.is_some() {
      warn!("Sync manager already started");
      return Ok(());
    }

    let recovered = self.inner.store.recover_interrupted(now_millis())?;
    if recovered > 0 {
      info!("Re-queued {} job(s) interrupted by a previous shutdown", recovered);
    }

    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(schedule(Arc::clone(&self.inner), shutdown_rx));
    *scheduler = Some(Scheduler { shutdown, task });
    info!(
      "Sync manager started (concurrency {}, poll every {:?})",
      self.inner.concurrency, self.inner.poll_interval
    );
    Ok(())
  }

  /// Stop claiming jobs and wait for in-flight attempts to finish.
  pub async fn shutdown(&self) -> Result<()> {
    let Some(scheduler) = self.scheduler.lock().await.take() else {
      return Ok(());
    };
    let _ = scheduler.shutdown.send(true);
    scheduler
      .task
      .await
      .map_err(|e| eyre!("Sync scheduler failed: {}", e))?;
    info!("Sync manager stopped");
    Ok(())
  }

  pub async fn is_running(&self) -> bool {
    self.scheduler.lock().await.is_some()
  }
}

fn acquire_permits(semaphore: &Arc<Semaphore>) -> Vec<OwnedSemaphorePermit> {
  let mut permits = Vec::new();
  while let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() {
    permits.push(permit);
  }
  permits
}

async fn schedule(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
  let semaphore = Arc::new(Semaphore::new(inner.concurrency));
  let mut workers = JoinSet::new();

  loop {
    let mut permits = acquire_permits(&semaphore);
    if !permits.is_empty() {
      match inner.store.claim_due(now_millis(), permits.len()) {
        Ok(jobs) => {
          for job in jobs {
            let Some(permit) = permits.pop() else { break };
            let inner = Arc::clone(&inner);
            workers.spawn(async move {
              let _permit = permit;
              inner.run_job(job).await;
            });
          }
        }
        Err(e) => error!("Failed to claim jobs: {}", e),
      }
    }
    drop(permits);

    tokio::select! {
      _ = shutdown.changed() => break,
      _ = inner.wake.notified() => {}
      Some(joined) = workers.join_next(), if !workers.is_empty() => {
        if let Err(e) = joined {
          error!("Sync worker task failed: {}", e);
        }
      }
      _ = tokio::time::sleep(inner.next_wake()) => {}
    }
  }

  debug!("Waiting for {} in-flight sync job(s)", workers.len());
  while let Some(joined) = workers.join_next().await {
    if let Err(e) = joined {
      error!("Sync worker task failed: {}", e);
    }
  }
}
