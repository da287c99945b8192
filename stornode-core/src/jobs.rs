//! Background job runner.
//!
//! Long volume operations (scrub, restore, clone copy, image import) run here,
//! off the request path. A job takes over the request's [`LockGuard`] by
//! re-registering it under its own owner identity, so the resource stays held
//! even after the request that started it has returned.
//!
//! Exactly one of `on_success` / `on_failure` fires per job, including when
//! the work panics. The lock is released once the callback has run.

use crate::error::{Result, StorageError};
use crate::lock::LockGuard;
use crate::observability::metrics;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Describes a job for logs and metrics.
#[derive(Debug, Clone)]
pub struct Job {
    pub kind: &'static str,
    pub resource_id: String,
    /// Run inline and return only after the callbacks have fired.
    pub synchronous: bool,
}

impl Job {
    pub fn new(kind: &'static str, resource_id: impl Into<String>) -> Self {
        Self { kind, resource_id: resource_id.into(), synchronous: false }
    }

    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }
}

/// What a running job sees of its environment.
#[derive(Debug, Clone)]
pub struct JobContext {
    guard: Arc<LockGuard>,
    cancel: CancellationToken,
}

impl JobContext {
    /// The resource lock the job holds.
    pub fn guard(&self) -> &LockGuard {
        &self.guard
    }

    /// Fires when an interrupting claimant steals the resource.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with `Cancelled` if the job has been interrupted.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            let resource = self.guard.path().display().to_string();
            return Err(StorageError::Cancelled { resource });
        }
        Ok(())
    }
}

/// Handle to a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    task: Option<JoinHandle<()>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    /// Wait until the job and its callbacks are done.
    pub async fn wait(self) {
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                warn!(job_id = %self.id, error = %e, "Job task did not complete");
            }
        }
    }
}

/// Runs jobs on a bounded pool of tokio tasks.
#[derive(Clone)]
pub struct JobRunner {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
}

impl JobRunner {
    /// Create a runner executing at most `max_concurrent` jobs at a time.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of jobs currently executing (not waiting for a permit).
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Submit `work` under `guard`.
    ///
    /// Fails without running anything if `guard` no longer owns its resource.
    pub async fn run<T, W, WF, S, SF, F, FF>(
        &self,
        job: Job,
        guard: LockGuard,
        work: W,
        on_success: S,
        on_failure: F,
    ) -> Result<JobHandle>
    where
        T: Send + 'static,
        W: FnOnce(JobContext) -> WF + Send + 'static,
        WF: Future<Output = Result<T>> + Send + 'static,
        S: FnOnce(T) -> SF + Send + 'static,
        SF: Future<Output = ()> + Send + 'static,
        F: FnOnce(StorageError) -> FF + Send + 'static,
        FF: Future<Output = ()> + Send + 'static,
    {
        let guard = guard.transfer()?;
        let id = Uuid::new_v4();
        let cancel = guard.cancellation_token();
        let ctx = JobContext { guard: Arc::new(guard), cancel };

        debug!(job_id = %id, kind = job.kind, resource_id = %job.resource_id, "Submitting job");
        let task = self.clone().execute(id, job.clone(), ctx, work, on_success, on_failure);

        if job.synchronous {
            task.await;
            return Ok(JobHandle { id, task: None });
        }
        Ok(JobHandle { id, task: Some(self.tracker.spawn(task)) })
    }

    async fn execute<T, W, WF, S, SF, F, FF>(
        self,
        id: Uuid,
        job: Job,
        ctx: JobContext,
        work: W,
        on_success: S,
        on_failure: F,
    ) where
        T: Send + 'static,
        W: FnOnce(JobContext) -> WF + Send + 'static,
        WF: Future<Output = Result<T>> + Send + 'static,
        S: FnOnce(T) -> SF + Send + 'static,
        SF: Future<Output = ()> + Send + 'static,
        F: FnOnce(StorageError) -> FF + Send + 'static,
        FF: Future<Output = ()> + Send + 'static,
    {
        let guard = ctx.guard.clone();
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                on_failure(StorageError::ServiceUnavailable {
                    reason: "job runner is shut down".to_string(),
                })
                .await;
                release(guard);
                return;
            }
        };

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_jobs_running(running);
        info!(job_id = %id, kind = job.kind, resource_id = %job.resource_id, "Job started");
        let started = Instant::now();

        // The work runs in its own task so a panic surfaces as a JoinError
        // instead of tearing down the callbacks.
        let outcome = match self.tracker.spawn(async move { work(ctx).await }).await {
            Ok(result) => result,
            Err(e) => Err(StorageError::Internal(format!("job panicked: {}", e))),
        };

        let outcome_label = match outcome {
            Ok(value) => {
                info!(
                    job_id = %id,
                    kind = job.kind,
                    resource_id = %job.resource_id,
                    "Job succeeded"
                );
                on_success(value).await;
                "success"
            }
            Err(e) => {
                error!(
                    job_id = %id,
                    kind = job.kind,
                    resource_id = %job.resource_id,
                    error = %e,
                    "Job failed"
                );
                on_failure(e).await;
                "failure"
            }
        };
        release(guard);

        let running = self.running.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_jobs_running(running);
        metrics::record_job_finished(job.kind, outcome_label, started.elapsed().as_secs_f64());
    }

    /// Wait for the jobs in flight, then stop. Jobs submitted afterwards fail
    /// with `ServiceUnavailable` without running.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.permits.close();
        info!("Job runner stopped");
    }
}

fn release(guard: Arc<LockGuard>) {
    match Arc::try_unwrap(guard) {
        Ok(guard) => {
            if let Err(e) = guard.release() {
                warn!(error = %e, "Failed to release job lock");
            }
        }
        // A clone escaped the work future; the lock goes with its last copy.
        Err(shared) => drop(shared),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{Claim, ClaimInfo, LockManager};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn claim(locks: &LockManager, path: &PathBuf, uri: &str) -> LockGuard {
        match locks.claim(path, ClaimInfo::new(uri)).unwrap() {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => panic!("unexpected duplicate"),
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn callbacks(
        log: &Log,
    ) -> (
        impl FnOnce(u32) -> std::future::Ready<()> + Send + 'static,
        impl FnOnce(StorageError) -> std::future::Ready<()> + Send + 'static,
    ) {
        let ok_log = log.clone();
        let err_log = log.clone();
        (
            move |v| {
                ok_log.lock().unwrap().push(format!("success {}", v));
                std::future::ready(())
            },
            move |e| {
                err_log.lock().unwrap().push(format!("failure {}", e));
                std::future::ready(())
            },
        )
    }

    #[tokio::test]
    async fn test_synchronous_success_releases_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resource");
        let locks = LockManager::new();
        let guard = claim(&locks, &path, "PUT /volumes/r1");
        let log: Log = Arc::default();
        let (ok, err) = callbacks(&log);

        let runner = JobRunner::new(2);
        let probe_locks = locks.clone();
        let probe_path = path.clone();
        let handle = runner
            .run(
                Job::new("test", "r1").synchronous(true),
                guard,
                move |_ctx| async move {
                    // Still held while the work runs.
                    assert!(probe_locks.probe(&probe_path).unwrap().is_some());
                    Ok(7)
                },
                ok,
                err,
            )
            .await
            .unwrap();

        assert!(handle.is_finished());
        assert_eq!(*log.lock().unwrap(), vec!["success 7"]);
        assert_eq!(locks.probe(&path).unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_invokes_only_on_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resource");
        let locks = LockManager::new();
        let log: Log = Arc::default();
        let (ok, err) = callbacks(&log);

        JobRunner::new(1)
            .run(
                Job::new("test", "r1").synchronous(true),
                claim(&locks, &path, "PUT /volumes/r1"),
                |_ctx| async { Err::<u32, _>(StorageError::Internal("boom".into())) },
                ok,
                err,
            )
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["failure Internal error: boom"]);
        assert_eq!(locks.probe(&path).unwrap(), None);
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resource");
        let locks = LockManager::new();
        let log: Log = Arc::default();
        let (ok, err) = callbacks(&log);

        JobRunner::new(1)
            .run(
                Job::new("test", "r1").synchronous(true),
                claim(&locks, &path, "PUT /volumes/r1"),
                |_ctx| async {
                    if true {
                        panic!("worker exploded");
                    }
                    Ok(1u32)
                },
                ok,
                err,
            )
            .await
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("failure"), "{:?}", log);
        assert_eq!(locks.probe(&path).unwrap(), None);
    }

    #[tokio::test]
    async fn test_background_job_keeps_lock_after_request_returns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resource");
        let locks = LockManager::new();
        let log: Log = Arc::default();
        let (ok, err) = callbacks(&log);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let runner = JobRunner::new(1);
        let handle = runner
            .run(
                Job::new("test", "r1"),
                claim(&locks, &path, "PUT /volumes/r1"),
                move |_ctx| async move {
                    let _ = release_rx.await;
                    Ok(3)
                },
                ok,
                err,
            )
            .await
            .unwrap();

        // The request side has returned; the worker owns the resource now.
        assert_eq!(locks.probe(&path).unwrap().unwrap().uri, "PUT /volumes/r1");
        assert!(locks.claim(&path, ClaimInfo::new("DELETE /volumes/r1")).unwrap_err().is_busy());

        release_tx.send(()).unwrap();
        handle.wait().await;
        assert_eq!(*log.lock().unwrap(), vec!["success 3"]);
        assert_eq!(locks.probe(&path).unwrap(), None);
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_interrupted_job_sees_cancellation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resource");
        let locks = LockManager::new();
        let log: Log = Arc::default();
        let (ok, err) = callbacks(&log);

        let guard = match locks
            .claim(&path, ClaimInfo::new("PUT /volumes/r1").interruptible(true))
            .unwrap()
        {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => unreachable!(),
        };
        let runner = JobRunner::new(1);
        let handle = runner
            .run(
                Job::new("restore", "r1"),
                guard,
                |ctx| async move {
                    ctx.cancel_token().cancelled().await;
                    ctx.check_cancelled()?;
                    Ok(0)
                },
                ok,
                err,
            )
            .await
            .unwrap();

        let _delete = match locks
            .claim(&path, ClaimInfo::new("DELETE /volumes/r1").interruptible(false))
            .unwrap()
        {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => unreachable!(),
        };
        handle.wait().await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("cancelled"), "{:?}", log);
        // The interrupted job must not release the new owner's record.
        assert_eq!(locks.probe(&path).unwrap().unwrap().uri, "DELETE /volumes/r1");
    }

    #[tokio::test]
    async fn test_stolen_guard_cannot_start_job() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resource");
        let locks = LockManager::new();
        let log: Log = Arc::default();
        let (ok, err) = callbacks(&log);

        let first = match locks
            .claim(&path, ClaimInfo::new("PUT /volumes/r1").interruptible(true))
            .unwrap()
        {
            Claim::Acquired(guard) => guard,
            Claim::Duplicate(_) => unreachable!(),
        };
        let _second = claim(&locks, &path, "DELETE /volumes/r1");

        let result = JobRunner::new(1)
            .run(Job::new("test", "r1"), first, |_ctx| async { Ok(1) }, ok, err)
            .await;
        assert!(result.unwrap_err().is_busy());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jobs_after_shutdown_fail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resource");
        let locks = LockManager::new();
        let log: Log = Arc::default();
        let (ok, err) = callbacks(&log);

        let runner = JobRunner::new(1);
        runner.shutdown().await;
        let handle = runner
            .run(
                Job::new("test", "r1"),
                claim(&locks, &path, "PUT /volumes/r1"),
                |_ctx| async { Ok(1) },
                ok,
                err,
            )
            .await
            .unwrap();
        handle.wait().await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1, "{:?}", log);
        assert!(log[0].starts_with("failure") && log[0].contains("shut down"), "{:?}", log);
        assert_eq!(locks.probe(&path).unwrap(), None);
    }
}
