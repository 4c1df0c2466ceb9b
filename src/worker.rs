//! Background worker: claim a job, step the instance, complete the job.
//!
//! The job store is the serialization point between workers — a successful
//! claim grants the right to step the referenced instance for the duration
//! of the lease. A worker that fails mid-job simply lets the lease expire;
//! the next claim retries with an incremented attempt counter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::engine::ProcessEngine;
use crate::error::EngineError;
use crate::store::JobStore;
use crate::types::{Job, JOB_TYPE_CONTINUE_INSTANCE};

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Sleep between empty polls.
    pub poll_interval: Duration,
    /// Lease requested on every claim; must comfortably exceed one step.
    pub lease: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
        }
    }
}

pub struct JobWorker {
    engine: Arc<ProcessEngine>,
    jobs: Arc<dyn JobStore>,
    worker_id: String,
    options: WorkerOptions,
}

impl JobWorker {
    pub fn new(
        engine: Arc<ProcessEngine>,
        jobs: Arc<dyn JobStore>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            jobs,
            worker_id: worker_id.into(),
            options: WorkerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.worker_id, "job worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if !self.poll_once().await {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "job worker stopped");
    }

    /// Claim and process at most one job. Returns whether one was claimed.
    pub async fn poll_once(&self) -> bool {
        let job = match self
            .jobs
            .claim_next(&self.worker_id, self.options.lease)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "failed to claim job");
                return false;
            }
        };
        self.process(job).await;
        true
    }

    async fn process(&self, job: Job) {
        if job.job_type != JOB_TYPE_CONTINUE_INSTANCE {
            tracing::warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                "unknown job type, discarding"
            );
            self.complete(&job).await;
            return;
        }

        let cancel = CancellationToken::new();
        match self
            .engine
            .step_instance(job.process_instance_id, &cancel)
            .await
        {
            Ok(instance) => {
                self.complete(&job).await;
                tracing::debug!(
                    job_id = %job.id,
                    instance_id = %instance.id,
                    completed = instance.is_completed(),
                    "stepped instance"
                );
            }
            Err(EngineError::ConcurrencyConflict { .. }) => {
                // Another writer advanced the instance; the job is retried
                // after lease expiry against the fresher state.
                tracing::debug!(
                    job_id = %job.id,
                    "concurrency conflict while stepping, leaving job for re-claim"
                );
            }
            Err(EngineError::InstanceNotFound(instance_id)) => {
                tracing::warn!(
                    job_id = %job.id,
                    instance_id = %instance_id,
                    "job references a missing instance, discarding"
                );
                self.complete(&job).await;
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    error = %e,
                    "step failed, job will be retried after lease expiry"
                );
            }
        }
    }

    async fn complete(&self, job: &Job) {
        match self.jobs.complete(job.id, &self.worker_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = %job.id, "lease lost before completion");
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "failed to complete job");
            }
        }
    }
}
