//! Persistence contracts.
//!
//! The executor and façade operate exclusively through these traits,
//! enabling pluggable backends: `MemoryStore` for embedded and test use,
//! `PostgresStore` (feature `postgres`) for durable multi-worker setups.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{Job, ProcessDefinition, ProcessInstance, StepExecutionRecord};

/// Write-once definition storage with per-key versioning.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    /// Persist a new deployment. Assigns the next version for the
    /// definition's key and atomically moves the "latest" mark onto it.
    async fn save(&self, definition: &mut ProcessDefinition) -> Result<(), EngineError>;

    /// Latest version for a key.
    async fn get_by_key(&self, key: &str) -> Result<Option<ProcessDefinition>, EngineError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ProcessDefinition>, EngineError>;

    async fn get_all(&self) -> Result<Vec<ProcessDefinition>, EngineError>;
}

/// Instance storage with optimistic concurrency.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Persist the instance. Fails with `ConcurrencyConflict` when the
    /// stored concurrency token no longer matches the instance's; on
    /// success the token is bumped in place.
    async fn save(&self, instance: &mut ProcessInstance) -> Result<(), EngineError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ProcessInstance>, EngineError>;

    async fn get_by_process_key(&self, key: &str)
        -> Result<Vec<ProcessInstance>, EngineError>;
}

/// The durable coordination primitive: a queue with single-claim leases.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job. Normalizes identity: assigns an id and concurrency
    /// token when absent, resets `attempt` to zero.
    async fn enqueue(&self, job: &mut Job) -> Result<(), EngineError>;

    /// Atomically claim the next eligible job for `worker_id`.
    ///
    /// Eligible means `run_at` is unset or past, and the lease is unset or
    /// expired; candidates are taken `run_at`-ascending, nulls first. The
    /// claim sets the owner, extends `locked_until` by `lease`, increments
    /// `attempt` and bumps the concurrency token. A claim lost to a
    /// concurrent worker returns `None`, never an error.
    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, EngineError>;

    /// Delete the job if and only if `worker_id` still owns it. Returns
    /// whether a row was deleted; a stale owner is a no-op.
    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<bool, EngineError>;
}

/// Append-only per-element execution history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record, assigning the next per-instance `sequence`.
    async fn append(&self, record: &mut StepExecutionRecord) -> Result<(), EngineError>;

    async fn list_for_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, EngineError>;
}
