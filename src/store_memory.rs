//! In-memory reference implementation of the storage contracts.
//!
//! One `MemoryStore` implements all four traits behind a single
//! `tokio::sync::RwLock`; the write lock is what makes `claim_next`
//! atomic under concurrent workers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::store::{HistoryStore, InstanceStore, JobStore, ProcessStore};
use crate::types::{Job, ProcessDefinition, ProcessInstance, StepExecutionRecord};

struct Inner {
    definitions: HashMap<Uuid, ProcessDefinition>,
    instances: HashMap<Uuid, ProcessInstance>,
    jobs: Vec<Job>,
    history: HashMap<Uuid, Vec<StepExecutionRecord>>,
    history_seq: HashMap<Uuid, i64>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                definitions: HashMap::new(),
                instances: HashMap::new(),
                jobs: Vec::new(),
                history: HashMap::new(),
                history_seq: HashMap::new(),
            }),
        }
    }

    /// Rewind a job's lease expiry, as a crashed worker's clock would.
    /// Test support for lease-recovery scenarios.
    pub async fn expire_lease(&self, job_id: Uuid) {
        let mut w = self.inner.write().await;
        if let Some(job) = w.jobs.iter_mut().find(|j| j.id == job_id) {
            job.locked_until = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn save(&self, definition: &mut ProcessDefinition) -> Result<(), EngineError> {
        let mut w = self.inner.write().await;
        let version = w
            .definitions
            .values()
            .filter(|d| d.key == definition.key)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1;
        for prior in w.definitions.values_mut() {
            if prior.key == definition.key {
                prior.is_latest = false;
            }
        }
        definition.version = version;
        definition.is_latest = true;
        w.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<ProcessDefinition>, EngineError> {
        let r = self.inner.read().await;
        Ok(r.definitions
            .values()
            .find(|d| d.key == key && d.is_latest)
            .cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ProcessDefinition>, EngineError> {
        let r = self.inner.read().await;
        Ok(r.definitions.get(&id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<ProcessDefinition>, EngineError> {
        let r = self.inner.read().await;
        let mut all: Vec<ProcessDefinition> = r.definitions.values().cloned().collect();
        all.sort_by(|a, b| (&a.key, a.version).cmp(&(&b.key, b.version)));
        Ok(all)
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn save(&self, instance: &mut ProcessInstance) -> Result<(), EngineError> {
        let mut w = self.inner.write().await;
        if let Some(existing) = w.instances.get(&instance.id) {
            if existing.concurrency_token != instance.concurrency_token {
                return Err(EngineError::ConcurrencyConflict {
                    entity: "process instance",
                    id: instance.id,
                });
            }
        }
        instance.concurrency_token = Some(Uuid::now_v7());
        instance.updated_at = Utc::now();
        w.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ProcessInstance>, EngineError> {
        let r = self.inner.read().await;
        Ok(r.instances.get(&id).cloned())
    }

    async fn get_by_process_key(
        &self,
        key: &str,
    ) -> Result<Vec<ProcessInstance>, EngineError> {
        let r = self.inner.read().await;
        let mut found: Vec<ProcessInstance> = r
            .instances
            .values()
            .filter(|i| i.process_key == key)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.created_at);
        Ok(found)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: &mut Job) -> Result<(), EngineError> {
        let mut w = self.inner.write().await;
        if job.id.is_nil() {
            job.id = Uuid::now_v7();
        }
        if job.concurrency_token.is_nil() {
            job.concurrency_token = Uuid::now_v7();
        }
        job.attempt = 0;
        w.jobs.push(job.clone());
        Ok(())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, EngineError> {
        let now = Utc::now();
        let mut w = self.inner.write().await;

        let mut best: Option<usize> = None;
        for (i, job) in w.jobs.iter().enumerate() {
            let due = job.run_at.map_or(true, |at| at <= now);
            let unleased = job.locked_until.map_or(true, |until| until < now);
            if !(due && unleased) {
                continue;
            }
            // run_at ascending, nulls first; insertion order breaks ties
            let earlier = match best {
                None => true,
                Some(j) => match (job.run_at, w.jobs[j].run_at) {
                    (None, Some(_)) => true,
                    (Some(a), Some(b)) => a < b,
                    _ => false,
                },
            };
            if earlier {
                best = Some(i);
            }
        }

        let Some(i) = best else {
            return Ok(None);
        };
        let lease = chrono::Duration::from_std(lease)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let job = &mut w.jobs[i];
        job.owner_id = Some(worker_id.to_string());
        job.locked_until = Some(now + lease);
        job.attempt += 1;
        job.concurrency_token = Uuid::now_v7();
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<bool, EngineError> {
        let mut w = self.inner.write().await;
        let before = w.jobs.len();
        w.jobs
            .retain(|j| !(j.id == job_id && j.owner_id.as_deref() == Some(worker_id)));
        Ok(w.jobs.len() < before)
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, record: &mut StepExecutionRecord) -> Result<(), EngineError> {
        let mut w = self.inner.write().await;
        let seq = w
            .history_seq
            .entry(record.process_instance_id)
            .or_insert(0);
        *seq += 1;
        record.sequence = *seq;
        if record.id.is_nil() {
            record.id = Uuid::now_v7();
        }
        w.history
            .entry(record.process_instance_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn list_for_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, EngineError> {
        let r = self.inner.read().await;
        Ok(r.history.get(&instance_id).cloned().unwrap_or_default())
    }
}
