//! The runtime façade: deploy, start, step and query in one place.
//!
//! The engine coordinates the executor and the stores and owns the handler
//! registry. Whenever a persisted instance still has steps to perform and a
//! job store is wired in, a `continue-instance` job is enqueued so that a
//! worker fleet can drive execution.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineError;
use crate::executor::{Executor, HandlerRegistry, TaskHandler};
use crate::store::{HistoryStore, InstanceStore, JobStore, ProcessStore};
use crate::store_memory::MemoryStore;
use crate::types::{Job, ProcessDefinition, ProcessInstance, StepExecutionRecord};
use crate::xml;

pub struct ProcessEngine {
    process_store: Arc<dyn ProcessStore>,
    instance_store: Arc<dyn InstanceStore>,
    job_store: Option<Arc<dyn JobStore>>,
    history: Option<Arc<dyn HistoryStore>>,
    handlers: Arc<HandlerRegistry>,
    executor: Executor,
}

impl ProcessEngine {
    pub fn new(
        process_store: Arc<dyn ProcessStore>,
        instance_store: Arc<dyn InstanceStore>,
    ) -> Self {
        let handlers = Arc::new(HandlerRegistry::new());
        let executor = Executor::new(process_store.clone(), handlers.clone());
        Self {
            process_store,
            instance_store,
            job_store: None,
            history: None,
            handlers,
            executor,
        }
    }

    pub fn with_job_store(mut self, job_store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(job_store);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.executor = Executor::new(self.process_store.clone(), self.handlers.clone())
            .with_history(history.clone());
        self.history = Some(history);
        self
    }

    /// Fully wired engine over a single `MemoryStore`.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(store.clone(), store.clone())
            .with_job_store(store.clone())
            .with_history(store)
    }

    /// Register a service-task handler under its declared type.
    /// Matching is case-insensitive; a later registration replaces an
    /// earlier one for the same type.
    pub fn register_handler(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        tracing::debug!(task_type = %task_type, "registered task handler");
        self.handlers.register(task_type, handler);
    }

    pub fn job_store(&self) -> Option<Arc<dyn JobStore>> {
        self.job_store.clone()
    }

    // ─── Deployment ───────────────────────────────────────────

    /// Parse and persist a process definition. Each deployment gets a fresh
    /// id and the next version for its key.
    pub async fn deploy(&self, source: &str) -> Result<ProcessDefinition, EngineError> {
        let parsed = xml::parse_process(source)?;
        let mut definition = ProcessDefinition {
            id: Uuid::now_v7(),
            key: parsed.process_id.clone(),
            name: parsed
                .process_name
                .clone()
                .unwrap_or_else(|| parsed.process_id.clone()),
            version: 0,
            xml: source.to_string(),
            content_hash: content_hash(source),
            is_latest: true,
            created_at: Utc::now(),
            elements: parsed.elements,
        };
        self.process_store.save(&mut definition).await?;
        tracing::info!(
            key = %definition.key,
            version = definition.version,
            "deployed process definition"
        );
        Ok(definition)
    }

    // ─── Starting ─────────────────────────────────────────────

    /// Start an instance of the latest definition for `key`.
    pub async fn start_by_key(
        &self,
        key: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<ProcessInstance, EngineError> {
        let definition = self
            .process_store
            .get_by_key(key)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))?;
        self.start_instance(&definition, variables).await
    }

    /// Start an instance of a specific deployed version.
    pub async fn start(
        &self,
        definition_id: Uuid,
        variables: BTreeMap<String, Value>,
    ) -> Result<ProcessInstance, EngineError> {
        let definition = self
            .process_store
            .get_by_id(definition_id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_id.to_string()))?;
        self.start_instance(&definition, variables).await
    }

    async fn start_instance(
        &self,
        definition: &ProcessDefinition,
        variables: BTreeMap<String, Value>,
    ) -> Result<ProcessInstance, EngineError> {
        let mut instance = self.executor.start(definition, variables, false);
        self.instance_store.save(&mut instance).await?;
        self.enqueue_continuation(&instance).await?;
        tracing::info!(
            instance_id = %instance.id,
            process_key = %instance.process_key,
            "started process instance"
        );
        Ok(instance)
    }

    // ─── Stepping ─────────────────────────────────────────────

    pub fn can_step(&self, instance: &ProcessInstance) -> bool {
        self.executor.can_step(instance)
    }

    /// Load, advance by one step, persist. A no-op for instances that
    /// cannot step. Enqueues the follow-up job while more steps remain.
    pub async fn step_instance(
        &self,
        instance_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ProcessInstance, EngineError> {
        let mut instance = self
            .instance_store
            .get_by_id(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        if !self.executor.can_step(&instance) {
            return Ok(instance);
        }
        self.executor.step(&mut instance, cancel).await?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.instance_store.save(&mut instance).await?;
        self.enqueue_continuation(&instance).await?;
        Ok(instance)
    }

    /// Drive an instance in place until it completes, runs out of tokens,
    /// or `max_steps` is reached. No continuation jobs are enqueued; this
    /// is the embedded, single-caller driver.
    pub async fn run_to_completion(
        &self,
        instance_id: Uuid,
        max_steps: usize,
        cancel: &CancellationToken,
    ) -> Result<ProcessInstance, EngineError> {
        let mut instance = self
            .instance_store
            .get_by_id(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        let mut steps = 0;
        while self.executor.can_step(&instance) && steps < max_steps {
            self.executor.step(&mut instance, cancel).await?;
            self.instance_store.save(&mut instance).await?;
            steps += 1;
        }
        Ok(instance)
    }

    /// Run an instance of the latest definition for `key` with handler
    /// invocation suppressed. Token movement is identical to real
    /// execution; nothing is persisted.
    pub async fn simulate(
        &self,
        key: &str,
        variables: BTreeMap<String, Value>,
        max_steps: usize,
    ) -> Result<ProcessInstance, EngineError> {
        let definition = self
            .process_store
            .get_by_key(key)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))?;
        let cancel = CancellationToken::new();
        let mut instance = self.executor.start(&definition, variables, true);
        let mut steps = 0;
        while self.executor.can_step(&instance) && steps < max_steps {
            self.executor.step(&mut instance, &cancel).await?;
            steps += 1;
        }
        Ok(instance)
    }

    async fn enqueue_continuation(&self, instance: &ProcessInstance) -> Result<(), EngineError> {
        let Some(jobs) = &self.job_store else {
            return Ok(());
        };
        if !self.executor.can_step(instance) {
            return Ok(());
        }
        let mut job = Job::continue_instance(instance.id);
        jobs.enqueue(&mut job).await?;
        tracing::debug!(
            job_id = %job.id,
            instance_id = %instance.id,
            "enqueued continuation job"
        );
        Ok(())
    }

    // ─── Queries ──────────────────────────────────────────────

    pub async fn definition_by_key(
        &self,
        key: &str,
    ) -> Result<Option<ProcessDefinition>, EngineError> {
        self.process_store.get_by_key(key).await
    }

    pub async fn definitions(&self) -> Result<Vec<ProcessDefinition>, EngineError> {
        self.process_store.get_all().await
    }

    pub async fn instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, EngineError> {
        self.instance_store.get_by_id(id).await
    }

    pub async fn instances_by_key(
        &self,
        key: &str,
    ) -> Result<Vec<ProcessInstance>, EngineError> {
        self.instance_store.get_by_process_key(key).await
    }

    pub async fn history(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, EngineError> {
        match &self.history {
            Some(history) => history.list_for_instance(instance_id).await,
            None => Ok(Vec::new()),
        }
    }
}

fn content_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
