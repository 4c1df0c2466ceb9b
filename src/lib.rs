//! flowlite — an embeddable execution engine for a restricted BPMN subset.
//!
//! The engine parses a process graph (events, tasks, gateways, sequence
//! flows) out of standard BPMN XML, places tokens on the start events and
//! advances them one atomic step at a time: service tasks invoke registered
//! handlers, exclusive gateways pick the first matching condition in
//! document order, parallel gateways fork and join with arrival counters.
//! Per-element execution history is recorded for analytics.
//!
//! Durable multi-worker execution rides on the job store: every instance
//! with steps remaining has a `continue-instance` job in the queue, workers
//! claim jobs under a time-bounded lease, and lease expiry is the recovery
//! path for crashed workers. Optimistic concurrency tokens on instances and
//! jobs keep stale writers from clobbering fresh state.
//!
//! ```no_run
//! # async fn demo() -> Result<(), flowlite::EngineError> {
//! use flowlite::ProcessEngine;
//! use std::collections::BTreeMap;
//! use tokio_util::sync::CancellationToken;
//!
//! let engine = ProcessEngine::in_memory();
//! let definition = engine.deploy(r#"<definitions>
//!   <process id="hello">
//!     <startEvent id="start"/>
//!     <serviceTask id="greet" implementation="greeter"/>
//!     <endEvent id="end"/>
//!     <sequenceFlow id="f1" sourceRef="start" targetRef="greet"/>
//!     <sequenceFlow id="f2" sourceRef="greet" targetRef="end"/>
//!   </process>
//! </definitions>"#).await?;
//!
//! let instance = engine.start(definition.id, BTreeMap::new()).await?;
//! let cancel = CancellationToken::new();
//! let done = engine.run_to_completion(instance.id, 100, &cancel).await?;
//! assert!(done.is_completed());
//! # Ok(())
//! # }
//! ```

pub mod conditions;
pub mod engine;
pub mod error;
pub mod executor;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod types;
pub mod worker;
pub mod xml;

pub use engine::ProcessEngine;
pub use error::EngineError;
pub use executor::{Executor, HandlerRegistry, TaskHandler};
pub use store::{HistoryStore, InstanceStore, JobStore, ProcessStore};
pub use store_memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
pub use types::{
    Element, InstanceStatus, Job, ProcessDefinition, ProcessInstance, SequenceFlow,
    StepExecutionRecord, TaskContext, JOB_TYPE_CONTINUE_INSTANCE,
};
pub use worker::{JobWorker, WorkerOptions};
