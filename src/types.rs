use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Elements ─────────────────────────────────────────────────

/// A node of the process graph, keyed by its XML `id`.
///
/// Sequence flows are not part of this enum — they are re-queried from the
/// definition's source text at step time so that document order is preserved
/// for branch selection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Element {
    StartEvent {
        id: String,
        name: Option<String>,
    },
    EndEvent {
        id: String,
        name: Option<String>,
    },
    ServiceTask {
        id: String,
        name: Option<String>,
        /// Handler type, read from `implementation` with `type` as fallback.
        implementation: Option<String>,
    },
    ScriptTask {
        id: String,
        name: Option<String>,
        script: Option<String>,
    },
    ExclusiveGateway {
        id: String,
        name: Option<String>,
        /// Flow id from the `default` attribute, taken when no condition fires.
        default_flow: Option<String>,
    },
    ParallelGateway {
        id: String,
        name: Option<String>,
    },
}

impl Element {
    pub fn id(&self) -> &str {
        match self {
            Element::StartEvent { id, .. }
            | Element::EndEvent { id, .. }
            | Element::ServiceTask { id, .. }
            | Element::ScriptTask { id, .. }
            | Element::ExclusiveGateway { id, .. }
            | Element::ParallelGateway { id, .. } => id,
        }
    }

    /// The BPMN local name, used as `element_type` in execution history.
    pub fn type_name(&self) -> &'static str {
        match self {
            Element::StartEvent { .. } => "startEvent",
            Element::EndEvent { .. } => "endEvent",
            Element::ServiceTask { .. } => "serviceTask",
            Element::ScriptTask { .. } => "scriptTask",
            Element::ExclusiveGateway { .. } => "exclusiveGateway",
            Element::ParallelGateway { .. } => "parallelGateway",
        }
    }

    pub fn is_start_event(&self) -> bool {
        matches!(self, Element::StartEvent { .. })
    }

    pub fn is_end_event(&self) -> bool {
        matches!(self, Element::EndEvent { .. })
    }

    pub fn is_parallel_gateway(&self) -> bool {
        matches!(self, Element::ParallelGateway { .. })
    }
}

/// A directed edge between two elements, in source-document order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
    /// Raw text of the nested `conditionExpression`, if present.
    pub condition: Option<String>,
}

// ─── Process definition ───────────────────────────────────────

/// An immutable, deployed process definition.
///
/// `id` is generated per deployment; `key` is the process id from the source
/// document and is shared across versions. The raw XML is retained so that
/// sequence flows can be re-parsed at step time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    /// Assigned by the process store on save, monotonically per key.
    pub version: i32,
    pub xml: String,
    /// Hex SHA-256 of the deployed XML.
    pub content_hash: String,
    pub is_latest: bool,
    pub created_at: DateTime<Utc>,
    /// Every identified element inside the `<process>` body.
    pub elements: BTreeMap<String, Element>,
}

impl ProcessDefinition {
    pub fn start_event_ids(&self) -> Vec<&str> {
        self.elements
            .values()
            .filter(|e| e.is_start_event())
            .map(|e| e.id())
            .collect()
    }
}

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "Running",
            InstanceStatus::Completed => "Completed",
            InstanceStatus::Cancelled => "Cancelled",
            InstanceStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(InstanceStatus::Running),
            "Completed" => Some(InstanceStatus::Completed),
            "Cancelled" => Some(InstanceStatus::Cancelled),
            "Failed" => Some(InstanceStatus::Failed),
            _ => None,
        }
    }
}

/// A single run of a process definition.
///
/// The only mutable object per step: `variables`, `active_tokens`,
/// `join_arrivals` and `status` are rewritten by the executor; everything
/// else is fixed at start. Tokens have no identity beyond their position, so
/// the active set is a plain set of element ids.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub process_definition_id: Uuid,
    pub process_key: String,
    pub status: InstanceStatus,
    pub variables: BTreeMap<String, Value>,
    /// Element ids currently holding a token.
    pub active_tokens: BTreeSet<String>,
    /// Parallel-join element id → branches arrived so far. Never negative.
    pub join_arrivals: BTreeMap<String, u32>,
    /// When set, task behavior is suppressed while token movement proceeds
    /// normally. Immutable after start.
    pub simulation: bool,
    /// Optimistic-concurrency version; bumped by the store on every save.
    pub concurrency_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessInstance {
    /// Completion is sticky: once set, `can_step` stays false.
    pub fn is_completed(&self) -> bool {
        self.status == InstanceStatus::Completed
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    // Typed accessors return the type's default on absence or mismatch,
    // never an error. Callers rely on this.

    pub fn var_i64(&self, name: &str) -> i64 {
        self.variables
            .get(name)
            .and_then(Value::as_i64)
            .unwrap_or_default()
    }

    pub fn var_f64(&self, name: &str) -> f64 {
        self.variables
            .get(name)
            .and_then(Value::as_f64)
            .unwrap_or_default()
    }

    pub fn var_bool(&self, name: &str) -> bool {
        self.variables
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or_default()
    }

    pub fn var_str(&self, name: &str) -> String {
        self.variables
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default()
    }
}

// ─── Jobs ─────────────────────────────────────────────────────

/// Job type for "this instance has more steps to perform".
pub const JOB_TYPE_CONTINUE_INSTANCE: &str = "continue-instance";

/// A unit of deferred work coordinated through the job store.
///
/// Lifecycle: enqueue → claim (lease) → complete/delete, or lease expiry →
/// re-claim with an incremented `attempt`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub process_instance_id: Uuid,
    /// Earliest execution instant; `None` means eligible immediately.
    pub run_at: Option<DateTime<Utc>>,
    /// Worker currently holding the lease.
    pub owner_id: Option<String>,
    /// Lease expiry; a job past this instant is claimable again.
    pub locked_until: Option<DateTime<Utc>>,
    pub attempt: i32,
    /// Bumped on every persisted update to detect lost claims.
    pub concurrency_token: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_type: impl Into<String>, process_instance_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: job_type.into(),
            process_instance_id,
            run_at: None,
            owner_id: None,
            locked_until: None,
            attempt: 0,
            concurrency_token: Uuid::now_v7(),
            created_at: Utc::now(),
        }
    }

    pub fn continue_instance(process_instance_id: Uuid) -> Self {
        Self::new(JOB_TYPE_CONTINUE_INSTANCE, process_instance_id)
    }
}

// ─── Execution history ────────────────────────────────────────

/// Append-only record of one element execution within a step.
///
/// `sequence` is assigned by the history store, monotonically per instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub process_definition_id: Uuid,
    /// Denormalized for grouping in analytics queries.
    pub process_key: String,
    pub element_id: String,
    pub element_type: String,
    pub sequence: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: String,
    pub error: Option<String>,
}

impl StepExecutionRecord {
    pub fn begin(instance: &ProcessInstance, element_id: &str, element_type: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            process_instance_id: instance.id,
            process_definition_id: instance.process_definition_id,
            process_key: instance.process_key.clone(),
            element_id: element_id.to_string(),
            element_type: element_type.to_string(),
            sequence: 0,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            status: "Running".to_string(),
            error: None,
        }
    }

    /// Close the record, deriving `duration_ms` from the two timestamps.
    pub fn finish(&mut self, status: &str, error: Option<String>) {
        let ended = Utc::now();
        self.duration_ms = Some((ended - self.started_at).num_milliseconds());
        self.ended_at = Some(ended);
        self.status = status.to_string();
        self.error = error;
    }
}

// ─── Task context ─────────────────────────────────────────────

/// What a task handler sees: the instance's variables and its own position.
///
/// Handlers get no access to the token set or join counters, so they cannot
/// interfere with routing.
pub struct TaskContext<'a> {
    pub instance_id: Uuid,
    pub element_id: &'a str,
    pub variables: &'a mut BTreeMap<String, Value>,
}

impl TaskContext<'_> {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_instance() -> ProcessInstance {
        ProcessInstance {
            id: Uuid::now_v7(),
            process_definition_id: Uuid::now_v7(),
            process_key: "order".to_string(),
            status: InstanceStatus::Running,
            variables: BTreeMap::from([
                ("amount".to_string(), json!(150)),
                ("rate".to_string(), json!(0.25)),
                ("approved".to_string(), json!(true)),
                ("customer".to_string(), json!("acme")),
            ]),
            active_tokens: BTreeSet::new(),
            join_arrivals: BTreeMap::new(),
            simulation: false,
            concurrency_token: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn typed_accessors_return_values() {
        let inst = make_instance();
        assert_eq!(inst.var_i64("amount"), 150);
        assert_eq!(inst.var_f64("rate"), 0.25);
        assert!(inst.var_bool("approved"));
        assert_eq!(inst.var_str("customer"), "acme");
    }

    #[test]
    fn typed_accessors_default_on_mismatch() {
        let inst = make_instance();
        // wrong type
        assert_eq!(inst.var_i64("customer"), 0);
        assert!(!inst.var_bool("amount"));
        assert_eq!(inst.var_str("amount"), "");
        // missing
        assert_eq!(inst.var_f64("missing"), 0.0);
    }

    #[test]
    fn status_round_trip() {
        for status in [
            InstanceStatus::Running,
            InstanceStatus::Completed,
            InstanceStatus::Cancelled,
            InstanceStatus::Failed,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InstanceStatus::parse("Paused"), None);
    }

    #[test]
    fn record_finish_derives_duration() {
        let inst = make_instance();
        let mut record = StepExecutionRecord::begin(&inst, "task1", "serviceTask");
        record.finish("Completed", None);
        assert!(record.ended_at.is_some());
        assert!(record.duration_ms.is_some());
        assert_eq!(record.status, "Completed");
    }
}
