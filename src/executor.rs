//! The token executor: `start`, `can_step`, and the atomic `step`.
//!
//! One step advances every active token by exactly one semantic move. The
//! token set being iterated is snapshotted first; the new token set and the
//! join counters are committed only after the whole snapshot has been
//! processed, so a failing handler leaves the instance's routing state
//! untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conditions;
use crate::error::EngineError;
use crate::store::{HistoryStore, ProcessStore};
use crate::types::{
    Element, InstanceStatus, ProcessDefinition, ProcessInstance, StepExecutionRecord, TaskContext,
};
use crate::xml::{self, ParsedProcess};

// ─── Handlers ─────────────────────────────────────────────────

/// User-supplied behavior for a service task.
///
/// Handlers may read and write instance variables through the context; they
/// cannot touch token routing. Errors propagate out of `step` before the
/// new token set is committed.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: TaskContext<'_>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Handlers keyed by their declared task type, matched case-insensitively.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .write()
            .insert(task_type.to_ascii_lowercase(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .get(&task_type.to_ascii_lowercase())
            .cloned()
    }
}

// ─── Executor ─────────────────────────────────────────────────

pub struct Executor {
    process_store: Arc<dyn ProcessStore>,
    handlers: Arc<HandlerRegistry>,
    history: Option<Arc<dyn HistoryStore>>,
}

impl Executor {
    pub fn new(process_store: Arc<dyn ProcessStore>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            process_store,
            handlers,
            history: None,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Create a new instance with one token on every start event.
    /// Pure construction: nothing is persisted and nothing blocks.
    pub fn start(
        &self,
        definition: &ProcessDefinition,
        variables: BTreeMap<String, Value>,
        simulation: bool,
    ) -> ProcessInstance {
        let now = Utc::now();
        let active_tokens: BTreeSet<String> = definition
            .start_event_ids()
            .into_iter()
            .map(str::to_string)
            .collect();

        ProcessInstance {
            id: Uuid::now_v7(),
            process_definition_id: definition.id,
            process_key: definition.key.clone(),
            status: InstanceStatus::Running,
            variables,
            active_tokens,
            join_arrivals: BTreeMap::new(),
            simulation,
            concurrency_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_step(&self, instance: &ProcessInstance) -> bool {
        !instance.is_completed() && !instance.active_tokens.is_empty()
    }

    /// Advance every active token by one semantic move.
    ///
    /// A no-op when the instance cannot step. The definition is reloaded by
    /// id and its source re-parsed, so sequence flows are always read in
    /// document order.
    pub async fn step(
        &self,
        instance: &mut ProcessInstance,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if !self.can_step(instance) {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let definition = self
            .process_store
            .get_by_id(instance.process_definition_id)
            .await?
            .ok_or_else(|| {
                EngineError::DefinitionNotFound(instance.process_definition_id.to_string())
            })?;
        let parsed = xml::parse_process(&definition.xml)?;

        // Snapshot: the set under modification must not be observed while
        // iterating. BTreeSet order makes processing deterministic.
        let snapshot: Vec<String> = instance.active_tokens.iter().cloned().collect();
        let mut next_tokens: BTreeSet<String> = BTreeSet::new();
        let mut joins = instance.join_arrivals.clone();

        for token in &snapshot {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let Some(element) = parsed.element(token) else {
                tracing::warn!(
                    instance_id = %instance.id,
                    element_id = %token,
                    "token rests on an element missing from the definition, dropping"
                );
                continue;
            };

            let mut record = self
                .recording(instance)
                .then(|| StepExecutionRecord::begin(instance, token, element.type_name()));

            // End events consume the token outright.
            if element.is_end_event() {
                self.close_record(record.take(), "Completed", None).await?;
                continue;
            }

            if !instance.simulation {
                if let Err(err) = self.run_task_behavior(instance, token, element, cancel).await {
                    self.close_record(record.take(), "Failed", Some(err.to_string()))
                        .await?;
                    return Err(err);
                }
            }

            let outgoing = parsed.outgoing(token);
            let mut moved = true;

            if outgoing.is_empty() {
                // Dead end: the token is consumed without successors.
            } else {
                match element {
                    Element::ExclusiveGateway { default_flow, .. } => {
                        let chosen = outgoing
                            .iter()
                            .find(|f| {
                                f.condition
                                    .as_deref()
                                    .is_some_and(|c| conditions::evaluate(c, &instance.variables))
                            })
                            .or_else(|| {
                                default_flow
                                    .as_deref()
                                    .and_then(|d| outgoing.iter().find(|f| f.id == d))
                            });
                        if let Some(flow) = chosen {
                            emit(&parsed, &mut joins, &mut next_tokens, &flow.target_ref);
                        }
                    }
                    Element::ParallelGateway { .. } => {
                        let inbound = parsed.incoming_count(token);
                        if outgoing.len() > 1 && inbound <= 1 {
                            // Fork: one successor per outgoing flow.
                            for flow in &outgoing {
                                emit(&parsed, &mut joins, &mut next_tokens, &flow.target_ref);
                            }
                        } else if inbound > 1 {
                            // Join: fire only once every inbound branch has arrived.
                            let arrived = joins.get(token).copied().unwrap_or(0);
                            if arrived >= inbound as u32 {
                                joins.insert(token.clone(), arrived - inbound as u32);
                                for flow in &outgoing {
                                    emit(&parsed, &mut joins, &mut next_tokens, &flow.target_ref);
                                }
                            } else {
                                next_tokens.insert(token.clone());
                                moved = false;
                            }
                        } else {
                            for flow in &outgoing {
                                emit(&parsed, &mut joins, &mut next_tokens, &flow.target_ref);
                            }
                        }
                    }
                    _ => {
                        for flow in &outgoing {
                            emit(&parsed, &mut joins, &mut next_tokens, &flow.target_ref);
                        }
                    }
                }
            }

            if moved {
                self.close_record(record.take(), "Completed", None).await?;
            }
        }

        // Commit: token set and join counters are replaced together.
        instance.active_tokens = next_tokens;
        instance.join_arrivals = joins;

        let finished = instance.active_tokens.is_empty()
            || instance
                .active_tokens
                .iter()
                .all(|t| parsed.element(t).is_some_and(Element::is_end_event));
        if finished && instance.status == InstanceStatus::Running {
            instance.status = InstanceStatus::Completed;
            tracing::info!(
                instance_id = %instance.id,
                process_key = %instance.process_key,
                "process instance completed"
            );
        }
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn run_task_behavior(
        &self,
        instance: &mut ProcessInstance,
        token: &str,
        element: &Element,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let Element::ServiceTask { implementation, .. } = element else {
            // Script tasks and non-end events carry no engine-side behavior.
            return Ok(());
        };
        let Some(task_type) = implementation.as_deref() else {
            return Ok(());
        };
        let Some(handler) = self.handlers.get(task_type) else {
            tracing::debug!(
                instance_id = %instance.id,
                element_id = %token,
                task_type = %task_type,
                "no handler registered for service task, continuing"
            );
            return Ok(());
        };

        let ctx = TaskContext {
            instance_id: instance.id,
            element_id: token,
            variables: &mut instance.variables,
        };
        handler
            .execute(ctx, cancel)
            .await
            .map_err(|source| EngineError::Handler {
                element_id: token.to_string(),
                source,
            })
    }

    fn recording(&self, instance: &ProcessInstance) -> bool {
        self.history.is_some() && !instance.simulation
    }

    async fn close_record(
        &self,
        record: Option<StepExecutionRecord>,
        status: &str,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        if let (Some(mut record), Some(history)) = (record, self.history.as_ref()) {
            record.finish(status, error);
            history.append(&mut record).await?;
        }
        Ok(())
    }
}

/// Register a successor token. An arriving branch is counted against a
/// parallel join at emission time, so the join sees `arrived == inbound`
/// exactly when every expected branch has reached it.
fn emit(
    parsed: &ParsedProcess,
    joins: &mut BTreeMap<String, u32>,
    next: &mut BTreeSet<String>,
    target: &str,
) {
    if let Some(element) = parsed.element(target) {
        if element.is_parallel_gateway() && parsed.incoming_count(target) > 1 {
            *joins.entry(target.to_string()).or_insert(0) += 1;
        }
    }
    next.insert(target.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LINEAR_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="linear" isExecutable="true">
    <bpmn:startEvent id="start" />
    <bpmn:serviceTask id="task" implementation="X" />
    <bpmn:endEvent id="end" />
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="task" />
    <bpmn:sequenceFlow id="f2" sourceRef="task" targetRef="end" />
  </bpmn:process>
</bpmn:definitions>"#;

    const GATEWAY_DEFAULT_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="routed" isExecutable="true">
    <bpmn:startEvent id="start" />
    <bpmn:exclusiveGateway id="gw" default="fLow" />
    <bpmn:endEvent id="endHigh" />
    <bpmn:endEvent id="endLow" />
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="gw" />
    <bpmn:sequenceFlow id="fHigh" sourceRef="gw" targetRef="endHigh">
      <bpmn:conditionExpression>${amount &gt; 100}</bpmn:conditionExpression>
    </bpmn:sequenceFlow>
    <bpmn:sequenceFlow id="fLow" sourceRef="gw" targetRef="endLow" />
  </bpmn:process>
</bpmn:definitions>"#;

    const GATEWAY_FIRST_TRUE_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="ordered" isExecutable="true">
    <bpmn:startEvent id="start" />
    <bpmn:exclusiveGateway id="gw" />
    <bpmn:endEvent id="endA" />
    <bpmn:endEvent id="endB" />
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="gw" />
    <bpmn:sequenceFlow id="fA" sourceRef="gw" targetRef="endA">
      <bpmn:conditionExpression>${amount &gt;= 200}</bpmn:conditionExpression>
    </bpmn:sequenceFlow>
    <bpmn:sequenceFlow id="fB" sourceRef="gw" targetRef="endB">
      <bpmn:conditionExpression>${amount &lt; 200}</bpmn:conditionExpression>
    </bpmn:sequenceFlow>
  </bpmn:process>
</bpmn:definitions>"#;

    const PARALLEL_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="parallel" isExecutable="true">
    <bpmn:startEvent id="start" />
    <bpmn:parallelGateway id="gwSplit" />
    <bpmn:serviceTask id="taskA" implementation="A" />
    <bpmn:serviceTask id="taskB" implementation="B" />
    <bpmn:parallelGateway id="gwJoin" />
    <bpmn:endEvent id="end" />
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="gwSplit" />
    <bpmn:sequenceFlow id="f2" sourceRef="gwSplit" targetRef="taskA" />
    <bpmn:sequenceFlow id="f3" sourceRef="gwSplit" targetRef="taskB" />
    <bpmn:sequenceFlow id="f4" sourceRef="taskA" targetRef="gwJoin" />
    <bpmn:sequenceFlow id="f5" sourceRef="taskB" targetRef="gwJoin" />
    <bpmn:sequenceFlow id="f6" sourceRef="gwJoin" targetRef="end" />
  </bpmn:process>
</bpmn:definitions>"#;

    const DEAD_END_BPMN: &str = r#"<definitions>
  <process id="deadend">
    <startEvent id="start"/>
    <serviceTask id="task" implementation="X"/>
    <sequenceFlow id="f1" sourceRef="start" targetRef="task"/>
  </process>
</definitions>"#;

    struct CountingHandler {
        invocations: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                invocations: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn execute(
            &self,
            _ctx: TaskContext<'_>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct VariableWritingHandler {
        name: &'static str,
        value: Value,
    }

    #[async_trait]
    impl TaskHandler for VariableWritingHandler {
        async fn execute(
            &self,
            mut ctx: TaskContext<'_>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            ctx.set(self.name, self.value.clone());
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn execute(
            &self,
            _ctx: TaskContext<'_>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            anyhow::bail!("downstream service unavailable")
        }
    }

    async fn deploy(store: &Arc<MemoryStore>, source: &str) -> ProcessDefinition {
        let parsed = xml::parse_process(source).unwrap();
        let mut definition = ProcessDefinition {
            id: Uuid::now_v7(),
            key: parsed.process_id.clone(),
            name: parsed.process_id.clone(),
            version: 0,
            xml: source.to_string(),
            content_hash: String::new(),
            is_latest: false,
            created_at: Utc::now(),
            elements: parsed.elements,
        };
        ProcessStore::save(store.as_ref(), &mut definition)
            .await
            .unwrap();
        definition
    }

    fn executor_with(store: &Arc<MemoryStore>) -> (Executor, Arc<HandlerRegistry>) {
        let handlers = Arc::new(HandlerRegistry::new());
        let executor = Executor::new(store.clone() as Arc<dyn ProcessStore>, handlers.clone());
        (executor, handlers)
    }

    async fn drive(executor: &Executor, instance: &mut ProcessInstance) -> usize {
        let cancel = CancellationToken::new();
        let mut steps = 0;
        while executor.can_step(instance) {
            executor.step(instance, &cancel).await.unwrap();
            steps += 1;
            assert!(steps < 100, "process did not terminate");
        }
        steps
    }

    fn tokens(instance: &ProcessInstance) -> Vec<&str> {
        instance.active_tokens.iter().map(String::as_str).collect()
    }

    #[tokio::test]
    async fn linear_process_invokes_handler_once_and_completes() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, LINEAR_BPMN).await;
        let (executor, handlers) = executor_with(&store);
        let handler = CountingHandler::new();
        handlers.register("X", handler.clone());

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        assert_eq!(tokens(&instance), vec!["start"]);
        assert!(!instance.is_completed());

        drive(&executor, &mut instance).await;

        assert_eq!(handler.count(), 1);
        assert_eq!(tokens(&instance), vec!["end"]);
        assert!(instance.is_completed());
    }

    #[tokio::test]
    async fn exclusive_gateway_takes_conditional_branch() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, GATEWAY_DEFAULT_BPMN).await;
        let (executor, _) = executor_with(&store);
        let cancel = CancellationToken::new();

        let vars = BTreeMap::from([("amount".to_string(), json!(150))]);
        let mut instance = executor.start(&definition, vars, false);
        executor.step(&mut instance, &cancel).await.unwrap();
        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(tokens(&instance), vec!["endHigh"]);
    }

    #[tokio::test]
    async fn exclusive_gateway_falls_back_to_default() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, GATEWAY_DEFAULT_BPMN).await;
        let (executor, _) = executor_with(&store);
        let cancel = CancellationToken::new();

        let vars = BTreeMap::from([("amount".to_string(), json!(50))]);
        let mut instance = executor.start(&definition, vars, false);
        executor.step(&mut instance, &cancel).await.unwrap();
        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(tokens(&instance), vec!["endLow"]);
    }

    #[tokio::test]
    async fn exclusive_gateway_first_true_wins_in_document_order() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, GATEWAY_FIRST_TRUE_BPMN).await;
        let (executor, _) = executor_with(&store);
        let cancel = CancellationToken::new();

        let vars = BTreeMap::from([("amount".to_string(), json!(250))]);
        let mut instance = executor.start(&definition, vars, false);
        executor.step(&mut instance, &cancel).await.unwrap();
        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(tokens(&instance), vec!["endA"]);

        let vars = BTreeMap::from([("amount".to_string(), json!(120))]);
        let mut instance = executor.start(&definition, vars, false);
        executor.step(&mut instance, &cancel).await.unwrap();
        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(tokens(&instance), vec!["endB"]);
    }

    #[tokio::test]
    async fn exclusive_gateway_without_match_or_default_consumes_token() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, GATEWAY_FIRST_TRUE_BPMN).await;
        let (executor, _) = executor_with(&store);
        let cancel = CancellationToken::new();

        // no `amount` variable: both conditions are false, no default
        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(tokens(&instance), vec!["gw"]);
        executor.step(&mut instance, &cancel).await.unwrap();
        assert!(instance.active_tokens.is_empty());
        assert!(instance.is_completed());
    }

    #[tokio::test]
    async fn parallel_fork_and_join_step_by_step() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, PARALLEL_BPMN).await;
        let (executor, handlers) = executor_with(&store);
        let handler_a = CountingHandler::new();
        let handler_b = CountingHandler::new();
        handlers.register("A", handler_a.clone());
        handlers.register("B", handler_b.clone());
        let cancel = CancellationToken::new();

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        assert_eq!(tokens(&instance), vec!["start"]);

        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(tokens(&instance), vec!["gwSplit"]);

        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(tokens(&instance), vec!["taskA", "taskB"]);

        // Both branches arrive at the join on the same tick; it fires on the
        // next step, not this one.
        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(tokens(&instance), vec!["gwJoin"]);
        assert_eq!(instance.join_arrivals.get("gwJoin"), Some(&2));
        assert_eq!(handler_a.count(), 1);
        assert_eq!(handler_b.count(), 1);

        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(tokens(&instance), vec!["end"]);
        assert_eq!(instance.join_arrivals.get("gwJoin"), Some(&0));
        assert!(instance.is_completed());

        // every remaining token is a defined element
        for token in &instance.active_tokens {
            assert!(definition.elements.contains_key(token));
        }
    }

    #[tokio::test]
    async fn simulation_moves_tokens_without_invoking_handlers() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, PARALLEL_BPMN).await;
        let (executor, handlers) = executor_with(&store);
        let handler_a = CountingHandler::new();
        let handler_b = CountingHandler::new();
        handlers.register("A", handler_a.clone());
        handlers.register("B", handler_b.clone());

        let mut instance = executor.start(&definition, BTreeMap::new(), true);
        drive(&executor, &mut instance).await;

        assert!(instance.is_completed());
        assert_eq!(tokens(&instance), vec!["end"]);
        assert_eq!(handler_a.count(), 0);
        assert_eq!(handler_b.count(), 0);
    }

    #[tokio::test]
    async fn dead_end_consumes_token_and_completes() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, DEAD_END_BPMN).await;
        let (executor, handlers) = executor_with(&store);
        let handler = CountingHandler::new();
        handlers.register("X", handler.clone());

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        drive(&executor, &mut instance).await;

        assert_eq!(handler.count(), 1);
        assert!(instance.active_tokens.is_empty());
        assert!(instance.is_completed());
    }

    #[tokio::test]
    async fn missing_handler_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, LINEAR_BPMN).await;
        let (executor, _) = executor_with(&store);

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        drive(&executor, &mut instance).await;
        assert!(instance.is_completed());
    }

    #[tokio::test]
    async fn handler_lookup_is_case_insensitive() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, LINEAR_BPMN).await;
        let (executor, handlers) = executor_with(&store);
        let handler = CountingHandler::new();
        handlers.register("x", handler.clone());

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        drive(&executor, &mut instance).await;
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn failing_handler_leaves_routing_state_uncommitted() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, LINEAR_BPMN).await;
        let (executor, handlers) = executor_with(&store);
        handlers.register("X", Arc::new(FailingHandler));
        let cancel = CancellationToken::new();

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(tokens(&instance), vec!["task"]);

        let err = executor.step(&mut instance, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Handler { ref element_id, .. } if element_id == "task"));
        assert_eq!(tokens(&instance), vec!["task"]);
        assert_eq!(instance.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn variables_written_in_one_step_route_the_next() {
        let store = Arc::new(MemoryStore::new());
        let source = r#"<definitions>
          <process id="writes">
            <startEvent id="start"/>
            <serviceTask id="score" implementation="scorer"/>
            <exclusiveGateway id="gw" default="fLow"/>
            <endEvent id="endHigh"/>
            <endEvent id="endLow"/>
            <sequenceFlow id="f1" sourceRef="start" targetRef="score"/>
            <sequenceFlow id="f2" sourceRef="score" targetRef="gw"/>
            <sequenceFlow id="fHigh" sourceRef="gw" targetRef="endHigh">
              <conditionExpression>${amount &gt; 100}</conditionExpression>
            </sequenceFlow>
            <sequenceFlow id="fLow" sourceRef="gw" targetRef="endLow"/>
          </process>
        </definitions>"#;
        let definition = deploy(&store, source).await;
        let (executor, handlers) = executor_with(&store);
        handlers.register(
            "scorer",
            Arc::new(VariableWritingHandler {
                name: "amount",
                value: json!(150),
            }),
        );

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        drive(&executor, &mut instance).await;
        assert_eq!(tokens(&instance), vec!["endHigh"]);
    }

    #[tokio::test]
    async fn step_after_completion_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, LINEAR_BPMN).await;
        let (executor, _) = executor_with(&store);
        let cancel = CancellationToken::new();

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        drive(&executor, &mut instance).await;
        assert!(instance.is_completed());
        assert!(!executor.can_step(&instance));

        let before = instance.clone();
        executor.step(&mut instance, &cancel).await.unwrap();
        assert_eq!(instance.active_tokens, before.active_tokens);
        assert_eq!(instance.status, before.status);
    }

    #[tokio::test]
    async fn token_on_unknown_element_disappears() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, LINEAR_BPMN).await;
        let (executor, _) = executor_with(&store);
        let cancel = CancellationToken::new();

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        instance.active_tokens.insert("ghost".to_string());

        executor.step(&mut instance, &cancel).await.unwrap();
        assert!(!instance.active_tokens.contains("ghost"));
        assert_eq!(tokens(&instance), vec!["task"]);
    }

    #[tokio::test]
    async fn missing_definition_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, LINEAR_BPMN).await;
        let (executor, _) = executor_with(&store);
        let cancel = CancellationToken::new();

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        instance.process_definition_id = Uuid::now_v7();

        let err = executor.step(&mut instance, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn cancellation_is_honored_before_processing() {
        let store = Arc::new(MemoryStore::new());
        let definition = deploy(&store, LINEAR_BPMN).await;
        let (executor, _) = executor_with(&store);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut instance = executor.start(&definition, BTreeMap::new(), false);
        let err = executor.step(&mut instance, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(tokens(&instance), vec!["start"]);
    }
}
