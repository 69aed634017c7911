//! Component H — the workflow DAG execution engine: per-run
//! `reconcile`, per-node-type handlers, and the run store that gives
//! each run its own serialized lock.
//!
//! Grounded on `tandem-orchestrator`'s reducer shape (read a state,
//! compute the next state, never let two writers race the same row)
//! generalized from one fixed approval-gate sequence into dispatch
//! keyed by `node.type`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use motif_expr::Context as ExprContext;
use motif_graph::{Graph, GraphEdge, StartMode};
use motif_observability::{emit_event, ObservabilityEvent, ProcessKind};
use motif_tasks::TaskEngine;
use motif_types::{
    EngineError, EngineResult, NodeOutput, NodeState, NodeStatus, NodeType, ResourceKind,
    RunExecMode, RunStatus, TaskInput, TaskStatus, Workflow, WorkflowEdge, WorkflowId,
    WorkflowNode, WorkflowRun, WorkflowRunId,
};

const COMPONENT: &str = "workflow_engine";

/// Static workflow definitions, keyed by id. Separate from
/// `WorkflowRunStore`: definitions are immutable once created and
/// shared read-only across every run, so a plain `RwLock<HashMap>` is
/// enough — no per-row lock needed.
pub struct WorkflowStore {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Validates `workflow` before it ever becomes visible to a run:
    /// every edge endpoint must reference a declared node, and the
    /// graph they form must be acyclic. Rejecting both here means
    /// `reconcile` never has to handle either case.
    pub async fn create(&self, workflow: Workflow) -> EngineResult<Workflow> {
        let node_ids: std::collections::HashSet<&str> =
            workflow.nodes.iter().map(|n| n.id.as_str()).collect();
        for edge in &workflow.edges {
            if !node_ids.contains(edge.source.as_str()) {
                return Err(EngineError::InvalidInput(format!(
                    "edge {} references unknown source node {}",
                    edge.id, edge.source
                )));
            }
            if !node_ids.contains(edge.target.as_str()) {
                return Err(EngineError::InvalidInput(format!(
                    "edge {} references unknown target node {}",
                    edge.id, edge.target
                )));
            }
        }

        WorkflowEngine::build_graph(&workflow)
            .validate_acyclic()
            .map_err(|_| EngineError::InvalidInput(format!("workflow {} contains a cycle", workflow.id)))?;

        self.workflows.write().await.insert(workflow.id.clone(), workflow.clone());
        Ok(workflow)
    }

    pub async fn get(&self, workflow_id: &WorkflowId) -> EngineResult<Workflow> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("workflow {workflow_id}")))
    }
}

impl Default for WorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Signal {
    Continue,
    Suspend,
    Fail(String),
}

/// Holds one `tokio::sync::Mutex` per run so concurrent scheduler
/// workers never advance the same run at once, while different runs
/// proceed fully in parallel — the same per-key lock idea
/// `motif-ledger` uses for accounts.
pub struct WorkflowRunStore {
    runs: RwLock<HashMap<WorkflowRunId, Arc<Mutex<WorkflowRun>>>>,
}

impl WorkflowRunStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, run: WorkflowRun) {
        self.runs.write().await.insert(run.id.clone(), Arc::new(Mutex::new(run)));
    }

    pub async fn get(&self, run_id: &WorkflowRunId) -> EngineResult<WorkflowRun> {
        let handle = self
            .runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("workflow run {run_id}")))?;
        Ok(handle.lock().await.clone())
    }

    pub async fn running_ids(&self) -> Vec<WorkflowRunId> {
        let mut ids = Vec::new();
        for (id, handle) in self.runs.read().await.iter() {
            if handle.lock().await.status == RunStatus::Running {
                ids.push(id.clone());
            }
        }
        ids
    }

    async fn lock_handle(&self, run_id: &WorkflowRunId) -> EngineResult<Arc<Mutex<WorkflowRun>>> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("workflow run {run_id}")))
    }

    /// Locks the run for the duration of one `reconcile` step so two
    /// scheduler workers can never advance the same run concurrently,
    /// while unrelated runs proceed under their own locks.
    pub async fn reconcile_one(
        &self,
        run_id: &WorkflowRunId,
        engine: &WorkflowEngine,
        workflow: &Workflow,
    ) -> EngineResult<WorkflowRun> {
        let handle = self.lock_handle(run_id).await?;
        let mut run = handle.lock().await;
        engine.reconcile(workflow, &mut run).await?;
        Ok(run.clone())
    }
}

impl Default for WorkflowRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct EndConfig {
    #[serde(default)]
    outputs: Vec<OutputSpec>,
}

#[derive(Deserialize)]
struct OutputSpec {
    name: String,
    source: String,
}

#[derive(Deserialize)]
struct VariableSetConfig {
    #[serde(default)]
    assignments: Vec<Assignment>,
}

#[derive(Deserialize)]
struct Assignment {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct DelayConfig {
    delay_seconds: u64,
}

#[derive(Deserialize)]
struct TaskNodeConfig {
    #[serde(default)]
    inputs: Vec<TaskNodeInput>,
    #[serde(default)]
    task_config: Value,
    #[serde(default)]
    estimated_usage: f64,
}

#[derive(Deserialize)]
struct TaskNodeInput {
    kind: ResourceKind,
    source: String,
    filename: String,
}

pub struct WorkflowEngine {
    task_engine: Arc<TaskEngine>,
}

impl WorkflowEngine {
    pub fn new(task_engine: Arc<TaskEngine>) -> Self {
        Self { task_engine }
    }

    fn build_graph(workflow: &Workflow) -> Graph {
        let node_ids = workflow.nodes.iter().map(|n| n.id.to_string()).collect();
        let edges = workflow
            .edges
            .iter()
            .map(|e: &WorkflowEdge| GraphEdge {
                id: e.id.clone(),
                source: e.source.to_string(),
                target: e.target.to_string(),
                is_conditional: e.condition.is_some(),
            })
            .collect();
        Graph::new(node_ids, edges)
    }

    fn expr_context(run: &WorkflowRun) -> ExprContext {
        let mut ctx = ExprContext::new();
        ctx.variables = run.runtime_variables.clone();
        for (node_id, state) in &run.node_states {
            if let Some(output) = &state.output {
                ctx.node_outputs.insert(
                    node_id.clone(),
                    serde_json::json!({ "output": output }),
                );
            }
        }
        ctx
    }

    /// Idempotent, safe to call repeatedly: re-running `reconcile` on a
    /// run that made no progress since the last call is a no-op.
    #[instrument(skip(self, workflow, run), fields(run_id = %run.id))]
    pub async fn reconcile(&self, workflow: &Workflow, run: &mut WorkflowRun) -> EngineResult<()> {
        if run.status != RunStatus::Running {
            return Ok(());
        }

        let graph = Self::build_graph(workflow);
        let starts = match run.exec_mode {
            RunExecMode::All => graph.execution_starts(StartMode::All, &[]),
            RunExecMode::SpecifiedStarts => graph.execution_starts(
                StartMode::SpecifiedStarts,
                &run.start_node_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            ),
            RunExecMode::IsolatedNodes => graph.execution_starts(StartMode::IsolatedNodes, &[]),
        };
        let reachable = graph.reachable_from(&starts);

        let nodes_by_id: HashMap<String, &WorkflowNode> =
            workflow.nodes.iter().map(|n| (n.id.to_string(), n)).collect();

        let mut newly_completed = Vec::new();

        for node_id in graph.node_ids() {
            if !reachable.contains(node_id) {
                continue;
            }
            let state = run.node_state(&motif_types::NodeId::from(node_id.as_str()));
            if !matches!(state.status, NodeStatus::Pending | NodeStatus::Running) {
                continue;
            }
            let predecessors_ready = graph.predecessors(node_id).iter().all(|pred| {
                let pred_state = run.node_state(&motif_types::NodeId::from(pred.as_str()));
                matches!(pred_state.status, NodeStatus::Completed | NodeStatus::Skipped)
            });
            if !predecessors_ready {
                continue;
            }

            let Some(node) = nodes_by_id.get(node_id) else {
                continue;
            };
            let mut state = run.node_state(&node.id);
            let first_visit = state.started_at.is_none();
            if first_visit {
                state.started_at = Some(Utc::now());
            }

            let signal = self.dispatch(workflow, node, &mut state, run).await;

            match signal {
                Signal::Continue => {
                    state.status = NodeStatus::Completed;
                    state.completed_at = Some(Utc::now());
                    newly_completed.push(node_id.clone());
                }
                Signal::Suspend => {
                    state.status = NodeStatus::Running;
                }
                Signal::Fail(message) => {
                    state.status = NodeStatus::Failed;
                    state.error = Some(message.clone());
                    run.node_states.insert(node_id.clone(), state);
                    run.status = RunStatus::Failed;
                    run.error_node_id = Some(node.id.clone());
                    run.error_message = Some(message.clone());
                    run.completed_at = Some(Utc::now());
                    emit_event(
                        tracing::Level::WARN,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "run_settled",
                            component: COMPONENT,
                            account_id: Some(run.account_id.as_str()),
                            task_id: None,
                            run_id: Some(run.id.as_str()),
                            node_id: Some(node.id.as_str()),
                            status: Some("failed"),
                            detail: Some(&message),
                        },
                    );
                    return Ok(());
                }
            }
            run.node_states.insert(node_id.clone(), state);
        }

        for node_id in &newly_completed {
            for edge in graph.out_edges(node_id) {
                let target_state = run.node_state(&motif_types::NodeId::from(edge.target.as_str()));
                if target_state.status != NodeStatus::Pending {
                    continue;
                }
                let condition = workflow
                    .edges
                    .iter()
                    .find(|e| e.id == edge.id)
                    .and_then(|e| e.condition.clone());
                let Some(condition) = condition else {
                    continue;
                };
                let ctx = Self::expr_context(run);
                if !motif_expr::evaluate(&condition, &ctx) {
                    let mut target = target_state;
                    target.status = NodeStatus::Skipped;
                    run.node_states.insert(edge.target.clone(), target);
                }
            }
        }

        let reachable_now = graph.reachable_from(&starts);
        let all_terminal = reachable_now.iter().all(|node_id| {
            let state = run.node_state(&motif_types::NodeId::from(node_id.as_str()));
            matches!(state.status, NodeStatus::Completed | NodeStatus::Skipped)
        });
        if all_terminal {
            run.status = RunStatus::Completed;
            run.completed_at = Some(Utc::now());
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "run_settled",
                    component: COMPONENT,
                    account_id: Some(run.account_id.as_str()),
                    task_id: None,
                    run_id: Some(run.id.as_str()),
                    node_id: None,
                    status: Some("completed"),
                    detail: None,
                },
            );
        }

        Ok(())
    }

    async fn dispatch(
        &self,
        workflow: &Workflow,
        node: &WorkflowNode,
        state: &mut NodeState,
        run: &mut WorkflowRun,
    ) -> Signal {
        match node.node_type {
            NodeType::Start => self.handle_start(workflow, run),
            NodeType::End => self.handle_end(node, run),
            NodeType::VariableSet => self.handle_variable_set(node, run),
            NodeType::Condition => Signal::Continue,
            NodeType::Delay => self.handle_delay(node, state),
            NodeType::VideoMotion | NodeType::VideoLipsync | NodeType::AudioTts | NodeType::Img2img => {
                self.handle_task_node(node, state, run).await
            }
        }
    }

    /// Validates presence of declared input variables, filling in
    /// defaults for optional missing ones; never fails.
    fn handle_start(&self, workflow: &Workflow, run: &mut WorkflowRun) -> Signal {
        for variable in &workflow.variables {
            if !run.runtime_variables.contains_key(&variable.name) {
                if let Some(default) = &variable.default_value {
                    run.runtime_variables.insert(variable.name.clone(), default.clone());
                }
            }
        }
        Signal::Continue
    }

    fn handle_end(&self, node: &WorkflowNode, run: &mut WorkflowRun) -> Signal {
        let config: EndConfig = match serde_json::from_value(node.config.clone()) {
            Ok(c) => c,
            Err(e) => return Signal::Fail(format!("malformed end node config: {e}")),
        };
        let ctx = Self::expr_context(run);
        for output in config.outputs {
            let value = motif_expr::resolve(&output.source, &ctx);
            run.runtime_variables.insert(output.name, value);
        }
        Signal::Continue
    }

    fn handle_variable_set(&self, node: &WorkflowNode, run: &mut WorkflowRun) -> Signal {
        let config: VariableSetConfig = match serde_json::from_value(node.config.clone()) {
            Ok(c) => c,
            Err(e) => return Signal::Fail(format!("malformed variable_set node config: {e}")),
        };
        let ctx = Self::expr_context(run);
        for assignment in config.assignments {
            let value = motif_expr::resolve(&assignment.value, &ctx);
            run.runtime_variables.insert(assignment.name, value);
        }
        Signal::Continue
    }

    fn handle_delay(&self, node: &WorkflowNode, state: &mut NodeState) -> Signal {
        let config: DelayConfig = match serde_json::from_value(node.config.clone()) {
            Ok(c) => c,
            Err(e) => return Signal::Fail(format!("malformed delay node config: {e}")),
        };
        let Some(started_at) = state.started_at else {
            return Signal::Suspend;
        };
        let elapsed = Utc::now() - started_at;
        if elapsed.num_seconds() >= config.delay_seconds as i64 {
            Signal::Continue
        } else {
            Signal::Suspend
        }
    }

    async fn handle_task_node(&self, node: &WorkflowNode, state: &mut NodeState, run: &mut WorkflowRun) -> Signal {
        if state.task_id.is_none() {
            let config: TaskNodeConfig = match serde_json::from_value(node.config.clone()) {
                Ok(c) => c,
                Err(e) => return Signal::Fail(format!("malformed task node config: {e}")),
            };
            let ctx = Self::expr_context(run);
            let inputs: Vec<TaskInput> = config
                .inputs
                .into_iter()
                .map(|input| {
                    let resolved = motif_expr::resolve(&input.source, &ctx);
                    let temp_key = resolved.as_str().unwrap_or_default().to_string();
                    TaskInput {
                        kind: input.kind,
                        temp_key,
                        filename: input.filename,
                    }
                })
                .collect();

            let task_type = match node.node_type {
                NodeType::VideoMotion => motif_types::TaskType::VideoMotion,
                NodeType::VideoLipsync => motif_types::TaskType::VideoLipsync,
                NodeType::AudioTts => motif_types::TaskType::AudioTts,
                NodeType::Img2img => motif_types::TaskType::Img2img,
                _ => unreachable!("dispatch only routes task node types here"),
            };

            match self
                .task_engine
                .create_task(
                    run.account_id.clone(),
                    task_type,
                    config.task_config,
                    inputs,
                    config.estimated_usage,
                )
                .await
            {
                Ok(task) => {
                    state.task_id = Some(task.id);
                    Signal::Suspend
                }
                Err(e) => Signal::Fail(e.to_string()),
            }
        } else {
            let task_id = state.task_id.clone().expect("checked is_some above");
            let task = match self.task_engine.get(&task_id).await {
                Ok(task) => task,
                Err(e) => return Signal::Fail(e.to_string()),
            };
            match task.status {
                TaskStatus::Pending | TaskStatus::Processing => Signal::Suspend,
                TaskStatus::Completed | TaskStatus::Partial => {
                    state.output = Some(NodeOutput {
                        resources: task.resources.into_iter().filter(|r| !r.is_input).collect(),
                        variables: HashMap::new(),
                    });
                    Signal::Continue
                }
                TaskStatus::Failed | TaskStatus::Cancelled => Signal::Fail(
                    task.error_message.unwrap_or_else(|| "task failed".to_string()),
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motif_ledger::{Ledger, TransactionRefs};
    use motif_objectstore::FsObjectStore;
    use motif_pricing::PricingTable;
    use motif_providers::{MockBehavior, MockProvider, ProviderRegistry, ProviderResource};
    use motif_types::{
        AccountId, EdgeType, ExecMode, TaskType, TransactionCategory, UserId, WorkflowId,
    };
    use std::collections::HashMap as StdHashMap;

    async fn wired_engine() -> (WorkflowEngine, AccountId, Arc<Ledger>, tempfile::TempDir, tempfile::TempDir) {
        let ledger = Arc::new(Ledger::new());
        let account = ledger.create_account(UserId::new()).await;
        ledger
            .credit(&account.id, 100_000, TransactionCategory::Recharge, TransactionRefs::default())
            .await
            .unwrap();

        let provider_dir = tempfile::tempdir().unwrap();
        let provider_output = provider_dir.path().join("out.mp4");
        tokio::fs::write(&provider_output, b"rendered-frames").await.unwrap();

        let providers = Arc::new(ProviderRegistry::new());
        providers
            .register(
                Arc::new(MockProvider::new(
                    TaskType::VideoMotion,
                    MockBehavior::Succeeds {
                        outputs: vec![ProviderResource {
                            url: format!("file://{}", provider_output.display()),
                            mime: "video/mp4".into(),
                        }],
                        usage: 3.0,
                    },
                )),
                4,
            )
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path(), "https://cdn.example"));
        let task_engine = Arc::new(TaskEngine::new(
            ledger.clone(),
            Arc::new(PricingTable::with_defaults()),
            providers,
            store,
        ));
        (WorkflowEngine::new(task_engine), account.id, ledger, dir, provider_dir)
    }

    fn simple_task_workflow(account_id: AccountId) -> Workflow {
        let start = motif_types::NodeId::new();
        let task_node = motif_types::NodeId::new();
        let end = motif_types::NodeId::new();

        Workflow {
            id: WorkflowId::new(),
            account_id,
            name: "single task".to_string(),
            version: 1,
            nodes: vec![
                WorkflowNode {
                    id: start.clone(),
                    node_type: NodeType::Start,
                    exec_mode: ExecMode::Async,
                    config: Value::Null,
                },
                WorkflowNode {
                    id: task_node.clone(),
                    node_type: NodeType::VideoMotion,
                    exec_mode: ExecMode::Async,
                    config: serde_json::json!({
                        "inputs": [],
                        "taskConfig": {},
                        "estimatedUsage": 3.0,
                    }),
                },
                WorkflowNode {
                    id: end.clone(),
                    node_type: NodeType::End,
                    exec_mode: ExecMode::Async,
                    config: serde_json::json!({
                        "outputs": [],
                    }),
                },
            ],
            edges: vec![
                WorkflowEdge {
                    id: "e1".into(),
                    edge_type: EdgeType::Normal,
                    source: start,
                    target: task_node,
                    condition: None,
                },
                WorkflowEdge {
                    id: "e2".into(),
                    edge_type: EdgeType::Normal,
                    source: motif_types::NodeId::from("placeholder"),
                    target: end,
                    condition: None,
                },
            ],
            variables: vec![],
        }
    }

    #[tokio::test]
    async fn reconcile_drives_task_node_to_completion_across_ticks() {
        let (engine, account_id, ledger, _dir, _provider_dir) = wired_engine().await;
        let mut workflow = simple_task_workflow(account_id.clone());
        // Wire e2's source to the actual task node id now that it exists.
        let task_node_id = workflow.nodes[1].id.clone();
        workflow.edges[1].source = task_node_id;

        let mut run = WorkflowRun {
            id: motif_types::WorkflowRunId::new(),
            account_id: account_id.clone(),
            workflow_id: workflow.id.clone(),
            exec_mode: RunExecMode::All,
            start_node_ids: vec![],
            status: RunStatus::Running,
            runtime_variables: StdHashMap::new(),
            node_states: StdHashMap::new(),
            total_estimated_cost: 0,
            error_node_id: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
            version: 0,
        };

        engine.reconcile(&workflow, &mut run).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let task_node_state = run.node_state(&workflow.nodes[1].id);
        assert_eq!(task_node_state.status, NodeStatus::Running);
        let task_id = task_node_state.task_id.clone().unwrap();

        engine.task_engine.submit(&task_id).await.unwrap();
        engine.task_engine.poll(&task_id).await.unwrap();

        engine.reconcile(&workflow, &mut run).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(ledger.get_account(&account_id).await.unwrap().balance, 100_000);
    }

    #[tokio::test]
    async fn create_rejects_edge_with_unknown_endpoint() {
        let store = WorkflowStore::new();
        let workflow = simple_task_workflow(AccountId::new());
        let err = store.create(workflow).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn create_rejects_cyclic_graph() {
        let store = WorkflowStore::new();
        let a = motif_types::NodeId::new();
        let b = motif_types::NodeId::new();
        let workflow = Workflow {
            id: WorkflowId::new(),
            account_id: AccountId::new(),
            name: "cyclic".to_string(),
            version: 1,
            nodes: vec![
                WorkflowNode {
                    id: a.clone(),
                    node_type: NodeType::VariableSet,
                    exec_mode: ExecMode::Async,
                    config: serde_json::json!({"assignments": []}),
                },
                WorkflowNode {
                    id: b.clone(),
                    node_type: NodeType::VariableSet,
                    exec_mode: ExecMode::Async,
                    config: serde_json::json!({"assignments": []}),
                },
            ],
            edges: vec![
                WorkflowEdge {
                    id: "e1".into(),
                    edge_type: EdgeType::Normal,
                    source: a.clone(),
                    target: b.clone(),
                    condition: None,
                },
                WorkflowEdge {
                    id: "e2".into(),
                    edge_type: EdgeType::Normal,
                    source: b,
                    target: a,
                    condition: None,
                },
            ],
            variables: vec![],
        };
        let err = store.create(workflow).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn create_accepts_valid_acyclic_workflow() {
        let store = WorkflowStore::new();
        let mut workflow = simple_task_workflow(AccountId::new());
        let task_node_id = workflow.nodes[1].id.clone();
        workflow.edges[1].source = task_node_id;
        let workflow_id = workflow.id.clone();

        store.create(workflow).await.unwrap();
        assert_eq!(store.get(&workflow_id).await.unwrap().id, workflow_id);
    }
}
