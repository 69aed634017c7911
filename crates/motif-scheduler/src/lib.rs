//! Component I — the reconcile scheduler: on a tick, claims pending
//! work and drives the task and workflow engines forward under bounded
//! concurrency, never letting one row's failure take down the loop.
//!
//! Grounded on the teacher's `EngineLease`/`ActiveRun` claim-and-renew
//! model (`tandem-server`): a claim is acquired before work starts and
//! released when it ends, so two workers never advance the same row.
//! A production deployment would express the claim as a database
//! `SELECT ... FOR UPDATE SKIP LOCKED`; a single process has no
//! competing lock manager, so `ClaimTable` reproduces the same
//! exclusion with an in-memory set guarded by a mutex.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::instrument;

use motif_tasks::TaskEngine;
use motif_types::{TaskId, WorkflowRunId};
use motif_workflow::{WorkflowEngine, WorkflowRunStore, WorkflowStore};

/// Tracks ids currently claimed by an in-flight worker. `claim_batch`
/// is the only entry point that inserts, so two concurrent callers can
/// never both receive the same id.
struct ClaimTable<T: Eq + Hash + Clone> {
    claimed: Mutex<HashSet<T>>,
}

impl<T: Eq + Hash + Clone> ClaimTable<T> {
    fn new() -> Self {
        Self {
            claimed: Mutex::new(HashSet::new()),
        }
    }

    async fn claim_batch(&self, candidates: Vec<T>, batch_size: usize) -> Vec<T> {
        let mut guard = self.claimed.lock().await;
        let mut claimed = Vec::with_capacity(batch_size.min(candidates.len()));
        for id in candidates {
            if claimed.len() >= batch_size {
                break;
            }
            if guard.insert(id.clone()) {
                claimed.push(id);
            }
        }
        claimed
    }

    async fn release(&self, id: &T) {
        self.claimed.lock().await.remove(id);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Max rows claimed per kind, per tick.
    pub batch_size: usize,
    /// Max workers in flight across the whole tick.
    pub concurrency: usize,
    pub tick_interval: Duration,
    pub timeout_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 16,
            tick_interval: Duration::from_secs(2),
            timeout_sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Counts of what a single tick claimed, for logging/metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub tasks_submitted: usize,
    pub tasks_polled: usize,
    pub runs_reconciled: usize,
}

pub struct Scheduler {
    task_engine: Arc<TaskEngine>,
    workflow_engine: Arc<WorkflowEngine>,
    workflow_runs: Arc<WorkflowRunStore>,
    workflows: Arc<WorkflowStore>,
    config: SchedulerConfig,
    submit_claims: ClaimTable<TaskId>,
    poll_claims: ClaimTable<TaskId>,
    run_claims: ClaimTable<WorkflowRunId>,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        task_engine: Arc<TaskEngine>,
        workflow_engine: Arc<WorkflowEngine>,
        workflow_runs: Arc<WorkflowRunStore>,
        workflows: Arc<WorkflowStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            task_engine,
            workflow_engine,
            workflow_runs,
            workflows,
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
            submit_claims: ClaimTable::new(),
            poll_claims: ClaimTable::new(),
            run_claims: ClaimTable::new(),
        }
    }

    /// One reconcile pass: claim up to `batchSize` of each kind, fan
    /// out to at most `concurrency` workers at once, and wait for the
    /// whole batch to finish before returning. Every worker's error is
    /// caught and logged against its row; none of them propagate.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let submit_candidates = self
            .submit_claims
            .claim_batch(self.task_engine.pending_ids().await, self.config.batch_size)
            .await;
        let poll_candidates = self
            .poll_claims
            .claim_batch(self.task_engine.pollable_ids().await, self.config.batch_size)
            .await;
        let run_candidates = self
            .run_claims
            .claim_batch(self.workflow_runs.running_ids().await, self.config.batch_size)
            .await;

        let mut report = TickReport::default();
        let mut joins = JoinSet::new();

        for task_id in submit_candidates {
            let permit = self.permits.clone().acquire_owned().await.expect("semaphore not closed");
            let task_engine = self.task_engine.clone();
            joins.spawn(async move {
                let _permit = permit;
                if let Err(err) = task_engine.submit(&task_id).await {
                    tracing::warn!(task_id = %task_id, %err, "submit pass failed");
                }
                Work::Submit(task_id)
            });
        }
        for task_id in poll_candidates {
            let permit = self.permits.clone().acquire_owned().await.expect("semaphore not closed");
            let task_engine = self.task_engine.clone();
            joins.spawn(async move {
                let _permit = permit;
                if let Err(err) = task_engine.poll(&task_id).await {
                    tracing::warn!(task_id = %task_id, %err, "poll pass failed");
                }
                Work::Poll(task_id)
            });
        }
        for run_id in run_candidates {
            let permit = self.permits.clone().acquire_owned().await.expect("semaphore not closed");
            let workflow_engine = self.workflow_engine.clone();
            let workflow_runs = self.workflow_runs.clone();
            let workflows = self.workflows.clone();
            joins.spawn(async move {
                let _permit = permit;
                match workflow_runs.get(&run_id).await {
                    Ok(run) => match workflows.get(&run.workflow_id).await {
                        Ok(workflow) => {
                            if let Err(err) = workflow_runs.reconcile_one(&run_id, &workflow_engine, &workflow).await
                            {
                                tracing::warn!(run_id = %run_id, %err, "reconcile pass failed");
                            }
                        }
                        Err(err) => tracing::warn!(run_id = %run_id, %err, "workflow lookup failed"),
                    },
                    Err(err) => tracing::warn!(run_id = %run_id, %err, "run lookup failed"),
                }
                Work::Run(run_id)
            });
        }

        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok(Work::Submit(task_id)) => {
                    report.tasks_submitted += 1;
                    self.submit_claims.release(&task_id).await;
                }
                Ok(Work::Poll(task_id)) => {
                    report.tasks_polled += 1;
                    self.poll_claims.release(&task_id).await;
                }
                Ok(Work::Run(run_id)) => {
                    report.runs_reconciled += 1;
                    self.run_claims.release(&run_id).await;
                }
                Err(join_err) => {
                    tracing::error!(%join_err, "scheduler worker panicked");
                }
            }
        }

        report
    }

    /// Separate aging-out pass (spec.md §4.I "Timeouts"): never mixed
    /// into the main tick, since it scans the whole table rather than
    /// a claimed batch.
    #[instrument(skip(self))]
    pub async fn timeout_sweep(&self) -> usize {
        let timed_out = self.task_engine.timeout_sweep().await;
        if !timed_out.is_empty() {
            tracing::info!(count = timed_out.len(), "timeout sweep aged out tasks");
        }
        timed_out.len()
    }

    /// Runs `tick` on `tickInterval` until the process exits. Intended
    /// to be spawned as its own task; one `Scheduler` can equally be
    /// ticked manually (e.g. from a `reconcile-once` CLI command).
    pub async fn run_forever(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            interval.tick().await;
            let report = self.tick().await;
            tracing::debug!(
                submitted = report.tasks_submitted,
                polled = report.tasks_polled,
                reconciled = report.runs_reconciled,
                "tick complete"
            );
        }
    }

    pub async fn run_timeout_sweep_forever(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.timeout_sweep_interval);
        loop {
            interval.tick().await;
            self.timeout_sweep().await;
        }
    }
}

enum Work {
    Submit(TaskId),
    Poll(TaskId),
    Run(WorkflowRunId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use motif_ledger::{Ledger, TransactionRefs};
    use motif_objectstore::FsObjectStore;
    use motif_pricing::PricingTable;
    use motif_providers::{MockBehavior, MockProvider, ProviderRegistry, ProviderResource};
    use motif_types::{
        AccountId, EdgeType, ExecMode, NodeType, RunExecMode, RunStatus, TaskType,
        TransactionCategory, UserId, Workflow, WorkflowEdge, WorkflowId, WorkflowNode,
        WorkflowRun,
    };
    use serde_json::Value;
    use std::collections::HashMap;

    async fn wired(
    ) -> (Arc<Scheduler>, Arc<Ledger>, AccountId, Arc<WorkflowRunStore>, tempfile::TempDir) {
        let ledger = Arc::new(Ledger::new());
        let account = ledger.create_account(UserId::new()).await;
        ledger
            .credit(&account.id, 100_000, TransactionCategory::Recharge, TransactionRefs::default())
            .await
            .unwrap();

        let providers = Arc::new(ProviderRegistry::new());
        providers
            .register(
                Arc::new(MockProvider::new(
                    TaskType::AudioTts,
                    MockBehavior::Succeeds {
                        outputs: vec![ProviderResource {
                            url: "https://provider/out.mp3".into(),
                            mime: "audio/mpeg".into(),
                        }],
                        usage: 12.0,
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
        let workflow_engine = Arc::new(WorkflowEngine::new(task_engine.clone()));
        let workflow_runs = Arc::new(WorkflowRunStore::new());
        let workflows = Arc::new(WorkflowStore::new());

        let scheduler = Arc::new(Scheduler::new(
            task_engine,
            workflow_engine,
            workflow_runs.clone(),
            workflows,
            SchedulerConfig::default(),
        ));
        (scheduler, ledger, account.id, workflow_runs, dir)
    }

    #[tokio::test]
    async fn tick_drains_a_pending_task_through_completion() {
        let (scheduler, ledger, account_id, _runs, _dir) = wired().await;
        let task = scheduler
            .task_engine
            .create_task(account_id.clone(), TaskType::AudioTts, Value::Null, vec![], 12.0)
            .await
            .unwrap();

        let report = scheduler.tick().await;
        assert_eq!(report.tasks_submitted, 1);

        let completed = scheduler.task_engine.get(&task.id).await.unwrap();
        assert_eq!(completed.status, motif_types::TaskStatus::Completed);
        assert_eq!(ledger.get_account(&account_id).await.unwrap().balance, 100_000);
    }

    #[tokio::test]
    async fn claimed_id_is_not_claimed_twice_concurrently() {
        let table = ClaimTable::<u32>::new();
        let first = table.claim_batch(vec![1, 2, 3], 10).await;
        let second = table.claim_batch(vec![1, 2, 3], 10).await;
        assert_eq!(first, vec![1, 2, 3]);
        assert!(second.is_empty());
        table.release(&1).await;
        let third = table.claim_batch(vec![1, 2, 3], 10).await;
        assert_eq!(third, vec![1]);
    }

    #[tokio::test]
    async fn tick_reconciles_a_running_workflow_run() {
        let (scheduler, _ledger, account_id, runs, _dir) = wired().await;

        let start = motif_types::NodeId::new();
        let end = motif_types::NodeId::new();
        let workflow = Workflow {
            id: WorkflowId::new(),
            account_id: account_id.clone(),
            name: "noop".to_string(),
            version: 1,
            nodes: vec![
                WorkflowNode {
                    id: start.clone(),
                    node_type: NodeType::Start,
                    exec_mode: ExecMode::Async,
                    config: Value::Null,
                },
                WorkflowNode {
                    id: end.clone(),
                    node_type: NodeType::End,
                    exec_mode: ExecMode::Async,
                    config: serde_json::json!({"outputs": []}),
                },
            ],
            edges: vec![WorkflowEdge {
                id: "e1".into(),
                edge_type: EdgeType::Normal,
                source: start,
                target: end,
                condition: None,
            }],
            variables: vec![],
        };
        scheduler.workflows.create(workflow.clone()).await.unwrap();

        let run = WorkflowRun {
            id: motif_types::WorkflowRunId::new(),
            account_id,
            workflow_id: workflow.id,
            exec_mode: RunExecMode::All,
            start_node_ids: vec![],
            status: RunStatus::Running,
            runtime_variables: HashMap::new(),
            node_states: HashMap::new(),
            total_estimated_cost: 0,
            error_node_id: None,
            error_message: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
            version: 0,
        };
        let run_id = run.id.clone();
        runs.insert(run).await;

        let report = scheduler.tick().await;
        assert_eq!(report.runs_reconciled, 1);
        let finished = runs.get(&run_id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Completed);
    }
}
