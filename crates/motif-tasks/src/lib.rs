//! Component E — the task lifecycle engine: validate, price, charge,
//! submit, poll, settle media-generation tasks against external async
//! providers.
//!
//! Grounded on the teacher engine's composition style (`EngineLoop`
//! wiring storage, providers, and policy together behind one struct)
//! and on the per-account row lock already implemented by
//! `motif-ledger`, reused here rather than reinvented.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::instrument;

use motif_ledger::{Ledger, TransactionRefs};
use motif_objectstore::{self as objectstore, ObjectStore};
use motif_observability::{emit_event, ObservabilityEvent, ProcessKind};
use motif_pricing::PricingTable;
use motif_providers::{PollResult, ProviderRegistry, SubmitError};
use motif_types::{
    AccountId, EngineError, EngineResult, ResourceKind, Task, TaskInput, TaskMode, TaskResource,
    TaskStatus, TaskType, TransactionCategory, UsageReport,
};

const COMPONENT: &str = "task_engine";

/// Minimum gap between two polls of the same processing task.
const POLL_INTERVAL_SECS: i64 = 5;

/// Exponential backoff with cap, spec.md §4.E: base 30s, factor 2, cap
/// 10 min, max 3 attempts by default.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            factor: 2,
            cap: Duration::from_secs(600),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let scaled = self.base.as_secs().saturating_mul(self.factor.pow(retry_count.max(1)) as u64);
        Duration::from_secs(scaled.min(self.cap.as_secs()))
    }
}

/// Async/sync "stuck" budgets, spec.md §4.E: default 120 min async, 30
/// min sync.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub async_budget: Duration,
    pub sync_budget: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            async_budget: Duration::from_secs(120 * 60),
            sync_budget: Duration::from_secs(30 * 60),
        }
    }
}

pub struct TaskEngine {
    ledger: Arc<Ledger>,
    pricing: Arc<PricingTable>,
    providers: Arc<ProviderRegistry>,
    object_store: Arc<dyn ObjectStore>,
    tasks: RwLock<HashMap<motif_types::TaskId, Task>>,
    retry_policy: RetryPolicy,
    timeout_policy: TimeoutPolicy,
}

impl TaskEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        pricing: Arc<PricingTable>,
        providers: Arc<ProviderRegistry>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            ledger,
            pricing,
            providers,
            object_store,
            tasks: RwLock::new(HashMap::new()),
            retry_policy: RetryPolicy::default(),
            timeout_policy: TimeoutPolicy::default(),
        }
    }

    pub fn with_policies(mut self, retry: RetryPolicy, timeout: TimeoutPolicy) -> Self {
        self.retry_policy = retry;
        self.timeout_policy = timeout;
        self
    }

    /// Either the Task exists with its charge recorded, or neither
    /// does: input copies happen first (and are rolled back on
    /// failure) so the only remaining fallible step before insertion
    /// is the debit itself.
    #[instrument(skip(self, config, inputs), fields(account_id = %account_id, task_type = ?task_type))]
    pub async fn create_task(
        &self,
        account_id: AccountId,
        task_type: TaskType,
        config: Value,
        inputs: Vec<TaskInput>,
        estimated_usage: f64,
    ) -> EngineResult<Task> {
        if !config.is_object() && !config.is_null() {
            return Err(EngineError::InvalidInput(
                "task config must be a JSON object".to_string(),
            ));
        }

        let task_id = motif_types::TaskId::new();
        let mut copied_keys = Vec::with_capacity(inputs.len());
        let mut resources = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let dest_key = objectstore::input_key(&account_id, task_type, &task_id, &input.filename);
            if let Err(err) = self.copy_object(&input.temp_key, &dest_key).await {
                self.rollback_copies(&copied_keys).await;
                return Err(EngineError::Internal(format!(
                    "failed to stage input {}: {err}",
                    input.filename
                )));
            }
            copied_keys.push(dest_key.clone());
            resources.push(TaskResource {
                kind: input.kind,
                url: self.object_store.public_url(&dest_key),
                is_input: true,
                metadata: Value::Null,
            });
        }

        let estimated_cost = match self.pricing.price(task_type, estimated_usage) {
            Ok(cost) => cost,
            Err(err) => {
                self.rollback_copies(&copied_keys).await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .ledger
            .debit(
                &account_id,
                estimated_cost,
                TransactionCategory::TaskCharge,
                TransactionRefs {
                    task_id: Some(task_id.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            self.rollback_copies(&copied_keys).await;
            return Err(err);
        }

        let task = Task {
            id: task_id.clone(),
            account_id,
            task_type,
            mode: task_type.mode(),
            status: TaskStatus::Pending,
            config,
            external_task_id: None,
            resources,
            estimated_cost,
            actual_cost: None,
            actual_usage: None,
            retry_count: 0,
            next_retry_at: None,
            next_poll_at: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            version: 0,
        };
        self.tasks.write().await.insert(task_id, task.clone());
        tracing::info!(task_id = %task.id, estimated_cost, "task_created");
        emit_event(
            tracing::Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "task_created",
                component: COMPONENT,
                account_id: Some(task.account_id.as_str()),
                task_id: Some(task.id.as_str()),
                run_id: None,
                node_id: None,
                status: Some("pending"),
                detail: None,
            },
        );
        Ok(task)
    }

    async fn copy_object(&self, src_key: &str, dest_key: &str) -> anyhow::Result<()> {
        let bytes = self.object_store.get_bytes(src_key).await?;
        self.object_store.put_bytes(dest_key, &bytes).await
    }

    async fn rollback_copies(&self, keys: &[String]) {
        for key in keys {
            if let Err(err) = self.object_store.delete(key).await {
                tracing::warn!(key, %err, "failed to roll back staged input");
            }
        }
    }

    pub async fn get(&self, task_id: &motif_types::TaskId) -> EngineResult<Task> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))
    }

    pub async fn list(&self, account_id: &AccountId, status: Option<TaskStatus>) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| &t.account_id == account_id)
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Scheduler-facing: every account's `pending` tasks, i.e. the
    /// claim candidates for a `submit` pass.
    pub async fn pending_ids(&self) -> Vec<motif_types::TaskId> {
        let now = Utc::now();
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.next_retry_at.map(|at| at <= now).unwrap_or(true))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Scheduler-facing: every account's `processing` tasks whose
    /// `nextPollAt` has elapsed, i.e. the claim candidates for a
    /// `poll` pass.
    pub async fn pollable_ids(&self) -> Vec<motif_types::TaskId> {
        let now = Utc::now();
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .filter(|t| t.next_poll_at.map(|at| at <= now).unwrap_or(true))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Scheduler-driven: calls the provider adapter's `submit` and
    /// applies the result transition.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn submit(&self, task_id: &motif_types::TaskId) -> EngineResult<Task> {
        let task = self.get(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Ok(task);
        }

        let handle = self.providers.get(task.task_type).await?;
        let input_urls: Vec<String> = task
            .resources
            .iter()
            .filter(|r| r.is_input)
            .map(|r| r.url.clone())
            .collect();

        match handle
            .submit(&task.idempotency_key(), &input_urls, &task.config)
            .await
        {
            Ok(outcome) => {
                if let Some(provider_outputs) = outcome.sync_outputs {
                    self.complete_with_outputs(
                        task_id,
                        &task,
                        provider_outputs,
                        outcome.sync_usage.unwrap_or(0.0),
                    )
                    .await
                } else {
                    let submitted = self
                        .mutate(task_id, |t| {
                            t.external_task_id = Some(outcome.external_id.clone());
                            t.status = TaskStatus::Processing;
                            t.started_at = Some(Utc::now());
                            t.next_poll_at = Some(Utc::now());
                        })
                        .await?;
                    emit_event(
                        tracing::Level::INFO,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "task_submitted",
                            component: COMPONENT,
                            account_id: Some(submitted.account_id.as_str()),
                            task_id: Some(submitted.id.as_str()),
                            run_id: None,
                            node_id: None,
                            status: Some("processing"),
                            detail: None,
                        },
                    );
                    Ok(submitted)
                }
            }
            Err(SubmitError::Retryable(message)) => {
                let retry_count = task.retry_count + 1;
                if retry_count > self.retry_policy.max_retries {
                    self.fail_and_refund(task_id, message).await
                } else {
                    let delay = self.retry_policy.backoff(retry_count);
                    self.mutate(task_id, |t| {
                        t.retry_count = retry_count;
                        t.next_retry_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                        t.error_message = Some(message.clone());
                    })
                    .await
                }
            }
            Err(SubmitError::Terminal(message)) => self.fail_and_refund(task_id, message).await,
        }
    }

    /// Scheduler-driven, only valid from `processing`. Re-reads the
    /// task before calling the provider so a concurrent user-initiated
    /// `cancel` is visible as a pre-condition check.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn poll(&self, task_id: &motif_types::TaskId) -> EngineResult<Task> {
        let task = self.get(task_id).await?;
        if task.status != TaskStatus::Processing {
            return Ok(task);
        }
        let external_id = task
            .external_task_id
            .clone()
            .ok_or_else(|| EngineError::Internal("processing task missing external id".into()))?;

        let handle = self.providers.get(task.task_type).await?;
        let poll_result = handle
            .poll(&external_id, &task.config)
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        match poll_result {
            PollResult::Pending => {
                self.mutate(task_id, |t| {
                    t.next_poll_at = Some(Utc::now() + chrono::Duration::seconds(POLL_INTERVAL_SECS));
                })
                .await
            }
            PollResult::Failed { message, .. } => self.fail_and_refund(task_id, message).await,
            PollResult::Done { outputs, usage } => {
                self.complete_with_outputs(task_id, &task, outputs, usage).await
            }
        }
    }

    /// Shared completion path for both an async provider's `Done` poll
    /// result and a sync provider's inline `submit` outputs: copy
    /// outputs to the output area, price actual usage, settle against
    /// the pre-charge, transition to `completed`.
    async fn complete_with_outputs(
        &self,
        task_id: &motif_types::TaskId,
        task: &Task,
        outputs: Vec<motif_providers::ProviderResource>,
        usage: f64,
    ) -> EngineResult<Task> {
        let mut output_resources = Vec::with_capacity(outputs.len());
        for (idx, output) in outputs.into_iter().enumerate() {
            let filename = output
                .url
                .rsplit('/')
                .next()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("output-{idx}"));
            let dest_key = objectstore::output_key(&task.account_id, task.task_type, task_id, &filename);
            objectstore::fetch_into(self.object_store.as_ref(), &output.url, &dest_key)
                .await
                .map_err(|e| EngineError::Internal(format!("failed to ingest output {}: {e}", output.url)))?;
            output_resources.push(TaskResource {
                kind: mime_to_kind(&output.mime),
                url: self.object_store.public_url(&dest_key),
                is_input: false,
                metadata: Value::Null,
            });
        }

        let actual_cost = self.pricing.price(task.task_type, usage)?;
        self.ledger
            .settle(&task.account_id, task_id, task.estimated_cost, actual_cost)
            .await?;

        let completed = self
            .mutate(task_id, |t| {
                t.resources.extend(output_resources.clone());
                t.actual_cost = Some(actual_cost);
                t.actual_usage = Some(UsageReport { amount: usage });
                t.status = TaskStatus::Completed;
                t.completed_at = Some(Utc::now());
            })
            .await?;
        emit_event(
            tracing::Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "task_settled",
                component: COMPONENT,
                account_id: Some(completed.account_id.as_str()),
                task_id: Some(completed.id.as_str()),
                run_id: None,
                node_id: None,
                status: Some("completed"),
                detail: None,
            },
        );
        Ok(completed)
    }

    /// `pending` refunds in full; `processing` refunds immediately
    /// rather than waiting for settlement (an Open Question the spec
    /// leaves provider-specific; see DESIGN.md). A task that is already
    /// terminal is an idempotent no-op.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn cancel(&self, task_id: &motif_types::TaskId) -> EngineResult<Task> {
        let task = self.get(task_id).await?;
        match task.status {
            TaskStatus::Cancelled => Ok(task),
            TaskStatus::Pending | TaskStatus::Processing => {
                self.ledger
                    .refund_full(&task.account_id, task_id, task.estimated_cost)
                    .await?;
                self.mutate(task_id, |t| {
                    t.status = TaskStatus::Cancelled;
                    t.completed_at = Some(Utc::now());
                })
                .await
            }
            _ => Err(EngineError::InvalidInput(format!(
                "cannot cancel task in status {:?}",
                task.status
            ))),
        }
    }

    /// Separate pass (spec.md §4.I "Timeouts"): ages out tasks stuck in
    /// `processing` beyond their budget, refunding in full.
    pub async fn timeout_sweep(&self) -> Vec<motif_types::TaskId> {
        let now = Utc::now();
        let stuck: Vec<motif_types::TaskId> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .filter(|t| {
                let budget = match t.mode {
                    TaskMode::Async => self.timeout_policy.async_budget,
                    TaskMode::Sync => self.timeout_policy.sync_budget,
                };
                t.started_at
                    .map(|started| now - started > chrono::Duration::from_std(budget).unwrap_or_default())
                    .unwrap_or(false)
            })
            .map(|t| t.id.clone())
            .collect();

        let mut timed_out = Vec::with_capacity(stuck.len());
        for task_id in stuck {
            if self.fail_and_refund(&task_id, "timed out".to_string()).await.is_ok() {
                timed_out.push(task_id);
            }
        }
        timed_out
    }

    async fn fail_and_refund(
        &self,
        task_id: &motif_types::TaskId,
        message: String,
    ) -> EngineResult<Task> {
        let task = self.get(task_id).await?;
        self.ledger
            .refund_full(&task.account_id, task_id, task.estimated_cost)
            .await?;
        let failed = self
            .mutate(task_id, |t| {
                t.status = TaskStatus::Failed;
                t.error_message = Some(message.clone());
                t.completed_at = Some(Utc::now());
            })
            .await?;
        emit_event(
            tracing::Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "task_settled",
                component: COMPONENT,
                account_id: Some(failed.account_id.as_str()),
                task_id: Some(failed.id.as_str()),
                run_id: None,
                node_id: None,
                status: Some("failed"),
                detail: Some(&message),
            },
        );
        Ok(failed)
    }

    async fn mutate(
        &self,
        task_id: &motif_types::TaskId,
        f: impl FnOnce(&mut Task),
    ) -> EngineResult<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
        f(task);
        task.version += 1;
        Ok(task.clone())
    }
}

fn mime_to_kind(mime: &str) -> ResourceKind {
    if mime.starts_with("video/") {
        ResourceKind::Video
    } else if mime.starts_with("audio/") {
        ResourceKind::Audio
    } else if mime.starts_with("image/") {
        ResourceKind::Image
    } else {
        ResourceKind::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motif_objectstore::FsObjectStore;
    use motif_providers::{MockBehavior, MockProvider};
    use motif_types::UserId;

    async fn engine_with_mock(behavior: MockBehavior) -> (TaskEngine, Arc<Ledger>, AccountId, tempfile::TempDir) {
        let ledger = Arc::new(Ledger::new());
        let account = ledger.create_account(UserId::new()).await;
        ledger
            .credit(&account.id, 100_000, TransactionCategory::Recharge, TransactionRefs::default())
            .await
            .unwrap();

        let providers = Arc::new(ProviderRegistry::new());
        providers
            .register(Arc::new(MockProvider::new(TaskType::VideoMotion, behavior)), 4)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path(), "https://cdn.example"));

        let engine = TaskEngine::new(
            ledger.clone(),
            Arc::new(PricingTable::with_defaults()),
            providers,
            store,
        );
        (engine, ledger, account.id, dir)
    }

    #[tokio::test]
    async fn happy_path_charges_submits_completes_and_settles() {
        let provider_dir = tempfile::tempdir().unwrap();
        let provider_output = provider_dir.path().join("out.mp4");
        tokio::fs::write(&provider_output, b"rendered-frames").await.unwrap();

        let (engine, ledger, account_id, _dir) = engine_with_mock(MockBehavior::Succeeds {
            outputs: vec![motif_providers::ProviderResource {
                url: format!("file://{}", provider_output.display()),
                mime: "video/mp4".into(),
            }],
            usage: 5.0,
        })
        .await;

        let task = engine
            .create_task(account_id.clone(), TaskType::VideoMotion, Value::Null, vec![], 5.0)
            .await
            .unwrap();
        assert_eq!(task.estimated_cost, 1_000);
        assert_eq!(ledger.get_account(&account_id).await.unwrap().balance, 99_000);

        let task = engine.submit(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Processing);

        let task = engine.poll(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.actual_cost, Some(1_000));
        assert_eq!(ledger.get_account(&account_id).await.unwrap().balance, 99_000);
        let output = task.resources.iter().find(|r| !r.is_input).unwrap();
        assert!(output.url.starts_with("https://cdn.example/output/"));
    }

    #[tokio::test]
    async fn terminal_submit_error_fails_and_refunds() {
        let (engine, ledger, account_id, _dir) =
            engine_with_mock(MockBehavior::RejectsTerminal("blocked content".into())).await;

        let task = engine
            .create_task(account_id.clone(), TaskType::VideoMotion, Value::Null, vec![], 2.0)
            .await
            .unwrap();
        let balance_after_charge = ledger.get_account(&account_id).await.unwrap().balance;
        assert_eq!(balance_after_charge, 100_000 - task.estimated_cost);

        let task = engine.submit(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(ledger.get_account(&account_id).await.unwrap().balance, 100_000);
    }

    #[tokio::test]
    async fn cancel_from_pending_refunds_full_and_is_idempotent() {
        let (engine, ledger, account_id, _dir) = engine_with_mock(MockBehavior::FailsRetryableForever).await;

        let task = engine
            .create_task(account_id.clone(), TaskType::VideoMotion, Value::Null, vec![], 1.0)
            .await
            .unwrap();
        let task = engine.cancel(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(ledger.get_account(&account_id).await.unwrap().balance, 100_000);

        let task_again = engine.cancel(&task.id).await.unwrap();
        assert_eq!(task_again.status, TaskStatus::Cancelled);
        assert_eq!(ledger.get_account(&account_id).await.unwrap().balance, 100_000);
    }

    #[tokio::test]
    async fn retryable_submit_error_exhausts_budget_into_failure() {
        let (engine, ledger, account_id, _dir) = engine_with_mock(MockBehavior::FailsRetryableForever).await;
        let task = engine
            .create_task(account_id.clone(), TaskType::VideoMotion, Value::Null, vec![], 1.0)
            .await
            .unwrap();

        let mut task = task;
        for _ in 0..=RetryPolicy::default().max_retries {
            task = engine.submit(&task.id).await.unwrap();
        }
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(ledger.get_account(&account_id).await.unwrap().balance, 100_000);
    }
}
