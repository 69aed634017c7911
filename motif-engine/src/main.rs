use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use motif_config::{AppConfig, ConfigStore};
use motif_ledger::Ledger;
use motif_objectstore::FsObjectStore;
use motif_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use motif_pricing::PricingTable;
use motif_providers::{HttpTaskProvider, MockBehavior, MockProvider, ProviderRegistry};
use motif_scheduler::{Scheduler, SchedulerConfig};
use motif_tasks::TaskEngine;
use motif_types::{AccountId, TaskType};
use motif_workflow::{WorkflowEngine, WorkflowRunStore, WorkflowStore};

#[derive(Parser, Debug)]
#[command(name = "motif-engine")]
#[command(about = "Media generation orchestration control plane")]
struct Cli {
    #[arg(long, env = "MOTIF_STATE_DIR")]
    state_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Run the scheduler loop and timeout sweep until interrupted.
    Serve,
    /// Run exactly one scheduler tick and print what it claimed.
    ReconcileOnce,
    /// Print an account's current balance.
    LedgerBalance {
        #[arg(long)]
        account_id: String,
    },
}

struct AppState {
    ledger: Arc<Ledger>,
    scheduler: Arc<Scheduler>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);
    let _logging_guard = init_process_logging(ProcessKind::Engine, &canonical_logs_dir_from_root(&state_dir))
        .context("failed to initialize logging")?;

    let config_store = ConfigStore::new(state_dir.join("config.json")).await?;
    let config = config_store.get().await;
    let state = build_state(&state_dir, &config).await?;

    match cli.command {
        Command::Serve => {
            info!("starting motif-engine scheduler loop");
            let scheduler = state.scheduler.clone();
            let tick_task = tokio::spawn(scheduler.clone().run_forever());
            let sweep_task = tokio::spawn(scheduler.run_timeout_sweep_forever());
            tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
            info!("shutdown signal received");
            tick_task.abort();
            sweep_task.abort();
        }
        Command::ReconcileOnce => {
            let report = state.scheduler.tick().await;
            println!(
                "submitted={} polled={} reconciled={}",
                report.tasks_submitted, report.tasks_polled, report.runs_reconciled
            );
        }
        Command::LedgerBalance { account_id } => {
            let account = state.ledger.get_account(&AccountId::from(account_id)).await?;
            println!("{}", account.balance);
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    PathBuf::from(".motif")
}

async fn build_state(state_dir: &PathBuf, config: &AppConfig) -> anyhow::Result<AppState> {
    let ledger = Arc::new(Ledger::new());
    let pricing = Arc::new(PricingTable::with_defaults());

    let providers = Arc::new(ProviderRegistry::new());
    for task_type in TaskType::ALL {
        let endpoint = config.providers.get(task_type.as_str());
        let provider: Arc<dyn motif_providers::TaskProvider> = match endpoint {
            Some(endpoint) => Arc::new(HttpTaskProvider::new(task_type, endpoint.base_url.clone())),
            None => Arc::new(MockProvider::new(
                task_type,
                MockBehavior::Succeeds {
                    outputs: vec![],
                    usage: 0.0,
                },
            )),
        };
        providers.register(provider, config.scheduler.concurrency).await;
    }

    let object_store_root = config
        .object_store_root
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("objects"));
    let object_store = Arc::new(FsObjectStore::new(object_store_root, "http://localhost:3000/objects"));

    let task_engine = Arc::new(TaskEngine::new(ledger.clone(), pricing, providers, object_store));
    let workflow_engine = Arc::new(WorkflowEngine::new(task_engine.clone()));
    let workflow_runs = Arc::new(WorkflowRunStore::new());
    let workflows = Arc::new(WorkflowStore::new());

    let scheduler_config = SchedulerConfig {
        batch_size: config.scheduler.batch_size,
        concurrency: config.scheduler.concurrency,
        tick_interval: Duration::from_secs(config.scheduler.task_interval_secs),
        timeout_sweep_interval: Duration::from_secs(60),
    };
    let scheduler = Arc::new(Scheduler::new(
        task_engine,
        workflow_engine,
        workflow_runs,
        workflows,
        scheduler_config,
    ));

    Ok(AppState { ledger, scheduler })
}
