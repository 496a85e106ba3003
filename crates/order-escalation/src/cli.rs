//! Command-line surface
//!
//! ```bash
//! # Run every worker queue in the default namespace
//! order-escalation worker
//!
//! # Start one order and resolve it by hand once it reaches the manual tier
//! order-escalation client start --order-id A1
//! order-escalation client signal-manual -w manual-payment-A1 "refund issued"
//!
//! # Monthly-style charges, every minute, 12 terms
//! order-escalation client create-recurring-payment --order-id C9 --terms 12
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use escalation_runtime::{
    Registry, Runtime, RuntimeError, ScheduleSpec, SearchAttributes, StartOptions, Worker,
    WorkerOptions,
};
use futures::stream::{self, StreamExt};
use rand::Rng;
use tracing::{info, warn};

use crate::app::{self, Dependencies};
use crate::config::AppConfig;
use crate::models::{
    primary_id, ALL_QUEUES, DEFAULT_MANUAL_RESOLUTION, QUEUE_QUERY_ORDER, QUEUE_RECURRING_SCHEDULE,
    SIGNAL_RESOLVE_MANUAL, SIGNAL_RESOLVE_STALE,
};
use crate::workflows::{PrimaryWorkflow, RecurringPaymentWorkflow};

/// Time zone recorded on recurring payment schedules.
const SCHEDULE_TIME_ZONE: &str = "Asia/Kuala_Lumpur";

/// Concurrent starts while simulating load.
const SIMULATE_START_CONCURRENCY: usize = 64;

/// Order failure escalation: primary retry, stale delay, manual resolution
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Namespace to operate in
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// Root directory for namespace state (overrides ESCALATION_STATE_DIR)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Path to a TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a worker for the escalation queues
    Worker(WorkerArgs),
    /// Start, signal and schedule workflows
    #[command(subcommand)]
    Client(ClientCommand),
    /// Manage namespaces
    #[command(subcommand)]
    Namespace(NamespaceCommand),
    /// Print the version
    Version,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Task queues to serve (default: all)
    #[arg(long, value_delimiter = ',')]
    pub task_queues: Vec<String>,

    /// Instances executing at once (overrides ESCALATION_MAX_CONCURRENT)
    #[arg(long)]
    pub max_concurrent: Option<usize>,
}

/// Tags indexed on started cases.
#[derive(Args, Debug, Clone)]
pub struct CaseTags {
    /// Environment (development/staging/production)
    #[arg(short, long, default_value = "development")]
    pub environment: String,

    /// Business unit
    #[arg(short, long, default_value = "retail")]
    pub business_unit: String,

    /// Priority level (low/normal/high/urgent)
    #[arg(short, long, default_value = "normal")]
    pub priority: String,
}

impl CaseTags {
    fn search_attributes(&self, case_id: &str) -> SearchAttributes {
        SearchAttributes {
            case_id: Some(case_id.to_string()),
            keyword: Some(self.environment.clone()),
            priority: 1,
            business_unit: Some(self.business_unit.clone()),
            priority_label: Some(self.priority.clone()),
            indexed_at: Some(Utc::now()),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Start the primary workflow for one order
    Start {
        /// Order to process (default: random)
        #[arg(short, long)]
        order_id: Option<String>,
        #[command(flatten)]
        tags: CaseTags,
    },
    /// Start random batches of orders every second until interrupted
    SimulatePayment {
        #[command(flatten)]
        tags: CaseTags,
        /// Stop after this many batches
        #[arg(long)]
        batches: Option<u64>,
    },
    /// Resolve a workflow waiting for manual handling
    SignalManual {
        /// Manual workflow id
        #[arg(short, long)]
        workflow_id: String,
        /// Resolution text
        resolution: Option<String>,
    },
    /// Resolve a stale workflow before its retry timer fires
    SignalStale {
        /// Stale workflow id
        #[arg(short, long)]
        workflow_id: String,
        /// Resolution text
        resolution: Option<String>,
    },
    /// Charge a consent every minute
    CreateRecurringPayment {
        /// Consent id, also the schedule id (default: random)
        #[arg(short, long)]
        order_id: Option<String>,
        /// Number of payment terms (0 means unlimited)
        #[arg(short = 'r', long, default_value_t = 0)]
        terms: u32,
        /// Seconds between charges
        #[arg(long, default_value_t = 60)]
        every_secs: u64,
        #[command(flatten)]
        tags: CaseTags,
    },
    /// Stop charging a consent
    CancelRecurringPayment {
        /// Consent id the schedule was created with
        #[arg(short, long)]
        order_id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum NamespaceCommand {
    /// Register a namespace
    Register {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Days closed workflows are kept (0 means 7)
        #[arg(long, default_value_t = 7)]
        retention_days: i64,
    },
    /// List namespaces
    List,
}

/// Resolve configuration layers and run the command.
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }

    match cli.command {
        Command::Worker(args) => {
            if let Some(max) = args.max_concurrent {
                config.worker.max_concurrent = max;
            }
            config.validate()?;
            run_worker(&config, args.task_queues).await
        }
        Command::Client(command) => {
            config.validate()?;
            run_client(&config, command).await
        }
        Command::Namespace(command) => run_namespace(&config, command),
        Command::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Unable to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(config: &AppConfig, task_queues: Vec<String>) -> Result<()> {
    let namespace = app::namespaces(config)
        .info(&config.namespace)
        .with_context(|| format!("Namespace {} is not registered", config.namespace))?;
    let deps = Dependencies::from_config(config);
    let runtime = app::open_runtime(config, app::registry(&deps))?;

    let task_queues = if task_queues.is_empty() {
        ALL_QUEUES.iter().map(|q| q.to_string()).collect()
    } else {
        task_queues
    };
    let options = WorkerOptions::default()
        .with_task_queues(task_queues)
        .with_max_concurrent(config.worker.max_concurrent)
        .with_poll_interval(config.worker.poll_interval())
        .with_retention(namespace.retention())
        .with_schedules(config.worker.run_schedules);

    info!(
        namespace = %config.namespace,
        state_dir = %config.state_dir.display(),
        fail_probability = config.fail_probability,
        "Starting worker, press Ctrl+C to stop"
    );
    Worker::new(runtime, options)
        .run_until(shutdown_signal())
        .await?;
    Ok(())
}

// =============================================================================
// Client
// =============================================================================

fn client_runtime(config: &AppConfig) -> Result<Runtime> {
    app::open_runtime(config, Registry::new())
}

async fn run_client(config: &AppConfig, command: ClientCommand) -> Result<()> {
    let runtime = client_runtime(config)?;
    match command {
        ClientCommand::Start { order_id, tags } => {
            let order_id = order_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            start_order(&runtime, &order_id, &tags).await?;
            Ok(())
        }
        ClientCommand::SimulatePayment { tags, batches } => {
            simulate_payments(&runtime, &tags, config.simulation.max_batch, batches).await
        }
        ClientCommand::SignalManual {
            workflow_id,
            resolution,
        } => send_resolution(&runtime, &workflow_id, SIGNAL_RESOLVE_MANUAL, resolution).await,
        ClientCommand::SignalStale {
            workflow_id,
            resolution,
        } => send_resolution(&runtime, &workflow_id, SIGNAL_RESOLVE_STALE, resolution).await,
        ClientCommand::CreateRecurringPayment {
            order_id,
            terms,
            every_secs,
            tags,
        } => {
            let consent_id = order_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let start = StartOptions::new(consent_id.clone(), QUEUE_RECURRING_SCHEDULE)
                .with_search_attributes(tags.search_attributes(&consent_id));
            let spec = ScheduleSpec::every(Duration::from_secs(every_secs.max(1)))
                .with_remaining_actions(terms)
                .with_time_zone(SCHEDULE_TIME_ZONE);
            let schedule = runtime
                .create_schedule::<RecurringPaymentWorkflow>(&consent_id, start, spec, consent_id.clone())
                .await
                .context("Failed to schedule recurring payment")?;
            info!(
                schedule_id = %schedule.schedule_id,
                next_fire_at = %schedule.next_fire_at,
                terms,
                "Scheduled recurring payment"
            );
            Ok(())
        }
        ClientCommand::CancelRecurringPayment { order_id } => {
            runtime
                .delete_schedule(&order_id)
                .await
                .with_context(|| format!("Unable to cancel recurring payment {order_id}"))?;
            info!(schedule_id = %order_id, "Cancelled recurring payment");
            Ok(())
        }
    }
}

/// Start the primary workflow. Duplicates are logged and skipped.
async fn start_order(runtime: &Runtime, order_id: &str, tags: &CaseTags) -> Result<bool> {
    let workflow_id = primary_id(order_id);
    let options = StartOptions::new(workflow_id.clone(), QUEUE_QUERY_ORDER)
        .with_search_attributes(tags.search_attributes(order_id));
    match runtime
        .start_workflow::<PrimaryWorkflow>(options, order_id.to_string())
        .await
    {
        Ok(ack) => {
            info!(workflow_id = %ack.instance_id, run_id = %ack.run_id, "Started workflow");
            Ok(true)
        }
        Err(RuntimeError::AlreadyStarted { instance_id }) => {
            warn!(order_id, workflow_id = %instance_id, "Order is already being processed, skipping");
            Ok(false)
        }
        Err(e) => Err(e).with_context(|| format!("Unable to start workflow {workflow_id}")),
    }
}

async fn simulate_payments(
    runtime: &Runtime,
    tags: &CaseTags,
    max_batch: usize,
    batches: Option<u64>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut batch = 0u64;
    let mut total = 0usize;
    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Received interrupt, stopping simulation");
                break;
            }
            _ = ticker.tick() => {}
        }
        batch += 1;
        let count = rand::thread_rng().gen_range(1..=max_batch.max(1));
        info!(batch, count, "Processing batch");

        let started = stream::iter(0..count)
            .map(move |_| async move {
                let order_id = uuid::Uuid::new_v4().to_string();
                match start_order(runtime, &order_id, tags).await {
                    Ok(started) => started,
                    Err(e) => {
                        warn!(order_id = %order_id, error = %e, "Failed to start workflow");
                        false
                    }
                }
            })
            .buffer_unordered(SIMULATE_START_CONCURRENCY)
            .fold(0usize, |n, started| async move { n + usize::from(started) })
            .await;
        total += started;
        info!(batch, started, total, "Batch submitted");

        if batches.is_some_and(|limit| batch >= limit) {
            break;
        }
    }
    info!(total, "Total workflows started");
    Ok(())
}

async fn send_resolution(
    runtime: &Runtime,
    workflow_id: &str,
    channel: &str,
    resolution: Option<String>,
) -> Result<()> {
    let resolution = resolution.unwrap_or_else(|| DEFAULT_MANUAL_RESOLUTION.to_string());
    runtime
        .signal(workflow_id, channel, &resolution)
        .await
        .with_context(|| format!("Unable to signal workflow {workflow_id}"))?;
    info!(workflow_id, channel, resolution = %resolution, "Signal sent");
    Ok(())
}

// =============================================================================
// Namespaces
// =============================================================================

fn run_namespace(config: &AppConfig, command: NamespaceCommand) -> Result<()> {
    let manager = app::namespaces(config);
    match command {
        NamespaceCommand::Register {
            name,
            description,
            retention_days,
        } => {
            let info = manager
                .register(&name, &description, retention_days)
                .with_context(|| format!("Unable to register namespace {name}"))?;
            info!(
                namespace = %info.name,
                retention_days = info.retention_days,
                "Namespace registered"
            );
        }
        NamespaceCommand::List => {
            for info in manager.list().context("Unable to list namespaces")? {
                println!(
                    "{}\tretention={}d\t{}",
                    info.name, info.retention_days, info.description
                );
            }
        }
    }
    Ok(())
}
