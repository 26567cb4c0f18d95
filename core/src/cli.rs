use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::{Application, InitBuilder};
use crate::controller::Outcome;
use crate::identity::parse_logical_timestamp;
use crate::store::RunStore;
use crate::types::{RunListFilter, RunRecord, RunState};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay - trigger workflow runs and wait on them", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run database migrations
    Migrate,

    /// Register a workflow so it can be triggered
    Register {
        workflow_id: String,
    },

    /// Trigger a run of a workflow
    Trigger {
        workflow_id: String,

        /// Run id to use verbatim
        #[arg(long)]
        run_id: Option<String>,

        /// Logical date (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        logical_date: Option<String>,

        /// Conf payload (JSON object)
        #[arg(long)]
        conf: Option<String>,

        /// Reset an existing run with the same identity instead of failing
        #[arg(long)]
        reset: bool,

        /// Wait for the run to reach an allowed state
        #[arg(long)]
        wait: bool,

        /// Seconds between state checks (default from config)
        #[arg(long)]
        poll_interval: Option<u64>,

        /// State that completes the wait (repeatable, default: success)
        #[arg(long = "allowed-state")]
        allowed_states: Vec<RunState>,

        /// State that fails the wait (repeatable, default: failed)
        #[arg(long = "failed-state")]
        failed_states: Vec<RunState>,

        /// Park the wait with the resumption worker instead of blocking
        #[arg(long)]
        deferred: bool,

        /// Overall wait timeout in seconds (default from config)
        #[arg(long)]
        timeout: Option<u64>,

        /// Audit source recorded for the trigger
        #[arg(long, default_value = crate::controller::DEFAULT_TRIGGER_SOURCE)]
        triggered_by: String,
    },

    /// Show one run
    Status {
        workflow_id: String,
        run_id: String,
    },

    /// List runs of a workflow
    List {
        workflow_id: String,

        /// Filter by state
        #[arg(short = 's', long = "state")]
        state: Option<RunState>,

        /// Number of results (default: 20)
        #[arg(short = 'l', long = "limit", default_value = "20")]
        limit: i64,
    },

    /// Set the state of a run, as the execution engine would
    SetState {
        workflow_id: String,
        run_id: String,
        state: RunState,
    },

    /// Show a parked deferred wait and how it resolved
    WaitStatus {
        wait_id: Uuid,
    },

    /// Resume parked deferred waits until interrupted
    ResumeWorker,
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    let mut init = InitBuilder::new().auto_migrate(matches!(cli.command, Commands::Migrate));
    if let Some(path) = cli.config {
        init = init.config_path(path);
    }
    if let Some(url) = cli.database_url {
        init = init.database_url(url);
    }
    let app = init.init().await?;

    match cli.command {
        Commands::Migrate => {
            println!("Migrations complete");
        }

        Commands::Register { workflow_id } => {
            app.store.register_workflow(&workflow_id).await?;
            println!("Registered workflow {}", workflow_id);
        }

        Commands::Trigger {
            workflow_id,
            run_id,
            logical_date,
            conf,
            reset,
            wait,
            poll_interval,
            allowed_states,
            failed_states,
            deferred,
            timeout,
            triggered_by,
        } => {
            let mut request = app
                .trigger_request(workflow_id)
                .reset(reset)
                .wait_for_completion(wait)
                .deferred(deferred)
                .triggered_by(triggered_by);

            if let Some(run_id) = run_id {
                request = request.run_id(run_id);
            }
            if let Some(date) = logical_date {
                request = request.logical_timestamp(parse_logical_timestamp(&date)?);
            }
            if let Some(conf) = conf {
                let value: serde_json::Value =
                    serde_json::from_str(&conf).context("--conf is not valid JSON")?;
                request = request.conf(&value);
            }
            if let Some(secs) = poll_interval {
                request = request.poll_interval(Duration::from_secs(secs));
            }
            if let Some(secs) = timeout {
                request = request.timeout(Some(Duration::from_secs(secs)));
            }
            if !allowed_states.is_empty() {
                request = request.allowed_states(allowed_states);
            }
            if !failed_states.is_empty() {
                request = request.failed_states(failed_states);
            }

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            match app.controller.trigger_with_cancel(request, &cancel).await? {
                Outcome::Triggered(run) => {
                    println!("Triggered");
                    print_run(&app, &run);
                }
                Outcome::Completed(run) => {
                    println!("Completed");
                    print_run(&app, &run);
                }
                Outcome::Deferred { wait_id, wait } => {
                    println!("Deferred as wait {}; resume with `relay resume-worker`", wait_id);
                    println!("Check with `relay wait-status {}`", wait_id);
                    println!("{}", serde_json::to_string_pretty(&wait)?);
                }
            }
        }

        Commands::Status { workflow_id, run_id } => match app.store.get_run(&workflow_id, &run_id).await? {
            Some(run) => {
                print_run(&app, &run);
                if !run.conf.is_empty() {
                    println!("\nConf:");
                    println!("  {}", serde_json::Value::Object(run.conf.clone()));
                }
                let tasks = app.store.task_instances(&workflow_id, &run_id).await?;
                if !tasks.is_empty() {
                    println!("\nTasks:");
                    for task in tasks {
                        println!("  {} (try {}): {}", task.task_id, task.try_number, task.state);
                    }
                }
            }
            None => {
                anyhow::bail!("Run {} of workflow {} not found", run_id, workflow_id);
            }
        },

        Commands::List {
            workflow_id,
            state,
            limit,
        } => {
            let runs = app
                .store
                .list_runs(RunListFilter {
                    workflow_id,
                    state,
                    limit: Some(limit),
                })
                .await?;

            if runs.is_empty() {
                println!("No runs found");
            } else {
                println!("{:<45} {:<10} {:<10} {:<26}", "RUN ID", "KIND", "STATE", "LOGICAL DATE");
                println!("{}", "-".repeat(94));
                for run in runs {
                    println!(
                        "{:<45} {:<10} {:<10} {:<26}",
                        run.run_id,
                        run.run_kind,
                        run.state,
                        run.logical_timestamp.format("%Y-%m-%d %H:%M:%S%:z")
                    );
                }
            }
        }

        Commands::SetState {
            workflow_id,
            run_id,
            state,
        } => {
            if app.store.set_state(&workflow_id, &run_id, state).await? {
                println!("Run {} is now {}", run_id, state);
            } else {
                anyhow::bail!("Run {} of workflow {} not found", run_id, workflow_id);
            }
        }

        Commands::WaitStatus { wait_id } => match app.scheduler.status(wait_id).await? {
            Some(parked) => {
                println!("Wait: {}", parked.id);
                println!("Workflow: {}", parked.wait.key.workflow_id);
                println!("Run: {}", parked.wait.key.run_id);
                println!("Status: {}", parked.status);
                if let Some(deadline) = parked.wait.deadline {
                    println!("Deadline: {}", deadline);
                }
                if let Some(error) = parked.error {
                    println!("Error: {}", error);
                }
            }
            None => {
                anyhow::bail!("Deferred wait {} not found", wait_id);
            }
        },

        Commands::ResumeWorker => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            app.resumption_worker().run(cancel).await?;
        }
    }

    Ok(())
}

fn print_run(app: &Application, run: &RunRecord) {
    println!("Workflow: {}", run.workflow_id);
    println!("Run: {}", run.run_id);
    println!("Kind: {}", run.run_kind);
    println!("State: {}", run.state);
    println!("Logical date: {}", run.logical_timestamp);
    println!("External trigger: {}", run.external_trigger);
    println!("Link: {}", app.controller.extra_link(&run.identity()).url);
}
