//! `agentcore` CLI: start the composed orchestration core, inspect its
//! status, submit ad hoc tasks, or manage scheduled entries (spec §4.11).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sysinfo::{PidExt, ProcessExt, SystemExt};
use tracing::{error, info};

use agentcore::composition::Orchestrator;
use agentcore::config::CoreConfig;
use agentcore::scheduler::schedule::{ScheduleKind, TaskTemplate};
use agentcore::sentinel;
use agentcore::task::descriptor::{ResourceRequirements, TaskDescriptor, TaskKind};
use agentcore::task::manager::TaskManager;

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_ALREADY_RUNNING: u8 = 3;

#[derive(Parser)]
#[command(name = "agentcore", about = "Parallel task orchestration core")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "agentcore.json", env = "AGENTCORE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the composed core and run until shutdown.
    Run,
    /// Print a JSON snapshot of the task manager's status.
    Status,
    /// Enqueue one ad hoc task.
    Submit {
        #[arg(value_enum)]
        kind: SubmitKind,
        /// Script path, function name, or command program.
        payload: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        #[arg(long, default_value = "utility")]
        task_type: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long, default_value_t = 0)]
        timeout_seconds: u64,
    },
    /// Manage scheduled entries.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum SubmitKind {
    Script,
    Function,
    Command,
}

#[derive(Subcommand)]
enum ScheduleAction {
    List,
    Add {
        name: String,
        #[arg(long, default_value_t = 60)]
        interval_minutes: i64,
    },
    Enable { id: String },
    Disable { id: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    let config = match CoreConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    runtime.block_on(async { dispatch(cli.command, config).await })
}

async fn dispatch(command: Command, config: CoreConfig) -> ExitCode {
    match command {
        Command::Run => run_core(config).await,
        Command::Status => print_status(config).await,
        Command::Submit {
            kind,
            payload,
            args,
            task_type,
            priority,
            timeout_seconds,
        } => submit_task(config, kind, payload, args, task_type, priority, timeout_seconds).await,
        Command::Schedule { action } => manage_schedule(config, action).await,
    }
}

async fn run_core(config: CoreConfig) -> ExitCode {
    let pid_file = PathBuf::from(&config.state_root).join("agentcore.pid");
    if let Some(existing_pid) = read_live_pid(&pid_file) {
        error!(pid = existing_pid, "another instance is already running");
        return ExitCode::from(EXIT_ALREADY_RUNNING);
    }
    if let Err(e) = sentinel::atomic_write(&pid_file, std::process::id().to_string().as_bytes()) {
        error!(error = %e, "failed to write pid file");
        return ExitCode::from(EXIT_FAILURE);
    }

    let orchestrator = match Orchestrator::build(config) {
        Ok(o) => Arc::new(o),
        Err(e) => {
            error!(error = %e, "failed to build orchestration core");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let shutdown_handle = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_handle.signal_shutdown();
        }
    });

    if let Err(e) = orchestrator.run().await {
        error!(error = %e, "core exited with error");
        let _ = std::fs::remove_file(&pid_file);
        return ExitCode::from(EXIT_FAILURE);
    }
    let _ = std::fs::remove_file(&pid_file);
    ExitCode::from(EXIT_SUCCESS)
}

fn read_live_pid(pid_file: &PathBuf) -> Option<u32> {
    let bytes = std::fs::read(pid_file).ok()?;
    let pid: u32 = String::from_utf8(bytes).ok()?.trim().parse().ok()?;
    let mut sys = sysinfo::System::new();
    sys.refresh_processes();
    sys.process(sysinfo::Pid::from_u32(pid)).map(|p| p.pid().as_u32())
}

async fn print_status(config: CoreConfig) -> ExitCode {
    let orchestrator = match Orchestrator::build(config) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "failed to build orchestration core");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let status = orchestrator.manager.status();
    match serde_json::to_string_pretty(&status) {
        Ok(json) => {
            println!("{json}");
            ExitCode::from(EXIT_SUCCESS)
        }
        Err(e) => {
            error!(error = %e, "failed to serialize status");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Appends to the `automation_queue` boundary file (spec §6) rather than
/// building a full core: this process and `agentcore run` are almost always
/// separate, and a descriptor only reaches the running core's queue if it
/// lands in the file that core's Task Manager polls.
#[allow(clippy::too_many_arguments)]
async fn submit_task(
    config: CoreConfig,
    kind: SubmitKind,
    payload: String,
    args: Vec<String>,
    task_type: String,
    priority: i64,
    timeout_seconds: u64,
) -> ExitCode {
    let task_kind = match kind {
        SubmitKind::Script => TaskKind::Script { path: payload, args },
        SubmitKind::Function => TaskKind::Function { name: payload, args },
        SubmitKind::Command => TaskKind::Command { program: payload, args },
    };

    let descriptor = TaskDescriptor {
        id: agentcore::ids::Id::new(),
        kind: task_kind,
        task_type,
        priority,
        submitted_at: chrono::Utc::now(),
        deadline: None,
        timeout_seconds,
        requirements: ResourceRequirements::default(),
    };

    let queue_path = PathBuf::from(&config.state_root).join("automation_queue.json");
    info!(task_id = %descriptor.id, path = %queue_path.display(), "appending task to automation queue");
    match TaskManager::append_to_boundary_file(&queue_path, &descriptor) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            error!(error = %e, "failed to append to automation queue");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn manage_schedule(config: CoreConfig, action: ScheduleAction) -> ExitCode {
    let orchestrator = match Orchestrator::build(config) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "failed to build orchestration core");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match action {
        ScheduleAction::List => {
            let entries = orchestrator.scheduler.list();
            match serde_json::to_string_pretty(&entries) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    error!(error = %e, "failed to serialize schedule");
                    return ExitCode::from(EXIT_FAILURE);
                }
            }
        }
        ScheduleAction::Add { name, interval_minutes } => {
            let template = TaskTemplate {
                kind: TaskKind::Command {
                    program: "true".to_string(),
                    args: vec![],
                },
                task_type: "utility".to_string(),
                priority: 0,
                timeout_seconds: 0,
                requirements: ResourceRequirements::default(),
            };
            match orchestrator
                .scheduler
                .add(name, template, ScheduleKind::Interval { minutes: interval_minutes })
            {
                Ok(id) => println!("{id}"),
                Err(e) => {
                    error!(error = %e, "failed to add scheduled entry");
                    return ExitCode::from(EXIT_FAILURE);
                }
            }
        }
        ScheduleAction::Enable { id } => {
            if !set_schedule_enabled(&orchestrator, &id, true) {
                return ExitCode::from(EXIT_FAILURE);
            }
        }
        ScheduleAction::Disable { id } => {
            if !set_schedule_enabled(&orchestrator, &id, false) {
                return ExitCode::from(EXIT_FAILURE);
            }
        }
    }
    ExitCode::from(EXIT_SUCCESS)
}

fn set_schedule_enabled(orchestrator: &Orchestrator, id: &str, enabled: bool) -> bool {
    match orchestrator.scheduler.set_enabled(&agentcore::ids::Id(id.to_string()), enabled) {
        Ok(found) => {
            if !found {
                error!(id, "scheduled entry not found");
            }
            found
        }
        Err(e) => {
            error!(error = %e, "failed to update scheduled entry");
            false
        }
    }
}
