//! RunPod Node Manager CLI.
//!
//! Manages one pod: create, start (auto-restores credentials), stop (backs
//! up first), terminate, list, backup, restore, connect and clean.
//!
//! ## Usage
//!
//! 1. Create a `.env` file with `RUNPOD_API_KEY` (and optionally `SSH_KEY_PATH`)
//! 2. Run: `runpod_node_manager <command>`

#![allow(clippy::print_stdout)] // The CLI reports results on stdout

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runpod_node_manager::runpod_orchestrator::{ConnectReport, RestoreReport, StartReport};
use runpod_node_manager::{
    AssumeYes, Collaborators, Confirmation, CreateOptions, ManagerConfig, PodError, PodId,
    RestoreOutcome, RunpodClient, RunpodClientConfig, RunpodOrchestrator, StartRestore,
    StopBackup, TransportKind,
};

/// Lifecycle manager for a RunPod GPU node
#[derive(Parser)]
#[command(name = "runpod_node_manager")]
#[command(about = "Create, start, stop and back up a RunPod GPU node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new pod (falls back through GPU types)
    Create {
        /// Pod name
        #[arg(long)]
        name: Option<String>,

        /// GPU type tried first
        #[arg(long)]
        gpu: Option<String>,

        /// Volume and container disk size in GB
        #[arg(long)]
        disk: Option<u32>,

        /// Use secure cloud instead of community cloud
        #[arg(long)]
        secure: bool,
    },

    /// Start the pod and restore backed up credentials
    Start,

    /// Back up credentials, then stop the pod
    Stop {
        /// Stop even if the backup fails, without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Terminate the pod and forget its cached state
    Terminate,

    /// List pods on the account
    List,

    /// Copy credentials from the pod to the backup directory
    Backup,

    /// Copy backed up credentials to the pod and restart the node
    Restore,

    /// Show SSH connection details
    #[command(alias = "ssh")]
    Connect {
        /// Resolve even if the pod is not running
        #[arg(long)]
        force: bool,
    },

    /// Forget the saved pod identity and connection
    Clean,
}

/// Reads y/n from the terminal.
struct StdinConfirm;

impl Confirmation for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{prompt} ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runpod_node_manager=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("next step: {}", e.remediation());
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<(), PodError> {
    let cfg = ManagerConfig::from_env()?;

    let confirm: Arc<dyn Confirmation> = match &command {
        Commands::Stop { yes: true } => Arc::new(AssumeYes),
        _ => Arc::new(StdinConfirm),
    };
    let deps = Collaborators::system(&cfg, confirm);
    let manager = RunpodOrchestrator::new(cfg, deps);

    match command {
        Commands::Create {
            name,
            gpu,
            disk,
            secure,
        } => {
            let report = manager
                .create(CreateOptions {
                    name,
                    gpu_type: gpu,
                    disk_gb: disk,
                    secure_cloud: secure,
                })
                .await?;
            println!("Pod created: {}", report.pod_id);
            println!("  GPU: {}", report.gpu_type);
            println!("  Status: {}", report.detail.status);
            println!("\nNext: `runpod_node_manager restore` to place your credentials.");
        }
        Commands::Start => {
            let pod_id = manager.current_pod_id().await?;
            let report = manager.start(&pod_id).await?;
            print_start(&report);
        }
        Commands::Stop { .. } => {
            let pod_id = manager.current_pod_id().await?;
            match manager.stop(&pod_id).await? {
                StopBackup::Saved(paths) => {
                    println!("Backup saved ({} files).", paths.len());
                }
                StopBackup::FailedConfirmed(reason) => {
                    println!("Backup failed ({reason}); stopping anyway as confirmed.");
                }
                StopBackup::Skipped(status) => {
                    println!("Pod is {status}; no backup taken.");
                }
            }
            println!("Pod {pod_id} stopped.");
        }
        Commands::Terminate => {
            let pod_id = manager.current_pod_id().await?;
            manager.terminate(&pod_id).await?;
            println!("Pod {pod_id} terminated.");
        }
        Commands::List => list(&manager).await?,
        Commands::Backup => {
            let pod_id = manager.current_pod_id().await?;
            let paths = manager.backup(&pod_id).await?;
            println!("Backup complete:");
            for path in paths {
                println!("  {}", path.display());
            }
        }
        Commands::Restore => {
            let pod_id = manager.current_pod_id().await?;
            match manager.restore(&pod_id).await? {
                RestoreReport::ViaStart(report) => print_start(&report),
                RestoreReport::Direct(outcome) => print_restore(&outcome),
            }
        }
        Commands::Connect { force } => {
            let pod_id = manager.current_pod_id().await?;
            let report = manager.connect(&pod_id, force).await?;
            print_connect(&report);
        }
        Commands::Clean => {
            manager.clean()?;
            println!("Local pod state cleaned (SSH key setting kept).");
        }
    }

    Ok(())
}

async fn list(manager: &RunpodOrchestrator) -> Result<(), PodError> {
    let api = RunpodClient::new(RunpodClientConfig::from_manager(manager.config()))?;

    let ids: Vec<PodId> = match api.list_pods().await {
        Ok(pods) => {
            if pods.is_empty() {
                println!("No pods.");
            }
            for pod in &pods {
                println!(
                    "{:<16} {:<20} {:<12} {:<24} {}",
                    pod.id,
                    pod.name,
                    pod.status,
                    pod.gpu.as_deref().unwrap_or("-"),
                    pod.cost_per_hr
                        .map_or_else(|| "-".to_string(), |c| format!("${c:.3}/hr"))
                );
            }
            pods.into_iter().map(|p| p.id).collect()
        }
        Err(e) => {
            warn!(error = %e, "API listing failed; falling back to runpodctl");
            let ids = manager.list_pod_ids().await?;
            if ids.is_empty() {
                println!("No pods.");
            }
            for id in &ids {
                println!("{id}");
            }
            ids
        }
    };

    if let Some(first) = ids.first()
        && manager.adopt(first)?
    {
        println!("\nSaved {first} as the managed pod.");
    }
    Ok(())
}

fn print_start(report: &StartReport) {
    if report.already_running {
        println!("Pod {} is already running.", report.pod_id);
        if matches!(report.restore, StartRestore::Skipped { backup_available: true }) {
            println!("Local backup found; run `runpod_node_manager restore` to push it to the pod.");
        }
        return;
    }
    println!("Pod {} is running.", report.pod_id);
    if let Some(conn) = &report.connection {
        println!("  SSH: {}", conn.endpoint.ssh_command());
    }
    match &report.restore {
        StartRestore::Skipped { .. } => {}
        StartRestore::NoBackup => println!("No local backup; nothing restored."),
        StartRestore::ConnectionUnavailable(reason) => {
            println!("SSH not reachable yet ({reason}).");
            println!("Run `runpod_node_manager restore` once the pod accepts connections.");
        }
        StartRestore::Restored(outcome) => print_restore(outcome),
        StartRestore::Failed(reason) => {
            println!("Restore failed: {reason}");
            println!("Run `runpod_node_manager restore` to retry.");
        }
    }
}

fn print_restore(outcome: &RestoreOutcome) {
    match outcome {
        RestoreOutcome::Restored {
            restart_script_ok: true,
        } => println!("Credentials restored and node restarted."),
        RestoreOutcome::Restored {
            restart_script_ok: false,
        } => {
            println!("Credentials restored; the restart script reported a problem.");
            println!("Check the node with `runpod_node_manager connect`.");
        }
        RestoreOutcome::PartialSuccess { reason } => {
            println!("Partial success: {reason}.");
            println!("Restart the node manually after `runpod_node_manager connect`.");
        }
    }
}

fn print_connect(report: &ConnectReport) {
    let ep = &report.resolution.endpoint;
    println!("Pod {} ({})", report.pod_id, report.status);
    println!("  transport: {}", ep.transport);
    println!("  ssh: {}", ep.ssh_command());
    if let Some(scp) = &report.scp_template {
        println!("  scp: {scp}");
    }
    if ep.transport == TransportKind::Tunnel {
        println!("  note: file copy is not available over the tunnel");
    }
    if !ep.is_validated() {
        println!("  note: this endpoint is a guess and has not been verified");
    }
    println!("  web: {}", report.web_url);
}
