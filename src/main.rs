//! lfr-manager: control loop for log-file-reader workloads
//!
//! - `lfr-manager run` - Reconcile, scale and self-heal until stopped
//! - `lfr-manager validate` - Check a desired-state file and print a summary
//! - `lfr-manager plan` - Print the actions the next cycle would take

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lfr_manager::cluster::KubeClusterClient;
use lfr_manager::config::{
    ControllerSettings, DesiredStateProvider, FileDesiredStateProvider, OrphanPolicy,
    ProbeSettings, RecoverySettings, WorkloadSettings,
};
use lfr_manager::controller::{Collaborators, ControlLoopDriver, MetricsSink, PrometheusMetrics};
use lfr_manager::model::DesiredState;
use lfr_manager::probe::HttpProber;
use lfr_manager::rest_api;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "lfr-manager")]
#[command(about = "Reconciles, scales and self-heals LFR workloads", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Desired-state file
    #[arg(short, long, global = true, env = "LFR_CONFIG", default_value = "config/lfr.yaml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, env = "LFR_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop until interrupted
    Run {
        #[command(flatten)]
        settings: SettingsArgs,

        /// Port serving /metrics and /health
        #[arg(long, env = "LFR_METRICS_PORT", default_value_t = 8000)]
        metrics_port: u16,
    },
    /// Validate the desired-state file
    Validate,
    /// Show the actions the next cycle would take, without applying them
    Plan {
        #[command(flatten)]
        settings: SettingsArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct SettingsArgs {
    /// Seconds between cycles
    #[arg(long, env = "LFR_CYCLE_INTERVAL", default_value_t = 30)]
    cycle_interval: u64,

    /// Seconds to wait after a failed cycle
    #[arg(long, env = "LFR_ERROR_BACKOFF", default_value_t = 60)]
    error_backoff: u64,

    /// Restarts per recovery episode
    #[arg(long, env = "LFR_MAX_RECOVERY_ATTEMPTS", default_value_t = 3)]
    max_recovery_attempts: u32,

    /// Seconds to wait after a restart before re-checking health
    #[arg(long, env = "LFR_SETTLE_DELAY", default_value_t = 10)]
    settle_delay: u64,

    /// Seconds between failed recovery attempts
    #[arg(long, env = "LFR_RETRY_DELAY", default_value_t = 5)]
    retry_delay: u64,

    /// Recovery tasks allowed to run at once
    #[arg(long, env = "LFR_MAX_CONCURRENT_RECOVERIES", default_value_t = 4)]
    max_concurrent_recoveries: usize,

    /// Port the LFR health endpoint listens on
    #[arg(long, env = "LFR_PROBE_PORT", default_value_t = 8080)]
    probe_port: u16,

    /// Seconds before a health probe times out
    #[arg(long, env = "LFR_PROBE_TIMEOUT", default_value_t = 5)]
    probe_timeout: u64,

    /// Container image for new workloads
    #[arg(long, env = "LFR_IMAGE", default_value = "lmm-lfr:latest")]
    image: String,

    /// Per-member CPU request in millicores
    #[arg(long, env = "LFR_CPU_REQUEST", default_value_t = 100)]
    cpu_request: u32,

    /// Per-member memory request
    #[arg(long, env = "LFR_MEMORY_REQUEST", default_value = "128Mi")]
    memory_request: String,

    /// Average CPU (percent of request) that triggers a scale-up
    #[arg(long, env = "LFR_CPU_THRESHOLD", default_value_t = 80.0)]
    cpu_threshold: f64,

    /// What to do with LFR workloads no source declares
    #[arg(long, env = "LFR_ORPHAN_POLICY", value_enum, default_value = "report")]
    orphan_policy: OrphanPolicy,
}

impl SettingsArgs {
    fn to_settings(&self) -> ControllerSettings {
        ControllerSettings {
            cycle_interval: Duration::from_secs(self.cycle_interval),
            error_backoff: Duration::from_secs(self.error_backoff),
            max_concurrent_recoveries: self.max_concurrent_recoveries,
            cpu_scale_threshold_percent: self.cpu_threshold,
            orphan_policy: self.orphan_policy,
            recovery: RecoverySettings {
                max_attempts: self.max_recovery_attempts,
                settle_delay: Duration::from_secs(self.settle_delay),
                retry_delay: Duration::from_secs(self.retry_delay),
            },
            probe: ProbeSettings {
                port: self.probe_port,
                timeout: Duration::from_secs(self.probe_timeout),
            },
            workload: WorkloadSettings {
                image: self.image.clone(),
                health_port: self.probe_port,
                cpu_request_millicores: self.cpu_request,
                memory_request: self.memory_request.clone(),
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let provider = Arc::new(FileDesiredStateProvider::new(&cli.config));
    let desired = provider
        .load()
        .await
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate => {
            print_summary(&desired);
            Ok(())
        }
        Commands::Plan { settings } => {
            let settings = checked_settings(&settings)?;
            let metrics = Arc::new(PrometheusMetrics::new());
            let driver = build_driver(provider, &desired, settings, metrics).await?;
            let plan = driver.plan().await.context("Failed to plan cycle")?;
            if plan.actions.is_empty() {
                println!(
                    "No changes: {} workload(s) match the desired state",
                    plan.observed.len()
                );
            }
            for action in &plan.actions {
                println!("{}", action);
            }
            Ok(())
        }
        Commands::Run {
            settings,
            metrics_port,
        } => {
            let settings = checked_settings(&settings)?;
            let metrics = Arc::new(PrometheusMetrics::new());
            let mut driver = build_driver(provider, &desired, settings, metrics.clone()).await?;
            let listener = rest_api::bind(metrics_port)
                .await
                .with_context(|| format!("Failed to bind metrics port {}", metrics_port))?;

            let cancel = CancellationToken::new();
            let server = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let result = rest_api::serve(listener, metrics, cancel.clone()).await;
                    if let Err(e) = &result {
                        error!("Metrics server failed, stopping: {}", e);
                        cancel.cancel();
                    }
                    result
                })
            };
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    shutdown_signal().await;
                    info!("Shutdown signal received");
                    cancel.cancel();
                });
            }

            driver.run(cancel.clone()).await;
            cancel.cancel();
            server
                .await
                .context("Metrics server task failed")?
                .context("Metrics server stopped")?;
            Ok(())
        }
    }
}

fn checked_settings(args: &SettingsArgs) -> Result<ControllerSettings> {
    let settings = args.to_settings();
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid settings: {}", e))?;
    Ok(settings)
}

async fn build_driver(
    provider: Arc<FileDesiredStateProvider>,
    desired: &DesiredState,
    settings: ControllerSettings,
    metrics: Arc<dyn MetricsSink>,
) -> Result<ControlLoopDriver> {
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let cluster = Arc::new(KubeClusterClient::new(client, &desired.namespace));
    let prober = Arc::new(HttpProber::new(settings.probe.port)?);

    Ok(ControlLoopDriver::new(
        &desired.namespace,
        Collaborators {
            provider,
            cluster,
            prober,
            metrics,
        },
        settings,
    ))
}

fn print_summary(desired: &DesiredState) {
    println!("Namespace: {}", desired.namespace);
    println!("{:<30} {:<8} {:<5} {:<5}", "SOURCE", "ENABLED", "MIN", "MAX");
    for source in &desired.log_sources {
        let max = source
            .max_replicas()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<30} {:<8} {:<5} {:<5}",
            source.name,
            source.enabled,
            source.min_replicas(),
            max
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
