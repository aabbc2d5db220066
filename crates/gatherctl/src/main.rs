#![forbid(unsafe_code)]

//! `must-gather`: collect a diagnostic bundle from a cluster into a local directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use gather_core::{new_run_id, GatherRequest, RunReport};
use gather_engine::{BackendKind, GatherConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "must-gather", version, about = "Collect a cluster diagnostic bundle")]
struct Args {
    /// Local directory to write the bundle into. Must be empty or absent.
    #[arg(long)]
    dest_dir: Option<PathBuf>,

    /// Directory inside the workload the collector writes to.
    #[arg(long)]
    source_dir: Option<String>,

    /// Collection image. Defaults to the cluster's must-gather image.
    #[arg(long)]
    image: Option<String>,

    /// Seconds the collector may run before it is terminated.
    #[arg(long)]
    timeout: Option<u64>,

    /// Run the workload on this node instead of any control-plane node.
    #[arg(long)]
    node_name: Option<String>,

    /// kubernetes | local
    #[arg(long)]
    backend: Option<BackendKind>,

    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// kubeconfig context to use.
    #[arg(long)]
    context: Option<String>,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the run report as JSON to this path.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log filter (env-filter syntax). Falls back to RUST_LOG, then `info`.
    #[arg(long)]
    log: Option<String>,

    /// Custom collection command, replacing the default collection script.
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => GatherConfig::load_from(path)?,
        None => GatherConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.run.backend = backend;
    }
    if let Some(secs) = args.timeout {
        config.run.timeout_secs = secs;
    }
    if let Some(dir) = &args.source_dir {
        config.run.source_dir = dir.clone();
    }
    if args.kubeconfig.is_some() {
        config.kubernetes.kubeconfig = args.kubeconfig.clone();
    }
    if args.context.is_some() {
        config.kubernetes.context = args.context.clone();
    }

    let dest_dir = args
        .dest_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("must-gather.local.{}", new_run_id())));

    let mut request = GatherRequest::new(dest_dir)
        .with_source_dir(config.run.source_dir.clone())
        .with_timeout(Duration::from_secs(config.run.timeout_secs));
    if let Some(image) = &args.image {
        request = request.with_image(image.clone());
    }
    if let Some(node) = &args.node_name {
        request = request.with_node_name(node.clone());
    }
    if !args.command.is_empty() {
        request = request.with_command(args.command.clone());
    }

    let interrupt = CancellationToken::new();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping gather");
                interrupt.cancel();
            }
        });
    }

    let report = gather_engine::gather(request, config, interrupt).await;

    let code = finish(&report, args.report.as_deref(), &mut std::io::stdout());
    std::process::exit(code);
}

/// Print the summary, then write the JSON report. A report that cannot be
/// written is logged; the exit status always follows the run result.
fn finish(report: &RunReport, report_path: Option<&Path>, out: &mut impl Write) -> i32 {
    if let Err(e) = out.write_all(report.summary().as_bytes()).and_then(|()| out.flush()) {
        tracing::warn!(error = %e, "could not print the summary");
    }
    if let Some(path) = report_path {
        if let Err(e) = write_report(report, path) {
            tracing::warn!(error = %format!("{e:#}"), "report not written");
        }
    }
    report.exit_code()
}

fn write_report(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(path, json).with_context(|| format!("write report {}", path.display()))
}
