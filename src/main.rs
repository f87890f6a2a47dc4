// Main entrypoint for the meshd orchestrator node.

mod app;
mod chain;
mod config;
mod controller;
mod health;
mod http;
#[path = "k8s/probe/liveness/mod.rs"]
mod liveness;
mod manifest;
mod metrics;
mod middleware;
mod model;
mod orchestrator;
mod ports;
mod registry;
mod shutdown;
mod supervisor;

use crate::config::{Config, ConfigTrait};
use crate::manifest::Manifest;
use crate::shutdown::GracefulShutdown;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "cfg/meshd.cfg.yaml";
const CONFIG_PATH_LOCAL: &str = "cfg/meshd.cfg.local.yaml";

const EXIT_FAILED_INSTANCES: u8 = 1;
const EXIT_STARTUP: u8 = 2;

/// meshd - service orchestrator node with self-healing and chain-state sync
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Custom config file path
    #[arg(short, long, value_name = "FILE")]
    cfg: Option<PathBuf>,

    /// Service manifest path, overrides the one from config
    #[arg(short, long, value_name = "FILE")]
    manifest: Option<PathBuf>,
}

/// Worker threads for the runtime; 0 in config means all cores.
fn num_workers(cfg: &Config) -> usize {
    let cores = cfg.runtime().num_cpus;
    if cores == 0 {
        let cores = num_cpus::get();
        info!(
            component = "main",
            event = "num_cpus_configured",
            num_cpus = cores,
            "Available cores value configured (using all available cores)"
        );
        cores
    } else {
        warn!(
            component = "main",
            event = "num_cpus_configured",
            num_cpus = cores,
            "Available cores value configured"
        );
        cores
    }
}

/// Loads the configuration struct from YAML file.
/// Tries local config first, then falls back to default config.
fn load_cfg(path: Option<PathBuf>) -> Result<Config> {
    if let Some(custom_path) = path {
        return Config::load(&custom_path)
            .with_context(|| format!("failed to load custom config from {:?}", custom_path));
    }

    match Config::load(PathBuf::from(CONFIG_PATH_LOCAL)) {
        Ok(cfg) => Ok(cfg),
        Err(_) => Config::load(PathBuf::from(CONFIG_PATH))
            .with_context(|| format!("failed to load config from {}", CONFIG_PATH)),
    }
}

fn load_manifest(cfg: &Config, path: Option<PathBuf>) -> Result<Manifest> {
    let path = path
        .or_else(|| cfg.manifest_path().map(PathBuf::from))
        .context("no service manifest configured (use --manifest or manifest.path)")?;

    let manifest = Manifest::load(&path)
        .with_context(|| format!("failed to load service manifest from {}", path.display()))?;
    info!(
        component = "manifest",
        event = "load_success",
        path = %path.display(),
        services = manifest.len(),
        "manifest loaded"
    );
    Ok(manifest)
}

/// Configures structured logging based on configuration.
fn configure_logger(cfg: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_level = cfg
        .logs()
        .and_then(|logs| logs.level.as_ref())
        .map(|s| s.as_str())
        .unwrap_or("info");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if cfg.is_prod() {
        // Production: JSON format
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        // Development: Pretty console format
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match load_cfg(args.cfg.clone()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    configure_logger(&cfg);

    // The recorder must be installed before the runtime starts.
    if cfg.metrics_enabled() {
        if let Err(e) = crate::controller::metrics::init_prometheus_exporter() {
            warn!(
                component = "main",
                event = "metrics_init_failed",
                error = %e,
                "metrics endpoint will not be available"
            );
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_workers(&cfg))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(component = "main", event = "runtime_failed", error = %e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    match runtime.block_on(async_main(cfg, args.manifest)) {
        Ok(code) => code,
        Err(e) => {
            error!(
                component = "main",
                event = "startup_failed",
                error = format!("{e:#}"),
                "node failed to start"
            );
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

/// Runs the node. Errors are startup errors; a started node always yields
/// an exit code.
async fn async_main(cfg: Config, manifest_path: Option<PathBuf>) -> Result<ExitCode> {
    let manifest = load_manifest(&cfg, manifest_path)?;

    let shutdown_token = CancellationToken::new();

    // Managed instances get their grace period on shutdown, twice over.
    let graceful_shutdown = GracefulShutdown::new(shutdown_token.clone());
    graceful_shutdown.set_graceful_timeout(cfg.supervisor().grace_period * 2 + Duration::from_secs(10));

    // Initialize liveness probe for Kubernetes/Cloud health checks
    let probe_timeout = cfg
        .k8s()
        .and_then(|k8s| k8s.probe.timeout)
        .unwrap_or(Duration::from_secs(5));
    let probe = Arc::new(liveness::Probe::new(probe_timeout));

    let app = Arc::new(app::App::new(
        shutdown_token.clone(),
        cfg,
        manifest,
        probe.clone(),
    )?);

    if let Err(e) = app.start().await {
        app.close().await;
        return Err(e);
    }

    probe.watch(vec![app.clone() as Arc<dyn liveness::Service>]);

    graceful_shutdown.add(1);
    app.serve(graceful_shutdown.clone());

    // Listen for OS signals or cancellation and wait for graceful shutdown
    if let Err(e) = graceful_shutdown.await_shutdown().await {
        error!(
            component = "main",
            scope = "service",
            event = "graceful_shutdown_failed",
            error = %e,
            "failed to gracefully shut down service"
        );
    }

    if app.had_failures() {
        warn!(
            component = "main",
            event = "exit_with_failures",
            "some instances exhausted their restart budget"
        );
        return Ok(ExitCode::from(EXIT_FAILED_INSTANCES));
    }
    Ok(ExitCode::SUCCESS)
}
