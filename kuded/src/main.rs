//! kude operator daemon
//!
//! Mirrors TrackedRepositories into a local directory tree and keeps
//! Bundles applied from them, recording each apply as a RunRecord.

#![forbid(unsafe_code)]

mod apply;
mod bundle;
mod controller;
mod events;
mod git;
mod http_api;
mod index;
mod ledger;
mod repository;
mod wiring;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod testing;

use anyhow::{Context as _, Result};
use clap::Parser;
use kude_common::{
    InMemoryStore, LogConfig, LogFormat, ObjectStore, OperatorConfig, StoreError, init_logging,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bundle::BundleReconciler;
use controller::{Context, Controller, Settings};
use events::{DEFAULT_EVENT_HISTORY, EventBus, EventRecorder};
use git::{GitCli, Vcs};
use index::SourceIndex;
use repository::RepositoryReconciler;
use wiring::Queues;

#[derive(Parser)]
#[command(name = "kuded")]
#[command(author, version, about = "kude daemon - repository mirrors and manifest bundles")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, env = "KUDE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding one mirror per repository
    #[arg(long)]
    mirror_root: Option<PathBuf>,

    /// Program invoked as `<program> apply [args] -f <files>`
    #[arg(long)]
    apply_command: Option<String>,

    /// Address for the HTTP API
    #[arg(long)]
    listen: Option<String>,

    /// Concurrent reconcile passes per kind
    #[arg(long)]
    max_concurrent_reconciles: Option<u32>,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format (text or json)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Flags win over file and environment values.
    fn apply_to(&self, config: &mut OperatorConfig) {
        if let Some(root) = &self.mirror_root {
            config.mirror_root = root.clone();
        }
        if let Some(command) = &self.apply_command {
            config.apply_command = command.clone();
        }
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(limit) = self.max_concurrent_reconciles {
            config.max_concurrent_reconciles = limit;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if self.verbose {
            config.log_level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        OperatorConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply_to(&mut config);
    config.validate().context("validating configuration")?;

    let log_config = LogConfig::new(config.log_level.clone())
        .with_format(config.log_format)
        .with_log_dir(config.log_dir.clone());
    let _log_guards = init_logging(&log_config)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting kude daemon...");
    info!(
        mirror_root = %config.mirror_root.display(),
        apply_command = %config.apply_command,
        concurrency = config.max_concurrent_reconciles,
        "configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
    let recorder = Arc::new(EventRecorder::new(
        DEFAULT_EVENT_HISTORY,
        EventBus::new(events::DEFAULT_BUFFER),
    ));
    let ctx = Arc::new(Context {
        store: Arc::clone(&store),
        recorder: Arc::clone(&recorder),
        index: Arc::new(SourceIndex::new()),
        settings: Settings {
            mirror_root: config.mirror_root.clone(),
            apply_command: config.apply_command.clone(),
        },
        shutdown: shutdown.clone(),
    });

    let ready = Arc::new(AtomicBool::new(false));
    let http = http_api::start_server(
        config.listen_addr()?,
        http_api::HttpState {
            store,
            recorder,
            ready: Arc::clone(&ready),
            version: env!("CARGO_PKG_VERSION"),
            started_at: Instant::now(),
            pid: std::process::id(),
        },
        shutdown.clone(),
    )
    .await
    .context("starting HTTP server")?;

    let vcs: Arc<dyn Vcs> = Arc::new(GitCli::new(config.git_binary.clone(), config.git_timeout()?));
    let tasks = start_operator(
        Arc::clone(&ctx),
        vcs,
        config.max_concurrent_reconciles as usize,
    )
    .await?;
    ready.store(true, Ordering::Release);
    info!("kude daemon ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping controllers");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("controller task ended abnormally: {}", e);
        }
    }
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("HTTP server error: {}", e),
        Err(e) => warn!("HTTP server task ended abnormally: {}", e),
    }
    info!("kude daemon stopped");
    Ok(())
}

/// Spawns both controllers and the watch router, enqueueing every existing
/// object once. All tasks stop when `ctx.shutdown` is cancelled.
async fn start_operator(
    ctx: Arc<Context>,
    vcs: Arc<dyn Vcs>,
    concurrency: usize,
) -> Result<Vec<JoinHandle<()>>, StoreError> {
    let repositories = Controller::new(RepositoryReconciler::new(vcs), Arc::clone(&ctx), concurrency);
    let bundles = Controller::new(BundleReconciler::new(), Arc::clone(&ctx), concurrency);
    let queues = Queues {
        repositories: repositories.queue(),
        bundles: bundles.queue(),
    };

    // Subscribe before listing so nothing created in between is missed.
    let watch = ctx.store.watch();
    wiring::prime(&ctx, &queues).await?;

    let shutdown = ctx.shutdown.clone();
    Ok(vec![
        tokio::spawn(repositories.run(shutdown.clone())),
        tokio::spawn(bundles.run(shutdown.clone())),
        tokio::spawn(wiring::run(Arc::clone(&ctx), queues, watch, shutdown)),
    ])
}
