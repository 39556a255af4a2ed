//! `vox`: loads a manifest, runs the dispatch engine until Ctrl-C.

mod plugins;
mod settings;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use vox_core::{DispatchEngine, Manifest, Notification, Phase};

use settings::{resolve_manifest_path, DEFAULT_LOG_FILTER};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    info!("Vox starting");

    // ── Manifest ──────────────────────────────────────────────────────────
    let manifest_path = resolve_manifest_path(std::env::args_os().nth(1));
    let mut manifest = Manifest::load(&manifest_path)
        .with_context(|| format!("loading manifest {}", manifest_path.display()))?;
    manifest.apply_env_overrides();
    manifest.validate().context("validating manifest")?;
    info!(
        manifest_path = ?manifest_path,
        key_phrases = ?manifest.key_phrases,
        service_timeout_ms = manifest.dispatch.service_timeout_ms,
        overflow = ?manifest.dispatch.queue.overflow,
        "manifest loaded"
    );

    // ── Engine setup ──────────────────────────────────────────────────────
    let factory = plugins::builtin_factory();
    let engine = Arc::new(
        DispatchEngine::from_manifest(&manifest, &factory).context("building plugins")?,
    );

    // Surface terminal failures even when no notifier is configured.
    let mut notifications = engine.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(Notification::Lifecycle(ev)) if ev.phase == Phase::Exhausted => {
                    warn!(component = %ev.component, "component permanently disabled");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "notification watcher lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let starting = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || starting.start())
        .await
        .context("engine start task")?
        .context("starting engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");

    let stopping = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .context("engine shutdown task")?
        .context("stopping engine")?;

    watcher.abort();
    let snap = engine.diagnostics_snapshot();
    info!(
        diagnostics = %serde_json::to_string(&snap).unwrap_or_default(),
        "Vox stopped"
    );
    Ok(())
}
