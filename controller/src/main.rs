mod logging;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use helmsource::{
    load_config, resolve_config_path, ArtifactStorage, ControllerConfig, HelmRepositoryReconciler,
    HelmSourceError, InMemoryCluster, IndexFetcher, ManifestLoader, ManifestSync, ManifestWatcher,
    Scheduler,
};
use log::{error, info, warn};

/// Upper bound on waiting for in-flight passes after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let arg = std::env::args().nth(1);
    let config = match resolve_config_path(arg.as_deref()).and_then(|path| {
        eprintln!("Loading config from {}", path.display());
        load_config(&path)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting helmsource controller v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ControllerConfig) -> Result<(), HelmSourceError> {
    let storage = Arc::new(ArtifactStorage::new(
        config.storage_path(),
        config.storage.hostname.clone(),
        config.storage.timeout.as_duration(),
    )?);
    info!(
        "Artifact storage at {} served as http://{}/",
        storage.base_path().display(),
        storage.hostname()
    );

    let cluster = Arc::new(InMemoryCluster::new());

    let mut watcher = None;
    if let Some(dir) = config.manifest_directory() {
        let sync = Arc::new(ManifestSync::new(ManifestLoader::new(&dir), cluster.clone()));
        let summary = sync.sync().await?;
        info!(
            "Applied {} HelmRepository and {} Secret manifests from {}",
            summary.repositories_applied,
            summary.secrets_applied,
            dir.display()
        );
        if config.manifests.watch {
            watcher = Some(ManifestWatcher::start(
                sync,
                config.manifests.debounce.as_duration(),
            )?);
        }
    } else {
        warn!("No manifest directory configured; nothing will be reconciled");
    }

    let reconciler = Arc::new(HelmRepositoryReconciler::new(
        cluster.clone(),
        cluster.clone(),
        storage,
        IndexFetcher::new(config.fetcher_settings()),
        config.reconciler_settings(),
    ));
    let scheduler = Scheduler::new(reconciler, config.scheduler_settings());
    let events = scheduler.start();

    shutdown_signal().await;
    info!("Shutdown signal received");

    if let Some(watcher) = watcher.as_mut() {
        watcher.stop().await;
    }
    scheduler.shutdown();
    let _ = events.await;

    if tokio::time::timeout(DRAIN_TIMEOUT, scheduler.wait_idle(Duration::from_millis(100)))
        .await
        .is_err()
    {
        warn!(
            "{} reconciliations still in flight after {:?}",
            scheduler.in_flight(),
            DRAIN_TIMEOUT
        );
    }

    info!("Controller stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
