use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ventilation_common::RuntimeConfig;

use crate::{
    api::{router, AppState},
    drivers::Drivers,
    service::ControllerService,
    store::{AppStore, EventLog},
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    if let Err(err) = runtime.validate() {
        warn!("stored runtime config rejected ({err}); using defaults");
        runtime = RuntimeConfig::default();
    }

    let log_cancel = CancellationToken::new();
    let (events, log_writer) = EventLog::spawn(store.log_path(&runtime.logging), log_cancel.clone());
    info!("event log at {}", events.path().display());

    let service = ControllerService::start(runtime, Drivers::simulated(), events.clone())
        .context("failed to start controller service")?;
    let service = Arc::new(service);

    let web_root = std::env::var("VENTILATION_WEB_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(format!("{}/web", env!("CARGO_MANIFEST_DIR"))));
    let app = router(
        AppState {
            service: service.clone(),
            store,
            events,
        },
        web_root,
    );

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    log_cancel.cancel();
    if let Err(err) = log_writer.await {
        warn!("event log writer ended abnormally: {err}");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
