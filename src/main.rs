use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use fleetd::commands::CommandHandler;
use fleetd::config::Config;
use fleetd::control_api::{self, ControlState};
use fleetd::dispatch::Dispatcher;
use fleetd::driver::{LimaDriver, VmDriver};
use fleetd::hub::Hub;
use fleetd::log_streams::LogStreamManager;
use fleetd::logging::init_logging;
use fleetd::monitor::{Monitor, DEFAULT_SWEEP_INTERVAL};
use fleetd::mounts::MountManager;
use fleetd::pool::{PoolConfig, PoolManager};
use fleetd::proxy::RouteWriter;
use fleetd::registration_api;
use fleetd::registry::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg.log_level)?;
    tracing::info!("fleetd starting");

    cfg.ensure_dirs().context("creating state directories")?;
    let base_dir = cfg.base_dir();

    let driver: Arc<dyn VmDriver> =
        Arc::new(LimaDriver::new("limactl", cfg.runner_service.clone()));

    let pool = PoolManager::new(
        PoolConfig {
            warm_size: cfg.warm_size,
            max_vms: cfg.max_vms,
            master_name: cfg.master.clone(),
        },
        driver.clone(),
        &base_dir,
    )
    .context("loading pool state")?;
    pool.start().await;

    let store = Arc::new(Registry::new(&base_dir).context("loading registry")?);
    let routes = Arc::new(RouteWriter::new(&base_dir, cfg.domain.clone()));
    let mounts = Arc::new(MountManager::new(&base_dir));

    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        driver.clone(),
        cfg.host_addr(),
        cfg.runner_service.clone(),
    ));

    let monitor = Monitor::new(
        pool.clone(),
        driver.clone(),
        DEFAULT_SWEEP_INTERVAL,
        cfg.runner_service.clone(),
    );
    monitor.start();

    let (line_tx, line_rx) = mpsc::channel(256);
    let log_streams = Arc::new(LogStreamManager::new(
        pool.clone(),
        driver.clone(),
        line_tx,
    ));
    let commands = Arc::new(CommandHandler::new(
        dispatcher.clone(),
        pool.clone(),
        store.clone(),
        routes.clone(),
        mounts.clone(),
    ));
    let hub = Hub::new(
        store.clone(),
        pool.clone(),
        log_streams,
        commands,
        routes.clone(),
        line_rx,
    );
    hub.clone().start();

    // Registration listener: the VMs call this one.
    let reg_addr = format!("0.0.0.0:{}", cfg.registry_port);
    let reg_listener = tokio::net::TcpListener::bind(&reg_addr)
        .await
        .with_context(|| format!("binding registration listener on {reg_addr}"))?;
    tracing::info!(addr = %reg_addr, "registration server listening");
    let reg_router = registration_api::router(store.clone(), routes.clone());
    tokio::spawn(async move {
        if let Err(error) = axum::serve(reg_listener, reg_router).await {
            tracing::error!(%error, "registration server failed");
        }
    });

    // Operator API listener: REST + /ws, loopback only.
    let api_addr = format!("127.0.0.1:{}", cfg.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("binding API listener on {api_addr}"))?;
    tracing::info!(addr = %api_addr, "API server listening");
    let api_router = control_api::router(ControlState {
        hub: hub.clone(),
        pool: pool.clone(),
        store,
        dispatcher,
        driver,
        routes,
        runner_service: cfg.runner_service.clone(),
    });
    tokio::spawn(async move {
        if let Err(error) = axum::serve(api_listener, api_router).await {
            tracing::error!(%error, "API server failed");
        }
    });

    shutdown_signal().await;
    tracing::info!("shutting down");

    hub.stop();
    monitor.stop();
    pool.stop();
    mounts.unmount_all().await;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(error) => {
                tracing::warn!(%error, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
