//! Daemon assembly: turns a `FleetConfig` into running subsystems.
//!
//! The daemon:
//! 1. Builds the fleet backend named by `[fleet] backend`
//! 2. Creates the node registry and the reconciliation engine
//! 3. Runs the engine loop and the idle-retention loop in the background
//! 4. Serves the REST API until Ctrl-C, then stops the loops

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleetscale_core::FleetConfig;
use fleetscale_engine::{
    FleetBackend, FleetEngine, IdleRetention, InMemoryRegistry, InstanceApi, ScalingConfig,
    SimulatedFleet, SimulatedFleetOptions,
};
use fleetscale_state::FleetTarget;
use tokio::sync::watch;
use tracing::{info, warn};

/// Everything the daemon runs, wired together.
pub struct Daemon {
    pub engine: Arc<FleetEngine>,
    pub registry: Arc<InMemoryRegistry>,
    pub retention: Arc<IdleRetention>,
    pub update_interval: Duration,
    pub retention_interval: Duration,
}

/// Build the backend, registry and engine described by `config`.
pub fn assemble(config: &FleetConfig) -> anyhow::Result<Daemon> {
    let target = FleetTarget {
        region: config.fleet.region.clone(),
        endpoint: config.fleet.endpoint.clone(),
        credentials_id: config.fleet.credentials_id.clone(),
        fleet_id: config.fleet.id.clone(),
    };
    let scaling = ScalingConfig::from_section(&config.scaling(), config.labels());

    let (backend, instances): (Arc<dyn FleetBackend>, Arc<dyn InstanceApi>) =
        match config.backend_kind() {
            "simulated" => {
                let options = config
                    .simulated
                    .as_ref()
                    .map(SimulatedFleetOptions::from)
                    .unwrap_or_default();
                let fleet = Arc::new(SimulatedFleet::new(config.fleet.id.clone(), options));
                (fleet.clone(), fleet)
            }
            other => anyhow::bail!("unsupported fleet backend '{other}'"),
        };

    info!(
        fleet_id = %target.fleet_id,
        region = %target.region,
        backend = config.backend_kind(),
        min_size = scaling.min_size,
        max_size = scaling.max_size,
        "fleet backend initialized"
    );

    let registry = Arc::new(InMemoryRegistry::new());
    let engine = Arc::new(FleetEngine::new(
        target,
        scaling,
        backend,
        instances,
        registry.clone(),
    ));
    let retention = Arc::new(IdleRetention::new(engine.clone(), registry.clone()));

    Ok(Daemon {
        engine,
        registry,
        retention,
        update_interval: config.update_interval(),
        retention_interval: config.retention_interval(),
    })
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: FleetConfig, listen: Option<String>) -> anyhow::Result<()> {
    info!("fleetscale daemon starting");

    let listen = listen.unwrap_or_else(|| config.listen());
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address '{listen}'"))?;

    let daemon = assemble(&config)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // ── Start background tasks ─────────────────────────────────

    let engine_handle = {
        let engine = daemon.engine.clone();
        let interval = daemon.update_interval;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(interval, shutdown).await })
    };

    let retention_handle = {
        let retention = daemon.retention.clone();
        let interval = daemon.retention_interval;
        let shutdown = shutdown_rx;
        tokio::spawn(async move { retention.run(interval, shutdown).await })
    };

    // ── Start API server ───────────────────────────────────────

    let router = fleetscale_api::build_router(daemon.engine.clone(), daemon.registry.clone());
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let signal_tx = shutdown_tx.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = signal_tx.send(true);
        })
        .await;

    // Stop the loops even if the server exited with an error.
    let _ = shutdown_tx.send(true);
    let _ = engine_handle.await;
    let _ = retention_handle.await;

    served?;
    info!("fleetscale daemon stopped");
    Ok(())
}
