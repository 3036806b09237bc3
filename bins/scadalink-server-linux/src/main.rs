use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, response::Json, routing::get, Router};
use scadalink_core::{GatewayConfig, PointValue, RtuAddress, RtuDescriptor};
use scadalink_server::{
    CommandRouter, ConnectionStatus, DesiredStateSource, FastStore, FileDesiredState, Ingestor,
    MemoryDesiredState, MemoryFastStore, MemoryTimeSeries, Observation, PointStatus, PointStore,
    PollScheduler, RealtimeBridge, RtuSupervisor, ScadaServer, ServerConfig, SimulatedLink,
    StatusHandle, SubscriptionRouter, SupervisorSettings, TimeSeriesStore,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,scadalink_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("scadalink gateway starting...");

    let config = load_config()?;
    let cancel = CancellationToken::new();
    let (fast, timeseries) = open_stores(&config).await?;

    // Desired state: descriptor file if configured, else a built-in demo fleet
    let source: Arc<dyn DesiredStateSource> = match &config.rtu_list_path {
        Some(path) => {
            let source = Arc::new(FileDesiredState::new(path));
            tokio::spawn(
                source
                    .clone()
                    .watch_file(config.supervisor_interval(), cancel.clone()),
            );
            source
        }
        None => Arc::new(MemoryDesiredState::new(demo_descriptors(&config.fleet))),
    };

    let link = Arc::new(SimulatedLink::new());
    let points = Arc::new(PointStore::new(fast.clone()));
    let router = Arc::new(SubscriptionRouter::new(points.clone(), config.client_queue_depth));
    let commands = Arc::new(CommandRouter::new(
        fast.clone(),
        link.clone(),
        config.command_queue_depth,
        cancel.clone(),
    ));
    let supervisor = RtuSupervisor::new(
        source,
        link.clone(),
        fast.clone(),
        commands,
        SupervisorSettings::from_config(&config),
    );
    let status = supervisor.status_handle();

    // Background services
    let supervisor_handle = tokio::spawn(supervisor.run(cancel.clone()));

    let bridge = RealtimeBridge::new(fast.clone(), router.clone());
    tokio::spawn(bridge.run(cancel.clone()));

    let scheduler = PollScheduler::new(timeseries.clone(), router.clone(), config.poll_interval());
    tokio::spawn(scheduler.run(cancel.clone()));

    let (observation_tx, observation_rx) = mpsc::channel(1024);
    let ingestor = Ingestor::new(fast.clone(), timeseries);
    tokio::spawn(ingestor.run(observation_rx, cancel.clone()));

    let demo_handle = tokio::spawn(generate_demo_data(
        link,
        status.clone(),
        observation_tx,
        cancel.clone(),
    ));

    // Client WebSocket server
    let server_config = ServerConfig {
        bind_addr: config.ws_bind,
        ..ServerConfig::default()
    };
    let server = ScadaServer::new(server_config, router.clone(), fast);
    let ws_cancel = cancel.clone();
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = server.run(ws_cancel).await {
            tracing::error!(error = %e, "WebSocket server error");
        }
    });

    // Status API
    let state = AppState {
        points,
        router,
        status,
    };
    let http_cancel = cancel.clone();
    let http_addr = config.http_bind;
    let http_handle = tokio::spawn(async move {
        if let Err(e) = start_http_server(http_addr, state, http_cancel).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!("scadalink gateway ready");
    tracing::info!("   WebSocket: ws://{}", config.ws_bind);
    tracing::info!("   Status:    http://{}/api/health", config.http_bind);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = ws_handle => {
            tracing::warn!("WebSocket server stopped");
        }
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
        _ = demo_handle => {
            tracing::warn!("Demo data generator stopped");
        }
    }

    cancel.cancel();
    // Let the supervisor tear connections down and clear the active flags.
    if tokio::time::timeout(Duration::from_secs(5), supervisor_handle)
        .await
        .is_err()
    {
        tracing::warn!("Supervisor did not stop in time");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Config file from the first argument (or defaults), then env overrides.
fn load_config() -> anyhow::Result<GatewayConfig> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::load(Path::new(&path))?,
        None => GatewayConfig::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    tracing::debug!(?config, "Configuration loaded");
    Ok(config)
}

async fn open_stores(
    config: &GatewayConfig,
) -> anyhow::Result<(Arc<dyn FastStore>, Arc<dyn TimeSeriesStore>)> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            use scadalink_server::redis_store::{RedisFastStore, RedisTimeSeries};
            let redis = RedisFastStore::connect(url).await?;
            let timeseries: Arc<dyn TimeSeriesStore> =
                Arc::new(RedisTimeSeries::new(redis.connection()));
            let fast: Arc<dyn FastStore> = Arc::new(redis);
            Ok((fast, timeseries))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("redisUrl is set but this build has no Redis support"),
        None => {
            tracing::info!("No redisUrl configured, using in-memory stores");
            let fast: Arc<dyn FastStore> = Arc::new(MemoryFastStore::new());
            let timeseries: Arc<dyn TimeSeriesStore> = Arc::new(MemoryTimeSeries::new());
            Ok((fast, timeseries))
        }
    }
}

fn demo_descriptors(fleet: &str) -> Vec<RtuDescriptor> {
    ["127.0.0.1:2404", "127.0.0.2:2404"]
        .into_iter()
        .map(|address| RtuDescriptor::new(address, true, fleet))
        .collect()
}

#[derive(Clone)]
struct AppState {
    points: Arc<PointStore>,
    router: Arc<SubscriptionRouter>,
    status: StatusHandle,
}

/// Start the HTTP status API
async fn start_http_server(
    addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/connections", get(connections_handler))
        .route("/api/points", get(points_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let connections = state.status.read().await;
    let connected = connections.iter().filter(|c| c.state.is_connected()).count();
    Json(serde_json::json!({
        "status": "ok",
        "clients": state.router.registry().len().await,
        "rtus": connections.len(),
        "connected": connected,
    }))
}

async fn connections_handler(State(state): State<AppState>) -> Json<Vec<ConnectionStatus>> {
    Json(state.status.read().await.clone())
}

async fn points_handler(State(state): State<AppState>) -> Json<Vec<PointStatus>> {
    Json(state.points.snapshot().await)
}

/// Generate demo data - simulated measurements from every connected RTU
async fn generate_demo_data(
    link: Arc<SimulatedLink>,
    status: StatusHandle,
    observations: mpsc::Sender<Observation>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut step: i64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        step += 1;

        let rtus: Vec<RtuAddress> = status
            .read()
            .await
            .iter()
            .filter(|c| c.state.is_connected())
            .map(|c| c.address.clone())
            .collect();

        for rtu in rtus {
            if !link.is_connected(&rtu).await {
                continue;
            }
            let measured = Observation {
                rtu: rtu.clone(),
                ioa: "100".to_string(),
                value: PointValue::from(200 + (step % 20)),
                asdu: "M_ME_NB_1".to_string(),
            };
            let breaker = Observation {
                rtu,
                ioa: "200".to_string(),
                value: PointValue::from(serde_json::json!(step % 10 < 5)),
                asdu: "M_SP_NA_1".to_string(),
            };
            for observation in [measured, breaker] {
                if observations.send(observation).await.is_err() {
                    return;
                }
            }
        }
    }
}
