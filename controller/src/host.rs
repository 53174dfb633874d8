use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use irrigation_common::{
    Actuator, Clock, ControlCommand, ControlReply, ControlService, FileStore, MotorActuator,
    OsTimeSync, RuntimeConfig, ScheduleStore, ScheduleWorker, Scheduler, ShutdownSignal,
    SimulatedMotor, SystemClock,
};

#[derive(Clone)]
struct AppState {
    control: Arc<ControlService>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("IRRIGATION_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.irrigation"));

    let mut runtime = load_runtime_config(&data_dir.join("runtime.json"))
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config from store: {err:#}");
            RuntimeConfig::default()
        });
    runtime.sanitize();
    let config = runtime.controller.clone();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let actuator: Arc<dyn Actuator> = Arc::new(MotorActuator::new(
        Box::new(SimulatedMotor::new()),
        Duration::from_millis(config.fault_check_interval_ms),
    ));
    let store: Arc<dyn ScheduleStore> = Arc::new(FileStore::new(data_dir.join("schedule.json")));
    let scheduler = Arc::new(Scheduler::restore(
        &config,
        actuator.clone(),
        store,
        clock.now_epoch(),
    ));
    let control = Arc::new(ControlService::new(
        scheduler.clone(),
        actuator.clone(),
        clock.clone(),
        config.manual_run_default_secs,
    ));

    let shutdown = Arc::new(ShutdownSignal::new());
    let schedule_loop = ScheduleWorker::new(
        scheduler,
        clock,
        Box::new(OsTimeSync),
        config.time_sync_interval_secs,
        Duration::from_millis(config.poll_interval_ms),
    )
    .spawn(shutdown.clone())
    .context("failed to spawn schedule loop")?;

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.http_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    let served = axum::serve(listener, router(control))
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone(), actuator.clone()))
        .await;

    shutdown.trigger();
    actuator.shutdown();
    let joined = tokio::task::spawn_blocking(move || schedule_loop.join()).await;
    info!("controller stopped, motor outputs off");

    served.context("controller server failed")?;
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(anyhow!("schedule loop panicked")),
        Err(err) => Err(anyhow!("failed to join schedule loop: {err}")),
    }
}

fn router(control: Arc<ControlService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .fallback(handle_request)
        .with_state(AppState { control })
        .layer(cors)
}

async fn handle_request(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let command = ControlCommand::parse(method.as_str(), uri.path(), &body);

    // Runs block for their full duration and the store writes synchronously,
    // so dispatch off the async workers; a concurrent stop stays responsive.
    let control = state.control.clone();
    let reply = match tokio::task::spawn_blocking(move || control.handle(command)).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!("control request task failed: {err}");
            ControlReply::error("Internal error")
        }
    };

    reply_response(reply)
}

fn reply_response(reply: ControlReply) -> Response {
    match reply {
        ControlReply::Json(value) => (StatusCode::OK, Json(value)).into_response(),
        ControlReply::Empty => StatusCode::OK.into_response(),
    }
}

async fn wait_for_shutdown(shutdown: Arc<ShutdownSignal>, actuator: Arc<dyn Actuator>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown requested, stopping motor");
    shutdown.trigger();
    actuator.shutdown();
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}
