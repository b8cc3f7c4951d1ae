use std::sync::{Arc, Mutex};

use strangler_gateway::{
    AdminState, Config, EnvSnapshot, Gateway, GatewayRouter, HealthTracker, ProbeSupervisor,
    Reloader, RouteMatcher, RuntimeConfig, ServerState, SharedProbes, TargetRegistry,
    build_client, serve, serve_admin, shutdown_signal,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./Gateway.yml";

fn load_config(path: &str, env: &EnvSnapshot) -> strangler_gateway::Result<RuntimeConfig> {
    Config::load_from_file(path, env).and_then(Config::into_runtime)
}

#[tokio::main]
async fn main() {
    // A missing .env file is fine; the process environment still applies.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let env = EnvSnapshot::capture();
    let config_path = env
        .get("GATEWAY_CONFIG")
        .unwrap_or(DEFAULT_CONFIG_PATH)
        .to_owned();

    let config = load_config(&config_path, &env).unwrap_or_else(|e| {
        error!(error = %e, path = %config_path, "failed to load configuration");
        std::process::exit(1);
    });
    let config = Arc::new(config);

    let registry = TargetRegistry::from_upstreams(config.upstreams.clone())
        .map(Arc::new)
        .unwrap_or_else(|e| {
            error!(error = %e, "invalid upstreams");
            std::process::exit(1);
        });
    let router = GatewayRouter::new(RouteMatcher::new(config.routes.clone()), Arc::clone(&registry))
        .map(Arc::new)
        .unwrap_or_else(|e| {
            error!(error = %e, "invalid routes");
            std::process::exit(1);
        });

    let health = HealthTracker::new(Arc::clone(&registry), config.thresholds);
    let probes: Option<SharedProbes> = config.health_check.clone().map(|settings| {
        let mut supervisor = ProbeSupervisor::new(health.clone(), settings);
        supervisor.sync();
        info!(probes = supervisor.len(), "active health probes started");
        Arc::new(Mutex::new(supervisor))
    });

    // The gateway publishes nothing itself. `broker` and `publish` configure
    // services that embed `QueuePublisher`; there is no backlog to report.
    let admin = Arc::new(AdminState::new(health.clone(), config.splits.clone(), None));

    let (admin_stop, admin_stopped) = oneshot::channel::<()>();
    if let Some(addr) = config.admin_listen {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(%addr, "admin API listening");
                tokio::spawn(serve_admin(listener, Arc::clone(&admin), async {
                    let _ = admin_stopped.await;
                }));
            }
            Err(e) => {
                error!(error = %e, %addr, "failed to bind admin listener");
                std::process::exit(1);
            }
        }
    }

    // `main` keeps its own handle on the probes, so they run until shutdown
    // whether or not reloading is available.
    spawn_reloader(Reloader::new(
        config_path,
        env,
        Arc::clone(&router),
        Arc::clone(&admin),
        probes.clone(),
    ));

    let client = build_client(&config);
    let gateway = Arc::new(Gateway::new(router, health, client, Arc::clone(&config)));

    let listener = TcpListener::bind(config.listen).await.unwrap_or_else(|e| {
        error!(error = %e, addr = %config.listen, "failed to bind listener");
        std::process::exit(1);
    });
    info!(addr = %config.listen, "gateway listening");

    serve(listener, ServerState::new(gateway), shutdown_signal()).await;

    let _ = admin_stop.send(());
    drop(probes);
}

/// Reloads the configuration on SIGHUP.
#[cfg(unix)]
fn spawn_reloader(reloader: Reloader) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "failed to register SIGHUP handler, reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("received SIGHUP, reloading configuration");
            if let Err(e) = reloader.reload() {
                error!(error = %e, "reload rejected, keeping current configuration");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reloader(_reloader: Reloader) {
    warn!("configuration reload is only supported on unix");
}
