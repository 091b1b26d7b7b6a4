use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use tidepool_bridge::config::Config;
use tidepool_bridge::jobs::JobBroadcaster;
use tidepool_bridge::protocol::algo_identifier;
use tidepool_bridge::router::ShareRouter;
use tidepool_bridge::server::{build_router, AppState};
use tidepool_bridge::session::SessionRegistry;
use tidepool_bridge::upstream::UpstreamLink;

/// Sessions idle longer than this are pruned by the hourly sweep.
const SESSION_MAX_AGE_SECS: u64 = 86_400;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };
    let (pool_host, pool_port) = match cfg.pool_host_port() {
        Ok(hp) => hp,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    info!("tidepool bridge starting");
    info!("  pool: {}:{} (algo {})", pool_host, pool_port, cfg.algo);
    info!("  listen: {}", cfg.listen);

    let registry = Arc::new(SessionRegistry::new());
    let jobs = Arc::new(JobBroadcaster::new(
        registry.clone(),
        algo_identifier(&cfg.algo).to_string(),
    ));
    let upstream = Arc::new(UpstreamLink::new(
        pool_host,
        pool_port,
        cfg.wallet.clone(),
        cfg.password.clone(),
        cfg.user_agent.clone(),
    ));
    let router = Arc::new(ShareRouter::new(
        registry.clone(),
        jobs.clone(),
        upstream.clone(),
        cfg.wallet.clone(),
    ));

    tokio::spawn(upstream.clone().run(router.clone()));

    // Hourly sweep of stale leaderboard rows.
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = registry.prune(SESSION_MAX_AGE_SECS).await;
                if removed > 0 {
                    info!("pruned {} stale sessions", removed);
                }
            }
        });
    }

    let state = AppState {
        registry,
        jobs,
        router,
        upstream,
        coin: cfg.coin.clone(),
        started_at: Utc::now(),
    };
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&cfg.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {}: {}", cfg.listen, e);
            std::process::exit(1);
        }
    };
    info!("listening on {}", cfg.listen);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {}", e);
        std::process::exit(1);
    }
    info!("bridge stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
