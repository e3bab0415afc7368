use std::env;
use std::sync::Arc;

use chat_protocol::SYNC_TOPIC;
use hub::bridge::{Bridge, RedisBus};
use hub::cache::Cache;
use hub::config::Config;
use hub::{db, repo, worker, AppState, Hub, HubDeps};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Config::from_env().expect("incomplete configuration");
    let grace = config.shutdown_grace;
    let instance_id = uuid::Uuid::new_v4();
    info!(instance_id = %instance_id, "starting fanout hub");

    info!("connecting to database...");
    let pool = db::create_pool(&config.database_url).await;
    db::run_migrations(&pool).await;
    info!("migrations applied");

    // No sessions exist at startup; clear is_online leftovers from a
    // previous unclean shutdown.
    let reset = repo::users::reset_stale_online(&pool)
        .await
        .expect("failed to reset stale presence flags");
    if reset > 0 {
        info!(users = reset, "cleared stale online flags");
    }

    let cache = Cache::connect(&config.redis_url)
        .await
        .expect("failed to connect to Redis cache");
    let bus = Arc::new(
        RedisBus::connect(&config.redis_url)
            .await
            .expect("failed to connect to Redis pub/sub"),
    );
    let bridge = Arc::new(Bridge::new(bus, SYNC_TOPIC));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let deps = HubDeps {
        pool: pool.clone(),
        cache: cache.clone(),
        bridge: Arc::clone(&bridge),
    };
    let (hub, hub_handle) = Hub::new(deps, shutdown_rx.clone());
    let hub_task = tokio::spawn(hub.run());
    let bridge_task = bridge.spawn_subscriber(hub_handle.clone(), shutdown_rx.clone());
    let worker_task =
        worker::spawn_archive_task(pool.clone(), config.archive_after_days, shutdown_rx.clone());

    let state = AppState {
        pool: pool.clone(),
        cache,
        hub: hub_handle,
        config: Arc::new(config.clone()),
    };
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "hub listening");
    axum::serve(listener, hub::build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Orderly teardown: bridge drains, the hub closes every session queue
    // and writers flush, then the store pool closes last.  Anything still
    // open after the grace period is hard-closed with the process.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(grace, async {
        let _ = bridge_task.await;
        let _ = hub_task.await;
        let _ = worker_task.await;
    })
    .await;
    pool.close().await;
    info!("hub shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
