//! The Courier gateway server.
//!
//! Boot order: configuration, logging, dependency connections (retried
//! within the startup grace period, exit 2 on failure), then the spool
//! walker, dethrottler, sender pool and HTTP listener. Shutdown: the
//! listener drains first, then the sender pool finishes its in-flight
//! sends; the committers must stop after the sender pool, since draining
//! workers still queue status updates and channel logs into them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use courier_backend::{Backend, PostgresBackend, PostgresBackendConfig};
use courier_config::{AppConfig, ConfigLoader};
use courier_queue::{Dethrottler, PriorityQueue};
use courier_server::{
    create_router, AppState, ChannelCache, Foreman, HandlerRegistry, SenderPoolConfig,
};
use courier_spool::{Spool, SpoolWalker};

/// The queue type this instance drains.
const MSG_QUEUE_TYPE: &str = "msgs";

const CHANNEL_CACHE_TTL: Duration = Duration::from_secs(60);
const RETRY_CONNECT_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    courier_common::logging::init_logging("courier");

    let config = match ConfigLoader::new().load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        domain = %config.domain,
        workers = config.sender.max_workers,
        "starting courier"
    );

    // dependencies get the startup grace period, then we give up with exit 2
    let deadline = Instant::now() + Duration::from_secs(config.startup_grace_secs);
    let pool = connect_db(&config, deadline).await;
    let redis = connect_redis(&config, deadline).await;

    let spool = match Spool::new(&config.spool.dir) {
        Ok(spool) => spool,
        Err(e) => {
            error!(dir = %config.spool.dir, error = %e, "unable to open spool directory");
            std::process::exit(1);
        }
    };

    let backend = Arc::new(PostgresBackend::start(
        pool,
        redis.clone(),
        spool.clone(),
        PostgresBackendConfig {
            batch_timeout: Duration::from_millis(config.batch.timeout_ms),
            batch_capacity: config.batch.capacity,
            ..Default::default()
        },
    ));

    // replay anything left over from a previous run, then keep walking
    let walker = SpoolWalker::start(
        spool,
        backend.clone(),
        Duration::from_secs(config.spool.interval_secs),
    );

    let registry = Arc::new(build_registry());
    let cache = Arc::new(ChannelCache::new(CHANNEL_CACHE_TTL));
    let queue = Arc::new(PriorityQueue::new(redis.clone(), MSG_QUEUE_TYPE));
    let dethrottler = Dethrottler::start(redis.clone(), MSG_QUEUE_TYPE);

    let backend_dyn: Arc<dyn Backend> = backend.clone();
    let foreman = Foreman::new(
        queue.clone(),
        backend_dyn.clone(),
        registry.clone(),
        cache.clone(),
        SenderPoolConfig {
            workers: config.sender.max_workers,
            default_send_timeout: Duration::from_secs(config.sender.default_send_timeout_secs),
        },
    );
    foreman.start();

    let app = create_router(AppState {
        registry,
        cache,
        backend: backend_dyn,
        queue: Some(queue),
        domain: config.domain.clone(),
    })
    .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.http.address, config.http.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "unable to bind listener");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "courier started");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "http server error");
    }

    info!("shutting down");
    foreman.stop().await;
    dethrottler.stop().await;
    walker.stop().await;
    // last: draining workers above were still queueing into the committers
    backend.stop().await;
    info!("shutdown complete");
}

/// Builds the handler registry. Provider adapters register themselves here
/// as they are linked in.
fn build_registry() -> HandlerRegistry {
    HandlerRegistry::new()
}

async fn connect_db(config: &AppConfig, deadline: Instant) -> PgPool {
    loop {
        match PgPoolOptions::new()
            .max_connections(config.db.max_connections)
            .connect(&config.db.url)
            .await
        {
            Ok(pool) => {
                info!("connected to database");
                return pool;
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    error!(error = %e, "unable to connect to database");
                    std::process::exit(2);
                }
                warn!(error = %e, "database not ready, retrying");
                tokio::time::sleep(RETRY_CONNECT_DELAY).await;
            }
        }
    }
}

async fn connect_redis(config: &AppConfig, deadline: Instant) -> ConnectionManager {
    let client = match redis::Client::open(config.redis.url.as_str()) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "invalid redis url");
            std::process::exit(1);
        }
    };

    loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(conn) => {
                info!("connected to redis");
                return conn;
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    error!(error = %e, "unable to connect to redis");
                    std::process::exit(2);
                }
                warn!(error = %e, "redis not ready, retrying");
                tokio::time::sleep(RETRY_CONNECT_DELAY).await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
