//! Portcullis server entry point.
//!
//! Wires the policy refresher, permission resolver, session store and
//! upstream forwarder into a single axum service.

use std::net::SocketAddr;
use std::sync::Arc;

use portcullis_core::{
    api::{self, AppState, UpstreamClient},
    config::Config,
    observability,
    permission::{
        HttpIdentitySource, InProcessTier, PermissionResolver, PermissionTier, RedisTier,
    },
    policy::{HttpPolicySource, PolicyRefresher, PolicyStore},
    session::{HttpTokenRenewer, RedisSessionBackend, SessionStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize observability
    observability::init_tracing(&config.observability);
    let metrics = observability::init_metrics()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Portcullis gateway"
    );

    // Create Redis client (connections are established lazily)
    let redis_client = redis::Client::open(config.redis.url.as_str())
        .map_err(|e| anyhow::anyhow!("Failed to create Redis client: {}", e))?;
    tracing::info!("Redis client created for {}", config.redis.url);

    // Policy store and background refresher
    let policies = Arc::new(PolicyStore::new());
    let policy_source = Arc::new(HttpPolicySource::new(
        config.policy.source_url.clone(),
        config.policy.attempt_timeout,
    ));
    let refresher = Arc::new(PolicyRefresher::new(
        policies.clone(),
        policy_source,
        config.policy.clone(),
    ));

    // Tiered permission resolver: in-process first, Redis behind it
    let tiers: Vec<Arc<dyn PermissionTier>> = vec![
        Arc::new(InProcessTier::new(
            config.permissions.l1_capacity,
            config.permissions.l1_ttl,
        )),
        Arc::new(RedisTier::with_client(
            redis_client.clone(),
            config.permissions.l2_ttl,
            config.permissions.l2_op_timeout,
        )),
    ];
    let identity_source = Arc::new(HttpIdentitySource::new(
        config.permissions.source_url.clone(),
        config.permissions.source_timeout,
    ));
    let permissions = PermissionResolver::new(tiers, identity_source);

    // Session store backed by Redis, renewing through the token endpoint
    let session_backend = Arc::new(RedisSessionBackend::with_client(
        redis_client,
        config.session.op_timeout,
    ));
    let renewer = Arc::new(HttpTokenRenewer::new(
        config.session.token_url.clone(),
        config.session.client_id.clone(),
        config.session.client_secret.clone(),
        config.session.renewal_timeout,
    ));
    let sessions = Arc::new(SessionStore::new(
        session_backend,
        renewer,
        config.session.clone(),
    ));

    // Upstream forwarder
    let upstream = UpstreamClient::new(&config.upstream);

    let config = Arc::new(config);
    let state = AppState {
        config: config.clone(),
        policies,
        refresher: refresher.clone(),
        permissions,
        sessions,
        upstream,
        metrics: Some(metrics),
    };

    // Start the refresh loop before accepting traffic
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let refresh_handle = refresher.start(shutdown_rx);

    // Build router
    let app = api::build_router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the refresh loop before exiting
    let _ = shutdown_tx.send(true);
    let _ = refresh_handle.await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
