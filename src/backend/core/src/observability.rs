//! Logging and metrics bootstrap.

use crate::config::ObservabilityConfig;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level so operators can raise
/// verbosity without a redeploy.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.json_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Install the Prometheus recorder and return the handle the `/metrics`
/// endpoint renders from.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

/// Register descriptions for every metric the gateway emits.
fn describe_metrics() {
    // Counters
    describe_counter!(
        "gateway_decisions_total",
        "Authorization decisions by outcome (allow, deny, error)"
    );
    describe_counter!(
        "gateway_errors_total",
        "Errors constructed, by code and category"
    );
    describe_counter!(
        "gateway_policy_refresh_total",
        "Policy refresh cycles by outcome"
    );
    describe_counter!(
        "gateway_permission_lookups_total",
        "Permission cache lookups by tier and result"
    );
    describe_counter!(
        "gateway_permission_fetches_total",
        "Permission fetches from the identity source by result"
    );
    describe_counter!(
        "gateway_session_renewals_total",
        "Session token renewals by outcome"
    );

    // Gauges
    describe_gauge!(
        "gateway_policies_loaded",
        "Number of endpoint policies in the active snapshot"
    );

    // Histograms
    describe_histogram!(
        "gateway_decision_duration_seconds",
        "Time to restore the session and evaluate one request"
    );
    describe_histogram!(
        "gateway_upstream_duration_seconds",
        "Time spent waiting on the upstream for forwarded requests"
    );
}
