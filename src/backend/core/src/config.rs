//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Policy store / refresher configuration
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Permission resolver configuration
    #[serde(default)]
    pub permissions: PermissionConfig,

    /// Session store configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Upstream forwarding configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Internal API configuration
    #[serde(default)]
    pub internal: InternalConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Base URL of the policy source service
    #[serde(default = "default_policy_source_url")]
    pub source_url: String,

    /// Interval between scheduled refreshes
    #[serde(with = "humantime_serde", default = "default_refresh_interval")]
    pub refresh_interval: Duration,

    /// Delay before the first refresh after startup, so the policy source
    /// and its own dependencies have time to come up
    #[serde(with = "humantime_serde", default = "default_startup_grace")]
    pub startup_grace: Duration,

    /// Timeout for a single fetch attempt
    #[serde(with = "humantime_serde", default = "default_attempt_timeout")]
    pub attempt_timeout: Duration,

    /// Maximum fetch attempts per refresh cycle
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff between attempts
    #[serde(with = "humantime_serde", default = "default_backoff_initial")]
    pub backoff_initial: Duration,

    /// Backoff ceiling
    #[serde(with = "humantime_serde", default = "default_backoff_cap")]
    pub backoff_cap: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            source_url: default_policy_source_url(),
            refresh_interval: default_refresh_interval(),
            startup_grace: default_startup_grace(),
            attempt_timeout: default_attempt_timeout(),
            max_attempts: default_max_attempts(),
            backoff_initial: default_backoff_initial(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionConfig {
    /// Base URL of the identity source service
    #[serde(default = "default_identity_source_url")]
    pub source_url: String,

    /// Timeout for identity source calls
    #[serde(with = "humantime_serde", default = "default_identity_timeout")]
    pub source_timeout: Duration,

    /// Maximum entries in the in-process tier
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,

    /// TTL for in-process tier entries
    #[serde(with = "humantime_serde", default = "default_l1_ttl")]
    pub l1_ttl: Duration,

    /// TTL for distributed tier entries
    #[serde(with = "humantime_serde", default = "default_l2_ttl")]
    pub l2_ttl: Duration,

    /// Timeout for a single distributed tier operation
    #[serde(with = "humantime_serde", default = "default_l2_op_timeout")]
    pub l2_op_timeout: Duration,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            source_url: default_identity_source_url(),
            source_timeout: default_identity_timeout(),
            l1_capacity: default_l1_capacity(),
            l1_ttl: default_l1_ttl(),
            l2_ttl: default_l2_ttl(),
            l2_op_timeout: default_l2_op_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Cookie carrying the session handle
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Fallback header carrying the session handle (non-browser clients)
    #[serde(default = "default_session_header")]
    pub header_name: String,

    /// Sliding TTL for stored session records
    #[serde(with = "humantime_serde", default = "default_session_ttl")]
    pub ttl: Duration,

    /// Lifetime of a refresh token, counted from issue or rotation
    #[serde(with = "humantime_serde", default = "default_refresh_ttl")]
    pub refresh_ttl: Duration,

    /// TTL for the online-presence marker
    #[serde(with = "humantime_serde", default = "default_heartbeat_ttl")]
    pub heartbeat_ttl: Duration,

    /// Token endpoint used for refresh-token exchanges
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// OAuth2 client id for the refresh exchange
    #[serde(default)]
    pub client_id: String,

    /// OAuth2 client secret for the refresh exchange
    #[serde(default)]
    pub client_secret: String,

    /// Timeout for the refresh exchange
    #[serde(with = "humantime_serde", default = "default_renewal_timeout")]
    pub renewal_timeout: Duration,

    /// Timeout for a single session-store operation
    #[serde(with = "humantime_serde", default = "default_session_op_timeout")]
    pub op_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            header_name: default_session_header(),
            ttl: default_session_ttl(),
            refresh_ttl: default_refresh_ttl(),
            heartbeat_ttl: default_heartbeat_ttl(),
            token_url: default_token_url(),
            client_id: String::new(),
            client_secret: String::new(),
            renewal_timeout: default_renewal_timeout(),
            op_timeout: default_session_op_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL allowed requests are forwarded to
    #[serde(default = "default_upstream_url")]
    pub base_url: String,

    /// Timeout for a forwarded request
    #[serde(with = "humantime_serde", default = "default_upstream_timeout")]
    pub timeout: Duration,

    /// Maximum buffered request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            timeout: default_upstream_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InternalConfig {
    /// Shared secret required on internal endpoints. When unset the
    /// internal surface is open (development only).
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_policy_source_url() -> String { "http://localhost:8081".to_string() }
fn default_refresh_interval() -> Duration { Duration::from_secs(300) }
fn default_startup_grace() -> Duration { Duration::from_secs(10) }
fn default_attempt_timeout() -> Duration { Duration::from_secs(10) }
fn default_max_attempts() -> u32 { 3 }
fn default_backoff_initial() -> Duration { Duration::from_secs(2) }
fn default_backoff_cap() -> Duration { Duration::from_secs(10) }
fn default_identity_source_url() -> String { "http://localhost:8081".to_string() }
fn default_identity_timeout() -> Duration { Duration::from_secs(3) }
fn default_l1_capacity() -> usize { 10_000 }
fn default_l1_ttl() -> Duration { Duration::from_secs(60) }
fn default_l2_ttl() -> Duration { Duration::from_secs(3600) }
fn default_l2_op_timeout() -> Duration { Duration::from_secs(1) }
fn default_cookie_name() -> String { "SESSION_ID".to_string() }
fn default_session_header() -> String { "X-Session-Id".to_string() }
fn default_session_ttl() -> Duration { Duration::from_secs(24 * 3600) }
fn default_refresh_ttl() -> Duration { Duration::from_secs(30 * 24 * 3600) }
fn default_heartbeat_ttl() -> Duration { Duration::from_secs(300) }
fn default_token_url() -> String { "http://localhost:8082/token".to_string() }
fn default_renewal_timeout() -> Duration { Duration::from_secs(5) }
fn default_session_op_timeout() -> Duration { Duration::from_secs(2) }
fn default_upstream_url() -> String { "http://localhost:8090".to_string() }
fn default_upstream_timeout() -> Duration { Duration::from_secs(30) }
fn default_max_body_bytes() -> usize { 10 * 1024 * 1024 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PORTCULLIS").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PORTCULLIS").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_values() {
        let config = Config::default();
        assert_eq!(config.policy.refresh_interval, Duration::from_secs(300));
        assert_eq!(config.policy.startup_grace, Duration::from_secs(10));
        assert_eq!(config.policy.attempt_timeout, Duration::from_secs(10));
        assert_eq!(config.policy.max_attempts, 3);
        assert_eq!(config.policy.backoff_initial, Duration::from_secs(2));
        assert_eq!(config.policy.backoff_cap, Duration::from_secs(10));
        assert_eq!(config.permissions.l1_capacity, 10_000);
        assert_eq!(config.permissions.l1_ttl, Duration::from_secs(60));
        assert_eq!(config.permissions.l2_ttl, Duration::from_secs(3600));
        assert_eq!(config.session.ttl, Duration::from_secs(86_400));
        assert_eq!(config.session.refresh_ttl, Duration::from_secs(30 * 86_400));
        assert_eq!(config.session.cookie_name, "SESSION_ID");
        assert_eq!(config.session.heartbeat_ttl, Duration::from_secs(300));
        assert_eq!(config.session.op_timeout, Duration::from_secs(2));
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000

[policy]
source_url = "http://iam.internal:8081"
refresh_interval = "2m"

[permissions]
l1_capacity = 500
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.policy.source_url, "http://iam.internal:8081");
        assert_eq!(config.policy.refresh_interval, Duration::from_secs(120));
        assert_eq!(config.permissions.l1_capacity, 500);
        // untouched sections keep defaults
        assert_eq!(config.permissions.l1_ttl, Duration::from_secs(60));
    }
}
