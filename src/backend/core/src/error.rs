//! Error handling for the gateway core.
//!
//! This module provides:
//! - Machine-readable error codes with HTTP status mapping
//! - User-facing messages kept separate from internal detail
//! - Severity-aware logging through tracing
//! - Metrics integration for error tracking
//!
//! Denials produced by the authorization pipeline are values
//! ([`crate::authz::Decision`]), not errors; `GatewayError` covers
//! infrastructure and collaborator failures.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication / Authorization (1000-1099)
    AuthenticationRequired,
    SessionExpired,
    PermissionDenied,
    RouteNotPermitted,
    TokenRenewalFailed,

    // Policy source (2000-2099)
    PolicySourceUnavailable,
    InvalidPolicyPattern,

    // Identity source (2100-2199)
    IdentitySourceUnavailable,

    // Cache / session backends (2200-2299)
    CacheBackendUnavailable,
    SessionBackendUnavailable,

    // Serialization (2300-2399)
    SerializationError,

    // Upstream forwarding (3000-3099)
    UpstreamUnavailable,
    UpstreamTimeout,
    NetworkError,

    // Request handling (4000-4099)
    RequestTooLarge,
    InvalidRequest,

    // Configuration (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Authentication / Authorization
            Self::AuthenticationRequired => 1000,
            Self::SessionExpired => 1001,
            Self::PermissionDenied => 1002,
            Self::RouteNotPermitted => 1003,
            Self::TokenRenewalFailed => 1004,

            // Policy source
            Self::PolicySourceUnavailable => 2000,
            Self::InvalidPolicyPattern => 2001,

            // Identity source
            Self::IdentitySourceUnavailable => 2100,

            // Cache / session backends
            Self::CacheBackendUnavailable => 2200,
            Self::SessionBackendUnavailable => 2201,

            // Serialization
            Self::SerializationError => 2300,

            // Upstream forwarding
            Self::UpstreamUnavailable => 3000,
            Self::UpstreamTimeout => 3001,
            Self::NetworkError => 3002,

            // Request handling
            Self::RequestTooLarge => 4000,
            Self::InvalidRequest => 4001,

            // Configuration
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            // Internal
            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Unauthorized (401)
            Self::AuthenticationRequired
            | Self::SessionExpired
            | Self::TokenRenewalFailed => StatusCode::UNAUTHORIZED,

            // Forbidden (403)
            Self::PermissionDenied | Self::RouteNotPermitted => StatusCode::FORBIDDEN,

            // Service Unavailable (503)
            Self::PolicySourceUnavailable
            | Self::IdentitySourceUnavailable
            | Self::CacheBackendUnavailable
            | Self::SessionBackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            // Bad Gateway (502)
            Self::UpstreamUnavailable | Self::NetworkError => StatusCode::BAD_GATEWAY,

            // Gateway Timeout (504)
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,

            // Payload Too Large (413)
            Self::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,

            // Bad Request (400)
            Self::InvalidRequest => StatusCode::BAD_REQUEST,

            // Internal Server Error (500)
            Self::InvalidPolicyPattern
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PolicySourceUnavailable
                | Self::IdentitySourceUnavailable
                | Self::CacheBackendUnavailable
                | Self::SessionBackendUnavailable
                | Self::UpstreamUnavailable
                | Self::UpstreamTimeout
                | Self::NetworkError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "auth",
            2000..=2099 => "policy",
            2100..=2199 => "identity",
            2200..=2299 => "cache",
            2300..=2399 => "serialization",
            3000..=3099 => "upstream",
            4000..=4099 => "request",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected per-request outcomes (denials, expired sessions)
    Low,
    /// Degraded-but-handled conditions (renewal failures, upstream timeouts)
    Medium,
    /// Collaborator outages the engine degrades around
    High,
    /// Failures that threaten the serving path itself
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            // Low severity - per-request denials and client faults
            ErrorCode::AuthenticationRequired
            | ErrorCode::SessionExpired
            | ErrorCode::PermissionDenied
            | ErrorCode::RouteNotPermitted
            | ErrorCode::RequestTooLarge
            | ErrorCode::InvalidRequest => Self::Low,

            // Medium severity - handled degradation
            ErrorCode::TokenRenewalFailed
            | ErrorCode::UpstreamTimeout
            | ErrorCode::CacheBackendUnavailable => Self::Medium,

            // High severity - collaborator outages
            ErrorCode::PolicySourceUnavailable
            | ErrorCode::IdentitySourceUnavailable
            | ErrorCode::SessionBackendUnavailable
            | ErrorCode::UpstreamUnavailable
            | ErrorCode::NetworkError
            | ErrorCode::InvalidPolicyPattern
            | ErrorCode::SerializationError => Self::High,

            // Critical severity
            ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the gateway core.
///
/// Supports structured error codes, user-friendly vs internal messages,
/// source chaining, HTTP status mapping, and metrics integration.
#[derive(Error, Debug)]
pub struct GatewayError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl GatewayError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create an unauthenticated error (401).
    pub fn unauthenticated(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::AuthenticationRequired, message)
    }

    /// Create a permission-denied error (403).
    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    /// Create an invalid-request error (400).
    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "gateway_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Whether the request was successful (always false for errors)
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code
    pub numeric_code: u32,

    /// User-friendly error message
    pub message: String,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&GatewayError> for ErrorResponse {
    fn from(error: &GatewayError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap any error as an internal error with a message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap any error under a specific error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| GatewayError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| {
            GatewayError::with_internal(code, "A collaborator request failed", e.to_string())
                .with_source(e)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for GatewayError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (
                ErrorCode::CacheBackendUnavailable,
                "Unable to connect to cache",
            )
        } else if error.is_timeout() {
            (
                ErrorCode::CacheBackendUnavailable,
                "Cache operation timed out",
            )
        } else {
            (ErrorCode::CacheBackendUnavailable, "A cache error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (
                ErrorCode::UpstreamTimeout,
                "External service request timed out",
            )
        } else if error.is_connect() {
            (
                ErrorCode::NetworkError,
                "Failed to connect to external service",
            )
        } else if error.is_status() {
            (
                ErrorCode::UpstreamUnavailable,
                "External service returned an error",
            )
        } else {
            (ErrorCode::NetworkError, "Network error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (
                ErrorCode::ConfigurationError,
                "Configuration error occurred",
            ),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
