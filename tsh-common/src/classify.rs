//! Failure taxonomy and per-category retry policy.
//!
//! Classification is a pure function from an observed failure to an
//! [`ErrorCategory`]; every category carries two tags (`retryable`,
//! `counts_as_failure`) and an optional base backoff. The retry policy is
//! encoded per category, not per probe type.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Category assigned to every failed probe attempt.
///
/// `CIRCUIT_OPEN` is suppression, not evidence: it never feeds the breaker
/// and is counted separately in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Transport did not return within the probe timeout.
    NetworkTimeout,
    /// TCP connect or mid-stream transport failure.
    TransportConnection,
    /// TLS handshake or certificate failure.
    TransportTls,
    /// HTTP 4xx other than 408/425/429 and the auth statuses.
    Http4xx,
    /// HTTP 5xx.
    Http5xx,
    /// HTTP 408 Request Timeout.
    Http408,
    /// HTTP 425 Too Early.
    Http425,
    /// HTTP 429 Too Many Requests.
    Http429,
    /// Response violated the JSON-RPC envelope or `result.tools` shape.
    ProtocolInvalidResponse,
    /// Well-formed JSON-RPC error object in the response.
    ProtocolRpcError,
    /// Expected tool names missing from `result.tools`.
    ProtocolToolsMissing,
    /// REST body reported `"status": "unhealthy"`.
    RestReportedUnhealthy,
    /// Accepted-family status code outside the expected set, or an
    /// unrecognized body `status` value.
    RestStatusUnexpected,
    /// HTTP 401/403.
    AuthFailure,
    /// Synthesized when the breaker denies a path.
    CircuitOpen,
    /// Programmer error surfaced at the service boundary.
    Internal,
}

impl ErrorCategory {
    /// Whether a probe may retry this failure within the same check.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout
                | Self::TransportConnection
                | Self::Http5xx
                | Self::Http408
                | Self::Http425
                | Self::Http429
        )
    }

    /// Whether this outcome is evidence against the server.
    ///
    /// Everything counts except breaker suppression.
    pub fn counts_as_failure(self) -> bool {
        !matches!(self, Self::CircuitOpen)
    }

    /// Base backoff before the first retry, when retryable.
    ///
    /// For 408/425/429 this is the fallback used when no parseable
    /// `Retry-After` header is present.
    pub fn base_backoff(self) -> Option<Duration> {
        match self {
            Self::NetworkTimeout | Self::Http5xx => Some(Duration::from_millis(500)),
            Self::TransportConnection => Some(Duration::from_millis(250)),
            Self::Http408 | Self::Http425 | Self::Http429 => Some(Duration::from_millis(500)),
            _ => None,
        }
    }

    /// Label used in metrics and the read API.
    pub fn label(self) -> &'static str {
        match self {
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::TransportConnection => "TRANSPORT_CONNECTION",
            Self::TransportTls => "TRANSPORT_TLS",
            Self::Http4xx => "HTTP_4XX",
            Self::Http5xx => "HTTP_5XX",
            Self::Http408 => "HTTP_408",
            Self::Http425 => "HTTP_425",
            Self::Http429 => "HTTP_429",
            Self::ProtocolInvalidResponse => "PROTOCOL_INVALID_RESPONSE",
            Self::ProtocolRpcError => "PROTOCOL_RPC_ERROR",
            Self::ProtocolToolsMissing => "PROTOCOL_TOOLS_MISSING",
            Self::RestReportedUnhealthy => "REST_REPORTED_UNHEALTHY",
            Self::RestStatusUnexpected => "REST_STATUS_UNEXPECTED",
            Self::AuthFailure => "AUTH_FAILURE",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Internal => "INTERNAL",
        }
    }

    /// All categories, for metrics family registration.
    pub fn all() -> &'static [ErrorCategory] {
        &[
            Self::NetworkTimeout,
            Self::TransportConnection,
            Self::TransportTls,
            Self::Http4xx,
            Self::Http5xx,
            Self::Http408,
            Self::Http425,
            Self::Http429,
            Self::ProtocolInvalidResponse,
            Self::ProtocolRpcError,
            Self::ProtocolToolsMissing,
            Self::RestReportedUnhealthy,
            Self::RestStatusUnexpected,
            Self::AuthFailure,
            Self::CircuitOpen,
            Self::Internal,
        ]
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Classify an HTTP error-family status code.
///
/// Returns `None` for codes outside 4xx/5xx; callers decide whether an
/// accepted-family code is expected or maps to `REST_STATUS_UNEXPECTED`.
pub fn classify_http_status(status: u16) -> Option<ErrorCategory> {
    match status {
        401 | 403 => Some(ErrorCategory::AuthFailure),
        408 => Some(ErrorCategory::Http408),
        425 => Some(ErrorCategory::Http425),
        429 => Some(ErrorCategory::Http429),
        400..=499 => Some(ErrorCategory::Http4xx),
        500..=599 => Some(ErrorCategory::Http5xx),
        _ => None,
    }
}
