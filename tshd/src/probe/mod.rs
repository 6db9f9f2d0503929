//! Probe clients for the two paths.
//!
//! Both probes share one contract: `probe(config, cancel) -> ProbeOutcome`.
//! Failures are data, never `Err` — every transport, HTTP, and validation
//! failure maps to an error category on the outcome. Retries happen inside
//! the probe; only the final outcome escapes.

pub mod protocol;
pub mod rest;

use rand::random;
use reqwest::header::RETRY_AFTER;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use tsh_common::config::EngineConfig;
use tsh_common::ErrorCategory;
use tsh_common::ProbeOutcome;

/// Maximum response body retained for diagnostics.
pub const BODY_RETENTION_CAP: usize = 16 * 1024;

/// One HTTP client (connection pool) per path.
#[derive(Clone)]
pub struct ProbeClients {
    pub protocol: reqwest::Client,
    pub rest: reqwest::Client,
}

impl ProbeClients {
    /// Build both pools from the engine configuration.
    pub fn build(config: &EngineConfig) -> Result<Self, reqwest::Error> {
        let build_one = || {
            reqwest::Client::builder()
                .user_agent(concat!("tshd/", env!("CARGO_PKG_VERSION")))
                .pool_max_idle_per_host(config.pool_max_idle_per_host)
                .pool_idle_timeout(Duration::from_millis(config.pool_idle_timeout_ms))
                .build()
        };
        Ok(Self {
            protocol: build_one()?,
            rest: build_one()?,
        })
    }
}

/// One probe attempt plus transient retry hints.
pub(crate) struct Attempt {
    pub outcome: ProbeOutcome,
    /// Parsed `Retry-After` seconds, when the response carried one.
    pub retry_after: Option<Duration>,
}

impl Attempt {
    pub(crate) fn plain(outcome: ProbeOutcome) -> Self {
        Self {
            outcome,
            retry_after: None,
        }
    }
}

/// Drive attempts with per-category exponential backoff.
///
/// Backoff is `base * 2^k` scaled by jitter in [0.5, 1.5] and capped at the
/// probe timeout; `Retry-After` replaces the base for the categories that
/// honor it. The sleep races the cancellation signal; once cancellation is
/// observed the latest outcome is returned immediately.
pub(crate) async fn with_retries<'a>(
    retries: u32,
    timeout: Duration,
    cancel: &watch::Receiver<bool>,
    mut attempt: impl FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = Attempt> + Send + 'a>>,
) -> ProbeOutcome {
    let mut cancel = cancel.clone();
    for k in 0..=retries {
        let Attempt {
            outcome,
            retry_after,
        } = attempt().await;

        if outcome.success || k == retries {
            return outcome;
        }
        let Some(category) = outcome.error_category else {
            return outcome;
        };
        if !category.retryable() || *cancel.borrow() {
            return outcome;
        }

        let base = retry_after
            .or_else(|| category.base_backoff())
            .unwrap_or(Duration::from_millis(500));
        let scaled = base.saturating_mul(1 << k.min(16));
        let jitter = 0.5 + random::<f64>();
        let delay = scaled.mul_f64(jitter).min(timeout);
        debug!(
            server = %outcome.server,
            path = %outcome.path,
            attempt = k + 1,
            delay_ms = delay.as_millis() as u64,
            %category,
            "retrying probe"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return outcome;
                }
            }
        }
    }
    unreachable!("retry loop always returns")
}

/// Classify a reqwest transport error.
pub(crate) fn classify_transport(err: &reqwest::Error) -> ErrorCategory {
    if err.is_timeout() {
        return ErrorCategory::NetworkTimeout;
    }
    if is_tls_error(err) {
        return ErrorCategory::TransportTls;
    }
    ErrorCategory::TransportConnection
}

/// reqwest does not expose a TLS error kind; sniff the source chain.
fn is_tls_error(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return true;
        }
        source = e.source();
    }
    false
}

/// Parse a `Retry-After` header carrying delay seconds.
///
/// The HTTP-date form is ignored; callers fall back to the category base.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
