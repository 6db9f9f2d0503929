//! REST health probe: GET on the configured health endpoint.
//!
//! Success requires the transport to return within the timeout and the
//! status code to be in the expected set. A JSON body is consulted for an
//! optional top-level `status` field; `"unhealthy"` fails the probe
//! regardless of status code. Non-JSON bodies are fine.

use super::{classify_transport, parse_retry_after, with_retries, Attempt, BODY_RETENTION_CAP};
use chrono::Utc;
use serde_json::Value;
use std::time::Instant;
use tokio::sync::watch;
use tsh_common::classify::classify_http_status;
use tsh_common::config::ServerConfig;
use tsh_common::{ErrorCategory, ProbeEvidence, ProbeOutcome, ProbePath, RestEvidence, ServerName};

/// Body `status` values accepted by the health contract.
const KNOWN_STATUS_VALUES: [&str; 3] = ["healthy", "degraded", "unhealthy"];

/// Longest string value kept verbatim in the body digest.
const DIGEST_VALUE_CAP: usize = 120;

/// Entries kept in the body digest.
const DIGEST_ENTRY_CAP: usize = 8;

/// REST-path probe client.
#[derive(Clone)]
pub struct RestProbe {
    client: reqwest::Client,
}

impl RestProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Run one probe, retrying retryable failures internally.
    pub async fn probe(
        &self,
        config: &ServerConfig,
        cancel: &watch::Receiver<bool>,
    ) -> ProbeOutcome {
        let retries = config.retries(ProbePath::Rest);
        let timeout = config.probe_timeout(ProbePath::Rest);
        with_retries(retries, timeout, cancel, || Box::pin(self.attempt(config)))
            .await
    }

    async fn attempt(&self, config: &ServerConfig) -> Attempt {
        let server = config.server_name();
        let Some(endpoint) = config.endpoint(ProbePath::Rest) else {
            return Attempt::plain(internal_failure(
                server,
                "REST probe dispatched without an endpoint",
            ));
        };
        let timeout = config.probe_timeout(ProbePath::Rest);

        let mut builder = self.client.get(endpoint).timeout(timeout);
        for (name, value) in &config.auth_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let started_at = Utc::now();
        let started = Instant::now();

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                return Attempt::plain(ProbeOutcome::failure(
                    server,
                    ProbePath::Rest,
                    started_at,
                    started.elapsed(),
                    classify_transport(&e),
                    e.to_string(),
                    ProbeEvidence::Rest(RestEvidence::default()),
                ));
            }
        };

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                return Attempt {
                    outcome: ProbeOutcome::failure(
                        server,
                        ProbePath::Rest,
                        started_at,
                        started.elapsed(),
                        classify_transport(&e),
                        e.to_string(),
                        ProbeEvidence::Rest(RestEvidence {
                            status_code: Some(status),
                            response_body_digest: None,
                        }),
                    ),
                    retry_after,
                };
            }
        };
        let elapsed = started.elapsed();

        // Only the capped prefix is ever inspected or retained.
        let retained = &body[..body.len().min(BODY_RETENTION_CAP)];
        let parsed: Option<Value> = serde_json::from_slice(retained).ok();
        let digest = parsed.as_ref().and_then(Value::as_object).map(digest_map);
        let evidence = ProbeEvidence::Rest(RestEvidence {
            status_code: Some(status),
            response_body_digest: digest,
        });

        let accepted = config.rest_expected_status_codes.contains(&status);
        let body_status = parsed
            .as_ref()
            .and_then(|v| v.get("status"))
            .and_then(Value::as_str);

        let outcome = match body_status {
            Some("unhealthy") => ProbeOutcome::failure(
                server,
                ProbePath::Rest,
                started_at,
                elapsed,
                ErrorCategory::RestReportedUnhealthy,
                format!("HTTP {status}: body reported status 'unhealthy'"),
                evidence,
            ),
            Some(other) if !KNOWN_STATUS_VALUES.contains(&other) => ProbeOutcome::failure(
                server,
                ProbePath::Rest,
                started_at,
                elapsed,
                ErrorCategory::RestStatusUnexpected,
                format!("HTTP {status}: unrecognized body status '{other}'"),
                evidence,
            ),
            _ if accepted => {
                ProbeOutcome::success(server, ProbePath::Rest, started_at, elapsed, evidence)
            }
            _ => {
                let category = classify_http_status(status)
                    .unwrap_or(ErrorCategory::RestStatusUnexpected);
                ProbeOutcome::failure(
                    server,
                    ProbePath::Rest,
                    started_at,
                    elapsed,
                    category,
                    format!("HTTP {status} not in expected status set"),
                    evidence,
                )
            }
        };

        Attempt {
            outcome,
            retry_after,
        }
    }
}

/// Truncated top-level map retained for diagnostics.
fn digest_map(obj: &serde_json::Map<String, Value>) -> serde_json::Map<String, Value> {
    let mut digest = serde_json::Map::new();
    for (key, value) in obj.iter().take(DIGEST_ENTRY_CAP) {
        let kept = match value {
            Value::String(s) if s.len() > DIGEST_VALUE_CAP => {
                let mut cut = DIGEST_VALUE_CAP;
                while !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                Value::String(format!("{}…", &s[..cut]))
            }
            Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null => value.clone(),
            Value::Array(_) | Value::Object(_) => Value::String("[truncated]".to_string()),
        };
        digest.insert(key.clone(), kept);
    }
    digest
}

fn internal_failure(server: ServerName, message: &str) -> ProbeOutcome {
    ProbeOutcome::failure(
        server,
        ProbePath::Rest,
        Utc::now(),
        std::time::Duration::ZERO,
        ErrorCategory::Internal,
        message,
        ProbeEvidence::Rest(RestEvidence::default()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn config(endpoint: String) -> ServerConfig {
        ServerConfig {
            name: "s1".to_string(),
            protocol_endpoint: None,
            protocol_enabled: false,
            protocol_timeout_ms: 2_000,
            protocol_retries: 0,
            expected_tools: vec![],
            rest_endpoint: Some(endpoint),
            rest_enabled: true,
            rest_timeout_ms: 2_000,
            rest_retries: 0,
            rest_expected_status_codes: vec![200],
            auth_headers: BTreeMap::new(),
            weight_protocol: 1.0,
            weight_rest: 1.0,
            require_both_success: false,
            closed_requires_all_paths: true,
            check_interval_ms: None,
        }
    }

    fn probe() -> RestProbe {
        RestProbe::new(reqwest::Client::new())
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn healthy_json_body_succeeds() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({"status": "healthy", "uptime": 12}));
            })
            .await;

        let outcome = probe()
            .probe(&config(server.url("/health")), &no_cancel())
            .await;

        mock.assert_async().await;
        assert!(outcome.success);
        let evidence = outcome.rest_evidence().unwrap();
        assert_eq!(evidence.status_code, Some(200));
        let digest = evidence.response_body_digest.as_ref().unwrap();
        assert_eq!(digest.get("status").unwrap(), "healthy");
    }

    #[tokio::test]
    async fn non_json_body_with_accepted_status_is_success() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200).body("OK");
            })
            .await;

        let outcome = probe()
            .probe(&config(server.url("/health")), &no_cancel())
            .await;

        assert!(outcome.success);
        assert!(outcome
            .rest_evidence()
            .unwrap()
            .response_body_digest
            .is_none());
    }

    #[tokio::test]
    async fn degraded_body_status_is_still_success() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200)
                    .json_body(serde_json::json!({"status": "degraded"}));
            })
            .await;

        let outcome = probe()
            .probe(&config(server.url("/health")), &no_cancel())
            .await;

        assert!(outcome.success);
    }

    #[tokio::test]
    async fn unhealthy_body_fails_despite_accepted_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200)
                    .json_body(serde_json::json!({"status": "unhealthy"}));
            })
            .await;

        let outcome = probe()
            .probe(&config(server.url("/health")), &no_cancel())
            .await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.error_category,
            Some(ErrorCategory::RestReportedUnhealthy)
        );
    }

    #[tokio::test]
    async fn unrecognized_body_status_fails() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200)
                    .json_body(serde_json::json!({"status": "on-fire"}));
            })
            .await;

        let outcome = probe()
            .probe(&config(server.url("/health")), &no_cancel())
            .await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.error_category,
            Some(ErrorCategory::RestStatusUnexpected)
        );
    }

    #[tokio::test]
    async fn http_500_maps_to_http_5xx() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(500).body("boom");
            })
            .await;

        let outcome = probe()
            .probe(&config(server.url("/health")), &no_cancel())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_category, Some(ErrorCategory::Http5xx));
        assert_eq!(outcome.rest_evidence().unwrap().status_code, Some(500));
    }

    #[tokio::test]
    async fn expanded_status_set_accepts_204() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(204);
            })
            .await;

        let mut cfg = config(server.url("/health"));
        cfg.rest_expected_status_codes = vec![200, 204];
        let outcome = probe().probe(&cfg, &no_cancel()).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn accepted_family_code_outside_set_is_rest_status_unexpected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(204);
            })
            .await;

        let outcome = probe()
            .probe(&config(server.url("/health")), &no_cancel())
            .await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.error_category,
            Some(ErrorCategory::RestStatusUnexpected)
        );
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_within_the_check() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(503).body("warming up");
            })
            .await;

        let mut cfg = config(server.url("/health"));
        cfg.rest_retries = 2;
        cfg.rest_timeout_ms = 50; // keeps the backoff cap tiny
        let outcome = probe().probe(&cfg, &no_cancel()).await;

        assert!(!outcome.success);
        assert_eq!(mock.hits_async().await, 3);
    }

    #[tokio::test]
    async fn timeout_is_network_timeout_and_bounded() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200).delay(Duration::from_millis(500));
            })
            .await;

        let mut cfg = config(server.url("/health"));
        cfg.rest_timeout_ms = 100;
        let outcome = probe().probe(&cfg, &no_cancel()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_category, Some(ErrorCategory::NetworkTimeout));
        // duration stays within timeout + scheduling slack
        assert!(outcome.duration_ms <= 100 + 100);
    }

    #[tokio::test]
    async fn auth_headers_are_attached() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/health")
                    .header("x-api-key", "sekrit");
                then.status(200);
            })
            .await;

        let mut cfg = config(server.url("/health"));
        cfg.auth_headers
            .insert("X-Api-Key".to_string(), "sekrit".to_string());
        let outcome = probe().probe(&cfg, &no_cancel()).await;

        mock.assert_async().await;
        assert!(outcome.success);
    }

    #[test]
    fn digest_truncates_long_values_and_composites() {
        let body = serde_json::json!({
            "status": "healthy",
            "detail": "x".repeat(500),
            "nested": {"a": 1},
            "list": [1, 2, 3]
        });
        let digest = digest_map(body.as_object().unwrap());
        assert_eq!(digest.get("status").unwrap(), "healthy");
        let detail = digest.get("detail").unwrap().as_str().unwrap();
        assert!(detail.len() < 500);
        assert!(detail.ends_with('…'));
        assert_eq!(digest.get("nested").unwrap(), "[truncated]");
        assert_eq!(digest.get("list").unwrap(), "[truncated]");
    }
}
