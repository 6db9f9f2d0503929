//! JSON-RPC 2.0 `tools/list` probe.
//!
//! Success requires the transport to return within the timeout, the body to
//! parse as JSON, the envelope to echo version and id, `result.tools` to be
//! a list of named tools, and every expected tool name to be present.

use super::{classify_transport, parse_retry_after, with_retries, Attempt};
use chrono::Utc;
use std::time::Instant;
use tokio::sync::watch;
use tsh_common::classify::classify_http_status;
use tsh_common::config::ServerConfig;
use tsh_common::protocol::{check_envelope, EnvelopeCheck, ToolsListRequest};
use tsh_common::{
    ErrorCategory, ProbeEvidence, ProbeOutcome, ProbePath, ProtocolEvidence, ServerName,
};

/// Protocol-path probe client.
#[derive(Clone)]
pub struct ProtocolProbe {
    client: reqwest::Client,
}

impl ProtocolProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Run one probe, retrying retryable failures internally.
    pub async fn probe(
        &self,
        config: &ServerConfig,
        cancel: &watch::Receiver<bool>,
    ) -> ProbeOutcome {
        let retries = config.retries(ProbePath::Protocol);
        let timeout = config.probe_timeout(ProbePath::Protocol);
        with_retries(retries, timeout, cancel, || Box::pin(self.attempt(config)))
            .await
    }

    async fn attempt(&self, config: &ServerConfig) -> Attempt {
        let server = config.server_name();
        let Some(endpoint) = config.endpoint(ProbePath::Protocol) else {
            return Attempt::plain(internal_failure(
                server,
                "protocol probe dispatched without an endpoint",
            ));
        };
        let timeout = config.probe_timeout(ProbePath::Protocol);
        let request = ToolsListRequest::new();

        let mut builder = self
            .client
            .post(endpoint)
            .json(&request)
            .timeout(timeout);
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
                    ProbePath::Protocol,
                    started_at,
                    started.elapsed(),
                    classify_transport(&e),
                    e.to_string(),
                    empty_evidence(),
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
                        ProbePath::Protocol,
                        started_at,
                        started.elapsed(),
                        classify_transport(&e),
                        e.to_string(),
                        empty_evidence(),
                    ),
                    retry_after,
                };
            }
        };
        let elapsed = started.elapsed();

        let parsed: Result<serde_json::Value, _> = serde_json::from_slice(&body);
        let outcome = match parsed {
            Err(e) => {
                let category = classify_http_status(status)
                    .unwrap_or(ErrorCategory::ProtocolInvalidResponse);
                ProbeOutcome::failure(
                    server,
                    ProbePath::Protocol,
                    started_at,
                    elapsed,
                    category,
                    format!("HTTP {status}: body is not JSON: {e}"),
                    empty_evidence(),
                )
            }
            Ok(value) => match check_envelope(&value, &request.id) {
                EnvelopeCheck::Tools { names, warnings } => {
                    self.finish_tools(config, server, started_at, elapsed, names, warnings)
                }
                EnvelopeCheck::RpcError { code, message } => {
                    let evidence = ProbeEvidence::Protocol(ProtocolEvidence {
                        jsonrpc_id_echoed: true,
                        ..Default::default()
                    });
                    ProbeOutcome::failure(
                        server,
                        ProbePath::Protocol,
                        started_at,
                        elapsed,
                        ErrorCategory::ProtocolRpcError,
                        format!("JSON-RPC error {code}: {message}"),
                        evidence,
                    )
                }
                EnvelopeCheck::Invalid { errors, id_echoed } => {
                    // A broken envelope on an error status is attributed to
                    // the HTTP failure, not to the protocol shape.
                    let category = classify_http_status(status)
                        .unwrap_or(ErrorCategory::ProtocolInvalidResponse);
                    let evidence = ProbeEvidence::Protocol(ProtocolEvidence {
                        validation_errors: errors.clone(),
                        jsonrpc_id_echoed: id_echoed,
                        ..Default::default()
                    });
                    ProbeOutcome::failure(
                        server,
                        ProbePath::Protocol,
                        started_at,
                        elapsed,
                        category,
                        format!("HTTP {status}: {}", errors.join("; ")),
                        evidence,
                    )
                }
            },
        };

        Attempt {
            outcome,
            retry_after,
        }
    }

    fn finish_tools(
        &self,
        config: &ServerConfig,
        server: ServerName,
        started_at: chrono::DateTime<Utc>,
        elapsed: std::time::Duration,
        names: Vec<String>,
        warnings: Vec<String>,
    ) -> ProbeOutcome {
        // Order is not compared: expected_tools is a set.
        let mut missing: Vec<String> = config
            .expected_tools
            .iter()
            .filter(|expected| !names.iter().any(|n| n == *expected))
            .cloned()
            .collect();
        missing.sort();

        let evidence = ProbeEvidence::Protocol(ProtocolEvidence {
            tools_returned: names,
            missing_tools: missing.clone(),
            validation_errors: warnings,
            jsonrpc_id_echoed: true,
        });

        if missing.is_empty() {
            ProbeOutcome::success(server, ProbePath::Protocol, started_at, elapsed, evidence)
        } else {
            ProbeOutcome::failure(
                server,
                ProbePath::Protocol,
                started_at,
                elapsed,
                ErrorCategory::ProtocolToolsMissing,
                format!("missing expected tools: {}", missing.join(", ")),
                evidence,
            )
        }
    }
}

fn empty_evidence() -> ProbeEvidence {
    ProbeEvidence::Protocol(ProtocolEvidence::default())
}

fn internal_failure(server: ServerName, message: &str) -> ProbeOutcome {
    ProbeOutcome::failure(
        server,
        ProbePath::Protocol,
        Utc::now(),
        std::time::Duration::ZERO,
        ErrorCategory::Internal,
        message,
        empty_evidence(),
    )
}
