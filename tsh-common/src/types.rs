//! Common types used across TSH components.

use crate::classify::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum length of a retained `error_message`, in bytes.
pub const ERROR_MESSAGE_CAP: usize = 512;

/// Unique identifier for a monitored tool server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerName(pub String);

impl ServerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the two probe paths against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbePath {
    Protocol,
    Rest,
}

impl ProbePath {
    /// Label used in metrics and log fields.
    pub fn label(self) -> &'static str {
        match self {
            Self::Protocol => "PROTOCOL",
            Self::Rest => "REST",
        }
    }
}

impl std::fmt::Display for ProbePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Tri-state-plus-unknown verdict for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Path-specific diagnostic payload carried by a [`ProbeOutcome`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeEvidence {
    Protocol(ProtocolEvidence),
    Rest(RestEvidence),
}

/// Diagnostics collected by the JSON-RPC `tools/list` probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolEvidence {
    /// Tool names in wire order.
    pub tools_returned: Vec<String>,
    /// Expected tool names absent from the response.
    pub missing_tools: Vec<String>,
    /// Non-fatal and fatal validation findings, human-readable.
    pub validation_errors: Vec<String>,
    /// Whether the response echoed the request id.
    pub jsonrpc_id_echoed: bool,
}

/// Diagnostics collected by the REST health probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestEvidence {
    /// HTTP status code, when the transport produced a response.
    pub status_code: Option<u16>,
    /// Truncated top-level JSON map of the response body, when parseable.
    pub response_body_digest: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Outcome of one probe attempt against one path of one server.
///
/// Probe clients never raise: every failure mode is encoded here, including
/// breaker suppressions (`suppressed = true`, category `CIRCUIT_OPEN`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub server: ServerName,
    pub path: ProbePath,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// True when the breaker denied the probe and this outcome was synthesized.
    #[serde(default)]
    pub suppressed: bool,
    pub evidence: ProbeEvidence,
}

impl ProbeOutcome {
    /// Build a successful outcome.
    pub fn success(
        server: ServerName,
        path: ProbePath,
        started_at: DateTime<Utc>,
        duration: Duration,
        evidence: ProbeEvidence,
    ) -> Self {
        Self {
            server,
            path,
            started_at,
            duration_ms: duration.as_millis() as u64,
            success: true,
            error_category: None,
            error_message: None,
            suppressed: false,
            evidence,
        }
    }

    /// Build a failed outcome with a capped error message.
    pub fn failure(
        server: ServerName,
        path: ProbePath,
        started_at: DateTime<Utc>,
        duration: Duration,
        category: ErrorCategory,
        message: impl Into<String>,
        evidence: ProbeEvidence,
    ) -> Self {
        Self {
            server,
            path,
            started_at,
            duration_ms: duration.as_millis() as u64,
            success: false,
            error_category: Some(category),
            error_message: Some(cap_message(message.into())),
            suppressed: false,
            evidence,
        }
    }

    /// Synthesize the suppression outcome emitted when the breaker denies a path.
    pub fn suppressed(server: ServerName, path: ProbePath) -> Self {
        let evidence = match path {
            ProbePath::Protocol => ProbeEvidence::Protocol(ProtocolEvidence::default()),
            ProbePath::Rest => ProbeEvidence::Rest(RestEvidence::default()),
        };
        Self {
            server,
            path,
            started_at: Utc::now(),
            duration_ms: 0,
            success: false,
            error_category: Some(ErrorCategory::CircuitOpen),
            error_message: Some("circuit open; probe suppressed".to_string()),
            suppressed: true,
            evidence,
        }
    }

    /// Protocol payload, if this is a protocol outcome.
    pub fn protocol_evidence(&self) -> Option<&ProtocolEvidence> {
        match &self.evidence {
            ProbeEvidence::Protocol(e) => Some(e),
            ProbeEvidence::Rest(_) => None,
        }
    }

    /// REST payload, if this is a REST outcome.
    pub fn rest_evidence(&self) -> Option<&RestEvidence> {
        match &self.evidence {
            ProbeEvidence::Rest(e) => Some(e),
            ProbeEvidence::Protocol(_) => None,
        }
    }
}

/// Truncate a message to [`ERROR_MESSAGE_CAP`] on a char boundary.
pub fn cap_message(mut msg: String) -> String {
    if msg.len() > ERROR_MESSAGE_CAP {
        let mut cut = ERROR_MESSAGE_CAP;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        msg.truncate(cut);
        msg.push('…');
    }
    msg
}

/// Aggregated result of one logical check (up to two probes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualResult {
    pub server: ServerName,
    pub observed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_outcome: Option<ProbeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rest_outcome: Option<ProbeOutcome>,
    pub overall_status: HealthStatus,
    pub overall_success: bool,
    /// Wall-clock of the fan-out: `max` of issued probe durations, not the sum.
    pub combined_duration_ms: u64,
    pub health_score: f64,
    /// Paths whose probe succeeded.
    pub available_paths: Vec<ProbePath>,
}

/// Closed-open time interval ending at "now", used by all metrics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeWindow {
    Last1m,
    Last5m,
    Last1h,
    Last24h,
}

impl TimeWindow {
    pub fn as_duration(self) -> Duration {
        match self {
            Self::Last1m => Duration::from_secs(60),
            Self::Last5m => Duration::from_secs(5 * 60),
            Self::Last1h => Duration::from_secs(60 * 60),
            Self::Last24h => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Query-string form accepted by the read API.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::Last1m),
            "5m" => Some(Self::Last5m),
            "1h" => Some(Self::Last1h),
            "24h" => Some(Self::Last24h),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Last1m => "1m",
            Self::Last5m => "5m",
            Self::Last1h => "1h",
            Self::Last24h => "24h",
        }
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_display_roundtrip() {
        let name = ServerName::new("tools-prod");
        assert_eq!(name.as_str(), "tools-prod");
        assert_eq!(name.to_string(), "tools-prod");
    }

    #[test]
    fn probe_path_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&ProbePath::Protocol).unwrap(),
            "\"PROTOCOL\""
        );
        assert_eq!(serde_json::to_string(&ProbePath::Rest).unwrap(), "\"REST\"");
    }

    #[test]
    fn health_status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"DEGRADED\""
        );
    }

    #[test]
    fn suppressed_outcome_shape() {
        let o = ProbeOutcome::suppressed(ServerName::new("s1"), ProbePath::Protocol);
        assert!(!o.success);
        assert!(o.suppressed);
        assert_eq!(o.duration_ms, 0);
        assert_eq!(o.error_category, Some(ErrorCategory::CircuitOpen));
        assert!(o.protocol_evidence().is_some());
    }

    #[test]
    fn cap_message_truncates_on_char_boundary() {
        let long = "é".repeat(ERROR_MESSAGE_CAP); // 2 bytes per char
        let capped = cap_message(long);
        assert!(capped.len() <= ERROR_MESSAGE_CAP + '…'.len_utf8());
        assert!(capped.ends_with('…'));
    }

    #[test]
    fn cap_message_leaves_short_messages_alone() {
        assert_eq!(cap_message("ok".to_string()), "ok");
    }

    #[test]
    fn window_parse_and_duration() {
        assert_eq!(TimeWindow::parse("5m"), Some(TimeWindow::Last5m));
        assert_eq!(TimeWindow::parse("2h"), None);
        assert_eq!(
            TimeWindow::Last24h.as_duration(),
            Duration::from_secs(86_400)
        );
    }
}
