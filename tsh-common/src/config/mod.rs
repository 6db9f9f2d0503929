//! Configuration document for the health check engine.
//!
//! The engine consumes a single TOML document: global keys, circuit
//! defaults, and one `[[servers]]` table per monitored tool server. Reload
//! is a whole-document swap; partial updates are not supported. Validation
//! collects every issue before the daemon refuses to start, so operators
//! see all problems at once.

pub mod env;

use crate::types::{ProbePath, ServerName};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors raised while loading the configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration:\n{}", issues.join("\n"))]
    Invalid { issues: Vec<String> },
}

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One validation finding.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: Severity,
    pub message: String,
}

impl ConfigIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// Circuit breaker defaults shared by every server and path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CircuitSettings {
    /// Consecutive failures before a path circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes before a path circuit closes.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long an open circuit waits before admitting trial probes.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Concurrent trial probes admitted while half-open.
    #[serde(default = "default_half_open_max_inflight")]
    pub half_open_max_inflight: u32,
    /// Bounded per-path failure history retained for diagnostics.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_max_inflight: default_half_open_max_inflight(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl CircuitSettings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Configuration for one monitored tool server.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Unique identifier for this server.
    pub name: String,

    /// JSON-RPC endpoint receiving the `tools/list` probe.
    #[serde(default)]
    pub protocol_endpoint: Option<String>,
    /// Whether the protocol path is probed.
    #[serde(default = "default_true")]
    pub protocol_enabled: bool,
    #[serde(default = "default_probe_timeout_ms")]
    pub protocol_timeout_ms: u64,
    /// Retries within a single check for retryable protocol failures.
    #[serde(default = "default_retries")]
    pub protocol_retries: u32,
    /// Tool names that must appear in `result.tools`; order-insensitive.
    #[serde(default)]
    pub expected_tools: Vec<String>,

    /// Health endpoint receiving the REST GET probe.
    #[serde(default)]
    pub rest_endpoint: Option<String>,
    /// Whether the REST path is probed.
    #[serde(default = "default_true")]
    pub rest_enabled: bool,
    #[serde(default = "default_probe_timeout_ms")]
    pub rest_timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub rest_retries: u32,
    /// Status codes accepted as success on the REST path.
    #[serde(default = "default_expected_status_codes")]
    pub rest_expected_status_codes: Vec<u16>,

    /// Opaque headers attached to every outbound probe request.
    #[serde(default)]
    pub auth_headers: BTreeMap<String, String>,

    /// Aggregation weight of the protocol path.
    #[serde(default = "default_weight")]
    pub weight_protocol: f64,
    /// Aggregation weight of the REST path.
    #[serde(default = "default_weight")]
    pub weight_rest: f64,

    /// When true, any enabled-path failure makes the check UNHEALTHY.
    #[serde(default)]
    pub require_both_success: bool,

    /// When true (default), overall CLOSED requires every enabled path
    /// circuit to be CLOSED.
    #[serde(default = "default_true")]
    pub closed_requires_all_paths: bool,

    /// Per-server override of the global check interval.
    #[serde(default)]
    pub check_interval_ms: Option<u64>,
}

impl ServerConfig {
    pub fn server_name(&self) -> ServerName {
        ServerName::new(self.name.clone())
    }

    pub fn path_enabled(&self, path: ProbePath) -> bool {
        match path {
            ProbePath::Protocol => self.protocol_enabled && self.protocol_endpoint.is_some(),
            ProbePath::Rest => self.rest_enabled && self.rest_endpoint.is_some(),
        }
    }

    pub fn enabled_paths(&self) -> Vec<ProbePath> {
        [ProbePath::Protocol, ProbePath::Rest]
            .into_iter()
            .filter(|p| self.path_enabled(*p))
            .collect()
    }

    pub fn endpoint(&self, path: ProbePath) -> Option<&str> {
        match path {
            ProbePath::Protocol => self.protocol_endpoint.as_deref(),
            ProbePath::Rest => self.rest_endpoint.as_deref(),
        }
    }

    pub fn probe_timeout(&self, path: ProbePath) -> Duration {
        let ms = match path {
            ProbePath::Protocol => self.protocol_timeout_ms,
            ProbePath::Rest => self.rest_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn retries(&self, path: ProbePath) -> u32 {
        match path {
            ProbePath::Protocol => self.protocol_retries,
            ProbePath::Rest => self.rest_retries,
        }
    }

    pub fn weight(&self, path: ProbePath) -> f64 {
        match path {
            ProbePath::Protocol => self.weight_protocol,
            ProbePath::Rest => self.weight_rest,
        }
    }

    /// Effective check interval given the global default.
    pub fn effective_interval(&self, global_ms: u64) -> Duration {
        Duration::from_millis(self.check_interval_ms.unwrap_or(global_ms))
    }
}

/// The whole engine configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Global check interval in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Service-wide cap on in-flight probes; 0 means `2 × servers`.
    #[serde(default)]
    pub max_concurrent_checks: usize,

    /// Metrics retention window in milliseconds.
    #[serde(default = "default_retention_window_ms")]
    pub retention_window_ms: u64,

    /// Cadence of the metrics janitor in milliseconds.
    #[serde(default = "default_janitor_interval_ms")]
    pub janitor_interval_ms: u64,

    /// Bounded per-series sample capacity; oldest points are overwritten.
    #[serde(default = "default_series_capacity")]
    pub series_capacity: usize,

    /// Per-path HTTP pool: maximum idle connections per host.
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Per-path HTTP pool: idle connection keep-alive bound in milliseconds.
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub pool_idle_timeout_ms: u64,

    /// Listen address for the read API.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Log level filter (overrides RUST_LOG when set).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json_logging: bool,

    #[serde(default)]
    pub circuit: CircuitSettings,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            max_concurrent_checks: 0,
            retention_window_ms: default_retention_window_ms(),
            janitor_interval_ms: default_janitor_interval_ms(),
            series_capacity: default_series_capacity(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_ms: default_pool_idle_timeout_ms(),
            listen: default_listen(),
            log_level: None,
            json_logging: false,
            circuit: CircuitSettings::default(),
            servers: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load and parse a TOML config document. Validation is separate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load, apply `TSH_` environment overrides, and validate.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = Self::load(path)?;
        env::apply_overrides(&mut cfg).map_err(|errs| ConfigError::Invalid {
            issues: errs.iter().map(|e| e.to_string()).collect(),
        })?;
        let issues = cfg.validate();
        let errors: Vec<String> = issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .map(|i| i.message.clone())
            .collect();
        if !errors.is_empty() {
            return Err(ConfigError::Invalid { issues: errors });
        }
        Ok(cfg)
    }

    /// Effective probe-semaphore size.
    pub fn effective_max_concurrent(&self) -> usize {
        if self.max_concurrent_checks > 0 {
            self.max_concurrent_checks
        } else {
            (self.servers.len() * 2).max(1)
        }
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_millis(self.retention_window_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms)
    }

    /// Validate the whole document, collecting every finding.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.check_interval_ms == 0 {
            issues.push(ConfigIssue::error("check_interval_ms must be > 0"));
        }
        if self.retention_window_ms == 0 {
            issues.push(ConfigIssue::error("retention_window_ms must be > 0"));
        }
        if self.circuit.failure_threshold == 0 {
            issues.push(ConfigIssue::error("circuit.failure_threshold must be > 0"));
        }
        if self.circuit.success_threshold == 0 {
            issues.push(ConfigIssue::error("circuit.success_threshold must be > 0"));
        }
        if self.circuit.half_open_max_inflight == 0 {
            issues.push(ConfigIssue::error(
                "circuit.half_open_max_inflight must be > 0",
            ));
        }
        if self.servers.is_empty() {
            issues.push(ConfigIssue::warning("no servers configured"));
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            let name = &server.name;
            if name.is_empty() {
                issues.push(ConfigIssue::error("server with empty name"));
                continue;
            }
            if !seen.insert(name.clone()) {
                issues.push(ConfigIssue::error(format!("duplicate server name '{name}'")));
            }
            issues.extend(validate_server(server));
        }

        issues
    }
}

fn validate_server(server: &ServerConfig) -> Vec<ConfigIssue> {
    let name = &server.name;
    let mut issues = Vec::new();

    if !server.path_enabled(ProbePath::Protocol) && !server.path_enabled(ProbePath::Rest) {
        issues.push(ConfigIssue::error(format!(
            "server '{name}': at least one of the protocol/REST paths must be enabled with an endpoint"
        )));
    }

    for path in [ProbePath::Protocol, ProbePath::Rest] {
        if let Some(endpoint) = server.endpoint(path)
            && let Err(e) = Url::parse(endpoint)
        {
            issues.push(ConfigIssue::error(format!(
                "server '{name}': invalid {path} endpoint '{endpoint}': {e}"
            )));
        }
        if server.path_enabled(path) && server.probe_timeout(path).is_zero() {
            issues.push(ConfigIssue::error(format!(
                "server '{name}': {path} timeout must be > 0"
            )));
        }
    }

    if server.weight_protocol < 0.0 || server.weight_rest < 0.0 {
        issues.push(ConfigIssue::error(format!(
            "server '{name}': weights must be non-negative"
        )));
    }
    let enabled_weight: f64 = server
        .enabled_paths()
        .iter()
        .map(|p| server.weight(*p))
        .sum();
    if !server.enabled_paths().is_empty() && enabled_weight <= 0.0 {
        issues.push(ConfigIssue::error(format!(
            "server '{name}': enabled path weights must sum to > 0"
        )));
    }

    for code in &server.rest_expected_status_codes {
        if !(100..=599).contains(code) {
            issues.push(ConfigIssue::error(format!(
                "server '{name}': '{code}' is not a valid HTTP status code"
            )));
        }
    }

    if let Some(ms) = server.check_interval_ms
        && ms == 0
    {
        issues.push(ConfigIssue::error(format!(
            "server '{name}': check_interval_ms override must be > 0"
        )));
    }

    issues
}

fn default_true() -> bool {
    true
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_retention_window_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_janitor_interval_ms() -> u64 {
    60_000
}

fn default_series_capacity() -> usize {
    4096
}

fn default_pool_max_idle_per_host() -> usize {
    8
}

fn default_pool_idle_timeout_ms() -> u64 {
    90_000
}

fn default_listen() -> String {
    "127.0.0.1:8700".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_retries() -> u32 {
    1
}

fn default_expected_status_codes() -> Vec<u16> {
    vec![200]
}

fn default_weight() -> f64 {
    1.0
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_inflight() -> u32 {
    1
}

fn default_history_capacity() -> usize {
    128
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn server(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            protocol_endpoint: Some("http://localhost:9000/rpc".to_string()),
            protocol_enabled: true,
            protocol_timeout_ms: 5_000,
            protocol_retries: 1,
            expected_tools: vec![],
            rest_endpoint: Some("http://localhost:9000/health".to_string()),
            rest_enabled: true,
            rest_timeout_ms: 5_000,
            rest_retries: 1,
            rest_expected_status_codes: vec![200],
            auth_headers: BTreeMap::new(),
            weight_protocol: 1.0,
            weight_rest: 1.0,
            require_both_success: false,
            closed_requires_all_paths: true,
            check_interval_ms: None,
        }
    }

    #[test]
    fn documented_defaults_hold() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.check_interval_ms, 30_000);
        assert_eq!(cfg.retention_window_ms, 86_400_000);
        assert_eq!(cfg.janitor_interval_ms, 60_000);
        assert_eq!(cfg.circuit.half_open_max_inflight, 1);
        assert_eq!(cfg.circuit.history_capacity, 128);
    }

    #[test]
    fn effective_max_concurrent_defaults_to_twice_servers() {
        let mut cfg = EngineConfig::default();
        cfg.servers = vec![server("a"), server("b"), server("c")];
        assert_eq!(cfg.effective_max_concurrent(), 6);
        cfg.max_concurrent_checks = 2;
        assert_eq!(cfg.effective_max_concurrent(), 2);
    }

    #[test]
    fn valid_document_passes() {
        let mut cfg = EngineConfig::default();
        cfg.servers = vec![server("a")];
        let errors: Vec<_> = cfg
            .validate()
            .into_iter()
            .filter(|i| i.severity == Severity::Error)
            .collect();
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn both_paths_disabled_is_an_error() {
        let mut cfg = EngineConfig::default();
        let mut s = server("a");
        s.protocol_enabled = false;
        s.rest_enabled = false;
        cfg.servers = vec![s];
        assert!(
            cfg.validate()
                .iter()
                .any(|i| i.severity == Severity::Error && i.message.contains("at least one"))
        );
    }

    #[test]
    fn zero_weights_are_an_error() {
        let mut cfg = EngineConfig::default();
        let mut s = server("a");
        s.weight_protocol = 0.0;
        s.weight_rest = 0.0;
        cfg.servers = vec![s];
        assert!(
            cfg.validate()
                .iter()
                .any(|i| i.message.contains("sum to > 0"))
        );
    }

    #[test]
    fn duplicate_names_are_an_error() {
        let mut cfg = EngineConfig::default();
        cfg.servers = vec![server("a"), server("a")];
        assert!(
            cfg.validate()
                .iter()
                .any(|i| i.message.contains("duplicate server name"))
        );
    }

    #[test]
    fn bad_endpoint_url_is_an_error() {
        let mut cfg = EngineConfig::default();
        let mut s = server("a");
        s.protocol_endpoint = Some("not a url".to_string());
        cfg.servers = vec![s];
        assert!(
            cfg.validate()
                .iter()
                .any(|i| i.message.contains("invalid PROTOCOL endpoint"))
        );
    }

    #[test]
    fn invalid_status_code_is_an_error() {
        let mut cfg = EngineConfig::default();
        let mut s = server("a");
        s.rest_expected_status_codes = vec![200, 999];
        cfg.servers = vec![s];
        assert!(
            cfg.validate()
                .iter()
                .any(|i| i.message.contains("not a valid HTTP status code"))
        );
    }

    #[test]
    fn load_parses_toml_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
check_interval_ms = 10000

[circuit]
failure_threshold = 5

[[servers]]
name = "tools-prod"
protocol_endpoint = "http://localhost:9000/rpc"
rest_endpoint = "http://localhost:9000/health"
expected_tools = ["search", "fetch"]
rest_expected_status_codes = [200, 204]

[servers.auth_headers]
Authorization = "Bearer token"
"#
        )
        .unwrap();

        let cfg = EngineConfig::load(file.path()).unwrap();
        assert_eq!(cfg.check_interval_ms, 10_000);
        assert_eq!(cfg.circuit.failure_threshold, 5);
        assert_eq!(cfg.servers.len(), 1);
        let s = &cfg.servers[0];
        assert_eq!(s.name, "tools-prod");
        assert_eq!(s.expected_tools, vec!["search", "fetch"]);
        assert_eq!(s.rest_expected_status_codes, vec![200, 204]);
        assert_eq!(
            s.auth_headers.get("Authorization").map(String::as_str),
            Some("Bearer token")
        );
        assert!(s.path_enabled(ProbePath::Protocol));
        assert!(s.path_enabled(ProbePath::Rest));
    }

    #[test]
    fn interval_override_applies_per_server() {
        let mut s = server("a");
        assert_eq!(
            s.effective_interval(30_000),
            Duration::from_millis(30_000)
        );
        s.check_interval_ms = Some(5_000);
        assert_eq!(s.effective_interval(30_000), Duration::from_millis(5_000));
    }
}
