//! Health check orchestration.
//!
//! One check fans out up to two probes under independent timeouts, routes
//! real outcomes to the breaker and metrics in completion order, synthesizes
//! suppressed outcomes for breaker-denied paths, and publishes the
//! aggregated result only after both per-path outcomes have been recorded.

use crate::aggregate::aggregate;
use crate::breaker::{Admission, CircuitBreaker};
use crate::events::{kind, EventBus};
use crate::metrics::MetricsStore;
use crate::probe::protocol::ProtocolProbe;
use crate::probe::rest::RestProbe;
use crate::probe::ProbeClients;
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};
use tsh_common::config::{EngineConfig, ServerConfig};
use tsh_common::{DualResult, ProbeOutcome, ProbePath, ServerName};

/// Most-recent [`DualResult`] per server.
#[derive(Default)]
pub struct ResultCache {
    inner: RwLock<HashMap<ServerName, DualResult>>,
}

impl ResultCache {
    pub fn publish(&self, result: DualResult) {
        self.inner
            .write()
            .unwrap()
            .insert(result.server.clone(), result);
    }

    pub fn get(&self, server: &ServerName) -> Option<DualResult> {
        self.inner.read().unwrap().get(server).cloned()
    }

    pub fn all(&self) -> Vec<DualResult> {
        let mut results: Vec<DualResult> = self.inner.read().unwrap().values().cloned().collect();
        results.sort_by(|a, b| a.server.cmp(&b.server));
        results
    }

    pub fn retain_servers(&self, keep: &HashSet<ServerName>) {
        self.inner
            .write()
            .unwrap()
            .retain(|name, _| keep.contains(name));
    }
}

/// The check orchestrator for one configuration epoch.
pub struct HealthCheckService {
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsStore>,
    results: Arc<ResultCache>,
    events: EventBus,
    protocol_probe: ProtocolProbe,
    rest_probe: RestProbe,
    /// Service-wide cap on in-flight probes.
    probe_semaphore: Arc<Semaphore>,
    /// Per-server concurrency guard: a busy server's tick is skipped.
    inflight: Mutex<HashSet<ServerName>>,
}

struct InflightGuard<'a> {
    set: &'a Mutex<HashSet<ServerName>>,
    name: ServerName,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.name);
    }
}

impl HealthCheckService {
    pub fn new(
        config: &EngineConfig,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsStore>,
        results: Arc<ResultCache>,
        events: EventBus,
    ) -> Result<Self, reqwest::Error> {
        let clients = ProbeClients::build(config)?;
        Ok(Self {
            breaker,
            metrics,
            results,
            events,
            protocol_probe: ProtocolProbe::new(clients.protocol),
            rest_probe: RestProbe::new(clients.rest),
            probe_semaphore: Arc::new(Semaphore::new(config.effective_max_concurrent())),
            inflight: Mutex::new(HashSet::new()),
        })
    }

    /// Run one logical check for a server.
    ///
    /// Skipped (and counted) when the previous check for the same server has
    /// not finished. Returns the published result, if the check completed.
    pub fn run_check<'a>(
        &'a self,
        config: &'a ServerConfig,
        cancel: &'a watch::Receiver<bool>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<DualResult>> + Send + 'a>> {
        Box::pin(self.run_check_inner(config, cancel))
    }

    async fn run_check_inner(
        &self,
        config: &ServerConfig,
        cancel: &watch::Receiver<bool>,
    ) -> Option<DualResult> {
        let server = config.server_name();

        let _guard = {
            let mut inflight = self.inflight.lock().unwrap();
            if !inflight.insert(server.clone()) {
                self.metrics.inc_check_skipped();
                debug!(server = %server, "previous check still running; skipping");
                return None;
            }
            InflightGuard {
                set: &self.inflight,
                name: server.clone(),
            }
        };

        let (protocol_outcome, rest_outcome) = tokio::join!(
            self.run_path(config, ProbePath::Protocol, cancel),
            self.run_path(config, ProbePath::Rest, cancel),
        );

        if *cancel.borrow() {
            debug!(server = %server, "check cancelled; result discarded");
            return None;
        }

        let aggregated = aggregate(config, protocol_outcome, rest_outcome, Utc::now());
        if aggregated.malformed {
            self.metrics.inc_internal_error();
            warn!(server = %server, "aggregator received malformed inputs");
        }
        let result = aggregated.result;

        self.metrics.record_check(&result);
        self.results.publish(result.clone());
        self.events.emit(
            kind::CHECK_COMPLETED,
            &json!({
                "server": server.as_str(),
                "overall_status": result.overall_status,
                "health_score": result.health_score,
                "combined_duration_ms": result.combined_duration_ms,
            }),
        );
        Some(result)
    }

    /// Probe one path, honoring breaker admission; records real outcomes
    /// as they complete.
    fn run_path<'a>(
        &'a self,
        config: &'a ServerConfig,
        path: ProbePath,
        cancel: &'a watch::Receiver<bool>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<ProbeOutcome>> + Send + 'a>>
    {
        Box::pin(self.run_path_inner(config, path, cancel))
    }

    async fn run_path_inner(
        &self,
        config: &ServerConfig,
        path: ProbePath,
        cancel: &watch::Receiver<bool>,
    ) -> Option<ProbeOutcome> {
        if !config.path_enabled(path) {
            return None;
        }
        let server = config.server_name();

        let admission = self.breaker.allow(&server, path);
        if admission == Admission::Deny {
            // The breaker's own decision: counted as suppression, never
            // recorded as breaker evidence.
            let suppressed = ProbeOutcome::suppressed(server, path);
            self.metrics.record_outcome(&suppressed);
            return Some(suppressed);
        }

        let Ok(_permit) = self.probe_semaphore.acquire().await else {
            return None;
        };
        if *cancel.borrow() {
            if admission == Admission::AllowTrial {
                self.breaker.abandon_trial(&server, path);
            }
            return None;
        }

        let outcome = match path {
            ProbePath::Protocol => self.protocol_probe.probe(config, cancel).await,
            ProbePath::Rest => self.rest_probe.probe(config, cancel).await,
        };

        if *cancel.borrow() {
            if admission == Admission::AllowTrial {
                self.breaker.abandon_trial(&server, path);
            }
            return None;
        }

        if let Some(transition) =
            self.breaker
                .record_outcome(&server, path, outcome.success, outcome.error_category)
        {
            self.events.emit(kind::CIRCUIT_TRANSITION, &transition);
        }
        self.metrics.record_outcome(&outcome);
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::Router;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use tsh_common::config::CircuitSettings;
    use tsh_common::{ErrorCategory, HealthStatus, TimeWindow};

    async fn spawn_backend(rpc_ok: bool, rest_status: u16) -> String {
        let rpc = move |body: String| async move {
            if !rpc_ok {
                return (StatusCode::INTERNAL_SERVER_ERROR, "down".to_string());
            }
            let parsed: Value = serde_json::from_str(&body).unwrap();
            let reply = serde_json::json!({
                "jsonrpc": "2.0",
                "id": parsed["id"],
                "result": {"tools": [{"name": "x"}, {"name": "y"}]}
            });
            (StatusCode::OK, reply.to_string())
        };
        let rest = move || async move {
            (
                StatusCode::from_u16(rest_status).unwrap(),
                serde_json::json!({"status": "healthy"}).to_string(),
            )
        };
        let app = Router::new()
            .route("/rpc", post(rpc))
            .route("/health", get(rest));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn server_config(base: &str) -> ServerConfig {
        ServerConfig {
            name: "s1".to_string(),
            protocol_endpoint: Some(format!("{base}/rpc")),
            protocol_enabled: true,
            protocol_timeout_ms: 2_000,
            protocol_retries: 0,
            expected_tools: vec!["x".to_string(), "y".to_string()],
            rest_endpoint: Some(format!("{base}/health")),
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

    fn service_for(config: &ServerConfig) -> (HealthCheckService, Arc<CircuitBreaker>, Arc<MetricsStore>) {
        let engine_config = EngineConfig {
            servers: vec![config.clone()],
            ..EngineConfig::default()
        };
        let breaker = Arc::new(CircuitBreaker::new(CircuitSettings {
            failure_threshold: 3,
            open_timeout_ms: 60_000,
            ..CircuitSettings::default()
        }));
        breaker.ensure_server(config);
        let metrics = Arc::new(MetricsStore::new(
            std::time::Duration::from_secs(3600),
            1024,
        ));
        let service = HealthCheckService::new(
            &engine_config,
            breaker.clone(),
            metrics.clone(),
            Arc::new(ResultCache::default()),
            EventBus::default(),
        )
        .unwrap();
        (service, breaker, metrics)
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn healthy_check_publishes_healthy_result() {
        let base = spawn_backend(true, 200).await;
        let config = server_config(&base);
        let (service, _breaker, metrics) = service_for(&config);

        let result = service.run_check(&config, &no_cancel()).await.unwrap();
        assert_eq!(result.overall_status, HealthStatus::Healthy);
        assert_eq!(result.health_score, 1.0);
        assert_eq!(
            result.available_paths,
            vec![ProbePath::Protocol, ProbePath::Rest]
        );

        let stats = metrics.server_metrics(&config.server_name(), TimeWindow::Last1h);
        assert_eq!(stats.protocol.total_attempts, 1);
        assert_eq!(stats.rest.total_attempts, 1);
        assert_eq!(stats.combined.checks, 1);
    }

    #[tokio::test]
    async fn protocol_failure_degrades_and_feeds_breaker() {
        let base = spawn_backend(false, 200).await;
        let config = server_config(&base);
        let (service, breaker, _metrics) = service_for(&config);

        let result = service.run_check(&config, &no_cancel()).await.unwrap();
        assert_eq!(result.overall_status, HealthStatus::Degraded);
        assert_eq!(result.available_paths, vec![ProbePath::Rest]);

        let snap = breaker.snapshot(&config.server_name()).unwrap();
        assert_eq!(snap.protocol.consecutive_failures, 1);
        assert_eq!(snap.rest.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn open_circuit_synthesizes_suppressed_outcome() {
        let base = spawn_backend(false, 200).await;
        let config = server_config(&base);
        let (service, breaker, metrics) = service_for(&config);

        // Drive the protocol circuit open.
        for _ in 0..3 {
            service.run_check(&config, &no_cancel()).await;
        }
        let snap = breaker.snapshot(&config.server_name()).unwrap();
        assert_eq!(snap.overall, crate::breaker::OverallState::RestOnly);

        let result = service.run_check(&config, &no_cancel()).await.unwrap();
        let protocol = result.protocol_outcome.unwrap();
        assert!(protocol.suppressed);
        assert_eq!(protocol.error_category, Some(ErrorCategory::CircuitOpen));
        assert_eq!(protocol.duration_ms, 0);
        assert_eq!(result.overall_status, HealthStatus::Degraded);

        // Suppression is not breaker evidence: failures stay at threshold.
        let snap = breaker.snapshot(&config.server_name()).unwrap();
        assert_eq!(snap.protocol.consecutive_failures, 3);

        let stats = metrics.server_metrics(&config.server_name(), TimeWindow::Last1h);
        assert_eq!(stats.protocol.suppressed, 1);
        assert_eq!(stats.protocol.total_attempts, 3);
    }

    #[tokio::test]
    async fn cancelled_check_records_nothing() {
        let base = spawn_backend(true, 200).await;
        let config = server_config(&base);
        let (service, _breaker, metrics) = service_for(&config);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result = service.run_check(&config, &rx).await;
        assert!(result.is_none());

        let stats = metrics.server_metrics(&config.server_name(), TimeWindow::Last1h);
        assert_eq!(stats.protocol.total_attempts + stats.rest.total_attempts, 0);
        assert_eq!(stats.combined.checks, 0);
    }

    #[tokio::test]
    async fn concurrent_check_for_same_server_is_skipped() {
        let base = spawn_backend(true, 200).await;
        let config = server_config(&base);
        let (service, _breaker, metrics) = service_for(&config);
        let service = Arc::new(service);

        // Hold the in-flight slot directly, then attempt a check.
        service
            .inflight
            .lock()
            .unwrap()
            .insert(config.server_name());
        let result = service.run_check(&config, &no_cancel()).await;
        assert!(result.is_none());
        assert_eq!(metrics.counters().checks_skipped, 1);

        service
            .inflight
            .lock()
            .unwrap()
            .remove(&config.server_name());
        assert!(service.run_check(&config, &no_cancel()).await.is_some());
    }

    #[tokio::test]
    async fn disabled_path_is_absent_from_result() {
        let base = spawn_backend(true, 200).await;
        let mut config = server_config(&base);
        config.protocol_enabled = false;
        let (service, _breaker, _metrics) = service_for(&config);

        let result = service.run_check(&config, &no_cancel()).await.unwrap();
        assert!(result.protocol_outcome.is_none());
        assert_eq!(result.overall_status, HealthStatus::Healthy);
        assert_eq!(result.available_paths, vec![ProbePath::Rest]);
    }
}
