//! In-memory metrics store with time-based eviction.
//!
//! Every probe outcome and check result is retained as a timestamped sample
//! in a bounded ring; windowed statistics are computed from the retained
//! samples at query time, so the JSON and Prometheus views of the same
//! window always agree. A background janitor drops samples older than the
//! retention window. Writes never block on the janitor: each series sits
//! behind its own mutex and ring overflow overwrites the oldest point.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::debug;
use tsh_common::{DualResult, ErrorCategory, ProbeOutcome, ProbePath, ServerName, TimeWindow};

// ── Samples ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ProbeSample {
    at: DateTime<Utc>,
    duration_ms: u64,
    success: bool,
    suppressed: bool,
    category: Option<ErrorCategory>,
    status_code: Option<u16>,
    tools_returned: u32,
    tools_missing: u32,
}

#[derive(Debug, Clone)]
struct CheckSample {
    at: DateTime<Utc>,
    combined_duration_ms: u64,
    health_score: f64,
}

#[derive(Debug)]
struct Ring<T> {
    samples: VecDeque<T>,
}

impl<T> Default for Ring<T> {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }
}

impl<T> Ring<T> {
    /// Push respecting the capacity bound; returns true when an old point
    /// was overwritten.
    fn push(&mut self, sample: T, capacity: usize) -> bool {
        let overwrote = self.samples.len() >= capacity;
        if overwrote {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        overwrote
    }
}

// ── Windowed statistics ────────────────────────────────────────────────────

/// Per-(server, path) statistics over one window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PathStats {
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Breaker suppressions; excluded from `total_attempts`.
    pub suppressed: u64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub p50_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
    pub by_category: BTreeMap<String, u64>,
    /// REST only: status code distribution.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub status_codes: BTreeMap<u16, u64>,
    /// PROTOCOL only.
    pub tools_returned_total: u64,
    pub tools_missing_total: u64,
}

/// Combined-check statistics over one window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CombinedStats {
    pub checks: u64,
    pub avg_combined_duration_ms: f64,
    pub p50_combined_duration_ms: f64,
    pub p95_combined_duration_ms: f64,
    pub p99_combined_duration_ms: f64,
    pub avg_health_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_score: Option<f64>,
}

/// Everything the read API reports for one server and window.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetrics {
    pub server: ServerName,
    pub window: String,
    pub protocol: PathStats,
    pub rest: PathStats,
    pub combined: CombinedStats,
}

/// Monotonic engine-level counters (not windowed).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineCounters {
    pub scheduler_drops: u64,
    pub checks_skipped: u64,
    pub metrics_overwrites: u64,
    pub internal_errors: u64,
}

// ── Percentiles ────────────────────────────────────────────────────────────

/// Linear-interpolation percentile over a sorted slice.
///
/// `p` in [0, 100]. Empty input yields 0.0.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0) * (n as f64 - 1.0);
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            if lo == hi {
                sorted[lo]
            } else {
                let frac = rank - lo as f64;
                sorted[lo] + (sorted[hi] - sorted[lo]) * frac
            }
        }
    }
}

/// Fixed percentile rules: with fewer than 10 samples, p95 and p99 report
/// the maximum observed value and p50 the median.
fn summarize(mut values: Vec<f64>) -> (f64, f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let avg = values.iter().sum::<f64>() / values.len() as f64;
    let p50 = percentile(&values, 50.0);
    let (p95, p99) = if values.len() < 10 {
        let max = *values.last().unwrap();
        (max, max)
    } else {
        (percentile(&values, 95.0), percentile(&values, 99.0))
    };
    (avg, p50, p95, p99)
}

// ── Store ──────────────────────────────────────────────────────────────────

/// Windowed metrics store shared by the service, janitor, and read API.
pub struct MetricsStore {
    retention: ChronoDuration,
    capacity: usize,
    paths: RwLock<HashMap<(ServerName, ProbePath), Arc<Mutex<Ring<ProbeSample>>>>>,
    checks: RwLock<HashMap<ServerName, Arc<Mutex<Ring<CheckSample>>>>>,
    overwrites: AtomicU64,
    scheduler_drops: AtomicU64,
    checks_skipped: AtomicU64,
    internal_errors: AtomicU64,
}

impl MetricsStore {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        let retention = ChronoDuration::from_std(retention)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        Self {
            retention,
            capacity: capacity.max(1),
            paths: RwLock::new(HashMap::new()),
            checks: RwLock::new(HashMap::new()),
            overwrites: AtomicU64::new(0),
            scheduler_drops: AtomicU64::new(0),
            checks_skipped: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
        }
    }

    fn path_ring(&self, server: &ServerName, path: ProbePath) -> Arc<Mutex<Ring<ProbeSample>>> {
        let key = (server.clone(), path);
        if let Some(ring) = self.paths.read().unwrap().get(&key) {
            return ring.clone();
        }
        self.paths
            .write()
            .unwrap()
            .entry(key)
            .or_default()
            .clone()
    }

    fn check_ring(&self, server: &ServerName) -> Arc<Mutex<Ring<CheckSample>>> {
        if let Some(ring) = self.checks.read().unwrap().get(server) {
            return ring.clone();
        }
        self.checks
            .write()
            .unwrap()
            .entry(server.clone())
            .or_default()
            .clone()
    }

    /// Append one probe outcome (real or suppressed).
    pub fn record_outcome(&self, outcome: &ProbeOutcome) {
        let mut sample = ProbeSample {
            at: outcome.started_at,
            duration_ms: outcome.duration_ms,
            success: outcome.success,
            suppressed: outcome.suppressed,
            category: outcome.error_category,
            status_code: None,
            tools_returned: 0,
            tools_missing: 0,
        };
        if let Some(rest) = outcome.rest_evidence() {
            sample.status_code = rest.status_code;
        }
        if let Some(protocol) = outcome.protocol_evidence() {
            sample.tools_returned = protocol.tools_returned.len() as u32;
            sample.tools_missing = protocol.missing_tools.len() as u32;
        }

        let ring = self.path_ring(&outcome.server, outcome.path);
        let overwrote = ring.lock().unwrap().push(sample, self.capacity);
        if overwrote {
            self.overwrites.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Append one check result (combined duration + health score sample).
    pub fn record_check(&self, result: &DualResult) {
        let sample = CheckSample {
            at: result.observed_at,
            combined_duration_ms: result.combined_duration_ms,
            health_score: result.health_score,
        };
        let ring = self.check_ring(&result.server);
        let overwrote = ring.lock().unwrap().push(sample, self.capacity);
        if overwrote {
            self.overwrites.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_scheduler_drop(&self) {
        self.scheduler_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_check_skipped(&self) {
        self.checks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_internal_error(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> EngineCounters {
        EngineCounters {
            scheduler_drops: self.scheduler_drops.load(Ordering::Relaxed),
            checks_skipped: self.checks_skipped.load(Ordering::Relaxed),
            metrics_overwrites: self.overwrites.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
        }
    }

    /// Servers with at least one retained sample, sorted.
    pub fn known_servers(&self) -> Vec<ServerName> {
        let mut names: Vec<ServerName> = {
            let paths = self.paths.read().unwrap();
            let checks = self.checks.read().unwrap();
            paths
                .keys()
                .map(|(name, _)| name.clone())
                .chain(checks.keys().cloned())
                .collect()
        };
        names.sort();
        names.dedup();
        names
    }

    /// Drop state for servers no longer configured.
    pub fn retain_servers(&self, keep: &std::collections::HashSet<ServerName>) {
        self.paths
            .write()
            .unwrap()
            .retain(|(name, _), _| keep.contains(name));
        self.checks
            .write()
            .unwrap()
            .retain(|name, _| keep.contains(name));
    }

    fn path_stats_at(
        &self,
        server: &ServerName,
        path: ProbePath,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> PathStats {
        let cutoff = now
            - ChronoDuration::from_std(window.as_duration())
                .unwrap_or_else(|_| ChronoDuration::hours(24));
        let ring = self.path_ring(server, path);
        let ring = ring.lock().unwrap();

        let mut stats = PathStats::default();
        let mut durations = Vec::new();
        for s in ring.samples.iter().filter(|s| s.at >= cutoff) {
            if s.suppressed {
                stats.suppressed += 1;
                if let Some(cat) = s.category {
                    *stats.by_category.entry(cat.label().to_string()).or_insert(0) += 1;
                }
                continue;
            }
            stats.total_attempts += 1;
            if s.success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
                if let Some(cat) = s.category {
                    *stats.by_category.entry(cat.label().to_string()).or_insert(0) += 1;
                }
            }
            durations.push(s.duration_ms as f64);
            if let Some(code) = s.status_code {
                *stats.status_codes.entry(code).or_insert(0) += 1;
            }
            stats.tools_returned_total += s.tools_returned as u64;
            stats.tools_missing_total += s.tools_missing as u64;
        }

        stats.success_rate = stats.successes as f64 / (stats.total_attempts.max(1)) as f64;
        let (avg, p50, p95, p99) = summarize(durations);
        stats.avg_response_time_ms = avg;
        stats.p50_response_time_ms = p50;
        stats.p95_response_time_ms = p95;
        stats.p99_response_time_ms = p99;
        stats
    }

    fn combined_stats_at(
        &self,
        server: &ServerName,
        window: TimeWindow,
        now: DateTime<Utc>,
    ) -> CombinedStats {
        let cutoff = now
            - ChronoDuration::from_std(window.as_duration())
                .unwrap_or_else(|_| ChronoDuration::hours(24));
        let ring = self.check_ring(server);
        let ring = ring.lock().unwrap();

        let in_window: Vec<&CheckSample> =
            ring.samples.iter().filter(|s| s.at >= cutoff).collect();
        let durations: Vec<f64> = in_window
            .iter()
            .map(|s| s.combined_duration_ms as f64)
            .collect();
        let scores: Vec<f64> = in_window.iter().map(|s| s.health_score).collect();

        let (avg, p50, p95, p99) = summarize(durations);
        CombinedStats {
            checks: in_window.len() as u64,
            avg_combined_duration_ms: avg,
            p50_combined_duration_ms: p50,
            p95_combined_duration_ms: p95,
            p99_combined_duration_ms: p99,
            avg_health_score: if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            },
            last_health_score: in_window.last().map(|s| s.health_score),
        }
    }

    /// Full windowed view for one server.
    pub fn server_metrics(&self, server: &ServerName, window: TimeWindow) -> ServerMetrics {
        let now = Utc::now();
        ServerMetrics {
            server: server.clone(),
            window: window.label().to_string(),
            protocol: self.path_stats_at(server, ProbePath::Protocol, window, now),
            rest: self.path_stats_at(server, ProbePath::Rest, window, now),
            combined: self.combined_stats_at(server, window, now),
        }
    }

    /// Fleet-wide success rate for one path over a window.
    pub fn path_success_rate(&self, path: ProbePath, window: TimeWindow) -> f64 {
        let now = Utc::now();
        let mut successes = 0u64;
        let mut attempts = 0u64;
        for server in self.known_servers() {
            let stats = self.path_stats_at(&server, path, window, now);
            successes += stats.successes;
            attempts += stats.total_attempts;
        }
        successes as f64 / attempts.max(1) as f64
    }

    /// Evict samples older than the retention window. O(n) over ring sizes.
    pub fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        let rings: Vec<Arc<Mutex<Ring<ProbeSample>>>> =
            self.paths.read().unwrap().values().cloned().collect();
        for ring in rings {
            let mut ring = ring.lock().unwrap();
            while ring.samples.front().map(|s| s.at < cutoff).unwrap_or(false) {
                ring.samples.pop_front();
            }
        }
        let rings: Vec<Arc<Mutex<Ring<CheckSample>>>> =
            self.checks.read().unwrap().values().cloned().collect();
        for ring in rings {
            let mut ring = ring.lock().unwrap();
            while ring.samples.front().map(|s| s.at < cutoff).unwrap_or(false) {
                ring.samples.pop_front();
            }
        }
    }
}

/// Start the retention janitor loop.
pub fn start_janitor(
    store: Arc<MetricsStore>,
    cadence: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(cadence.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.prune(Utc::now());
                    debug!("metrics janitor pass complete");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

// ── Prometheus export ──────────────────────────────────────────────────────

/// Encode the windowed view of the given servers in Prometheus text format.
///
/// A fresh registry is populated per call so the exported counter values are
/// exactly the JSON values for the same window and filters.
pub fn encode_prometheus(
    store: &MetricsStore,
    servers: &[ServerName],
    window: TimeWindow,
) -> Result<String, prometheus::Error> {
    let registry = Registry::new();

    let attempts = IntCounterVec::new(
        Opts::new("tshd_probe_attempts_total", "Probe attempts in the window"),
        &["server", "path"],
    )?;
    let successes = IntCounterVec::new(
        Opts::new("tshd_probe_successes_total", "Probe successes in the window"),
        &["server", "path"],
    )?;
    let failures = IntCounterVec::new(
        Opts::new("tshd_probe_failures_total", "Probe failures in the window"),
        &["server", "path"],
    )?;
    let suppressed = IntCounterVec::new(
        Opts::new(
            "tshd_probe_suppressed_total",
            "Probes suppressed by an open circuit in the window",
        ),
        &["server", "path"],
    )?;
    let errors = IntCounterVec::new(
        Opts::new("tshd_probe_errors_total", "Probe failures by category"),
        &["server", "path", "error_category"],
    )?;
    let rest_status = IntCounterVec::new(
        Opts::new("tshd_rest_status_total", "REST responses by status code"),
        &["server", "status_code"],
    )?;
    let tools_returned = IntCounterVec::new(
        Opts::new("tshd_protocol_tools_returned_total", "Tools listed by protocol probes"),
        &["server"],
    )?;
    let tools_missing = IntCounterVec::new(
        Opts::new("tshd_protocol_tools_missing_total", "Expected tools missing"),
        &["server"],
    )?;
    let response_time = GaugeVec::new(
        Opts::new("tshd_probe_response_time_ms", "Response time statistics"),
        &["server", "path", "stat"],
    )?;
    let health_score = GaugeVec::new(
        Opts::new("tshd_health_score", "Most recent health score in the window"),
        &["server"],
    )?;
    let scheduler_drops =
        IntCounter::new("tshd_scheduler_drops_total", "Scheduler ticks dropped")?;
    let checks_skipped =
        IntCounter::new("tshd_checks_skipped_total", "Checks skipped while busy")?;
    let overwrites =
        IntCounter::new("tshd_metrics_overwrites_total", "Ring overwrites of old samples")?;

    registry.register(Box::new(attempts.clone()))?;
    registry.register(Box::new(successes.clone()))?;
    registry.register(Box::new(failures.clone()))?;
    registry.register(Box::new(suppressed.clone()))?;
    registry.register(Box::new(errors.clone()))?;
    registry.register(Box::new(rest_status.clone()))?;
    registry.register(Box::new(tools_returned.clone()))?;
    registry.register(Box::new(tools_missing.clone()))?;
    registry.register(Box::new(response_time.clone()))?;
    registry.register(Box::new(health_score.clone()))?;
    registry.register(Box::new(scheduler_drops.clone()))?;
    registry.register(Box::new(checks_skipped.clone()))?;
    registry.register(Box::new(overwrites.clone()))?;

    for server in servers {
        let metrics = store.server_metrics(server, window);
        let name = server.as_str();
        for (path, stats) in [
            (ProbePath::Protocol, &metrics.protocol),
            (ProbePath::Rest, &metrics.rest),
        ] {
            let path_label = path.label();
            attempts
                .with_label_values(&[name, path_label])
                .inc_by(stats.total_attempts);
            successes
                .with_label_values(&[name, path_label])
                .inc_by(stats.successes);
            failures
                .with_label_values(&[name, path_label])
                .inc_by(stats.failures);
            suppressed
                .with_label_values(&[name, path_label])
                .inc_by(stats.suppressed);
            for (category, count) in &stats.by_category {
                errors
                    .with_label_values(&[name, path_label, category])
                    .inc_by(*count);
            }
            for (stat, value) in [
                ("avg", stats.avg_response_time_ms),
                ("p50", stats.p50_response_time_ms),
                ("p95", stats.p95_response_time_ms),
                ("p99", stats.p99_response_time_ms),
            ] {
                response_time
                    .with_label_values(&[name, path_label, stat])
                    .set(value);
            }
        }
        for (code, count) in &metrics.rest.status_codes {
            rest_status
                .with_label_values(&[name, &code.to_string()])
                .inc_by(*count);
        }
        tools_returned
            .with_label_values(&[name])
            .inc_by(metrics.protocol.tools_returned_total);
        tools_missing
            .with_label_values(&[name])
            .inc_by(metrics.protocol.tools_missing_total);
        if let Some(score) = metrics.combined.last_health_score {
            health_score.with_label_values(&[name]).set(score);
        }
    }

    let counters = store.counters();
    scheduler_drops.inc_by(counters.scheduler_drops);
    checks_skipped.inc_by(counters.checks_skipped);
    overwrites.inc_by(counters.metrics_overwrites);

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tsh_common::{ProbeEvidence, ProbeOutcome, ProtocolEvidence, RestEvidence};

    fn name() -> ServerName {
        ServerName::new("s1")
    }

    fn store() -> MetricsStore {
        MetricsStore::new(Duration::from_secs(24 * 3600), 4096)
    }

    fn rest_outcome(success: bool, duration_ms: u64, status: u16) -> ProbeOutcome {
        let evidence = ProbeEvidence::Rest(RestEvidence {
            status_code: Some(status),
            response_body_digest: None,
        });
        ProbeOutcome {
            server: name(),
            path: ProbePath::Rest,
            started_at: Utc::now(),
            duration_ms,
            success,
            error_category: (!success).then_some(ErrorCategory::Http5xx),
            error_message: None,
            suppressed: false,
            evidence,
        }
    }

    fn protocol_outcome(success: bool, tools: usize, missing: usize) -> ProbeOutcome {
        let evidence = ProbeEvidence::Protocol(ProtocolEvidence {
            tools_returned: (0..tools).map(|i| format!("t{i}")).collect(),
            missing_tools: (0..missing).map(|i| format!("m{i}")).collect(),
            validation_errors: vec![],
            jsonrpc_id_echoed: true,
        });
        ProbeOutcome {
            server: name(),
            path: ProbePath::Protocol,
            started_at: Utc::now(),
            duration_ms: 10,
            success,
            error_category: (!success).then_some(ErrorCategory::ProtocolToolsMissing),
            error_message: None,
            suppressed: false,
            evidence,
        }
    }

    #[test]
    fn attempts_split_into_successes_and_failures() {
        let store = store();
        store.record_outcome(&rest_outcome(true, 10, 200));
        store.record_outcome(&rest_outcome(true, 20, 200));
        store.record_outcome(&rest_outcome(false, 30, 500));

        let stats = store.server_metrics(&name(), TimeWindow::Last1h).rest;
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.successes + stats.failures, stats.total_attempts);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.by_category.get("HTTP_5XX"), Some(&1));
        assert_eq!(stats.status_codes.get(&200), Some(&2));
        assert_eq!(stats.status_codes.get(&500), Some(&1));
    }

    #[test]
    fn suppressions_are_counted_separately() {
        let store = store();
        store.record_outcome(&rest_outcome(true, 10, 200));
        store.record_outcome(&ProbeOutcome::suppressed(name(), ProbePath::Rest));

        let stats = store.server_metrics(&name(), TimeWindow::Last1h).rest;
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.suppressed, 1);
        assert_eq!(stats.by_category.get("CIRCUIT_OPEN"), Some(&1));
    }

    #[test]
    fn protocol_tool_counters_accumulate() {
        let store = store();
        store.record_outcome(&protocol_outcome(true, 3, 0));
        store.record_outcome(&protocol_outcome(false, 1, 2));

        let stats = store.server_metrics(&name(), TimeWindow::Last1h).protocol;
        assert_eq!(stats.tools_returned_total, 4);
        assert_eq!(stats.tools_missing_total, 2);
    }

    #[test]
    fn small_sample_percentile_rules() {
        let store = store();
        for d in [10, 20, 30] {
            store.record_outcome(&rest_outcome(true, d, 200));
        }
        let stats = store.server_metrics(&name(), TimeWindow::Last1h).rest;
        assert_eq!(stats.p50_response_time_ms, 20.0);
        // Fewer than 10 samples: p95/p99 report the max.
        assert_eq!(stats.p95_response_time_ms, 30.0);
        assert_eq!(stats.p99_response_time_ms, 30.0);
        assert_eq!(stats.avg_response_time_ms, 20.0);
    }

    #[test]
    fn large_sample_percentiles_interpolate() {
        let store = store();
        for d in 1..=100u64 {
            store.record_outcome(&rest_outcome(true, d, 200));
        }
        let stats = store.server_metrics(&name(), TimeWindow::Last1h).rest;
        assert!((stats.p50_response_time_ms - 50.5).abs() < 1e-9);
        assert!((stats.p95_response_time_ms - 95.05).abs() < 1e-9);
        assert!((stats.p99_response_time_ms - 99.01).abs() < 1e-9);
    }

    #[test]
    fn window_excludes_old_samples() {
        let store = store();
        let mut old = rest_outcome(true, 10, 200);
        old.started_at = Utc::now() - ChronoDuration::minutes(10);
        store.record_outcome(&old);
        store.record_outcome(&rest_outcome(false, 20, 500));

        let narrow = store.server_metrics(&name(), TimeWindow::Last1m).rest;
        assert_eq!(narrow.total_attempts, 1);
        let wide = store.server_metrics(&name(), TimeWindow::Last1h).rest;
        assert_eq!(wide.total_attempts, 2);
        // Windowing monotonicity.
        assert!(narrow.successes <= wide.successes);
        assert!(narrow.failures <= wide.failures);
    }

    #[test]
    fn prune_drops_expired_samples() {
        let store = MetricsStore::new(Duration::from_secs(60), 4096);
        let mut old = rest_outcome(true, 10, 200);
        old.started_at = Utc::now() - ChronoDuration::minutes(5);
        store.record_outcome(&old);
        store.record_outcome(&rest_outcome(true, 20, 200));

        store.prune(Utc::now());
        let stats = store.server_metrics(&name(), TimeWindow::Last24h).rest;
        assert_eq!(stats.total_attempts, 1);
    }

    #[test]
    fn ring_overflow_overwrites_and_counts() {
        let store = MetricsStore::new(Duration::from_secs(3600), 2);
        for d in [1, 2, 3] {
            store.record_outcome(&rest_outcome(true, d, 200));
        }
        let stats = store.server_metrics(&name(), TimeWindow::Last1h).rest;
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(store.counters().metrics_overwrites, 1);
    }

    #[test]
    fn combined_stats_track_checks() {
        let store = store();
        let result = DualResult {
            server: name(),
            observed_at: Utc::now(),
            protocol_outcome: None,
            rest_outcome: None,
            overall_status: tsh_common::HealthStatus::Healthy,
            overall_success: true,
            combined_duration_ms: 50,
            health_score: 1.0,
            available_paths: vec![ProbePath::Rest],
        };
        store.record_check(&result);
        let combined = store
            .server_metrics(&name(), TimeWindow::Last1h)
            .combined;
        assert_eq!(combined.checks, 1);
        assert_eq!(combined.last_health_score, Some(1.0));
        assert_eq!(combined.p95_combined_duration_ms, 50.0);
    }

    #[test]
    fn fleet_success_rate_spans_servers() {
        let store = store();
        store.record_outcome(&rest_outcome(true, 10, 200));
        let mut other = rest_outcome(false, 10, 500);
        other.server = ServerName::new("s2");
        store.record_outcome(&other);

        let rate = store.path_success_rate(ProbePath::Rest, TimeWindow::Last1h);
        assert!((rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn prometheus_counters_match_json_view() {
        let store = store();
        store.record_outcome(&rest_outcome(true, 10, 200));
        store.record_outcome(&rest_outcome(false, 20, 500));

        let stats = store.server_metrics(&name(), TimeWindow::Last1h).rest;
        let text = encode_prometheus(&store, &[name()], TimeWindow::Last1h).unwrap();
        assert!(text.contains(&format!(
            "tshd_probe_attempts_total{{path=\"REST\",server=\"s1\"}} {}",
            stats.total_attempts
        )));
        assert!(text.contains(&format!(
            "tshd_probe_successes_total{{path=\"REST\",server=\"s1\"}} {}",
            stats.successes
        )));
        assert!(text.contains("tshd_rest_status_total"));
        assert!(text.contains("# HELP"));
    }

    proptest! {
        #[test]
        fn percentile_is_bounded_by_min_and_max(mut values in prop::collection::vec(0.0f64..10_000.0, 1..200)) {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let p = percentile(&values, 95.0);
            prop_assert!(p >= values[0] && p <= *values.last().unwrap());
        }

        #[test]
        fn summarize_orders_quantiles(values in prop::collection::vec(0.0f64..10_000.0, 10..200)) {
            let (_, p50, p95, p99) = summarize(values);
            prop_assert!(p50 <= p95 && p95 <= p99);
        }
    }
}
