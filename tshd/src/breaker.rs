//! Dual-path circuit breaker.
//!
//! Each server holds two independent per-path state machines (PROTOCOL,
//! REST) plus a derived overall state. `record_outcome` is the only
//! mutator and is infallible; admission decisions are returned as values,
//! never raised. All mutation goes through this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tsh_common::config::{CircuitSettings, ServerConfig};
use tsh_common::{ErrorCategory, ProbePath, ServerName};
use tracing::info;

/// Number of history entries included in API snapshots.
const SNAPSHOT_HISTORY: usize = 16;

/// Per-path circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathState {
    Closed,
    Open,
    HalfOpen,
}

/// Composed per-server state across both paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallState {
    Closed,
    Open,
    HalfOpen,
    ProtocolOnly,
    RestOnly,
}

/// Admission verdict for one probe dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny,
    /// Admitted as a half-open trial probe.
    AllowTrial,
}

impl Admission {
    pub fn admitted(self) -> bool {
        !matches!(self, Self::Deny)
    }
}

/// Which sub-states a reset applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResetPath {
    Protocol,
    Rest,
    #[default]
    Both,
}

/// One retained failure, for diagnostics and threshold extensions.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub category: ErrorCategory,
}

/// A state transition observed by `record_outcome`, for event emission.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitTransition {
    pub server: ServerName,
    pub path: ProbePath,
    pub from: PathState,
    pub to: PathState,
}

// ── Per-path state machine ─────────────────────────────────────────────────

#[derive(Debug)]
struct PathBreaker {
    state: PathState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    half_open_inflight: u32,
    history: VecDeque<FailureRecord>,
}

impl PathBreaker {
    fn new() -> Self {
        Self {
            state: PathState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            opened_at_wall: None,
            half_open_inflight: 0,
            history: VecDeque::new(),
        }
    }

    fn open_now(&mut self) {
        self.state = PathState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.consecutive_successes = 0;
        self.half_open_inflight = 0;
    }

    fn close(&mut self) {
        self.state = PathState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.opened_at = None;
        self.opened_at_wall = None;
        self.half_open_inflight = 0;
    }

    /// Admission decision; performs the OPEN → HALF_OPEN transition when the
    /// open window has elapsed.
    fn admit(&mut self, settings: &CircuitSettings) -> Admission {
        match self.state {
            PathState::Closed => Admission::Allow,
            PathState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed() >= settings.open_timeout())
                    .unwrap_or(true);
                if elapsed {
                    self.state = PathState::HalfOpen;
                    self.consecutive_successes = 0;
                    self.half_open_inflight = 1;
                    Admission::AllowTrial
                } else {
                    Admission::Deny
                }
            }
            PathState::HalfOpen => {
                if self.half_open_inflight < settings.half_open_max_inflight {
                    self.half_open_inflight += 1;
                    Admission::AllowTrial
                } else {
                    Admission::Deny
                }
            }
        }
    }

    /// Record one probe outcome; returns the transition, if any.
    fn record(
        &mut self,
        success: bool,
        category: Option<ErrorCategory>,
        settings: &CircuitSettings,
    ) -> Option<(PathState, PathState)> {
        let prior = self.state;

        if !success && let Some(cat) = category {
            self.history.push_back(FailureRecord {
                at: Utc::now(),
                category: cat,
            });
            while self.history.len() > settings.history_capacity {
                self.history.pop_front();
            }
        }

        match self.state {
            PathState::Closed => {
                if success {
                    self.consecutive_failures = 0;
                    self.consecutive_successes += 1;
                } else {
                    self.consecutive_successes = 0;
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= settings.failure_threshold {
                        self.open_now();
                    }
                }
            }
            PathState::HalfOpen => {
                self.half_open_inflight = self.half_open_inflight.saturating_sub(1);
                if success {
                    self.consecutive_failures = 0;
                    self.consecutive_successes += 1;
                    if self.consecutive_successes >= settings.success_threshold {
                        self.close();
                    }
                } else {
                    self.open_now();
                }
            }
            // Outcomes of probes dispatched before the circuit opened still
            // update counters but never transition an open circuit.
            PathState::Open => {
                if success {
                    self.consecutive_failures = 0;
                    self.consecutive_successes += 1;
                } else {
                    self.consecutive_successes = 0;
                    self.consecutive_failures += 1;
                }
            }
        }

        (prior != self.state).then_some((prior, self.state))
    }

    fn abandon_trial(&mut self) {
        if self.state == PathState::HalfOpen {
            self.half_open_inflight = self.half_open_inflight.saturating_sub(1);
        }
    }
}

// ── Per-server composition ─────────────────────────────────────────────────

#[derive(Debug)]
struct ServerBreaker {
    protocol: PathBreaker,
    rest: PathBreaker,
    protocol_enabled: bool,
    rest_enabled: bool,
    closed_requires_all_paths: bool,
}

impl ServerBreaker {
    fn new(config: &ServerConfig) -> Self {
        Self {
            protocol: PathBreaker::new(),
            rest: PathBreaker::new(),
            protocol_enabled: config.path_enabled(ProbePath::Protocol),
            rest_enabled: config.path_enabled(ProbePath::Rest),
            closed_requires_all_paths: config.closed_requires_all_paths,
        }
    }

    fn path(&mut self, path: ProbePath) -> &mut PathBreaker {
        match path {
            ProbePath::Protocol => &mut self.protocol,
            ProbePath::Rest => &mut self.rest,
        }
    }

    fn path_enabled(&self, path: ProbePath) -> bool {
        match path {
            ProbePath::Protocol => self.protocol_enabled,
            ProbePath::Rest => self.rest_enabled,
        }
    }

    /// Compose the overall state from enabled sub-states.
    fn overall(&self) -> OverallState {
        let p = self.protocol_enabled.then_some(self.protocol.state);
        let r = self.rest_enabled.then_some(self.rest.state);

        match (p, r) {
            (Some(p), Some(r)) => {
                if self.closed_requires_all_paths {
                    compose_strict(p, r)
                } else {
                    compose_relaxed(p, r)
                }
            }
            (Some(single), None) | (None, Some(single)) => match single {
                PathState::Closed => OverallState::Closed,
                PathState::Open => OverallState::Open,
                PathState::HalfOpen => OverallState::HalfOpen,
            },
            (None, None) => OverallState::Open,
        }
    }

    /// Enabled paths currently advertised for traffic (sub-state not OPEN).
    fn advertised_paths(&self) -> Vec<ProbePath> {
        let mut paths = Vec::new();
        if self.protocol_enabled && self.protocol.state != PathState::Open {
            paths.push(ProbePath::Protocol);
        }
        if self.rest_enabled && self.rest.state != PathState::Open {
            paths.push(ProbePath::Rest);
        }
        paths
    }
}

/// Default composition: CLOSED requires every enabled sub-state healthy.
fn compose_strict(p: PathState, r: PathState) -> OverallState {
    use PathState::*;
    match (p, r) {
        (Closed, Closed) | (Closed, HalfOpen) | (HalfOpen, Closed) => OverallState::Closed,
        (Closed, Open) => OverallState::ProtocolOnly,
        (Open, Closed) => OverallState::RestOnly,
        (Open, Open) => OverallState::Open,
        (HalfOpen, _) | (_, HalfOpen) => OverallState::HalfOpen,
    }
}

/// Relaxed recovery: CLOSED once any enabled path is CLOSED; OPEN only when
/// all enabled paths are OPEN.
fn compose_relaxed(p: PathState, r: PathState) -> OverallState {
    use PathState::*;
    match (p, r) {
        (Closed, _) | (_, Closed) => OverallState::Closed,
        (Open, Open) => OverallState::Open,
        _ => OverallState::HalfOpen,
    }
}

// ── Snapshots ──────────────────────────────────────────────────────────────

/// Reported per-path state; disabled paths are shown as such, not as OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedPathState {
    Closed,
    Open,
    HalfOpen,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathSnapshot {
    pub state: ReportedPathState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_inflight: u32,
    pub recent_failures: Vec<FailureRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub server: ServerName,
    pub overall: OverallState,
    pub advertised_paths: Vec<ProbePath>,
    pub protocol: PathSnapshot,
    pub rest: PathSnapshot,
}

fn snapshot_path(breaker: &PathBreaker, enabled: bool) -> PathSnapshot {
    let state = if !enabled {
        ReportedPathState::Disabled
    } else {
        match breaker.state {
            PathState::Closed => ReportedPathState::Closed,
            PathState::Open => ReportedPathState::Open,
            PathState::HalfOpen => ReportedPathState::HalfOpen,
        }
    };
    PathSnapshot {
        state,
        consecutive_failures: breaker.consecutive_failures,
        consecutive_successes: breaker.consecutive_successes,
        opened_at: breaker.opened_at_wall,
        half_open_inflight: breaker.half_open_inflight,
        recent_failures: breaker
            .history
            .iter()
            .rev()
            .take(SNAPSHOT_HISTORY)
            .cloned()
            .collect(),
    }
}

// ── Registry ───────────────────────────────────────────────────────────────

/// Circuit breaker registry: per-server fine-grained locking.
pub struct CircuitBreaker {
    settings: RwLock<CircuitSettings>,
    servers: RwLock<HashMap<ServerName, Arc<Mutex<ServerBreaker>>>>,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a server (or refresh its path flags after a reload).
    ///
    /// Existing sub-state survives reconfiguration so a reload does not
    /// forget accumulated evidence.
    pub fn ensure_server(&self, config: &ServerConfig) {
        let name = config.server_name();
        let mut servers = self.servers.write().unwrap();
        match servers.get(&name) {
            Some(entry) => {
                let mut sb = entry.lock().unwrap();
                sb.protocol_enabled = config.path_enabled(ProbePath::Protocol);
                sb.rest_enabled = config.path_enabled(ProbePath::Rest);
                sb.closed_requires_all_paths = config.closed_requires_all_paths;
            }
            None => {
                servers.insert(name, Arc::new(Mutex::new(ServerBreaker::new(config))));
            }
        }
    }

    /// Drop state for servers no longer configured.
    pub fn retain_servers(&self, keep: &std::collections::HashSet<ServerName>) {
        self.servers
            .write()
            .unwrap()
            .retain(|name, _| keep.contains(name));
    }

    /// Swap circuit settings on epoch reload.
    pub fn update_settings(&self, settings: CircuitSettings) {
        *self.settings.write().unwrap() = settings;
    }

    fn entry(&self, server: &ServerName) -> Option<Arc<Mutex<ServerBreaker>>> {
        self.servers.read().unwrap().get(server).cloned()
    }

    /// Traffic admission decision for one path of one server.
    pub fn allow(&self, server: &ServerName, path: ProbePath) -> Admission {
        let Some(entry) = self.entry(server) else {
            return Admission::Deny;
        };
        let settings = self.settings.read().unwrap().clone();
        let mut sb = entry.lock().unwrap();
        if !sb.path_enabled(path) {
            return Admission::Deny;
        }
        sb.path(path).admit(&settings)
    }

    /// Record one real probe outcome. Infallible; called exactly once per
    /// non-suppressed [`tsh_common::ProbeOutcome`], in completion order.
    pub fn record_outcome(
        &self,
        server: &ServerName,
        path: ProbePath,
        success: bool,
        category: Option<ErrorCategory>,
    ) -> Option<CircuitTransition> {
        let entry = self.entry(server)?;
        let settings = self.settings.read().unwrap().clone();
        let mut sb = entry.lock().unwrap();
        let transition = sb.path(path).record(success, category, &settings);
        drop(sb);

        transition.map(|(from, to)| {
            info!(server = %server, path = %path, ?from, ?to, "circuit transition");
            CircuitTransition {
                server: server.clone(),
                path,
                from,
                to,
            }
        })
    }

    /// Release a half-open trial slot whose probe was cancelled before an
    /// outcome could be recorded.
    pub fn abandon_trial(&self, server: &ServerName, path: ProbePath) {
        if let Some(entry) = self.entry(server) {
            entry.lock().unwrap().path(path).abandon_trial();
        }
    }

    /// Force the selected sub-state(s) to CLOSED with counters zeroed.
    /// Idempotent: resetting an already-closed breaker is a no-op.
    pub fn reset(&self, server: &ServerName, which: ResetPath) -> Option<CircuitSnapshot> {
        let entry = self.entry(server)?;
        {
            let mut sb = entry.lock().unwrap();
            if matches!(which, ResetPath::Protocol | ResetPath::Both) {
                sb.protocol.close();
            }
            if matches!(which, ResetPath::Rest | ResetPath::Both) {
                sb.rest.close();
            }
        }
        self.snapshot(server)
    }

    /// Current state of one server.
    pub fn snapshot(&self, server: &ServerName) -> Option<CircuitSnapshot> {
        let entry = self.entry(server)?;
        let sb = entry.lock().unwrap();
        Some(CircuitSnapshot {
            server: server.clone(),
            overall: sb.overall(),
            advertised_paths: sb.advertised_paths(),
            protocol: snapshot_path(&sb.protocol, sb.protocol_enabled),
            rest: snapshot_path(&sb.rest, sb.rest_enabled),
        })
    }

    /// Current state of every registered server, sorted by name.
    pub fn snapshot_all(&self) -> Vec<CircuitSnapshot> {
        let mut names: Vec<ServerName> =
            self.servers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.snapshot(&name))
            .collect()
    }
}
