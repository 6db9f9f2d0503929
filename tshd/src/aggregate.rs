//! Dual-path result aggregation.
//!
//! Pure function from up to two probe outcomes to one [`DualResult`]. The
//! status table is evaluated top to bottom over *enabled* paths; the weighted
//! health score is computed independently of the status, so a
//! `require_both_success` violation can report UNHEALTHY with a non-zero
//! score. The aggregator never mutates breaker or metrics state.

use chrono::{DateTime, Utc};
use tsh_common::config::ServerConfig;
use tsh_common::{DualResult, HealthStatus, ProbeOutcome, ProbePath};

/// Aggregation output; `malformed` marks inputs that violated the contract
/// (wrong path or server in a slot) and degraded the result to UNKNOWN.
#[derive(Debug, Clone)]
pub struct Aggregated {
    pub result: DualResult,
    pub malformed: bool,
}

/// Combine the outcomes of one logical check.
///
/// Either slot may be `None` when that path is disabled; suppressed outcomes
/// participate as failures.
pub fn aggregate(
    config: &ServerConfig,
    protocol: Option<ProbeOutcome>,
    rest: Option<ProbeOutcome>,
    observed_at: DateTime<Utc>,
) -> Aggregated {
    let server = config.server_name();

    let slot_ok = |outcome: &Option<ProbeOutcome>, path: ProbePath| {
        outcome
            .as_ref()
            .map(|o| o.path == path && o.server == server)
            .unwrap_or(true)
    };
    if !slot_ok(&protocol, ProbePath::Protocol) || !slot_ok(&rest, ProbePath::Rest) {
        return Aggregated {
            result: unknown_result(config, observed_at),
            malformed: true,
        };
    }

    let enabled = config.enabled_paths();
    let outcome_for = |path: ProbePath| match path {
        ProbePath::Protocol => protocol.as_ref(),
        ProbePath::Rest => rest.as_ref(),
    };
    let succeeded =
        |path: ProbePath| outcome_for(path).map(|o| o.success).unwrap_or(false);

    let successes = enabled.iter().filter(|p| succeeded(**p)).count();

    let overall_status = if enabled.is_empty() {
        HealthStatus::Unknown
    } else if config.require_both_success
        && enabled
            .iter()
            .any(|p| outcome_for(*p).map(|o| !o.success).unwrap_or(true))
    {
        HealthStatus::Unhealthy
    } else if successes == enabled.len() {
        HealthStatus::Healthy
    } else if successes == 0 {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    };

    let weight_sum: f64 = enabled.iter().map(|p| config.weight(*p)).sum();
    let health_score = if weight_sum > 0.0 {
        enabled
            .iter()
            .filter(|p| succeeded(**p))
            .map(|p| config.weight(*p))
            .sum::<f64>()
            / weight_sum
    } else {
        0.0
    };

    let combined_duration_ms = protocol
        .iter()
        .chain(rest.iter())
        .map(|o| o.duration_ms)
        .max()
        .unwrap_or(0);

    let available_paths: Vec<ProbePath> = enabled
        .iter()
        .copied()
        .filter(|p| succeeded(*p))
        .collect();

    let overall_success = matches!(
        overall_status,
        HealthStatus::Healthy | HealthStatus::Degraded
    );

    Aggregated {
        result: DualResult {
            server,
            observed_at,
            protocol_outcome: protocol,
            rest_outcome: rest,
            overall_status,
            overall_success,
            combined_duration_ms,
            health_score,
            available_paths,
        },
        malformed: false,
    }
}

fn unknown_result(config: &ServerConfig, observed_at: DateTime<Utc>) -> DualResult {
    DualResult {
        server: config.server_name(),
        observed_at,
        protocol_outcome: None,
        rest_outcome: None,
        overall_status: HealthStatus::Unknown,
        overall_success: false,
        combined_duration_ms: 0,
        health_score: 0.0,
        available_paths: Vec::new(),
    }
}
