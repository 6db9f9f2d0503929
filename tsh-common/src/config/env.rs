//! Environment variable overrides with type safety.
//!
//! A small set of `TSH_`-prefixed variables may override global keys of the
//! configuration document. Parsing collects every error so all issues can be
//! reported at once.

use super::EngineConfig;
use std::env;
use thiserror::Error;

const PREFIX: &str = "TSH_";

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: &'static str,
        value: String,
    },
}

/// Apply `TSH_` overrides from the process environment.
pub fn apply_overrides(cfg: &mut EngineConfig) -> Result<(), Vec<EnvError>> {
    apply_from(cfg, |var| env::var(var).ok())
}

/// Apply overrides from an arbitrary variable source.
pub fn apply_from(
    cfg: &mut EngineConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), Vec<EnvError>> {
    let mut errors = Vec::new();

    if let Some(v) = parse_u64(&lookup, "CHECK_INTERVAL_MS", &mut errors) {
        cfg.check_interval_ms = v;
    }
    if let Some(v) = parse_u64(&lookup, "RETENTION_WINDOW_MS", &mut errors) {
        cfg.retention_window_ms = v;
    }
    if let Some(v) = parse_u64(&lookup, "MAX_CONCURRENT_CHECKS", &mut errors) {
        cfg.max_concurrent_checks = v as usize;
    }
    if let Some(v) = lookup(&var_name("LISTEN")) {
        cfg.listen = v;
    }
    if let Some(v) = lookup(&var_name("LOG_LEVEL")) {
        cfg.log_level = Some(v);
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn var_name(name: &str) -> String {
    format!("{PREFIX}{name}")
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    errors: &mut Vec<EnvError>,
) -> Option<u64> {
    let var = var_name(name);
    let raw = lookup(&var)?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(EnvError::InvalidValue {
                var,
                expected: "unsigned integer",
                value: raw,
            });
            None
        }
    }
}
