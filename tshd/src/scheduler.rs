//! Periodic check scheduling.
//!
//! One scheduler task per configuration epoch. On tick it enqueues a check
//! request for every due server into a bounded work channel; a full channel
//! drops the tick for the overflowing server and counts the drop. The
//! scheduler never blocks on the channel.

use crate::engine::Epoch;
use crate::events::{kind, EventBus};
use crate::metrics::MetricsStore;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tsh_common::ServerName;

/// Minimum tick resolution, guarding against pathological intervals.
const MIN_RESOLUTION: Duration = Duration::from_millis(50);

/// One scheduled check.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub server: ServerName,
}

/// Start the tick loop for an epoch.
pub fn start_scheduler(
    epoch: Arc<Epoch>,
    tx: mpsc::Sender<CheckRequest>,
    metrics: Arc<MetricsStore>,
    events: EventBus,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = epoch.config.clone();
        let servers: Vec<(ServerName, Duration)> = config
            .servers
            .iter()
            .filter(|s| !s.enabled_paths().is_empty())
            .map(|s| {
                (
                    s.server_name(),
                    s.effective_interval(config.check_interval_ms),
                )
            })
            .collect();
        if servers.is_empty() {
            info!("scheduler idle: no enabled servers in this epoch");
            return;
        }

        let resolution = servers
            .iter()
            .map(|(_, d)| *d)
            .min()
            .unwrap_or(MIN_RESOLUTION)
            .max(MIN_RESOLUTION);
        let mut ticker = interval(resolution);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancel = epoch.cancel_rx();

        // Everything is due on the first tick.
        let start = Instant::now();
        let mut next_due: HashMap<ServerName, Instant> = servers
            .iter()
            .map(|(name, _)| (name.clone(), start))
            .collect();

        info!(
            servers = servers.len(),
            resolution_ms = resolution.as_millis() as u64,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        debug!("scheduler stopping: epoch cancelled");
                        return;
                    }
                    continue;
                }
            }

            let now = Instant::now();
            for (name, every) in &servers {
                let due = next_due.get_mut(name).expect("all servers seeded");
                if *due > now {
                    continue;
                }
                match tx.try_send(CheckRequest {
                    server: name.clone(),
                }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        metrics.inc_scheduler_drop();
                        events.emit(kind::SCHEDULER_DROP, &json!({ "server": name.as_str() }));
                        warn!(server = %name, "work channel full; dropping tick");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("scheduler stopping: work channel closed");
                        return;
                    }
                }
                // Catch up without bursting.
                while *due <= now {
                    *due += *every;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsStore;
    use std::collections::BTreeMap;
    use tsh_common::config::{EngineConfig, ServerConfig};

    fn server(name: &str, interval_ms: u64) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            protocol_endpoint: None,
            protocol_enabled: false,
            protocol_timeout_ms: 1_000,
            protocol_retries: 0,
            expected_tools: vec![],
            rest_endpoint: Some("http://127.0.0.1:1/health".to_string()),
            rest_enabled: true,
            rest_timeout_ms: 1_000,
            rest_retries: 0,
            rest_expected_status_codes: vec![200],
            auth_headers: BTreeMap::new(),
            weight_protocol: 1.0,
            weight_rest: 1.0,
            require_both_success: false,
            closed_requires_all_paths: true,
            check_interval_ms: Some(interval_ms),
        }
    }

    fn epoch_with(servers: Vec<ServerConfig>) -> Arc<Epoch> {
        let config = EngineConfig {
            check_interval_ms: 100,
            servers,
            ..EngineConfig::default()
        };
        Epoch::new(1, Arc::new(config))
    }

    #[tokio::test]
    async fn enqueues_every_enabled_server_on_first_tick() {
        let epoch = epoch_with(vec![server("a", 60_000), server("b", 60_000)]);
        let metrics = Arc::new(MetricsStore::new(Duration::from_secs(60), 64));
        let (tx, mut rx) = mpsc::channel(8);
        let handle = start_scheduler(epoch.clone(), tx, metrics, EventBus::default());

        let mut seen = Vec::new();
        for _ in 0..2 {
            let req = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            seen.push(req.server.as_str().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);

        epoch.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let epoch = epoch_with(vec![server("a", 60), server("b", 60)]);
        let metrics = Arc::new(MetricsStore::new(Duration::from_secs(60), 64));
        // Capacity 1 and nobody draining: overflow is guaranteed.
        let (tx, _rx) = mpsc::channel(1);
        let handle = start_scheduler(epoch.clone(), tx, metrics.clone(), EventBus::default());

        tokio::time::sleep(Duration::from_millis(400)).await;
        epoch.cancel();
        let _ = handle.await;

        let drops = metrics.counters().scheduler_drops;
        assert!(drops >= 1, "expected at least one drop, got {drops}");
    }

    #[tokio::test]
    async fn cancelled_epoch_stops_the_loop() {
        let epoch = epoch_with(vec![server("a", 50)]);
        let metrics = Arc::new(MetricsStore::new(Duration::from_secs(60), 64));
        let (tx, mut rx) = mpsc::channel(8);
        let handle = start_scheduler(epoch.clone(), tx, metrics, EventBus::default());

        let _ = rx.recv().await;
        epoch.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn no_enabled_servers_exits_immediately() {
        let mut disabled = server("a", 100);
        disabled.rest_enabled = false;
        let epoch = epoch_with(vec![disabled]);
        let metrics = Arc::new(MetricsStore::new(Duration::from_secs(60), 64));
        let (tx, _rx) = mpsc::channel(8);
        let handle = start_scheduler(epoch, tx, metrics, EventBus::default());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should exit")
            .unwrap();
    }
}
