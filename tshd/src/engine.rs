//! Engine handle owning the component instances.
//!
//! The only process-wide state is here: the current epoch pointer plus the
//! long-lived breaker, metrics store, result cache, and event bus. Hot
//! reload atomically swaps epochs; tasks belonging to the old epoch observe
//! its cancellation signal and wind down while in-flight probes complete
//! against their original configuration snapshot.

use crate::breaker::CircuitBreaker;
use crate::events::{kind, EventBus};
use crate::metrics::{start_janitor, MetricsStore};
use crate::scheduler::{start_scheduler, CheckRequest};
use crate::service::{HealthCheckService, ResultCache};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use tsh_common::config::EngineConfig;
use tsh_common::ServerName;

/// One immutable configuration snapshot.
pub struct Epoch {
    pub id: u64,
    pub config: Arc<EngineConfig>,
    cancel_tx: watch::Sender<bool>,
}

impl Epoch {
    pub fn new(id: u64, config: Arc<EngineConfig>) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            config,
            cancel_tx,
        })
    }

    /// Subscribe to this epoch's cancellation signal.
    pub fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Signal cancellation to every task of this epoch.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

/// The engine: component owner and epoch holder.
pub struct Engine {
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsStore>,
    results: Arc<ResultCache>,
    events: EventBus,
    epoch: RwLock<Arc<Epoch>>,
    next_epoch_id: AtomicU64,
    started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone()));
        for server in &config.servers {
            breaker.ensure_server(server);
        }
        let metrics = Arc::new(MetricsStore::new(
            config.retention_window(),
            config.series_capacity,
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            breaker,
            metrics,
            results: Arc::new(ResultCache::default()),
            events: EventBus::default(),
            epoch: RwLock::new(Epoch::new(1, Arc::new(config))),
            next_epoch_id: AtomicU64::new(2),
            started_at: Instant::now(),
            shutdown_tx,
        })
    }

    /// Spawn the scheduler, check workers, and metrics janitor.
    pub fn start(self: &Arc<Self>) -> Result<(), reqwest::Error> {
        let epoch = self.current_epoch();
        self.spawn_epoch_tasks(&epoch)?;
        start_janitor(
            self.metrics.clone(),
            epoch.config.janitor_interval(),
            self.shutdown_tx.subscribe(),
        );
        info!(epoch = epoch.id, "engine started");
        Ok(())
    }

    fn spawn_epoch_tasks(self: &Arc<Self>, epoch: &Arc<Epoch>) -> Result<(), reqwest::Error> {
        let service = Arc::new(HealthCheckService::new(
            &epoch.config,
            self.breaker.clone(),
            self.metrics.clone(),
            self.results.clone(),
            self.events.clone(),
        )?);

        let workers = epoch.config.effective_max_concurrent();
        let (tx, rx) = mpsc::channel::<CheckRequest>(workers);
        start_scheduler(
            epoch.clone(),
            tx,
            self.metrics.clone(),
            self.events.clone(),
        );
        start_workers(service, epoch.clone(), rx, workers);
        Ok(())
    }

    /// Atomically swap in a new configuration epoch.
    ///
    /// Per-server breaker and metrics state survives for servers still
    /// present; state of removed servers is dropped. In-flight checks of the
    /// old epoch observe cancellation and stop recording.
    pub fn reload(self: &Arc<Self>, config: EngineConfig) -> Result<u64, reqwest::Error> {
        let keep: HashSet<ServerName> =
            config.servers.iter().map(|s| s.server_name()).collect();

        self.breaker.update_settings(config.circuit.clone());
        for server in &config.servers {
            self.breaker.ensure_server(server);
        }
        self.breaker.retain_servers(&keep);
        self.metrics.retain_servers(&keep);
        self.results.retain_servers(&keep);

        let id = self.next_epoch_id.fetch_add(1, Ordering::SeqCst);
        let new_epoch = Epoch::new(id, Arc::new(config));

        let old_epoch = {
            let mut slot = self.epoch.write().unwrap();
            let old = slot.clone();
            *slot = new_epoch.clone();
            old
        };
        old_epoch.cancel();

        self.spawn_epoch_tasks(&new_epoch)?;
        self.events
            .emit(kind::CONFIG_RELOADED, &json!({ "epoch": id }));
        info!(epoch = id, servers = keep.len(), "configuration reloaded");
        Ok(id)
    }

    /// Cancel the current epoch and stop background tasks.
    pub fn shutdown(&self) {
        self.current_epoch().cancel();
        let _ = self.shutdown_tx.send(true);
        info!("engine shut down");
    }

    pub fn current_epoch(&self) -> Arc<Epoch> {
        self.epoch.read().unwrap().clone()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn results(&self) -> &Arc<ResultCache> {
        &self.results
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Spawn the check workers draining the epoch's work channel.
fn start_workers(
    service: Arc<HealthCheckService>,
    epoch: Arc<Epoch>,
    rx: mpsc::Receiver<CheckRequest>,
    count: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..count.max(1))
        .map(|worker| {
            let service = service.clone();
            let epoch = epoch.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                let cancel = epoch.cancel_rx();
                loop {
                    let request = recv_or_cancelled(&rx, &cancel).await;
                    let Some(request) = request else {
                        debug!(worker, "check worker stopping");
                        return;
                    };
                    let Some(config) = epoch
                        .config
                        .servers
                        .iter()
                        .find(|s| s.server_name() == request.server)
                    else {
                        continue;
                    };
                    service.run_check(config, &cancel).await;
                }
            })
        })
        .collect()
}

fn recv_or_cancelled<'a>(
    rx: &'a tokio::sync::Mutex<mpsc::Receiver<CheckRequest>>,
    cancel: &'a watch::Receiver<bool>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<CheckRequest>> + Send + 'a>> {
    Box::pin(async move {
        let mut rx = rx.lock().await;
        tokio::select! {
            request = rx.recv() => request,
            _ = wait_cancelled(cancel) => None,
        }
    })
}

async fn wait_cancelled(cancel: &watch::Receiver<bool>) {
    let mut cancel = cancel.clone();
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
