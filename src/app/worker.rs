//! Background settlement worker.
//!
//! Periodically reconciles settlement reservations whose outcome was left
//! unknown and, when enabled, refunds expired cards.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::service::CardService;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Refund expired cards automatically
    pub enable_refund_sweep: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(30),
            batch_size: 20,
            enable_refund_sweep: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env::var("ENABLE_SETTLEMENT_WORKER")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.enabled),
            poll_interval: env::var("SETTLEMENT_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            batch_size: env::var("SETTLEMENT_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            enable_refund_sweep: env::var("ENABLE_REFUND_SWEEP")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.enable_refund_sweep),
        }
    }
}

pub struct SettlementWorker {
    service: Arc<CardService>,
    config: WorkerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl SettlementWorker {
    #[must_use]
    pub fn new(
        service: Arc<CardService>,
        config: WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            service,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            refund_sweep = self.config.enable_refund_sweep,
            "Settlement worker started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Settlement worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One reconciliation pass followed by the optional refund sweep
    pub async fn tick(&self) {
        match self
            .service
            .run_reconciliation_pass(self.config.batch_size)
            .await
        {
            Ok(report) if report.examined > 0 => info!(
                examined = report.examined,
                completed = report.completed,
                released = report.released,
                pending = report.pending,
                errors = report.errors,
                "Reconciliation pass finished"
            ),
            Ok(_) => {}
            Err(e) => error!(error = ?e, "Reconciliation pass failed"),
        }

        if self.config.enable_refund_sweep {
            match self.service.run_refund_sweep(self.config.batch_size).await {
                Ok(0) => {}
                Ok(refunded) => info!(refunded, "Refund sweep finished"),
                Err(e) => warn!(error = ?e, "Refund sweep failed"),
            }
        }
    }
}

/// Spawn the worker. Send `true` on the returned channel to stop it.
pub fn spawn_worker(
    service: Arc<CardService>,
    config: WorkerConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = SettlementWorker::new(service, config, shutdown_rx);
    let handle = tokio::spawn(worker.run());
    (handle, shutdown_tx)
}
