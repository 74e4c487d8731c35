//! Trading control plane.
//!
//! Wires the order manager, protective levels, risk engine, circuit breaker,
//! kill switch and reconciliation into one decision loop plus two
//! background tasks.

mod config;
mod controller;
mod error;
mod input;
mod stats;

pub use config::BotConfig;
pub use controller::BREAKER_AUDIT_COMPONENT;
pub use error::BotError;
pub use input::{BotInput, SignalOutcome};
pub use stats::Stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::exchanges::Exchange;
use crate::reconciliation::ReconciliationReport;
use crate::storage::Storage;
use controller::Controller;

/// Main bot that coordinates all components.
pub struct Bot {
    controller: Arc<Controller>,

    // Runtime state
    version: String,
    started_at: Mutex<Option<Instant>>,
    running: Mutex<bool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Bot {
    /// Creates a new Bot instance. Persisted `risk.*` overrides are applied
    /// on top of the file configuration.
    pub async fn new(
        cfg: BotConfig,
        exchange: Arc<dyn Exchange>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, BotError> {
        let mut app_config = cfg.app_config;
        apply_risk_overrides(&mut app_config, storage.as_ref()).await?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Bot {
            controller: Arc::new(Controller::new(app_config, exchange, storage)),
            version: cfg.version,
            started_at: Mutex::new(None),
            running: Mutex::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn cfg(&self) -> &Config {
        &self.controller.cfg
    }

    /// Starts the background tasks and runs the decision loop until `inputs`
    /// closes, [`Bot::request_stop`] is called, or the local store fails.
    pub async fn start(&self, inputs: mpsc::Receiver<BotInput>) -> Result<(), BotError> {
        {
            let mut running = self.running.lock().await;
            if *running {
                return Err(BotError::AlreadyRunning);
            }
            *running = true;
        }
        self.shutdown_tx.send_replace(false);

        {
            let mut started_at = self.started_at.lock().await;
            *started_at = Some(Instant::now());
        }

        let cfg = self.cfg();
        info!(
            version = %self.version,
            exchange = %self.controller.exchange_name(),
            category = %cfg.exchange.category,
            symbols = ?cfg.symbols,
            "Starting trade guard"
        );

        if let Some(record) = self.controller.kill_switch.status().await? {
            warn!(
                reason = %record.reason,
                activated_at = %record.activated_at,
                "kill switch still active from an earlier run; entries stay blocked until reset"
            );
        }

        self.controller.protection.load().await?;

        let (report_tx, report_rx) = mpsc::channel(16);
        let reconciliation = &cfg.reconciliation;

        if reconciliation.enabled {
            if reconciliation.on_startup {
                let report = self.controller.reconciliation.run_pass().await;
                self.controller.apply_report(report).await?;
            }
            let service = self.controller.reconciliation.clone();
            let handle = tokio::spawn(service.run(
                self.controller.reconcile_now.clone(),
                report_tx,
                self.shutdown_tx.subscribe(),
            ));
            self.tasks.lock().await.push(("reconciliation", handle));
        } else {
            warn!("reconciliation disabled; local state is never corrected");
            self.controller.protect_unprotected_positions().await?;
        }

        let handle = tokio::spawn(run_risk_monitor(
            self.controller.clone(),
            cfg.bot.risk_monitor_interval(),
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().await.push(("risk_monitor", handle));

        self.run_main_loop(inputs, report_rx).await
    }

    /// Asks every loop to exit after its current iteration.
    pub fn request_stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Gracefully stops the bot, waiting a bounded time for background tasks.
    pub async fn stop(&self) -> Result<(), BotError> {
        {
            let mut running = self.running.lock().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        info!("Stopping bot...");
        self.request_stop();

        let timeout = self.cfg().bot.shutdown_timeout();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (name, mut handle) in tasks {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(e)) => error!(task = name, error = %e, "task ended abnormally"),
                Err(_) => {
                    warn!(task = name, timeout = ?timeout, "task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.controller.log_stats().await;
        let uptime = self.uptime().await;
        info!(uptime = ?uptime, "Bot stopped");

        Ok(())
    }

    /// Returns a copy of the current statistics.
    pub async fn stats(&self) -> Stats {
        self.controller.stats.lock().await.clone()
    }

    /// Returns true if the bot is currently running.
    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Returns how long the bot has been running.
    pub async fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .await
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Main decision loop.
    async fn run_main_loop(
        &self,
        mut inputs: mpsc::Receiver<BotInput>,
        mut reports: mpsc::Receiver<ReconciliationReport>,
    ) -> Result<(), BotError> {
        let loops = &self.cfg().bot;
        let mut poll = tokio::time::interval(loops.poll_interval());
        let mut stats_timer = tokio::time::interval(loops.stats_interval());
        let mut shutdown = self.shutdown_tx.subscribe();

        info!(
            poll_interval = ?loops.poll_interval(),
            stats_interval = ?loops.stats_interval(),
            "Starting main decision loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let step = tokio::select! {
                _ = poll.tick() => self.controller.poll().await,
                input = inputs.recv() => match input {
                    Some(BotInput::Signal(signal)) => self
                        .controller
                        .handle_signal(signal)
                        .await
                        .map(|outcome| debug!(outcome = ?outcome, "signal handled")),
                    Some(BotInput::Market(update)) => self.controller.handle_market(update).await,
                    None => {
                        info!("input stream closed");
                        break;
                    }
                },
                Some(report) = reports.recv() => self.controller.apply_report(report).await,
                _ = stats_timer.tick() => {
                    self.controller.log_stats().await;
                    Ok(())
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    break;
                }
            };

            if let Err(e) = step {
                error!(error = %e, fatal = e.is_fatal(), "unhandled error in decision loop, halting trading");
                if let Err(halt_err) = self
                    .controller
                    .halt(&format!("unhandled error in decision loop: {}", e))
                    .await
                {
                    error!(error = %halt_err, "kill switch could not be activated");
                }
                if e.is_fatal() {
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

/// Background exposure check without a proposed trade.
async fn run_risk_monitor(controller: Arc<Controller>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    info!(interval = ?period, "risk monitor started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = controller.monitor_risk().await {
            error!(error = %e, "risk monitor pass failed");
        }
    }

    info!("risk monitor stopped");
}

/// Applies `risk.*` entries from the key-value store.
async fn apply_risk_overrides(config: &mut Config, storage: &dyn Storage) -> Result<(), BotError> {
    for (key, value) in storage.config_entries("risk.").await? {
        config.risk.apply_override(&key, &value)?;
        info!(key = %key, value = %value, "risk override applied from store");
    }
    config.risk.validate()?;
    Ok(())
}

#[cfg(test)]
mod tests;
