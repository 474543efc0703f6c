//! Task health auditing
//!
//! A task is healthy while its loop is running and its last poll is
//! recent relative to its interval. The monitor only flags; it never
//! restarts loops. Verdicts persist on transition, so `tasks list`
//! shows the last known state even between runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::store::Store;

use super::task::{HealthStatus, TaskFilter};
use super::PollingEngine;

/// A running task goes stale once `now - last_polled` reaches
/// `interval * multiplier`. A task with no loop is always unhealthy.
pub fn classify(
    is_running: bool,
    now_ms: i64,
    last_polled_ms: i64,
    interval_ms: u64,
    stale_multiplier: f64,
) -> HealthStatus {
    if !is_running {
        return HealthStatus::Unhealthy;
    }
    let window = (interval_ms as f64 * stale_multiplier) as i64;
    if now_ms.saturating_sub(last_polled_ms) < window {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    }
}

pub struct HealthMonitor {
    store: Arc<Store>,
    engine: Arc<PollingEngine>,
    period: Duration,
    stale_multiplier: f64,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<PollingEngine>,
        period: Duration,
        stale_multiplier: f64,
    ) -> Self {
        Self {
            store,
            engine,
            period,
            stale_multiplier,
        }
    }

    /// Audit every active task, persisting verdicts that changed.
    /// Returns the number of transitions.
    pub fn audit_once(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        let mut transitions = 0;
        for task in self.store.tasks(&TaskFilter::active()) {
            let running = self.engine.is_running(&task.id);
            let verdict = classify(
                running,
                now,
                task.last_polled,
                task.interval_ms,
                self.stale_multiplier,
            );
            if verdict == task.health_status {
                continue;
            }

            match verdict {
                HealthStatus::Unhealthy => warn!(
                    task = %task.id,
                    tab = %task.tab_name,
                    provider = %task.provider_name,
                    running,
                    "task is unhealthy; its poll loop stopped or went stale"
                ),
                _ => info!(task = %task.id, provider = %task.provider_name, "task is healthy"),
            }
            if let Err(e) = self.store.update_health(&task.id, verdict, now) {
                warn!(task = %task.id, error = %e, "could not record health verdict");
                continue;
            }
            transitions += 1;
        }
        transitions
    }

    /// Audit on a fixed period until shutdown is signalled.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(period_secs = self.period.as_secs(), "health monitor started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let transitions = self.audit_once();
                    if transitions > 0 {
                        debug!(transitions, "health audit recorded transitions");
                    }
                }
            }
        }
        debug!("health monitor stopped");
    }
}
