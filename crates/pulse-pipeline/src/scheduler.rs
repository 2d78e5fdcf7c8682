//! Host-driven background loops
//!
//! The core components expose their periodic operations as plain callable
//! functions; this scheduler owns the timers and drives them at the
//! configured intervals until shutdown is signalled.

use crate::context::AppContext;
use pulse_common::time::now_millis;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle over the running background loops
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn every background loop for the context
    pub fn start(context: Arc<AppContext>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let intervals = context.config.scheduler.clone();
        let mut tasks = Vec::new();

        {
            let context = context.clone();
            tasks.push(spawn_loop(
                "escalations",
                Duration::from_millis(intervals.escalation_check_interval_ms),
                shutdown_rx.clone(),
                move || {
                    let context = context.clone();
                    async move {
                        match context.alerts.lifecycle().check_escalations().await {
                            Ok(escalated) if !escalated.is_empty() => {
                                info!("escalated {} alert(s)", escalated.len())
                            }
                            Ok(_) => {}
                            Err(e) => warn!("escalation sweep failed: {}", e),
                        }
                    }
                },
            ));
        }

        {
            let context = context.clone();
            tasks.push(spawn_loop(
                "reminders",
                Duration::from_millis(intervals.reminder_check_interval_ms),
                shutdown_rx.clone(),
                move || {
                    let context = context.clone();
                    async move {
                        match context.alerts.lifecycle().check_reminders().await {
                            Ok(due) => {
                                for state in due {
                                    info!(
                                        "alert {} (severity {}) still {} and due for a reminder",
                                        state.alert_id,
                                        state.severity.as_str(),
                                        state.status.as_str()
                                    );
                                    if let Err(e) = context
                                        .alerts
                                        .lifecycle()
                                        .record_notification(state.alert_id)
                                        .await
                                    {
                                        warn!("failed to record reminder: {}", e);
                                    }
                                }
                            }
                            Err(e) => warn!("reminder sweep failed: {}", e),
                        }
                    }
                },
            ));
        }

        {
            let context = context.clone();
            tasks.push(spawn_loop(
                "dedup_cleanup",
                Duration::from_millis(intervals.dedup_cleanup_interval_ms),
                shutdown_rx.clone(),
                move || {
                    let context = context.clone();
                    async move {
                        if let Err(e) = context.alerts.filter().cleanup().await {
                            warn!("dedup cleanup failed: {}", e);
                        }
                    }
                },
            ));
        }

        {
            let context = context.clone();
            tasks.push(spawn_loop(
                "idempotency_cleanup",
                Duration::from_millis(intervals.idempotency_cleanup_interval_ms),
                shutdown_rx.clone(),
                move || {
                    let context = context.clone();
                    async move {
                        if let Err(e) = context.idempotency.cleanup_expired(now_millis()).await {
                            warn!("idempotency cleanup failed: {}", e);
                        }
                    }
                },
            ));
        }

        {
            let context = context.clone();
            tasks.push(spawn_loop(
                "dead_letter_retry",
                Duration::from_millis(intervals.dead_letter_retry_interval_ms),
                shutdown_rx,
                move || {
                    let context = context.clone();
                    async move {
                        match context.dead_letter_worker.run_once().await {
                            Ok(sweep) if sweep.claimed > 0 => {
                                debug!("dead-letter sweep: {:?}", sweep)
                            }
                            Ok(_) => {}
                            Err(e) => warn!("dead-letter sweep failed: {}", e),
                        }
                    }
                },
            ));
        }

        info!("scheduler started with {} loop(s)", tasks.len());
        Scheduler { shutdown_tx, tasks }
    }

    /// Signal every loop to stop and wait for them to finish
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("scheduler stopped");
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("scheduler loop '{}' tick", name);
                    tick().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("scheduler loop '{}' stopping", name);
                        break;
                    }
                }
            }
        }
    })
}
