//! Periodic recovery sweep.
//!
//! Each pass:
//! - returns stale PROCESSING jobs to the queue, or fails them once their
//!   retry budget is spent
//! - re-announces paid registrations that have not been provisioned
//! - purges expired pending registrations
//!
//! A failing step is logged and the remaining steps still run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::enqueue_job;
use crate::config::AppConfig;
use crate::jobs::{JobStatus, JobStore};
use crate::orchestrator::Orchestrator;
use crate::queue::{EnqueueOptions, TaskPayload, TaskQueue};
use crate::registration::RegistrationStore;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// PROCESSING jobs idle for longer than this are presumed orphaned.
    pub stale_timeout: Duration,
    pub enqueue: EnqueueOptions,
    /// Paid registrations re-announced per pass.
    pub registration_batch: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

impl WatchdogConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            interval: config.watchdog_interval,
            stale_timeout: config.stale_job_timeout,
            enqueue: EnqueueOptions::default().with_max_deliveries(config.queue_max_deliveries),
            registration_batch: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
    pub provisioning_reenqueued: usize,
    pub registrations_purged: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Watchdog {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<Orchestrator>,
    registrations: Option<Arc<dyn RegistrationStore>>,
    config: WatchdogConfig,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("config", &self.config)
            .field("registrations", &self.registrations.is_some())
            .finish_non_exhaustive()
    }
}

impl Watchdog {
    pub fn new(
        config: WatchdogConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            store,
            queue,
            orchestrator,
            registrations: None,
            config,
        }
    }

    pub fn with_registrations(mut self, registrations: Arc<dyn RegistrationStore>) -> Self {
        self.registrations = Some(registrations);
        self
    }

    /// Run one recovery pass.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.recover_jobs(&mut report).await;
        self.recover_registrations(&mut report).await;

        if report.is_empty() {
            debug!("watchdog sweep found nothing to do");
        } else {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                provisioning = report.provisioning_reenqueued,
                purged = report.registrations_purged,
                "watchdog sweep"
            );
        }
        report
    }

    async fn recover_jobs(&self, report: &mut SweepReport) {
        let reclaimed = match self.store.reclaim_stale(self.config.stale_timeout).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "reclaiming stale jobs failed");
                return;
            }
        };

        for job in reclaimed {
            match job.status {
                JobStatus::Queued => {
                    report.requeued += 1;
                    if let Err(e) = enqueue_job(self.queue.as_ref(), &job, self.config.enqueue.clone()).await {
                        warn!(job_id = %job.id, error = %e, "re-enqueue after reclaim failed; claim_next will pick it up");
                    }
                }
                JobStatus::Failed => {
                    report.failed += 1;
                    warn!(job_id = %job.id, job_type = %job.job_type, "stale job exhausted its retries");
                    self.orchestrator.announce_failure(&job).await;
                }
                other => {
                    debug!(job_id = %job.id, status = %other, "reclaimed job in unexpected state");
                }
            }
        }
    }

    async fn recover_registrations(&self, report: &mut SweepReport) {
        let Some(registrations) = &self.registrations else {
            return;
        };

        // Rows touched within the last interval may still have a task in flight.
        let settled_before = Utc::now()
            - chrono::Duration::from_std(self.config.interval).unwrap_or_else(|_| chrono::Duration::zero());

        match registrations.list_paid_unprovisioned(self.config.registration_batch).await {
            Ok(paid) => {
                for registration in paid.into_iter().filter(|r| r.updated_at <= settled_before) {
                    let payload = TaskPayload::Provisioning {
                        checkout_session_id: registration.checkout_session_id.clone(),
                    };
                    match self.queue.enqueue(payload, self.config.enqueue.clone()).await {
                        Ok(_) => report.provisioning_reenqueued += 1,
                        Err(e) => warn!(
                            checkout_session_id = %registration.checkout_session_id,
                            error = %e,
                            "re-enqueue of provisioning task failed"
                        ),
                    }
                }
            }
            Err(e) => warn!(error = %e, "listing paid registrations failed"),
        }

        match registrations.purge_expired(Utc::now()).await {
            Ok(n) => report.registrations_purged = n,
            Err(e) => warn!(error = %e, "purging expired registrations failed"),
        }
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                }
            }
            debug!("watchdog stopped");
        })
    }
}
