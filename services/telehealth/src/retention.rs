//! Retention sweep
//!
//! Four independent passes over the recording table: warn about upcoming
//! deletions, archive expired recordings, permanently delete archived ones past
//! the grace period, and fail recordings stuck mid-pipeline. A failure on one
//! record is logged and the pass moves on.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use common::cache::RedisPool;
use common::clock::Clock;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AccessAuditLog;
use crate::config::RetentionConfig;
use crate::models::{AccessAction, Actor, Recording, RecordingStatus};
use crate::notifications::Notifier;
use crate::recordings::RecordingService;
use crate::repositories::{RecordingStore, RecordingUpdate};

/// Redis key guarding the daily sweep across replicas
pub const SWEEP_LEASE_KEY: &str = "telehealth:retention-sweep";

pub const RETENTION_DELETION_REASON: &str = "Retention period expired";

/// Windows applied by the sweep, in days
#[derive(Debug, Clone, Copy)]
pub struct RetentionWindows {
    pub warning_days: i64,
    pub grace_days: i64,
    pub stuck_after_days: i64,
}

impl From<&RetentionConfig> for RetentionWindows {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            warning_days: config.warning_days,
            grace_days: config.grace_days,
            stuck_after_days: config.stuck_after_days,
        }
    }
}

impl Default for RetentionWindows {
    fn default() -> Self {
        Self {
            warning_days: 30,
            grace_days: 90,
            stuck_after_days: 7,
        }
    }
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub processed: usize,
    pub failed: Vec<Uuid>,
}

impl PassReport {
    fn record(&mut self, recording_id: Uuid, ok: bool) {
        if ok {
            self.processed += 1;
        } else {
            self.failed.push(recording_id);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub started_at: DateTime<Utc>,
    pub warned: PassReport,
    pub archived: PassReport,
    pub deleted: PassReport,
    pub stuck_failed: PassReport,
}

impl RetentionReport {
    pub fn failures(&self) -> usize {
        self.warned.failed.len()
            + self.archived.failed.len()
            + self.deleted.failed.len()
            + self.stuck_failed.failed.len()
    }
}

pub struct RetentionSweep {
    recordings: Arc<dyn RecordingStore>,
    service: Arc<RecordingService>,
    audit: AccessAuditLog,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    windows: RetentionWindows,
}

impl RetentionSweep {
    pub fn new(
        recordings: Arc<dyn RecordingStore>,
        service: Arc<RecordingService>,
        audit: AccessAuditLog,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        windows: RetentionWindows,
    ) -> Self {
        Self {
            recordings,
            service,
            audit,
            notifier,
            clock,
            windows,
        }
    }

    /// Run all four passes concurrently against a single `now`
    pub async fn run(&self) -> RetentionReport {
        let now = self.clock.now();
        info!(%now, "Retention sweep started");

        let (warned, archived, deleted, stuck_failed) = tokio::join!(
            self.warn_upcoming(now),
            self.archive_expired(now),
            self.delete_past_grace(now),
            self.fail_stuck(now),
        );

        let report = RetentionReport {
            started_at: now,
            warned,
            archived,
            deleted,
            stuck_failed,
        };

        info!(
            warned = report.warned.processed,
            archived = report.archived.processed,
            deleted = report.deleted.processed,
            stuck_failed = report.stuck_failed.processed,
            failures = report.failures(),
            "Retention sweep finished"
        );
        report
    }

    async fn warn_upcoming(&self, now: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();
        let until = now + Duration::days(self.windows.warning_days);

        let due = match self
            .recordings
            .scheduled_for_deletion(
                &[RecordingStatus::Available, RecordingStatus::Archived],
                Some(now),
                until,
            )
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Retention warning pass could not list recordings");
                return report;
            }
        };

        for recording in due {
            let days_remaining = days_until(now, recording.scheduled_deletion_at);
            self.notifier
                .retention_warning(&recording, days_remaining)
                .await;
            report.record(recording.id, true);
        }
        report
    }

    async fn archive_expired(&self, now: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();

        let due = match self
            .recordings
            .scheduled_for_deletion(&[RecordingStatus::Available], None, now)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Archive pass could not list recordings");
                return report;
            }
        };

        for recording in due {
            let ok = self.archive(&recording, now).await;
            report.record(recording.id, ok);
        }
        report
    }

    async fn archive(&self, recording: &Recording, now: DateTime<Utc>) -> bool {
        let update = RecordingUpdate::new(Actor::System, now)
            .status(RecordingStatus::Archived)
            .access(self.audit.entry(
                Actor::System,
                AccessAction::AutoArchive,
                None,
                json!({ "scheduledDeletionAt": recording.scheduled_deletion_at }),
            ));

        match self
            .recordings
            .transition(recording.id, &[RecordingStatus::Available], update)
            .await
        {
            Ok(Some(_)) => {
                info!(recording_id = %recording.id, "Recording archived");
                true
            }
            Ok(None) => {
                warn!(recording_id = %recording.id, "Recording changed state before it could be archived");
                false
            }
            Err(e) => {
                error!(recording_id = %recording.id, error = %e, "Failed to archive recording");
                false
            }
        }
    }

    async fn delete_past_grace(&self, now: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();
        let cutoff = now - Duration::days(self.windows.grace_days);

        let due = match self
            .recordings
            .scheduled_for_deletion(&[RecordingStatus::Archived], None, cutoff)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Deletion pass could not list recordings");
                return report;
            }
        };

        for recording in due {
            let result = self
                .service
                .delete(recording.id, Actor::System, RETENTION_DELETION_REASON)
                .await;
            if let Err(e) = &result {
                error!(recording_id = %recording.id, error = %e, "Failed to permanently delete recording");
            }
            report.record(recording.id, result.is_ok());
        }
        report
    }

    async fn fail_stuck(&self, now: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();
        let cutoff = now - Duration::days(self.windows.stuck_after_days);
        let stuck_states = [RecordingStatus::Processing, RecordingStatus::Uploading];

        let stale = match self.recordings.stale(&stuck_states, cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "Stuck-recording pass could not list recordings");
                return report;
            }
        };

        for recording in stale {
            let mut update = RecordingUpdate::new(Actor::System, now).status(RecordingStatus::Failed);
            update.processing_error = Some(format!(
                "Recording stuck in {} since {} (more than {} days)",
                recording.status, recording.updated_at, self.windows.stuck_after_days
            ));

            let ok = match self
                .recordings
                .transition(recording.id, &stuck_states, update)
                .await
            {
                Ok(Some(_)) => {
                    warn!(recording_id = %recording.id, status = %recording.status, "Stuck recording marked as failed");
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    error!(recording_id = %recording.id, error = %e, "Failed to mark stuck recording");
                    false
                }
            };
            report.record(recording.id, ok);
        }
        report
    }
}

/// Whole days until `deadline`, rounded up
fn days_until(now: DateTime<Utc>, deadline: DateTime<Utc>) -> i64 {
    let seconds = (deadline - now).num_seconds().max(0);
    (seconds + 86_399) / 86_400
}

/// Optional Redis lease so only one replica sweeps
#[derive(Clone)]
pub struct SweepLease {
    pub redis: RedisPool,
    pub ttl_seconds: u64,
}

/// Run the sweep, guarded by the lease when one is configured
pub async fn run_guarded(sweep: &RetentionSweep, lease: Option<&SweepLease>) -> Option<RetentionReport> {
    let Some(lease) = lease else {
        return Some(sweep.run().await);
    };

    let token = Uuid::new_v4().to_string();
    match lease
        .redis
        .try_acquire_lease(SWEEP_LEASE_KEY, &token, lease.ttl_seconds)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            info!("Retention sweep lease held by another replica; skipping");
            return None;
        }
        Err(e) => {
            error!(error = %e, "Could not acquire retention sweep lease; skipping");
            return None;
        }
    }

    let report = sweep.run().await;

    if let Err(e) = lease.redis.release_lease(SWEEP_LEASE_KEY, &token).await {
        warn!(error = %e, "Failed to release retention sweep lease; it will expire");
    }
    Some(report)
}

/// Register the sweep as a cron job and start the scheduler.
///
/// The returned scheduler must be kept alive for the job to keep firing.
pub async fn start_scheduler(
    sweep: Arc<RetentionSweep>,
    schedule: &str,
    lease: Option<SweepLease>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(schedule, move |_, _| {
        let sweep = sweep.clone();
        let lease = lease.clone();
        Box::pin(async move {
            info!("Retention sweep job triggered");
            if let Some(report) = run_guarded(&sweep, lease.as_ref()).await {
                if report.failures() > 0 {
                    warn!(failures = report.failures(), "Retention sweep finished with failures");
                }
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    info!("Started retention sweep scheduler with schedule: {}", schedule);
    Ok(scheduler)
}
