//! Durable queue of scheduled copy jobs and the due-job sweep.
//!
//! Job due-ness is evaluated by whoever invokes `sweep` — an external timer
//! or an on-demand trigger — so overlapping invocations are expected. The
//! pending→running claim is a single conditional update; exactly one caller
//! wins a given job.

use crate::db::{self, NewJob};
use crate::executor::FlashSaleExecutor;
use crate::model::{JobItem, JobStatus, ScheduledJob};
use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};

pub const MIN_LEAD_MINUTES: i64 = 1;
pub const MAX_LEAD_MINUTES: i64 = 60;

/// One target timeslot in a batch schedule request.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub timeslot_id: i64,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub items: Vec<JobItem>,
}

/// Per-entry outcome of a batch schedule request. One entry failing to
/// insert does not block its siblings.
#[derive(Debug, Clone, Serialize)]
pub struct EntryResult {
    pub timeslot_id: i64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lead time is clamped to [1, 60] minutes before the timeslot start.
pub fn clamp_lead_minutes(minutes: i64) -> i64 {
    minutes.clamp(MIN_LEAD_MINUTES, MAX_LEAD_MINUTES)
}

#[instrument(skip(pool, entries))]
pub async fn schedule(
    pool: &SqlitePool,
    shop_id: i64,
    source_flash_sale_id: i64,
    entries: &[ScheduleEntry],
    minutes_before: i64,
) -> Result<Vec<EntryResult>> {
    let lead = clamp_lead_minutes(minutes_before);
    let mut results = Vec::with_capacity(entries.len());
    for entry in entries {
        let job = NewJob {
            shop_id,
            source_flash_sale_id,
            timeslot_id: entry.timeslot_id,
            start_time: entry.start_time,
            end_time: entry.end_time,
            run_at: entry.start_time - Duration::minutes(lead),
            items: entry.items.clone(),
        };
        match db::insert_job(pool, &job).await {
            Ok(id) => {
                info!(shop_id, timeslot_id = entry.timeslot_id, job_id = id, "scheduled copy job");
                results.push(EntryResult {
                    timeslot_id: entry.timeslot_id,
                    success: true,
                    job_id: Some(id),
                    message: None,
                });
            }
            Err(err) => {
                warn!(?err, timeslot_id = entry.timeslot_id, "failed to schedule entry");
                results.push(EntryResult {
                    timeslot_id: entry.timeslot_id,
                    success: false,
                    job_id: None,
                    message: Some(err.to_string()),
                });
            }
        }
    }
    Ok(results)
}

pub async fn list(pool: &SqlitePool, shop_id: i64) -> Result<Vec<ScheduledJob>> {
    db::list_jobs(pool, shop_id).await
}

/// Delete a job that has not yet been claimed. Cancelling a running job is
/// refused so a sweep in flight is never raced.
pub async fn cancel(pool: &SqlitePool, job_id: i64) -> Result<()> {
    if db::cancel_pending_job(pool, job_id).await? {
        return Ok(());
    }
    match db::get_job(pool, job_id).await? {
        None => bail!("job {} not found", job_id),
        Some(job) => bail!(
            "job {} cannot be cancelled while {}",
            job_id,
            job.status.as_str()
        ),
    }
}

pub async fn update_run_at(
    pool: &SqlitePool,
    job_id: i64,
    new_run_at: DateTime<Utc>,
) -> Result<()> {
    if db::update_pending_run_at(pool, job_id, new_run_at).await? {
        return Ok(());
    }
    match db::get_job(pool, job_id).await? {
        None => bail!("job {} not found", job_id),
        Some(job) => bail!(
            "job {} cannot be rescheduled while {}",
            job_id,
            job.status.as_str()
        ),
    }
}

/// Execute a pending job immediately, regardless of its run-at instant.
/// Uses the same atomic claim as the sweep, so an overlapping sweep cannot
/// double-execute the job.
pub async fn force_run(
    pool: &SqlitePool,
    executor: &dyn FlashSaleExecutor,
    job_id: i64,
) -> Result<ScheduledJob> {
    if !db::claim_job(pool, job_id).await? {
        match db::get_job(pool, job_id).await? {
            None => bail!("job {} not found", job_id),
            Some(job) => bail!(
                "job {} cannot be force-run while {}",
                job_id,
                job.status.as_str()
            ),
        }
    }
    execute_claimed(pool, executor, job_id).await?;
    db::get_job(pool, job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {} disappeared after execution", job_id))
}

/// Select due pending jobs (oldest first, bounded to `limit`), claim and
/// execute each sequentially. Returns how many jobs this invocation
/// executed; jobs lost to a concurrent sweep's claim are skipped.
#[instrument(skip_all)]
pub async fn sweep(
    pool: &SqlitePool,
    executor: &dyn FlashSaleExecutor,
    limit: u32,
) -> Result<usize> {
    let due = db::due_job_ids(pool, Utc::now(), limit).await?;
    let mut executed = 0;
    for job_id in due {
        if !db::claim_job(pool, job_id).await? {
            continue;
        }
        execute_claimed(pool, executor, job_id).await?;
        executed += 1;
    }
    Ok(executed)
}

/// Run one claimed job and write its terminal state. Executor failures are
/// recorded on the job, never propagated, so one bad job does not abort the
/// sweep.
async fn execute_claimed(
    pool: &SqlitePool,
    executor: &dyn FlashSaleExecutor,
    job_id: i64,
) -> Result<()> {
    let Some(job) = db::get_job(pool, job_id).await? else {
        warn!(job_id, "claimed job no longer exists");
        return Ok(());
    };

    match executor
        .execute(job.shop_id, job.timeslot_id, &job.items)
        .await
    {
        Ok(outcome) => {
            let status = if outcome.success {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            info!(job_id, status = status.as_str(), message = %outcome.message, "job finished");
            db::finish_job(
                pool,
                job_id,
                status,
                outcome.flash_sale_id,
                &outcome.message,
                &outcome.failed_items,
            )
            .await
        }
        Err(err) => {
            warn!(job_id, ?err, "job execution failed");
            db::finish_job(pool, job_id, JobStatus::Failed, None, &err.to_string(), &[]).await
        }
    }
}
