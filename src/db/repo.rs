use super::model::{CredentialRow, NewJob};
use crate::model::{JobItem, JobStatus, ScheduledJob, ShopToken};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// --- credentials ----------------------------------------------------------

/// Seed a credential row. Operator/tooling path; the engine itself only
/// ever reads credentials.
pub async fn insert_credential(
    pool: &Pool,
    partner_id: i64,
    partner_key: &str,
    is_active: bool,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO credentials (partner_id, partner_key, is_active) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(partner_id)
    .bind(partner_key)
    .bind(is_active)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn get_credential(pool: &Pool, id: i64) -> Result<Option<CredentialRow>> {
    let row = sqlx::query("SELECT id, partner_id, partner_key, is_active FROM credentials WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(credential_from_row))
}

/// Credential linked to a shop through its token row, if any.
#[instrument(skip_all)]
pub async fn shop_linked_credential(pool: &Pool, shop_id: i64) -> Result<Option<CredentialRow>> {
    let row = sqlx::query(
        "SELECT c.id, c.partner_id, c.partner_key, c.is_active \
         FROM shop_tokens t JOIN credentials c ON t.credential_id = c.id \
         WHERE t.shop_id = ?",
    )
    .bind(shop_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(credential_from_row))
}

fn credential_from_row(row: sqlx::sqlite::SqliteRow) -> CredentialRow {
    CredentialRow {
        id: row.get("id"),
        partner_id: row.get("partner_id"),
        partner_key: row.get("partner_key"),
        is_active: row.get::<i64, _>("is_active") != 0,
    }
}

// --- shop tokens ----------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_shop_token(pool: &Pool, shop_id: i64) -> Result<Option<ShopToken>> {
    let row = sqlx::query(
        "SELECT shop_id, access_token, refresh_token, expires_at, credential_id, updated_at \
         FROM shop_tokens WHERE shop_id = ?",
    )
    .bind(shop_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| ShopToken {
        shop_id: row.get("shop_id"),
        access_token: row.get("access_token"),
        refresh_token: row.get("refresh_token"),
        expires_at: row.get("expires_at"),
        credential_id: row.try_get("credential_id").ok(),
        updated_at: row.get("updated_at"),
    }))
}

/// Idempotent overwrite keyed by shop id. Last write wins; a None
/// `credential_id` preserves any existing link.
#[instrument(skip_all)]
pub async fn upsert_shop_token(
    pool: &Pool,
    shop_id: i64,
    access_token: &str,
    refresh_token: &str,
    expires_at: DateTime<Utc>,
    credential_id: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO shop_tokens (shop_id, access_token, refresh_token, expires_at, credential_id, updated_at) \
         VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(shop_id) DO UPDATE SET \
           access_token = excluded.access_token, \
           refresh_token = excluded.refresh_token, \
           expires_at = excluded.expires_at, \
           credential_id = COALESCE(excluded.credential_id, shop_tokens.credential_id), \
           updated_at = CURRENT_TIMESTAMP",
    )
    .bind(shop_id)
    .bind(access_token)
    .bind(refresh_token)
    .bind(expires_at)
    .bind(credential_id)
    .execute(pool)
    .await
    .context("failed to persist shop token")?;
    Ok(())
}

// --- scheduled jobs -------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_job(pool: &Pool, job: &NewJob) -> Result<i64> {
    let items = serde_json::to_string(&job.items)?;
    let rec = sqlx::query(
        "INSERT INTO scheduled_jobs \
           (shop_id, source_flash_sale_id, timeslot_id, start_time, end_time, run_at, items, status) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'pending') RETURNING id",
    )
    .bind(job.shop_id)
    .bind(job.source_flash_sale_id)
    .bind(job.timeslot_id)
    .bind(job.start_time)
    .bind(job.end_time)
    .bind(job.run_at)
    .bind(items)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn get_job(pool: &Pool, id: i64) -> Result<Option<ScheduledJob>> {
    let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_jobs(pool: &Pool, shop_id: i64) -> Result<Vec<ScheduledJob>> {
    let rows = sqlx::query(
        "SELECT * FROM scheduled_jobs WHERE shop_id = ? ORDER BY datetime(run_at) ASC",
    )
    .bind(shop_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(job_from_row).collect()
}

/// Pending jobs whose run-at instant has passed, oldest first, bounded to
/// `limit` per sweep invocation.
#[instrument(skip_all)]
pub async fn due_job_ids(pool: &Pool, now: DateTime<Utc>, limit: u32) -> Result<Vec<i64>> {
    let rows = sqlx::query(
        "SELECT id FROM scheduled_jobs \
         WHERE status = 'pending' AND datetime(run_at) <= datetime(?) \
         ORDER BY datetime(run_at) ASC LIMIT ?",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.get("id")).collect())
}

/// Atomically claim a pending job for execution. The conditional update is
/// the only mutual-exclusion mechanism between overlapping sweeps: exactly
/// one caller observes `true` for a given pending job.
#[instrument(skip_all)]
pub async fn claim_job(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE scheduled_jobs SET status = 'running', updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn finish_job(
    pool: &Pool,
    id: i64,
    status: JobStatus,
    flash_sale_id: Option<i64>,
    message: &str,
    failed_items: &[i64],
) -> Result<()> {
    let failed = if failed_items.is_empty() {
        None
    } else {
        Some(serde_json::to_string(failed_items)?)
    };
    sqlx::query(
        "UPDATE scheduled_jobs SET status = ?, flash_sale_id = ?, result_message = ?, \
           failed_items = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(flash_sale_id)
    .bind(message)
    .bind(failed)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a job only while it is still pending. Returns false when the row
/// is missing or has already been claimed.
#[instrument(skip_all)]
pub async fn cancel_pending_job(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ? AND status = 'pending'")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Move a pending job's run-at instant. Refused once the job left `pending`.
#[instrument(skip_all)]
pub async fn update_pending_run_at(pool: &Pool, id: i64, run_at: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE scheduled_jobs SET run_at = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(run_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

fn job_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ScheduledJob> {
    let status_str: String = row.get("status");
    let status = JobStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("job has unknown status {}", status_str))?;

    let items_json: String = row.get("items");
    let items: Vec<JobItem> =
        serde_json::from_str(&items_json).context("invalid job item payload")?;

    let failed_items = row
        .try_get::<Option<String>, _>("failed_items")
        .ok()
        .flatten()
        .map(|s| serde_json::from_str::<Vec<i64>>(&s))
        .transpose()
        .context("invalid failed item list")?
        .unwrap_or_default();

    Ok(ScheduledJob {
        id: row.get("id"),
        shop_id: row.get("shop_id"),
        source_flash_sale_id: row.get("source_flash_sale_id"),
        timeslot_id: row.get("timeslot_id"),
        start_time: row.get("start_time"),
        end_time: row.try_get("end_time").ok(),
        run_at: row.get("run_at"),
        items,
        status,
        flash_sale_id: row.try_get("flash_sale_id").ok(),
        result_message: row.try_get("result_message").ok(),
        failed_items,
        created_at: row.get("created_at"),
    })
}
