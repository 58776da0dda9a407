use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use shopsched::actions::{self, Action, ShopAuthorizer};
use shopsched::db;
use shopsched::executor::FlashSaleExecutor;
use shopsched::model::{CopyOutcome, JobItem, JobStatus, ShopToken};
use shopsched::scheduler::{self, ScheduleEntry};
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct ExecutedCall {
    shop_id: i64,
    timeslot_id: i64,
    item_count: usize,
}

#[derive(Clone, Default)]
struct RecordingExecutor {
    responses: Arc<Mutex<VecDeque<anyhow::Result<CopyOutcome>>>>,
    calls: Arc<Mutex<Vec<ExecutedCall>>>,
}

impl RecordingExecutor {
    fn with_responses(responses: Vec<anyhow::Result<CopyOutcome>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<ExecutedCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl FlashSaleExecutor for RecordingExecutor {
    async fn execute(
        &self,
        shop_id: i64,
        timeslot_id: i64,
        items: &[JobItem],
    ) -> anyhow::Result<CopyOutcome> {
        self.calls.lock().await.push(ExecutedCall {
            shop_id,
            timeslot_id,
            item_count: items.len(),
        });
        // Yield so overlapping sweeps interleave on a single-threaded runtime.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or_else(|| {
            Ok(CopyOutcome {
                success: true,
                flash_sale_id: Some(1),
                message: "ok".into(),
                failed_items: Vec::new(),
            })
        })
    }
}

async fn setup_pool() -> SqlitePool {
    // A pooled in-memory database is per-connection; pin the pool to one
    // connection so every caller sees the same database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn entry(timeslot_id: i64, start_time: DateTime<Utc>, item_count: i64) -> ScheduleEntry {
    ScheduleEntry {
        timeslot_id,
        start_time,
        end_time: None,
        items: (1..=item_count)
            .map(|i| JobItem {
                item_id: i,
                model_id: None,
                promo_price: Some(5.0),
                stock: None,
            })
            .collect(),
    }
}

#[tokio::test]
async fn schedule_computes_run_at_from_lead_minutes() {
    let pool = setup_pool().await;
    let start = Utc::now() + Duration::hours(2);

    let results = scheduler::schedule(&pool, 42, 7, &[entry(900, start, 1)], 10)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success);

    let job = db::get_job(&pool, results[0].job_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.run_at, start - Duration::seconds(600));
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn lead_minutes_are_clamped_on_schedule() {
    let pool = setup_pool().await;
    let start = Utc::now() + Duration::hours(2);

    let results = scheduler::schedule(&pool, 42, 7, &[entry(901, start, 1)], 70)
        .await
        .unwrap();
    let job = db::get_job(&pool, results[0].job_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.run_at, start - Duration::minutes(60));

    let results = scheduler::schedule(&pool, 42, 7, &[entry(902, start, 1)], 0)
        .await
        .unwrap();
    let job = db::get_job(&pool, results[0].job_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.run_at, start - Duration::minutes(1));
}

#[tokio::test]
async fn schedule_creates_one_job_per_entry() {
    let pool = setup_pool().await;
    let start = Utc::now() + Duration::hours(2);
    let entries = vec![
        entry(900, start, 2),
        entry(901, start + Duration::hours(1), 3),
    ];

    let results = scheduler::schedule(&pool, 42, 7, &entries, 15).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success));

    let jobs = scheduler::list(&pool, 42).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].timeslot_id, 900);
    assert_eq!(jobs[1].timeslot_id, 901);
}

#[tokio::test]
async fn sweep_executes_due_job_end_to_end() {
    let pool = setup_pool().await;
    // Start "now": with a 10 minute lead the job became due 600s ago.
    let start = Utc::now();
    let results = scheduler::schedule(&pool, 42, 7, &[entry(900, start, 5)], 10)
        .await
        .unwrap();
    let job_id = results[0].job_id.unwrap();

    let job = db::get_job(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.run_at, start - Duration::seconds(600));

    let executor = RecordingExecutor::with_responses(vec![Ok(CopyOutcome {
        success: true,
        flash_sale_id: Some(77),
        message: "3/5 items attached to flash sale 77".into(),
        failed_items: vec![4, 5],
    })]);
    let executed = scheduler::sweep(&pool, &executor, 10).await.unwrap();
    assert_eq!(executed, 1);

    let job = db::get_job(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.flash_sale_id, Some(77));
    assert!(job.result_message.as_deref().unwrap().contains("3/5"));
    assert_eq!(job.failed_items, vec![4, 5]);

    let calls = executor.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].shop_id, 42);
    assert_eq!(calls[0].timeslot_id, 900);
    assert_eq!(calls[0].item_count, 5);
}

#[tokio::test]
async fn sweep_never_executes_future_jobs() {
    let pool = setup_pool().await;
    let start = Utc::now() + Duration::hours(2);
    let results = scheduler::schedule(&pool, 42, 7, &[entry(900, start, 1)], 10)
        .await
        .unwrap();
    let job_id = results[0].job_id.unwrap();

    let executor = RecordingExecutor::default();
    let executed = scheduler::sweep(&pool, &executor, 10).await.unwrap();
    assert_eq!(executed, 0);
    assert!(executor.calls().await.is_empty());

    let job = db::get_job(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn executor_error_marks_job_failed_and_sweep_continues() {
    let pool = setup_pool().await;
    let start = Utc::now();
    let results = scheduler::schedule(
        &pool,
        42,
        7,
        &[entry(900, start, 1), entry(901, start, 1)],
        10,
    )
    .await
    .unwrap();

    let executor = RecordingExecutor::with_responses(vec![
        Err(anyhow::anyhow!("provider unreachable")),
        Ok(CopyOutcome {
            success: true,
            flash_sale_id: Some(9),
            message: "1/1 items attached to flash sale 9".into(),
            failed_items: Vec::new(),
        }),
    ]);
    let executed = scheduler::sweep(&pool, &executor, 10).await.unwrap();
    assert_eq!(executed, 2);

    let first = db::get_job(&pool, results[0].job_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, JobStatus::Failed);
    assert!(first
        .result_message
        .as_deref()
        .unwrap()
        .contains("provider unreachable"));

    let second = db::get_job(&pool, results[1].job_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.status, JobStatus::Completed);
}

#[tokio::test]
async fn cancel_deletes_pending_and_refuses_running() {
    let pool = setup_pool().await;
    let start = Utc::now() + Duration::hours(2);
    let results = scheduler::schedule(
        &pool,
        42,
        7,
        &[entry(900, start, 1), entry(901, start, 1)],
        10,
    )
    .await
    .unwrap();
    let pending = results[0].job_id.unwrap();
    let running = results[1].job_id.unwrap();
    assert!(db::claim_job(&pool, running).await.unwrap());

    scheduler::cancel(&pool, pending).await.unwrap();
    assert!(db::get_job(&pool, pending).await.unwrap().is_none());

    let err = scheduler::cancel(&pool, running).await.unwrap_err();
    assert!(err.to_string().contains("running"));
    let job = db::get_job(&pool, running).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
}

#[tokio::test]
async fn update_run_at_only_while_pending() {
    let pool = setup_pool().await;
    let start = Utc::now() + Duration::hours(2);
    let results = scheduler::schedule(&pool, 42, 7, &[entry(900, start, 1)], 10)
        .await
        .unwrap();
    let job_id = results[0].job_id.unwrap();
    let new_run_at = start - Duration::minutes(30);

    scheduler::update_run_at(&pool, job_id, new_run_at)
        .await
        .unwrap();
    let job = db::get_job(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.run_at, new_run_at);

    assert!(db::claim_job(&pool, job_id).await.unwrap());
    assert!(scheduler::update_run_at(&pool, job_id, new_run_at)
        .await
        .is_err());
}

#[tokio::test]
async fn force_run_executes_pending_and_refuses_terminal() {
    let pool = setup_pool().await;
    // Not due for two hours; force-run executes it anyway.
    let start = Utc::now() + Duration::hours(2);
    let results = scheduler::schedule(&pool, 42, 7, &[entry(900, start, 1)], 10)
        .await
        .unwrap();
    let job_id = results[0].job_id.unwrap();

    let executor = RecordingExecutor::default();
    let job = scheduler::force_run(&pool, &executor, job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(executor.calls().await.len(), 1);

    let err = scheduler::force_run(&pool, &executor, job_id)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("completed"));
    assert_eq!(executor.calls().await.len(), 1);
}

#[tokio::test]
async fn concurrent_sweeps_execute_a_job_exactly_once() {
    let pool = setup_pool().await;
    let results = scheduler::schedule(&pool, 42, 7, &[entry(900, Utc::now(), 1)], 10)
        .await
        .unwrap();
    let job_id = results[0].job_id.unwrap();

    let executor = RecordingExecutor::default();
    let (a, b) = tokio::join!(
        scheduler::sweep(&pool, &executor, 10),
        scheduler::sweep(&pool, &executor, 10),
    );
    assert_eq!(a.unwrap() + b.unwrap(), 1);
    assert_eq!(executor.calls().await.len(), 1);

    let job = db::get_job(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

// --- action dispatch ------------------------------------------------------

struct FakeAuthorizer;

#[async_trait]
impl ShopAuthorizer for FakeAuthorizer {
    async fn authorize(&self, shop_id: i64, _code: &str) -> anyhow::Result<ShopToken> {
        Ok(ShopToken {
            shop_id,
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Utc::now() + Duration::hours(4),
            credential_id: None,
            updated_at: Utc::now(),
        })
    }
}

#[tokio::test]
async fn dispatch_routes_schedule_and_sweep() {
    let pool = setup_pool().await;
    let executor = RecordingExecutor::default();
    let start = Utc::now();

    let action: Action = serde_json::from_value(json!({
        "action": "schedule",
        "shop_id": 42,
        "source_flash_sale_id": 7,
        "minutes_before": 10,
        "entries": [{
            "timeslot_id": 900,
            "start_time": start.to_rfc3339(),
            "items": [{ "item_id": 1 }]
        }]
    }))
    .unwrap();
    let resp = actions::dispatch(&pool, &executor, &FakeAuthorizer, action).await;
    assert_eq!(resp["success"], true);
    assert_eq!(resp["results"][0]["success"], true);

    let action: Action = serde_json::from_value(json!({ "action": "sweep" })).unwrap();
    let resp = actions::dispatch(&pool, &executor, &FakeAuthorizer, action).await;
    assert_eq!(resp["success"], true);
    assert_eq!(resp["executed"], 1);
}

#[tokio::test]
async fn dispatch_folds_errors_into_structured_responses() {
    let pool = setup_pool().await;
    let executor = RecordingExecutor::default();

    let resp = actions::dispatch(&pool, &executor, &FakeAuthorizer, Action::Cancel { job_id: 404 })
        .await;
    assert_eq!(resp["success"], false);
    assert!(resp["message"].as_str().unwrap().contains("not found"));

    let resp = actions::dispatch(
        &pool,
        &executor,
        &FakeAuthorizer,
        Action::Authorize {
            shop_id: 5,
            code: "abc".into(),
        },
    )
    .await;
    assert_eq!(resp["success"], true);
    assert!(resp["expires_at"].is_string());
}
