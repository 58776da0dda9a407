//! Typed action surface exposed to the dashboard.
//!
//! The dashboard speaks simple JSON action dispatch; here that boundary is
//! a closed enum routed to the typed operations, so each operation stays
//! independently testable and the string-to-operation mapping lives in one
//! place. Every response is `{"success": ..}` shaped — callers never see a
//! raw error.

use crate::executor::FlashSaleExecutor;
use crate::model::ShopToken;
use crate::scheduler::{self, ScheduleEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;

/// OAuth bootstrap seam, implemented by the signed client and by test
/// fakes.
#[async_trait]
pub trait ShopAuthorizer: Send + Sync {
    async fn authorize(&self, shop_id: i64, code: &str) -> anyhow::Result<ShopToken>;
}

#[async_trait]
impl ShopAuthorizer for crate::marketplace::SignedClient {
    async fn authorize(&self, shop_id: i64, code: &str) -> anyhow::Result<ShopToken> {
        Ok(self.authorize_shop(shop_id, code).await?)
    }
}

fn default_sweep_limit() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Schedule {
        shop_id: i64,
        source_flash_sale_id: i64,
        entries: Vec<ScheduleEntry>,
        minutes_before: i64,
    },
    List {
        shop_id: i64,
    },
    Cancel {
        job_id: i64,
    },
    Update {
        job_id: i64,
        run_at: DateTime<Utc>,
    },
    ForceRun {
        job_id: i64,
    },
    Sweep {
        #[serde(default = "default_sweep_limit")]
        limit: u32,
    },
    Authorize {
        shop_id: i64,
        code: String,
    },
}

fn failure(message: impl std::fmt::Display) -> Value {
    json!({ "success": false, "message": message.to_string() })
}

/// Route one action to its operation and fold any error into a structured
/// response.
pub async fn dispatch(
    pool: &SqlitePool,
    executor: &dyn FlashSaleExecutor,
    authorizer: &dyn ShopAuthorizer,
    action: Action,
) -> Value {
    match action {
        Action::Schedule {
            shop_id,
            source_flash_sale_id,
            entries,
            minutes_before,
        } => {
            match scheduler::schedule(pool, shop_id, source_flash_sale_id, &entries, minutes_before)
                .await
            {
                Ok(results) => json!({ "success": true, "results": results }),
                Err(err) => failure(err),
            }
        }
        Action::List { shop_id } => match scheduler::list(pool, shop_id).await {
            Ok(jobs) => json!({ "success": true, "jobs": jobs }),
            Err(err) => failure(err),
        },
        Action::Cancel { job_id } => match scheduler::cancel(pool, job_id).await {
            Ok(()) => json!({ "success": true }),
            Err(err) => failure(err),
        },
        Action::Update { job_id, run_at } => {
            match scheduler::update_run_at(pool, job_id, run_at).await {
                Ok(()) => json!({ "success": true }),
                Err(err) => failure(err),
            }
        }
        Action::ForceRun { job_id } => match scheduler::force_run(pool, executor, job_id).await {
            Ok(job) => json!({
                "success": true,
                "status": job.status,
                "flash_sale_id": job.flash_sale_id,
                "message": job.result_message,
                "failed_items": job.failed_items,
            }),
            Err(err) => failure(err),
        },
        Action::Sweep { limit } => match scheduler::sweep(pool, executor, limit).await {
            Ok(executed) => json!({ "success": true, "executed": executed }),
            Err(err) => failure(err),
        },
        Action::Authorize { shop_id, code } => match authorizer.authorize(shop_id, &code).await {
            Ok(token) => json!({ "success": true, "expires_at": token.expires_at }),
            Err(err) => failure(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_parse_from_tagged_json() {
        let action: Action = serde_json::from_value(json!({
            "action": "schedule",
            "shop_id": 42,
            "source_flash_sale_id": 7,
            "minutes_before": 10,
            "entries": [{
                "timeslot_id": 900,
                "start_time": "2026-09-01T12:00:00Z",
                "items": [{ "item_id": 1 }]
            }]
        }))
        .unwrap();
        match action {
            Action::Schedule {
                shop_id, entries, ..
            } => {
                assert_eq!(shop_id, 42);
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].items[0].item_id, 1);
            }
            _ => panic!("wrong variant"),
        }

        let action: Action =
            serde_json::from_value(json!({ "action": "sweep" })).unwrap();
        match action {
            Action::Sweep { limit } => assert_eq!(limit, 10),
            _ => panic!("wrong variant"),
        }

        let action: Action =
            serde_json::from_value(json!({ "action": "force_run", "job_id": 3 })).unwrap();
        assert!(matches!(action, Action::ForceRun { job_id: 3 }));

        assert!(serde_json::from_value::<Action>(json!({ "action": "drop_tables" })).is_err());
    }
}
