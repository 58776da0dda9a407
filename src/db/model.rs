use crate::model::JobItem;
use chrono::{DateTime, Utc};

/// Stored partner credential row, including the active flag the resolver
/// checks before using it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRow {
    pub id: i64,
    pub partner_id: i64,
    pub partner_key: String,
    pub is_active: bool,
}

/// Insert payload for one scheduled copy job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub shop_id: i64,
    pub source_flash_sale_id: i64,
    pub timeslot_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub run_at: DateTime<Utc>,
    pub items: Vec<JobItem>,
}
