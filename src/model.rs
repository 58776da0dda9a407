use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Partner identity/secret pair used to sign marketplace requests.
/// `id` is None for the config-supplied default, which has no stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerCredential {
    pub id: Option<i64>,
    pub partner_id: i64,
    pub partner_key: String,
}

/// One OAuth grant per shop. Overwritten in place on every refresh.
#[derive(Debug, Clone)]
pub struct ShopToken {
    pub shop_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub credential_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Item/model/price override carried in a copy job's payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobItem {
    pub item_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promo_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub shop_id: i64,
    pub source_flash_sale_id: i64,
    pub timeslot_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub run_at: DateTime<Utc>,
    pub items: Vec<JobItem>,
    pub status: JobStatus,
    pub flash_sale_id: Option<i64>,
    pub result_message: Option<String>,
    pub failed_items: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one flash-sale copy attempt. Partial item failure is a valid
/// outcome, not an error; `failed_items` lists the rejected item ids.
#[derive(Debug, Clone, Serialize)]
pub struct CopyOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_sale_id: Option<i64>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_items: Vec<i64>,
}

impl CopyOutcome {
    pub fn failure(flash_sale_id: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            flash_sale_id,
            message: message.into(),
            failed_items: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse_status(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse_status("cancelled"), None);
    }

    #[test]
    fn job_item_optional_fields_omitted() {
        let item = JobItem {
            item_id: 7,
            model_id: None,
            promo_price: None,
            stock: None,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json, serde_json::json!({ "item_id": 7 }));
    }
}
