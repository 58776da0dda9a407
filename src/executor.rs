//! Flash-sale copy execution: create-or-reuse a flash sale for a timeslot
//! and attach the item payload, classifying partial success.
//!
//! The create and add-items steps are deliberately not transactional: a
//! created-but-empty flash sale is a valid intermediate state, and re-runs
//! are safe because creation conflicts resolve to the already-created
//! resource and duplicate items are rejected individually by the provider.

use crate::marketplace::{error_code, error_message, SignedClient};
use crate::model::{CopyOutcome, JobItem};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument};

/// Provider codes meaning "this timeslot already has a flash sale".
const CONFLICT_ERROR_CODES: &[&str] = &["error_exist", "error_flash_sale_exist"];

const LIST_PAGE_SIZE: u32 = 100;
const LIST_MAX_OFFSET: u32 = 1000;

#[async_trait]
pub trait FlashSaleExecutor: Send + Sync {
    async fn execute(
        &self,
        shop_id: i64,
        timeslot_id: i64,
        items: &[JobItem],
    ) -> Result<CopyOutcome>;
}

pub struct CopyExecutor {
    client: SignedClient,
}

impl CopyExecutor {
    pub fn new(client: SignedClient) -> Self {
        Self { client }
    }

    /// Locate an already-created flash sale for the timeslot among the
    /// shop's upcoming flash sales.
    async fn find_existing(&self, shop_id: i64, timeslot_id: i64) -> Result<Option<i64>> {
        let mut offset = 0;
        loop {
            let resp = self
                .client
                .list_upcoming_flash_sales(shop_id, offset, LIST_PAGE_SIZE)
                .await?;
            if let Some(code) = error_code(&resp) {
                anyhow::bail!(
                    "flash sale list failed: {}: {}",
                    code,
                    error_message(&resp)
                );
            }
            let entries = resp["response"]["flash_sale_list"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            for entry in &entries {
                if entry["timeslot_id"].as_i64() == Some(timeslot_id) {
                    return Ok(entry["flash_sale_id"].as_i64());
                }
            }
            if (entries.len() as u32) < LIST_PAGE_SIZE || offset >= LIST_MAX_OFFSET {
                return Ok(None);
            }
            offset += LIST_PAGE_SIZE;
        }
    }
}

#[async_trait]
impl FlashSaleExecutor for CopyExecutor {
    #[instrument(skip(self, items))]
    async fn execute(
        &self,
        shop_id: i64,
        timeslot_id: i64,
        items: &[JobItem],
    ) -> Result<CopyOutcome> {
        let created = self.client.create_flash_sale(shop_id, timeslot_id).await?;

        let (flash_sale_id, reused) = match error_code(&created) {
            None => {
                let id = created["response"]["flash_sale_id"].as_i64().ok_or_else(|| {
                    anyhow::anyhow!("flash sale created but response carried no flash_sale_id")
                })?;
                (id, false)
            }
            Some(code) if CONFLICT_ERROR_CODES.contains(&code) => {
                // Idempotent recovery: a previous attempt (or another
                // actor) already created the flash sale for this timeslot.
                match self.find_existing(shop_id, timeslot_id).await? {
                    Some(id) => {
                        info!(shop_id, timeslot_id, flash_sale_id = id, "reusing existing flash sale");
                        (id, true)
                    }
                    None => {
                        return Ok(CopyOutcome::failure(
                            None,
                            format!(
                                "timeslot {} reported an existing flash sale but none was found in the upcoming list",
                                timeslot_id
                            ),
                        ));
                    }
                }
            }
            Some(code) => {
                return Ok(CopyOutcome::failure(
                    None,
                    format!(
                        "flash sale creation failed: {}: {}",
                        code,
                        error_message(&created)
                    ),
                ));
            }
        };

        let verb = if reused { "reused" } else { "created" };
        let added = match self
            .client
            .add_flash_sale_items(shop_id, flash_sale_id, items)
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                return Ok(CopyOutcome::failure(
                    Some(flash_sale_id),
                    format!(
                        "flash sale {} {} but attaching items failed: {}",
                        flash_sale_id, verb, err
                    ),
                ));
            }
        };
        if let Some(code) = error_code(&added) {
            return Ok(CopyOutcome::failure(
                Some(flash_sale_id),
                format!(
                    "flash sale {} {} but attaching items failed: {}: {}",
                    flash_sale_id,
                    verb,
                    code,
                    error_message(&added)
                ),
            ));
        }

        let failed_items = failed_item_ids(&added);
        let total = items.len();
        let succeeded = total.saturating_sub(failed_items.len());
        let mut message = format!(
            "{}/{} items attached to flash sale {}",
            succeeded, total, flash_sale_id
        );
        if reused {
            message.push_str(" (existing reused)");
        }

        Ok(CopyOutcome {
            success: true,
            flash_sale_id: Some(flash_sale_id),
            message,
            failed_items,
        })
    }
}

fn failed_item_ids(resp: &Value) -> Vec<i64> {
    resp["response"]["failed_items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["item_id"].as_i64())
                .collect()
        })
        .unwrap_or_default()
}
