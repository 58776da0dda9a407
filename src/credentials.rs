//! Which partner identity signs requests for a shop.
//!
//! Resolution order: an explicit credential reference, then the credential
//! linked through the shop's token row, then the process-wide default
//! injected from configuration at construction. A missing or inactive
//! reference never fails resolution; it degrades to the next step.

use crate::db;
use crate::model::PartnerCredential;
use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{debug, warn};

pub struct CredentialResolver {
    pool: SqlitePool,
    default: PartnerCredential,
}

impl CredentialResolver {
    pub fn new(pool: SqlitePool, default: PartnerCredential) -> Self {
        Self { pool, default }
    }

    pub fn default_credential(&self) -> &PartnerCredential {
        &self.default
    }

    pub async fn resolve(
        &self,
        shop_id: i64,
        explicit_credential_id: Option<i64>,
    ) -> Result<PartnerCredential> {
        if let Some(id) = explicit_credential_id {
            match db::get_credential(&self.pool, id).await? {
                Some(row) if row.is_active => {
                    debug!(shop_id, credential_id = id, "using explicit credential");
                    return Ok(PartnerCredential {
                        id: Some(row.id),
                        partner_id: row.partner_id,
                        partner_key: row.partner_key,
                    });
                }
                Some(_) => warn!(shop_id, credential_id = id, "explicit credential inactive"),
                None => warn!(shop_id, credential_id = id, "explicit credential not found"),
            }
        }

        if let Some(row) = db::shop_linked_credential(&self.pool, shop_id).await? {
            if row.is_active {
                debug!(shop_id, credential_id = row.id, "using shop-linked credential");
                return Ok(PartnerCredential {
                    id: Some(row.id),
                    partner_id: row.partner_id,
                    partner_key: row.partner_key,
                });
            }
        }

        debug!(shop_id, "using default partner credential");
        Ok(self.default.clone())
    }
}
