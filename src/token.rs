//! Token lifecycle: keep a shop's short-lived access token usable across
//! arbitrarily long gaps between calls.
//!
//! Proactive refresh ahead of expiry is best effort; when it fails the
//! stored token is returned unchanged and the signed client's reactive
//! refresh is the safety net. Concurrent refreshes for one shop are
//! resolved last-write-wins by the token store.

use crate::db;
use crate::marketplace::{
    error_code, error_message, signed_url, MarketplaceError, MarketplaceTransport,
    EXCHANGE_CODE_PATH, REFRESH_TOKEN_PATH,
};
use crate::model::{PartnerCredential, ShopToken};
use chrono::{Duration, Utc};
use reqwest::{Method, Url};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TokenManager {
    pool: SqlitePool,
    transport: Arc<dyn MarketplaceTransport>,
    api_base: Url,
    refresh_buffer_secs: i64,
}

impl TokenManager {
    pub fn new(
        pool: SqlitePool,
        transport: Arc<dyn MarketplaceTransport>,
        api_base: Url,
        refresh_buffer_secs: i64,
    ) -> Self {
        Self {
            pool,
            transport,
            api_base,
            refresh_buffer_secs,
        }
    }

    /// Return a token expected to be accepted by the provider. A shop with
    /// no stored token cannot recover here; that is a terminal error.
    pub async fn usable_token(
        &self,
        credential: &PartnerCredential,
        shop_id: i64,
    ) -> Result<ShopToken, MarketplaceError> {
        let stored = db::get_shop_token(&self.pool, shop_id)
            .await
            .map_err(|err| MarketplaceError::Storage(err.to_string()))?
            .ok_or(MarketplaceError::ShopNotAuthenticated(shop_id))?;

        let refresh_at = stored.expires_at - Duration::seconds(self.refresh_buffer_secs);
        if Utc::now() < refresh_at {
            return Ok(stored);
        }

        match self.refresh(credential, shop_id).await {
            Ok(token) => Ok(token),
            Err(err) => {
                // Best effort only; the stored token may still be accepted,
                // and the reactive path covers the case where it is not.
                warn!(shop_id, %err, "proactive token refresh failed; using stored token");
                Ok(stored)
            }
        }
    }

    /// Exchange the stored refresh token for a new pair and persist it.
    pub async fn refresh(
        &self,
        credential: &PartnerCredential,
        shop_id: i64,
    ) -> Result<ShopToken, MarketplaceError> {
        let stored = db::get_shop_token(&self.pool, shop_id)
            .await
            .map_err(|err| MarketplaceError::Storage(err.to_string()))?
            .ok_or(MarketplaceError::ShopNotAuthenticated(shop_id))?;

        let body = json!({
            "partner_id": credential.partner_id,
            "shop_id": shop_id,
            "refresh_token": stored.refresh_token,
        });
        self.request_token(credential, shop_id, REFRESH_TOKEN_PATH, &body)
            .await
    }

    /// First-time OAuth exchange: trade an authorization code for the
    /// shop's initial token pair.
    pub async fn exchange_code(
        &self,
        credential: &PartnerCredential,
        shop_id: i64,
        code: &str,
    ) -> Result<ShopToken, MarketplaceError> {
        let body = json!({
            "partner_id": credential.partner_id,
            "shop_id": shop_id,
            "code": code,
        });
        self.request_token(credential, shop_id, EXCHANGE_CODE_PATH, &body)
            .await
    }

    /// Token endpoints are partner-level: signed without an access token or
    /// shop id in the digest.
    async fn request_token(
        &self,
        credential: &PartnerCredential,
        shop_id: i64,
        path: &str,
        body: &Value,
    ) -> Result<ShopToken, MarketplaceError> {
        let url = signed_url(
            &self.api_base,
            credential,
            path,
            Utc::now().timestamp(),
            None,
            None,
            &[],
        )?;
        let resp = self.transport.send(Method::POST, url, Some(body)).await?;

        if let Some(code) = error_code(&resp) {
            return Err(MarketplaceError::Api {
                code: code.to_string(),
                message: error_message(&resp),
            });
        }

        let access_token = resp
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| MarketplaceError::InvalidResponse("missing access_token".into()))?;
        let refresh_token = resp
            .get("refresh_token")
            .and_then(Value::as_str)
            .ok_or_else(|| MarketplaceError::InvalidResponse("missing refresh_token".into()))?;
        let expire_in = resp
            .get("expire_in")
            .and_then(Value::as_i64)
            .ok_or_else(|| MarketplaceError::InvalidResponse("missing expire_in".into()))?;

        let expires_at = Utc::now() + Duration::seconds(expire_in);
        db::upsert_shop_token(
            &self.pool,
            shop_id,
            access_token,
            refresh_token,
            expires_at,
            credential.id,
        )
        .await
        .map_err(|err| MarketplaceError::Storage(err.to_string()))?;

        debug!(
            shop_id,
            token_len = access_token.len(),
            %expires_at,
            "persisted new token pair"
        );

        Ok(ShopToken {
            shop_id,
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at,
            credential_id: credential.id,
            updated_at: Utc::now(),
        })
    }
}
