//! Signed marketplace API client.
//!
//! All outbound calls go through the [`MarketplaceTransport`] seam so tests
//! can substitute recording fakes. The real transport wraps `reqwest` and,
//! when a proxy base is configured, rewrites every call to
//! `proxy_base?url=<encoded target>` — the signature is always computed over
//! the target path, never the proxy path.

use crate::credentials::CredentialResolver;
use crate::model::{JobItem, PartnerCredential, ShopToken};
use crate::sign::partner_sign;
use crate::token::TokenManager;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, Url};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const CREATE_FLASH_SALE_PATH: &str = "/api/v2/shop_flash_sale/create_shop_flash_sale";
pub const LIST_FLASH_SALE_PATH: &str = "/api/v2/shop_flash_sale/get_shop_flash_sale_list";
pub const ADD_FLASH_SALE_ITEMS_PATH: &str = "/api/v2/shop_flash_sale/add_shop_flash_sale_items";
pub const REFRESH_TOKEN_PATH: &str = "/api/v2/auth/access_token/get";
pub const EXCHANGE_CODE_PATH: &str = "/api/v2/auth/token/get";

#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("shop {0} is not authenticated")]
    ShopNotAuthenticated(i64),
    #[error("authentication rejected after token refresh: {0}")]
    AuthRejected(String),
    #[error("marketplace error {code}: {message}")]
    Api { code: String, message: String },
    #[error("credential resolution failed: {0}")]
    Credential(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid marketplace response: {0}")]
    InvalidResponse(String),
}

/// Business-level error code carried in a response, if any. The provider
/// uses an absent field, `""` or `"-"` to mean "no error"; those idioms are
/// matched literally.
pub fn error_code(resp: &Value) -> Option<&str> {
    match resp.get("error").and_then(Value::as_str) {
        None | Some("") | Some("-") => None,
        Some(code) => Some(code),
    }
}

pub fn error_message(resp: &Value) -> String {
    resp.get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
pub trait MarketplaceTransport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Value, MarketplaceError>;
}

pub struct HttpTransport {
    http: Client,
    proxy_base: Option<Url>,
}

impl HttpTransport {
    pub fn new(timeout_secs: u64, proxy_base: Option<&str>) -> Result<Self, MarketplaceError> {
        let http = Client::builder()
            .user_agent("shopsched/0.1")
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| MarketplaceError::Transport(err.to_string()))?;
        let proxy_base = match proxy_base.map(str::trim).filter(|s| !s.is_empty()) {
            Some(base) => Some(
                Url::parse(base)
                    .map_err(|err| MarketplaceError::Transport(format!("bad proxy base: {err}")))?,
            ),
            None => None,
        };
        Ok(Self { http, proxy_base })
    }

    fn outbound_url(&self, target: &Url) -> Url {
        match &self.proxy_base {
            Some(proxy) => {
                let mut proxied = proxy.clone();
                proxied
                    .query_pairs_mut()
                    .append_pair("url", target.as_str());
                proxied
            }
            None => target.clone(),
        }
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("proxy_base", &self.proxy_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MarketplaceTransport for HttpTransport {
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Value, MarketplaceError> {
        let outbound = self.outbound_url(&url);
        let mut req = self.http.request(method, outbound);
        if let Some(body) = body {
            req = req.json(body);
        }
        let res = req
            .send()
            .await
            .map_err(|err| MarketplaceError::Transport(err.to_string()))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|err| MarketplaceError::Transport(err.to_string()))?;
        match serde_json::from_str::<Value>(&text) {
            Ok(payload) => Ok(payload),
            Err(_) if !status.is_success() => Err(MarketplaceError::Transport(format!(
                "marketplace HTTP {}: {}",
                status, text
            ))),
            Err(err) => Err(MarketplaceError::InvalidResponse(err.to_string())),
        }
    }
}

/// Build the signed request URL: common query parameters plus the digest
/// over the target path at `timestamp`.
pub(crate) fn signed_url(
    api_base: &Url,
    credential: &PartnerCredential,
    path: &str,
    timestamp: i64,
    access_token: Option<&str>,
    shop_id: Option<i64>,
    extra: &[(&str, String)],
) -> Result<Url, MarketplaceError> {
    let sign = partner_sign(
        credential.partner_id,
        &credential.partner_key,
        path,
        timestamp,
        access_token,
        shop_id,
    );
    let mut url = api_base
        .join(path)
        .map_err(|err| MarketplaceError::Transport(format!("bad endpoint path: {err}")))?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("partner_id", &credential.partner_id.to_string());
        q.append_pair("timestamp", &timestamp.to_string());
        if let Some(token) = access_token {
            q.append_pair("access_token", token);
        }
        if let Some(shop) = shop_id {
            q.append_pair("shop_id", &shop.to_string());
        }
        q.append_pair("sign", &sign);
        for (k, v) in extra {
            q.append_pair(k, v);
        }
    }
    Ok(url)
}

/// "Call this marketplace endpoint for this shop": resolves credentials,
/// obtains a usable token, signs, and retries exactly once through a
/// reactive refresh when the provider rejects the token.
pub struct SignedClient {
    transport: Arc<dyn MarketplaceTransport>,
    resolver: CredentialResolver,
    tokens: TokenManager,
    api_base: Url,
    auth_error_codes: Vec<String>,
}

impl SignedClient {
    pub fn new(
        pool: SqlitePool,
        transport: Arc<dyn MarketplaceTransport>,
        cfg: &crate::config::Marketplace,
    ) -> Result<Self, MarketplaceError> {
        let api_base = Url::parse(&cfg.api_base)
            .map_err(|err| MarketplaceError::Transport(format!("bad api base: {err}")))?;
        let default = PartnerCredential {
            id: None,
            partner_id: cfg.partner.partner_id,
            partner_key: cfg.partner.partner_key.clone(),
        };
        let resolver = CredentialResolver::new(pool.clone(), default);
        let tokens = TokenManager::new(
            pool,
            transport.clone(),
            api_base.clone(),
            cfg.token_refresh_buffer_secs,
        );
        Ok(Self {
            transport,
            resolver,
            tokens,
            api_base,
            auth_error_codes: cfg.auth_error_codes.clone(),
        })
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    fn is_auth_error(&self, code: &str) -> bool {
        self.auth_error_codes.iter().any(|c| c == code)
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        credential: &PartnerCredential,
        access_token: &str,
        shop_id: i64,
        body: Option<&Value>,
        extra: &[(&str, String)],
    ) -> Result<Value, MarketplaceError> {
        let url = signed_url(
            &self.api_base,
            credential,
            path,
            Utc::now().timestamp(),
            Some(access_token),
            Some(shop_id),
            extra,
        )?;
        self.transport.send(method, url, body).await
    }

    /// Issue one signed call. Business-level error codes other than the
    /// configured auth-failure codes are NOT interpreted here; the raw
    /// payload is returned for the caller to classify.
    pub async fn call(
        &self,
        shop_id: i64,
        path: &str,
        method: Method,
        body: Option<&Value>,
        extra: &[(&str, String)],
    ) -> Result<Value, MarketplaceError> {
        let credential = self
            .resolver
            .resolve(shop_id, None)
            .await
            .map_err(|err| MarketplaceError::Credential(err.to_string()))?;
        let token = self.tokens.usable_token(&credential, shop_id).await?;

        let resp = self
            .send_signed(
                method.clone(),
                path,
                &credential,
                &token.access_token,
                shop_id,
                body,
                extra,
            )
            .await?;

        let Some(code) = error_code(&resp) else {
            return Ok(resp);
        };
        if !self.is_auth_error(code) {
            return Ok(resp);
        }

        // Reactive refresh: exchange the refresh token and retry the
        // original request exactly once. A second rejection is terminal.
        warn!(shop_id, code, "token rejected; refreshing and retrying once");
        let refreshed = self.tokens.refresh(&credential, shop_id).await?;
        let retry = self
            .send_signed(
                method,
                path,
                &credential,
                &refreshed.access_token,
                shop_id,
                body,
                extra,
            )
            .await?;
        if let Some(code) = error_code(&retry) {
            if self.is_auth_error(code) {
                return Err(MarketplaceError::AuthRejected(format!(
                    "{}: {}",
                    code,
                    error_message(&retry)
                )));
            }
        }
        Ok(retry)
    }

    // --- provider endpoint wrappers --------------------------------------

    pub async fn create_flash_sale(
        &self,
        shop_id: i64,
        timeslot_id: i64,
    ) -> Result<Value, MarketplaceError> {
        self.call(
            shop_id,
            CREATE_FLASH_SALE_PATH,
            Method::POST,
            Some(&json!({ "timeslot_id": timeslot_id })),
            &[],
        )
        .await
    }

    /// List upcoming flash sales (provider type 1), paginated.
    pub async fn list_upcoming_flash_sales(
        &self,
        shop_id: i64,
        offset: u32,
        limit: u32,
    ) -> Result<Value, MarketplaceError> {
        self.call(
            shop_id,
            LIST_FLASH_SALE_PATH,
            Method::GET,
            None,
            &[
                ("type", "1".to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    pub async fn add_flash_sale_items(
        &self,
        shop_id: i64,
        flash_sale_id: i64,
        items: &[JobItem],
    ) -> Result<Value, MarketplaceError> {
        let payload: Vec<Value> = items.iter().map(item_payload).collect();
        self.call(
            shop_id,
            ADD_FLASH_SALE_ITEMS_PATH,
            Method::POST,
            Some(&json!({ "flash_sale_id": flash_sale_id, "items": payload })),
            &[],
        )
        .await
    }

    /// First-time OAuth bootstrap: exchange an authorization code and
    /// create the shop's token row.
    pub async fn authorize_shop(
        &self,
        shop_id: i64,
        code: &str,
    ) -> Result<ShopToken, MarketplaceError> {
        let credential = self
            .resolver
            .resolve(shop_id, None)
            .await
            .map_err(|err| MarketplaceError::Credential(err.to_string()))?;
        debug!(shop_id, "exchanging authorization code");
        self.tokens.exchange_code(&credential, shop_id, code).await
    }
}

fn item_payload(item: &JobItem) -> Value {
    let mut obj = json!({ "item_id": item.item_id });
    if let Some(model_id) = item.model_id {
        let mut model = json!({ "model_id": model_id });
        if let Some(price) = item.promo_price {
            model["input_promo_price"] = json!(price);
        }
        if let Some(stock) = item.stock {
            model["stock"] = json!(stock);
        }
        obj["models"] = json!([model]);
    } else {
        if let Some(price) = item.promo_price {
            obj["input_promo_price"] = json!(price);
        }
        if let Some(stock) = item.stock {
            obj["stock"] = json!(stock);
        }
    }
    obj
}
