//! Per-request partner API signature.
//!
//! The provider verifies an HMAC-SHA256 digest over the concatenation of
//! `partner_id + path + timestamp`, followed by the access token and shop id
//! when present. The field order is part of the wire contract; reordering
//! breaks verification on the remote side.

/// Compute the lowercase hex signature for one request.
///
/// Pure and deterministic: no clock, no I/O. Callers supply the unix
/// timestamp they will also send as the `timestamp` query parameter.
pub fn partner_sign(
    partner_id: i64,
    partner_key: &str,
    path: &str,
    timestamp: i64,
    access_token: Option<&str>,
    shop_id: Option<i64>,
) -> String {
    let mut base = format!("{}{}{}", partner_id, path, timestamp);
    if let Some(token) = access_token {
        base.push_str(token);
    }
    if let Some(shop) = shop_id {
        base.push_str(&shop.to_string());
    }
    let mac = hmac_sha256::HMAC::mac(base.as_bytes(), partner_key.as_bytes());
    hex::encode(mac)
}
