//! Request signing for Binance signed endpoints.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::{BotError, BotResult};

type HmacSha256 = Hmac<Sha256>;

/// Sign a query string with HMAC-SHA256. Returns the hex-encoded signature.
pub fn sign_query(query: &str, secret: &str) -> BotResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BotError::Config(format!("HMAC key error: {e}")))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Join key/value pairs into a URL query string, percent-encoding values.
pub fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
