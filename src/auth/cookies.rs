//! Refresh-token cookie handling.

use std::time::Duration;

use axum::http::{
    header::{InvalidHeaderValue, COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue,
};
use tracing::error;

pub const REFRESH_COOKIE_NAME: &str = "refreshToken";

/// Build the `HttpOnly`, `SameSite=Strict` cookie carrying the refresh token.
pub fn refresh_cookie(
    token: &str,
    max_age: Duration,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{REFRESH_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub fn clear_refresh_cookie(secure: bool) -> HeaderValue {
    if secure {
        HeaderValue::from_static("refreshToken=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0; Secure")
    } else {
        HeaderValue::from_static("refreshToken=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0")
    }
}

/// Headers that expire the refresh cookie on the client.
pub fn clearing_headers(secure: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, clear_refresh_cookie(secure));
    headers
}

/// Headers that install a new refresh cookie. A token that cannot be encoded
/// as a header is an internal error.
pub fn setting_headers(token: &str, max_age: Duration, secure: bool) -> anyhow::Result<HeaderMap> {
    let value = refresh_cookie(token, max_age, secure).map_err(|e| {
        error!(error = %e, "refresh cookie is not a valid header value");
        anyhow::anyhow!("invalid refresh cookie")
    })?;
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, value);
    Ok(headers)
}

/// Read the refresh token from the request's `Cookie` headers.
pub fn extract_refresh_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (key, val) = pair.trim().split_once('=')?;
            (key.trim() == REFRESH_COOKIE_NAME).then(|| val.trim().to_string())
        })
        .find(|val| !val.is_empty())
}
