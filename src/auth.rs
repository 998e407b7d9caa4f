//! HTTP Basic authentication against the live credential table.

use axum::http::{HeaderMap, header};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use tracing::debug;

use crate::config::LOGOUT_QUERY;
use crate::error::ApiError;
use crate::settings::{Settings, SettingsStore};

/// Checks the `Authorization` header against a freshly loaded settings file.
///
/// The settings snapshot is returned on success so the caller renders with the
/// same view of the configuration that authorized the request.
pub async fn require_auth(headers: &HeaderMap, store: &SettingsStore) -> Result<Settings, ApiError> {
    let Some(raw) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        debug!("rejecting request, no usable Authorization header");
        return Err(ApiError::Unauthorized);
    };
    let Some((username, password)) = parse_basic(raw) else {
        debug!("rejecting request, malformed Basic credentials");
        return Err(ApiError::Unauthorized);
    };

    let settings = store.load().await?;
    if settings.has_credentials(&username, &password) {
        Ok(settings)
    } else {
        debug!(username, "rejecting request, credentials do not match");
        Err(ApiError::Unauthorized)
    }
}

/// Decodes `Basic <base64(user:pass)>`. Anything else yields `None`.
pub fn parse_basic(raw: &str) -> Option<(String, String)> {
    let encoded = raw.strip_prefix("Basic ")?.trim();
    let decoded = BASE64_STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let mut parts = decoded.split(':');
    let username = parts.next()?;
    let password = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}

/// True when the query string carries `logout=401`.
pub fn logout_requested(query: Option<&str>) -> bool {
    query.is_some_and(|query| query.split('&').any(|pair| pair == LOGOUT_QUERY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tempfile::tempdir;

    fn basic(credentials: &str) -> String {
        format!("Basic {}", BASE64_STANDARD.encode(credentials))
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(value).expect("header value"),
        );
        headers
    }

    #[test]
    fn parse_basic_accepts_well_formed_header() {
        assert_eq!(
            parse_basic(&basic("admin:password")),
            Some(("admin".to_string(), "password".to_string()))
        );
    }

    #[test]
    fn parse_basic_rejects_malformed_headers() {
        assert_eq!(parse_basic("Bearer abc"), None);
        assert_eq!(parse_basic("basic YWRtaW46cGFzc3dvcmQ="), None);
        assert_eq!(parse_basic("Basic !!!not-base64!!!"), None);
        assert_eq!(parse_basic(&basic("no-colon")), None);
        assert_eq!(parse_basic(&basic("a:b:c")), None);
        let invalid_utf8 = format!("Basic {}", BASE64_STANDARD.encode([0xff, 0xfe, b':', b'x']));
        assert_eq!(parse_basic(&invalid_utf8), None);
    }

    #[test]
    fn logout_query_detection() {
        assert!(logout_requested(Some("logout=401")));
        assert!(logout_requested(Some("a=1&logout=401")));
        assert!(!logout_requested(Some("logout=400")));
        assert!(!logout_requested(None));
    }

    #[tokio::test]
    async fn require_auth_checks_live_table() {
        let temp = tempdir().expect("tempdir");
        let store = SettingsStore::new(temp.path().join("config.json"));

        let settings = require_auth(&headers_with(&basic("admin:password")), &store)
            .await
            .expect("default admin accepted");
        assert!(settings.show_notification);

        for credentials in ["admin:wrong", "root:password", "ADMIN:password"] {
            let result = require_auth(&headers_with(&basic(credentials)), &store).await;
            assert!(matches!(result, Err(ApiError::Unauthorized)), "{credentials}");
        }

        let missing = require_auth(&HeaderMap::new(), &store).await;
        assert!(matches!(missing, Err(ApiError::Unauthorized)));
    }

    #[tokio::test]
    async fn require_auth_sees_rotated_credentials() {
        let temp = tempdir().expect("tempdir");
        let store = SettingsStore::new(temp.path().join("config.json"));
        store.load().await.expect("seed config");

        let mut settings = store.load().await.expect("load");
        settings.users.clear();
        settings.users.insert("bob".into(), "hunter2".into());
        store.save(&settings).await.expect("save");

        let old = require_auth(&headers_with(&basic("admin:password")), &store).await;
        assert!(matches!(old, Err(ApiError::Unauthorized)));
        require_auth(&headers_with(&basic("bob:hunter2")), &store)
            .await
            .expect("rotated credentials accepted");
    }
}
