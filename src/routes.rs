//! Request routing: uploads by route, everything else by path shape.

use axum::body::Body as AxumBody;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use axum::routing::post;
use axum::{Router, middleware};
use percent_encoding::percent_decode_str;
use std::sync::Arc;

use crate::auth::{logout_requested, require_auth};
use crate::config::UPLOAD_ROUTE;
use crate::error::ApiError;
use crate::files::serve_file;
use crate::http::add_security_headers;
use crate::listing::list_directory;
use crate::sandbox::Sandbox;
use crate::settings::SettingsStore;
use crate::upload::upload_file;

/// Upload route, the GET/HEAD fallback, security headers and shared state.
pub fn build_router(sandbox: Arc<Sandbox>, store: Arc<SettingsStore>) -> Router {
    Router::new()
        .route(
            UPLOAD_ROUTE,
            post(upload_file).layer(DefaultBodyLimit::disable()),
        )
        .fallback(dispatch)
        .layer(middleware::from_fn(add_security_headers))
        .layer(Extension(sandbox))
        .layer(Extension(store))
}

/// Paths ending in `/` are listed, anything else is served as a file.
/// Both require Basic auth, and `logout=401` always answers 401. HEAD gets
/// the GET headers with an empty body.
async fn dispatch(
    Extension(sandbox): Extension<Arc<Sandbox>>,
    Extension(store): Extension<Arc<SettingsStore>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if method != Method::GET && method != Method::HEAD {
        return Err(ApiError::MethodNotAllowed);
    }
    if logout_requested(uri.query()) {
        return Err(ApiError::Unauthorized);
    }
    let settings = require_auth(&headers, &store).await?;

    let local_path = percent_decode_str(uri.path())
        .decode_utf8()
        .map_err(|_| ApiError::NotFound)?;
    let include_body = method != Method::HEAD;
    if local_path.ends_with('/') {
        let response = list_directory(&sandbox, &local_path, &settings, store.path()).await?;
        if include_body {
            return Ok(response);
        }
        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, AxumBody::empty()))
    } else {
        serve_file(&sandbox, &local_path, &headers, include_body).await
    }
}
