use axum::http::{HeaderMap, Uri};

use super::error::ApiError;
use crate::auth::{Authenticator, Principal};

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(|t| t.trim().to_string())
}

/// Extract a `?token=` value from the query string.
fn extract_query_token(uri: &Uri) -> Option<String> {
    uri.query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(|v| v.to_string()))
    })
}

/// Resolve the connecting principal at upgrade time.
///
/// The Authorization header wins over the query parameter. No credential at
/// all is 401; a credential that fails verification is 403.
pub(super) fn authenticate(
    authenticator: &dyn Authenticator,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<Principal, ApiError> {
    let credential = extract_bearer(headers)
        .or_else(|| extract_query_token(uri))
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::AuthRequired)?;

    authenticator.verify(&credential).map_err(|e| {
        tracing::warn!(error = %e, "rejected connection credential");
        ApiError::AuthInvalid
    })
}
