use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// HTTP-level rejections. Everything after the WebSocket upgrade is reported
/// in-band as `cc:error` instead.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No credential presented.
    AuthRequired,
    /// 403 - Credential presented but rejected.
    AuthInvalid,
    /// 503 - Connection cap reached.
    TooManyConnections,
    /// 503 - The bridge coordinator has stopped.
    BridgeUnavailable,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::TooManyConnections => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BridgeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::TooManyConnections => "too_many_connections",
            ApiError::BridgeUnavailable => "bridge_unavailable",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via Authorization header or ?token= query parameter.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::TooManyConnections => {
                "Too many connections. Try again shortly.".to_string()
            }
            ApiError::BridgeUnavailable => "Session bridge is unavailable.".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
