use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bridge_protocol::ErrorResponse;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("no active call for endpoint {0}")]
    NotFound(String),

    #[error("SIP signaling failed: {0}")]
    SipFailure(String),

    #[error("WebRTC negotiation failed: {0}")]
    RtcFailure(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            BridgeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Unauthorized => StatusCode::UNAUTHORIZED,
            BridgeError::NotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::SipFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::RtcFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::ResourceExhausted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}
