//! HTTP handlers for the receiving endpoint

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::state::AppState;
use crate::callbacks::ProcessResult;
use crate::fanout::{gunzip, GZIP_ENCODING};
use crate::protocol::CallbackEnvelope;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

/// Error type for API responses
pub enum ApiError {
    /// Malformed callback
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(e) => {
                error!(error = %e, "Callback processing failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        ApiError::Internal(err.into())
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn decode_envelope(headers: &HeaderMap, body: &[u8]) -> Result<CallbackEnvelope, ApiError> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase());

    let decoded;
    let body = match encoding.as_deref() {
        None | Some("identity") => body,
        Some(GZIP_ENCODING) => {
            decoded = gunzip(body).map_err(|e| ApiError::BadRequest(format!("invalid gzip body: {}", e)))?;
            decoded.as_slice()
        }
        Some(other) => return Err(ApiError::BadRequest(format!("unsupported content encoding {}", other))),
    };

    let envelope: CallbackEnvelope =
        serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid callback: {}", e)))?;
    envelope.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(envelope)
}

/// POST /callbacks/:peer_id/:subscription_id - Receive a subscription callback
pub async fn receive_callback(
    State(state): State<Arc<AppState>>,
    Path((peer_id, subscription_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let envelope = decode_envelope(&headers, &body)?;
    if envelope.subscription_id != subscription_id || envelope.id != peer_id {
        return Err(ApiError::BadRequest(
            "callback does not belong to this subscription".to_string(),
        ));
    }

    let sequence = envelope.sequence;
    let callback_type = envelope.kind();
    let scope = envelope.scope();
    let payload = serde_json::to_value(&envelope)?;
    let result = state
        .processor
        .process_callback(&peer_id, &subscription_id, sequence, payload, callback_type, state.handler.as_ref())
        .await?;

    debug!(peer_id = %peer_id, subscription_id = %subscription_id, sequence, result = result.as_str(), "Callback received");

    let response = match result {
        ProcessResult::Processed | ProcessResult::Duplicate | ProcessResult::Pending => {
            StatusCode::NO_CONTENT.into_response()
        }
        ProcessResult::ResyncTriggered => {
            if let Err(e) = state.handler.resync_required(&peer_id, &subscription_id, &scope).await {
                warn!(peer_id = %peer_id, subscription_id = %subscription_id, error = %e, "Could not read scope again after sequence reset");
            }
            (StatusCode::OK, Json(StatusResponse { status: "resync_required" })).into_response()
        }
        ProcessResult::Rejected => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, state.retry_after.as_secs().max(1).to_string())],
            Json(ErrorResponse { error: "callback rejected, retry later".to_string() }),
        )
            .into_response(),
    };
    Ok(response)
}

/// GET /meta/subcast/supported - Comma-separated capability tags
pub async fn supported_options(State(state): State<Arc<AppState>>) -> String {
    state.supported_options.clone()
}

/// GET /meta/subcast/version - Protocol version
pub async fn protocol_version(State(state): State<Arc<AppState>>) -> String {
    state.protocol_version.clone()
}
