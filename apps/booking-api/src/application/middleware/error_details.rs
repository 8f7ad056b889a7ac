use axum::{
    Json,
    body::to_bytes,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::warn;

use crate::AppState;
use crate::application::ErrorDetail;

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Development aid: copies the internal error text into the envelope as
/// `detail` when `EXPOSE_ERROR_DETAILS` is enabled.
pub async fn expose_error_details(
    State(app_state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let response = next.run(req).await;
    if !app_state.settings.expose_error_details {
        return response;
    }
    let Some(ErrorDetail(detail)) = response.extensions().get::<ErrorDetail>().cloned() else {
        return response;
    };

    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_ERROR_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Could not buffer error body: {}", e);
            return parts.status.into_response();
        }
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(mut body)) => {
            body.insert("detail".into(), Value::String(detail));
            (parts.status, Json(Value::Object(body))).into_response()
        }
        _ => Response::from_parts(parts, bytes.into()),
    }
}
