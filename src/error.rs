//! Error types for the prediction API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Required request keys absent; the message lists exactly the
    /// missing keys, comma-separated, in canonical order.
    #[error("Missing keys: {0}")]
    MissingKeys(String),

    #[error("Invalid value for {key}: {detail}")]
    BadValue { key: String, detail: String },

    #[error("Inference error: {0}")]
    Inference(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingKeys(_) | ApiError::BadValue { .. } => StatusCode::BAD_REQUEST,
            ApiError::Inference(msg) => {
                tracing::error!(detail = %msg, "inference failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        let r = ApiError::MissingKeys("temperature".into()).into_response();
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);

        let r = ApiError::BadValue {
            key: "sector_time".into(),
            detail: "not a number".into(),
        }
        .into_response();
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);

        let r = ApiError::Inference("shape mismatch".into()).into_response();
        assert_eq!(r.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn missing_keys_message_preserves_wire_contract() {
        let e = ApiError::MissingKeys("rain_probability, sector_time".into());
        assert_eq!(e.to_string(), "Missing keys: rain_probability, sector_time");
    }
}
