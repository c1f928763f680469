use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

/// Success envelope: `{ success, data, message }`.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub message: String,
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

pub fn success<T: Serialize>(data: T, message: impl Into<String>) -> ApiResponse<T> {
    ApiResponse {
        success: true,
        data: Some(data),
        message: message.into(),
    }
}

pub fn empty_success(message: impl Into<String>) -> ApiResponse<()> {
    ApiResponse {
        success: true,
        data: None,
        message: message.into(),
    }
}

/// Error envelope: `{ success: false, error: { code, message, details } }`.
#[derive(Serialize)]
struct ApiErrorEnvelope {
    success: bool,
    error: ApiErrorBody,
}

#[derive(Serialize)]
struct ApiErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

pub fn error(
    code: &str,
    message: impl Into<String>,
    details: Option<Value>,
    status: StatusCode,
) -> Response {
    let body = ApiErrorEnvelope {
        success: false,
        error: ApiErrorBody {
            code: code.to_string(),
            message: message.into(),
            details,
        },
    };

    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let body = serde_json::to_value(success(vec![1, 2], "ok")).expect("serializes");
        assert_eq!(body["success"], true);
        assert_eq!(body["data"][0], 1);
        assert_eq!(body["message"], "ok");
    }

    #[test]
    fn test_empty_success_omits_data() {
        let body = serde_json::to_value(empty_success("done")).expect("serializes");
        assert_eq!(body["success"], true);
        assert!(body.get("data").is_none());
    }
}
