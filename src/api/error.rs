use axum::{
    extract::rejection::JsonRejection,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Serializer, json, ser::PrettyFormatter};
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<PrettyJson<T>, AppError>;

/// A JSON response body indented with 4 spaces, matching this service's wire format.
pub struct PrettyJson<T>(pub T);

impl<T: Serialize> IntoResponse for PrettyJson<T> {
    fn into_response(self) -> Response {
        let mut buf = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = Serializer::with_formatter(&mut buf, formatter);
        match self.0.serialize(&mut serializer) {
            Ok(()) => (
                [(header::CONTENT_TYPE, "application/json")],
                buf,
            )
                .into_response(),
            Err(err) => {
                error!("failed to serialize response body: {err}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("request body failed validation")]
    Validation(garde::Report),
    #[error("request body was not valid JSON: {0}")]
    Json(JsonRejection),
    #[error("request body exceeds the configured size limit")]
    PayloadTooLarge,
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
}

impl From<JsonRejection> for AppError {
    fn from(err: JsonRejection) -> Self {
        AppError::Json(err)
    }
}

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        AppError::Validation(report)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Validation(report) => {
                let fields: Vec<String> = report.iter().map(|(path, _)| path.to_string()).collect();
                let message = report
                    .iter()
                    .map(|(path, err)| format!("{path}: {err}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                (
                    StatusCode::BAD_REQUEST,
                    PrettyJson(json!({ "error": message, "fields": fields })),
                )
                    .into_response()
            }
            AppError::Json(err) => (
                StatusCode::BAD_REQUEST,
                PrettyJson(json!({ "error": err.to_string(), "fields": [] })),
            )
                .into_response(),
            AppError::PayloadTooLarge => (
                StatusCode::BAD_REQUEST,
                PrettyJson(json!({ "error": "request body exceeds the configured size limit", "fields": [] })),
            )
                .into_response(),
            AppError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
            }
            AppError::NotFound => {
                error!("request for unknown resource");
                (StatusCode::NOT_FOUND, "Not found").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn pretty_json_indents_with_four_spaces() {
        let response = PrettyJson(json!({ "a": { "b": 1 } })).into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("{\n    \"a\": {\n        \"b\": 1\n    }\n}"));
    }
}
