use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

/// Errors that can be answered over HTTP.
pub trait Error: std::error::Error {
    fn status_code(&self) -> StatusCode;
}

/// Renders an [`Error`] as `{"error": {"message": ..., "causes": [...]}}` with its status code.
pub struct JsonResponse<E> {
    error: E,
}

impl<E> From<E> for JsonResponse<E> {
    fn from(error: E) -> Self {
        Self { error }
    }
}

impl<E: Error + 'static> IntoResponse for JsonResponse<E> {
    fn into_response(self) -> axum::response::Response {
        let status = self.error.status_code();
        if status.is_server_error() {
            tracing::error!(
                error = &self.error as &dyn std::error::Error,
                "request failed"
            );
        } else {
            tracing::warn!(
                error = &self.error as &dyn std::error::Error,
                "request rejected"
            );
        }
        (
            status,
            Json(Container {
                error: Payload {
                    message: self.error.to_string(),
                    causes: std::iter::successors(self.error.source(), |err| err.source())
                        .map(|err| err.to_string())
                        .collect(),
                },
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Container {
    error: Payload,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    message: String,
    causes: Vec<String>,
}
