mod endpoints;
mod groups;
mod logs;

pub use endpoints::*;
pub use groups::*;
pub use logs::*;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type AdminError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn internal_error(message: impl Into<String>) -> AdminError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub(crate) fn not_found(message: impl Into<String>) -> AdminError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub(crate) fn bad_request(message: impl Into<String>) -> AdminError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}
