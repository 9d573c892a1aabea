// src/server/envelope.rs

//! The JSON response envelope and the error-to-HTTP mapping used by both
//! listeners. Handlers return `Result<ApiOk<T>, OpalError>`; everything is
//! wrapped as `{success, data}` or `{success:false, error, code}`.

use crate::core::OpalError;
use crate::core::cluster::wire::Envelope;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// A successful handler result, serialized as `{success: true, data: ...}`.
pub struct ApiOk<T>(pub T);

impl<T: Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        Json(Envelope::ok(self.0)).into_response()
    }
}

impl IntoResponse for OpalError {
    fn into_response(self) -> Response {
        let code = self.http_status();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(self.to_string()),
            code: Some(code),
        };
        (status, Json(body)).into_response()
    }
}
