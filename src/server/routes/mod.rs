//! HTTP and WebSocket routes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::Error;

pub mod models;
pub mod status;
pub mod translate;

/// Error body shared by the REST endpoints: `{error, details}`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self.0 {
            Error::InvalidJson(_) | Error::Validation(_) | Error::UnsupportedContentType(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::ConcurrentLoad(_) | Error::ModelBusy => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "details": self.0.details(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError(Error::UnsupportedContentType("image".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(Error::ConcurrentLoad("m".into())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError(Error::ModelBusy).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError(Error::Generation("boom".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
