use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use medflow_core::pipeline::ErrorBody;
use medflow_core::{CoreError, ErrorCode};

/// HTTP status for an error code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::ConcurrentModification
        | ErrorCode::SessionClosed
        | ErrorCode::IntegrityBlocked => StatusCode::CONFLICT,
        ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::PipelineDegraded | ErrorCode::PipelineFailed => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// A core error on its way out as an [`ErrorBody`].
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody::from(&self.0);
        let status = status_for(body.code);
        if status.is_server_error() {
            tracing::error!(code = %body.code, error = %self.0, "request failed");
        } else {
            tracing::warn!(code = %body.code, error = %self.0, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_and_client_errors_map_to_4xx() {
        assert_eq!(
            status_for(ErrorCode::ConcurrentModification),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(ErrorCode::SessionClosed), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::IntegrityBlocked), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::InvalidInput), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
        assert!(status_for(ErrorCode::PipelineFailed).is_server_error());
    }
}
