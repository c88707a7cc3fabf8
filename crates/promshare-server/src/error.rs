use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use promshare_common::error::PromshareError;
use serde::Serialize;

pub struct ApiError(pub PromshareError);

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            PromshareError::MetricNotFound(_) => StatusCode::NOT_FOUND,
            PromshareError::DescriptorConflict(_) => StatusCode::CONFLICT,
            PromshareError::LabelMismatch { .. } | PromshareError::InvalidArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            PromshareError::StorageUnavailable(_)
            | PromshareError::AggregationContention { .. }
            | PromshareError::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
            PromshareError::CorruptRecord { .. } | PromshareError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorBody {
            code: self.0.error_code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<PromshareError> for ApiError {
    fn from(err: PromshareError) -> Self {
        ApiError(err)
    }
}
