use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pulse_bus::BusError;
use pulse_cache::CacheError;
use pulse_db::DbError;
use pulse_util_error::{BoxedError, FmtCompact as _};
use serde::Serialize;
use snafu::Snafu;
use tracing::{error, info};

use crate::routes::AppJson;
use crate::LOG_TARGET;

/// Request-level errors, mapped onto the HTTP surface as
/// `{detail, type}` bodies.
#[derive(Debug, Snafu)]
pub enum ApiError {
    #[snafu(display("{msg}"))]
    #[snafu(visibility(pub(crate)))]
    InvalidArgument { msg: String },
    #[snafu(display("{msg}"))]
    #[snafu(visibility(pub(crate)))]
    NotFound { msg: String },
    #[snafu(display("{msg}"))]
    #[snafu(visibility(pub(crate)))]
    Unauthorized { msg: String },
    #[snafu(display("{msg}"))]
    #[snafu(visibility(pub(crate)))]
    Conflict { msg: String },
    #[snafu(display("{msg}"))]
    #[snafu(visibility(pub(crate)))]
    Unavailable { msg: String },
    #[snafu(display("Internal error"))]
    #[snafu(visibility(pub(crate)))]
    Internal { source: BoxedError },
}
pub type ApiResult<T> = std::result::Result<T, ApiError>;

// How error responses are serialized to clients.
#[derive(Serialize)]
pub struct ErrorBody {
    pub detail: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidArgument { .. } => "invalid_argument",
            ApiError::NotFound { .. } => "not_found",
            ApiError::Unauthorized { .. } => "unauthorized",
            ApiError::Conflict { .. } => "conflict",
            ApiError::Unavailable { .. } => "unavailable",
            ApiError::Internal { .. } => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Internal { .. } => {
                error!(target: LOG_TARGET, err = %self.fmt_compact(), "Request failed");
            }
            _ => {
                info!(target: LOG_TARGET, err = %self.fmt_compact(), "Request error");
            }
        }

        let status = self.status();
        let body = ErrorBody {
            detail: self.to_string(),
            kind: self.kind(),
        };
        (status, AppJson(body)).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UserNotFound { .. }
            | DbError::PostNotFound { .. }
            | DbError::FollowNotFound { .. }
            | DbError::NotPostAuthor { .. } => ApiError::NotFound {
                msg: err.to_string(),
            },
            DbError::UsernameTaken { .. }
            | DbError::EmailTaken { .. }
            | DbError::DuplicateFollow { .. } => ApiError::Conflict {
                msg: err.to_string(),
            },
            DbError::SelfFollow => ApiError::InvalidArgument {
                msg: err.to_string(),
            },
            _ => ApiError::Internal {
                source: Box::new(err),
            },
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        ApiError::Unavailable {
            msg: err.to_string(),
        }
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Unavailable | BusError::Full { .. } => ApiError::Unavailable {
                msg: err.to_string(),
            },
            _ => ApiError::Internal {
                source: Box::new(err),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidArgument {
            msg: rejection.body_text(),
        }
    }
}
