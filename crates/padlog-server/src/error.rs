use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use padlog_shared::{ProtocolError, ShardId};
use padlog_store::StoreError;
use thiserror::Error;

use crate::pipeline::PipelineError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("EUNKNOWN")]
    UnknownCursor,

    #[error("EEXPIRED")]
    Expired,

    #[error("EACCES")]
    Forbidden,

    #[error("{0}")]
    Rejected(String),

    #[error("Channel is owned by shard {0}")]
    WrongShard(ShardId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::UnknownCursor => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Expired => (StatusCode::GONE, self.to_string()),
            ServerError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Rejected(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            ServerError::WrongShard(_) => (StatusCode::MISDIRECTED_REQUEST, self.to_string()),
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownCursor => ServerError::UnknownCursor,
            StoreError::NotPersistent(_) | StoreError::Protocol(_) => {
                ServerError::BadRequest(e.to_string())
            }
            other => {
                tracing::error!(error = %other, "Store operation failed");
                ServerError::Internal(other.to_string())
            }
        }
    }
}

impl From<PipelineError> for ServerError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::WrongShard { owner } => ServerError::WrongShard(owner),
            PipelineError::InvalidMessage(_) | PipelineError::AdminOnly => {
                ServerError::BadRequest(e.to_string())
            }
            PipelineError::Expired => ServerError::Expired,
            PipelineError::AccessDenied => ServerError::Forbidden,
            PipelineError::Validation(_) => ServerError::Rejected(e.to_string()),
            PipelineError::Store { source, .. } => source.into(),
        }
    }
}
