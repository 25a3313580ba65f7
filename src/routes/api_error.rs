use std::fmt::Debug;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use actix_web::ResponseError;
use serde_json::json;

use crate::dispatcher::DispatchError;
use crate::recipients::ResolveError;
use crate::store::StoreError;
use crate::upload::UploadError;
use crate::utils::error_chain_fmt;

/// What every handler returns on failure. Rendered as
/// `{"success": false, "message": ...}`.
#[derive(thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl Debug for ApiError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "success": false,
            "message": self.to_string(),
        }))
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateName(_)
            | StoreError::DuplicateTitle(_)
            | StoreError::AlreadyMember { .. } => Self::Conflict(e.to_string()),
            StoreError::NotFound(_) => Self::NotFound(e.to_string()),
            StoreError::Database(_) => Self::Unexpected(e.into()),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Validation(msg) => Self::Validation(msg),
            ResolveError::Campaign { source, .. } => source.into(),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Validation(msg) => Self::Validation(msg),
            UploadError::Io(_) => Self::Unexpected(e.into()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::InvalidAttachment { .. } => Self::Validation(e.to_string()),
            DispatchError::TransportConfig(_) | DispatchError::Io(_) => Self::Unexpected(e.into()),
        }
    }
}
