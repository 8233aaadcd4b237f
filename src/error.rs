use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failure taxonomy shared by the launch pipeline and the outcomes receiver.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("authentication failure: {0}")]
    Authentication(String),

    #[error("parse failure: {0}")]
    Parse(String),

    #[error("correlation failure: {0}")]
    Correlation(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl HarnessError {
    pub fn status(&self) -> StatusCode {
        match self {
            HarnessError::Configuration(_) | HarnessError::Parse(_) => StatusCode::BAD_REQUEST,
            HarnessError::Authentication(_) => StatusCode::UNAUTHORIZED,
            HarnessError::NotFound(_) => StatusCode::NOT_FOUND,
            HarnessError::Correlation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HarnessError::Delivery(_) => StatusCode::BAD_GATEWAY,
            HarnessError::Signing(_) | HarnessError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Creation paths report unique-key collisions as configuration errors.
    pub fn from_create(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => HarnessError::Configuration(msg),
            other => HarnessError::Storage(other),
        }
    }
}

impl IntoResponse for HarnessError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
        }
        (status, self.to_string()).into_response()
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
pub type StoreResult<T> = Result<T, StoreError>;
