use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;

use crate::database::CustomDatabaseError;
use crate::features::Assignment;

#[derive(Debug, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum EventResponseCode {
    Ok = 1,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EventResponse {
    pub status: EventResponseCode,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub cookie: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_cookie: Option<String>,
    pub features: Vec<Assignment>,
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("stored record could not be parsed")]
    DataParsingError,

    #[error(transparent)]
    Database(#[from] CustomDatabaseError),
}

impl TrackerError {
    pub fn invalid_argument(name: &str) -> Self {
        TrackerError::InvalidArgument(format!("{name} is missing or malformed"))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            TrackerError::InvalidArgument(_) | TrackerError::RequestParsingError(_) => {
                StatusCode::BAD_REQUEST
            }
            TrackerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            TrackerError::DataParsingError => StatusCode::INTERNAL_SERVER_ERROR,
            TrackerError::Database(e) if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            TrackerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TrackerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}
