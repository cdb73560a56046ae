//! HTTP request handlers organized by functionality
//!
//! Every handler is a stateless function of the registry handle and the
//! request body.

pub mod catalog;
pub mod control;

use axum::Json;
use axum::extract::FromRequest;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use peerdrop_core::tracker::messages::ErrorBody;
use peerdrop_core::TrackerError;

// Re-export handler functions
pub use catalog::{get_descriptor, list_files, list_peers, publish_descriptor};
pub use control::{
    complete_transfer, disconnect, file_idle_peers, heartbeat, idle_peers, register, request_file,
};

/// Registry error turned into a status code and an [`ErrorBody`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub TrackerError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            TrackerError::InvalidRegistration { .. } | TrackerError::Protocol { .. } => {
                StatusCode::BAD_REQUEST
            }
            TrackerError::NotRegistered { .. } | TrackerError::UnknownFile { .. } => {
                StatusCode::NOT_FOUND
            }
            TrackerError::NotEnoughPeers { .. }
            | TrackerError::PeerBusy { .. }
            | TrackerError::DescriptorConflict { .. } => StatusCode::CONFLICT,
            TrackerError::TrackerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            TrackerError::Http(_) | TrackerError::Rejected { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::debug!(status = status.as_u16(), error = %self.0, "Request rejected");
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(TrackerError::Protocol {
            message: rejection.body_text(),
        })
    }
}

/// JSON request body; a missing or malformed body answers 400 with an
/// [`ErrorBody`] instead of axum's plain-text rejection.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

pub type ApiResult<T> = Result<Json<T>, ApiError>;
