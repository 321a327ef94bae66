use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::credentials::CredentialError;
use crate::media::MediaError;
use crate::sdp::OfferError;
use crate::synth::SynthError;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid offer: {0}")]
    InvalidOffer(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("missing X-Session-ID header")]
    MissingSessionId,
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("session {0} is connected and may not be replaced")]
    SessionConflict(String),
    #[error("relay credential expired for session {0}")]
    CredentialExpired(String),
    #[error("candidate relay failed: {0}")]
    RelayFailure(String),
    #[error("negotiation timed out for session {0}")]
    NegotiationTimeout(String),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("synth unavailable: {0}")]
    SynthUnavailable(#[from] SynthError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    pub fn status(&self) -> StatusCode {
        match self {
            SignalingError::InvalidOffer(_)
            | SignalingError::InvalidCandidate(_)
            | SignalingError::MissingSessionId => StatusCode::BAD_REQUEST,
            SignalingError::UnknownSession(_) => StatusCode::NOT_FOUND,
            SignalingError::SessionConflict(_) => StatusCode::CONFLICT,
            SignalingError::CredentialExpired(_) => StatusCode::UNAUTHORIZED,
            SignalingError::RelayFailure(_) | SignalingError::SynthUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            SignalingError::NegotiationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            SignalingError::Media(_) | SignalingError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            SignalingError::InvalidOffer(_) => "invalid_offer",
            SignalingError::InvalidCandidate(_) => "invalid_candidate",
            SignalingError::MissingSessionId => "missing_session_id",
            SignalingError::UnknownSession(_) => "unknown_session",
            SignalingError::SessionConflict(_) => "session_conflict",
            SignalingError::CredentialExpired(_) => "credential_expired",
            SignalingError::RelayFailure(_) => "relay_failure",
            SignalingError::NegotiationTimeout(_) => "negotiation_timeout",
            SignalingError::Media(_) => "media_error",
            SignalingError::SynthUnavailable(_) => "synth_unavailable",
            SignalingError::Internal(_) => "internal",
        }
    }
}

impl From<OfferError> for SignalingError {
    fn from(err: OfferError) -> Self {
        SignalingError::InvalidOffer(err.to_string())
    }
}

impl From<CredentialError> for SignalingError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Expired(id) | CredentialError::Unknown(id) => {
                SignalingError::CredentialExpired(id)
            }
            other => SignalingError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    reason: &'static str,
    message: String,
}

impl IntoResponse for SignalingError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(reason = self.reason(), error = %self, "request failed");
        } else {
            warn!(reason = self.reason(), error = %self, "request rejected");
        }
        let body = ErrorBody {
            success: false,
            reason: self.reason(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
