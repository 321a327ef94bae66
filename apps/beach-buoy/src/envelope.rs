//! Wire envelopes exchanged with browser peers.
//!
//! Every SDP and ICE candidate payload travels as JSON that has been base64
//! encoded and then wrapped in a small JSON object. Offers and answers use the
//! same wrapping so a description survives the round trip byte for byte.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::candidate::IceCandidateRecord;

/// Header carrying the caller's session identity on every request.
pub const SESSION_ID_HEADER: &str = "x-session-id";

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload is empty")]
    Empty,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not valid utf-8")]
    Utf8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }
}

/// The `{type, sdp}` object a browser produces from `RTCSessionDescription`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Outer object for `/offer` requests and responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptionEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SdpType>,
    /// base64(JSON(SessionDescription))
    pub sdp: String,
}

/// Outer object for `/ice-candidate` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEnvelope {
    /// base64(JSON(IceCandidateRecord))
    pub candidate: String,
}

pub fn encode_description(
    description: &SessionDescription,
) -> Result<DescriptionEnvelope, EnvelopeError> {
    let json = serde_json::to_vec(description)?;
    Ok(DescriptionEnvelope {
        kind: Some(description.kind),
        sdp: STANDARD.encode(json),
    })
}

pub fn decode_description(
    envelope: &DescriptionEnvelope,
) -> Result<SessionDescription, EnvelopeError> {
    let json = decode_base64(&envelope.sdp)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Accepts either the JSON wrapper or a bare base64 body.
pub fn decode_description_body(body: &[u8]) -> Result<SessionDescription, EnvelopeError> {
    let text = body_text(body)?;
    if text.starts_with('{') {
        let envelope: DescriptionEnvelope = serde_json::from_str(text)?;
        decode_description(&envelope)
    } else {
        let json = decode_base64(text)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

pub fn encode_candidate(record: &IceCandidateRecord) -> Result<CandidateEnvelope, EnvelopeError> {
    let json = serde_json::to_vec(record)?;
    Ok(CandidateEnvelope {
        candidate: STANDARD.encode(json),
    })
}

pub fn decode_candidate_body(body: &[u8]) -> Result<IceCandidateRecord, EnvelopeError> {
    let text = body_text(body)?;
    let encoded = if text.starts_with('{') {
        let envelope: CandidateEnvelope = serde_json::from_str(text)?;
        envelope.candidate
    } else {
        text.to_string()
    };
    let json = decode_base64(&encoded)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Returns the trimmed session id if it is usable as a registry key.
pub fn parse_session_id(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_SESSION_ID_LEN {
        return None;
    }
    if !trimmed.bytes().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    Some(trimmed)
}

fn body_text(body: &[u8]) -> Result<&str, EnvelopeError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| EnvelopeError::Utf8)?
        .trim();
    if text.is_empty() {
        return Err(EnvelopeError::Empty);
    }
    Ok(text)
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, EnvelopeError> {
    let trimmed = encoded.trim();
    if trimmed.is_empty() {
        return Err(EnvelopeError::Empty);
    }
    // Browsers pad, hand-rolled clients sometimes do not.
    match STANDARD.decode(trimmed) {
        Ok(bytes) => Ok(bytes),
        Err(_) => Ok(STANDARD_NO_PAD.decode(trimmed.trim_end_matches('='))?),
    }
}
