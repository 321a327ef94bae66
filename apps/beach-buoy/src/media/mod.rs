//! The boundary between signaling and whatever terminates the media.
//!
//! The coordinator only ever talks to a [`MediaEngine`]; transport state flows
//! back the other way as [`TransportEvent`]s on an unbounded channel.

mod loopback;
mod rtc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::candidate::IceCandidateRecord;
use crate::credentials::IceConfiguration;
use crate::envelope::SessionDescription;
use crate::session::{SessionKey, SessionState};

pub use loopback::LoopbackMediaEngine;
pub use rtc::{WebRtcMediaEngine, WebRtcSettings};

#[derive(Debug, Error)]
pub enum MediaError {
    /// Worth one more attempt.
    #[error("transient media failure: {0}")]
    Transient(String),
    #[error("rejected by media engine: {0}")]
    Rejected(String),
    #[error("no peer for session {0}")]
    UnknownPeer(String),
    /// A newer incarnation of the session already owns the peer slot.
    #[error("session {0} was superseded during negotiation")]
    Superseded(String),
    #[error("media engine failure: {0}")]
    Internal(String),
}

impl MediaError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MediaError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Gathering,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// The session state a transport report moves the session to, if any.
    pub fn session_state(&self) -> Option<SessionState> {
        match self {
            TransportState::New => None,
            TransportState::Gathering | TransportState::Checking => {
                Some(SessionState::IceGathering)
            }
            TransportState::Connected => Some(SessionState::Connected),
            TransportState::Disconnected => Some(SessionState::Disconnected),
            TransportState::Failed => Some(SessionState::Failed),
            TransportState::Closed => Some(SessionState::Closed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub key: SessionKey,
    pub state: TransportState,
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn transport_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Applies the remote offer and produces the local answer for `key`.
    async fn negotiate(
        &self,
        key: &SessionKey,
        offer: &SessionDescription,
        ice: &IceConfiguration,
    ) -> Result<SessionDescription, MediaError>;

    async fn add_remote_candidate(
        &self,
        key: &SessionKey,
        candidate: &IceCandidateRecord,
    ) -> Result<(), MediaError>;

    /// Idempotent. Closing an unknown or already replaced peer succeeds.
    async fn close(&self, key: &SessionKey) -> Result<(), MediaError>;

    fn name(&self) -> &'static str;
}
