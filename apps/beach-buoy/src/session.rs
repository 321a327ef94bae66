use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::candidate::{CandidateQueue, IceCandidateRecord};
use crate::credentials::RelayCredential;

/// Generate a new session ID
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Identifies one incarnation of a session id. Re-offering under the same id
/// bumps the generation, which lets async work detect that its session is gone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub id: String,
    pub generation: u64,
}

impl SessionKey {
    pub fn new(id: impl Into<String>, generation: u64) -> Self {
        Self {
            id: id.into(),
            generation,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Created,
    Offered,
    Answered,
    IceGathering,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Offered => "offered",
            SessionState::Answered => "answered",
            SessionState::IceGathering => "ice-gathering",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Failed | Closed, _) => false,
            (_, Failed | Closed) => true,
            (Created, Offered) => true,
            (Offered, Answered) => true,
            (Answered, IceGathering | Connected | Disconnected) => true,
            (IceGathering, Connected | Disconnected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed {
        from: SessionState,
        to: SessionState,
    },
    Unchanged,
    Rejected {
        from: SessionState,
        to: SessionState,
    },
}

/// Mutable per-session state. Only reachable through the registry's
/// per-session lock.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    state: SessionState,
    remote_description_set: bool,
    pending: CandidateQueue,
    retry: Vec<IceCandidateRecord>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    disconnect_epoch: u64,
    relay_credential: Option<RelayCredential>,
}

impl Session {
    pub fn new(key: SessionKey, candidate_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            key,
            state: SessionState::Created,
            remote_description_set: false,
            pending: CandidateQueue::new(candidate_capacity),
            retry: Vec::new(),
            created_at: now,
            last_activity_at: now,
            disconnect_epoch: 0,
            relay_credential: None,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn disconnect_epoch(&self) -> u64 {
        self.disconnect_epoch
    }

    pub fn set_relay_credential(&mut self, credential: RelayCredential) {
        self.relay_credential = Some(credential);
    }

    /// True when the session holds a credential that is past its expiry.
    pub fn credential_expired(&self, now: DateTime<Utc>) -> bool {
        self.relay_credential
            .as_ref()
            .is_some_and(|credential| credential.is_expired(now))
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&mut self, at: DateTime<Utc>) {
        self.last_activity_at = at;
    }

    /// Connected sessions never idle out; a vanished peer surfaces through the
    /// transport as disconnected or failed instead.
    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        self.state != SessionState::Connected && now - self.last_activity_at > idle_timeout
    }

    pub fn transition(&mut self, next: SessionState) -> Transition {
        let from = self.state;
        if from == next {
            return Transition::Unchanged;
        }
        if !from.can_transition_to(next) {
            return Transition::Rejected { from, to: next };
        }
        if next == SessionState::Disconnected {
            self.disconnect_epoch += 1;
        }
        self.state = next;
        Transition::Changed { from, to: next }
    }

    /// Queues a candidate; returns the evicted oldest entry on overflow.
    pub fn queue_candidate(&mut self, record: IceCandidateRecord) -> Option<IceCandidateRecord> {
        self.pending.push(record)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped_candidates(&self) -> u64 {
        self.pending.dropped()
    }

    /// Flips the remote-description flag and hands back everything queued so
    /// far, oldest first. The queue is empty afterwards.
    pub fn mark_remote_description_set(&mut self) -> Vec<IceCandidateRecord> {
        self.remote_description_set = true;
        self.pending.drain()
    }

    pub fn defer_retry(&mut self, record: IceCandidateRecord) {
        self.retry.push(record);
    }

    pub fn take_retries(&mut self) -> Vec<IceCandidateRecord> {
        std::mem::take(&mut self.retry)
    }

    /// Releases everything the session holds. Used on destroy and replacement.
    pub fn release(&mut self, terminal: SessionState) -> Option<RelayCredential> {
        self.pending.clear();
        self.retry.clear();
        if !self.state.is_terminal() {
            self.state = terminal;
        }
        self.relay_credential.take()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.key.id.clone(),
            generation: self.key.generation,
            state: self.state,
            remote_description_set: self.remote_description_set,
            pending_candidates: self.pending.len(),
            dropped_candidates: self.pending.dropped(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            credential_expires_at: self.relay_credential.as_ref().map(|c| c.expires_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub generation: u64,
    pub state: SessionState,
    pub remote_description_set: bool,
    pub pending_candidates: usize,
    pub dropped_candidates: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SessionKey::new("abc", 1), 8)
    }

    #[test_timeout::timeout]
    fn test_session_id_generation() {
        let id1 = generate_session_id();
        let id2 = generate_session_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36); // UUID v4 format
    }

    #[test_timeout::timeout]
    fn follows_happy_path() {
        let mut s = session();
        for next in [
            SessionState::Offered,
            SessionState::Answered,
            SessionState::IceGathering,
            SessionState::Connected,
            SessionState::Disconnected,
            SessionState::Connected,
            SessionState::Closed,
        ] {
            assert!(matches!(s.transition(next), Transition::Changed { .. }));
        }
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.disconnect_epoch(), 1);
    }

    #[test_timeout::timeout]
    fn terminal_states_are_sticky() {
        let mut s = session();
        s.transition(SessionState::Offered);
        s.transition(SessionState::Failed);
        assert_eq!(
            s.transition(SessionState::Connected),
            Transition::Rejected {
                from: SessionState::Failed,
                to: SessionState::Connected
            }
        );
        assert_eq!(
            s.transition(SessionState::Closed),
            Transition::Rejected {
                from: SessionState::Failed,
                to: SessionState::Closed
            }
        );
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[test_timeout::timeout]
    fn skipping_ahead_is_rejected() {
        let mut s = session();
        assert!(matches!(
            s.transition(SessionState::Connected),
            Transition::Rejected { .. }
        ));
        assert_eq!(s.transition(SessionState::Created), Transition::Unchanged);
    }

    #[test_timeout::timeout]
    fn release_clears_queue_and_marks_closed() {
        let mut s = session();
        s.transition(SessionState::Offered);
        s.queue_candidate(IceCandidateRecord {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        });
        assert_eq!(s.pending_len(), 1);
        s.release(SessionState::Closed);
        assert_eq!(s.pending_len(), 0);
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test_timeout::timeout]
    fn idle_detection_uses_last_activity() {
        let mut s = session();
        let now = Utc::now();
        assert!(!s.is_idle(now, chrono::Duration::seconds(30)));
        s.backdate_activity(now - chrono::Duration::seconds(31));
        assert!(s.is_idle(now, chrono::Duration::seconds(30)));
    }

    #[test_timeout::timeout]
    fn connected_sessions_never_idle_out() {
        let mut s = session();
        for next in [
            SessionState::Offered,
            SessionState::Answered,
            SessionState::Connected,
        ] {
            s.transition(next);
        }
        let now = Utc::now();
        s.backdate_activity(now - chrono::Duration::seconds(3600));
        assert!(!s.is_idle(now, chrono::Duration::seconds(300)));

        s.transition(SessionState::Disconnected);
        assert!(s.is_idle(now, chrono::Duration::seconds(300)));
    }
}
