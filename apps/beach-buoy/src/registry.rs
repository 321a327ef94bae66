use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::credentials::RelayCredentialIssuer;
use crate::session::{Session, SessionKey, SessionSnapshot, SessionState};

/// Shared reference to one incarnation of a session.
#[derive(Clone)]
pub struct SessionHandle {
    key: SessionKey,
    state: Arc<Mutex<Session>>,
}

impl SessionHandle {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.state.lock().await
    }
}

pub struct Created {
    pub handle: SessionHandle,
    /// The prior incarnation, already unlinked from the registry. The caller
    /// retires it.
    pub replaced: Option<SessionHandle>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    sessions: DashMap<String, SessionHandle>,
    next_generation: AtomicU64,
    issuer: RelayCredentialIssuer,
    candidate_capacity: usize,
}

impl SessionRegistry {
    pub fn new(issuer: RelayCredentialIssuer, candidate_capacity: usize) -> Self {
        Self {
            inner: Arc::new(SessionRegistryInner {
                sessions: DashMap::new(),
                next_generation: AtomicU64::new(1),
                issuer,
                candidate_capacity,
            }),
        }
    }

    pub fn issuer(&self) -> &RelayCredentialIssuer {
        &self.inner.issuer
    }

    /// Registers a fresh incarnation, unconditionally replacing any prior one.
    pub fn create(&self, session_id: &str) -> Created {
        let handle = self.new_handle(session_id);
        let replaced = self
            .inner
            .sessions
            .insert(session_id.to_string(), handle.clone());
        debug!(
            session = %handle.key,
            replaced = replaced.is_some(),
            "session created"
        );
        Created { handle, replaced }
    }

    /// Like `create`, but refuses to replace a `connected` session. On refusal
    /// the key of the connected incarnation is returned.
    ///
    /// The existing session's lock is held from the state check until the
    /// swap, so it cannot become connected in between.
    pub async fn claim(&self, session_id: &str) -> Result<Created, SessionKey> {
        loop {
            let existing = self.get(session_id);
            let guard = match &existing {
                Some(handle) => Some(handle.lock().await),
                None => None,
            };
            if let Some(session) = &guard {
                if session.state() == SessionState::Connected {
                    return Err(session.key().clone());
                }
            }

            let expected = existing.as_ref().map(|handle| handle.key.generation);
            let created = match self.inner.sessions.entry(session_id.to_string()) {
                Entry::Occupied(mut entry) if Some(entry.get().key.generation) == expected => {
                    let handle = self.new_handle(session_id);
                    let replaced = entry.insert(handle.clone());
                    Some(Created {
                        handle,
                        replaced: Some(replaced),
                    })
                }
                Entry::Vacant(entry) if expected.is_none() => {
                    let handle = self.new_handle(session_id);
                    entry.insert(handle.clone());
                    Some(Created {
                        handle,
                        replaced: None,
                    })
                }
                _ => None,
            };
            drop(guard);

            match created {
                Some(created) => {
                    debug!(
                        session = %created.handle.key,
                        replaced = created.replaced.is_some(),
                        "session claimed"
                    );
                    return Ok(created);
                }
                // Registry changed while waiting for the lock.
                None => continue,
            }
        }
    }

    fn new_handle(&self, session_id: &str) -> SessionHandle {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let key = SessionKey::new(session_id, generation);
        SessionHandle {
            key: key.clone(),
            state: Arc::new(Mutex::new(Session::new(
                key,
                self.inner.candidate_capacity,
            ))),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn is_current(&self, key: &SessionKey) -> bool {
        self.inner
            .sessions
            .get(&key.id)
            .map(|entry| entry.value().key.generation == key.generation)
            .unwrap_or(false)
    }

    /// Removes whatever incarnation is registered under `session_id`.
    /// Returns false if there was nothing to remove.
    pub async fn destroy(&self, session_id: &str) -> bool {
        let Some((_, handle)) = self.inner.sessions.remove(session_id) else {
            return false;
        };
        self.release(&handle, SessionState::Closed).await;
        true
    }

    /// Like `destroy`, but only if `key` still names the registered
    /// incarnation. Timers holding an old key cannot take down its successor.
    pub async fn destroy_handle(&self, key: &SessionKey, terminal: SessionState) -> bool {
        let Some((_, handle)) = self
            .inner
            .sessions
            .remove_if(&key.id, |_, handle| handle.key.generation == key.generation)
        else {
            return false;
        };
        self.release(&handle, terminal).await;
        true
    }

    /// Destroys every session idle for longer than `idle_timeout` and returns
    /// their keys.
    pub async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        idle_timeout: chrono::Duration,
    ) -> Vec<SessionKey> {
        let handles: Vec<SessionHandle> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut expired = Vec::new();
        for handle in handles {
            let idle = handle.lock().await.is_idle(now, idle_timeout);
            if idle && self.destroy_handle(&handle.key, SessionState::Closed).await {
                expired.push(handle.key.clone());
            }
        }
        expired
    }

    /// Rotates expired relay credentials held by live sessions. Returns how
    /// many were replaced.
    pub async fn refresh_credentials(&self, now: DateTime<Utc>) -> usize {
        let handles: Vec<SessionHandle> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut rotated = 0;
        for handle in handles {
            let mut session = handle.lock().await;
            if session.state().is_terminal() || !session.credential_expired(now) {
                continue;
            }
            match self.inner.issuer.ensure(handle.id(), now) {
                Ok(credential) => {
                    session.set_relay_credential(credential);
                    rotated += 1;
                }
                Err(err) => warn!(
                    session = %handle.key,
                    error = %err,
                    "relay credential rotation failed"
                ),
            }
        }
        rotated
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let handle = self.get(session_id)?;
        let snapshot = handle.lock().await.snapshot();
        Some(snapshot)
    }

    async fn release(&self, handle: &SessionHandle, terminal: SessionState) {
        handle.lock().await.release(terminal);
        // Only drop the issuer's record if no newer incarnation adopted the id.
        if self.get(handle.id()).is_none() {
            self.inner.issuer.invalidate(handle.id());
        }
        debug!(session = %handle.key, state = %terminal, "session destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::candidate::IceCandidateRecord;
    use crate::credentials::test_issuer;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(test_issuer(Duration::from_secs(600)), 8)
    }

    fn candidate(n: u32) -> IceCandidateRecord {
        IceCandidateRecord {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn create_replaces_prior_incarnation() {
        let registry = registry();
        let first = registry.create("abc");
        assert!(first.replaced.is_none());
        first.handle.lock().await.queue_candidate(candidate(1));

        let second = registry.create("abc");
        let replaced = second.replaced.expect("prior session returned");
        assert_eq!(replaced.key(), first.handle.key());
        assert!(second.handle.key().generation > first.handle.key().generation);
        assert_eq!(second.handle.lock().await.pending_len(), 0);
        assert!(!registry.is_current(first.handle.key()));
        assert!(registry.is_current(second.handle.key()));
        assert_eq!(registry.len(), 1);
    }

    async fn connect(handle: &SessionHandle) {
        let mut session = handle.lock().await;
        for next in [
            SessionState::Offered,
            SessionState::Answered,
            SessionState::Connected,
        ] {
            session.transition(next);
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn claim_refuses_connected_sessions() {
        let registry = registry();
        assert!(registry.claim("abc").await.unwrap().replaced.is_none());

        let answered = registry.create("abc");
        answered
            .handle
            .lock()
            .await
            .transition(SessionState::Offered);
        let claimed = registry.claim("abc").await.unwrap();
        assert_eq!(claimed.replaced.unwrap().key(), answered.handle.key());

        connect(&claimed.handle).await;
        let refused = registry.claim("abc").await.map(|c| c.handle.key().clone());
        assert_eq!(refused.unwrap_err(), *claimed.handle.key());
        assert!(registry.is_current(claimed.handle.key()));
    }

    #[test_timeout::tokio_timeout_test]
    async fn claim_sees_connection_that_lands_while_waiting() {
        let registry = registry();
        let first = registry.create("abc");
        let mut session = first.handle.lock().await;

        let claiming = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .claim("abc")
                    .await
                    .map(|created| created.handle.key().clone())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        for next in [
            SessionState::Offered,
            SessionState::Answered,
            SessionState::Connected,
        ] {
            session.transition(next);
        }
        drop(session);

        let result = claiming.await.unwrap();
        assert_eq!(result.unwrap_err(), *first.handle.key());
        assert!(registry.is_current(first.handle.key()));
    }

    #[test_timeout::tokio_timeout_test]
    async fn claim_retries_when_registry_changes_underneath() {
        let registry = registry();
        let first = registry.create("abc");
        let session = first.handle.lock().await;

        let claiming = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .claim("abc")
                    .await
                    .map(|created| created.handle.key().clone())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = registry.create("abc");
        drop(session);

        let claimed = claiming.await.unwrap().unwrap();
        assert!(claimed.generation > second.handle.key().generation);
        assert!(registry.is_current(&claimed));
    }

    #[test_timeout::tokio_timeout_test]
    async fn destroy_is_idempotent() {
        let registry = registry();
        registry.issuer().issue("abc").unwrap();
        let created = registry.create("abc");
        created.handle.lock().await.queue_candidate(candidate(1));

        assert!(registry.destroy("abc").await);
        assert!(!registry.destroy("abc").await);
        assert!(registry.get("abc").is_none());
        assert!(registry.issuer().current("abc").is_none());

        let session = created.handle.lock().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.pending_len(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_handle_cannot_destroy_successor() {
        let registry = registry();
        let first = registry.create("abc");
        let second = registry.create("abc");
        registry.issuer().issue("abc").unwrap();

        assert!(
            !registry
                .destroy_handle(first.handle.key(), SessionState::Failed)
                .await
        );
        assert!(registry.is_current(second.handle.key()));
        assert!(registry.issuer().current("abc").is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn sweep_removes_only_idle_sessions() {
        let registry = registry();
        let idle = registry.create("idle");
        let busy = registry.create("busy");
        let now = Utc::now();
        idle.handle
            .lock()
            .await
            .backdate_activity(now - chrono::Duration::seconds(120));

        let swept = registry
            .sweep_expired(now, chrono::Duration::seconds(60))
            .await;
        assert_eq!(swept, vec![idle.handle.key().clone()]);
        assert!(registry.get("idle").is_none());
        assert!(registry.is_current(busy.handle.key()));

        let swept_again = registry
            .sweep_expired(now, chrono::Duration::seconds(60))
            .await;
        assert!(swept_again.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn snapshot_reports_state() {
        let registry = registry();
        let created = registry.create("abc");
        created.handle.lock().await.transition(SessionState::Offered);
        let snapshot = registry.snapshot("abc").await.unwrap();
        assert_eq!(snapshot.state, SessionState::Offered);
        assert_eq!(snapshot.generation, created.handle.key().generation);
        assert!(registry.snapshot("zzz").await.is_none());
    }
}
