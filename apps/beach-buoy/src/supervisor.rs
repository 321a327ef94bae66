//! Connection supervision.
//!
//! Transport reports from the media engine drive the session state machine.
//! Besides applying them the supervisor owns every timer that can end a
//! session: the disconnect grace period, the negotiation watchdog and the idle
//! sweep. All of them hold a [`SessionKey`] and re-check it before acting, so a
//! timer that fires after its session was replaced does nothing.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::media::{MediaEngine, TransportEvent, TransportEventReceiver};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::{SessionKey, SessionState, Transition};

const STATUS_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub disconnect_grace: Duration,
    pub negotiation_timeout: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

/// Emitted whenever a session reaches a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub session_id: String,
    pub generation: u64,
    pub state: SessionState,
    pub reason: &'static str,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    registry: SessionRegistry,
    engine: Arc<dyn MediaEngine>,
    config: SupervisorConfig,
    status: broadcast::Sender<StatusEvent>,
}

impl ConnectionSupervisor {
    pub fn new(
        registry: SessionRegistry,
        engine: Arc<dyn MediaEngine>,
        config: SupervisorConfig,
    ) -> Self {
        let (status, _) = broadcast::channel(STATUS_CHANNEL_DEPTH);
        Self {
            inner: Arc::new(SupervisorInner {
                registry,
                engine,
                config,
                status,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status.subscribe()
    }

    /// Consumes transport events until every sender is gone.
    pub fn spawn(&self, mut events: TransportEventReceiver) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                supervisor.observe(event).await;
            }
            debug!("transport event channel closed");
        })
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = supervisor.sweep(Utc::now()).await;
                if swept > 0 {
                    info!(swept, "idle sessions reaped");
                }
            }
        })
    }

    pub async fn observe(&self, event: TransportEvent) {
        let TransportEvent { key, state } = event;
        let Some(target) = state.session_state() else {
            trace!(session = %key, ?state, "transport report without session effect");
            return;
        };
        let Some(handle) = self.current(&key) else {
            debug!(session = %key, ?state, "dropping transport report for stale session");
            counter!("beach_buoy_stale_transport_events_total", 1);
            return;
        };

        let mut session = handle.lock().await;
        match session.transition(target) {
            Transition::Changed { from, to } => {
                session.touch();
                info!(session = %key, %from, %to, "session state changed");
                counter!("beach_buoy_session_transitions_total", 1, "to" => to.as_str());
                match to {
                    SessionState::Disconnected => {
                        let epoch = session.disconnect_epoch();
                        drop(session);
                        self.arm_grace(key, epoch);
                    }
                    SessionState::Failed | SessionState::Closed => {
                        drop(session);
                        self.teardown(&key, to, "transport").await;
                    }
                    _ => {}
                }
            }
            Transition::Unchanged => {
                session.touch();
            }
            Transition::Rejected { from, to } => {
                warn!(session = %key, %from, %to, "ignoring illegal transition");
            }
        }
    }

    /// A session that is still not connected once the negotiation timeout
    /// elapses is failed.
    pub fn arm_negotiation_watchdog(&self, key: SessionKey) {
        let supervisor = self.clone();
        let timeout = self.inner.config.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(handle) = supervisor.current(&key) else {
                return;
            };
            let stalled = matches!(
                handle.lock().await.state(),
                SessionState::Created
                    | SessionState::Offered
                    | SessionState::Answered
                    | SessionState::IceGathering
            );
            if stalled {
                warn!(session = %key, ?timeout, "session never connected");
                supervisor.fail(&key, "negotiation_timeout").await;
            }
        });
    }

    fn arm_grace(&self, key: SessionKey, epoch: u64) {
        let supervisor = self.clone();
        let grace = self.inner.config.disconnect_grace;
        debug!(session = %key, ?grace, "disconnect grace period started");
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(handle) = supervisor.current(&key) else {
                return;
            };
            let expired = {
                let session = handle.lock().await;
                session.state() == SessionState::Disconnected
                    && session.disconnect_epoch() == epoch
            };
            if expired {
                info!(session = %key, "transport did not recover within grace period");
                supervisor
                    .teardown(&key, SessionState::Closed, "disconnect_grace")
                    .await;
            }
        });
    }

    pub async fn fail(&self, key: &SessionKey, reason: &'static str) -> bool {
        self.teardown(key, SessionState::Failed, reason).await
    }

    /// Explicit stop. Returns false if there was no session to stop.
    pub async fn close(&self, session_id: &str) -> bool {
        let Some(handle) = self.inner.registry.get(session_id) else {
            return false;
        };
        self.teardown(handle.key(), SessionState::Closed, "stop")
            .await
    }

    /// Removes the session named by `key`, closes its peer and reports it.
    /// Safe to call repeatedly; only the first call has an effect.
    pub async fn teardown(
        &self,
        key: &SessionKey,
        terminal: SessionState,
        reason: &'static str,
    ) -> bool {
        if !self.inner.registry.destroy_handle(key, terminal).await {
            return false;
        }
        self.finish(key, terminal, reason).await;
        true
    }

    /// Releases a session that was replaced by a newer offer. Its id is
    /// already taken by the successor, so the relay credential stays.
    pub async fn retire(&self, replaced: SessionHandle) {
        replaced.lock().await.release(SessionState::Closed);
        self.finish(replaced.key(), SessionState::Closed, "replaced")
            .await;
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let idle_timeout = match chrono::Duration::from_std(self.inner.config.idle_timeout) {
            Ok(timeout) => timeout,
            Err(err) => {
                warn!(error = %err, "idle timeout out of range; skipping sweep");
                return 0;
            }
        };
        let expired = self
            .inner
            .registry
            .sweep_expired(now, idle_timeout)
            .await;
        for key in &expired {
            self.finish(key, SessionState::Closed, "idle").await;
        }
        let rotated = self.inner.registry.refresh_credentials(now).await;
        if rotated > 0 {
            debug!(rotated, "relay credentials rotated for live sessions");
        }
        let purged = self.inner.registry.issuer().purge_expired(now);
        if purged > 0 {
            debug!(purged, "expired relay credentials purged");
        }
        gauge!("beach_buoy_active_sessions", self.inner.registry.len() as f64);
        expired.len()
    }

    fn current(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.inner
            .registry
            .get(&key.id)
            .filter(|handle| handle.key().generation == key.generation)
    }

    async fn finish(&self, key: &SessionKey, terminal: SessionState, reason: &'static str) {
        if let Err(err) = self.inner.engine.close(key).await {
            warn!(session = %key, error = %err, "closing media peer failed");
        }
        counter!(
            "beach_buoy_sessions_terminated_total",
            1,
            "state" => terminal.as_str(),
            "reason" => reason
        );
        gauge!("beach_buoy_active_sessions", self.inner.registry.len() as f64);
        info!(session = %key, state = %terminal, reason, "session torn down");
        let _ = self.inner.status.send(StatusEvent {
            session_id: key.id.clone(),
            generation: key.generation,
            state: terminal,
            reason,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::test_issuer;
    use crate::media::{LoopbackMediaEngine, TransportState};

    struct Fixture {
        registry: SessionRegistry,
        engine: Arc<LoopbackMediaEngine>,
        supervisor: ConnectionSupervisor,
    }

    fn fixture(grace: Duration, negotiation: Duration) -> Fixture {
        let registry = SessionRegistry::new(test_issuer(Duration::from_secs(600)), 8);
        let engine = Arc::new(LoopbackMediaEngine::new());
        let supervisor = ConnectionSupervisor::new(
            registry.clone(),
            engine.clone(),
            SupervisorConfig {
                disconnect_grace: grace,
                negotiation_timeout: negotiation,
                idle_timeout: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(30),
            },
        );
        Fixture {
            registry,
            engine,
            supervisor,
        }
    }

    async fn answered(registry: &SessionRegistry, id: &str) -> SessionKey {
        let created = registry.create(id);
        let mut session = created.handle.lock().await;
        session.transition(SessionState::Offered);
        session.transition(SessionState::Answered);
        created.handle.key().clone()
    }

    fn report(key: &SessionKey, state: TransportState) -> TransportEvent {
        TransportEvent {
            key: key.clone(),
            state,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn recovers_within_grace_period() {
        let fx = fixture(Duration::from_millis(100), Duration::from_secs(30));
        let key = answered(&fx.registry, "abc").await;
        let mut status = fx.supervisor.subscribe();

        fx.supervisor.observe(report(&key, TransportState::Connected)).await;
        fx.supervisor
            .observe(report(&key, TransportState::Disconnected))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.supervisor.observe(report(&key, TransportState::Connected)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snapshot = fx.registry.snapshot("abc").await.expect("still registered");
        assert_eq!(snapshot.state, SessionState::Connected);
        assert!(status.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn disconnect_past_grace_closes_session() {
        let fx = fixture(Duration::from_millis(50), Duration::from_secs(30));
        let key = answered(&fx.registry, "abc").await;
        let mut status = fx.supervisor.subscribe();

        fx.supervisor.observe(report(&key, TransportState::Connected)).await;
        fx.supervisor
            .observe(report(&key, TransportState::Disconnected))
            .await;
        let event = status.recv().await.unwrap();
        assert_eq!(event.state, SessionState::Closed);
        assert_eq!(event.reason, "disconnect_grace");
        assert!(fx.registry.get("abc").is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn reconnect_then_second_disconnect_uses_fresh_grace() {
        let fx = fixture(Duration::from_millis(80), Duration::from_secs(30));
        let key = answered(&fx.registry, "abc").await;

        fx.supervisor.observe(report(&key, TransportState::Connected)).await;
        fx.supervisor
            .observe(report(&key, TransportState::Disconnected))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.supervisor.observe(report(&key, TransportState::Connected)).await;
        fx.supervisor
            .observe(report(&key, TransportState::Disconnected))
            .await;
        // first timer fires here and must see the newer epoch
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.registry.get("abc").is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.registry.get("abc").is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn failure_tears_down_immediately() {
        let fx = fixture(Duration::from_secs(5), Duration::from_secs(30));
        fx.registry.issuer().issue("abc").unwrap();
        let key = answered(&fx.registry, "abc").await;
        let handle = fx.registry.get("abc").unwrap();
        let mut status = fx.supervisor.subscribe();

        fx.supervisor.observe(report(&key, TransportState::Failed)).await;

        assert!(fx.registry.get("abc").is_none());
        assert!(fx.registry.issuer().current("abc").is_none());
        assert_eq!(handle.lock().await.state(), SessionState::Failed);
        let event = status.try_recv().unwrap();
        assert_eq!(event.state, SessionState::Failed);
        assert_eq!(event.session_id, "abc");

        // no recovery
        fx.supervisor.observe(report(&key, TransportState::Connected)).await;
        assert!(fx.registry.get("abc").is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_generation_reports_are_ignored() {
        let fx = fixture(Duration::from_secs(5), Duration::from_secs(30));
        let old = answered(&fx.registry, "abc").await;
        let new = answered(&fx.registry, "abc").await;

        fx.supervisor.observe(report(&old, TransportState::Failed)).await;
        let snapshot = fx.registry.snapshot("abc").await.unwrap();
        assert_eq!(snapshot.generation, new.generation);
        assert_eq!(snapshot.state, SessionState::Answered);
    }

    #[test_timeout::tokio_timeout_test]
    async fn illegal_transitions_are_ignored() {
        let fx = fixture(Duration::from_secs(5), Duration::from_secs(30));
        let created = fx.registry.create("abc");
        let key = created.handle.key().clone();

        fx.supervisor.observe(report(&key, TransportState::Connected)).await;
        assert_eq!(created.handle.lock().await.state(), SessionState::Created);
    }

    #[test_timeout::tokio_timeout_test]
    async fn negotiation_watchdog_fails_stalled_sessions() {
        let fx = fixture(Duration::from_secs(5), Duration::from_millis(50));
        let stalled = answered(&fx.registry, "stalled").await;
        let healthy = answered(&fx.registry, "healthy").await;
        fx.supervisor
            .observe(report(&healthy, TransportState::Connected))
            .await;

        fx.supervisor.arm_negotiation_watchdog(stalled);
        fx.supervisor.arm_negotiation_watchdog(healthy);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(fx.registry.get("stalled").is_none());
        assert!(fx.registry.get("healthy").is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn sweep_reaps_idle_sessions_and_reports_them() {
        let fx = fixture(Duration::from_secs(5), Duration::from_secs(30));
        let created = fx.registry.create("idle");
        let now = Utc::now();
        created
            .handle
            .lock()
            .await
            .backdate_activity(now - chrono::Duration::seconds(61));
        fx.registry.create("fresh");
        let mut status = fx.supervisor.subscribe();

        assert_eq!(fx.supervisor.sweep(now).await, 1);
        let event = status.try_recv().unwrap();
        assert_eq!(event.session_id, "idle");
        assert_eq!(event.reason, "idle");
        assert_eq!(fx.registry.ids(), vec!["fresh".to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn connected_sessions_survive_the_idle_sweep() {
        let fx = fixture(Duration::from_secs(5), Duration::from_secs(30));
        let key = answered(&fx.registry, "abc").await;
        fx.supervisor
            .observe(report(&key, TransportState::Connected))
            .await;

        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(fx.supervisor.sweep(later).await, 0);
        assert!(fx.registry.is_current(&key));
        let snapshot = fx.registry.snapshot("abc").await.unwrap();
        assert_eq!(snapshot.state, SessionState::Connected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn sweep_rotates_expired_credentials_of_live_sessions() {
        let fx = fixture(Duration::from_secs(5), Duration::from_secs(30));
        let key = answered(&fx.registry, "abc").await;
        let now = Utc::now();
        let stale = fx
            .registry
            .issuer()
            .issue_at("abc", now - chrono::Duration::seconds(3600))
            .unwrap();
        let handle = fx.registry.get("abc").unwrap();
        {
            let mut session = handle.lock().await;
            session.set_relay_credential(stale.clone());
            session.transition(SessionState::Connected);
        }

        fx.supervisor.sweep(now).await;
        let snapshot = fx.registry.snapshot("abc").await.unwrap();
        let expires_at = snapshot.credential_expires_at.unwrap();
        assert!(expires_at > now);
        assert_ne!(
            fx.registry.issuer().current("abc").unwrap().username,
            stale.username
        );
        assert!(fx.registry.is_current(&key));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stop_is_idempotent() {
        let fx = fixture(Duration::from_secs(5), Duration::from_secs(30));
        answered(&fx.registry, "abc").await;
        assert!(fx.supervisor.close("abc").await);
        assert!(!fx.supervisor.close("abc").await);
        assert!(!fx.engine.has_peer("abc"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn event_loop_applies_channel_reports() {
        let fx = fixture(Duration::from_secs(5), Duration::from_secs(30));
        let key = answered(&fx.registry, "abc").await;
        let (tx, rx) = crate::media::transport_channel();
        let task = fx.supervisor.spawn(rx);

        tx.send(report(&key, TransportState::Gathering)).unwrap();
        tx.send(report(&key, TransportState::Connected)).unwrap();
        drop(tx);
        task.await.unwrap();

        let snapshot = fx.registry.snapshot("abc").await.unwrap();
        assert_eq!(snapshot.state, SessionState::Connected);
    }
}
