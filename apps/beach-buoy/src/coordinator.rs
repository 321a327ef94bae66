//! Offer/answer and trickle-ICE handling.
//!
//! Every mutation of a session happens under its registry lock. The one
//! exception is negotiation itself, which can take as long as ICE gathering
//! and therefore runs unlocked; its result is only applied if the session key
//! is still current afterwards.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::candidate::IceCandidateRecord;
use crate::credentials::IceConfiguration;
use crate::envelope::{SdpType, SessionDescription};
use crate::error::SignalingError;
use crate::media::{MediaEngine, MediaError};
use crate::registry::SessionRegistry;
use crate::sdp::inspect_offer;
use crate::session::{Session, SessionKey, SessionSnapshot, SessionState};
use crate::supervisor::ConnectionSupervisor;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub negotiation_timeout: Duration,
    pub relay_retry_delay: Duration,
    pub replace_connected_sessions: bool,
}

/// What happened to a trickled candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Held until the remote description is set.
    Queued,
    Relayed,
    /// Relay failed transiently; one retry is scheduled.
    Deferred,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub attempted: usize,
    pub relayed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SignalingCoordinator {
    registry: SessionRegistry,
    engine: Arc<dyn MediaEngine>,
    supervisor: ConnectionSupervisor,
    config: CoordinatorConfig,
}

impl SignalingCoordinator {
    pub fn new(
        registry: SessionRegistry,
        engine: Arc<dyn MediaEngine>,
        supervisor: ConnectionSupervisor,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            supervisor,
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub async fn handle_offer(
        &self,
        session_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SignalingError> {
        if offer.kind != SdpType::Offer {
            return Err(SignalingError::InvalidOffer(format!(
                "expected type offer, got {}",
                offer.kind.as_str()
            )));
        }
        let summary = inspect_offer(&offer.sdp)?;
        debug!(
            session = %session_id,
            media = summary.media.len(),
            bundle = ?summary.bundle,
            "offer accepted for negotiation"
        );

        // Minted before the registry is touched so a credential failure
        // leaves any prior incarnation in place.
        let credential = self.registry.issuer().ensure(session_id, Utc::now())?;
        let ice = self
            .registry
            .issuer()
            .ice_configuration(session_id, &credential);

        let created = if self.config.replace_connected_sessions {
            self.registry.create(session_id)
        } else {
            self.registry.claim(session_id).await.map_err(|connected| {
                info!(session = %connected, "offer refused; session already connected");
                SignalingError::SessionConflict(session_id.to_string())
            })?
        };
        if let Some(replaced) = created.replaced {
            info!(session = %replaced.key(), "re-offer replaces existing session");
            self.supervisor.retire(replaced).await;
        }
        let handle = created.handle;
        let key = handle.key().clone();
        {
            let mut session = handle.lock().await;
            session.set_relay_credential(credential);
            session.transition(SessionState::Offered);
            session.touch();
        }
        counter!("beach_buoy_offers_total", 1);

        let negotiated = tokio::time::timeout(
            self.config.negotiation_timeout,
            self.engine.negotiate(&key, &offer, &ice),
        )
        .await;
        let answer = match negotiated {
            Ok(Ok(answer)) => answer,
            Ok(Err(err))
                if matches!(err, MediaError::Superseded(_)) || !self.registry.is_current(&key) =>
            {
                debug!(session = %key, error = %err, "negotiation outlived its session");
                if let Err(err) = self.engine.close(&key).await {
                    warn!(session = %key, error = %err, "closing orphaned peer failed");
                }
                return Err(SignalingError::UnknownSession(session_id.to_string()));
            }
            Ok(Err(err)) => {
                self.supervisor.fail(&key, "negotiation_error").await;
                return Err(match err {
                    MediaError::Rejected(reason) => SignalingError::InvalidOffer(reason),
                    other => SignalingError::Media(other),
                });
            }
            Err(_) => {
                warn!(
                    session = %key,
                    timeout = ?self.config.negotiation_timeout,
                    "negotiation timed out"
                );
                self.supervisor.fail(&key, "negotiation_timeout").await;
                return Err(SignalingError::NegotiationTimeout(session_id.to_string()));
            }
        };

        let mut session = handle.lock().await;
        if !self.registry.is_current(&key) || session.state().is_terminal() {
            drop(session);
            debug!(session = %key, "session went away during negotiation; discarding answer");
            if let Err(err) = self.engine.close(&key).await {
                warn!(session = %key, error = %err, "closing orphaned peer failed");
            }
            return Err(SignalingError::UnknownSession(session_id.to_string()));
        }
        session.transition(SessionState::Answered);
        session.touch();
        let report = self.flush_pending(&mut session).await;
        drop(session);

        info!(
            session = %key,
            flushed = report.attempted,
            relayed = report.relayed,
            "answer produced"
        );
        self.supervisor.arm_negotiation_watchdog(key);
        Ok(answer)
    }

    pub async fn handle_candidate(
        &self,
        session_id: &str,
        record: IceCandidateRecord,
    ) -> Result<CandidateDisposition, SignalingError> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| SignalingError::UnknownSession(session_id.to_string()))?;
        let mut session = handle.lock().await;
        if session.state().is_terminal() {
            return Err(SignalingError::UnknownSession(session_id.to_string()));
        }
        session.touch();
        let kind = record.kind().as_str();
        counter!("beach_buoy_candidates_received_total", 1, "kind" => kind);

        if !session.remote_description_set() {
            if let Some(evicted) = session.queue_candidate(record) {
                warn!(
                    session = %handle.key(),
                    evicted = %evicted.candidate,
                    "candidate queue full; dropped oldest"
                );
                counter!("beach_buoy_candidates_dropped_total", 1, "cause" => "overflow");
            }
            debug!(
                session = %handle.key(),
                kind,
                queued = session.pending_len(),
                "candidate queued"
            );
            return Ok(CandidateDisposition::Queued);
        }

        let key = handle.key().clone();
        match self.engine.add_remote_candidate(&key, &record).await {
            Ok(()) => {
                debug!(session = %key, kind, "candidate relayed");
                Ok(CandidateDisposition::Relayed)
            }
            Err(err) if err.is_transient() => {
                debug!(session = %key, error = %err, "relay failed; retrying once");
                session.defer_retry(record);
                drop(session);
                self.schedule_retry(key);
                Ok(CandidateDisposition::Deferred)
            }
            Err(err) => {
                warn!(session = %key, kind, error = %err, "candidate rejected by media engine");
                counter!("beach_buoy_candidates_dropped_total", 1, "cause" => "rejected");
                Ok(CandidateDisposition::Dropped)
            }
        }
    }

    /// Sets the remote-description flag and flushes everything queued so far.
    pub async fn mark_remote_description_set(
        &self,
        session_id: &str,
    ) -> Result<FlushReport, SignalingError> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| SignalingError::UnknownSession(session_id.to_string()))?;
        let mut session = handle.lock().await;
        if session.state().is_terminal() {
            return Err(SignalingError::UnknownSession(session_id.to_string()));
        }
        Ok(self.flush_pending(&mut session).await)
    }

    /// Explicit teardown. Unknown ids are not an error.
    pub async fn stop(&self, session_id: &str) -> bool {
        let stopped = self.supervisor.close(session_id).await;
        if !stopped {
            debug!(session = %session_id, "stop for unknown session");
        }
        stopped
    }

    pub async fn ice_configuration(
        &self,
        session_id: &str,
    ) -> Result<IceConfiguration, SignalingError> {
        let issuer = self.registry.issuer();
        let credential = issuer.ensure(session_id, Utc::now())?;
        if let Some(handle) = self.registry.get(session_id) {
            let mut session = handle.lock().await;
            if !session.state().is_terminal() {
                session.set_relay_credential(credential.clone());
                session.touch();
            }
        }
        Ok(issuer.ice_configuration(session_id, &credential))
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionSnapshot, SignalingError> {
        self.registry
            .snapshot(session_id)
            .await
            .ok_or_else(|| SignalingError::UnknownSession(session_id.to_string()))
    }

    /// Runs with the session lock held so later candidates cannot overtake
    /// queued ones.
    async fn flush_pending(&self, session: &mut Session) -> FlushReport {
        let key = session.key().clone();
        let pending = session.mark_remote_description_set();
        let mut report = FlushReport {
            attempted: pending.len(),
            ..FlushReport::default()
        };
        for record in pending {
            match self.engine.add_remote_candidate(&key, &record).await {
                Ok(()) => report.relayed += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        session = %key,
                        candidate = %record.candidate,
                        error = %err,
                        "queued candidate could not be relayed"
                    );
                }
            }
        }
        if report.failed > 0 {
            counter!(
                "beach_buoy_candidates_dropped_total",
                report.failed as u64,
                "cause" => "flush"
            );
        }
        report
    }

    fn schedule_retry(&self, key: SessionKey) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.config.relay_retry_delay).await;
            coordinator.retry_deferred(&key).await;
        });
    }

    async fn retry_deferred(&self, key: &SessionKey) {
        let Some(handle) = self.registry.get(&key.id) else {
            return;
        };
        if handle.key().generation != key.generation {
            return;
        }
        let mut session = handle.lock().await;
        if session.state().is_terminal() {
            return;
        }
        for record in session.take_retries() {
            if let Err(err) = self.engine.add_remote_candidate(key, &record).await {
                warn!(
                    session = %key,
                    candidate = %record.candidate,
                    error = %err,
                    "dropping candidate after retry"
                );
                counter!("beach_buoy_candidates_dropped_total", 1, "cause" => "retry");
            }
        }
    }
}
