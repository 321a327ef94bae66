use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, warn};

use super::{MediaEngine, MediaError, TransportEvent, TransportEventSender, TransportState};
use crate::candidate::IceCandidateRecord;
use crate::credentials::IceConfiguration;
use crate::envelope::{SdpType, SessionDescription};
use crate::sdp::{inspect_offer, OfferSummary};
use crate::session::SessionKey;

/// Signaling-only engine. Answers are synthesized from the offer and relayed
/// candidates are recorded instead of being handed to an ICE agent.
#[derive(Default)]
pub struct LoopbackMediaEngine {
    peers: DashMap<String, u64>,
    relayed: DashMap<String, Vec<IceCandidateRecord>>,
    events: Option<TransportEventSender>,
    failing_relays: AtomicUsize,
    negotiation_delay_ms: AtomicU64,
}

impl LoopbackMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: TransportEventSender) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    /// Candidates relayed for `session_id`, in relay order.
    pub fn relayed(&self, session_id: &str) -> Vec<IceCandidateRecord> {
        self.relayed
            .get(session_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn has_peer(&self, session_id: &str) -> bool {
        self.peers.contains_key(session_id)
    }

    /// The next `count` relays fail with a transient error.
    pub fn fail_next_relays(&self, count: usize) {
        self.failing_relays.store(count, Ordering::SeqCst);
    }

    pub fn delay_negotiation(&self, delay: Duration) {
        self.negotiation_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Emits a transport report as if the peer had changed state.
    pub fn report(&self, key: &SessionKey, state: TransportState) {
        let Some(events) = &self.events else {
            warn!(session = %key, "loopback engine has no event channel");
            return;
        };
        let _ = events.send(TransportEvent {
            key: key.clone(),
            state,
        });
    }

    fn take_relay_failure(&self) -> bool {
        self.failing_relays
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MediaEngine for LoopbackMediaEngine {
    async fn negotiate(
        &self,
        key: &SessionKey,
        offer: &SessionDescription,
        _ice: &IceConfiguration,
    ) -> Result<SessionDescription, MediaError> {
        if offer.kind != SdpType::Offer {
            return Err(MediaError::Rejected(format!(
                "expected offer, got {}",
                offer.kind.as_str()
            )));
        }
        let summary =
            inspect_offer(&offer.sdp).map_err(|err| MediaError::Rejected(err.to_string()))?;

        let delay = self.negotiation_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match self.peers.entry(key.id.clone()) {
            Entry::Occupied(entry) if *entry.get() > key.generation => {
                debug!(session = %key, newer = *entry.get(), "negotiation superseded");
                return Err(MediaError::Superseded(key.to_string()));
            }
            Entry::Occupied(mut entry) => {
                entry.insert(key.generation);
            }
            Entry::Vacant(entry) => {
                entry.insert(key.generation);
            }
        }
        self.relayed.remove(&key.id);
        debug!(session = %key, "loopback answer synthesized");
        Ok(SessionDescription::answer(synthesize_answer(&summary)))
    }

    async fn add_remote_candidate(
        &self,
        key: &SessionKey,
        candidate: &IceCandidateRecord,
    ) -> Result<(), MediaError> {
        let current = self.peers.get(&key.id).map(|entry| *entry.value());
        if current != Some(key.generation) {
            return Err(MediaError::UnknownPeer(key.to_string()));
        }
        if self.take_relay_failure() {
            return Err(MediaError::Transient("injected relay failure".into()));
        }
        self.relayed
            .entry(key.id.clone())
            .or_default()
            .push(candidate.clone());
        Ok(())
    }

    async fn close(&self, key: &SessionKey) -> Result<(), MediaError> {
        if self
            .peers
            .remove_if(&key.id, |_, generation| *generation == key.generation)
            .is_some()
        {
            debug!(session = %key, "loopback peer closed");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(len)
        .collect()
}

fn synthesize_answer(offer: &OfferSummary) -> String {
    let ufrag = random_token(8);
    let pwd = random_token(24);
    let fingerprint = (0..32)
        .map(|_| format!("{:02X}", rand::random::<u8>()))
        .collect::<Vec<_>>()
        .join(":");

    let mut sdp = String::new();
    let _ = write!(
        sdp,
        "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
        rand::random::<u32>()
    );
    let accepted: Vec<&str> = offer
        .audio_sections()
        .filter_map(|section| section.mid.as_deref())
        .collect();
    if !accepted.is_empty() {
        let _ = write!(sdp, "a=group:BUNDLE {}\r\n", accepted.join(" "));
    }

    for section in &offer.media {
        let protos = section.protos.join("/");
        let formats = section.formats.join(" ");
        if section.is_active_audio() {
            let _ = write!(
                sdp,
                "m=audio 9 {protos} {formats}\r\n\
                 c=IN IP4 0.0.0.0\r\n\
                 a=ice-ufrag:{ufrag}\r\n\
                 a=ice-pwd:{pwd}\r\n\
                 a=fingerprint:sha-256 {fingerprint}\r\n\
                 a=setup:active\r\n"
            );
        } else {
            let _ = write!(sdp, "m={} 0 {protos} {formats}\r\nc=IN IP4 0.0.0.0\r\n", section.kind);
        }
        if let Some(mid) = &section.mid {
            let _ = write!(sdp, "a=mid:{mid}\r\n");
        }
        if section.is_active_audio() {
            sdp.push_str("a=sendonly\r\na=rtcp-mux\r\n");
        } else {
            sdp.push_str("a=inactive\r\n");
        }
    }
    sdp
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::credentials::test_issuer;
    use crate::sdp::fixtures::AUDIO_OFFER;

    fn ice() -> IceConfiguration {
        let issuer = test_issuer(StdDuration::from_secs(60));
        let credential = issuer.issue("abc").unwrap();
        issuer.ice_configuration("abc", &credential)
    }

    fn candidate() -> IceCandidateRecord {
        IceCandidateRecord {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_parses_and_accepts_audio() {
        let engine = LoopbackMediaEngine::new();
        let key = SessionKey::new("abc", 1);
        let answer = engine
            .negotiate(&key, &SessionDescription::offer(AUDIO_OFFER), &ice())
            .await
            .unwrap();
        assert_eq!(answer.kind, SdpType::Answer);
        let summary = inspect_offer(&answer.sdp).expect("answer is valid sdp");
        let audio: Vec<_> = summary.audio_sections().collect();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].direction.as_deref(), Some("sendonly"));
        assert_eq!(audio[0].mid.as_deref(), Some("0"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn relays_only_to_current_generation() {
        let engine = LoopbackMediaEngine::new();
        let key = SessionKey::new("abc", 3);
        assert!(matches!(
            engine.add_remote_candidate(&key, &candidate()).await,
            Err(MediaError::UnknownPeer(_))
        ));
        engine
            .negotiate(&key, &SessionDescription::offer(AUDIO_OFFER), &ice())
            .await
            .unwrap();
        engine.add_remote_candidate(&key, &candidate()).await.unwrap();
        assert!(engine
            .add_remote_candidate(&SessionKey::new("abc", 2), &candidate())
            .await
            .is_err());
        assert_eq!(engine.relayed("abc"), vec![candidate()]);

        engine.close(&SessionKey::new("abc", 2)).await.unwrap();
        assert!(engine.has_peer("abc"));
        engine.close(&key).await.unwrap();
        assert!(!engine.has_peer("abc"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn late_negotiation_of_older_generation_is_superseded() {
        let engine = LoopbackMediaEngine::new();
        let offer = SessionDescription::offer(AUDIO_OFFER);
        let newer = SessionKey::new("abc", 2);
        engine.negotiate(&newer, &offer, &ice()).await.unwrap();
        engine.add_remote_candidate(&newer, &candidate()).await.unwrap();

        let older = SessionKey::new("abc", 1);
        let result = engine.negotiate(&older, &offer, &ice()).await;
        assert!(matches!(result, Err(MediaError::Superseded(_))));

        engine.close(&older).await.unwrap();
        assert!(engine.has_peer("abc"));
        assert_eq!(engine.relayed("abc"), vec![candidate()]);
        engine.add_remote_candidate(&newer, &candidate()).await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn injected_failures_are_transient_and_counted_down() {
        let engine = LoopbackMediaEngine::new();
        let key = SessionKey::new("abc", 1);
        engine
            .negotiate(&key, &SessionDescription::offer(AUDIO_OFFER), &ice())
            .await
            .unwrap();
        engine.fail_next_relays(1);
        let err = engine
            .add_remote_candidate(&key, &candidate())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        engine.add_remote_candidate(&key, &candidate()).await.unwrap();
        assert_eq!(engine.relayed("abc").len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejects_answers_posted_as_offers() {
        let engine = LoopbackMediaEngine::new();
        let result = engine
            .negotiate(
                &SessionKey::new("abc", 1),
                &SessionDescription::answer(AUDIO_OFFER),
                &ice(),
            )
            .await;
        assert!(matches!(result, Err(MediaError::Rejected(_))));
    }
}
