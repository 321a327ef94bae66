use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{MediaEngine, MediaError, TransportEvent, TransportEventSender, TransportState};
use crate::candidate::IceCandidateRecord;
use crate::credentials::{IceConfiguration, IceTransportPolicy, PortRange};
use crate::envelope::{SdpType, SessionDescription};
use crate::session::SessionKey;

#[derive(Debug, Clone)]
pub struct WebRtcSettings {
    pub port_range: PortRange,
    /// Upper bound for ICE disconnected/failed detection.
    pub ice_failed_timeout: Duration,
}

struct PeerEntry {
    generation: u64,
    pc: Arc<RTCPeerConnection>,
}

/// Terminates browser peers with webrtc-rs. Each session gets its own peer
/// connection carrying one send-only Opus track.
pub struct WebRtcMediaEngine {
    api: API,
    peers: DashMap<String, PeerEntry>,
    events: TransportEventSender,
}

impl WebRtcMediaEngine {
    pub fn new(settings: WebRtcSettings, events: TransportEventSender) -> Result<Self, MediaError> {
        let mut setting = SettingEngine::default();
        match EphemeralUDP::new(settings.port_range.min, settings.port_range.max) {
            Ok(ephemeral) => setting.set_udp_network(UDPNetwork::Ephemeral(ephemeral)),
            Err(err) => warn!(
                port_min = settings.port_range.min,
                port_max = settings.port_range.max,
                error = %err,
                "invalid ICE UDP port range; using defaults"
            ),
        }
        setting.set_ice_timeouts(
            Some(Duration::from_secs(5)),
            Some(settings.ice_failed_timeout),
            Some(Duration::from_secs(1)),
        );

        let mut codecs = CodecRegistry::default();
        codecs
            .register_default_codecs()
            .map_err(|err| MediaError::Internal(err.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs)
            .map_err(|err| MediaError::Internal(err.to_string()))?;

        let api = APIBuilder::new()
            .with_setting_engine(setting)
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            peers: DashMap::new(),
            events,
        })
    }

    async fn open_peer(
        &self,
        key: &SessionKey,
        ice: &IceConfiguration,
    ) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let config = rtc_configuration(ice);
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|err| MediaError::Internal(err.to_string()))?,
        );
        self.watch(key, &pc);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            format!("beach-buoy-{}", key.id),
        ));
        let sender = pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| MediaError::Internal(err.to_string()))?;
        // RTCP has to be read for interceptors to run.
        tokio::spawn(async move {
            let mut rtcp = vec![0u8; 1500];
            while sender.read(&mut rtcp).await.is_ok() {}
        });

        Ok(pc)
    }

    /// Claims the session's peer slot for `key`. An older incarnation is
    /// displaced and handed back for closing; a newer one wins.
    fn install(
        &self,
        key: &SessionKey,
        pc: &Arc<RTCPeerConnection>,
    ) -> Result<Option<Arc<RTCPeerConnection>>, MediaError> {
        let entry = PeerEntry {
            generation: key.generation,
            pc: Arc::clone(pc),
        };
        match self.peers.entry(key.id.clone()) {
            Entry::Occupied(existing) if existing.get().generation > key.generation => {
                Err(MediaError::Superseded(key.to_string()))
            }
            Entry::Occupied(mut existing) => Ok(Some(existing.insert(entry).pc)),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(None)
            }
        }
    }

    fn watch(&self, key: &SessionKey, pc: &Arc<RTCPeerConnection>) {
        let events = self.events.clone();
        let session = key.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = match state {
                RTCPeerConnectionState::New => Some(TransportState::New),
                RTCPeerConnectionState::Connecting => Some(TransportState::Checking),
                RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                _ => None,
            };
            debug!(session = %session, state = %state, "peer connection state changed");
            emit(&events, &session, mapped);
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let session = key.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let mapped = match state {
                RTCIceConnectionState::Checking => Some(TransportState::Checking),
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                    Some(TransportState::Connected)
                }
                RTCIceConnectionState::Disconnected => Some(TransportState::Disconnected),
                RTCIceConnectionState::Failed => Some(TransportState::Failed),
                _ => None,
            };
            debug!(session = %session, state = %state, "ice connection state changed");
            emit(&events, &session, mapped);
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let session = key.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            trace!(session = %session, state = %state, "ice gathering state changed");
            if state == RTCIceGathererState::Gathering {
                emit(&events, &session, Some(TransportState::Gathering));
            }
            Box::pin(async {})
        }));

        let session = key.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                debug!(
                    session = %session,
                    kind = %candidate.typ,
                    address = %candidate.address,
                    port = candidate.port,
                    "local candidate gathered"
                );
            }
            Box::pin(async {})
        }));
    }

    fn peer(&self, key: &SessionKey) -> Option<Arc<RTCPeerConnection>> {
        self.peers
            .get(&key.id)
            .filter(|entry| entry.generation == key.generation)
            .map(|entry| Arc::clone(&entry.pc))
    }
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn negotiate(
        &self,
        key: &SessionKey,
        offer: &SessionDescription,
        ice: &IceConfiguration,
    ) -> Result<SessionDescription, MediaError> {
        if offer.kind != SdpType::Offer {
            return Err(MediaError::Rejected(format!(
                "expected offer, got {}",
                offer.kind.as_str()
            )));
        }
        let remote = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|err| MediaError::Rejected(err.to_string()))?;

        let pc = self.open_peer(key, ice).await?;
        let displaced = match self.install(key, &pc) {
            Ok(displaced) => displaced,
            Err(err) => {
                debug!(session = %key, "negotiation superseded; discarding new peer");
                if let Err(close_err) = pc.close().await {
                    warn!(session = %key, error = %close_err, "closing superseded peer failed");
                }
                return Err(err);
            }
        };
        if let Some(previous) = displaced {
            if let Err(err) = previous.close().await {
                warn!(session = %key, error = %err, "closing replaced peer failed");
            }
        }

        pc.set_remote_description(remote)
            .await
            .map_err(|err| MediaError::Rejected(err.to_string()))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|err| MediaError::Internal(err.to_string()))?;

        // Answer is sent once gathering completes so it carries every local
        // candidate; the caller bounds the wait.
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|err| MediaError::Internal(err.to_string()))?;
        let _ = gathered.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| MediaError::Internal("local description missing".into()))?;
        info!(session = %key, "answer ready");
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn add_remote_candidate(
        &self,
        key: &SessionKey,
        candidate: &IceCandidateRecord,
    ) -> Result<(), MediaError> {
        let pc = self
            .peer(key)
            .ok_or_else(|| MediaError::UnknownPeer(key.to_string()))?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        match pc.add_ice_candidate(init).await {
            Ok(()) => Ok(()),
            Err(webrtc::Error::ErrNoRemoteDescription) => Err(MediaError::Transient(
                "remote description not applied yet".into(),
            )),
            Err(err) => Err(MediaError::Rejected(err.to_string())),
        }
    }

    async fn close(&self, key: &SessionKey) -> Result<(), MediaError> {
        let Some((_, entry)) = self
            .peers
            .remove_if(&key.id, |_, entry| entry.generation == key.generation)
        else {
            return Ok(());
        };
        entry
            .pc
            .close()
            .await
            .map_err(|err| MediaError::Internal(err.to_string()))?;
        debug!(session = %key, "peer connection closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webrtc"
    }
}

fn emit(events: &TransportEventSender, key: &SessionKey, state: Option<TransportState>) {
    let Some(state) = state else {
        return;
    };
    let _ = events.send(TransportEvent {
        key: key.clone(),
        state,
    });
}

fn rtc_configuration(ice: &IceConfiguration) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ice_transport_policy: match ice.ice_transport_policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ice_candidate_pool_size: ice.ice_candidate_pool_size,
        ..Default::default()
    }
}
