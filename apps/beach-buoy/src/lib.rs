//! WebRTC signaling and session lifecycle for browser audio peers.
//!
//! Browsers fetch a per-session ICE configuration, post an SDP offer and
//! trickle their ICE candidates over plain HTTP. The [`coordinator`] turns
//! that into a negotiated peer, the [`supervisor`] follows the transport until
//! it ends and the [`registry`] keeps exactly one live incarnation per id.

pub mod candidate;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod media;
pub mod registry;
pub mod sdp;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod synth;
pub mod telemetry;

use std::sync::Arc;

use crate::config::Config;
use crate::coordinator::SignalingCoordinator;
use crate::credentials::RelayCredentialIssuer;
use crate::media::{MediaEngine, TransportEventReceiver};
use crate::registry::SessionRegistry;
use crate::supervisor::ConnectionSupervisor;

/// Wires registry, supervisor and coordinator around `engine`.
pub fn build_coordinator(config: &Config, engine: Arc<dyn MediaEngine>) -> SignalingCoordinator {
    let issuer = RelayCredentialIssuer::new(config.issuer_config());
    let registry = SessionRegistry::new(issuer, config.candidate_queue_capacity);
    let supervisor =
        ConnectionSupervisor::new(registry.clone(), engine.clone(), config.supervisor_config());
    SignalingCoordinator::new(registry, engine, supervisor, config.coordinator_config())
}

/// Background tasks that must be aborted on shutdown.
pub struct BackgroundTasks {
    pub events: tokio::task::JoinHandle<()>,
    pub sweeper: tokio::task::JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn start(coordinator: &SignalingCoordinator, events: TransportEventReceiver) -> Self {
        let supervisor = coordinator.supervisor();
        Self {
            events: supervisor.spawn(events),
            sweeper: supervisor.spawn_sweeper(),
        }
    }

    pub fn abort(self) {
        self.events.abort();
        self.sweeper.abort();
    }
}
