use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::credentials::{CredentialMode, IceTransportPolicy, IssuerConfig, PortRange};
use crate::media::WebRtcSettings;
use crate::supervisor::SupervisorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEngineKind {
    WebRtc,
    Loopback,
}

impl FromStr for MediaEngineKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "webrtc" => Ok(MediaEngineKind::WebRtc),
            "loopback" => Ok(MediaEngineKind::Loopback),
            other => Err(format!("unknown media engine: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub turn_host: String,
    pub turn_port: u16,
    pub turn_tls_port: u16,
    pub turn_tls: bool,
    pub turn_realm: String,
    pub turn_static_auth_secret: Option<String>,
    pub turn_username: String,
    pub turn_password: String,
    pub turn_credential_ttl_seconds: u64,
    pub stun_urls: Vec<String>,
    pub ice_transport_policy: IceTransportPolicy,
    pub ice_port_min: u16,
    pub ice_port_max: u16,
    pub session_idle_timeout_seconds: u64,
    pub session_sweep_interval_seconds: u64,
    pub disconnect_grace_ms: u64,
    pub negotiation_timeout_seconds: u64,
    pub candidate_queue_capacity: usize,
    pub relay_retry_delay_ms: u64,
    pub replace_connected_sessions: bool,
    pub synth_code_url: Option<String>,
    pub media_engine: MediaEngineKind,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparsable values
    /// fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        };
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Self {
            host: non_empty("BEACH_BUOY_HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "BEACH_BUOY_PORT").unwrap_or(defaults.port),
            turn_host: non_empty("TURN_HOST").unwrap_or(defaults.turn_host),
            turn_port: parsed(&lookup, "TURN_PORT").unwrap_or(defaults.turn_port),
            turn_tls_port: parsed(&lookup, "TURN_TLS_PORT").unwrap_or(defaults.turn_tls_port),
            turn_tls: flag("TURN_TLS", defaults.turn_tls),
            turn_realm: non_empty("TURN_REALM").unwrap_or(defaults.turn_realm),
            turn_static_auth_secret: non_empty("TURN_STATIC_AUTH_SECRET"),
            turn_username: lookup("TURN_USERNAME").unwrap_or(defaults.turn_username),
            turn_password: lookup("TURN_PASSWORD").unwrap_or(defaults.turn_password),
            turn_credential_ttl_seconds: parsed(&lookup, "TURN_CREDENTIAL_TTL")
                .unwrap_or(defaults.turn_credential_ttl_seconds),
            stun_urls: lookup("STUN_URLS")
                .map(|urls| {
                    urls.split(',')
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.stun_urls),
            ice_transport_policy: parsed(&lookup, "ICE_TRANSPORT_POLICY")
                .unwrap_or(defaults.ice_transport_policy),
            ice_port_min: parsed(&lookup, "ICE_PORT_MIN").unwrap_or(defaults.ice_port_min),
            ice_port_max: parsed(&lookup, "ICE_PORT_MAX").unwrap_or(defaults.ice_port_max),
            session_idle_timeout_seconds: parsed(&lookup, "SESSION_IDLE_TIMEOUT")
                .unwrap_or(defaults.session_idle_timeout_seconds),
            session_sweep_interval_seconds: parsed(&lookup, "SESSION_SWEEP_INTERVAL")
                .unwrap_or(defaults.session_sweep_interval_seconds),
            disconnect_grace_ms: parsed(&lookup, "DISCONNECT_GRACE_MS")
                .unwrap_or(defaults.disconnect_grace_ms),
            negotiation_timeout_seconds: parsed(&lookup, "NEGOTIATION_TIMEOUT")
                .unwrap_or(defaults.negotiation_timeout_seconds),
            candidate_queue_capacity: parsed(&lookup, "CANDIDATE_QUEUE_CAPACITY")
                .unwrap_or(defaults.candidate_queue_capacity),
            relay_retry_delay_ms: parsed(&lookup, "RELAY_RETRY_DELAY_MS")
                .unwrap_or(defaults.relay_retry_delay_ms),
            replace_connected_sessions: flag(
                "REPLACE_CONNECTED_SESSIONS",
                defaults.replace_connected_sessions,
            ),
            synth_code_url: non_empty("SYNTH_CODE_URL"),
            media_engine: parsed(&lookup, "MEDIA_ENGINE").unwrap_or(defaults.media_engine),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn port_range(&self) -> PortRange {
        PortRange {
            min: self.ice_port_min.min(self.ice_port_max),
            max: self.ice_port_max.max(self.ice_port_min),
        }
    }

    pub fn turn_urls(&self) -> Vec<String> {
        let mut urls = vec![format!(
            "turn:{}:{}?transport=udp",
            self.turn_host, self.turn_port
        )];
        if self.turn_tls {
            urls.push(format!("turns:{}:{}", self.turn_host, self.turn_tls_port));
        }
        urls
    }

    pub fn issuer_config(&self) -> IssuerConfig {
        let mode = match &self.turn_static_auth_secret {
            Some(secret) => CredentialMode::SharedSecret {
                secret: secret.clone(),
            },
            None => CredentialMode::Static {
                username: self.turn_username.clone(),
                password: self.turn_password.clone(),
            },
        };
        IssuerConfig {
            mode,
            realm: self.turn_realm.clone(),
            ttl: Duration::from_secs(self.turn_credential_ttl_seconds),
            turn_urls: self.turn_urls(),
            stun_urls: self.stun_urls.clone(),
            transport_policy: self.ice_transport_policy,
            port_range: self.port_range(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            disconnect_grace: Duration::from_millis(self.disconnect_grace_ms),
            negotiation_timeout: Duration::from_secs(self.negotiation_timeout_seconds),
            idle_timeout: Duration::from_secs(self.session_idle_timeout_seconds),
            sweep_interval: Duration::from_secs(self.session_sweep_interval_seconds.max(1)),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            negotiation_timeout: Duration::from_secs(self.negotiation_timeout_seconds),
            relay_retry_delay: Duration::from_millis(self.relay_retry_delay_ms),
            replace_connected_sessions: self.replace_connected_sessions,
        }
    }

    pub fn webrtc_settings(&self) -> WebRtcSettings {
        WebRtcSettings {
            port_range: self.port_range(),
            ice_failed_timeout: Duration::from_secs(self.negotiation_timeout_seconds),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|val| val.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            turn_host: "localhost".to_string(),
            turn_port: 3478,
            turn_tls_port: 5349,
            turn_tls: false,
            turn_realm: "beach-buoy".to_string(),
            turn_static_auth_secret: None,
            turn_username: String::new(),
            turn_password: String::new(),
            turn_credential_ttl_seconds: 3600,
            stun_urls: Vec::new(),
            ice_transport_policy: IceTransportPolicy::Relay,
            ice_port_min: 49152,
            ice_port_max: 49252,
            session_idle_timeout_seconds: 300,
            session_sweep_interval_seconds: 30,
            disconnect_grace_ms: 5000,
            negotiation_timeout_seconds: 30,
            candidate_queue_capacity: 64,
            relay_retry_delay_ms: 250,
            replace_connected_sessions: true,
            synth_code_url: None,
            media_engine: MediaEngineKind::WebRtc,
        }
    }
}
