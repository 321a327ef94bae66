//! Relay credential issuing.
//!
//! Credentials follow the TURN REST scheme coturn implements with
//! `use-auth-secret`: the username embeds its own expiry and the password is
//! `base64(HMAC-SHA1(secret, username))`. The TURN server validates them on its
//! own; this module only mints them and keeps per-session bookkeeping so a
//! session never hands out a stale pair.

use std::{str::FromStr, sync::Arc, time::Duration};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use thiserror::Error;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

const NONCE_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("relay credential for session {0} has expired")]
    Expired(String),
    #[error("no relay credential issued for session {0}")]
    Unknown(String),
    #[error("credential ttl out of range")]
    Ttl,
    #[error("invalid shared secret")]
    Secret,
}

#[derive(Debug, Clone)]
pub enum CredentialMode {
    /// coturn `static-auth-secret`
    SharedSecret { secret: String },
    /// coturn `user=` entries; expiry is bookkeeping only
    Static { username: String, password: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    All,
    Relay,
}

impl FromStr for IceTransportPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(IceTransportPolicy::All),
            "relay" => Ok(IceTransportPolicy::Relay),
            other => Err(format!("unknown ice transport policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuerConfig {
    pub mode: CredentialMode,
    pub realm: String,
    pub ttl: Duration,
    pub turn_urls: Vec<String>,
    pub stun_urls: Vec<String>,
    pub transport_policy: IceTransportPolicy,
    pub port_range: PortRange,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayCredential {
    pub username: String,
    pub credential: String,
    pub realm: String,
    pub expires_at: DateTime<Utc>,
}

impl RelayCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// What `/config` hands the browser for its `RTCPeerConnection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfiguration {
    pub session_id: String,
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: String,
    pub rtcp_mux_policy: String,
    pub ice_candidate_pool_size: u8,
    pub port_range: PortRange,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RelayCredentialIssuer {
    config: Arc<IssuerConfig>,
    issued: Arc<DashMap<String, RelayCredential>>,
}

impl RelayCredentialIssuer {
    pub fn new(config: IssuerConfig) -> Self {
        Self {
            config: Arc::new(config),
            issued: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    pub fn issue(&self, session_id: &str) -> Result<RelayCredential, CredentialError> {
        self.issue_at(session_id, Utc::now())
    }

    /// Mints a fresh pair and replaces whatever was recorded for the session.
    pub fn issue_at(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RelayCredential, CredentialError> {
        let ttl = chrono::Duration::from_std(self.config.ttl).map_err(|_| CredentialError::Ttl)?;
        let expires_at = now + ttl;

        let credential = match &self.config.mode {
            CredentialMode::SharedSecret { secret } => {
                let username = format!(
                    "{}:{}.{}",
                    expires_at.timestamp(),
                    session_id,
                    generate_nonce()
                );
                let password = sign(secret, &username)?;
                RelayCredential {
                    username,
                    credential: password,
                    realm: self.config.realm.clone(),
                    expires_at,
                }
            }
            CredentialMode::Static { username, password } => RelayCredential {
                username: username.clone(),
                credential: password.clone(),
                realm: self.config.realm.clone(),
                expires_at,
            },
        };

        debug!(
            session = %session_id,
            username = %credential.username,
            realm = %credential.realm,
            expires_at = %credential.expires_at,
            "issued relay credential"
        );
        self.issued
            .insert(session_id.to_string(), credential.clone());
        Ok(credential)
    }

    pub fn current(&self, session_id: &str) -> Option<RelayCredential> {
        self.issued.get(session_id).map(|entry| entry.value().clone())
    }

    /// Fails with `Expired` if the recorded credential is past its window or the
    /// username is not the one most recently issued.
    pub fn validate(
        &self,
        session_id: &str,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CredentialError> {
        let Some(current) = self.current(session_id) else {
            return Err(CredentialError::Unknown(session_id.to_string()));
        };
        if current.username != username || current.is_expired(now) {
            return Err(CredentialError::Expired(session_id.to_string()));
        }
        Ok(())
    }

    /// Returns the session's credential, rotating it if it is missing or expired.
    pub fn ensure(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RelayCredential, CredentialError> {
        match self.current(session_id) {
            Some(current) => match self.validate(session_id, &current.username, now) {
                Ok(()) => Ok(current),
                Err(CredentialError::Expired(_)) => {
                    debug!(session = %session_id, "rotating expired relay credential");
                    self.issue_at(session_id, now)
                }
                Err(err) => Err(err),
            },
            None => self.issue_at(session_id, now),
        }
    }

    pub fn invalidate(&self, session_id: &str) -> bool {
        self.issued.remove(session_id).is_some()
    }

    /// Drops bookkeeping for credentials that expired without a session
    /// claiming them.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.issued.len();
        self.issued.retain(|_, credential| !credential.is_expired(now));
        before.saturating_sub(self.issued.len())
    }

    pub fn ice_configuration(
        &self,
        session_id: &str,
        credential: &RelayCredential,
    ) -> IceConfiguration {
        let mut ice_servers = Vec::new();
        if !self.config.stun_urls.is_empty() {
            ice_servers.push(IceServer {
                urls: self.config.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.config.turn_urls.is_empty() {
            ice_servers.push(IceServer {
                urls: self.config.turn_urls.clone(),
                username: Some(credential.username.clone()),
                credential: Some(credential.credential.clone()),
            });
        }

        IceConfiguration {
            session_id: session_id.to_string(),
            ice_servers,
            ice_transport_policy: self.config.transport_policy,
            bundle_policy: "max-bundle".to_string(),
            rtcp_mux_policy: "require".to_string(),
            ice_candidate_pool_size: 1,
            port_range: self.config.port_range,
            expires_at: credential.expires_at,
        }
    }
}

fn sign(secret: &str, username: &str) -> Result<String, CredentialError> {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).map_err(|_| CredentialError::Secret)?;
    mac.update(username.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(NONCE_LEN)
        .collect()
}

#[cfg(test)]
pub(crate) fn test_issuer(ttl: Duration) -> RelayCredentialIssuer {
    RelayCredentialIssuer::new(IssuerConfig {
        mode: CredentialMode::SharedSecret {
            secret: "north-shore".into(),
        },
        realm: "beach-buoy.test".into(),
        ttl,
        turn_urls: vec!["turn:turn.test:3478?transport=udp".into()],
        stun_urls: vec!["stun:stun.test:3478".into()],
        transport_policy: IceTransportPolicy::Relay,
        port_range: PortRange {
            min: 49152,
            max: 49252,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn shared_secret_credential_matches_turn_rest_scheme() {
        let issuer = test_issuer(Duration::from_secs(600));
        let now = Utc::now();
        let credential = issuer.issue_at("abc", now).unwrap();

        let (expiry, user) = credential.username.split_once(':').unwrap();
        let expected = (now + chrono::Duration::seconds(600)).timestamp();
        assert_eq!(expiry.parse::<i64>().unwrap(), expected);
        assert!(user.starts_with("abc."));

        let mut mac = HmacSha1::new_from_slice(b"north-shore").unwrap();
        mac.update(credential.username.as_bytes());
        let expected = STANDARD.encode(mac.finalize().into_bytes());
        assert_eq!(credential.credential, expected);
        assert_eq!(credential.realm, "beach-buoy.test");
    }

    #[test_timeout::timeout]
    fn reissue_replaces_prior_credential() {
        let issuer = test_issuer(Duration::from_secs(600));
        let now = Utc::now();
        let first = issuer.issue_at("abc", now).unwrap();
        let second = issuer.issue_at("abc", now).unwrap();
        assert_ne!(first.username, second.username);
        assert!(matches!(
            issuer.validate("abc", &first.username, now),
            Err(CredentialError::Expired(_))
        ));
        assert!(issuer.validate("abc", &second.username, now).is_ok());
    }

    #[test_timeout::timeout]
    fn ensure_rotates_expired_credentials() {
        let issuer = test_issuer(Duration::from_secs(60));
        let now = Utc::now();
        let first = issuer.ensure("abc", now).unwrap();
        let same = issuer.ensure("abc", now + chrono::Duration::seconds(30)).unwrap();
        assert_eq!(first.username, same.username);

        let later = now + chrono::Duration::seconds(61);
        assert!(matches!(
            issuer.validate("abc", &first.username, later),
            Err(CredentialError::Expired(_))
        ));
        let rotated = issuer.ensure("abc", later).unwrap();
        assert_ne!(rotated.username, first.username);
        assert!(!rotated.is_expired(later));
    }

    #[test_timeout::timeout]
    fn invalidate_and_purge() {
        let issuer = test_issuer(Duration::from_secs(60));
        let now = Utc::now();
        issuer.issue_at("a", now).unwrap();
        issuer.issue_at("b", now).unwrap();
        assert!(issuer.invalidate("a"));
        assert!(!issuer.invalidate("a"));
        assert!(matches!(
            issuer.validate("a", "whatever", now),
            Err(CredentialError::Unknown(_))
        ));
        assert_eq!(issuer.purge_expired(now + chrono::Duration::seconds(120)), 1);
        assert!(issuer.current("b").is_none());
    }

    #[test_timeout::timeout]
    fn static_mode_hands_out_configured_pair() {
        let issuer = RelayCredentialIssuer::new(IssuerConfig {
            mode: CredentialMode::Static {
                username: "buoy".into(),
                password: "hunter2hunter2".into(),
            },
            realm: "beach-buoy.test".into(),
            ttl: Duration::from_secs(60),
            turn_urls: vec!["turn:turn.test:3478?transport=udp".into()],
            stun_urls: Vec::new(),
            transport_policy: IceTransportPolicy::All,
            port_range: PortRange { min: 1, max: 2 },
        });
        let credential = issuer.issue("abc").unwrap();
        assert_eq!(credential.username, "buoy");
        assert_eq!(credential.credential, "hunter2hunter2");

        let config = issuer.ice_configuration("abc", &credential);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_transport_policy, IceTransportPolicy::All);
    }

    #[test_timeout::timeout]
    fn ice_configuration_serializes_browser_shape() {
        let issuer = test_issuer(Duration::from_secs(60));
        let credential = issuer.issue("abc").unwrap();
        let value = serde_json::to_value(issuer.ice_configuration("abc", &credential)).unwrap();
        assert_eq!(value["iceTransportPolicy"], "relay");
        assert_eq!(value["bundlePolicy"], "max-bundle");
        assert_eq!(value["rtcpMuxPolicy"], "require");
        assert_eq!(value["iceCandidatePoolSize"], 1);
        assert_eq!(value["portRange"]["min"], 49152);
        assert_eq!(value["iceServers"][0]["urls"][0], "stun:stun.test:3478");
        assert!(value["iceServers"][0].get("username").is_none());
        assert_eq!(value["iceServers"][1]["username"], credential.username);
    }

    #[test_timeout::timeout]
    fn parses_transport_policy() {
        assert_eq!("Relay".parse::<IceTransportPolicy>(), Ok(IceTransportPolicy::Relay));
        assert_eq!("all".parse::<IceTransportPolicy>(), Ok(IceTransportPolicy::All));
        assert!("none".parse::<IceTransportPolicy>().is_err());
    }
}
