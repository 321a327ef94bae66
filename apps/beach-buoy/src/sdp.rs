//! Offer inspection ahead of negotiation.
//!
//! Offers are parsed with the `sdp` crate that ships with webrtc-rs so a
//! malformed description is rejected at the HTTP boundary instead of deep
//! inside the media engine.

use std::io::Cursor;

use thiserror::Error;
use webrtc::sdp::description::session::SessionDescription as ParsedSdp;

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("offer sdp is empty")]
    Empty,
    #[error("offer sdp could not be parsed: {0}")]
    Parse(String),
    #[error("offer has no active audio section")]
    MissingAudio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: String,
    pub port: isize,
    pub protos: Vec<String>,
    pub formats: Vec<String>,
    pub mid: Option<String>,
    pub direction: Option<String>,
}

impl MediaSection {
    pub fn is_active_audio(&self) -> bool {
        self.kind == "audio" && self.port != 0
    }
}

#[derive(Debug, Clone)]
pub struct OfferSummary {
    pub media: Vec<MediaSection>,
    pub bundle: Option<String>,
}

impl OfferSummary {
    pub fn audio_sections(&self) -> impl Iterator<Item = &MediaSection> {
        self.media.iter().filter(|m| m.is_active_audio())
    }
}

/// Parses `sdp` and requires at least one audio section with a non-zero port.
pub fn inspect_offer(sdp: &str) -> Result<OfferSummary, OfferError> {
    if sdp.trim().is_empty() {
        return Err(OfferError::Empty);
    }

    let mut reader = Cursor::new(sdp.as_bytes());
    let parsed =
        ParsedSdp::unmarshal(&mut reader).map_err(|err| OfferError::Parse(err.to_string()))?;

    let bundle = parsed
        .attributes
        .iter()
        .find(|attr| attr.key == "group")
        .and_then(|attr| attr.value.clone());

    let media = parsed
        .media_descriptions
        .iter()
        .map(|md| {
            let mut mid = None;
            let mut direction = None;
            for attr in &md.attributes {
                match attr.key.as_str() {
                    "mid" => mid = attr.value.clone(),
                    "sendrecv" | "sendonly" | "recvonly" | "inactive" => {
                        direction = Some(attr.key.clone())
                    }
                    _ => {}
                }
            }
            MediaSection {
                kind: md.media_name.media.clone(),
                port: md.media_name.port.value,
                protos: md.media_name.protos.clone(),
                formats: md.media_name.formats.clone(),
                mid,
                direction,
            }
        })
        .collect::<Vec<_>>();

    let summary = OfferSummary { media, bundle };
    if summary.audio_sections().next().is_none() {
        return Err(OfferError::MissingAudio);
    }
    Ok(summary)
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Trimmed-down Chrome offer with a single receive-only Opus section.
    pub const AUDIO_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
a=msid-semantic: WMS\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=ice-ufrag:Pq3n\r\n\
a=ice-pwd:hM2Vt2yX0h7kQx3lVd0ZcJ9F\r\n\
a=fingerprint:sha-256 0F:74:31:25:CB:A2:13:EC:28:6F:6D:2C:61:FF:5D:C2:BC:B9:DB:3D:98:14:8D:1A:BB:EA:33:0C:A4:60:A8:8E\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=recvonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n";

    pub const VIDEO_ONLY_OFFER: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=rtpmap:96 VP8/90000\r\n";
}
