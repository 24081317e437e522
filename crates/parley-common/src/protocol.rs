use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Content type of the conversation message that anchors a call.
pub const CALL_CONTENT_TYPE: &str = "application/call";

/// Signaling message exchanged between the two participants of a call.
///
/// On the wire this is the envelope `{"type": ..., "payload": ...}`. The
/// gateway never decodes it into this enum; it only checks that a frame is an
/// envelope and forwards the original text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum CallSignal {
    /// Sent by the gateway to both sides once the second connection registers.
    PeerJoined,
    Offer(SessionDescription),
    Answer(SessionDescription),
    /// Fresh offer while media is already flowing (e.g. screen share toggled).
    Renegotiate(SessionDescription),
    RenegotiateAnswer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl CallSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            CallSignal::PeerJoined => "peer-joined",
            CallSignal::Offer(_) => "offer",
            CallSignal::Answer(_) => "answer",
            CallSignal::Renegotiate(_) => "renegotiate",
            CallSignal::RenegotiateAnswer(_) => "renegotiate-answer",
            CallSignal::IceCandidate(_) => "ice-candidate",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the shape browsers produce with `RTCIceCandidate.toJSON()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Deserialize)]
struct EnvelopeShape {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    #[allow(dead_code)]
    payload: Option<IgnoredAny>,
}

/// Checks that `text` is a signaling envelope and returns its type tag.
///
/// The payload is skipped without being materialised.
pub fn envelope_kind(text: &str) -> Result<String> {
    let shape: EnvelopeShape = serde_json::from_str(text)?;
    if shape.kind.is_empty() {
        return Err(Error::protocol("envelope type must not be empty"));
    }
    Ok(shape.kind)
}

// REST payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallRequest {
    pub conversation_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallResponse {
    pub call_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatusResponse {
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Relay configuration handed to a participant before it builds its peer
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallConfigResponse {
    pub ice_servers: Vec<IceServerConfig>,
    pub username: String,
    pub credential: String,
    pub username_prefix: String,
    pub realm: String,
    pub relay_address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
