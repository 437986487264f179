//! Signaling events exchanged with the signaling server
//!
//! Every frame is one JSON object of the form `{"event": <name>, "data": <payload>}`.
//! Session descriptions and candidates are opaque here; this client only
//! fabricates placeholder ones so a call can be walked end to end without a
//! media stack.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Client -> Server
// ============================================================================

/// Offer or answer addressed to a peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingDescription {
    pub payload: Value,
    pub to: String,
}

/// ICE candidate addressed to a peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingCandidate {
    pub candidate: Value,
    pub to: String,
}

/// Events this client sends
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Outgoing {
    RegisterDoctor,
    RequestCall,
    AcceptPatient(String),
    Offer(OutgoingDescription),
    Answer(OutgoingDescription),
    IceCandidate(OutgoingCandidate),
    EndCall,
    ListWaiting,
}

impl Outgoing {
    /// Serialize to a text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Offer or answer relayed from a peer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IncomingDescription {
    pub payload: Value,
    pub from: String,
}

/// ICE candidate relayed from a peer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IncomingCandidate {
    pub candidate: Value,
    pub from: String,
}

/// Events the server sends
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Incoming {
    Connected { id: String },
    PatientWaiting(String),
    CallAccepted(String),
    Offer(IncomingDescription),
    Answer(IncomingDescription),
    IceCandidate(IncomingCandidate),
    CallEnded,
    WaitingPatients(Vec<String>),
}

impl Incoming {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ============================================================================
// Placeholder media descriptions
// ============================================================================

/// Session description shaped like a browser's RTCSessionDescriptionInit
pub fn placeholder_description(kind: &str, session: &str) -> Value {
    json!({
        "type": kind,
        "sdp": format!(
            "v=0\r\no=call-peer {} 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            session
        ),
    })
}

/// Host candidate shaped like a browser's RTCIceCandidateInit
pub fn placeholder_candidate() -> Value {
    json!({
        "candidate": "candidate:1 1 UDP 2122252543 127.0.0.1 9 typ host",
        "sdpMid": "0",
        "sdpMLineIndex": 0,
    })
}
