//! Signaling events exchanged with doctors and patients
//!
//! Every WebSocket text frame carries one JSON event:
//!
//! ```text
//! { "event": "<kebab-case name>", "data": <payload> }
//! ```
//!
//! `data` is absent for events without a payload.
//!
//! # Call Flow
//!
//! ```text
//! Doctor                    Server                    Patient
//!   │── register-doctor ─────►│                          │
//!   │                         │◄──────── request-call ───│
//!   │◄──── patient-waiting ───│                          │
//!   │── accept-patient ──────►│                          │
//!   │◄──── call-accepted ─────│───── call-accepted ─────►│
//!   │                         │◄─────────────── offer ───│
//!   │◄─────────────── offer ──│                          │
//!   │── answer ──────────────►│                          │
//!   │                         │── answer ───────────────►│
//!   │◄───────── ice-candidate ┼ ice-candidate ──────────►│
//!   │── end-call ────────────►│                          │
//!   │                         │─────── call-ended ──────►│
//! ```
//!
//! SDP and candidate payloads are carried as opaque JSON values and are
//! never inspected by the server.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::ConnId;

// ============================================================================
// Constants
// ============================================================================

/// Default maximum size of one inbound event (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 65536;

// ============================================================================
// Client -> Server
// ============================================================================

/// Request to forward a session description to another connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionDescriptionRequest {
    /// Opaque SDP blob. May also arrive as `offer` or `answer`; a frame
    /// carrying more than one of these keys is rejected as a duplicate field.
    #[serde(alias = "offer", alias = "answer")]
    pub payload: Value,
    /// Destination connection
    pub to: ConnId,
}

/// Request to forward an ICE candidate to another connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IceCandidateRequest {
    /// Opaque candidate blob
    pub candidate: Value,
    /// Destination connection
    pub to: ConnId,
}

/// Events a client may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Doctor announces availability
    RegisterDoctor,
    /// Patient joins the waiting queue
    RequestCall,
    /// Doctor confirms a specific waiting patient
    AcceptPatient(ConnId),
    Offer(SessionDescriptionRequest),
    Answer(SessionDescriptionRequest),
    IceCandidate(IceCandidateRequest),
    /// Either side hangs up
    EndCall,
    /// Doctor pulls the current waiting list
    ListWaiting,
}

impl ClientMessage {
    /// Event name as it appears on the wire (for logging)
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::RegisterDoctor => "register-doctor",
            ClientMessage::RequestCall => "request-call",
            ClientMessage::AcceptPatient(_) => "accept-patient",
            ClientMessage::Offer(_) => "offer",
            ClientMessage::Answer(_) => "answer",
            ClientMessage::IceCandidate(_) => "ice-candidate",
            ClientMessage::EndCall => "end-call",
            ClientMessage::ListWaiting => "list-waiting",
        }
    }

    /// Reject messages that parsed but are missing required content
    fn validate(&self) -> Result<(), DecodeError> {
        let (blob, to, field) = match self {
            ClientMessage::Offer(req) | ClientMessage::Answer(req) => (&req.payload, &req.to, "payload"),
            ClientMessage::IceCandidate(req) => (&req.candidate, &req.to, "candidate"),
            ClientMessage::AcceptPatient(patient_id) if patient_id.as_str().is_empty() => {
                return Err(DecodeError::MissingField("data"));
            }
            _ => return Ok(()),
        };

        if blob.is_null() {
            return Err(DecodeError::MissingField(field));
        }
        if to.as_str().is_empty() {
            return Err(DecodeError::MissingField("to"));
        }
        Ok(())
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Connection identity sent right after the handshake
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connected {
    pub id: ConnId,
}

/// Relayed session description
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayedDescription {
    pub payload: Value,
    pub from: ConnId,
}

/// Relayed ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayedCandidate {
    pub candidate: Value,
    pub from: ConnId,
}

/// Events the server sends
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Connected(Connected),
    /// Advisory: this patient could be taken
    PatientWaiting(ConnId),
    /// Pairing committed; carries the peer's ID
    CallAccepted(ConnId),
    Offer(RelayedDescription),
    Answer(RelayedDescription),
    IceCandidate(RelayedCandidate),
    CallEnded,
    /// Reply to `list-waiting`, oldest first
    WaitingPatients(Vec<ConnId>),
}

// ============================================================================
// Encoding/Decoding
// ============================================================================

/// Encode a server event as a JSON text frame
pub fn encode_message(msg: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Decode and validate one inbound text frame
pub fn decode_message(text: &str, max_size: usize) -> Result<ClientMessage, DecodeError> {
    if text.len() > max_size {
        return Err(DecodeError::TooLarge(text.len()));
    }

    let msg: ClientMessage =
        serde_json::from_str(text).map_err(|e| DecodeError::Invalid(e.to_string()))?;
    msg.validate()?;
    Ok(msg)
}

/// Decode error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame larger than the configured limit
    TooLarge(usize),
    /// Not JSON, unknown event, or wrong shape
    Invalid(String),
    /// Field present in the schema but empty or null
    MissingField(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooLarge(len) => write!(f, "message too large: {} bytes", len),
            DecodeError::Invalid(msg) => write!(f, "invalid message: {}", msg),
            DecodeError::MissingField(field) => write!(f, "missing field '{}'", field),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Tests
// ============================================================================
