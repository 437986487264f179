//! Client management for the signaling server
//!
//! Each accepted TCP stream becomes a [`Client`] that walks through the
//! WebSocket handshake and then carries one JSON event per text frame.

use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tungstenite::handshake::server::NoCallback;
use tungstenite::handshake::MidHandshake;
use tungstenite::{HandshakeError, Message, ServerHandshake, WebSocket};

// ============================================================================
// Connection ID
// ============================================================================

/// Number of random bytes in a connection ID (hex encoded on the wire)
const CONN_ID_LEN: usize = 16;

/// Opaque identifier of one live connection.
///
/// Assigned at accept time and never reused while the process runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(String);

impl ConnId {
    /// Draw a fresh random connection ID
    pub fn generate(rng: &SystemRandom) -> Result<Self, ring::error::Unspecified> {
        let mut bytes = [0u8; CONN_ID_LEN];
        rng.fill(&mut bytes)?;
        Ok(ConnId(bytes.iter().map(|b| format!("{:02x}", b)).collect()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnId {
    fn from(id: &str) -> Self {
        ConnId(id.to_string())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Timeouts
// ============================================================================

/// Handshake must complete within this long by default
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ping a quiet client after this long by default
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-connection deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Drop a stream that has not finished the WebSocket upgrade
    pub handshake: Duration,
    /// Ping after this much silence; drop after twice this much
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            idle: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// What a keepalive check asks the caller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    SendPing,
    Expired,
}

/// Inbound activity on an open WebSocket.
///
/// Any frame, pongs included, counts as activity. A half-open peer never
/// answers the ping and expires.
#[derive(Debug, Clone)]
pub struct Keepalive {
    last_seen: Instant,
    ping_sent: bool,
}

impl Keepalive {
    pub fn new(now: Instant) -> Self {
        Keepalive {
            last_seen: now,
            ping_sent: false,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.ping_sent = false;
    }

    pub fn check(&mut self, now: Instant, idle: Duration) -> Liveness {
        let quiet = now.saturating_duration_since(self.last_seen);
        if quiet >= idle.saturating_mul(2) {
            Liveness::Expired
        } else if quiet >= idle && !self.ping_sent {
            self.ping_sent = true;
            Liveness::SendPing
        } else {
            Liveness::Alive
        }
    }
}

// ============================================================================
// Transport State
// ============================================================================

type PendingHandshake = MidHandshake<ServerHandshake<TcpStream, NoCallback>>;

enum Transport {
    /// HTTP upgrade not finished yet (non-blocking socket ran dry)
    Handshaking(PendingHandshake),
    /// WebSocket established
    Open(WebSocket<TcpStream>),
    /// Peer went away or the stream failed
    Closed,
}

// ============================================================================
// Client Structure
// ============================================================================

/// Represents a connected WebSocket client
pub struct Client {
    /// Connection ID handed to the registry
    pub id: ConnId,
    /// Remote address of the TCP stream
    pub peer_addr: SocketAddr,
    /// When the TCP stream was accepted
    pub connected_at: Instant,
    transport: Transport,
    /// Whether the switchboard has been told about this connection
    announced: bool,
    keepalive: Keepalive,
}

impl Client {
    /// Create a new client from an accepted stream and start the handshake
    pub fn new(id: ConnId, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let transport = advance(tungstenite::accept(stream), &id);
        let now = Instant::now();
        Client {
            id,
            peer_addr,
            connected_at: now,
            transport,
            announced: false,
            keepalive: Keepalive::new(now),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.transport, Transport::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.transport, Transport::Closed)
    }

    /// Whether the client ever got past the handshake and was announced
    pub fn was_announced(&self) -> bool {
        self.announced
    }

    /// Continue a pending handshake, if any
    pub fn drive_handshake(&mut self) {
        match mem::replace(&mut self.transport, Transport::Closed) {
            Transport::Handshaking(mid) => {
                self.transport = advance(mid.handshake(), &self.id);
            }
            other => self.transport = other,
        }
    }

    /// Returns true exactly once, the first time the WebSocket is open
    pub fn take_opened(&mut self) -> bool {
        if self.is_open() && !self.announced {
            self.announced = true;
            self.keepalive = Keepalive::new(Instant::now());
            return true;
        }
        false
    }

    /// Drain every complete text frame currently readable.
    ///
    /// Control frames are answered by tungstenite itself. Marks the client
    /// closed when the peer hangs up or the stream errors.
    pub fn read_messages(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        let mut closed = false;

        if let Transport::Open(ws) = &mut self.transport {
            loop {
                let frame = ws.read();
                if frame.is_ok() {
                    self.keepalive.touch(Instant::now());
                }

                match frame {
                    Ok(Message::Text(text)) => texts.push(text),
                    Ok(Message::Binary(data)) => {
                        log::warn!("Dropping {} byte binary frame from {}", data.len(), self.id);
                    }
                    Ok(Message::Close(frame)) => {
                        log::debug!("Close frame from {}: {:?}", self.id, frame);
                    }
                    Ok(_) => {}
                    Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                        break;
                    }
                    Err(tungstenite::Error::ConnectionClosed)
                    | Err(tungstenite::Error::AlreadyClosed) => {
                        closed = true;
                        break;
                    }
                    Err(e) => {
                        log::debug!("WebSocket read error from {}: {}", self.id, e);
                        closed = true;
                        break;
                    }
                }
            }

            // Pongs and close replies queued by read() still need to go out
            if !closed {
                closed = !flush_socket(ws, &self.id);
            }
        }

        if closed {
            self.transport = Transport::Closed;
        }
        texts
    }

    /// Queue a text frame. Returns false if the client can no longer be written to.
    pub fn send_text(&mut self, text: String) -> bool {
        let ok = match &mut self.transport {
            Transport::Open(ws) => match ws.send(Message::text(text)) {
                Ok(()) => true,
                // Frame is buffered; the next WRITABLE event flushes it
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => true,
                Err(e) => {
                    log::debug!("WebSocket send error to {}: {}", self.id, e);
                    false
                }
            },
            _ => return false,
        };

        if !ok {
            self.transport = Transport::Closed;
        }
        ok
    }

    /// Push buffered frames after the socket became writable again
    pub fn flush(&mut self) {
        let ok = match &mut self.transport {
            Transport::Open(ws) => flush_socket(ws, &self.id),
            _ => return,
        };
        if !ok {
            self.transport = Transport::Closed;
        }
    }

    /// Enforce the handshake deadline and the keepalive.
    ///
    /// Marks the client closed when a deadline passed; the caller's cleanup
    /// pass then treats it like any other disconnect.
    pub fn check_timeouts(&mut self, now: Instant, timeouts: &Timeouts) {
        let expired = match &mut self.transport {
            Transport::Handshaking(_) => {
                let waited = now.saturating_duration_since(self.connected_at);
                if waited >= timeouts.handshake {
                    log::info!("Handshake timed out for {} ({})", self.id, self.peer_addr);
                    true
                } else {
                    false
                }
            }
            Transport::Open(ws) => match self.keepalive.check(now, timeouts.idle) {
                Liveness::Alive => false,
                Liveness::SendPing => {
                    log::debug!("Pinging quiet connection {}", self.id);
                    match ws.send(Message::Ping(Vec::new())) {
                        Ok(()) => false,
                        Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => false,
                        Err(e) => {
                            log::debug!("Ping to {} failed: {}", self.id, e);
                            true
                        }
                    }
                }
                Liveness::Expired => {
                    log::info!("Connection {} went silent, closing", self.id);
                    true
                }
            },
            Transport::Closed => false,
        };

        if expired {
            self.transport = Transport::Closed;
        }
    }

    /// Start a clean close (used on server shutdown)
    pub fn close(&mut self) {
        if let Transport::Open(ws) = &mut self.transport {
            if let Err(e) = ws.close(None) {
                log::debug!("Failed to queue close frame for {}: {}", self.id, e);
            }
            let _ = flush_socket(ws, &self.id);
        }
    }
}

fn advance(
    result: Result<WebSocket<TcpStream>, HandshakeError<ServerHandshake<TcpStream, NoCallback>>>,
    id: &ConnId,
) -> Transport {
    match result {
        Ok(ws) => Transport::Open(ws),
        Err(HandshakeError::Interrupted(mid)) => Transport::Handshaking(mid),
        Err(HandshakeError::Failure(e)) => {
            log::debug!("WebSocket handshake failed for {}: {}", id, e);
            Transport::Closed
        }
    }
}

/// Returns false when the stream is unusable
fn flush_socket(ws: &mut WebSocket<TcpStream>, id: &ConnId) -> bool {
    match ws.flush() {
        Ok(()) => true,
        Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => false,
        Err(e) => {
            log::debug!("WebSocket flush error for {}: {}", id, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_hex_and_distinct() {
        let rng = SystemRandom::new();
        let a = ConnId::generate(&rng).unwrap();
        let b = ConnId::generate(&rng).unwrap();

        assert_eq!(a.as_str().len(), CONN_ID_LEN * 2);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_keepalive_pings_once_then_expires() {
        let start = Instant::now();
        let idle = Duration::from_secs(30);
        let mut keepalive = Keepalive::new(start);

        assert_eq!(keepalive.check(start + Duration::from_secs(29), idle), Liveness::Alive);
        assert_eq!(keepalive.check(start + Duration::from_secs(30), idle), Liveness::SendPing);
        assert_eq!(keepalive.check(start + Duration::from_secs(45), idle), Liveness::Alive);
        assert_eq!(keepalive.check(start + Duration::from_secs(60), idle), Liveness::Expired);
    }

    #[test]
    fn test_keepalive_activity_resets_deadline() {
        let start = Instant::now();
        let idle = Duration::from_secs(30);
        let mut keepalive = Keepalive::new(start);

        assert_eq!(keepalive.check(start + Duration::from_secs(31), idle), Liveness::SendPing);
        keepalive.touch(start + Duration::from_secs(40));

        assert_eq!(keepalive.check(start + Duration::from_secs(65), idle), Liveness::Alive);
        assert_eq!(keepalive.check(start + Duration::from_secs(70), idle), Liveness::SendPing);
    }

    #[test]
    fn test_keepalive_huge_idle_never_expires() {
        let start = Instant::now();
        let mut keepalive = Keepalive::new(start);

        let liveness = keepalive.check(start + Duration::from_secs(3600), Duration::MAX);
        assert_eq!(liveness, Liveness::Alive);
    }

    #[test]
    fn test_stalled_handshake_is_closed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, from) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        // Peer never sends the upgrade request
        let mut client = Client::new(ConnId::from("slow"), TcpStream::from_std(accepted), from);
        assert!(!client.is_open());
        assert!(!client.is_closed());

        let timeouts = Timeouts::default();
        client.check_timeouts(client.connected_at + Duration::from_secs(1), &timeouts);
        assert!(!client.is_closed());

        client.check_timeouts(client.connected_at + timeouts.handshake, &timeouts);
        assert!(client.is_closed());
        assert!(!client.was_announced());
    }

    #[test]
    fn test_conn_id_serializes_as_plain_string() {
        let id = ConnId::from("abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc123\"");

        let back: ConnId = serde_json::from_str("\"abc123\"").unwrap();
        assert_eq!(back, id);
    }
}
