//! Telehealth call peer
//!
//! A scripted doctor or patient that talks to the signaling server:
//! - Doctor: registers, accepts the first patient offered, answers offers
//! - Patient: asks for a call, sends an offer and a candidate once paired
//! - Either side can hang up after a fixed call duration
//!
//! Useful for smoke-testing a deployment without a browser.

use std::fmt;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

mod signaling;

use signaling::{Incoming, Outgoing, OutgoingCandidate, OutgoingDescription};

// ============================================================================
// Constants
// ============================================================================

/// Default signaling server URL
const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:5000";

/// How long a blocking read waits before the loop checks timers and signals
const READ_TIMEOUT: Duration = Duration::from_millis(200);

// ============================================================================
// Role
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Doctor,
    Patient,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "doctor" => Ok(Role::Doctor),
            "patient" => Ok(Role::Patient),
            other => Err(format!("unknown role '{}' (expected doctor or patient)", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Doctor => write!(f, "doctor"),
            Role::Patient => write!(f, "patient"),
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --server <ws-url>        Signaling server URL
    // --role <doctor|patient>  Which side of the call to play
    // --hangup-after <secs>    End the call this long after it starts
    // --list                   Doctor asks for the waiting list on startup

    let server_url = parse_arg(&args, "--server")
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
    let role: Role = parse_arg(&args, "--role")
        .ok_or("--role <doctor|patient> is required")?
        .parse()?;
    let hangup_after = match parse_arg(&args, "--hangup-after") {
        Some(secs) => Some(Duration::from_secs(
            secs.parse().map_err(|_| "Invalid --hangup-after value")?,
        )),
        None => None,
    };
    let list_waiting = args.iter().any(|a| a == "--list");

    log::info!("Call peer starting...");
    log::info!("  Server: {}", server_url);
    log::info!("  Role:   {}", role);
    if let Some(d) = hangup_after {
        log::info!("  Hangup: after {}s", d.as_secs());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;

    let (mut ws, _) = tungstenite::connect(server_url.as_str())?;
    if let MaybeTlsStream::Plain(stream) = ws.get_mut() {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
    }
    log::info!("Connected to {}", server_url);

    let mut peer = CallPeer::new(role, hangup_after, list_waiting);
    run(&mut ws, &mut peer, &shutdown)
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Event Loop
// ============================================================================

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

fn run(ws: &mut Socket, peer: &mut CallPeer, shutdown: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    send_all(ws, peer.on_open())?;

    while !peer.is_done() {
        if shutdown.load(Ordering::Relaxed) {
            log::info!("Shutdown requested");
            break;
        }

        send_all(ws, peer.on_tick(Instant::now()))?;
        if peer.is_done() {
            break;
        }

        match ws.read() {
            Ok(Message::Text(text)) => match Incoming::parse(&text) {
                Ok(event) => send_all(ws, peer.on_event(event, Instant::now()))?,
                Err(e) => log::warn!("Ignoring unrecognized server message: {}", e),
            },
            Ok(Message::Close(_)) => {
                log::info!("Server closed the connection");
                return Ok(());
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(tungstenite::Error::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }

    // Closing the socket is enough for the server to end any call in progress
    if let Err(e) = ws.close(None) {
        log::debug!("Close failed: {}", e);
    }
    while ws.flush().is_ok() {
        match ws.read() {
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

fn send_all(ws: &mut Socket, messages: Vec<Outgoing>) -> Result<(), Box<dyn std::error::Error>> {
    for msg in messages {
        let text = msg.to_text()?;
        log::debug!("-> {}", text);
        ws.send(Message::text(text))?;
    }
    Ok(())
}

// ============================================================================
// Call Peer State
// ============================================================================

/// Current call, if any
struct ActiveCall {
    peer: String,
    started_at: Instant,
}

/// Protocol behavior of one side of a call, independent of the socket
struct CallPeer {
    role: Role,
    /// ID the server assigned to this connection
    id: Option<String>,
    call: Option<ActiveCall>,
    hangup_after: Option<Duration>,
    list_waiting: bool,
    done: bool,
}

impl CallPeer {
    fn new(role: Role, hangup_after: Option<Duration>, list_waiting: bool) -> Self {
        CallPeer {
            role,
            id: None,
            call: None,
            hangup_after,
            list_waiting,
            done: false,
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    /// First messages after the socket opens
    fn on_open(&self) -> Vec<Outgoing> {
        match self.role {
            Role::Doctor if self.list_waiting => vec![Outgoing::RegisterDoctor, Outgoing::ListWaiting],
            Role::Doctor => vec![Outgoing::RegisterDoctor],
            Role::Patient => vec![Outgoing::RequestCall],
        }
    }

    /// Hang up once the call has lasted long enough
    fn on_tick(&mut self, now: Instant) -> Vec<Outgoing> {
        let (Some(call), Some(limit)) = (&self.call, self.hangup_after) else {
            return Vec::new();
        };
        if now.saturating_duration_since(call.started_at) < limit {
            return Vec::new();
        }

        log::info!("Hanging up on {} after {}s", call.peer, limit.as_secs());
        self.call_finished();
        vec![Outgoing::EndCall]
    }

    fn on_event(&mut self, event: Incoming, now: Instant) -> Vec<Outgoing> {
        match event {
            Incoming::Connected { id } => {
                log::info!("Assigned connection ID {}", id);
                self.id = Some(id);
                Vec::new()
            }

            Incoming::PatientWaiting(patient) => {
                if self.role != Role::Doctor || self.call.is_some() {
                    log::debug!("Ignoring advisory for {}", patient);
                    return Vec::new();
                }
                log::info!("Patient {} is waiting, accepting", patient);
                vec![Outgoing::AcceptPatient(patient)]
            }

            Incoming::CallAccepted(peer) => {
                log::info!("Call started with {}", peer);
                self.call = Some(ActiveCall {
                    peer: peer.clone(),
                    started_at: now,
                });

                match self.role {
                    // The patient side initiates the WebRTC negotiation
                    Role::Patient => vec![
                        Outgoing::Offer(OutgoingDescription {
                            payload: signaling::placeholder_description("offer", self.session()),
                            to: peer.clone(),
                        }),
                        Outgoing::IceCandidate(OutgoingCandidate {
                            candidate: signaling::placeholder_candidate(),
                            to: peer,
                        }),
                    ],
                    Role::Doctor => Vec::new(),
                }
            }

            Incoming::Offer(offer) => {
                log::info!("Received offer from {}", offer.from);
                vec![Outgoing::Answer(OutgoingDescription {
                    payload: signaling::placeholder_description("answer", self.session()),
                    to: offer.from,
                })]
            }

            Incoming::Answer(answer) => {
                log::info!("Received answer from {}", answer.from);
                Vec::new()
            }

            Incoming::IceCandidate(candidate) => {
                log::info!("Received ICE candidate from {}: {}", candidate.from, candidate.candidate);
                Vec::new()
            }

            Incoming::CallEnded => {
                log::info!("Call ended by peer");
                self.call_finished();
                Vec::new()
            }

            Incoming::WaitingPatients(patients) => {
                log::info!("{} patient(s) waiting: {:?}", patients.len(), patients);
                Vec::new()
            }
        }
    }

    /// Doctors stay available for the next patient, patients leave
    fn call_finished(&mut self) {
        self.call = None;
        match self.role {
            Role::Doctor => log::info!("Available for the next patient"),
            Role::Patient => self.done = true,
        }
    }

    fn session(&self) -> &str {
        self.id.as_deref().unwrap_or("0")
    }
}

// ============================================================================
// Tests
// ============================================================================
