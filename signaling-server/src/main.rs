//! Telehealth Signaling Server
//!
//! A WebSocket server that:
//! - Tracks doctor availability and the patient waiting queue
//! - Proposes the oldest waiting patient to the first free doctor
//! - Commits a pairing only when the doctor accepts
//! - Relays WebRTC offer/answer/ICE-candidate messages between peers
//! - Ends calls cleanly on hang-up or disconnect
//!
//! Matching and relaying run on one thread: each poll event is handled to
//! completion before the next one, so matching decisions never interleave.
//! The optional metrics exporter reads shared counters from its own thread.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use ring::rand::SystemRandom;

mod client;
mod config;
mod exporter;
mod lifecycle;
mod matchmaker;
mod metrics;
mod registry;
mod relay;
mod signaling;
mod switchboard;

use client::{Client, ConnId, Timeouts};
use config::ServerConfig;
use matchmaker::Matchmaker;
use switchboard::{Outbound, Switchboard};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the WebSocket listener
const LISTENER_TOKEN: Token = Token(0);

/// First token handed to accepted streams
const FIRST_STREAM_TOKEN: usize = 1;

/// Longest the loop sleeps before checking timers and the shutdown flag
const MAX_POLL_WAIT: Duration = Duration::from_millis(250);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();
    let config = ServerConfig::from_args(&args)?;

    log::info!("Telehealth signaling server starting...");
    log::info!("  Listen:   ws://{}", config.listen_addr);
    match config.metrics_addr {
        Some(addr) => log::info!("  Metrics:  http://{}/metrics", addr),
        None => log::info!("  Metrics:  disabled"),
    }
    log::info!("  Relay:    {}", config.relay_policy);
    match config.advisory_timeout {
        Some(timeout) => log::info!("  Advisory: expires after {}s", timeout.as_secs()),
        None => log::info!("  Advisory: never expires"),
    }

    // SIGINT/SIGTERM flip the flag; the loop notices within MAX_POLL_WAIT
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;

    let mut server = Server::new(config, shutdown)?;
    server.run()
}

// ============================================================================
// Server Structure
// ============================================================================

struct Server {
    /// mio poll instance
    poll: Poll,
    /// WebSocket listener
    listener: TcpListener,
    /// Connected clients (by mio token)
    clients: HashMap<Token, Client>,
    /// Reverse lookup from connection ID to token
    tokens: HashMap<ConnId, Token>,
    /// Call-matching state
    switchboard: Switchboard,
    /// Random number generator for connection IDs
    rng: SystemRandom,
    /// Next unused mio token
    next_token: usize,
    /// Largest inbound event accepted
    max_message_size: usize,
    /// Handshake and keepalive deadlines
    timeouts: Timeouts,
    /// Set by the signal handlers
    shutdown: Arc<AtomicBool>,
}

impl Server {
    fn new(config: ServerConfig, shutdown: Arc<AtomicBool>) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;

        let mut listener = TcpListener::bind(config.listen_addr)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        log::info!("Server listening on {}", listener.local_addr()?);

        let matchmaker = Matchmaker::new(config.advisory_timeout);
        let switchboard = Switchboard::new(config.relay_policy, matchmaker);

        if let Some(addr) = config.metrics_addr {
            let bound = exporter::spawn(addr, Arc::clone(switchboard.metrics()))?;
            log::info!("Metrics listening on {}", bound);
        }

        Ok(Server {
            poll,
            listener,
            clients: HashMap::new(),
            tokens: HashMap::new(),
            switchboard,
            rng: SystemRandom::new(),
            next_token: FIRST_STREAM_TOKEN,
            max_message_size: config.max_message_size,
            timeouts: config.timeouts,
            shutdown,
        })
    }

    fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(1024);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.close_all();
                log::info!("Shutdown complete");
                return Ok(());
            }

            // Wake up for the next advisory deadline, but never sleep long
            let timeout = self
                .switchboard
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .map_or(MAX_POLL_WAIT, |wait| wait.min(MAX_POLL_WAIT));

            // Poll for events
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_clients()?,
                    token => self.process_client(token, event.is_writable()),
                }
            }

            // Expire stale advisories
            let outbound = self.switchboard.tick(Instant::now());
            self.deliver(outbound);

            // Stalled handshakes and silent peers
            self.process_timeouts();

            // Clean up closed connections
            self.cleanup_closed();
        }
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn accept_clients(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (mut stream, from) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Per-connection failures (e.g. ECONNABORTED) must not stop the server
                    log::warn!("Failed to accept connection: {}", e);
                    break;
                }
            };

            let token = self.allocate_token();
            if let Err(e) = self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                log::warn!("Failed to register stream from {}: {}", from, e);
                continue;
            }

            let conn_id = self.new_conn_id()?;
            log::info!("New connection from {} (id={})", from, conn_id);

            let mut client = Client::new(conn_id.clone(), stream, from);
            let opened = client.take_opened();
            self.tokens.insert(conn_id, token);
            self.clients.insert(token, client);

            if opened {
                self.on_open(token);
            }
        }

        Ok(())
    }

    fn new_conn_id(&self) -> Result<ConnId, Box<dyn std::error::Error>> {
        loop {
            let conn_id = ConnId::generate(&self.rng)
                .map_err(|_| "Failed to generate connection ID")?;
            if !self.tokens.contains_key(&conn_id) {
                return Ok(conn_id);
            }
        }
    }

    fn process_client(&mut self, token: Token, writable: bool) {
        let (opened, texts) = match self.clients.get_mut(&token) {
            Some(client) => {
                client.drive_handshake();
                if writable {
                    client.flush();
                }
                let opened = client.take_opened();
                (opened, client.read_messages())
            }
            None => return,
        };

        if opened {
            self.on_open(token);
        }

        let conn_id = match self.clients.get(&token) {
            Some(client) => client.id.clone(),
            None => return,
        };

        for text in texts {
            self.handle_text(&conn_id, &text);
        }
    }

    /// WebSocket handshake finished: tell the switchboard and the client
    fn on_open(&mut self, token: Token) {
        let conn_id = match self.clients.get(&token) {
            Some(client) => {
                log::debug!(
                    "WebSocket open for {} after {:?}",
                    client.id,
                    client.connected_at.elapsed()
                );
                client.id.clone()
            }
            None => return,
        };

        let outbound = self.switchboard.connect(conn_id);
        self.deliver(outbound);
    }

    fn handle_text(&mut self, conn_id: &ConnId, text: &str) {
        log::trace!("Received {} bytes from {}", text.len(), conn_id);

        match signaling::decode_message(text, self.max_message_size) {
            Ok(msg) => {
                let outbound = self.switchboard.handle(conn_id, msg, Instant::now());
                self.deliver(outbound);
            }
            Err(e) => {
                self.switchboard.record_malformed();
                log::warn!("Dropping malformed message from {}: {}", conn_id, e);
            }
        }
    }

    /// Best-effort delivery; messages to vanished connections are dropped
    fn deliver(&mut self, outbound: Vec<Outbound>) {
        for Outbound { to, message } in outbound {
            let client = match self.tokens.get(&to).and_then(|t| self.clients.get_mut(t)) {
                Some(client) => client,
                None => {
                    log::debug!("Dropping message for departed connection {}", to);
                    continue;
                }
            };

            let text = match signaling::encode_message(&message) {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to encode message for {}: {}", to, e);
                    continue;
                }
            };

            if !client.send_text(text) {
                log::debug!("Send to {} failed, connection will be closed", to);
            }
        }
    }

    fn process_timeouts(&mut self) {
        let now = Instant::now();
        for client in self.clients.values_mut() {
            client.check_timeouts(now, &self.timeouts);
        }
    }

    fn cleanup_closed(&mut self) {
        // Disconnect notifications can fail and close further clients
        loop {
            let closed: Vec<Token> = self
                .clients
                .iter()
                .filter(|(_, c)| c.is_closed())
                .map(|(token, _)| *token)
                .collect();

            if closed.is_empty() {
                break;
            }

            for token in closed {
                let Some(client) = self.clients.remove(&token) else {
                    continue;
                };
                self.tokens.remove(&client.id);

                log::info!(
                    "Connection closed: {} ({}, up {}s)",
                    client.id,
                    client.peer_addr,
                    client.connected_at.elapsed().as_secs()
                );

                if client.was_announced() {
                    let outbound = self.switchboard.disconnect(&client.id, Instant::now());
                    self.deliver(outbound);
                }
            }
        }
    }

    fn close_all(&mut self) {
        log::info!("Closing {} connections", self.clients.len());
        for client in self.clients.values_mut() {
            client.close();
        }
    }
}
