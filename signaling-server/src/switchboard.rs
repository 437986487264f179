//! Single owner of all call-matching state
//!
//! The event loop hands every decoded event to the [`Switchboard`], which
//! applies it to the registry and matchmaker within the same call and
//! returns the messages to deliver. Nothing else mutates matching state.

use std::sync::Arc;
use std::time::Instant;

use crate::client::ConnId;
use crate::lifecycle;
use crate::matchmaker::Matchmaker;
use crate::metrics::Metrics;
use crate::registry::{Registry, RegistryError, Role};
use crate::relay::{self, RelayDecision, RelayPolicy};
use crate::signaling::{
    ClientMessage, Connected, RelayedCandidate, RelayedDescription, ServerMessage,
};

/// A message addressed to one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: ConnId,
    pub message: ServerMessage,
}

impl Outbound {
    fn new(to: ConnId, message: ServerMessage) -> Self {
        Outbound { to, message }
    }
}

pub struct Switchboard {
    registry: Registry,
    matchmaker: Matchmaker,
    relay_policy: RelayPolicy,
    metrics: Arc<Metrics>,
}

impl Switchboard {
    pub fn new(relay_policy: RelayPolicy, matchmaker: Matchmaker) -> Self {
        Switchboard {
            registry: Registry::new(),
            matchmaker,
            relay_policy,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Shared with the metrics exporter thread
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Earliest instant at which [`Switchboard::tick`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.matchmaker.next_deadline()
    }

    /// A WebSocket finished its handshake
    pub fn connect(&mut self, conn_id: ConnId) -> Vec<Outbound> {
        self.registry.connect(conn_id.clone());
        self.sync_gauges();
        vec![Outbound::new(
            conn_id.clone(),
            ServerMessage::Connected(Connected { id: conn_id }),
        )]
    }

    /// Apply one inbound event
    pub fn handle(&mut self, from: &ConnId, msg: ClientMessage, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        if !self.registry.contains(from) {
            log::debug!("Ignoring {} from unknown connection {}", msg.name(), from);
            return out;
        }

        log::trace!("{} from {}", msg.name(), from);

        match msg {
            ClientMessage::RegisterDoctor => match self.registry.register_doctor(from) {
                Ok(Some(patient)) => {
                    log::info!("Doctor {} re-registered mid-call, ending call with {}", from, patient);
                    self.notify_call_ended(&mut out, patient);
                }
                Ok(None) => {
                    // A repeated announcement gets its pending advisory again
                    if let Some(patient) = self.matchmaker.advisory_for(from) {
                        log::debug!("Re-sending advisory for {} to {}", patient, from);
                        out.push(Outbound::new(
                            from.clone(),
                            ServerMessage::PatientWaiting(patient.clone()),
                        ));
                    }
                }
                Err(e) => log::warn!("register-doctor from {} refused: {}", from, e),
            },

            ClientMessage::RequestCall => match self.registry.enqueue_patient(from) {
                Ok(true) => {}
                Ok(false) => log::debug!("Patient {} already waiting", from),
                Err(e @ RegistryError::AlreadyPaired(_)) => log::debug!("request-call ignored: {}", e),
                Err(e) => log::warn!("request-call from {} refused: {}", from, e),
            },

            ClientMessage::AcceptPatient(patient) => {
                match self.matchmaker.accept(&mut self.registry, from, &patient) {
                    Ok(()) => {
                        Metrics::incr(&self.metrics.calls_accepted_total);
                        log::info!("Doctor {} accepted patient {}", from, patient);
                        out.push(Outbound::new(
                            from.clone(),
                            ServerMessage::CallAccepted(patient.clone()),
                        ));
                        out.push(Outbound::new(patient, ServerMessage::CallAccepted(from.clone())));
                    }
                    Err(e) => {
                        Metrics::incr(&self.metrics.accept_rejections_total);
                        log::debug!("accept-patient from {} ignored: {}", from, e);
                    }
                }
            }

            ClientMessage::Offer(req) => {
                let message = ServerMessage::Offer(RelayedDescription {
                    payload: req.payload,
                    from: from.clone(),
                });
                self.relay(&mut out, from, req.to, message);
            }

            ClientMessage::Answer(req) => {
                let message = ServerMessage::Answer(RelayedDescription {
                    payload: req.payload,
                    from: from.clone(),
                });
                self.relay(&mut out, from, req.to, message);
            }

            ClientMessage::IceCandidate(req) => {
                let message = ServerMessage::IceCandidate(RelayedCandidate {
                    candidate: req.candidate,
                    from: from.clone(),
                });
                self.relay(&mut out, from, req.to, message);
            }

            ClientMessage::EndCall => match lifecycle::end_call(&mut self.registry, from) {
                Some(peer) => {
                    log::info!("{} ended the call with {}", from, peer);
                    self.notify_call_ended(&mut out, peer);
                }
                None => log::debug!("end-call from {} with no active call", from),
            },

            ClientMessage::ListWaiting => match self.registry.role_of(from) {
                Some(Role::Doctor(_)) => out.push(Outbound::new(
                    from.clone(),
                    ServerMessage::WaitingPatients(self.registry.list_waiting_patients()),
                )),
                _ => log::debug!("list-waiting from non-doctor {} ignored", from),
            },
        }

        self.run_matchmaker(&mut out, now);
        self.sync_gauges();
        out
    }

    /// The transport for a connection closed
    pub fn disconnect(&mut self, conn_id: &ConnId, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        if let Some(peer) = lifecycle::disconnect(&mut self.registry, &mut self.matchmaker, conn_id) {
            log::info!("{} disconnected during a call with {}", conn_id, peer);
            self.notify_call_ended(&mut out, peer);
        }

        self.run_matchmaker(&mut out, now);
        self.sync_gauges();
        out
    }

    /// Expire stale advisories and re-run matchmaking
    pub fn tick(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        if self.matchmaker.expire(now).is_empty() {
            return out;
        }
        self.run_matchmaker(&mut out, now);
        self.sync_gauges();
        out
    }

    /// Count an inbound frame that could not be decoded
    pub fn record_malformed(&self) {
        Metrics::incr(&self.metrics.malformed_messages_total);
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn relay(&mut self, out: &mut Vec<Outbound>, from: &ConnId, to: ConnId, message: ServerMessage) {
        match relay::check(&self.registry, self.relay_policy, from, &to) {
            RelayDecision::Forward => {
                Metrics::incr(&self.metrics.messages_relayed_total);
                out.push(Outbound::new(to, message));
            }
            decision => {
                Metrics::incr(&self.metrics.relay_drops_total);
                log::debug!("Dropped signaling from {} to {}: {:?}", from, to, decision);
            }
        }
    }

    fn notify_call_ended(&mut self, out: &mut Vec<Outbound>, peer: ConnId) {
        Metrics::incr(&self.metrics.calls_ended_total);
        out.push(Outbound::new(peer, ServerMessage::CallEnded));
    }

    fn run_matchmaker(&mut self, out: &mut Vec<Outbound>, now: Instant) {
        for advisory in self.matchmaker.run(&self.registry, now) {
            Metrics::incr(&self.metrics.advisories_sent_total);
            out.push(Outbound::new(
                advisory.doctor,
                ServerMessage::PatientWaiting(advisory.patient),
            ));
        }
    }

    fn sync_gauges(&self) {
        Metrics::set(&self.metrics.active_connections, self.registry.connection_count());
        Metrics::set(&self.metrics.registered_doctors, self.registry.list_doctors().len());
        Metrics::set(&self.metrics.waiting_patients, self.registry.waiting_count());
        Metrics::set(&self.metrics.active_calls, self.registry.active_calls());
    }
}
