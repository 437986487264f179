//! Lightweight Prometheus-compatible metrics for the signaling server.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format for scraping on the metrics HTTP endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the signaling server.
pub struct Metrics {
    /// Live WebSocket connections (gauge)
    pub active_connections: AtomicU64,
    /// Registered doctors (gauge)
    pub registered_doctors: AtomicU64,
    /// Patients in the waiting queue (gauge)
    pub waiting_patients: AtomicU64,
    /// Doctor/patient pairings in progress (gauge)
    pub active_calls: AtomicU64,
    /// Total patient-waiting advisories sent (counter)
    pub advisories_sent_total: AtomicU64,
    /// Total accepted pairings (counter)
    pub calls_accepted_total: AtomicU64,
    /// Total accept-patient requests refused (counter)
    pub accept_rejections_total: AtomicU64,
    /// Total offer/answer/ice-candidate messages forwarded (counter)
    pub messages_relayed_total: AtomicU64,
    /// Total signaling messages dropped by the relay (counter)
    pub relay_drops_total: AtomicU64,
    /// Total calls ended, by hang-up or disconnect (counter)
    pub calls_ended_total: AtomicU64,
    /// Total inbound frames that failed to decode (counter)
    pub malformed_messages_total: AtomicU64,
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            registered_doctors: AtomicU64::new(0),
            waiting_patients: AtomicU64::new(0),
            active_calls: AtomicU64::new(0),
            advisories_sent_total: AtomicU64::new(0),
            calls_accepted_total: AtomicU64::new(0),
            accept_rejections_total: AtomicU64::new(0),
            messages_relayed_total: AtomicU64::new(0),
            relay_drops_total: AtomicU64::new(0),
            calls_ended_total: AtomicU64::new(0),
            malformed_messages_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Bump a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Overwrite a gauge
    pub fn set(gauge: &AtomicU64, value: usize) {
        gauge.store(value as u64, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP telehealth_active_connections Current number of live WebSocket connections\n\
             # TYPE telehealth_active_connections gauge\n\
             telehealth_active_connections {}\n\
             # HELP telehealth_registered_doctors Current number of registered doctors\n\
             # TYPE telehealth_registered_doctors gauge\n\
             telehealth_registered_doctors {}\n\
             # HELP telehealth_waiting_patients Current number of patients waiting for a call\n\
             # TYPE telehealth_waiting_patients gauge\n\
             telehealth_waiting_patients {}\n\
             # HELP telehealth_active_calls Current number of doctor/patient pairings\n\
             # TYPE telehealth_active_calls gauge\n\
             telehealth_active_calls {}\n\
             # HELP telehealth_advisories_sent_total Total patient-waiting advisories sent\n\
             # TYPE telehealth_advisories_sent_total counter\n\
             telehealth_advisories_sent_total {}\n\
             # HELP telehealth_calls_accepted_total Total pairings committed by accept-patient\n\
             # TYPE telehealth_calls_accepted_total counter\n\
             telehealth_calls_accepted_total {}\n\
             # HELP telehealth_accept_rejections_total Total accept-patient requests refused\n\
             # TYPE telehealth_accept_rejections_total counter\n\
             telehealth_accept_rejections_total {}\n\
             # HELP telehealth_messages_relayed_total Total signaling messages forwarded\n\
             # TYPE telehealth_messages_relayed_total counter\n\
             telehealth_messages_relayed_total {}\n\
             # HELP telehealth_relay_drops_total Total signaling messages dropped\n\
             # TYPE telehealth_relay_drops_total counter\n\
             telehealth_relay_drops_total {}\n\
             # HELP telehealth_calls_ended_total Total calls ended by hang-up or disconnect\n\
             # TYPE telehealth_calls_ended_total counter\n\
             telehealth_calls_ended_total {}\n\
             # HELP telehealth_malformed_messages_total Total inbound frames that failed to decode\n\
             # TYPE telehealth_malformed_messages_total counter\n\
             telehealth_malformed_messages_total {}\n\
             # HELP telehealth_uptime_seconds Server uptime in seconds\n\
             # TYPE telehealth_uptime_seconds gauge\n\
             telehealth_uptime_seconds {}\n",
            self.active_connections.load(Ordering::Relaxed),
            self.registered_doctors.load(Ordering::Relaxed),
            self.waiting_patients.load(Ordering::Relaxed),
            self.active_calls.load(Ordering::Relaxed),
            self.advisories_sent_total.load(Ordering::Relaxed),
            self.calls_accepted_total.load(Ordering::Relaxed),
            self.accept_rejections_total.load(Ordering::Relaxed),
            self.messages_relayed_total.load(Ordering::Relaxed),
            self.relay_drops_total.load(Ordering::Relaxed),
            self.calls_ended_total.load(Ordering::Relaxed),
            self.malformed_messages_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
