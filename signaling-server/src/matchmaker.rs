//! Matchmaking between free doctors and waiting patients
//!
//! The matchmaker only *proposes*: a free doctor receives an advisory naming
//! the oldest waiting patient, and nothing is committed until that doctor
//! accepts a specific patient. The registry check at accept time is the
//! guard against double pairing.
//!
//! Outstanding advisories are tracked so that a patient is advertised to at
//! most one doctor at a time, and a doctor holds at most one advisory.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::client::ConnId;
use crate::registry::{Registry, RegistryError};

// ============================================================================
// Advisory
// ============================================================================

/// A proposed (not yet accepted) match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    pub doctor: ConnId,
    pub patient: ConnId,
    pub issued_at: Instant,
}

impl Advisory {
    fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.issued_at) >= timeout
    }
}

// ============================================================================
// Matchmaker
// ============================================================================

/// Tracks advisories and decides the next proposals
pub struct Matchmaker {
    /// Outstanding advisories keyed by doctor
    advisories: HashMap<ConnId, Advisory>,
    /// (doctor, patient) combinations whose advisory timed out
    declined: HashSet<(ConnId, ConnId)>,
    /// Retract unanswered advisories after this long (None = never)
    timeout: Option<Duration>,
}

impl Matchmaker {
    pub fn new(timeout: Option<Duration>) -> Self {
        Matchmaker {
            advisories: HashMap::new(),
            declined: HashSet::new(),
            timeout,
        }
    }

    /// Propose as many new matches as the registry allows.
    ///
    /// Waiting patients are visited oldest first and each unadvertised one is
    /// offered to the first free doctor (in registration order) that has no
    /// advisory yet. A doctor whose advisory for that patient timed out is
    /// passed over when another free doctor is available, otherwise the
    /// patient is offered to it again.
    pub fn run(&mut self, registry: &Registry, now: Instant) -> Vec<Advisory> {
        self.prune(registry);

        let advertised: HashSet<ConnId> = self
            .advisories
            .values()
            .map(|a| a.patient.clone())
            .collect();

        let mut free: Vec<ConnId> = registry
            .free_doctors()
            .filter(|doctor| !self.advisories.contains_key(*doctor))
            .cloned()
            .collect();

        let mut proposals = Vec::new();

        for patient in registry.list_waiting_patients() {
            if free.is_empty() {
                break;
            }
            if advertised.contains(&patient) {
                continue;
            }

            let pick = free
                .iter()
                .position(|doctor| !self.declined.contains(&(doctor.clone(), patient.clone())))
                .unwrap_or(0);
            let doctor = free.remove(pick);

            log::debug!("Proposing patient {} to doctor {}", patient, doctor);

            let advisory = Advisory {
                doctor: doctor.clone(),
                patient,
                issued_at: now,
            };
            self.advisories.insert(doctor, advisory.clone());
            proposals.push(advisory);
        }

        proposals
    }

    /// Doctor accepts a specific patient; commits the pairing in the registry.
    ///
    /// On success every advisory involving either side is dropped.
    pub fn accept(
        &mut self,
        registry: &mut Registry,
        doctor: &ConnId,
        patient: &ConnId,
    ) -> Result<(), RegistryError> {
        registry.mark_busy(doctor, patient)?;

        self.advisories
            .retain(|d, a| d != doctor && a.patient != *patient);
        self.declined
            .retain(|(d, p)| d != doctor && p != patient);
        Ok(())
    }

    /// Drop all matchmaking state for a connection that left
    pub fn forget(&mut self, conn_id: &ConnId) {
        self.advisories
            .retain(|d, a| d != conn_id && a.patient != *conn_id);
        self.declined
            .retain(|(d, p)| d != conn_id && p != conn_id);
    }

    /// Retract advisories older than the timeout.
    ///
    /// The (doctor, patient) combination is remembered so the next run
    /// offers the patient to someone else when another doctor is free.
    pub fn expire(&mut self, now: Instant) -> Vec<Advisory> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };

        let expired: Vec<ConnId> = self
            .advisories
            .iter()
            .filter(|(_, a)| a.is_expired(timeout, now))
            .map(|(d, _)| d.clone())
            .collect();

        let mut retracted = Vec::with_capacity(expired.len());
        for doctor in expired {
            if let Some(advisory) = self.advisories.remove(&doctor) {
                log::info!(
                    "Advisory for patient {} to doctor {} timed out",
                    advisory.patient,
                    advisory.doctor
                );
                self.declined
                    .insert((advisory.doctor.clone(), advisory.patient.clone()));
                retracted.push(advisory);
            }
        }
        retracted
    }

    /// When the next advisory would expire, if a timeout is configured.
    ///
    /// Deadlines past the representable range of `Instant` never fire.
    pub fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.timeout?;
        self.advisories
            .values()
            .filter_map(|a| a.issued_at.checked_add(timeout))
            .min()
    }

    /// Patient currently advertised to a doctor
    pub fn advisory_for(&self, doctor: &ConnId) -> Option<&ConnId> {
        self.advisories.get(doctor).map(|a| &a.patient)
    }

    /// Get number of outstanding advisories
    #[cfg(test)]
    pub fn advisory_count(&self) -> usize {
        self.advisories.len()
    }

    /// Drop advisories whose doctor is no longer free or patient no longer waiting
    fn prune(&mut self, registry: &Registry) {
        self.advisories.retain(|doctor, a| {
            registry.is_doctor_free(doctor) && registry.is_patient_waiting(&a.patient)
        });
    }
}

impl Default for Matchmaker {
    fn default() -> Self {
        Self::new(None)
    }
}
