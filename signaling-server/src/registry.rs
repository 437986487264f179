//! Connection registry for doctors, patients and their pairings
//!
//! The registry is the single source of truth for:
//! - Which live connections exist and which role they registered as
//! - The doctor pool, in registration order
//! - The FIFO queue of patients waiting for a call
//! - Which doctor is paired with which patient
//!
//! Role state is an explicit tagged variant, so a doctor can never be
//! "busy without a peer" or "free with a peer".

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::client::ConnId;

// ============================================================================
// Role State
// ============================================================================

/// State of a registered doctor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoctorState {
    /// Available for a new patient
    Free,
    /// In a call with the given patient
    Busy(ConnId),
}

/// State of a registered patient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatientState {
    /// Registered but not asking for a call (e.g. after a call ended)
    Idle,
    /// In the waiting queue
    Waiting,
    /// In a call with the given doctor
    Paired(ConnId),
}

/// Role a connection registered as. Set once, never changes kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Doctor(DoctorState),
    Patient(PatientState),
}

impl Role {
    /// The connection's current peer, if paired
    pub fn peer(&self) -> Option<&ConnId> {
        match self {
            Role::Doctor(DoctorState::Busy(peer)) => Some(peer),
            Role::Patient(PatientState::Paired(peer)) => Some(peer),
            _ => None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Reasons a registry mutation was refused. State is unchanged on error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No live connection with this ID
    UnknownConnection(ConnId),
    /// Connection already registered with the other role
    RoleConflict(ConnId),
    /// Connection is not a registered doctor
    NotADoctor(ConnId),
    /// Doctor already has a patient
    DoctorBusy(ConnId),
    /// Patient is not (or no longer) in the waiting queue
    PatientNotWaiting(ConnId),
    /// Patient is in a call and cannot queue again
    AlreadyPaired(ConnId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownConnection(id) => write!(f, "unknown connection {}", id),
            RegistryError::RoleConflict(id) => {
                write!(f, "connection {} already registered with another role", id)
            }
            RegistryError::NotADoctor(id) => write!(f, "connection {} is not a doctor", id),
            RegistryError::DoctorBusy(id) => write!(f, "doctor {} is already in a call", id),
            RegistryError::PatientNotWaiting(id) => write!(f, "patient {} is not waiting", id),
            RegistryError::AlreadyPaired(id) => write!(f, "patient {} is already in a call", id),
        }
    }
}

impl std::error::Error for RegistryError {}

// ============================================================================
// Registry Structure
// ============================================================================

/// Connection, doctor pool and waiting queue state
pub struct Registry {
    /// Every live connection; `None` until it registers a role
    connections: HashMap<ConnId, Option<Role>>,

    /// Registered doctors in registration order
    doctors: Vec<ConnId>,

    /// Waiting patients, oldest first
    waiting: VecDeque<ConnId>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Registry {
            connections: HashMap::new(),
            doctors: Vec::new(),
            waiting: VecDeque::new(),
        }
    }

    /// Record a live connection that has not registered a role yet
    pub fn connect(&mut self, conn_id: ConnId) {
        self.connections.entry(conn_id).or_insert(None);
    }

    /// Register (or re-register) a doctor as free.
    ///
    /// Re-registering a busy doctor unpairs it; the former patient is
    /// returned so the caller can notify it.
    pub fn register_doctor(&mut self, conn_id: &ConnId) -> Result<Option<ConnId>, RegistryError> {
        let entry = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| RegistryError::UnknownConnection(conn_id.clone()))?;

        match entry {
            None => {
                *entry = Some(Role::Doctor(DoctorState::Free));
                self.doctors.push(conn_id.clone());
                log::info!("Registered doctor {}", conn_id);
                Ok(None)
            }
            Some(Role::Doctor(DoctorState::Free)) => {
                log::debug!("Doctor {} re-announced availability", conn_id);
                Ok(None)
            }
            Some(Role::Doctor(DoctorState::Busy(_))) => Ok(self.mark_free(conn_id)),
            Some(Role::Patient(_)) => Err(RegistryError::RoleConflict(conn_id.clone())),
        }
    }

    /// Put a patient at the back of the waiting queue.
    ///
    /// Returns `Ok(false)` if the patient was already waiting.
    pub fn enqueue_patient(&mut self, conn_id: &ConnId) -> Result<bool, RegistryError> {
        let entry = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| RegistryError::UnknownConnection(conn_id.clone()))?;

        match entry {
            None | Some(Role::Patient(PatientState::Idle)) => {
                *entry = Some(Role::Patient(PatientState::Waiting));
                self.waiting.push_back(conn_id.clone());
                log::info!(
                    "Patient {} joined the waiting queue (position {})",
                    conn_id,
                    self.waiting.len()
                );
                Ok(true)
            }
            Some(Role::Patient(PatientState::Waiting)) => Ok(false),
            Some(Role::Patient(PatientState::Paired(_))) => {
                Err(RegistryError::AlreadyPaired(conn_id.clone()))
            }
            Some(Role::Doctor(_)) => Err(RegistryError::RoleConflict(conn_id.clone())),
        }
    }

    /// Commit a pairing between a free doctor and a waiting patient.
    ///
    /// This is the only place a pairing is created, and the check here is
    /// what keeps two doctors from taking the same patient.
    pub fn mark_busy(&mut self, doctor_id: &ConnId, patient_id: &ConnId) -> Result<(), RegistryError> {
        match self.connections.get(doctor_id) {
            None => return Err(RegistryError::UnknownConnection(doctor_id.clone())),
            Some(Some(Role::Doctor(DoctorState::Free))) => {}
            Some(Some(Role::Doctor(DoctorState::Busy(_)))) => {
                return Err(RegistryError::DoctorBusy(doctor_id.clone()))
            }
            Some(_) => return Err(RegistryError::NotADoctor(doctor_id.clone())),
        }

        match self.connections.get(patient_id) {
            Some(Some(Role::Patient(PatientState::Waiting))) => {}
            _ => return Err(RegistryError::PatientNotWaiting(patient_id.clone())),
        }

        self.waiting.retain(|id| id != patient_id);
        self.connections.insert(
            doctor_id.clone(),
            Some(Role::Doctor(DoctorState::Busy(patient_id.clone()))),
        );
        self.connections.insert(
            patient_id.clone(),
            Some(Role::Patient(PatientState::Paired(doctor_id.clone()))),
        );

        log::info!("Paired doctor {} with patient {}", doctor_id, patient_id);
        Ok(())
    }

    /// Return a busy doctor to the free pool; the patient goes idle.
    ///
    /// Returns the former patient, or `None` if the doctor was not busy.
    pub fn mark_free(&mut self, doctor_id: &ConnId) -> Option<ConnId> {
        let patient_id = match self.connections.get(doctor_id) {
            Some(Some(Role::Doctor(DoctorState::Busy(patient_id)))) => patient_id.clone(),
            _ => return None,
        };

        self.connections
            .insert(doctor_id.clone(), Some(Role::Doctor(DoctorState::Free)));

        if let Some(entry) = self.connections.get_mut(&patient_id) {
            if *entry == Some(Role::Patient(PatientState::Paired(doctor_id.clone()))) {
                *entry = Some(Role::Patient(PatientState::Idle));
            }
        }

        log::info!("Doctor {} is free again (was with {})", doctor_id, patient_id);
        Some(patient_id)
    }

    /// Purge a connection from the pool, the queue and any pairing.
    ///
    /// The surviving side of a pairing is reset (doctor free, patient idle).
    /// Returns the role the connection held. Safe to call repeatedly.
    pub fn remove_connection(&mut self, conn_id: &ConnId) -> Option<Role> {
        let role = self.connections.remove(conn_id)??;

        match &role {
            Role::Doctor(state) => {
                self.doctors.retain(|id| id != conn_id);
                if let DoctorState::Busy(patient_id) = state {
                    if let Some(entry) = self.connections.get_mut(patient_id) {
                        *entry = Some(Role::Patient(PatientState::Idle));
                    }
                }
                log::info!("Unregistered doctor {}", conn_id);
            }
            Role::Patient(state) => {
                self.waiting.retain(|id| id != conn_id);
                if let PatientState::Paired(doctor_id) = state {
                    if let Some(entry) = self.connections.get_mut(doctor_id) {
                        *entry = Some(Role::Doctor(DoctorState::Free));
                    }
                }
                log::info!("Unregistered patient {}", conn_id);
            }
        }

        Some(role)
    }

    // ------------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------------

    /// Whether the connection is live (registered or not)
    pub fn contains(&self, conn_id: &ConnId) -> bool {
        self.connections.contains_key(conn_id)
    }

    /// Registered role of a connection
    pub fn role_of(&self, conn_id: &ConnId) -> Option<&Role> {
        self.connections.get(conn_id).and_then(|r| r.as_ref())
    }

    pub fn is_doctor_free(&self, conn_id: &ConnId) -> bool {
        matches!(self.role_of(conn_id), Some(Role::Doctor(DoctorState::Free)))
    }

    pub fn is_patient_waiting(&self, conn_id: &ConnId) -> bool {
        matches!(self.role_of(conn_id), Some(Role::Patient(PatientState::Waiting)))
    }

    /// The connection's paired peer, if any
    pub fn peer_of(&self, conn_id: &ConnId) -> Option<&ConnId> {
        self.role_of(conn_id).and_then(Role::peer)
    }

    /// Waiting patients, oldest first
    pub fn list_waiting_patients(&self) -> Vec<ConnId> {
        self.waiting.iter().cloned().collect()
    }

    /// Registered doctors in registration order
    pub fn list_doctors(&self) -> &[ConnId] {
        &self.doctors
    }

    /// Free doctors in registration order
    pub fn free_doctors(&self) -> impl Iterator<Item = &ConnId> {
        self.doctors.iter().filter(|id| self.is_doctor_free(id))
    }

    /// Get the number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of waiting patients
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Get the number of active pairings
    pub fn active_calls(&self) -> usize {
        self.doctors
            .iter()
            .filter(|id| matches!(self.role_of(id), Some(Role::Doctor(DoctorState::Busy(_)))))
            .count()
    }

    /// Verify the structural invariants; used by tests after every step
    #[cfg(test)]
    pub fn check_invariants(&self) -> Result<(), String> {
        use std::collections::HashSet;

        let mut seen = HashSet::new();
        for id in &self.waiting {
            if !seen.insert(id) {
                return Err(format!("{} queued twice", id));
            }
            if !self.is_patient_waiting(id) {
                return Err(format!("{} queued but not in Waiting state", id));
            }
        }

        for (id, role) in &self.connections {
            match role {
                Some(Role::Patient(PatientState::Waiting)) if !self.waiting.contains(id) => {
                    return Err(format!("{} Waiting but not queued", id));
                }
                Some(Role::Doctor(_)) if !self.doctors.contains(id) => {
                    return Err(format!("doctor {} missing from pool", id));
                }
                Some(Role::Doctor(DoctorState::Busy(patient_id))) => {
                    if self.peer_of(patient_id) != Some(id) {
                        return Err(format!("pairing {} -> {} is not symmetric", id, patient_id));
                    }
                    if self.waiting.contains(patient_id) {
                        return Err(format!("busy doctor {} paired with queued {}", id, patient_id));
                    }
                }
                Some(Role::Patient(PatientState::Paired(doctor_id))) => {
                    if self.peer_of(doctor_id) != Some(id) {
                        return Err(format!("pairing {} -> {} is not symmetric", id, doctor_id));
                    }
                }
                _ => {}
            }
        }

        if self.doctors.len() != self.doctors.iter().collect::<HashSet<_>>().len() {
            return Err("doctor registered twice".to_string());
        }

        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ConnId {
        ConnId::from(name)
    }

    fn registry_with(ids: &[&str]) -> Registry {
        let mut registry = Registry::new();
        for name in ids {
            registry.connect(id(name));
        }
        registry
    }

    #[test]
    fn test_register_doctor_is_idempotent() {
        let mut registry = registry_with(&["d1"]);

        assert_eq!(registry.register_doctor(&id("d1")), Ok(None));
        assert_eq!(registry.register_doctor(&id("d1")), Ok(None));

        assert_eq!(registry.list_doctors().len(), 1);
        assert!(registry.is_doctor_free(&id("d1")));
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_register_unknown_connection() {
        let mut registry = Registry::new();
        assert_eq!(
            registry.register_doctor(&id("ghost")),
            Err(RegistryError::UnknownConnection(id("ghost")))
        );
    }

    #[test]
    fn test_enqueue_patient_once() {
        let mut registry = registry_with(&["p1"]);

        assert_eq!(registry.enqueue_patient(&id("p1")), Ok(true));
        assert_eq!(registry.enqueue_patient(&id("p1")), Ok(false));

        assert_eq!(registry.list_waiting_patients(), vec![id("p1")]);
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_role_is_fixed_after_registration() {
        let mut registry = registry_with(&["d1", "p1"]);
        registry.register_doctor(&id("d1")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();

        assert_eq!(
            registry.enqueue_patient(&id("d1")),
            Err(RegistryError::RoleConflict(id("d1")))
        );
        assert_eq!(
            registry.register_doctor(&id("p1")),
            Err(RegistryError::RoleConflict(id("p1")))
        );
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_mark_busy_pairs_symmetrically() {
        let mut registry = registry_with(&["d1", "p1"]);
        registry.register_doctor(&id("d1")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();

        registry.mark_busy(&id("d1"), &id("p1")).unwrap();

        assert_eq!(registry.peer_of(&id("d1")), Some(&id("p1")));
        assert_eq!(registry.peer_of(&id("p1")), Some(&id("d1")));
        assert!(!registry.is_doctor_free(&id("d1")));
        assert_eq!(registry.waiting_count(), 0);
        assert_eq!(registry.active_calls(), 1);
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_mark_busy_rejects_second_doctor() {
        let mut registry = registry_with(&["d1", "d2", "p1"]);
        registry.register_doctor(&id("d1")).unwrap();
        registry.register_doctor(&id("d2")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();

        registry.mark_busy(&id("d1"), &id("p1")).unwrap();
        assert_eq!(
            registry.mark_busy(&id("d2"), &id("p1")),
            Err(RegistryError::PatientNotWaiting(id("p1")))
        );

        assert!(registry.is_doctor_free(&id("d2")));
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_mark_busy_rejects_busy_doctor_and_non_doctor() {
        let mut registry = registry_with(&["d1", "p1", "p2"]);
        registry.register_doctor(&id("d1")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();
        registry.enqueue_patient(&id("p2")).unwrap();
        registry.mark_busy(&id("d1"), &id("p1")).unwrap();

        assert_eq!(
            registry.mark_busy(&id("d1"), &id("p2")),
            Err(RegistryError::DoctorBusy(id("d1")))
        );
        assert_eq!(
            registry.mark_busy(&id("p2"), &id("p2")),
            Err(RegistryError::NotADoctor(id("p2")))
        );
        assert!(registry.is_patient_waiting(&id("p2")));
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_mark_free_leaves_patient_idle() {
        let mut registry = registry_with(&["d1", "p1"]);
        registry.register_doctor(&id("d1")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();
        registry.mark_busy(&id("d1"), &id("p1")).unwrap();

        assert_eq!(registry.mark_free(&id("d1")), Some(id("p1")));
        assert_eq!(registry.mark_free(&id("d1")), None);

        assert!(registry.is_doctor_free(&id("d1")));
        assert_eq!(
            registry.role_of(&id("p1")),
            Some(&Role::Patient(PatientState::Idle))
        );
        assert_eq!(registry.waiting_count(), 0);
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_reregistering_busy_doctor_unpairs() {
        let mut registry = registry_with(&["d1", "p1"]);
        registry.register_doctor(&id("d1")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();
        registry.mark_busy(&id("d1"), &id("p1")).unwrap();

        assert_eq!(registry.register_doctor(&id("d1")), Ok(Some(id("p1"))));
        assert!(registry.is_doctor_free(&id("d1")));
        assert_eq!(registry.list_doctors().len(), 1);
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_idle_patient_can_queue_again() {
        let mut registry = registry_with(&["d1", "p1"]);
        registry.register_doctor(&id("d1")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();
        registry.mark_busy(&id("d1"), &id("p1")).unwrap();

        assert_eq!(
            registry.enqueue_patient(&id("p1")),
            Err(RegistryError::AlreadyPaired(id("p1")))
        );

        registry.mark_free(&id("d1"));
        assert_eq!(registry.enqueue_patient(&id("p1")), Ok(true));
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_paired_doctor_frees_patient() {
        let mut registry = registry_with(&["d1", "p1"]);
        registry.register_doctor(&id("d1")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();
        registry.mark_busy(&id("d1"), &id("p1")).unwrap();

        let removed = registry.remove_connection(&id("d1"));
        assert_eq!(removed, Some(Role::Doctor(DoctorState::Busy(id("p1")))));

        assert!(!registry.contains(&id("d1")));
        assert_eq!(registry.list_doctors().len(), 0);
        assert_eq!(registry.peer_of(&id("p1")), None);
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_paired_patient_frees_doctor() {
        let mut registry = registry_with(&["d1", "p1"]);
        registry.register_doctor(&id("d1")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();
        registry.mark_busy(&id("d1"), &id("p1")).unwrap();

        registry.remove_connection(&id("p1"));

        assert!(registry.is_doctor_free(&id("d1")));
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_waiting_patient_leaves_queue() {
        let mut registry = registry_with(&["p1", "p2"]);
        registry.enqueue_patient(&id("p1")).unwrap();
        registry.enqueue_patient(&id("p2")).unwrap();

        registry.remove_connection(&id("p1"));

        assert_eq!(registry.list_waiting_patients(), vec![id("p2")]);
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_connection_is_idempotent() {
        let mut registry = registry_with(&["d1", "d2", "p1", "p2"]);
        registry.register_doctor(&id("d1")).unwrap();
        registry.register_doctor(&id("d2")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();
        registry.enqueue_patient(&id("p2")).unwrap();
        registry.mark_busy(&id("d1"), &id("p1")).unwrap();

        registry.remove_connection(&id("d1"));
        let once = (
            registry.list_doctors().to_vec(),
            registry.list_waiting_patients(),
            registry.role_of(&id("p1")).cloned(),
            registry.connection_count(),
        );

        assert_eq!(registry.remove_connection(&id("d1")), None);
        let twice = (
            registry.list_doctors().to_vec(),
            registry.list_waiting_patients(),
            registry.role_of(&id("p1")).cloned(),
            registry.connection_count(),
        );

        assert_eq!(once, twice);
        assert_eq!(registry.remove_connection(&id("never-seen")), None);
        registry.check_invariants().unwrap();
    }

    #[test]
    fn test_unregistered_connection_is_removed_quietly() {
        let mut registry = registry_with(&["c1"]);

        assert_eq!(registry.remove_connection(&id("c1")), None);
        assert!(!registry.contains(&id("c1")));
    }

    #[test]
    fn test_free_doctors_in_registration_order() {
        let mut registry = registry_with(&["d1", "d2", "d3", "p1"]);
        registry.register_doctor(&id("d2")).unwrap();
        registry.register_doctor(&id("d1")).unwrap();
        registry.register_doctor(&id("d3")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();
        registry.mark_busy(&id("d1"), &id("p1")).unwrap();

        let free: Vec<_> = registry.free_doctors().cloned().collect();
        assert_eq!(free, vec![id("d2"), id("d3")]);
    }
}
