//! Call termination and disconnect handling
//!
//! Both paths unwind the pairing, put the doctor back in the free pool and
//! report which peer must be told the call ended. Re-running matchmaking is
//! left to the caller.

use crate::client::ConnId;
use crate::matchmaker::Matchmaker;
use crate::registry::{DoctorState, PatientState, Registry, Role};

/// End the call the connection is in, if any.
///
/// Returns the peer that should receive `call-ended`.
pub fn end_call(registry: &mut Registry, conn_id: &ConnId) -> Option<ConnId> {
    match registry.role_of(conn_id)? {
        Role::Doctor(DoctorState::Busy(_)) => registry.mark_free(conn_id),
        Role::Patient(PatientState::Paired(doctor_id)) => {
            let doctor_id = doctor_id.clone();
            registry.mark_free(&doctor_id).map(|_| doctor_id)
        }
        _ => None,
    }
}

/// Transport went away: end any call and purge every trace of the connection.
///
/// Returns the peer that should receive `call-ended`.
pub fn disconnect(registry: &mut Registry, matchmaker: &mut Matchmaker, conn_id: &ConnId) -> Option<ConnId> {
    let peer = end_call(registry, conn_id);
    registry.remove_connection(conn_id);
    matchmaker.forget(conn_id);
    peer
}
