//! Signaling relay policy
//!
//! Decides whether an offer, answer or ICE candidate may be forwarded from
//! one connection to another. Payloads are never looked at here.

use std::fmt;

use crate::client::ConnId;
use crate::registry::Registry;

/// Which destinations a connection may address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPolicy {
    /// Any live connection may be targeted
    Open,
    /// Only the sender's current call peer may be targeted
    PairedOnly,
}

impl fmt::Display for RelayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayPolicy::Open => f.write_str("open"),
            RelayPolicy::PairedOnly => f.write_str("paired-only"),
        }
    }
}

/// Outcome of a relay check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecision {
    Forward,
    /// Destination is not a live connection
    UnknownDestination,
    /// Policy requires a pairing and the destination is not the sender's peer
    NotPaired,
}

/// Check whether `from` may send a signaling message to `to`
pub fn check(registry: &Registry, policy: RelayPolicy, from: &ConnId, to: &ConnId) -> RelayDecision {
    if !registry.contains(to) {
        return RelayDecision::UnknownDestination;
    }

    match policy {
        RelayPolicy::Open => RelayDecision::Forward,
        RelayPolicy::PairedOnly if registry.peer_of(from) == Some(to) => RelayDecision::Forward,
        RelayPolicy::PairedOnly => RelayDecision::NotPaired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ConnId {
        ConnId::from(name)
    }

    fn paired_registry() -> Registry {
        let mut registry = Registry::new();
        for name in ["d1", "d2", "p1"] {
            registry.connect(id(name));
        }
        registry.register_doctor(&id("d1")).unwrap();
        registry.register_doctor(&id("d2")).unwrap();
        registry.enqueue_patient(&id("p1")).unwrap();
        registry.mark_busy(&id("d1"), &id("p1")).unwrap();
        registry
    }

    #[test]
    fn test_open_policy_forwards_to_any_live_connection() {
        let registry = paired_registry();

        assert_eq!(
            check(&registry, RelayPolicy::Open, &id("p1"), &id("d1")),
            RelayDecision::Forward
        );
        assert_eq!(
            check(&registry, RelayPolicy::Open, &id("p1"), &id("d2")),
            RelayDecision::Forward
        );
    }

    #[test]
    fn test_paired_policy_only_forwards_to_peer() {
        let registry = paired_registry();

        assert_eq!(
            check(&registry, RelayPolicy::PairedOnly, &id("p1"), &id("d1")),
            RelayDecision::Forward
        );
        assert_eq!(
            check(&registry, RelayPolicy::PairedOnly, &id("d1"), &id("p1")),
            RelayDecision::Forward
        );
        assert_eq!(
            check(&registry, RelayPolicy::PairedOnly, &id("p1"), &id("d2")),
            RelayDecision::NotPaired
        );
    }

    #[test]
    fn test_unknown_destination_is_dropped() {
        let registry = paired_registry();

        for policy in [RelayPolicy::Open, RelayPolicy::PairedOnly] {
            assert_eq!(
                check(&registry, policy, &id("p1"), &id("gone")),
                RelayDecision::UnknownDestination
            );
        }
    }
}
