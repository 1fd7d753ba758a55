//! # latsim-types: Core types for `latsim`
//!
//! Shared types used across the simulator:
//! - Entity ids ([`HostId`], [`ThreadId`], [`RequestId`], ...)
//! - CPU quality-of-service classes ([`QosClass`])
//! - Request and subchain lifecycle states ([`RequestStatus`], [`SubchainStatus`])
//! - Unit helpers (nanosecond conversions, millicore constants)
//!
//! All ids are cheap `Copy` values indexing into arenas owned by the
//! simulation; no entity holds a pointer to another.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

pub use ordered_float::OrderedFloat;

// ============================================================================
// Entity ids - All Copy (cheap 4-byte values)
// ============================================================================

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(u32);

        impl $name {
            pub fn new(id: u32) -> Self {
                Self(id)
            }

            /// Index into the owning arena.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }

        impl From<usize> for $name {
            fn from(value: usize) -> Self {
                Self(value as u32)
            }
        }
    };
}

entity_id! {
    /// A host in the cluster topology.
    HostId
}
entity_id! {
    /// A router in the cluster topology.
    RouterId
}
entity_id! {
    /// A directed link between two topology nodes.
    LinkId
}
entity_id! {
    /// A microservice (the static definition, owning replicas).
    MsId
}
entity_id! {
    /// A replica of a microservice, placed on at most one host.
    ReplicaId
}
entity_id! {
    /// An endpoint function within a microservice.
    EndpointId
}
entity_id! {
    /// A service-chain manager (one per deployed service chain).
    ScmId
}
entity_id! {
    /// A replica thread: the unit of simulated compute.
    ThreadId
}
entity_id! {
    /// A request travelling through a service chain.
    RequestId
}
entity_id! {
    /// A single payload transmission between two replicas.
    TransmissionId
}

/// A node of the network topology: either a host or a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopologyNode {
    Host(HostId),
    Router(RouterId),
}

impl Display for TopologyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyNode::Host(id) => write!(f, "host:{id}"),
            TopologyNode::Router(id) => write!(f, "router:{id}"),
        }
    }
}

// ============================================================================
// QoS classification
// ============================================================================

/// The sentinel used by resource allocations for "unbounded" / "unset".
pub const UNLIMITED: i64 = -1;

/// Kubernetes-style CPU quality-of-service class of a microservice.
///
/// Derived from the (requests, limits) pair in millicores, where `-1` means
/// "not set":
///
/// | requests | limits        | class              |
/// |----------|---------------|--------------------|
/// | -1       | -1            | BestEffort         |
/// | r        | r             | Guaranteed         |
/// | r        | -1            | BurstableUnlimited |
/// | r        | l, l != r     | BurstableLimited   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QosClass {
    BestEffort,
    Guaranteed,
    BurstableUnlimited,
    BurstableLimited,
}

impl QosClass {
    /// Classifies a (cpu_requests, cpu_limits) pair in millicores.
    pub fn classify(cpu_requests: i64, cpu_limits: i64) -> Self {
        if cpu_requests == UNLIMITED && cpu_limits == UNLIMITED {
            QosClass::BestEffort
        } else if cpu_requests == cpu_limits {
            QosClass::Guaranteed
        } else if cpu_limits == UNLIMITED {
            QosClass::BurstableUnlimited
        } else {
            QosClass::BurstableLimited
        }
    }

    pub fn is_burstable(self) -> bool {
        matches!(
            self,
            QosClass::BurstableUnlimited | QosClass::BurstableLimited
        )
    }
}

// ============================================================================
// Lifecycle states
// ============================================================================

/// Per-subchain progression state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubchainStatus {
    /// Subchain exists but has not been activated yet.
    Created,
    /// A transmission towards this subchain's current node is in flight.
    InTransmission,
    /// The transmission arrived; threads spawn on the next driver step.
    InitMicroservice,
    /// All nodes of the subchain completed.
    Concluded,
}

/// Overall request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    InProgress,
    Completed,
}

impl Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::InProgress => write!(f, "IN_PROGRESS"),
            RequestStatus::Completed => write!(f, "COMPLETED"),
        }
    }
}

// ============================================================================
// Units
// ============================================================================

/// CPU shares per physical core, in millicores.
pub const MILLICORES_PER_CORE: f64 = 1000.0;

/// Scheduler weight scale: millicores are mapped onto a 1024-based share
/// scale (the Linux nice-0 weight) before entering load computations.
pub const SHARE_SCALE: f64 = 1024.0;

pub const NS_PER_SEC: f64 = 1_000_000_000.0;
pub const NS_PER_MS: f64 = 1_000_000.0;

/// Converts whole seconds to nanoseconds.
pub fn sec_to_ns(sec: u64) -> u64 {
    sec * 1_000_000_000
}

pub fn ns_to_sec(ns: f64) -> f64 {
    ns / NS_PER_SEC
}

pub fn ms_to_ns(ms: u64) -> u64 {
    ms * 1_000_000
}

/// Converts a clock rate in Hertz to cycles per nanosecond.
pub fn hz_to_per_ns(hz: f64) -> f64 {
    hz / NS_PER_SEC
}

/// Rounds to 5 decimal places. Load-balance move postconditions compare
/// run-queue loads at this granularity.
pub fn round5(v: f64) -> f64 {
    (v * 100_000.0).round() / 100_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(-1, -1 => QosClass::BestEffort; "both unset")]
    #[test_case(500, 500 => QosClass::Guaranteed; "equal")]
    #[test_case(500, -1 => QosClass::BurstableUnlimited; "no limit")]
    #[test_case(500, 800 => QosClass::BurstableLimited; "limited")]
    fn qos_classification(requests: i64, limits: i64) -> QosClass {
        QosClass::classify(requests, limits)
    }

    #[test]
    fn ids_are_ordered_by_value() {
        assert!(ThreadId::new(1) < ThreadId::new(2));
        assert_eq!(ThreadId::from(7usize).index(), 7);
    }

    #[test]
    fn unit_conversions() {
        assert_eq!(sec_to_ns(2), 2_000_000_000);
        assert_eq!(ms_to_ns(3), 3_000_000);
        assert!((hz_to_per_ns(1_596_090_000.0) - 1.59609).abs() < 1e-12);
    }

    #[test]
    fn round5_matches_balance_granularity() {
        assert_eq!(round5(1.000004), 1.0);
        assert_eq!(round5(1.000006), 1.00001);
    }
}
