//! Microservices, their endpoint functions, and their replicas.
//!
//! A microservice is the static definition: resource demands, QoS class,
//! affinity rules, endpoint functions with per-thread compute profiles.
//! Replicas are the deployable units; each owns a process whose bandwidth
//! and thread accounting feeds the network and CPU models.

use std::collections::BTreeSet;

use latsim_types::{
    EndpointId, HostId, MsId, QosClass, ReplicaId, ThreadId, TransmissionId, MILLICORES_PER_CORE,
    UNLIMITED,
};

// ============================================================================
// Endpoint functions
// ============================================================================

/// Measured profile of one thread an endpoint function spawns.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSpec {
    pub instructions: f64,
    pub avg_cpi: f64,
    /// Average share of a core the thread keeps busy; scales its load.
    pub avg_cpu_usage: f64,
    pub avg_mem_accesses: f64,
    pub isolated_cache_misses: f64,
    pub isolated_cache_refs: f64,
    pub avg_cache_miss_penalty: f64,
    pub avg_blkio_rw: f64,
}

/// One callable function of a microservice. Spawns `threads.len()` threads
/// per invocation.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub threads: Vec<ThreadSpec>,
    /// Per-request timeout in nanoseconds; values <= 0 mean "no timeout".
    /// Configured but not enforced: concluded requests always count as
    /// successful and timeout counters stay zero.
    pub request_timeout: f64,
}

impl Endpoint {
    pub fn threads_count(&self) -> usize {
        self.threads.len()
    }
}

/// Reference to an endpoint across the microservice arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointRef {
    pub ms: MsId,
    pub endpoint: EndpointId,
}

// ============================================================================
// Microservice
// ============================================================================

#[derive(Debug, Clone)]
pub struct Microservice {
    pub id: MsId,
    pub name: String,
    pub endpoints: Vec<Endpoint>,
    pub replicas: Vec<ReplicaId>,
    /// Replicas to materialize at simulation assembly; set by the
    /// scenario's scaling section.
    pub replica_count: usize,

    /// CPU requests in millicores; [`UNLIMITED`] when unset.
    pub cpu_requests: i64,
    /// CPU limits in millicores; [`UNLIMITED`] when unset.
    pub cpu_limits: i64,
    pub memory_requests: f64,
    pub ingress_bw: f64,
    pub egress_bw: f64,
    pub ingress_latency: f64,
    pub egress_latency: f64,
    pub blkio_capacity: f64,

    pub ms_affinity: BTreeSet<MsId>,
    pub ms_antiaffinity: BTreeSet<MsId>,
    pub host_affinity: BTreeSet<HostId>,
    pub host_antiaffinity: BTreeSet<HostId>,

    /// Hosts carrying at least one replica of this microservice.
    pub hosts: Vec<HostId>,

    rr_cursor: usize,
}

impl Microservice {
    pub fn new(id: MsId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            endpoints: Vec::new(),
            replicas: Vec::new(),
            replica_count: 0,
            cpu_requests: UNLIMITED,
            cpu_limits: UNLIMITED,
            memory_requests: 0.0,
            ingress_bw: f64::INFINITY,
            egress_bw: f64::INFINITY,
            ingress_latency: 0.0,
            egress_latency: 0.0,
            blkio_capacity: 0.0,
            ms_affinity: BTreeSet::new(),
            ms_antiaffinity: BTreeSet::new(),
            host_affinity: BTreeSet::new(),
            host_antiaffinity: BTreeSet::new(),
            hosts: Vec::new(),
            rr_cursor: 0,
        }
    }

    pub fn qos(&self) -> QosClass {
        QosClass::classify(self.cpu_requests, self.cpu_limits)
    }

    pub fn endpoint(&self, id: EndpointId) -> &Endpoint {
        &self.endpoints[id.index()]
    }

    pub fn endpoint_by_name(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// Round-robin replica choice used when a transmission picks its
    /// destination.
    ///
    /// # Panics
    ///
    /// Panics when the microservice has no replicas; the scenario layer
    /// guarantees every referenced microservice is scaled to at least one.
    pub fn next_replica(&mut self) -> ReplicaId {
        assert!(
            !self.replicas.is_empty(),
            "microservice {} has no replicas to balance over",
            self.name
        );
        let replica = self.replicas[self.rr_cursor % self.replicas.len()];
        self.rr_cursor += 1;
        replica
    }
}

// ============================================================================
// Replicas
// ============================================================================

/// Runtime bandwidth/thread accounting of one replica.
#[derive(Debug, Clone)]
pub struct Process {
    pub name: String,
    /// Millicores the process may claim; widened to the whole host for
    /// best-effort replicas at placement time.
    pub cpu_requests_share: f64,
    pub cpu_limits: f64,
    pub original_ingress_bw: f64,
    pub original_egress_bw: f64,
    pub ingress_bw: f64,
    pub egress_bw: f64,
    pub ingress_latency: f64,
    pub egress_latency: f64,
    pub memory_capacity: f64,
    pub blkio_capacity: f64,
    pub active_threads_count: u32,
    pub threads: BTreeSet<ThreadId>,
    pub active_incoming_transmissions: BTreeSet<TransmissionId>,
    pub active_outgoing_transmissions: BTreeSet<TransmissionId>,
}

#[derive(Debug, Clone)]
pub struct Replica {
    pub id: ReplicaId,
    pub ms: MsId,
    pub name: String,
    pub host: Option<HostId>,
    pub qos: QosClass,
    pub process: Process,
}

impl Replica {
    pub fn new(id: ReplicaId, ms: &Microservice, index_in_ms: usize) -> Self {
        let name = format!("{}_{index_in_ms}", ms.name);
        Self {
            id,
            ms: ms.id,
            qos: ms.qos(),
            process: Process {
                name: name.clone(),
                cpu_requests_share: ms.cpu_requests as f64,
                cpu_limits: ms.cpu_limits as f64,
                original_ingress_bw: ms.ingress_bw,
                original_egress_bw: ms.egress_bw,
                ingress_bw: ms.ingress_bw,
                egress_bw: ms.egress_bw,
                ingress_latency: ms.ingress_latency,
                egress_latency: ms.egress_latency,
                memory_capacity: ms.memory_requests,
                blkio_capacity: ms.blkio_capacity,
                active_threads_count: 0,
                threads: BTreeSet::new(),
                active_incoming_transmissions: BTreeSet::new(),
                active_outgoing_transmissions: BTreeSet::new(),
            },
            name,
            host: None,
        }
    }

    /// The per-thread CPU request of this process, given how many of its
    /// threads are currently active. `None` while no thread runs.
    ///
    /// Guaranteed and unlimited-burstable processes split their request;
    /// limited-burstable processes split their limit; best-effort processes
    /// split a full core. The result never exceeds one core.
    pub fn cpu_request_per_thread(&self) -> Option<f64> {
        if self.process.active_threads_count == 0 {
            return None;
        }
        let n = f64::from(self.process.active_threads_count);
        let per_thread = match self.qos {
            QosClass::Guaranteed | QosClass::BurstableUnlimited => {
                self.process.cpu_requests_share / n
            }
            QosClass::BurstableLimited => self.process.cpu_limits / n,
            QosClass::BestEffort => MILLICORES_PER_CORE / n,
        };
        Some(per_thread.min(MILLICORES_PER_CORE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms_with(requests: i64, limits: i64) -> Microservice {
        let mut ms = Microservice::new(MsId::new(0), "ms");
        ms.cpu_requests = requests;
        ms.cpu_limits = limits;
        ms
    }

    #[test]
    fn round_robin_cycles_through_replicas() {
        let mut ms = ms_with(100, 100);
        ms.replicas = vec![ReplicaId::new(0), ReplicaId::new(1), ReplicaId::new(2)];
        let picks: Vec<_> = (0..5).map(|_| ms.next_replica().index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn no_active_threads_means_no_per_thread_request() {
        let ms = ms_with(800, 800);
        let replica = Replica::new(ReplicaId::new(0), &ms, 0);
        assert_eq!(replica.cpu_request_per_thread(), None);
    }

    #[test_case::test_case(800, 800, 2 => 400.0; "guaranteed splits its request")]
    #[test_case::test_case(2000, 2000, 1 => 1000.0; "capped at one core")]
    #[test_case::test_case(500, 600, 2 => 300.0; "limited burstable splits its limit")]
    #[test_case::test_case(500, -1, 2 => 250.0; "unlimited burstable splits its request")]
    #[test_case::test_case(-1, -1, 4 => 250.0; "best effort splits a core")]
    fn per_thread_request(requests: i64, limits: i64, active: u32) -> f64 {
        let ms = ms_with(requests, limits);
        let mut replica = Replica::new(ReplicaId::new(0), &ms, 0);
        replica.process.active_threads_count = active;
        replica.cpu_request_per_thread().unwrap()
    }
}
