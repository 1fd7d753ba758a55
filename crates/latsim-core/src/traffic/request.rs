//! Per-request state: one set of dense arrays indexed by subchain id.
//!
//! A request fans out over the subchains of its service chain's alternative
//! graph. Each subchain independently walks CREATED -> IN TRANSMISSION ->
//! INIT MICROSERVICE -> ... -> CONCLUDED; the request completes when every
//! subchain has concluded. The transitions that need cluster-wide context
//! (replica choice, NIC reservation, bandwidth recomputation) live on
//! `Cluster`; this module owns the state and the self-contained moves.

use latsim_types::{ReplicaId, RequestId, RequestStatus, ScmId, SubchainStatus};
use petgraph::graph::NodeIndex;

#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    /// Stable external identity, `{scenario}_{traffic}_{chain}_{n}`.
    pub key: String,
    pub scm: ScmId,
    pub iteration_id: u64,
    pub id_in_iteration: u64,
    pub traffic_name: String,

    pub arrival_time: f64,
    pub completion_time: Option<f64>,
    pub latency: f64,
    pub status: RequestStatus,

    // Dense per-subchain arrays, length fixed at construction.
    pub current_active_threads: Vec<i64>,
    pub current_nodes: Vec<Option<NodeIndex>>,
    pub current_replicas: Vec<Option<ReplicaId>>,
    pub next_nodes: Vec<Option<NodeIndex>>,
    pub next_replicas: Vec<Option<ReplicaId>>,
    pub subchain_status: Vec<SubchainStatus>,
    /// Time spent computing per subchain, appended at each hop.
    pub compute_times: Vec<Vec<f64>>,
    /// Remaining transmission time per subchain, while one is in flight.
    pub trans_times: Vec<Option<f64>>,
    /// Exact completion clock of the in-flight transmission per subchain.
    pub trans_exact_times: Vec<Option<f64>>,
    /// Observed transmission durations per subchain.
    pub trans_deltatimes: Vec<Vec<f64>>,
    pub trans_src_replicas: Vec<Option<ReplicaId>>,
    /// Clock at which the subchain's current phase started.
    pub trans_init_times: Vec<f64>,
    pub active_subchain_ids: Vec<usize>,

    completed_subchains: usize,
}

impl Request {
    pub fn new(
        id: RequestId,
        key: String,
        scm: ScmId,
        subchain_count: usize,
        iteration_id: u64,
        id_in_iteration: u64,
        traffic_name: String,
        arrival_time: f64,
    ) -> Self {
        Self {
            id,
            key,
            scm,
            iteration_id,
            id_in_iteration,
            traffic_name,
            arrival_time,
            completion_time: None,
            latency: 0.0,
            status: RequestStatus::InProgress,
            current_active_threads: vec![0; subchain_count],
            current_nodes: vec![None; subchain_count],
            current_replicas: vec![None; subchain_count],
            next_nodes: vec![None; subchain_count],
            next_replicas: vec![None; subchain_count],
            subchain_status: vec![SubchainStatus::Created; subchain_count],
            compute_times: vec![Vec::new(); subchain_count],
            trans_times: vec![None; subchain_count],
            trans_exact_times: vec![None; subchain_count],
            trans_deltatimes: vec![Vec::new(); subchain_count],
            trans_src_replicas: vec![None; subchain_count],
            trans_init_times: vec![0.0; subchain_count],
            active_subchain_ids: vec![0],
            completed_subchains: 0,
        }
    }

    pub fn subchain_count(&self) -> usize {
        self.subchain_status.len()
    }

    pub fn completed_subchains(&self) -> usize {
        self.completed_subchains
    }

    /// Concludes one subchain. Returns `true` when this was the last open
    /// subchain and the whole request is now complete; the caller records
    /// the completion row and clock.
    pub fn finalize_subchain(&mut self, subchain_id: usize, now: f64) -> bool {
        if self.subchain_status[subchain_id] != SubchainStatus::Concluded {
            self.subchain_status[subchain_id] = SubchainStatus::Concluded;
            self.completed_subchains += 1;
        }

        self.current_nodes[subchain_id] = None;
        self.current_replicas[subchain_id] = None;
        self.next_nodes[subchain_id] = None;
        self.next_replicas[subchain_id] = None;
        self.active_subchain_ids.retain(|s| *s != subchain_id);
        self.compute_times[subchain_id].push(now - self.trans_init_times[subchain_id]);

        self.completed_subchains == self.subchain_count()
    }

    /// Marks the in-flight transmission of a subchain as arrived; the next
    /// THREAD-GEN step spawns threads at the destination replica.
    pub fn finish_transmission(&mut self, subchain_id: usize, now: f64) {
        self.trans_times[subchain_id] = None;
        self.subchain_status[subchain_id] = SubchainStatus::InitMicroservice;
        self.trans_deltatimes[subchain_id].push(now - self.trans_init_times[subchain_id]);
    }

    /// Records final completion state. The caller owns the latency table.
    pub fn conclude(&mut self, now: f64) {
        self.completion_time = Some(now);
        self.latency = now - self.arrival_time;
        self.status = RequestStatus::Completed;
    }

    pub fn is_completed(&self) -> bool {
        self.status == RequestStatus::Completed
    }
}
