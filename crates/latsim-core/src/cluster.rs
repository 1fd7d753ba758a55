//! The cluster: every arena of simulated state plus the operations that cut
//! across them.
//!
//! All entities are stored in flat, creation-ordered arenas and reference
//! each other by id, so the single-threaded driver can split-borrow exactly
//! the pieces an operation needs. Everything here is mutated exclusively
//! from the driver loop; there is no concurrent mutator anywhere.

use std::collections::BTreeSet;

use latsim_types::{
    HostId, LinkId, ReplicaId, RequestId, RequestStatus, SubchainStatus, ThreadId,
    TransmissionId, MILLICORES_PER_CORE, UNLIMITED,
};
use petgraph::graph::NodeIndex;

use crate::equipments::cpu;
use crate::equipments::host::Host;
use crate::equipments::router::Router;
use crate::equipments::run_queue::{self, dequeue_thread, enqueue_thread};
use crate::equipments::topology::Topology;
use crate::error::SimResult;
use crate::placement::{PlacementMatrix, PlacementPolicy};
use crate::service::chain::ServiceChainManager;
use crate::service::microservice::{Microservice, Replica};
use crate::service::thread::ReplicaThread;
use crate::traffic::request::Request;
use crate::traffic::transmission::{CompletionBoard, Transmission};

// ============================================================================
// Scheduler bookkeeping
// ============================================================================

/// Cluster-wide scheduler sets: which hosts and threads are live, which
/// hosts owe a load-balance pass, which threads died since the last one.
#[derive(Debug, Clone, Default)]
pub struct ClusterScheduler {
    pub active_hosts: BTreeSet<HostId>,
    pub hosts_need_load_balancing: BTreeSet<HostId>,
    pub zombie_threads: BTreeSet<ThreadId>,
    pub active_threads: BTreeSet<ThreadId>,
}

/// One row of the latency table, appended when a request concludes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LatencyRow {
    pub scenario: String,
    pub service_chain: String,
    pub iteration_id: u64,
    pub id_in_iteration: u64,
    pub request_key: String,
    pub latency_ns: u64,
    pub arrival_ns: u64,
    pub completion_ns: u64,
    pub status: String,
    pub traffic_type: String,
}

// ============================================================================
// Cluster
// ============================================================================

#[derive(Debug)]
pub struct Cluster {
    pub name: String,
    pub scenario_name: String,

    pub hosts: Vec<Host>,
    pub routers: Vec<Router>,
    pub topology: Topology,
    pub microservices: Vec<Microservice>,
    pub replicas: Vec<Replica>,
    pub scms: Vec<ServiceChainManager>,

    pub threads: Vec<ReplicaThread>,
    pub transmissions: Vec<Transmission>,
    pub completions: CompletionBoard,
    pub requests: Vec<Request>,

    pub scheduler: ClusterScheduler,
    pub placement_matrix: PlacementMatrix,
    pub latency_table: Vec<LatencyRow>,
    /// (subchain, request) pairs whose threads spawn on the next THREAD-GEN.
    pub ready_for_thread_generation: Vec<(usize, RequestId)>,
    pub completed_requests: u64,

    pub log_cpu_events: bool,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        scenario_name: impl Into<String>,
        hosts: Vec<Host>,
        routers: Vec<Router>,
        topology: Topology,
        microservices: Vec<Microservice>,
        replicas: Vec<Replica>,
        scms: Vec<ServiceChainManager>,
    ) -> Self {
        let matrix = PlacementMatrix::zeros(microservices.len(), hosts.len());
        Self {
            name: name.into(),
            scenario_name: scenario_name.into(),
            hosts,
            routers,
            topology,
            microservices,
            replicas,
            scms,
            threads: Vec::new(),
            transmissions: Vec::new(),
            completions: CompletionBoard::default(),
            requests: Vec::new(),
            scheduler: ClusterScheduler::default(),
            placement_matrix: matrix,
            latency_table: Vec::new(),
            ready_for_thread_generation: Vec::new(),
            completed_requests: 0,
            log_cpu_events: false,
        }
    }

    pub fn scm_by_name(&self, name: &str) -> Option<&ServiceChainManager> {
        self.scms.iter().find(|s| s.name == name)
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// (Re)places every replica: clears current placements, zeroes the
    /// matrix, and runs the policy over replicas in creation order.
    pub fn reschedule(&mut self, policy: &dyn PlacementPolicy, now: f64) -> SimResult<()> {
        self.placement_matrix =
            PlacementMatrix::zeros(self.microservices.len(), self.hosts.len());

        let mut order = Vec::with_capacity(self.replicas.len());
        for ms in &self.microservices {
            order.extend(ms.replicas.iter().copied());
        }
        for &rid in &order {
            if let Some(host) = self.replicas[rid.index()].host {
                let ms = self.replicas[rid.index()].ms;
                let (ms_ref, replica) = (
                    &self.microservices[ms.index()],
                    &mut self.replicas[rid.index()],
                );
                self.hosts[host.index()].evict_replica(ms_ref, replica, now);
            }
        }
        for ms in &mut self.microservices {
            ms.hosts.clear();
        }

        policy.place(
            &mut self.placement_matrix,
            &order,
            &mut self.microservices,
            &mut self.replicas,
            &mut self.hosts,
            now,
        )
    }

    // ------------------------------------------------------------------
    // Thread generation
    // ------------------------------------------------------------------

    /// Advances a subchain onto its next endpoint and spawns that
    /// endpoint's threads on core 0 of the replica's host. Returns the host
    /// and the number of threads spawned.
    pub fn spawn_threads(&mut self, subchain_id: usize, rid: RequestId, now: f64) -> (HostId, usize) {
        // init_next_microservices: resolve the root on first contact, then
        // promote the staged next-hop arrays.
        let root = self.scms[self.requests[rid.index()].scm.index()].root;
        if self.requests[rid.index()].current_nodes[subchain_id].is_none()
            && self.requests[rid.index()].current_replicas[subchain_id].is_none()
        {
            self.set_next_nodes_and_replicas(rid, &[root]);
        }
        {
            let request = &mut self.requests[rid.index()];
            request.trans_init_times[subchain_id] = now;
            request.subchain_status[subchain_id] = SubchainStatus::InTransmission;
            request.current_replicas = request.next_replicas.clone();
            request.current_nodes = request.next_nodes.clone();
        }

        let request = &self.requests[rid.index()];
        let node = request.current_nodes[subchain_id].expect("subchain has a current node");
        let replica_id =
            request.current_replicas[subchain_id].expect("subchain has a current replica");
        let scm = &self.scms[request.scm.index()];
        let endpoint_ref = scm.alt[node].endpoint;
        let request_key = request.key.clone();
        let host_id = self.replicas[replica_id.index()]
            .host
            .expect("replica placed before traffic starts");

        let endpoint = self.microservices[endpoint_ref.ms.index()]
            .endpoint(endpoint_ref.endpoint)
            .clone();
        let ms_requests = self.microservices[endpoint_ref.ms.index()].cpu_requests;
        let ms_limits = self.microservices[endpoint_ref.ms.index()].cpu_limits;
        let threads_count = endpoint.threads_count();
        let qos = self.microservices[endpoint_ref.ms.index()].qos();

        let mut spawned = Vec::with_capacity(threads_count);
        for (thread_id_in_node, spec) in endpoint.threads.iter().enumerate() {
            let tid = ThreadId::from(self.threads.len());
            let process = &mut self.replicas[replica_id.index()].process;
            let key = format!(
                "{now}_{request_key}_{subchain_id}_{}_{}",
                process.name,
                process.threads.len()
            );
            process.active_threads_count += 1;
            process.threads.insert(tid);

            let share = if ms_requests != UNLIMITED {
                (ms_requests as f64 / threads_count as f64).min(MILLICORES_PER_CORE)
            } else {
                MILLICORES_PER_CORE / threads_count as f64
            };
            let limit = if ms_limits != UNLIMITED {
                ms_limits as f64 / threads_count as f64
            } else {
                -1.0
            };

            let mut thread = ReplicaThread {
                id: tid,
                key,
                replica: replica_id,
                request: rid,
                subchain_id,
                node,
                thread_id_in_node,
                qos,
                original_instructions: spec.instructions,
                cpi: spec.avg_cpi,
                mem_accesses: spec.avg_mem_accesses,
                isolated_cache_misses: spec.isolated_cache_misses,
                isolated_cache_refs: spec.isolated_cache_refs,
                avg_cache_miss_penalty: spec.avg_cache_miss_penalty,
                average_load: spec.avg_cpu_usage,
                instructions: spec.instructions,
                executed_instructions: 0.0,
                share: 0.0,
                limit,
                load: 0.0,
                vruntime: 0.0,
                core: None,
                on_rq: true,
                alive: true,
            };
            thread.load = thread.load_for_share(share);
            thread.share = share;
            self.threads.push(thread);
            self.requests[rid.index()].current_active_threads[subchain_id] += 1;
            spawned.push(tid);
        }

        let Cluster {
            hosts,
            threads,
            replicas,
            scheduler,
            ..
        } = self;
        let host = &mut hosts[host_id.index()];
        for tid in &spawned {
            enqueue_thread(host, 0, threads, replicas, scheduler, *tid);
        }

        (host_id, spawned.len())
    }

    /// Stages the next node and a round-robin replica for each successor's
    /// subchain.
    fn set_next_nodes_and_replicas(&mut self, rid: RequestId, next_nodes: &[NodeIndex]) {
        let Cluster {
            scms,
            microservices,
            requests,
            ..
        } = self;
        let request = &mut requests[rid.index()];
        let scm = &scms[request.scm.index()];
        for &node in next_nodes {
            let endpoint = scm.alt[node].endpoint;
            let replica = microservices[endpoint.ms.index()].next_replica();
            let subchain = scm.node_subchain(node);
            request.next_replicas[subchain] = Some(replica);
            request.next_nodes[subchain] = Some(node);
        }
    }

    // ------------------------------------------------------------------
    // Transmission initiation
    // ------------------------------------------------------------------

    /// Fires when a node's last thread completes: starts one transmission
    /// per alternative-graph successor (a fork starts several and ends the
    /// current subchain), or concludes the subchain at a leaf. Returns
    /// whether the flow set changed.
    pub fn init_transmission(&mut self, rid: RequestId, node: NodeIndex, now: f64) -> bool {
        let scm_id = self.requests[rid.index()].scm;
        let successors = self.scms[scm_id.index()].successors_in_order(node);
        let subchain_id = self.scms[scm_id.index()].node_subchain(node);
        let current_replica = self.requests[rid.index()].current_replicas[subchain_id];

        self.set_next_nodes_and_replicas(rid, &successors);
        {
            let request = &mut self.requests[rid.index()];
            let elapsed = now - request.trans_init_times[subchain_id];
            request.compute_times[subchain_id].push(elapsed);
        }

        if successors.is_empty() {
            self.finalize_subchain(rid, subchain_id, now);
            return false;
        }

        let src_replica = current_replica
            .expect("transmitting subchain has a current replica");

        for &next in &successors {
            let next_subchain = self.scms[scm_id.index()].node_subchain(next);
            {
                let request = &mut self.requests[rid.index()];
                request.subchain_status[next_subchain] = SubchainStatus::InTransmission;
                request.trans_init_times[next_subchain] = now;
            }
            let dst_replica = self.requests[rid.index()].next_replicas[next_subchain]
                .expect("successor subchain has a staged replica");

            let payload = {
                let scm = &self.scms[scm_id.index()];
                scm.chain
                    .first_edge_payload(scm.alt[node].endpoint, scm.alt[next].endpoint)
            };
            let tid = self.create_transmission(rid, next_subchain, src_replica, dst_replica, payload);

            let src_host = self.replicas[src_replica.index()]
                .host
                .expect("source replica placed");
            self.hosts[src_host.index()]
                .egress_nic
                .register_transmission(rid, next_subchain, tid);

            let request = &mut self.requests[rid.index()];
            request.trans_src_replicas[next_subchain] = Some(src_replica);
            request.active_subchain_ids.push(next_subchain);
            request.current_replicas[next_subchain] = request.next_replicas[next_subchain];
            request.current_nodes[next_subchain] = request.next_nodes[next_subchain];
        }

        if successors.len() > 1 {
            self.finalize_subchain(rid, subchain_id, now);
        }
        true
    }

    fn create_transmission(
        &mut self,
        rid: RequestId,
        subchain_id: usize,
        src: ReplicaId,
        dst: ReplicaId,
        payload: f64,
    ) -> TransmissionId {
        let id = TransmissionId::from(self.transmissions.len());
        let src_host = self.replicas[src.index()].host.expect("source placed");
        let dst_host = self.replicas[dst.index()].host.expect("destination placed");

        let links = self.topology.route_links(src_host, dst_host);
        let links_latency: f64 = links
            .iter()
            .map(|l| self.topology.links[l.index()].latency)
            .sum();
        let routers_latency: f64 = self
            .topology
            .routers_on_path(&links)
            .iter()
            .map(|r| self.routers[r.index()].latency)
            .sum();
        let total_latency = links_latency
            + routers_latency
            + self.replicas[src.index()].process.egress_latency
            + self.replicas[dst.index()].process.ingress_latency;

        let current_bw = if links.is_empty() {
            Some(f64::INFINITY)
        } else {
            None
        };
        let transmission = Transmission {
            id,
            request: rid,
            subchain_id,
            src_replica: src,
            dst_replica: dst,
            original_payload: payload,
            remaining_payload: payload,
            total_latency,
            requested_bw: 0.0,
            current_bw,
            predicted_time: None,
            predicted_clock: None,
            done: false,
            links: links.clone(),
        };
        self.transmissions.push(transmission);

        self.replicas[src.index()]
            .process
            .active_outgoing_transmissions
            .insert(id);
        self.replicas[dst.index()]
            .process
            .active_incoming_transmissions
            .insert(id);
        self.topology.attach_flow(id, &links);
        id
    }

    fn finalize_subchain(&mut self, rid: RequestId, subchain_id: usize, now: f64) {
        let concluded = self.requests[rid.index()].finalize_subchain(subchain_id, now);
        if concluded {
            let request = &mut self.requests[rid.index()];
            request.conclude(now);
            self.completed_requests += 1;
            self.latency_table.push(LatencyRow {
                scenario: self.scenario_name.clone(),
                service_chain: self.scms[request.scm.index()].name.clone(),
                iteration_id: request.iteration_id,
                id_in_iteration: request.id_in_iteration,
                request_key: request.key.clone(),
                latency_ns: request.latency.round() as u64,
                arrival_ns: request.arrival_time.round() as u64,
                completion_ns: now.round() as u64,
                status: RequestStatus::Completed.to_string(),
                traffic_type: request.traffic_name.clone(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Debits every active thread for `duration` nanoseconds. Threads whose
    /// instructions hit zero join the zombie set; they are killed at the
    /// next load-balance, not inline. Returns how many completed.
    pub fn run_active_threads(&mut self, duration: f64) -> u64 {
        let mut completed = 0;
        let active: Vec<ThreadId> = self.scheduler.active_threads.iter().copied().collect();
        for tid in active {
            let (host_id, core_id) = {
                let t = &self.threads[tid.index()];
                let host = self.replicas[t.replica.index()]
                    .host
                    .expect("active thread on a placed replica");
                let core = t.core.expect("active thread owns a core");
                (host, core)
            };
            let cpu = &mut self.hosts[host_id.index()].cpu;
            let active_on_core = cpu.cores[core_id].rq.active_threads.len();
            let clock = cpu.clock_rate_per_ns();

            cpu::remove_thread_index(cpu, &self.threads[tid.index()]);
            let finished = self.threads[tid.index()].exec(duration, active_on_core, clock);
            cpu::index_thread(cpu, &self.threads[tid.index()]);

            if self.threads[tid.index()].instructions <= 0.0 {
                self.scheduler.zombie_threads.insert(tid);
            }
            if finished {
                completed += 1;
            }
        }
        completed
    }

    /// Scans all runnable threads for one predicted to finish before
    /// `time_of_next_event`. Returns the possibly lowered event time, the
    /// delta from `now`, and whether every thread outlasts the event.
    pub fn earliest_thread_finish(&self, time_of_next_event: f64, now: f64) -> (f64, f64, bool) {
        let mut no_thread_ends_sooner = !self.scheduler.active_threads.is_empty();
        let mut time_of_next_event = time_of_next_event;
        let mut duration = time_of_next_event - now;

        for tid in &self.scheduler.active_threads {
            let t = &self.threads[tid.index()];
            if t.core.is_none() || !t.on_rq {
                continue;
            }
            assert!(
                now <= time_of_next_event,
                "clock {now} already past the next event {time_of_next_event}; \
                 a request was missed somewhere in the chain"
            );
            let host = self.replicas[t.replica.index()].host.expect("placed");
            let cpu = &self.hosts[host.index()].cpu;
            let core = t.core.expect("checked above");
            let active_on_core = cpu.cores[core].rq.active_threads.len();
            let duration_to_finish = t.exec_time_on_rq(active_on_core, cpu.clock_rate_per_ns());
            let time_to_finish = duration_to_finish + now;
            if time_to_finish < time_of_next_event {
                no_thread_ends_sooner = false;
                time_of_next_event = time_to_finish;
                duration = duration_to_finish;
            }
        }

        if no_thread_ends_sooner {
            duration = time_of_next_event - now;
        }
        (time_of_next_event, duration, no_thread_ends_sooner)
    }

    // ------------------------------------------------------------------
    // Zombie reaping and load balancing
    // ------------------------------------------------------------------

    /// Kills every thread in the zombie set: removes it from all indices,
    /// decrements its subchain's active-thread count, and fires the next
    /// transmissions for subchains that drained. One topology-wide
    /// bandwidth recomputation runs at the end if any subchain drained.
    pub fn kill_zombie_threads(&mut self, now: f64) {
        if self.scheduler.zombie_threads.is_empty() {
            return;
        }
        let zombies: Vec<ThreadId> = self.scheduler.zombie_threads.iter().copied().collect();
        self.scheduler.zombie_threads.clear();

        let mut needs_recalculation = false;
        for tid in zombies {
            assert!(
                self.threads[tid.index()].instructions <= 0.0,
                "thread {} reaped with instructions remaining",
                self.threads[tid.index()].key
            );
            self.kill_thread(tid);

            let (rid, subchain_id, node) = {
                let t = &self.threads[tid.index()];
                (t.request, t.subchain_id, t.node)
            };
            let request = &mut self.requests[rid.index()];
            request.current_active_threads[subchain_id] -= 1;
            let remaining = request.current_active_threads[subchain_id];
            assert!(
                remaining >= 0,
                "active thread count of request {} subchain {subchain_id} went negative",
                request.key
            );
            if remaining == 0 {
                self.init_transmission(rid, node, now);
                needs_recalculation = true;
            }
        }

        if needs_recalculation {
            self.recalculate_transmissions_bw(now);
        }
    }

    fn kill_thread(&mut self, tid: ThreadId) {
        let (replica_id, host_id) = {
            let t = &self.threads[tid.index()];
            let replica = t.replica;
            let host = self.replicas[replica.index()].host.expect("placed");
            (replica, host)
        };

        {
            let process = &mut self.replicas[replica_id.index()].process;
            process.active_threads_count -= 1;
            process.threads.remove(&tid);
        }

        let Cluster {
            hosts,
            threads,
            scheduler,
            ..
        } = self;
        let host = &mut hosts[host_id.index()];
        host.threads.remove(&tid);
        scheduler.active_threads.remove(&tid);
        if host.is_active() {
            host.load_balancing_needed = true;
            scheduler.hosts_need_load_balancing.insert(host_id);
        } else {
            scheduler.active_hosts.remove(&host_id);
            host.load_balancing_needed = false;
            scheduler.hosts_need_load_balancing.remove(&host_id);
        }

        dequeue_thread(host, threads, tid);
        threads[tid.index()].on_rq = false;
        threads[tid.index()].alive = false;
    }

    /// Full load-balance of one host: reap zombies, rebalance if dirty and
    /// active, recompute every core's shares, optionally sample the
    /// utilization timeline.
    pub fn load_balance_host(&mut self, host_id: HostId, now: f64) {
        self.kill_zombie_threads(now);

        let Cluster {
            hosts,
            threads,
            replicas,
            scheduler,
            log_cpu_events,
            ..
        } = self;
        let host = &mut hosts[host_id.index()];
        if host.load_balancing_needed && host.is_active() {
            cpu::load_balance_runqueues(host, threads, replicas, scheduler);
            cpu::emergency_balance_idle_cores(host, threads, replicas, scheduler);
        }
        for core_id in 0..host.cpu.cores.len() {
            run_queue::recalculate_shares(host, core_id, threads, replicas);
        }
        if *log_cpu_events {
            host.cpu.sample_timeline(now);
        }
    }

    /// Load-balances every active host.
    pub fn load_balance_all_hosts(&mut self, now: f64) {
        let active: Vec<HostId> = self.scheduler.active_hosts.iter().copied().collect();
        for host_id in active {
            self.load_balance_host(host_id, now);
        }
    }

    // ------------------------------------------------------------------
    // Bandwidth allocation
    // ------------------------------------------------------------------

    /// The bandwidth this flow would like: min of its link portions, the
    /// endpoint host NICs, and the per-replica egress/ingress budgets split
    /// over their active flows and derated by the topology error factors.
    fn requested_bw_for(&self, tid: TransmissionId) -> f64 {
        let t = &self.transmissions[tid.index()];
        let src = &self.replicas[t.src_replica.index()];
        let dst = &self.replicas[t.dst_replica.index()];
        if src.host == dst.host {
            return 0.0;
        }

        let src_host = &self.hosts[src.host.expect("placed").index()];
        let dst_host = &self.hosts[dst.host.expect("placed").index()];
        let egress = src.process.egress_bw * (1.0 - self.topology.egress_err);
        let ingress = dst.process.ingress_bw * (1.0 - self.topology.ingress_err);

        let mut requested = f64::INFINITY;
        for link in &t.links {
            requested = requested.min(self.topology.links[link.index()].portion);
        }
        requested
            .min(src_host.egress_nic.bandwidth)
            .min(dst_host.ingress_nic.bandwidth)
            .min(egress / src.process.active_outgoing_transmissions.len() as f64)
            .min(ingress / dst.process.active_incoming_transmissions.len() as f64)
    }

    /// Max-min step on one link: every flow's request is computed against
    /// the current portions; flows wanting less than the equal share donate
    /// their slack, which is split across the flows wanting more. Returns
    /// whether the link's portion changed.
    fn recalculate_portion_on_link(&mut self, link: LinkId) -> bool {
        let capacity = self
            .topology
            .link_capacity(link, &self.hosts, &self.routers);
        let flows: Vec<TransmissionId> = self.topology.links[link.index()]
            .transmissions
            .iter()
            .copied()
            .collect();
        if flows.is_empty() {
            self.topology.links[link.index()].portion = capacity;
            return false;
        }

        let mut portion = capacity / flows.len() as f64;
        let mut best_effort_flows = 0usize;
        let mut unused_portions = 0.0;
        for tid in &flows {
            let requested = self.requested_bw_for(*tid);
            self.transmissions[tid.index()].requested_bw = requested;
            if requested > portion {
                best_effort_flows += 1;
            } else {
                unused_portions += portion - requested;
            }
        }
        if best_effort_flows != 0 {
            portion += unused_portions / best_effort_flows as f64;
        }

        let modified = portion != self.topology.links[link.index()].portion;
        self.topology.links[link.index()].portion = portion;
        modified
    }

    /// Recomputes portions on every active link, refreshes each affected
    /// flow's granted bandwidth, clears zombie links, and retimes every
    /// active flow's completion clock.
    pub fn recalculate_transmissions_bw(&mut self, now: f64) {
        let active_links: Vec<_> = self.topology.active_links.iter().copied().collect();
        for link in active_links {
            let modified = self.recalculate_portion_on_link(link);
            let flows: Vec<TransmissionId> = self.topology.links[link.index()]
                .transmissions
                .iter()
                .copied()
                .collect();
            for tid in flows {
                if modified || self.transmissions[tid.index()].current_bw.is_none() {
                    let bw = self.requested_bw_for(tid);
                    let t = &mut self.transmissions[tid.index()];
                    t.requested_bw = bw;
                    t.current_bw = Some(bw);
                }
            }
        }

        let zombies: Vec<_> = self.topology.zombie_links.iter().copied().collect();
        for link in zombies {
            self.recalculate_portion_on_link(link);
        }
        self.topology.zombie_links.clear();

        self.retime_active_transmissions(now);
    }

    /// Recomputes each active flow's predicted completion and moves its
    /// entry in the completion board when the clock changed.
    fn retime_active_transmissions(&mut self, now: f64) {
        let active: Vec<TransmissionId> =
            self.topology.active_transmissions.iter().copied().collect();
        for tid in active {
            let previous = self.transmissions[tid.index()].predicted_clock;
            self.transmissions[tid.index()].predict(now);
            let current = self.transmissions[tid.index()].predicted_clock;
            if current != previous {
                let (rid, subchain_id) = {
                    let t = &self.transmissions[tid.index()];
                    (t.request, t.subchain_id)
                };
                let request = &mut self.requests[rid.index()];
                request.trans_times[subchain_id] = self.transmissions[tid.index()].predicted_time;
                request.trans_exact_times[subchain_id] = current;
                if let Some(previous) = previous {
                    self.completions.remove(previous);
                }
                self.completions
                    .insert(current.expect("predict always sets a clock"));
            }
        }
    }

    // ------------------------------------------------------------------
    // Network transmission step
    // ------------------------------------------------------------------

    /// Advances every in-flight transmission by `duration` nanoseconds.
    /// Flows that drain both latency and payload finish: they leave their
    /// links and NIC reservation, flip their subchain to INIT MICROSERVICE,
    /// and queue the (subchain, request) pair for thread generation. One
    /// bandwidth recomputation runs at the end if anything finished.
    /// Returns the finished flows.
    pub fn transmit_requests_in_network(
        &mut self,
        duration: f64,
        now: f64,
    ) -> Vec<(TransmissionId, RequestId, usize)> {
        let mut finished = Vec::new();
        if duration.is_infinite() {
            return finished;
        }

        let mut duration = duration;
        let active: Vec<TransmissionId> =
            self.topology.active_transmissions.iter().copied().collect();

        for tid in active {
            let (rid, subchain_id) = {
                let t = &self.transmissions[tid.index()];
                (t.request, t.subchain_id)
            };
            if self.requests[rid.index()].subchain_status[subchain_id]
                != SubchainStatus::InTransmission
            {
                continue;
            }

            let previous_clock = self.requests[rid.index()].trans_exact_times[subchain_id];
            let remaining = self.transmissions[tid.index()].transmit(duration, now);
            if remaining > -0.001 && remaining < 0.001 {
                duration += remaining;
            }

            {
                let request = &mut self.requests[rid.index()];
                request.trans_times[subchain_id] = Some(remaining);
                let clock = self.transmissions[tid.index()].predicted_clock;
                if previous_clock != clock {
                    if let Some(previous) = previous_clock {
                        self.completions.remove(previous);
                    }
                    self.completions.insert(clock.expect("transmit predicts"));
                }
                request.trans_exact_times[subchain_id] = clock;
                assert!(
                    remaining >= 0.0,
                    "remaining transmission time {remaining} below zero at clock {now}"
                );
            }

            if remaining <= 0.0 {
                finished.push((tid, rid, subchain_id));
                self.finish_transmission(tid, rid, subchain_id, now);
            }
        }

        if !finished.is_empty() {
            self.recalculate_transmissions_bw(now);
        }
        finished
    }

    fn finish_transmission(
        &mut self,
        tid: TransmissionId,
        rid: RequestId,
        subchain_id: usize,
        now: f64,
    ) {
        self.ready_for_thread_generation.push((subchain_id, rid));

        let (src, dst, links) = {
            let t = &self.transmissions[tid.index()];
            (t.src_replica, t.dst_replica, t.links.clone())
        };
        let src_host = self.replicas[src.index()].host.expect("placed");
        let released = self.hosts[src_host.index()]
            .egress_nic
            .release_transmission(rid, subchain_id);
        assert!(
            released == tid,
            "NIC reservation out of sync for request {rid} subchain {subchain_id}"
        );

        self.replicas[src.index()]
            .process
            .active_outgoing_transmissions
            .remove(&tid);
        self.replicas[dst.index()]
            .process
            .active_incoming_transmissions
            .remove(&tid);
        self.topology.detach_flow(tid, &links);
        self.transmissions[tid.index()].done = true;

        self.requests[rid.index()].finish_transmission(subchain_id, now);
        self.completions.remove_min_if_equals(now);
    }
}
