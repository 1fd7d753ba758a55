//! Simulation assembly: resolve a scenario into a cluster, place replicas,
//! pre-generate the merged arrival table, and run the driver to DONE.

use std::collections::BTreeMap;

use latsim_types::{HostId, MsId, ReplicaId, RequestId, ScmId, TopologyNode, UNLIMITED};

use crate::cluster::Cluster;
use crate::equipments::cpu::CpuSample;
use crate::equipments::host::{Host, HostSpec};
use crate::equipments::router::Router;
use crate::equipments::topology::Topology;
use crate::error::{SimError, SimResult};
use crate::observer::{events, EventBus, TraceLogObserver};
use crate::placement::PlacementPolicy;
use crate::results::{build_results, SimulationResults};
use crate::service::chain::{ServiceChain, ServiceChainManager};
use crate::service::microservice::Replica;
use crate::traffic::load_generator::{LoadGenerator, SimClock};
use crate::traffic::profile::TrafficProfile;
use crate::traffic::request::Request;

// ============================================================================
// Scenario inputs
// ============================================================================

/// Named resource bundle a scaling entry applies to a microservice.
#[derive(Debug, Clone)]
pub struct ResourceAllocation {
    pub name: String,
    /// Millicores; -1 = unset.
    pub cpu_requests: i64,
    pub cpu_limits: i64,
    pub memory_requests: f64,
    pub ingress_bw: f64,
    pub egress_bw: f64,
    pub ingress_latency: f64,
    pub egress_latency: f64,
    pub blkio_capacity: f64,
}

impl ResourceAllocation {
    /// An allocation with no bounds at all (best-effort).
    pub fn best_effort(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cpu_requests: UNLIMITED,
            cpu_limits: UNLIMITED,
            memory_requests: 0.0,
            ingress_bw: f64::INFINITY,
            egress_bw: f64::INFINITY,
            ingress_latency: 0.0,
            egress_latency: 0.0,
            blkio_capacity: 0.0,
        }
    }

    /// A guaranteed allocation: requests == limits.
    pub fn guaranteed(name: impl Into<String>, millicores: i64) -> Self {
        Self {
            cpu_requests: millicores,
            cpu_limits: millicores,
            ..Self::best_effort(name)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScalingEntry {
    pub microservice: String,
    pub replica_count: usize,
    pub allocation: ResourceAllocation,
}

#[derive(Debug, Clone, Default)]
pub struct AffinityRule {
    pub microservice: String,
    pub affinity_microservices: Vec<String>,
    pub antiaffinity_microservices: Vec<String>,
    pub affinity_hosts: Vec<String>,
    pub antiaffinity_hosts: Vec<String>,
}

/// Binds one service chain to a traffic profile.
#[derive(Debug, Clone)]
pub struct TrafficBinding {
    pub service_chain: String,
    pub profile: TrafficProfile,
}

#[derive(Debug, Clone)]
pub struct RouterSpec {
    pub name: String,
    pub latency: f64,
    pub egress_ingress_bw: f64,
    pub ports_count: usize,
}

/// A directed link between two named topology nodes.
#[derive(Debug, Clone)]
pub struct LinkSpec {
    pub name: String,
    pub latency: f64,
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DebugOptions {
    pub debug_level: u8,
    pub log_cpu_events: bool,
    pub log_timeline: bool,
}

/// Everything a single simulation run needs, with names resolved against
/// each other at assembly time.
#[derive(Debug)]
pub struct SimulationSpec {
    pub name: String,
    pub microservices: Vec<crate::service::microservice::Microservice>,
    pub service_chains: Vec<ServiceChain>,
    pub topology_name: String,
    pub hosts: Vec<(String, HostSpec)>,
    pub routers: Vec<RouterSpec>,
    pub links: Vec<LinkSpec>,
    pub egress_err: f64,
    pub ingress_err: f64,
    pub placement: Box<dyn PlacementPolicy>,
    pub scaling: Vec<ScalingEntry>,
    pub affinity: Vec<AffinityRule>,
    pub traffic: Vec<TrafficBinding>,
    /// Nanoseconds; values < 0 mean no timeout. Carried for schema
    /// stability, not enforced.
    pub network_timeout: f64,
    pub debug: DebugOptions,
}

// ============================================================================
// Simulation
// ============================================================================

#[derive(Debug)]
pub struct Simulation {
    pub name: String,
    pub cluster: Cluster,
    pub load_generator: LoadGenerator,
    pub clock: SimClock,
    pub bus: EventBus,
    pub debug: DebugOptions,
    placement: Box<dyn PlacementPolicy>,
}

impl Simulation {
    /// Builds the cluster, applies scaling and affinity, places replicas,
    /// and pre-generates the merged arrival table.
    pub fn new(spec: SimulationSpec) -> SimResult<Self> {
        let SimulationSpec {
            name,
            mut microservices,
            service_chains,
            topology_name,
            hosts: host_specs,
            routers: router_specs,
            links: link_specs,
            egress_err,
            ingress_err,
            placement,
            scaling,
            affinity,
            traffic,
            network_timeout: _,
            debug,
        } = spec;

        // Scaling: resource allocations and replica counts.
        for entry in &scaling {
            let allocation = &entry.allocation;
            validate_allocation(allocation)?;
            let ms = microservices
                .iter_mut()
                .find(|m| m.name == entry.microservice)
                .ok_or_else(|| {
                    SimError::Config(format!(
                        "scaling references unknown microservice {}",
                        entry.microservice
                    ))
                })?;
            ms.cpu_requests = allocation.cpu_requests;
            ms.cpu_limits = allocation.cpu_limits;
            ms.memory_requests = allocation.memory_requests;
            ms.ingress_bw = allocation.ingress_bw;
            ms.egress_bw = allocation.egress_bw;
            ms.ingress_latency = allocation.ingress_latency;
            ms.egress_latency = allocation.egress_latency;
            ms.blkio_capacity = allocation.blkio_capacity;
            ms.replica_count = entry.replica_count;
        }

        // Equipment and topology.
        let hosts: Vec<Host> = host_specs
            .iter()
            .enumerate()
            .map(|(i, (host_name, host_spec))| {
                Host::new(HostId::from(i), host_name.clone(), host_spec)
            })
            .collect();
        let mut routers: Vec<Router> = router_specs
            .iter()
            .enumerate()
            .map(|(i, r)| {
                Router::new(
                    latsim_types::RouterId::from(i),
                    r.name.clone(),
                    r.latency,
                    r.egress_ingress_bw,
                    r.ports_count,
                )
            })
            .collect();

        let mut topology = Topology::new(topology_name, egress_err, ingress_err);
        for host in &hosts {
            topology.add_host(host.id);
        }
        for router in &routers {
            topology.add_router(router.id);
        }
        for link in &link_specs {
            let src = resolve_node(&link.src, &hosts, &routers)?;
            let dst = resolve_node(&link.dst, &hosts, &routers)?;
            topology.add_link(link.name.clone(), link.latency, src, dst, &mut routers);
        }
        topology.seed_portions(&hosts, &routers);

        // Affinity rulesets.
        for rule in &affinity {
            let ms_id = ms_id_by_name(&microservices, &rule.microservice)?;
            let mut affinity_ms = Vec::new();
            for name in &rule.affinity_microservices {
                affinity_ms.push(ms_id_by_name(&microservices, name)?);
            }
            let mut antiaffinity_ms = Vec::new();
            for name in &rule.antiaffinity_microservices {
                antiaffinity_ms.push(ms_id_by_name(&microservices, name)?);
            }
            let ms = &mut microservices[ms_id.index()];
            ms.ms_affinity.extend(affinity_ms);
            ms.ms_antiaffinity.extend(antiaffinity_ms);
            for name in &rule.affinity_hosts {
                ms.host_affinity.insert(host_id_by_name(&hosts, name)?);
            }
            for name in &rule.antiaffinity_hosts {
                ms.host_antiaffinity.insert(host_id_by_name(&hosts, name)?);
            }
        }

        // Replicas, in microservice order.
        let mut replicas: Vec<Replica> = Vec::new();
        for ms in &mut microservices {
            for index_in_ms in 0..ms.replica_count {
                let rid = ReplicaId::from(replicas.len());
                replicas.push(Replica::new(rid, ms, index_in_ms));
                ms.replicas.push(rid);
            }
        }

        // Service-chain managers.
        let scms: Vec<ServiceChainManager> = service_chains
            .into_iter()
            .enumerate()
            .map(|(i, chain)| {
                let chain_name = chain.name.clone();
                ServiceChainManager::new(ScmId::from(i), chain_name, chain)
            })
            .collect();

        let mut cluster = Cluster::new(
            name.clone(),
            name.clone(),
            hosts,
            routers,
            topology,
            microservices,
            replicas,
            scms,
        );
        cluster.log_cpu_events = debug.log_cpu_events || debug.log_timeline;
        cluster.reschedule(placement.as_ref(), 0.0)?;

        // Merged arrival table: every (chain, profile) pair expands into
        // iterations x parallel_users requests.
        let mut arrivals: Vec<(u64, RequestId)> = Vec::new();
        for binding in &traffic {
            let scm = cluster
                .scm_by_name(&binding.service_chain)
                .ok_or_else(|| {
                    SimError::Config(format!(
                        "traffic references unknown service chain {}",
                        binding.service_chain
                    ))
                })?;
            let scm_id = scm.id;
            let subchains = scm.subchain_count();
            let profile = &binding.profile;
            for (iteration, &arrival) in profile.arrival_table().iter().enumerate() {
                for uid in 0..profile.parallel_users() {
                    let rq_num = iteration as u64 * profile.parallel_users() + uid;
                    let rid = RequestId::from(cluster.requests.len());
                    let key = format!(
                        "{name}_{}_{}_{rq_num}",
                        profile.name, binding.service_chain
                    );
                    cluster.requests.push(Request::new(
                        rid,
                        key,
                        scm_id,
                        subchains,
                        iteration as u64,
                        uid,
                        profile.name.clone(),
                        arrival as f64,
                    ));
                    arrivals.push((arrival, rid));
                }
            }
        }

        let load_generator = LoadGenerator::new(name.clone(), arrivals);

        let mut bus = EventBus::new();
        for event in events::ALL {
            bus.register_event(event);
        }
        if debug.debug_level > 0 {
            for event in events::ALL {
                bus.attach_observer(event, Box::new(TraceLogObserver));
            }
        }

        Ok(Self {
            name,
            cluster,
            load_generator,
            clock: SimClock::default(),
            bus,
            debug,
            placement,
        })
    }

    pub fn placement_policy(&self) -> &dyn PlacementPolicy {
        self.placement.as_ref()
    }

    /// Runs the driver to DONE. Idempotent once finished: with every
    /// request completed the loop exits immediately.
    pub fn run(&mut self) {
        self.load_generator
            .execute_traffic(&mut self.cluster, &mut self.clock, &mut self.bus);
    }

    /// Aggregates the latency table into the per-chain results document.
    pub fn results(&self) -> SimulationResults {
        build_results(&self.name, &self.cluster.latency_table, self.clock.now)
    }

    /// Per-host CPU utilization samples, keyed by host name. Empty unless
    /// CPU event logging was enabled.
    pub fn cpu_timelines(&self) -> BTreeMap<String, Vec<CpuSample>> {
        self.cluster
            .hosts
            .iter()
            .filter(|h| !h.cpu.timeline.is_empty())
            .map(|h| (h.name.clone(), h.cpu.timeline.clone()))
            .collect()
    }
}

fn validate_allocation(allocation: &ResourceAllocation) -> SimResult<()> {
    let ResourceAllocation {
        name,
        cpu_requests,
        cpu_limits,
        memory_requests,
        ingress_bw,
        egress_bw,
        ..
    } = allocation;
    if *cpu_requests != UNLIMITED && *cpu_requests <= 0 {
        return Err(SimError::Config(format!(
            "allocation {name}: cpu_requests must be positive or -1"
        )));
    }
    if *cpu_limits != UNLIMITED && *cpu_limits <= 0 {
        return Err(SimError::Config(format!(
            "allocation {name}: cpu_limits must be positive or -1"
        )));
    }
    if *cpu_requests != UNLIMITED && *cpu_limits != UNLIMITED && cpu_requests > cpu_limits {
        return Err(SimError::Config(format!(
            "allocation {name}: cpu_requests can't exceed cpu_limits"
        )));
    }
    if *memory_requests < 0.0 || *ingress_bw < 0.0 || *egress_bw < 0.0 {
        return Err(SimError::Config(format!(
            "allocation {name}: negative resource capacity"
        )));
    }
    Ok(())
}

fn resolve_node(name: &str, hosts: &[Host], routers: &[Router]) -> SimResult<TopologyNode> {
    if let Some(h) = hosts.iter().find(|h| h.name == name) {
        return Ok(TopologyNode::Host(h.id));
    }
    if let Some(r) = routers.iter().find(|r| r.name == name) {
        return Ok(TopologyNode::Router(r.id));
    }
    Err(SimError::Config(format!(
        "link endpoint {name} is neither a host nor a router"
    )))
}

fn ms_id_by_name(
    microservices: &[crate::service::microservice::Microservice],
    name: &str,
) -> SimResult<MsId> {
    microservices
        .iter()
        .find(|m| m.name == name)
        .map(|m| m.id)
        .ok_or_else(|| SimError::Config(format!("unknown microservice {name}")))
}

fn host_id_by_name(hosts: &[Host], name: &str) -> SimResult<HostId> {
    hosts
        .iter()
        .find(|h| h.name == name)
        .map(|h| h.id)
        .ok_or_else(|| SimError::Config(format!("unknown host {name}")))
}
