//! Shared scenario fixtures: the calibrated sfc-stress compute profile on
//! 1.59609 GHz hosts behind a 10 Gbps router with 420 us links.
#![allow(dead_code)] // each test binary uses a subset of the fixtures

use latsim_core::{
    ChainEdge, DebugOptions, Endpoint, EndpointRef, HostSpec, LeastFit, LeastFitWeights,
    LinkSpec, Microservice, RouterSpec, ServiceChain, Simulation, SimulationSpec, ThreadSpec,
    TrafficBinding, TrafficProfile,
};
use latsim_types::{EndpointId, MsId};

pub const CLOCK_HZ: f64 = 1_596_090_000.0;

pub fn host_spec(cores: usize) -> HostSpec {
    HostSpec {
        cpu_core_count: cores,
        cpu_clock_rate: CLOCK_HZ,
        memory_capacity: 16.0 * 1024.0 * 1024.0 * 1024.0,
        ram_speed: 2_675_787_694.0,
        storage_capacity: 1e12,
        storage_speed: 1.0695e7,
        network_bandwidth: 117_300_000.0,
    }
}

pub fn calibrated_thread_spec() -> ThreadSpec {
    ThreadSpec {
        instructions: 1_209_325_186.0,
        avg_cpi: 0.760_080_72,
        avg_cpu_usage: 1.0,
        avg_mem_accesses: 414_016_086.0,
        isolated_cache_misses: 75_266.0,
        isolated_cache_refs: 799_434.0,
        avg_cache_miss_penalty: 5.71,
        avg_blkio_rw: 0.0,
    }
}

/// A microservice with one `compute` endpoint spawning `threads` calibrated
/// threads. Best-effort with one replica unless reconfigured by the caller.
pub fn cpu_microservice(id: usize, name: &str, threads: usize) -> Microservice {
    let mut ms = Microservice::new(MsId::from(id), name);
    ms.replica_count = 1;
    ms.endpoints.push(Endpoint {
        id: EndpointId::new(0),
        name: "compute".into(),
        threads: vec![calibrated_thread_spec(); threads],
        request_timeout: -1.0,
    });
    ms
}

pub fn endpoint_ref(ms: usize) -> EndpointRef {
    EndpointRef {
        ms: MsId::from(ms),
        endpoint: EndpointId::new(0),
    }
}

/// A linear chain over microservices 0..n with `payload`-byte edges.
pub fn linear_chain(name: &str, services: usize, payload: f64) -> ServiceChain {
    let mut chain = ServiceChain::new(name);
    for ms in 0..services {
        chain.add_node(endpoint_ref(ms));
    }
    for ms in 1..services {
        chain.add_edge(
            endpoint_ref(ms - 1),
            endpoint_ref(ms),
            ChainEdge {
                name: format!("e{ms}"),
                payload,
            },
        );
    }
    chain
}

/// Star topology: every host has an up and a down link to one router.
pub fn star_topology(
    host_count: usize,
    cores: usize,
) -> (Vec<(String, HostSpec)>, Vec<RouterSpec>, Vec<LinkSpec>) {
    let hosts = (0..host_count)
        .map(|i| (format!("h{i}"), host_spec(cores)))
        .collect();
    let routers = vec![RouterSpec {
        name: "r0".into(),
        latency: 730_000.0,
        egress_ingress_bw: 1_250_000_000.0,
        ports_count: 101,
    }];
    let mut links = Vec::new();
    for i in 0..host_count {
        links.push(LinkSpec {
            name: format!("l{i}_up"),
            latency: 420_000.0,
            src: format!("h{i}"),
            dst: "r0".into(),
        });
        links.push(LinkSpec {
            name: format!("l{i}_down"),
            latency: 420_000.0,
            src: "r0".into(),
            dst: format!("h{i}"),
        });
    }
    (hosts, routers, links)
}

pub fn single_shot_profile() -> TrafficProfile {
    TrafficProfile::new("1batchps_1sec_1paralleluser", 1_000_000_000, 1, 1, 0)
}

pub fn spec_for(
    name: &str,
    microservices: Vec<Microservice>,
    chain: ServiceChain,
    host_count: usize,
    cores: usize,
    profile: TrafficProfile,
) -> SimulationSpec {
    let chain_name = chain.name.clone();
    let (hosts, routers, links) = star_topology(host_count, cores);
    SimulationSpec {
        name: name.into(),
        microservices,
        service_chains: vec![chain],
        topology_name: "star".into(),
        hosts,
        routers,
        links,
        egress_err: 0.05,
        ingress_err: 0.05,
        placement: Box::new(LeastFit::new("least_fit", LeastFitWeights::default())),
        scaling: Vec::new(),
        affinity: Vec::new(),
        traffic: vec![TrafficBinding {
            service_chain: chain_name,
            profile,
        }],
        network_timeout: -1.0,
        debug: DebugOptions::default(),
    }
}

pub fn build(spec: SimulationSpec) -> Simulation {
    Simulation::new(spec).expect("scenario assembles")
}
