//! End-to-end scenarios: single compute hops, network hops, forks that
//! join, bursts sharing a core, overcommit, and determinism.

mod common;

use latsim_core::{SimError, Simulation, TrafficProfile};
use latsim_types::SubchainStatus;

use common::{build, cpu_microservice, linear_chain, single_shot_profile, spec_for};

/// Ideal single-thread compute time without any cache penalty:
/// instructions * CPI / clock.
const IDEAL_COMPUTE_NS: f64 = 1_209_325_186.0 * 0.760_080_72 / 1.596_09;

fn run(mut sim: Simulation) -> Simulation {
    sim.run();
    sim
}

#[test]
fn single_thread_best_effort_latency() {
    let sim = run(build(spec_for(
        "single",
        vec![cpu_microservice(0, "ms1", 1)],
        linear_chain("sfc1", 1, 0.0),
        2,
        1,
        single_shot_profile(),
    )));

    assert_eq!(sim.cluster.latency_table.len(), 1);
    let row = &sim.cluster.latency_table[0];
    let latency = row.latency_ns as f64;

    // The ideal time (~5.759e8 ns) plus the calibrated cache penalty, which
    // stays within ~25% for a full-core thread.
    assert!(latency > IDEAL_COMPUTE_NS, "latency {latency} below ideal");
    assert!(
        latency < IDEAL_COMPUTE_NS * 1.25,
        "latency {latency} beyond plausible cache penalty"
    );
    assert_eq!(row.completion_ns - row.arrival_ns, row.latency_ns);
}

#[test]
fn two_guaranteed_threads_halve_the_core() {
    let mut single = cpu_microservice(0, "ms1", 1);
    single.cpu_requests = 1000;
    single.cpu_limits = 1000;
    let baseline = run(build(spec_for(
        "baseline",
        vec![single],
        linear_chain("sfc1", 1, 0.0),
        1,
        1,
        single_shot_profile(),
    )));
    let baseline_latency = baseline.cluster.latency_table[0].latency_ns as f64;

    let mut double = cpu_microservice(0, "ms1", 2);
    double.cpu_requests = 1000;
    double.cpu_limits = 1000;
    let sim = run(build(spec_for(
        "double",
        vec![double],
        linear_chain("sfc1", 1, 0.0),
        1,
        1,
        single_shot_profile(),
    )));
    let latency = sim.cluster.latency_table[0].latency_ns as f64;

    // Both threads share the one core; the request takes roughly twice the
    // single-thread baseline (contention adds a little on top).
    assert!(latency > baseline_latency * 1.9, "{latency} vs {baseline_latency}");
    assert!(latency < baseline_latency * 2.3, "{latency} vs {baseline_latency}");
}

#[test]
fn network_hop_adds_transmission_time() {
    // Two services on two hosts: one 100 kB transfer across the star.
    let sim = run(build(spec_for(
        "twohop",
        vec![cpu_microservice(0, "ms1", 1), cpu_microservice(1, "ms2", 1)],
        linear_chain("sfc1", 2, 100_000.0),
        2,
        1,
        single_shot_profile(),
    )));

    assert_eq!(sim.cluster.latency_table.len(), 1);
    let latency = sim.cluster.latency_table[0].latency_ns as f64;

    // 100 kB at the 117.3 MB/s NIC bottleneck plus two 420 us links and one
    // 730 us router hop.
    let transfer_ns = (100_000.0 / 117_300_000.0) * 1e9;
    let hop_latency_ns = 2.0 * 420_000.0 + 730_000.0;
    let expected_network = transfer_ns + hop_latency_ns;

    let single_compute = {
        let one = run(build(spec_for(
            "onehop",
            vec![cpu_microservice(0, "ms1", 1)],
            linear_chain("sfc1", 1, 0.0),
            1,
            1,
            single_shot_profile(),
        )));
        one.cluster.latency_table[0].latency_ns as f64
    };

    let network_share = latency - 2.0 * single_compute;
    assert!(
        (network_share - expected_network).abs() < expected_network * 0.01,
        "network share {network_share} vs expected {expected_network}"
    );

    // The replicas were spread over both hosts.
    assert_eq!(sim.cluster.placement_matrix.counts[0], vec![1, 0]);
    assert_eq!(sim.cluster.placement_matrix.counts[1], vec![0, 1]);
}

#[test]
fn fork_join_concludes_only_after_both_branches() {
    // Diamond: a -> b -> d, a -> c -> d, d -> e, all on one 4-core host.
    let microservices: Vec<_> = (0..5)
        .map(|i| cpu_microservice(i, &format!("ms{i}"), 1))
        .collect();
    let mut chain = latsim_core::ServiceChain::new("diamond");
    for i in 0..5 {
        chain.add_node(common::endpoint_ref(i));
    }
    let edge = |name: &str| latsim_core::ChainEdge {
        name: name.into(),
        payload: 10_000.0,
    };
    chain.add_edge(common::endpoint_ref(0), common::endpoint_ref(1), edge("ab"));
    chain.add_edge(common::endpoint_ref(0), common::endpoint_ref(2), edge("ac"));
    chain.add_edge(common::endpoint_ref(1), common::endpoint_ref(3), edge("bd"));
    chain.add_edge(common::endpoint_ref(2), common::endpoint_ref(3), edge("cd"));
    chain.add_edge(common::endpoint_ref(3), common::endpoint_ref(4), edge("de"));

    let sim = run(build(spec_for(
        "diamond",
        microservices,
        chain,
        1,
        4,
        single_shot_profile(),
    )));

    assert_eq!(sim.cluster.completed_requests, 1);
    let request = &sim.cluster.requests[0];
    assert_eq!(request.subchain_count(), 3);
    assert!(request
        .subchain_status
        .iter()
        .all(|s| *s == SubchainStatus::Concluded));
    assert!(request.is_completed());

    // The join node ran once per branch: 6 threads total over 5 services.
    assert_eq!(sim.cluster.threads.len(), 6);
}

#[test]
fn burst_on_one_core_scales_latency_with_concurrency() {
    // 3 batches/s x 2 parallel users for 1 s, guaranteed-100, one core.
    let mut ms = cpu_microservice(0, "ms1", 1);
    ms.cpu_requests = 100;
    ms.cpu_limits = 100;
    let profile = TrafficProfile::new("3batchps_1sec_2paralleluser", 333_333_333, 1, 2, 0);
    let sim = run(build(spec_for(
        "burst",
        vec![ms],
        linear_chain("sfc1", 1, 0.0),
        1,
        1,
        profile,
    )));

    assert_eq!(sim.cluster.latency_table.len(), 6);
    assert_eq!(sim.cluster.completed_requests, 6);

    // Later arrivals overlap more concurrent requests on the same 100
    // millicores, so per-iteration latency is non-decreasing.
    let mut by_iteration: Vec<(u64, u64)> = sim
        .cluster
        .latency_table
        .iter()
        .map(|row| (row.iteration_id, row.latency_ns))
        .collect();
    by_iteration.sort();
    assert!(by_iteration.windows(2).all(|w| w[1].1 >= w[0].1));
}

#[test]
fn overcommitted_placement_is_refused() {
    let mut ms = cpu_microservice(0, "ms1", 1);
    ms.cpu_requests = 800;
    ms.cpu_limits = 800;
    ms.replica_count = 2;

    let result = Simulation::new(spec_for(
        "overcommit",
        vec![ms],
        linear_chain("sfc1", 1, 0.0),
        1,
        1,
        single_shot_profile(),
    ));
    assert!(matches!(result, Err(SimError::ResourceUnavailable(_))));
}

#[test]
fn no_requests_when_interval_exceeds_duration() {
    let profile = TrafficProfile::new("too_slow", 2_000_000_000, 1, 1, 0);
    let sim = run(build(spec_for(
        "empty",
        vec![cpu_microservice(0, "ms1", 1)],
        linear_chain("sfc1", 1, 0.0),
        1,
        1,
        profile,
    )));
    assert_eq!(sim.cluster.completed_requests, 0);
    assert!(sim.cluster.latency_table.is_empty());
}

#[test]
fn identical_scenarios_produce_identical_latency_sequences() {
    let build_burst = || {
        let mut ms = cpu_microservice(0, "ms1", 2);
        ms.cpu_requests = 500;
        ms.cpu_limits = -1; // unlimited burstable
        let profile = TrafficProfile::new("2batchps_1sec_2paralleluser", 500_000_000, 1, 2, 0);
        build(spec_for(
            "determinism",
            vec![ms, cpu_microservice(1, "ms2", 1)],
            linear_chain("sfc1", 2, 50_000.0),
            2,
            2,
            profile,
        ))
    };

    let a = run(build_burst());
    let b = run(build_burst());

    let latencies = |sim: &Simulation| -> Vec<(String, u64, u64)> {
        sim.cluster
            .latency_table
            .iter()
            .map(|r| (r.request_key.clone(), r.latency_ns, r.completion_ns))
            .collect()
    };
    assert_eq!(latencies(&a), latencies(&b));
    assert!(!a.cluster.latency_table.is_empty());
}

#[test]
fn completed_requests_satisfy_latency_identity() {
    let profile = TrafficProfile::new("2batchps_1sec_1paralleluser", 500_000_000, 1, 1, 0);
    let sim = run(build(spec_for(
        "identity",
        vec![cpu_microservice(0, "ms1", 1), cpu_microservice(1, "ms2", 1)],
        linear_chain("sfc1", 2, 100_000.0),
        2,
        2,
        profile,
    )));

    assert!(!sim.cluster.latency_table.is_empty());
    for row in &sim.cluster.latency_table {
        assert_eq!(row.latency_ns, row.completion_ns - row.arrival_ns);
        assert!(row.completion_ns >= row.arrival_ns);
        assert_eq!(row.status, "COMPLETED");
    }

    let results = sim.results();
    let sfc = &results.service_chains["sfc1"];
    assert_eq!(sfc.total_requests, 2);
    assert_eq!(sfc.successful_requests, 2);
    assert_eq!(sfc.timeout_requests, 0);
    let bucket_total: u64 = sfc.throughput.values().sum();
    assert_eq!(bucket_total, 2);
}
