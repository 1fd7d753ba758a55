//! Scheduler behavior: enqueue/dequeue laws, share recomputation, and the
//! hierarchical load balancer.

mod common;

use latsim_core::equipments::run_queue::{dequeue_thread, enqueue_thread};
use latsim_types::{HostId, RequestId, MILLICORES_PER_CORE};

use common::{build, cpu_microservice, linear_chain, single_shot_profile, spec_for};

/// Spawns the first request's threads on host 0 and returns the host id.
fn spawn_first_request(sim: &mut latsim_core::Simulation) -> HostId {
    let (host, _) = sim.cluster.spawn_threads(0, RequestId::new(0), 0.0);
    sim.cluster.load_balance_host(host, 0.0);
    host
}

#[test]
fn four_threads_spread_over_four_cores() {
    let ms = cpu_microservice(0, "ms1", 4);
    let mut sim = build(spec_for(
        "lb4",
        vec![ms],
        linear_chain("sfc", 1, 0.0),
        1,
        4,
        single_shot_profile(),
    ));
    let host = spawn_first_request(&mut sim);

    let cpu = &sim.cluster.hosts[host.index()].cpu;
    let per_core: Vec<usize> = cpu
        .cores
        .iter()
        .map(|c| c.rq.active_threads.len())
        .collect();
    assert_eq!(per_core, vec![1, 1, 1, 1]);
    assert!(cpu.idle_cores.is_empty());
}

#[test]
fn two_threads_split_within_a_pair() {
    let ms = cpu_microservice(0, "ms1", 2);
    let mut sim = build(spec_for(
        "lb2",
        vec![ms],
        linear_chain("sfc", 1, 0.0),
        1,
        2,
        single_shot_profile(),
    ));
    let host = spawn_first_request(&mut sim);

    let cpu = &sim.cluster.hosts[host.index()].cpu;
    assert_eq!(cpu.cores[0].rq.active_threads.len(), 1);
    assert_eq!(cpu.cores[1].rq.active_threads.len(), 1);
}

#[test]
fn best_effort_thread_alone_gets_the_whole_core() {
    let ms = cpu_microservice(0, "ms1", 1);
    let mut sim = build(spec_for(
        "share1",
        vec![ms],
        linear_chain("sfc", 1, 0.0),
        1,
        1,
        single_shot_profile(),
    ));
    spawn_first_request(&mut sim);

    let thread = &sim.cluster.threads[0];
    assert_eq!(thread.share, MILLICORES_PER_CORE);
}

#[test]
fn share_recomputation_is_idempotent() {
    let mut ms = cpu_microservice(0, "ms1", 2);
    ms.cpu_requests = 800;
    ms.cpu_limits = 800;
    let mut sim = build(spec_for(
        "idem",
        vec![ms],
        linear_chain("sfc", 1, 0.0),
        1,
        1,
        single_shot_profile(),
    ));
    let host = spawn_first_request(&mut sim);

    let shares_before: Vec<f64> = sim.cluster.threads.iter().map(|t| t.share).collect();
    sim.cluster.load_balance_host(host, 0.0);
    sim.cluster.load_balance_host(host, 0.0);
    let shares_after: Vec<f64> = sim.cluster.threads.iter().map(|t| t.share).collect();
    assert_eq!(shares_before, shares_after);
    // Two guaranteed threads of an 800-millicore process get 400 each.
    assert_eq!(shares_after, vec![400.0, 400.0]);
}

#[test]
fn enqueue_then_dequeue_restores_the_receiving_core() {
    let ms = cpu_microservice(0, "ms1", 1);
    let mut sim = build(spec_for(
        "roundtrip",
        vec![ms],
        linear_chain("sfc", 1, 0.0),
        1,
        2,
        single_shot_profile(),
    ));
    let host_id = spawn_first_request(&mut sim);

    let tid = sim.cluster.threads[0].id;
    let origin_core = sim.cluster.threads[0].core.expect("enqueued");
    let target_core = 1 - origin_core;

    let snapshot = |sim: &latsim_core::Simulation| {
        let cpu = &sim.cluster.hosts[host_id.index()].cpu;
        let rq = &cpu.cores[target_core].rq;
        (
            rq.load,
            rq.guaranteed.sum_cpu_requests,
            rq.best_effort.sum_cpu_requests,
            rq.active_threads.clone(),
            rq.lightest.clone(),
            cpu.idle_cores.contains(&target_core),
        )
    };

    // Detach the thread, snapshot the empty sibling core, then push the
    // thread through it.
    {
        let cluster = &mut sim.cluster;
        let host = &mut cluster.hosts[host_id.index()];
        dequeue_thread(host, &mut cluster.threads, tid);
    }
    let before = snapshot(&sim);
    {
        let cluster = &mut sim.cluster;
        let host = &mut cluster.hosts[host_id.index()];
        enqueue_thread(
            host,
            target_core,
            &mut cluster.threads,
            &cluster.replicas,
            &mut cluster.scheduler,
            tid,
        );
        dequeue_thread(host, &mut cluster.threads, tid);
    }

    assert_eq!(snapshot(&sim), before);
}

#[test]
fn qos_partitions_hold_each_thread_exactly_once() {
    let mut guaranteed = cpu_microservice(0, "g", 1);
    guaranteed.cpu_requests = 500;
    guaranteed.cpu_limits = 500;
    let mut burstable = cpu_microservice(1, "b", 1);
    burstable.cpu_requests = 200;
    burstable.cpu_limits = -1;

    let mut sim = build(spec_for(
        "qos",
        vec![guaranteed, burstable],
        linear_chain("sfc", 2, 0.0),
        1,
        1,
        single_shot_profile(),
    ));
    // Spawn the root endpoint's thread (guaranteed class).
    spawn_first_request(&mut sim);

    let rq = &sim.cluster.hosts[0].cpu.cores[0].rq;
    for tid in &rq.active_threads {
        let memberships = [
            rq.best_effort.ids.contains(tid),
            rq.guaranteed.ids.contains(tid),
            rq.burstable_unlimited.ids.contains(tid),
            rq.burstable_limited.ids.contains(tid),
        ];
        assert_eq!(memberships.iter().filter(|m| **m).count(), 1);
    }
}

#[test]
fn active_threads_match_core_ownership_everywhere() {
    let ms = cpu_microservice(0, "ms1", 4);
    let mut sim = build(spec_for(
        "ownership",
        vec![ms],
        linear_chain("sfc", 1, 0.0),
        1,
        4,
        single_shot_profile(),
    ));
    let host_id = spawn_first_request(&mut sim);

    let cpu = &sim.cluster.hosts[host_id.index()].cpu;
    for (core_id, core) in cpu.cores.iter().enumerate() {
        for tid in &core.rq.active_threads {
            assert_eq!(sim.cluster.threads[tid.index()].core, Some(core_id));
        }
    }
    let total: usize = cpu.cores.iter().map(|c| c.rq.active_threads.len()).sum();
    assert_eq!(total, sim.cluster.scheduler.active_threads.len());
}
