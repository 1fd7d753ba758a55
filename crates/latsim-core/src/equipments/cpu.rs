//! The per-host CPU model: cores, pair topology, sorted load indices, and
//! the hierarchical load balancer.
//!
//! Scheduling domains mirror a two-level Linux hierarchy: `core-pairs`
//! (cores 2k and 2k+1) and `node` (the whole CPU). Balancing pulls the
//! lightest movable thread towards an under-loaded core whenever the donor
//! stays at least as loaded as the receiver, compared at five decimal
//! places. Emergency theft gives still-idle cores the heaviest thread whose
//! donor keeps at least one runnable thread.
//!
//! Every sorted index (threads by load, pairs by load, idle sets, the
//! per-core lightest index) is co-updated on each mutation through the
//! helpers in this module; reading paths may assume they are consistent.

use std::collections::BTreeSet;

use latsim_types::{round5, OrderedFloat, ThreadId, MILLICORES_PER_CORE};

use crate::cluster::ClusterScheduler;
use crate::equipments::host::Host;
use crate::equipments::resource::Resource;
use crate::equipments::run_queue::{dequeue_thread, enqueue_thread, RunQueue, ThreadKey};
use crate::error::SimResult;
use crate::service::microservice::Replica;
use crate::service::thread::ReplicaThread;

// ============================================================================
// Cores and the CPU
// ============================================================================

#[derive(Debug, Clone)]
pub struct Core {
    pub pair_id: usize,
    /// Reservable shares, 1000 millicores per core.
    pub shares: Resource,
    pub rq: RunQueue,
}

/// One utilization sample per load-balance pass, when sampling is enabled.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CpuSample {
    pub time_ns: f64,
    pub core_loads: Vec<f64>,
    pub core_threads: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Cpu {
    pub name: String,
    clock_rate_hz: f64,
    clock_rate_per_ns: f64,
    pub cores: Vec<Core>,

    /// All CPU threads ordered by (-load, vruntime, id): heaviest first.
    pub threads_sorted: BTreeSet<ThreadKey>,
    /// Pairs ordered by (-pair load, pair id): busiest first. Pairs appear
    /// once their load first changes.
    pub pairs_sorted: BTreeSet<(OrderedFloat<f64>, usize)>,
    pub pairs_load: Vec<f64>,
    /// Idle cores per pair.
    pub idle_cores_in_pair: Vec<BTreeSet<usize>>,
    /// Pairs whose cores are all idle.
    pub idle_pairs: BTreeSet<usize>,
    pub idle_cores: BTreeSet<usize>,

    /// Per-core utilization time series, populated when sampling is on.
    pub timeline: Vec<CpuSample>,
}

/// The two balancing domains, walked in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedDomain {
    CorePairs,
    Node,
}

impl Cpu {
    pub fn new(name: impl Into<String>, cores_count: usize, clock_rate_hz: f64) -> Self {
        let name = name.into();
        assert!(cores_count > 0, "CPU {name} needs at least one core");

        let pair_count = cores_count.div_ceil(2);
        let mut cores = Vec::with_capacity(cores_count);
        let mut idle_cores_in_pair = vec![BTreeSet::new(); pair_count];
        let mut idle_cores = BTreeSet::new();
        let mut idle_pairs = BTreeSet::new();
        for core_id in 0..cores_count {
            let pair_id = core_id / 2;
            cores.push(Core {
                pair_id,
                shares: Resource::new(
                    format!("{name}_core{core_id}_shares"),
                    MILLICORES_PER_CORE,
                ),
                rq: RunQueue::default(),
            });
            idle_cores_in_pair[pair_id].insert(core_id);
            idle_cores.insert(core_id);
            idle_pairs.insert(pair_id);
        }

        Self {
            name,
            clock_rate_hz,
            clock_rate_per_ns: clock_rate_hz / 1e9,
            cores,
            threads_sorted: BTreeSet::new(),
            pairs_sorted: BTreeSet::new(),
            pairs_load: vec![0.0; pair_count],
            idle_cores_in_pair,
            idle_pairs,
            idle_cores,
            timeline: Vec::new(),
        }
    }

    pub fn clock_rate_hz(&self) -> f64 {
        self.clock_rate_hz
    }

    /// Clock cycles per nanosecond.
    pub fn clock_rate_per_ns(&self) -> f64 {
        self.clock_rate_per_ns
    }

    pub fn capacity(&self) -> f64 {
        self.cores.iter().map(|c| c.shares.capacity).sum()
    }

    pub fn available(&self) -> f64 {
        self.cores.iter().map(|c| c.shares.available()).sum()
    }

    pub fn can_reserve(&self, amount: f64) -> bool {
        self.available() >= amount
    }

    /// Whether every core can take its uniform slice of `amount`.
    pub fn can_reserve_uniform(&self, amount: f64) -> bool {
        let per_core = (amount / self.cores.len() as f64).round();
        self.cores.iter().all(|c| c.shares.can_reserve(per_core))
    }

    /// Uniformly reserves `amount` millicores across all cores.
    pub fn reserve(&mut self, amount: f64) -> SimResult<()> {
        let per_core = (amount / self.cores.len() as f64).round();
        for core in &self.cores {
            if !core.shares.can_reserve(per_core) {
                return Err(crate::error::SimError::ResourceUnavailable(format!(
                    "cannot reserve {per_core} millicores per core on {}",
                    self.name
                )));
            }
        }
        for core in &mut self.cores {
            core.shares.reserve(per_core)?;
        }
        Ok(())
    }

    /// Uniformly releases `amount` millicores across all cores.
    pub fn release(&mut self, amount: f64) {
        let per_core = (amount / self.cores.len() as f64).round();
        for core in &mut self.cores {
            core.shares.release(per_core);
        }
    }

    /// The sibling of `core_id` in its pair; `None` when the pair has a
    /// single core (odd trailing core).
    pub fn other_core_in_pair(&self, core_id: usize) -> Option<usize> {
        if core_id % 2 == 0 {
            if core_id + 1 < self.cores.len() {
                Some(core_id + 1)
            } else {
                None
            }
        } else {
            Some(core_id - 1)
        }
    }

    fn active_count(&self, core_id: usize) -> usize {
        self.cores[core_id].rq.active_threads.len()
    }

    /// Records one utilization sample across all cores.
    pub fn sample_timeline(&mut self, now: f64) {
        let core_loads = self.cores.iter().map(|c| c.rq.load).collect();
        let core_threads = self
            .cores
            .iter()
            .map(|c| c.rq.active_threads.len())
            .collect();
        self.timeline.push(CpuSample {
            time_ns: now,
            core_loads,
            core_threads,
        });
    }
}

// ============================================================================
// Index maintenance
// ============================================================================

/// Adds a thread to the CPU-wide thread-load index and, when it sits on a
/// core, to that core's lightest-thread index.
pub fn index_thread(cpu: &mut Cpu, thread: &ReplicaThread) {
    cpu.threads_sorted.insert((
        OrderedFloat(-thread.load),
        OrderedFloat(thread.vruntime),
        thread.id,
    ));
    if let Some(core_id) = thread.core {
        cpu.cores[core_id].rq.lightest.insert((
            OrderedFloat(thread.load),
            OrderedFloat(thread.vruntime),
            thread.id,
        ));
    }
}

/// Removes a thread from both sorted indices, keyed by its current load and
/// vruntime. Call before mutating either field.
pub fn remove_thread_index(cpu: &mut Cpu, thread: &ReplicaThread) {
    cpu.threads_sorted.remove(&(
        OrderedFloat(-thread.load),
        OrderedFloat(thread.vruntime),
        thread.id,
    ));
    if let Some(core_id) = thread.core {
        cpu.cores[core_id].rq.lightest.remove(&(
            OrderedFloat(thread.load),
            OrderedFloat(thread.vruntime),
            thread.id,
        ));
    }
}

/// Sets a run queue's load, keeping the pair load and the busiest-pair
/// index in step.
pub fn set_rq_load(cpu: &mut Cpu, core_id: usize, new_load: f64) {
    if cpu.cores[core_id].rq.load == new_load {
        return;
    }
    let pair_id = cpu.cores[core_id].pair_id;
    cpu.pairs_sorted
        .remove(&(OrderedFloat(-cpu.pairs_load[pair_id]), pair_id));
    cpu.cores[core_id].rq.load = new_load;
    let pair_load = match cpu.other_core_in_pair(core_id) {
        Some(other) => cpu.cores[other].rq.load + new_load,
        None => new_load,
    };
    cpu.pairs_load[pair_id] = pair_load;
    cpu.pairs_sorted.insert((OrderedFloat(-pair_load), pair_id));
}

/// Assigns a millicore share to an enqueued thread, propagating the delta
/// into its QoS partition sums and recomputing its load.
///
/// # Panics
///
/// Panics when the share exceeds one core; recomputation never produces
/// such a share on purpose.
pub fn set_thread_share(
    cpu: &mut Cpu,
    threads: &mut [ReplicaThread],
    tid: ThreadId,
    new_share: f64,
) {
    let (qos, old_share, core, on_rq) = {
        let t = &threads[tid.index()];
        (t.qos, t.share, t.core, t.on_rq)
    };
    assert!(on_rq, "share assigned to an off-runqueue thread");
    assert!(
        new_share <= MILLICORES_PER_CORE + 1e-9,
        "share {new_share} exceeds one core"
    );

    let delta = new_share - old_share;
    if let Some(core_id) = core {
        if delta != 0.0 {
            cpu.cores[core_id].rq.apply_share_delta(qos, delta);
        }
    }

    threads[tid.index()].share = new_share;
    let new_load = threads[tid.index()].load_for_share(new_share);
    set_thread_load(cpu, threads, tid, new_load);
}

/// Sets a thread's load, reindexing it and shifting its run queue's load.
pub fn set_thread_load(
    cpu: &mut Cpu,
    threads: &mut [ReplicaThread],
    tid: ThreadId,
    new_load: f64,
) {
    let (core, old_load, average_load) = {
        let t = &threads[tid.index()];
        (t.core, t.load, t.average_load)
    };
    match core {
        None => threads[tid.index()].load = new_load,
        Some(core_id) if old_load != new_load => {
            remove_thread_index(cpu, &threads[tid.index()]);
            threads[tid.index()].load = new_load;
            let rq_load = cpu.cores[core_id].rq.load + average_load * (new_load - old_load);
            set_rq_load(cpu, core_id, rq_load);
            index_thread(cpu, &threads[tid.index()]);
        }
        Some(_) => {}
    }
}

/// Refreshes the pair/core idle sets after a queue membership change on
/// `core_id`.
pub fn update_idle_pairs(cpu: &mut Cpu, core_id: usize) {
    let pair_id = cpu.cores[core_id].pair_id;
    let own_active = cpu.active_count(core_id);
    let pair_active = own_active
        + cpu
            .other_core_in_pair(core_id)
            .map_or(0, |other| cpu.active_count(other));

    if pair_active > 0 {
        cpu.idle_cores_in_pair[pair_id].remove(&core_id);
        if cpu.idle_cores_in_pair[pair_id].len() != 2 {
            cpu.idle_pairs.remove(&pair_id);
        }
    } else {
        cpu.idle_cores_in_pair[pair_id].insert(core_id);
        cpu.idle_pairs.insert(pair_id);
    }

    if own_active == 0 {
        cpu.idle_cores.insert(core_id);
    } else {
        cpu.idle_cores.remove(&core_id);
    }
}

// ============================================================================
// Balancing
// ============================================================================

impl Cpu {
    /// The idle core this domain would route work to, seen from `core_id`.
    fn idle_core_in_domain(&self, domain: SchedDomain, core_id: usize) -> Option<usize> {
        match domain {
            SchedDomain::CorePairs => {
                let pair_id = self.cores[core_id].pair_id;
                let sibling = self.other_core_in_pair(core_id).unwrap_or(core_id);
                if self.idle_cores_in_pair[pair_id].contains(&sibling) {
                    Some(sibling)
                } else if self.idle_cores.contains(&core_id) {
                    Some(core_id)
                } else {
                    None
                }
            }
            SchedDomain::Node => self.idle_pairs.first().map(|pair_id| {
                *self.idle_cores_in_pair[*pair_id]
                    .first()
                    .expect("idle pair with no idle core")
            }),
        }
    }

    /// Busier of `core_id` and its sibling; load ties break on thread count.
    fn busiest_core_in_pair_by_core(&self, core_id: usize) -> usize {
        let Some(other) = self.other_core_in_pair(core_id) else {
            return core_id;
        };
        let own = self.cores[core_id].rq.load;
        let sibling = self.cores[other].rq.load;
        if own > sibling {
            core_id
        } else if own < sibling {
            other
        } else if self.active_count(core_id) >= self.active_count(other) {
            core_id
        } else {
            other
        }
    }

    fn busiest_core_in_pair(&self, pair_id: usize) -> usize {
        self.busiest_core_in_pair_by_core(pair_id * 2)
    }

    /// Busiest core of the globally busiest pair, or `None` when the
    /// current pair already matches the maximum.
    ///
    /// # Panics
    ///
    /// Panics when the busiest-pair index reports a pair lighter than the
    /// current one; that would mean the index went stale.
    fn busiest_core_in_busiest_pair(&self, current_pair_id: usize) -> Option<usize> {
        let (inverted_load, busiest_pair) = *self.pairs_sorted.first()?;
        let busiest_load = -inverted_load.0;
        assert!(
            self.pairs_load[current_pair_id] <= busiest_load,
            "busiest pair (load {busiest_load}) lighter than pair {current_pair_id} \
             (load {})",
            self.pairs_load[current_pair_id]
        );
        if self.pairs_load[current_pair_id] == busiest_load {
            return None;
        }
        Some(self.busiest_core_in_pair(busiest_pair))
    }
}

/// One full hierarchical balancing pass over `host`'s CPU: for each core,
/// first settle its pair, then pull from the globally busiest pair. Clears
/// the host's dirty mark.
pub fn load_balance_runqueues(
    host: &mut Host,
    threads: &mut [ReplicaThread],
    replicas: &[Replica],
    scheduler: &mut ClusterScheduler,
) {
    let cores_count = host.cpu.cores.len();

    for core_id in 0..cores_count {
        for domain in [SchedDomain::CorePairs, SchedDomain::Node] {
            if let Some(idle) = host.cpu.idle_core_in_domain(domain, core_id) {
                if idle != core_id {
                    continue;
                }
            }

            loop {
                let moved = match domain {
                    SchedDomain::CorePairs => balance_within_pair(host, threads, replicas, scheduler, core_id),
                    SchedDomain::Node => balance_from_busiest_pair(host, threads, replicas, scheduler, core_id),
                };
                if !moved {
                    break;
                }
            }
        }
    }

    host.load_balancing_needed = false;
    scheduler.hosts_need_load_balancing.remove(&host.id);
}

/// Pair-level step: move the sibling's lightest thread here when the
/// sibling keeps at least the receiving core's new load. Returns whether a
/// move happened.
fn balance_within_pair(
    host: &mut Host,
    threads: &mut [ReplicaThread],
    replicas: &[Replica],
    scheduler: &mut ClusterScheduler,
    core_id: usize,
) -> bool {
    let busiest = host.cpu.busiest_core_in_pair_by_core(core_id);
    if busiest == core_id || host.cpu.active_count(busiest) <= 1 {
        return false;
    }
    let Some((load, _, tid)) = host.cpu.cores[busiest].rq.lightest_thread() else {
        return false;
    };
    let lightest_load = load.0;
    let local_new = host.cpu.cores[core_id].rq.load + lightest_load;
    let busiest_new = host.cpu.cores[busiest].rq.load - lightest_load;
    if round5(busiest_new) < round5(local_new) {
        return false;
    }

    dequeue_thread(host, threads, tid);
    enqueue_thread(host, core_id, threads, replicas, scheduler, tid);
    true
}

/// Node-level step: pull the lightest thread from the busiest core of the
/// busiest pair (falling back to its sibling) under the pair-load
/// postcondition. Returns whether a move happened.
fn balance_from_busiest_pair(
    host: &mut Host,
    threads: &mut [ReplicaThread],
    replicas: &[Replica],
    scheduler: &mut ClusterScheduler,
    core_id: usize,
) -> bool {
    let current_pair = host.cpu.cores[core_id].pair_id;
    let Some(busiest_core) = host.cpu.busiest_core_in_busiest_pair(current_pair) else {
        return false;
    };

    let sibling = host.cpu.other_core_in_pair(busiest_core);
    let total_threads_in_pair = host.cpu.active_count(busiest_core)
        + sibling.map_or(0, |other| host.cpu.active_count(other));
    if total_threads_in_pair <= 1 {
        return false;
    }

    let candidates = [Some(busiest_core), sibling];
    for donor in candidates.into_iter().flatten() {
        let Some((load, _, tid)) = host.cpu.cores[donor].rq.lightest_thread() else {
            continue;
        };
        let lightest_load = load.0;
        let donor_pair = host.cpu.cores[donor].pair_id;
        let local_new = host.cpu.pairs_load[current_pair] + lightest_load;
        let donor_new = host.cpu.pairs_load[donor_pair] - lightest_load;
        if round5(donor_new) >= round5(local_new) {
            dequeue_thread(host, threads, tid);
            assert!(
                threads[tid.index()].instructions > 0.0,
                "zombie thread {} selected by node-level balancing",
                threads[tid.index()].key
            );
            enqueue_thread(host, core_id, threads, replicas, scheduler, tid);
            return true;
        }
    }
    false
}

/// Gives each still-idle core the heaviest thread whose donor core keeps at
/// least one runnable thread.
pub fn emergency_balance_idle_cores(
    host: &mut Host,
    threads: &mut [ReplicaThread],
    replicas: &[Replica],
    scheduler: &mut ClusterScheduler,
) {
    let idle: Vec<usize> = host.cpu.idle_cores.iter().copied().collect();
    for core_id in idle {
        let mut steal = None;
        for (_, _, tid) in &host.cpu.threads_sorted {
            let thread = &threads[tid.index()];
            if !thread.on_rq || thread.load <= 0.0 || thread.instructions <= 0.0 {
                continue;
            }
            let Some(donor) = thread.core else { continue };
            if donor == core_id || host.cpu.cores[donor].rq.rq.len() <= 1 {
                continue;
            }
            steal = Some(*tid);
            break;
        }
        if let Some(tid) = steal {
            dequeue_thread(host, threads, tid);
            enqueue_thread(host, core_id, threads, replicas, scheduler, tid);
        }
    }
}
