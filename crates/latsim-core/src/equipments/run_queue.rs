//! Per-core run queues.
//!
//! Each core keeps its threads in insertion order, partitioned by QoS class,
//! plus an ordered lightest-thread index so pair-level balancing can move
//! the cheapest thread away from a busy sibling in O(log n). QoS partitions
//! cache the sum of their members' millicore shares; the sums are maintained
//! incrementally by every share assignment.

use std::collections::BTreeSet;

use latsim_types::{OrderedFloat, QosClass, ThreadId, MILLICORES_PER_CORE};

use crate::cluster::ClusterScheduler;
use crate::equipments::cpu::{
    self, index_thread, remove_thread_index, set_rq_load, set_thread_share,
};
use crate::equipments::host::Host;
use crate::service::microservice::Replica;
use crate::service::thread::ReplicaThread;

/// Ordered index key: (load, vruntime, thread id). The id tiebreak makes
/// picks deterministic for threads sharing both load and vruntime.
pub type ThreadKey = (OrderedFloat<f64>, OrderedFloat<f64>, ThreadId);

// ============================================================================
// QoS partitions
// ============================================================================

/// One QoS partition of a run queue, caching the sum of member shares.
#[derive(Debug, Clone, Default)]
pub struct QosSet {
    pub ids: BTreeSet<ThreadId>,
    pub sum_cpu_requests: f64,
}

impl QosSet {
    fn add(&mut self, thread: &ReplicaThread) {
        self.sum_cpu_requests += thread.share;
        self.ids.insert(thread.id);
    }

    fn remove(&mut self, thread: &ReplicaThread) {
        self.sum_cpu_requests -= thread.share;
        self.ids.remove(&thread.id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// ============================================================================
// Run queue
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RunQueue {
    /// Threads in enqueue order.
    pub rq: Vec<ThreadId>,
    /// Same set, O(log n) membership.
    pub active_threads: BTreeSet<ThreadId>,

    pub best_effort: QosSet,
    pub guaranteed: QosSet,
    pub burstable: QosSet,
    pub burstable_unlimited: QosSet,
    pub burstable_limited: QosSet,

    /// Lightest-thread index, ordered by (load, vruntime, id).
    pub lightest: BTreeSet<ThreadKey>,

    /// Σ thread.average_load · thread.load over enqueued threads. Mutated
    /// only through [`cpu::set_rq_load`] so pair loads stay in step.
    pub load: f64,
}

impl RunQueue {
    /// Files a thread into the partition matching its QoS class. Burstable
    /// threads live in both the umbrella burstable set and exactly one of
    /// the unlimited/limited subsets.
    pub fn categorize(&mut self, thread: &ReplicaThread) {
        match thread.qos {
            QosClass::BestEffort => self.best_effort.add(thread),
            QosClass::Guaranteed => self.guaranteed.add(thread),
            QosClass::BurstableUnlimited => {
                self.burstable.add(thread);
                self.burstable_unlimited.add(thread);
            }
            QosClass::BurstableLimited => {
                self.burstable.add(thread);
                self.burstable_limited.add(thread);
            }
        }
    }

    pub fn decategorize(&mut self, thread: &ReplicaThread) {
        match thread.qos {
            QosClass::BestEffort => self.best_effort.remove(thread),
            QosClass::Guaranteed => self.guaranteed.remove(thread),
            QosClass::BurstableUnlimited => {
                self.burstable.remove(thread);
                self.burstable_unlimited.remove(thread);
            }
            QosClass::BurstableLimited => {
                self.burstable.remove(thread);
                self.burstable_limited.remove(thread);
            }
        }
    }

    /// Applies a share delta to the partitions containing the thread.
    pub fn apply_share_delta(&mut self, qos: QosClass, delta: f64) {
        match qos {
            QosClass::BestEffort => self.best_effort.sum_cpu_requests += delta,
            QosClass::Guaranteed => self.guaranteed.sum_cpu_requests += delta,
            QosClass::BurstableUnlimited => {
                self.burstable.sum_cpu_requests += delta;
                self.burstable_unlimited.sum_cpu_requests += delta;
            }
            QosClass::BurstableLimited => {
                self.burstable.sum_cpu_requests += delta;
                self.burstable_limited.sum_cpu_requests += delta;
            }
        }
    }

    /// The lightest enqueued thread, if any.
    pub fn lightest_thread(&self) -> Option<ThreadKey> {
        self.lightest.first().copied()
    }
}

// ============================================================================
// Enqueue / dequeue
// ============================================================================

/// Enqueues a thread on `core_id` of `host`, wiring up every index: the QoS
/// partitions, the per-core lightest index, the CPU-wide thread-load index,
/// pair loads and idle sets, plus the host and cluster activity marks.
///
/// # Panics
///
/// Panics when the thread already belongs to a core, or is a zombie.
pub fn enqueue_thread(
    host: &mut Host,
    core_id: usize,
    threads: &mut [ReplicaThread],
    replicas: &[Replica],
    scheduler: &mut ClusterScheduler,
    tid: ThreadId,
) {
    let thread = &mut threads[tid.index()];
    assert!(
        thread.core.is_none(),
        "thread {} already belongs to a core",
        thread.key
    );
    assert!(
        thread.instructions > 0.0,
        "zombie thread {} enqueued on a run queue",
        thread.key
    );
    assert!(thread.on_rq, "off-runqueue thread {} enqueued", thread.key);

    thread.core = Some(core_id);
    index_thread(&mut host.cpu, thread);

    let rq = &mut host.cpu.cores[core_id].rq;
    rq.rq.push(tid);
    rq.active_threads.insert(tid);
    rq.categorize(thread);
    scheduler.active_threads.insert(tid);

    let added_load = thread.average_load * thread.load;
    let new_load = host.cpu.cores[core_id].rq.load + added_load;
    set_rq_load(&mut host.cpu, core_id, new_load);

    let per_thread = replicas[threads[tid.index()].replica.index()]
        .cpu_request_per_thread()
        .expect("enqueued thread implies a positive active thread count");
    set_thread_share(
        &mut host.cpu,
        threads,
        tid,
        per_thread.min(MILLICORES_PER_CORE),
    );

    host.threads.insert(tid);
    if host.threads.len() < 2 {
        scheduler.active_hosts.insert(host.id);
    }
    if !host.load_balancing_needed {
        scheduler.hosts_need_load_balancing.insert(host.id);
        host.load_balancing_needed = true;
    }

    cpu::update_idle_pairs(&mut host.cpu, core_id);
}

/// Removes a thread from its core, leaving host membership and liveness to
/// the kill path.
///
/// # Panics
///
/// Panics when the thread is not enqueued.
pub fn dequeue_thread(
    host: &mut Host,
    threads: &mut [ReplicaThread],
    tid: ThreadId,
) {
    let thread = &mut threads[tid.index()];
    assert!(thread.on_rq, "off-runqueue thread {} dequeued", thread.key);
    let core_id = thread
        .core
        .unwrap_or_else(|| panic!("thread {} dequeued without a core", thread.key));

    let rq = &mut host.cpu.cores[core_id].rq;
    let position = rq
        .rq
        .iter()
        .position(|t| *t == tid)
        .unwrap_or_else(|| panic!("thread {} missing from its core's rq", thread.key));
    rq.rq.remove(position);
    rq.active_threads.remove(&tid);
    rq.decategorize(thread);

    remove_thread_index(&mut host.cpu, thread);
    thread.core = None;

    let removed_load = thread.average_load * thread.load;
    let new_load = host.cpu.cores[core_id].rq.load - removed_load;
    set_rq_load(&mut host.cpu, core_id, new_load);

    cpu::update_idle_pairs(&mut host.cpu, core_id);
}

// ============================================================================
// Share recomputation
// ============================================================================

/// Recomputes every enqueued thread's millicore share on one core:
///
/// 1. Guaranteed and burstable threads each take their per-thread process
///    request (limited-burstable processes split their limit), capped at one
///    core.
/// 2. The core's remaining millicores go to unlimited-burstable threads in
///    proportion to their request over the burstable sum.
/// 3. Whatever still remains is split equally across best-effort threads.
///
/// Calling this twice without an intervening enqueue/dequeue leaves every
/// share unchanged.
pub fn recalculate_shares(
    host: &mut Host,
    core_id: usize,
    threads: &mut [ReplicaThread],
    replicas: &[Replica],
) {
    if host.cpu.cores[core_id].rq.active_threads.is_empty() {
        return;
    }

    let mut remaining = MILLICORES_PER_CORE;

    let guaranteed: Vec<ThreadId> = host.cpu.cores[core_id].rq.guaranteed.ids.iter().copied().collect();
    for tid in guaranteed {
        let per = per_thread_request(threads, replicas, tid);
        set_thread_share(&mut host.cpu, threads, tid, per);
    }

    let burstable: Vec<ThreadId> = host.cpu.cores[core_id].rq.burstable.ids.iter().copied().collect();
    for tid in burstable {
        let per = per_thread_request(threads, replicas, tid);
        set_thread_share(&mut host.cpu, threads, tid, per);
    }

    {
        let rq = &host.cpu.cores[core_id].rq;
        remaining -= rq.guaranteed.sum_cpu_requests + rq.burstable.sum_cpu_requests;
    }

    let burstable_sum = host.cpu.cores[core_id].rq.burstable.sum_cpu_requests;
    let unlimited: Vec<ThreadId> = host.cpu.cores[core_id]
        .rq
        .burstable_unlimited
        .ids
        .iter()
        .copied()
        .collect();
    for tid in unlimited {
        let per = per_thread_request(threads, replicas, tid);
        let boost = remaining * (per / burstable_sum);
        let share = threads[tid.index()].share + boost;
        set_thread_share(&mut host.cpu, threads, tid, share);
    }
    remaining -= host.cpu.cores[core_id].rq.burstable_unlimited.sum_cpu_requests;

    let best_effort: Vec<ThreadId> = host.cpu.cores[core_id]
        .rq
        .best_effort
        .ids
        .iter()
        .copied()
        .collect();
    if remaining > 0.0 && !best_effort.is_empty() {
        let fair_share = remaining / best_effort.len() as f64;
        for tid in best_effort {
            set_thread_share(&mut host.cpu, threads, tid, fair_share);
        }
    }
}

fn per_thread_request(
    threads: &[ReplicaThread],
    replicas: &[Replica],
    tid: ThreadId,
) -> f64 {
    replicas[threads[tid.index()].replica.index()]
        .cpu_request_per_thread()
        .expect("enqueued thread implies a positive active thread count")
}
