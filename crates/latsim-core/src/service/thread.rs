//! Replica threads: the unit of simulated compute.
//!
//! A thread carries the instruction budget of one endpoint-function thread
//! and burns it down over driver ticks. Its effective speed on a core is its
//! millicore share degraded by a cache-penalty model calibrated against
//! perf measurements of co-located containers.

use latsim_types::{
    QosClass, ReplicaId, RequestId, ThreadId, MILLICORES_PER_CORE, SHARE_SCALE, UNLIMITED,
};
use petgraph::graph::NodeIndex;

/// How far instruction counts may drift past zero before snapping. Purely a
/// float-rounding guard; anything larger is an accounting bug.
pub const INSTRUCTION_EPSILON: f64 = 0.001;

#[derive(Debug, Clone)]
pub struct ReplicaThread {
    pub id: ThreadId,
    /// Human-readable identity used in timelines and logs.
    pub key: String,

    pub replica: ReplicaId,
    pub request: RequestId,
    pub subchain_id: usize,
    /// The alternative-graph node this thread executes.
    pub node: NodeIndex,
    pub thread_id_in_node: usize,

    pub qos: QosClass,

    // Compute profile, fixed at spawn from the endpoint's thread spec.
    pub original_instructions: f64,
    pub cpi: f64,
    pub mem_accesses: f64,
    pub isolated_cache_misses: f64,
    pub isolated_cache_refs: f64,
    pub avg_cache_miss_penalty: f64,
    pub average_load: f64,

    // Mutable execution state. `share`, `load` and `vruntime` key the
    // scheduler's sorted indices; while a thread is enqueued they must only
    // change through the cpu module's reindexing helpers.
    pub instructions: f64,
    pub executed_instructions: f64,
    /// Millicore share currently assigned by the run queue.
    pub share: f64,
    /// Millicore limit; -1.0 when unbounded.
    pub limit: f64,
    pub load: f64,
    pub vruntime: f64,

    /// Core index within the owning replica's host CPU, while enqueued.
    pub core: Option<usize>,
    pub on_rq: bool,
    pub alive: bool,
}

impl ReplicaThread {
    pub fn is_runnable(&self) -> bool {
        self.on_rq && self.instructions > 0.0 && self.core.is_some()
    }

    /// The guaranteed millicores this thread runs at, capped at one core.
    pub fn relative_guaranteed_share(&self) -> f64 {
        if self.limit != UNLIMITED as f64 {
            self.share.min(MILLICORES_PER_CORE)
        } else {
            self.share
        }
    }

    /// Load contribution of a share assignment: the 1024-scale weight of the
    /// millicores, scaled by the thread's measured average CPU usage.
    pub fn load_for_share(&self, share: f64) -> f64 {
        self.average_load * (share * SHARE_SCALE / MILLICORES_PER_CORE)
    }

    /// Extra cycles per instruction caused by cache misses under the current
    /// co-location. The contention term grows with the number of threads on
    /// the core, the size term with shrinking millicore allotments.
    fn cache_penalty_cycles(&self, millicores: f64, active_threads_on_core: usize) -> f64 {
        let mut miss_rate = self.isolated_cache_misses / self.isolated_cache_refs;
        let contention_penalty = 0.033_420_389 * (active_threads_on_core as f64).ln() + 0.003_341_528;
        let size_penalty = -0.025_090_33 * millicores.ln() + 0.178_591_56;
        miss_rate += miss_rate * size_penalty;
        miss_rate += miss_rate * contention_penalty;
        (self.mem_accesses / self.original_instructions) * miss_rate * self.avg_cache_miss_penalty
    }

    /// Effective fraction of a core this thread progresses at: its 1024-scale
    /// share shrunk by the cache penalty, normalized to the core's shares.
    pub fn share_proportion(&self, active_threads_on_core: usize) -> f64 {
        let millicores = self.relative_guaranteed_share();
        let cache_penalty = self.cache_penalty_cycles(millicores, active_threads_on_core);
        let millicores_to_share = (SHARE_SCALE * millicores) / MILLICORES_PER_CORE;
        let share_considering_cache_miss =
            (self.cpi * millicores_to_share) / (self.cpi + cache_penalty);
        share_considering_cache_miss / MILLICORES_PER_CORE
    }

    /// Runs the thread for `duration_ns` and returns whether it completed.
    ///
    /// Instruction counts within [`INSTRUCTION_EPSILON`] of zero snap to
    /// exactly zero so that float drift cannot leave a sliver of work.
    /// Callers must reindex the thread afterwards: `vruntime` advances here.
    ///
    /// # Panics
    ///
    /// Panics when called on a zombie or an unqueued thread.
    pub fn exec(
        &mut self,
        duration_ns: f64,
        active_threads_on_core: usize,
        clock_rate_per_ns: f64,
    ) -> bool {
        assert!(
            self.is_runnable(),
            "thread {} executed while not runnable (instructions={}, on_rq={})",
            self.key,
            self.instructions,
            self.on_rq
        );

        let proportion = self.share_proportion(active_threads_on_core);
        let mut instructions_to_consume = duration_ns * proportion / (self.cpi / clock_rate_per_ns);
        let remaining = self.instructions - instructions_to_consume;
        if remaining.abs() < INSTRUCTION_EPSILON {
            instructions_to_consume += remaining;
        }
        self.instructions -= instructions_to_consume;
        self.executed_instructions += instructions_to_consume;
        self.vruntime += duration_ns * proportion;

        self.instructions == 0.0
    }

    /// Predicted nanoseconds until completion if nothing else changes.
    pub fn exec_time_on_rq(&self, active_threads_on_core: usize, clock_rate_per_ns: f64) -> f64 {
        let proportion = self.share_proportion(active_threads_on_core);
        (self.instructions * self.cpi) / (clock_rate_per_ns * proportion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The sfc-stress single-thread profile used across the original
    /// calibration experiments.
    fn calibrated_thread() -> ReplicaThread {
        ReplicaThread {
            id: ThreadId::new(0),
            key: "t0".into(),
            replica: ReplicaId::new(0),
            request: RequestId::new(0),
            subchain_id: 0,
            node: NodeIndex::new(0),
            thread_id_in_node: 0,
            qos: QosClass::BestEffort,
            original_instructions: 1_209_325_186.0,
            cpi: 0.760_080_72,
            mem_accesses: 414_016_086.0,
            isolated_cache_misses: 75_266.0,
            isolated_cache_refs: 799_434.0,
            avg_cache_miss_penalty: 5.71,
            average_load: 1.0,
            instructions: 1_209_325_186.0,
            executed_instructions: 0.0,
            share: 1000.0,
            limit: -1.0,
            load: 0.0,
            vruntime: 0.0,
            core: Some(0),
            on_rq: true,
            alive: true,
        }
    }

    const CLOCK_PER_NS: f64 = 1.596_09; // 1.59609 GHz

    #[test]
    fn predicted_time_matches_exec_to_completion() {
        let mut t = calibrated_thread();
        let predicted = t.exec_time_on_rq(1, CLOCK_PER_NS);
        assert!(t.exec(predicted, 1, CLOCK_PER_NS), "thread should finish");
        assert_eq!(t.instructions, 0.0);
        assert!((t.executed_instructions - t.original_instructions).abs() < 1.0);
    }

    #[test]
    fn cache_penalty_slows_the_thread_down() {
        let t = calibrated_thread();
        let ideal_ns = t.instructions * t.cpi / CLOCK_PER_NS;
        let predicted = t.exec_time_on_rq(1, CLOCK_PER_NS);
        assert!(predicted > ideal_ns, "{predicted} should exceed {ideal_ns}");
        // The calibrated penalty stays bounded for a full-core thread.
        assert!(predicted < ideal_ns * 1.35);
    }

    #[test]
    fn contention_grows_with_colocated_threads() {
        let t = calibrated_thread();
        assert!(t.exec_time_on_rq(4, CLOCK_PER_NS) > t.exec_time_on_rq(1, CLOCK_PER_NS));
    }

    #[test]
    fn partial_exec_accrues_vruntime() {
        let mut t = calibrated_thread();
        let full = t.exec_time_on_rq(1, CLOCK_PER_NS);
        assert!(!t.exec(full / 2.0, 1, CLOCK_PER_NS));
        assert!(t.instructions > 0.0);
        assert!(t.vruntime > 0.0);
    }

    #[test]
    fn near_zero_residue_snaps_to_exact_zero() {
        let mut t = calibrated_thread();
        t.instructions = 100.0;
        t.original_instructions = 100.0;
        let predicted = t.exec_time_on_rq(1, CLOCK_PER_NS);
        // Nudge the duration so the float product lands a hair off zero.
        t.exec(predicted * (1.0 + 1e-12), 1, CLOCK_PER_NS);
        assert_eq!(t.instructions, 0.0);
    }

    #[test]
    #[should_panic(expected = "not runnable")]
    fn executing_a_zombie_panics() {
        let mut t = calibrated_thread();
        t.instructions = 0.0;
        t.exec(10.0, 1, CLOCK_PER_NS);
    }
}
