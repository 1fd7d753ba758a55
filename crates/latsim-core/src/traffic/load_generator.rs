//! The load generator: merged arrival table and the discrete-event loop.
//!
//! One monotonic clock, one event applied per iteration. The loop cycles
//! REQUEST -> THREAD-GEN -> EXEC-TIME-EST -> RUN-THREADS, advancing the
//! clock by exactly the distance to the nearest of {next batch arrival,
//! next transmission completion, earliest thread finish}. Within a single
//! instant the phases always apply in that order, and all requests arriving
//! at the same clock are admitted before any thread spawns.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use latsim_types::RequestId;

use crate::cluster::Cluster;
use crate::observer::{events, EventBus, SimEvent};

/// The driver's monotonic clock, nanoseconds since simulation start.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimClock {
    pub now: f64,
}

/// Driver states. DONE is reached when every expected request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    Request,
    ThreadGen,
    ExecTimeEst,
    RunThreads,
    Done,
}

#[derive(Debug)]
pub struct LoadGenerator {
    pub name: String,

    /// Merged arrival table: (arrival ns, admission sequence, request).
    /// The sequence keeps equal-time pops in creation order.
    heap: BinaryHeap<Reverse<(u64, u64, RequestId)>>,
    next_batch_arrival_ns: f64,

    pub total_requests: u64,
    pub completed_threads: u64,

    next_event: DriverEvent,
    previous_event: Option<DriverEvent>,
    prediction_after_run: DriverEvent,
    time_of_next_event: f64,
    duration_of_next_event: f64,
}

impl LoadGenerator {
    /// `arrivals` pairs each request with its arrival clock, in creation
    /// order.
    pub fn new(name: impl Into<String>, arrivals: Vec<(u64, RequestId)>) -> Self {
        let total_requests = arrivals.len() as u64;
        let mut heap = BinaryHeap::with_capacity(arrivals.len());
        for (sequence, (arrival, rid)) in arrivals.into_iter().enumerate() {
            heap.push(Reverse((arrival, sequence as u64, rid)));
        }
        Self {
            name: name.into(),
            heap,
            next_batch_arrival_ns: 0.0,
            total_requests,
            completed_threads: 0,
            next_event: DriverEvent::Request,
            previous_event: None,
            prediction_after_run: DriverEvent::Request,
            time_of_next_event: 0.0,
            duration_of_next_event: 0.0,
        }
    }

    /// Runs the event loop to DONE.
    pub fn execute_traffic(&mut self, cluster: &mut Cluster, clock: &mut SimClock, bus: &mut EventBus) {
        bus.notify_observers(events::TRAFFIC_STARTED, &SimEvent::TrafficStarted);

        while self.next_event != DriverEvent::Done {
            match self.next_event {
                DriverEvent::Request => self.admit_next_batch(cluster, clock, bus),
                DriverEvent::ThreadGen => self.generate_threads(cluster, clock, bus),
                DriverEvent::ExecTimeEst => self.estimate_next_event(cluster, clock, bus),
                DriverEvent::RunThreads => self.run_threads(cluster, clock, bus),
                DriverEvent::Done => unreachable!(),
            }
        }

        bus.notify_observers(
            events::LOAD_GENERATION_COMPLETED,
            &SimEvent::LoadGenerationCompleted {
                completed_requests: cluster.completed_requests,
            },
        );
    }

    /// REQUEST: admit every request sharing the earliest arrival clock and
    /// advance the clock to it.
    fn admit_next_batch(&mut self, cluster: &mut Cluster, clock: &mut SimClock, bus: &mut EventBus) {
        let Some(Reverse((arrival, _, first))) = self.heap.pop() else {
            self.next_event = DriverEvent::ExecTimeEst;
            return;
        };

        clock.now = arrival as f64;
        let mut admitted = vec![first];
        while let Some(Reverse((next_arrival, _, _))) = self.heap.peek() {
            if *next_arrival != arrival {
                break;
            }
            let Reverse((_, _, rid)) = self.heap.pop().expect("peeked");
            admitted.push(rid);
        }

        for rid in &admitted {
            cluster.ready_for_thread_generation.push((0, *rid));
        }

        self.next_batch_arrival_ns = match self.heap.peek() {
            Some(Reverse((arrival, _, _))) => *arrival as f64,
            None => f64::INFINITY,
        };

        bus.notify_observers(
            events::REQUESTS_ADMITTED,
            &SimEvent::RequestsAdmitted {
                count: admitted.len(),
                time_ns: clock.now,
            },
        );
        self.next_event = DriverEvent::ThreadGen;
        self.previous_event = Some(DriverEvent::Request);
    }

    /// THREAD-GEN: spawn threads for every ready (subchain, request) pair.
    /// Only the last pair's host load-balances immediately; the rest stay
    /// dirty until the RUN-THREADS sweep.
    fn generate_threads(&mut self, cluster: &mut Cluster, clock: &mut SimClock, bus: &mut EventBus) {
        let ready = std::mem::take(&mut cluster.ready_for_thread_generation);
        let last = ready.len().saturating_sub(1);
        for (i, (subchain_id, rid)) in ready.into_iter().enumerate() {
            let (host, count) = cluster.spawn_threads(subchain_id, rid, clock.now);
            bus.notify_observers(
                events::THREADS_SPAWNED,
                &SimEvent::ThreadsSpawned {
                    request: rid,
                    subchain_id,
                    count,
                    host,
                },
            );
            if i == last {
                bus.notify_observers(
                    events::HOST_LOAD_BALANCED,
                    &SimEvent::HostLoadBalanced { host },
                );
                cluster.load_balance_host(host, clock.now);
            }
        }

        self.next_event = DriverEvent::ExecTimeEst;
        self.previous_event = Some(DriverEvent::ThreadGen);
    }

    /// EXEC-TIME-EST: recompute flow bandwidths, then pick the nearest of
    /// {next transmission completion, next batch arrival, earliest thread
    /// finish}.
    ///
    /// # Panics
    ///
    /// Panics when no event has a finite deadline while work remains; a
    /// well-formed scenario always has a next deadline.
    fn estimate_next_event(&mut self, cluster: &mut Cluster, clock: &mut SimClock, bus: &mut EventBus) {
        cluster.recalculate_transmissions_bw(clock.now);
        bus.notify_observers(
            events::BANDWIDTH_RECOMPUTED,
            &SimEvent::BandwidthRecomputed {
                active_flows: cluster.topology.active_transmissions.len(),
            },
        );

        let next_transmission = cluster.completions.peek();
        if let Some(completion) = next_transmission {
            debug_assert!(
                completion >= clock.now,
                "completion board minimum {completion} behind the clock {}",
                clock.now
            );
        }
        let (time_of_next, prediction) = match next_transmission {
            None => (self.next_batch_arrival_ns, DriverEvent::Request),
            Some(completion) if self.next_batch_arrival_ns < completion => {
                (self.next_batch_arrival_ns, DriverEvent::Request)
            }
            Some(completion) => (completion, DriverEvent::ThreadGen),
        };

        let (time, duration, _) = cluster.earliest_thread_finish(time_of_next, clock.now);
        self.time_of_next_event = time;
        self.duration_of_next_event = duration;
        self.prediction_after_run = prediction;

        if duration.is_infinite() {
            if self.previous_event != Some(DriverEvent::ThreadGen) {
                self.next_event = DriverEvent::ThreadGen;
            } else {
                panic!(
                    "next event is infinitely far with unfinished work \
                     (active transmissions = {})",
                    cluster.topology.active_transmissions.len()
                );
            }
        } else {
            self.next_event = DriverEvent::RunThreads;
        }

        bus.notify_observers(
            events::NEXT_EVENT_ESTIMATED,
            &SimEvent::NextEventEstimated {
                time_ns: time,
                duration_ns: duration,
                kind: match self.next_event {
                    DriverEvent::RunThreads => "run-threads",
                    _ => "thread-gen",
                },
            },
        );
        self.previous_event = Some(DriverEvent::ExecTimeEst);
    }

    /// RUN-THREADS: advance the clock by the chosen delta, debit every
    /// runnable thread, move every in-flight payload, then load-balance all
    /// dirty hosts. Transmission and thread completions landing on the same
    /// clock both settle here, their reconfigurations at the end.
    fn run_threads(&mut self, cluster: &mut Cluster, clock: &mut SimClock, bus: &mut EventBus) {
        let duration = self.duration_of_next_event;
        bus.notify_observers(
            events::CLOCK_ADVANCED,
            &SimEvent::ClockAdvanced {
                from_ns: clock.now,
                to_ns: clock.now + duration,
            },
        );
        clock.now += duration;

        let rows_before = cluster.latency_table.len();
        let completed = cluster.run_active_threads(duration);
        if completed > 0 {
            bus.notify_observers(
                events::THREADS_COMPLETED,
                &SimEvent::ThreadsCompleted { count: completed },
            );
        }
        for (transmission, request, subchain_id) in
            cluster.transmit_requests_in_network(duration, clock.now)
        {
            bus.notify_observers(
                events::TRANSMISSION_FINISHED,
                &SimEvent::TransmissionFinished {
                    transmission,
                    request,
                    subchain_id,
                },
            );
        }
        cluster.load_balance_all_hosts(clock.now);
        for row in &cluster.latency_table[rows_before..] {
            bus.notify_observers(
                events::REQUEST_CONCLUDED,
                &SimEvent::RequestConcluded {
                    request_key: row.request_key.clone(),
                    latency_ns: row.latency_ns,
                },
            );
        }
        self.completed_threads += completed;

        if cluster.completed_requests == self.total_requests {
            self.next_event = DriverEvent::Done;
        } else {
            self.next_event = self.prediction_after_run;
        }
        self.previous_event = Some(DriverEvent::RunThreads);
    }
}
