//! Observer bus: named events with synchronous dispatch.
//!
//! Every event name must be registered before an observer can attach to it.
//! Dispatch order across observers of one event is attach order; observers
//! receive a shared [`SimEvent`] payload and may only accumulate side
//! information (logs, counters), never mutate the simulation.

use std::collections::{BTreeMap, BTreeSet};

use latsim_types::{HostId, RequestId, TransmissionId};

// ============================================================================
// Event payloads
// ============================================================================

/// Typed payload handed to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// The driver is about to start executing traffic.
    TrafficStarted,

    /// A batch of requests arrived at the same clock.
    RequestsAdmitted { count: usize, time_ns: f64 },

    /// Threads were spawned for a (subchain, request) pair on a host.
    ThreadsSpawned {
        request: RequestId,
        subchain_id: usize,
        count: usize,
        host: HostId,
    },

    /// The driver chose the next event and its delta.
    NextEventEstimated {
        time_ns: f64,
        duration_ns: f64,
        kind: &'static str,
    },

    /// The monotonic clock advanced.
    ClockAdvanced { from_ns: f64, to_ns: f64 },

    /// Threads consumed their last instruction during a RUN-THREADS step.
    ThreadsCompleted { count: u64 },

    /// A transmission drained both its residual latency and payload.
    TransmissionFinished {
        transmission: TransmissionId,
        request: RequestId,
        subchain_id: usize,
    },

    /// All subchains of a request concluded.
    RequestConcluded {
        request_key: String,
        latency_ns: u64,
    },

    /// Per-flow bandwidths were recomputed across the topology.
    BandwidthRecomputed { active_flows: usize },

    /// A host CPU ran its load-balance pass.
    HostLoadBalanced { host: HostId },

    /// The driver reached DONE.
    LoadGenerationCompleted { completed_requests: u64 },
}

// ============================================================================
// Bus
// ============================================================================

pub trait Observer {
    fn observe(&mut self, event_name: &str, event: &SimEvent);
}

/// Map of `event name -> observers`, dispatching synchronously.
#[derive(Default)]
pub struct EventBus {
    registered: BTreeSet<String>,
    observers: BTreeMap<String, Vec<Box<dyn Observer>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an event name. Must precede any [`EventBus::attach_observer`]
    /// for that name.
    pub fn register_event(&mut self, event_name: &str) {
        self.registered.insert(event_name.to_string());
    }

    pub fn is_registered(&self, event_name: &str) -> bool {
        self.registered.contains(event_name)
    }

    /// Attaches an observer to a registered event.
    ///
    /// # Panics
    ///
    /// Panics if the event name was never registered; attaching to an
    /// unregistered event is a wiring bug, not a runtime condition.
    pub fn attach_observer(&mut self, event_name: &str, observer: Box<dyn Observer>) {
        assert!(
            self.registered.contains(event_name),
            "event {event_name} is not registered; call register_event first"
        );
        self.observers
            .entry(event_name.to_string())
            .or_default()
            .push(observer);
    }

    /// Dispatches `event` to every observer attached to `event_name`.
    pub fn notify_observers(&mut self, event_name: &str, event: &SimEvent) {
        if let Some(list) = self.observers.get_mut(event_name) {
            for observer in list {
                observer.observe(event_name, event);
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("registered", &self.registered)
            .field(
                "observers",
                &self
                    .observers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.len()))
                    .collect::<BTreeMap<_, _>>(),
            )
            .finish()
    }
}

// ============================================================================
// Built-in observers
// ============================================================================

/// Narrates driver progress through `tracing` at debug level.
#[derive(Debug, Default)]
pub struct TraceLogObserver;

impl Observer for TraceLogObserver {
    fn observe(&mut self, event_name: &str, event: &SimEvent) {
        tracing::debug!(target: "latsim::events", event = event_name, ?event);
    }
}

/// Event names the driver emits. Observers attach against these.
pub mod events {
    pub const TRAFFIC_STARTED: &str = "before_traffic_start";
    pub const REQUESTS_ADMITTED: &str = "after_requests_start";
    pub const THREADS_SPAWNED: &str = "after_generate_request_threads";
    pub const NEXT_EVENT_ESTIMATED: &str = "after_estimating_time_of_next_event";
    pub const CLOCK_ADVANCED: &str = "before_executing_threads";
    pub const THREADS_COMPLETED: &str = "after_thread_completion";
    pub const TRANSMISSION_FINISHED: &str = "after_finish_transmission";
    pub const REQUEST_CONCLUDED: &str = "before_concluding_request";
    pub const BANDWIDTH_RECOMPUTED: &str = "after_transmission_estimation";
    pub const HOST_LOAD_BALANCED: &str = "before_load_balancing_a_host";
    pub const LOAD_GENERATION_COMPLETED: &str = "after_completing_load_generation";

    pub const ALL: &[&str] = &[
        TRAFFIC_STARTED,
        REQUESTS_ADMITTED,
        THREADS_SPAWNED,
        NEXT_EVENT_ESTIMATED,
        CLOCK_ADVANCED,
        THREADS_COMPLETED,
        TRANSMISSION_FINISHED,
        REQUEST_CONCLUDED,
        BANDWIDTH_RECOMPUTED,
        HOST_LOAD_BALANCED,
        LOAD_GENERATION_COMPLETED,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Counter(Rc<RefCell<usize>>);

    impl Observer for Counter {
        fn observe(&mut self, _event_name: &str, _event: &SimEvent) {
            *self.0.borrow_mut() += 1;
        }
    }

    #[test]
    fn notify_reaches_attached_observers_only() {
        let mut bus = EventBus::new();
        bus.register_event("tick");
        bus.register_event("tock");

        let hits = Rc::new(RefCell::new(0));
        bus.attach_observer("tick", Box::new(Counter(Rc::clone(&hits))));

        bus.notify_observers("tick", &SimEvent::TrafficStarted);
        bus.notify_observers("tock", &SimEvent::TrafficStarted);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn attaching_to_unregistered_event_panics() {
        let mut bus = EventBus::new();
        bus.attach_observer("nope", Box::new(TraceLogObserver));
    }

    #[test]
    fn notify_on_unobserved_event_is_a_noop() {
        let mut bus = EventBus::new();
        bus.register_event("tick");
        bus.notify_observers("tick", &SimEvent::TrafficStarted);
    }
}
