//! # latsim-core: discrete-event microservice latency simulation
//!
//! Predicts end-to-end request latency for chains of communicating
//! services placed on a simulated cluster, without running the real
//! services. One single-threaded driver advances a monotonic nanosecond
//! clock by the distance to the nearest of {next batch arrival, next
//! transmission completion, earliest thread finish} and applies exactly
//! that event.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        LoadGenerator                           │
//! │  REQUEST ─► THREAD-GEN ─► EXEC-TIME-EST ─► RUN-THREADS ─► ...  │
//! └──────────────┬─────────────────────────────────┬───────────────┘
//!                │                                 │
//!   ┌────────────▼────────────┐      ┌─────────────▼─────────────┐
//!   │ Per-host CPU scheduler  │      │ Network transmission      │
//!   │ run queues, QoS shares, │      │ max-min fair bandwidth,   │
//!   │ pair/node balancing     │      │ per-flow completion board │
//!   └────────────┬────────────┘      └─────────────┬─────────────┘
//!                │                                 │
//!   ┌────────────▼─────────────────────────────────▼─────────────┐
//!   │ Request state machine: subchain fork/join over the         │
//!   │ alternative graph, thread spawn, transmission init/finish  │
//!   └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use latsim_core::{Simulation, SimulationSpec};
//!
//! let mut sim = Simulation::new(spec)?;
//! sim.run();
//! let results = sim.results();
//! ```
//!
//! Determinism: every collection the driver iterates is ordered by
//! creation-ordered ids, so identical scenarios produce identical latency
//! sequences.

pub mod cluster;
pub mod equipments;
pub mod error;
pub mod observer;
pub mod placement;
pub mod results;
pub mod service;
pub mod simulation;
pub mod traffic;

pub use cluster::{Cluster, ClusterScheduler, LatencyRow};
pub use equipments::cpu::{Cpu, CpuSample};
pub use equipments::host::{CostEvents, Host, HostSpec};
pub use equipments::nic::Nic;
pub use equipments::resource::Resource;
pub use equipments::router::Router;
pub use equipments::run_queue::RunQueue;
pub use equipments::topology::{Link, Topology};
pub use error::{SimError, SimResult};
pub use observer::{events, EventBus, Observer, SimEvent, TraceLogObserver};
pub use placement::{
    FirstFit, FirstFitDecreasing, LeastFit, LeastFitWeights, PlacementMatrix, PlacementPolicy,
};
pub use results::{
    build_results, FileResultsStore, ResultsStore, ServiceChainResult, SimulationResults,
};
pub use service::chain::{AltNode, ChainEdge, ServiceChain, ServiceChainManager};
pub use service::microservice::{
    Endpoint, EndpointRef, Microservice, Process, Replica, ThreadSpec,
};
pub use service::thread::ReplicaThread;
pub use simulation::{
    AffinityRule, DebugOptions, LinkSpec, ResourceAllocation, RouterSpec, ScalingEntry,
    Simulation, SimulationSpec, TrafficBinding,
};
pub use traffic::load_generator::{DriverEvent, LoadGenerator, SimClock};
pub use traffic::profile::TrafficProfile;
pub use traffic::request::Request;
pub use traffic::transmission::{CompletionBoard, Transmission};
