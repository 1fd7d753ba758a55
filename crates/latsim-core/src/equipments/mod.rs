//! Simulated equipment: resources, NICs, cores and run queues, CPUs,
//! hosts, routers, and the network topology.

pub mod cpu;
pub mod host;
pub mod nic;
pub mod resource;
pub mod router;
pub mod run_queue;
pub mod topology;
