//! The service model: microservices with endpoint functions and replicas,
//! service chains with their alternative graphs, and replica threads.

pub mod chain;
pub mod microservice;
pub mod thread;
