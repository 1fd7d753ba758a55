//! # latsim-config: scenario documents
//!
//! Parses the declarative scenario document (JSON) and resolves its names
//! into runnable [`latsim_core::Simulation`] instances. The document splits
//! into reusable prototypes (microservices, hosts, routers, links,
//! traffics), concrete equipment and topologies, service chains, resource
//! allocation scenarios, affinity rulesets, placement algorithms, a results
//! storage driver, and the simulation scenarios that tie everything
//! together.
//!
//! Numeric-string keys (`"0"`, `"1"`, ...) index topology and chain nodes;
//! they are ordered numerically. All other maps are ordered by name, which
//! fixes entity ids deterministically regardless of document layout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

mod builder;
mod error;

pub use builder::ScenarioManager;
pub use error::ConfigError;

// ============================================================================
// Prototypes
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadSpecConfig {
    pub instructions: f64,
    pub avg_cpi: f64,
    #[serde(default = "one")]
    pub avg_cpu_usage: f64,
    pub avg_mem_accesses: f64,
    pub single_core_isolated_cache_misses: f64,
    pub single_core_isolated_cache_refs: f64,
    pub avg_cache_miss_penalty: f64,
    #[serde(default)]
    pub avg_blkio_rw: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub threads: Vec<ThreadSpecConfig>,
    /// Nanoseconds; values <= 0 mean "no timeout".
    #[serde(default = "no_timeout")]
    pub request_timeout: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MicroservicePrototypeConfig {
    pub endpoint_functions: BTreeMap<String, EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostPrototypeConfig {
    pub cpu_core_count: usize,
    /// Hertz.
    pub cpu_clock_rate: f64,
    pub memory_capacity: f64,
    pub ram_speed: f64,
    pub storage_capacity: f64,
    pub storage_speed: f64,
    /// Bytes per second per NIC direction.
    pub network_bandwidth: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterPrototypeConfig {
    /// Nanoseconds per traversal.
    pub latency: f64,
    pub egress_ingress_bw: f64,
    pub ports_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkPrototypeConfig {
    /// Nanoseconds per traversal.
    pub latency: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficPrototypeConfig {
    pub arrival_interval_ns: u64,
    /// Seconds.
    pub duration: u64,
    pub parallel_user: u64,
    #[serde(default)]
    pub start_at: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prototypes {
    pub microservices: BTreeMap<String, MicroservicePrototypeConfig>,
    pub hosts: BTreeMap<String, HostPrototypeConfig>,
    #[serde(default)]
    pub routers: BTreeMap<String, RouterPrototypeConfig>,
    #[serde(default)]
    pub links: BTreeMap<String, LinkPrototypeConfig>,
    pub traffics: BTreeMap<String, TrafficPrototypeConfig>,
}

// ============================================================================
// Equipment and topologies
// ============================================================================

/// Concrete equipment: instance name -> prototype name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Equipments {
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
    #[serde(default)]
    pub routers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopologyNodeConfig {
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopologyEdgeConfig {
    pub link_type: String,
    /// (source node index, destination node index).
    pub connection: (String, String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopologyConfig {
    pub egress_err: f64,
    pub ingress_err: f64,
    pub nodes: BTreeMap<String, TopologyNodeConfig>,
    pub edges: BTreeMap<String, TopologyEdgeConfig>,
}

// ============================================================================
// Service chains
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ChainNodeConfig {
    pub microservice: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainEdgeConfig {
    /// Payload bytes.
    pub request_size: f64,
    /// (source node index, destination node index).
    pub connection: (String, String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceChainConfig {
    pub nodes: BTreeMap<String, ChainNodeConfig>,
    #[serde(default)]
    pub edges: BTreeMap<String, ChainEdgeConfig>,
}

// ============================================================================
// Allocations, affinity, placement
// ============================================================================

/// Bandwidth values accept an empty string for "unbounded".
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Bandwidth {
    Value(f64),
    Text(String),
}

impl Bandwidth {
    pub fn as_f64(&self) -> Result<f64, ConfigError> {
        match self {
            Bandwidth::Value(v) => Ok(*v),
            Bandwidth::Text(t) if t.is_empty() => Ok(f64::INFINITY),
            Bandwidth::Text(t) => Err(ConfigError::Validation(format!(
                "bandwidth value {t:?} is neither a number nor empty"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocationConfig {
    pub cpu_requests: i64,
    pub cpu_limits: i64,
    pub memory_capacity: f64,
    pub ingress_bw: Bandwidth,
    pub egress_bw: Bandwidth,
    #[serde(default)]
    pub ingress_latency: f64,
    #[serde(default)]
    pub egress_latency: f64,
    #[serde(default)]
    pub blkio_capacity: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AffinitySides {
    #[serde(default)]
    pub microservice: Vec<String>,
    #[serde(default)]
    pub host: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AffinityRulesetConfig {
    #[serde(default)]
    pub affinity: AffinitySides,
    #[serde(default, rename = "anti-affinity")]
    pub anti_affinity: AffinitySides,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlacementOptionsConfig {
    #[serde(default = "hundred")]
    pub w_cpu: f64,
    #[serde(default = "hundred")]
    pub w_mem: f64,
    #[serde(default = "hundred")]
    pub w_ingress: f64,
    #[serde(default = "hundred")]
    pub w_egress: f64,
    #[serde(default)]
    pub w_blkio: f64,
}

impl Default for PlacementOptionsConfig {
    fn default() -> Self {
        Self {
            w_cpu: 100.0,
            w_mem: 100.0,
            w_ingress: 100.0,
            w_egress: 100.0,
            w_blkio: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlacementConfig {
    /// One of `least_fit`, `first_fit`, `first_fit_decreasing`.
    pub algorithm: String,
    #[serde(default)]
    pub options: PlacementOptionsConfig,
}

// ============================================================================
// Storage and scenarios
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct StorageDriverConfig {
    pub name: String,
    #[serde(default = "file_driver")]
    #[serde(rename = "type")]
    pub driver_type: String,
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficRef {
    pub traffic_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficScenarioConfig {
    pub name: String,
    pub service_chains: BTreeMap<String, TrafficRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScalingRef {
    pub replica_count: usize,
    pub resource_allocation_scenario: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScalingScenarioConfig {
    pub microservice: BTreeMap<String, ScalingRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AffinityRef {
    pub affinity_ruleset: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AffinityScenarioConfig {
    pub microservice: BTreeMap<String, AffinityRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub debug_level: u8,
    #[serde(default)]
    pub log_cpu_events: bool,
    #[serde(default)]
    pub log_timeline: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationScenarioConfig {
    pub name: String,
    pub traffic_scenario: TrafficScenarioConfig,
    pub scaling_scenarios: Vec<ScalingScenarioConfig>,
    #[serde(default)]
    pub affinity_scenarios: Vec<AffinityScenarioConfig>,
    pub placement_algorithm: String,
    pub topology: String,
    #[serde(default = "no_timeout")]
    pub network_timeout: f64,
    #[serde(default)]
    pub debug: DebugConfig,
}

// ============================================================================
// Document root
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioDocument {
    pub prototypes: Prototypes,
    pub equipments: Equipments,
    pub topologies: BTreeMap<String, TopologyConfig>,
    pub service_chains: BTreeMap<String, ServiceChainConfig>,
    pub resource_allocation_scenarios: BTreeMap<String, AllocationConfig>,
    #[serde(default)]
    pub affinity_rulesets: BTreeMap<String, AffinityRulesetConfig>,
    pub placement_algorithms: BTreeMap<String, PlacementConfig>,
    #[serde(default)]
    pub storage_driver: Option<StorageDriverConfig>,
    pub simulation_scenarios: Vec<SimulationScenarioConfig>,
}

impl ScenarioDocument {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }
}

/// Orders numeric-string map keys (`"0"`, `"1"`, `"10"`) numerically.
pub(crate) fn numeric_key_order<'a, T>(
    map: &'a BTreeMap<String, T>,
    what: &str,
) -> Result<Vec<(&'a str, &'a T)>, ConfigError> {
    let mut entries = Vec::with_capacity(map.len());
    for (key, value) in map {
        let index: usize = key.parse().map_err(|_| {
            ConfigError::Validation(format!("{what} index {key:?} is not a number"))
        })?;
        entries.push((index, key.as_str(), value));
    }
    entries.sort_by_key(|(index, _, _)| *index);
    Ok(entries
        .into_iter()
        .map(|(_, key, value)| (key, value))
        .collect())
}

fn one() -> f64 {
    1.0
}

fn hundred() -> f64 {
    100.0
}

fn no_timeout() -> f64 {
    -1.0
}

fn file_driver() -> String {
    "file".to_string()
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("results")
}
