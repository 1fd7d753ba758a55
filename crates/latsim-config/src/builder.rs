//! Resolves a parsed scenario document into runnable simulations.

use std::collections::BTreeMap;
use std::path::Path;

use latsim_core::{
    AffinityRule, ChainEdge, DebugOptions, Endpoint, EndpointRef, FileResultsStore, FirstFit,
    FirstFitDecreasing, HostSpec, LeastFit, LeastFitWeights, LinkSpec, Microservice,
    PlacementPolicy, ResourceAllocation, RouterSpec, ScalingEntry, ServiceChain, Simulation,
    SimulationSpec, ThreadSpec, TrafficBinding, TrafficProfile,
};
use latsim_types::{EndpointId, MsId};

use crate::{
    numeric_key_order, ConfigError, PlacementConfig, ScenarioDocument, SimulationScenarioConfig,
};

/// Holds a parsed document and builds one [`Simulation`] per scenario id.
#[derive(Debug, Clone)]
pub struct ScenarioManager {
    document: ScenarioDocument,
}

impl ScenarioManager {
    pub fn new(document: ScenarioDocument) -> Self {
        Self { document }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::new(ScenarioDocument::from_file(path)?))
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(ScenarioDocument::from_json(text)?))
    }

    pub fn document(&self) -> &ScenarioDocument {
        &self.document
    }

    pub fn scenario_ids(&self) -> Vec<&str> {
        self.document
            .simulation_scenarios
            .iter()
            .map(|s| s.name.as_str())
            .collect()
    }

    /// The configured results store, when one is declared.
    pub fn results_store(&self) -> Result<Option<FileResultsStore>, ConfigError> {
        match &self.document.storage_driver {
            None => Ok(None),
            Some(cfg) if cfg.driver_type == "file" => Ok(Some(FileResultsStore::new(
                cfg.name.clone(),
                cfg.base_dir.clone(),
            ))),
            Some(cfg) => Err(ConfigError::Validation(format!(
                "unsupported storage driver type {:?}",
                cfg.driver_type
            ))),
        }
    }

    /// Builds the simulation for one scenario id.
    pub fn build_simulation(&self, scenario_id: &str) -> Result<Simulation, ConfigError> {
        let scenario = self
            .document
            .simulation_scenarios
            .iter()
            .find(|s| s.name == scenario_id)
            .ok_or_else(|| ConfigError::UnknownScenario(scenario_id.to_string()))?;

        let (microservices, ms_ids) = self.build_microservices()?;
        let service_chains = self.build_service_chains(&microservices, &ms_ids)?;
        let (hosts, routers, links, egress_err, ingress_err) =
            self.build_topology(&scenario.topology)?;
        let placement = self.build_placement(&scenario.placement_algorithm)?;
        let scaling = self.build_scaling(scenario)?;
        let affinity = self.build_affinity(scenario)?;
        let traffic = self.build_traffic(scenario)?;

        let spec = SimulationSpec {
            name: scenario.name.clone(),
            microservices,
            service_chains,
            topology_name: scenario.topology.clone(),
            hosts,
            routers,
            links,
            egress_err,
            ingress_err,
            placement,
            scaling,
            affinity,
            traffic,
            network_timeout: scenario.network_timeout,
            debug: DebugOptions {
                debug_level: scenario.debug.debug_level,
                log_cpu_events: scenario.debug.log_cpu_events,
                log_timeline: scenario.debug.log_timeline,
            },
        };
        Ok(Simulation::new(spec)?)
    }

    /// Materializes every microservice referenced by any service chain,
    /// endpoints in name order.
    fn build_microservices(
        &self,
    ) -> Result<(Vec<Microservice>, BTreeMap<String, MsId>), ConfigError> {
        let mut microservices: Vec<Microservice> = Vec::new();
        let mut ids: BTreeMap<String, MsId> = BTreeMap::new();

        for (chain_name, chain) in &self.document.service_chains {
            for (_, node) in numeric_key_order(&chain.nodes, "service chain node")? {
                if ids.contains_key(&node.microservice) {
                    continue;
                }
                let prototype = self
                    .document
                    .prototypes
                    .microservices
                    .get(&node.microservice)
                    .ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "chain {chain_name} references unknown microservice {}",
                            node.microservice
                        ))
                    })?;

                let id = MsId::from(microservices.len());
                let mut ms = Microservice::new(id, node.microservice.clone());
                for (endpoint_id, (endpoint_name, endpoint)) in
                    prototype.endpoint_functions.iter().enumerate()
                {
                    ms.endpoints.push(Endpoint {
                        id: EndpointId::from(endpoint_id),
                        name: endpoint_name.clone(),
                        threads: endpoint
                            .threads
                            .iter()
                            .map(|t| ThreadSpec {
                                instructions: t.instructions,
                                avg_cpi: t.avg_cpi,
                                avg_cpu_usage: t.avg_cpu_usage,
                                avg_mem_accesses: t.avg_mem_accesses,
                                isolated_cache_misses: t.single_core_isolated_cache_misses,
                                isolated_cache_refs: t.single_core_isolated_cache_refs,
                                avg_cache_miss_penalty: t.avg_cache_miss_penalty,
                                avg_blkio_rw: t.avg_blkio_rw,
                            })
                            .collect(),
                        request_timeout: endpoint.request_timeout,
                    });
                }
                ids.insert(node.microservice.clone(), id);
                microservices.push(ms);
            }
        }
        Ok((microservices, ids))
    }

    fn build_service_chains(
        &self,
        microservices: &[Microservice],
        ms_ids: &BTreeMap<String, MsId>,
    ) -> Result<Vec<ServiceChain>, ConfigError> {
        let mut chains = Vec::new();
        for (chain_name, config) in &self.document.service_chains {
            let mut chain = ServiceChain::new(chain_name.clone());
            let mut node_refs: BTreeMap<&str, EndpointRef> = BTreeMap::new();

            for (index, node) in numeric_key_order(&config.nodes, "service chain node")? {
                let ms_id = ms_ids[&node.microservice];
                let endpoint = microservices[ms_id.index()]
                    .endpoint_by_name(&node.endpoint)
                    .ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "chain {chain_name}: microservice {} has no endpoint {}",
                            node.microservice, node.endpoint
                        ))
                    })?;
                let endpoint_ref = EndpointRef {
                    ms: ms_id,
                    endpoint: endpoint.id,
                };
                chain.add_node(endpoint_ref);
                node_refs.insert(index, endpoint_ref);
            }

            for (edge_name, edge) in &config.edges {
                let lookup = |index: &String| {
                    node_refs.get(index.as_str()).copied().ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "chain {chain_name} edge {edge_name} references unknown node {index}"
                        ))
                    })
                };
                let src = lookup(&edge.connection.0)?;
                let dst = lookup(&edge.connection.1)?;
                chain.add_edge(
                    src,
                    dst,
                    ChainEdge {
                        name: edge_name.clone(),
                        payload: edge.request_size,
                    },
                );
            }
            chains.push(chain);
        }
        Ok(chains)
    }

    #[allow(clippy::type_complexity)]
    fn build_topology(
        &self,
        topology_name: &str,
    ) -> Result<(Vec<(String, HostSpec)>, Vec<RouterSpec>, Vec<LinkSpec>, f64, f64), ConfigError>
    {
        let topology = self
            .document
            .topologies
            .get(topology_name)
            .ok_or_else(|| {
                ConfigError::Validation(format!("unknown topology {topology_name}"))
            })?;

        let mut hosts = Vec::new();
        let mut routers = Vec::new();
        let mut node_names: BTreeMap<&str, &str> = BTreeMap::new();

        for (index, node) in numeric_key_order(&topology.nodes, "topology node")? {
            node_names.insert(index, &node.name);
            match node.node_type.as_str() {
                "host" => {
                    let prototype_name =
                        self.document.equipments.hosts.get(&node.name).ok_or_else(|| {
                            ConfigError::Validation(format!(
                                "topology {topology_name}: host {} missing from equipments",
                                node.name
                            ))
                        })?;
                    let p = self
                        .document
                        .prototypes
                        .hosts
                        .get(prototype_name)
                        .ok_or_else(|| {
                            ConfigError::Validation(format!(
                                "unknown host prototype {prototype_name}"
                            ))
                        })?;
                    hosts.push((
                        node.name.clone(),
                        HostSpec {
                            cpu_core_count: p.cpu_core_count,
                            cpu_clock_rate: p.cpu_clock_rate,
                            memory_capacity: p.memory_capacity,
                            ram_speed: p.ram_speed,
                            storage_capacity: p.storage_capacity,
                            storage_speed: p.storage_speed,
                            network_bandwidth: p.network_bandwidth,
                        },
                    ));
                }
                "router" => {
                    let prototype_name = self
                        .document
                        .equipments
                        .routers
                        .get(&node.name)
                        .ok_or_else(|| {
                            ConfigError::Validation(format!(
                                "topology {topology_name}: router {} missing from equipments",
                                node.name
                            ))
                        })?;
                    let p = self
                        .document
                        .prototypes
                        .routers
                        .get(prototype_name)
                        .ok_or_else(|| {
                            ConfigError::Validation(format!(
                                "unknown router prototype {prototype_name}"
                            ))
                        })?;
                    routers.push(RouterSpec {
                        name: node.name.clone(),
                        latency: p.latency,
                        egress_ingress_bw: p.egress_ingress_bw,
                        ports_count: p.ports_count,
                    });
                }
                other => {
                    return Err(ConfigError::Validation(format!(
                        "topology {topology_name}: node type {other:?} is not host or router"
                    )))
                }
            }
        }

        let mut links = Vec::new();
        for (edge_name, edge) in &topology.edges {
            let prototype = self
                .document
                .prototypes
                .links
                .get(&edge.link_type)
                .ok_or_else(|| {
                    ConfigError::Validation(format!("unknown link prototype {}", edge.link_type))
                })?;
            let endpoint = |index: &String| {
                node_names
                    .get(index.as_str())
                    .map(|n| (*n).to_string())
                    .ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "topology edge {edge_name} references unknown node {index}"
                        ))
                    })
            };
            links.push(LinkSpec {
                name: edge_name.clone(),
                latency: prototype.latency,
                src: endpoint(&edge.connection.0)?,
                dst: endpoint(&edge.connection.1)?,
            });
        }

        Ok((hosts, routers, links, topology.egress_err, topology.ingress_err))
    }

    fn build_placement(&self, name: &str) -> Result<Box<dyn PlacementPolicy>, ConfigError> {
        let config: &PlacementConfig =
            self.document.placement_algorithms.get(name).ok_or_else(|| {
                ConfigError::Validation(format!("unknown placement algorithm {name}"))
            })?;
        let policy: Box<dyn PlacementPolicy> = match config.algorithm.as_str() {
            "least_fit" => Box::new(LeastFit::new(
                name.to_string(),
                LeastFitWeights {
                    w_cpu: config.options.w_cpu,
                    w_mem: config.options.w_mem,
                    w_ingress: config.options.w_ingress,
                    w_egress: config.options.w_egress,
                    w_blkio: config.options.w_blkio,
                },
            )),
            "first_fit" => Box::new(FirstFit::new(name.to_string())),
            "first_fit_decreasing" => Box::new(FirstFitDecreasing::new(name.to_string())),
            other => {
                return Err(ConfigError::Validation(format!(
                    "placement algorithm {other:?} is not one of least_fit, first_fit, \
                     first_fit_decreasing"
                )))
            }
        };
        Ok(policy)
    }

    fn build_scaling(
        &self,
        scenario: &SimulationScenarioConfig,
    ) -> Result<Vec<ScalingEntry>, ConfigError> {
        let mut entries = Vec::new();
        for scaling in &scenario.scaling_scenarios {
            for (ms_name, reference) in &scaling.microservice {
                let allocation = self
                    .document
                    .resource_allocation_scenarios
                    .get(&reference.resource_allocation_scenario)
                    .ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "unknown resource allocation scenario {}",
                            reference.resource_allocation_scenario
                        ))
                    })?;
                entries.push(ScalingEntry {
                    microservice: ms_name.clone(),
                    replica_count: reference.replica_count,
                    allocation: ResourceAllocation {
                        name: reference.resource_allocation_scenario.clone(),
                        cpu_requests: allocation.cpu_requests,
                        cpu_limits: allocation.cpu_limits,
                        memory_requests: allocation.memory_capacity,
                        ingress_bw: allocation.ingress_bw.as_f64()?,
                        egress_bw: allocation.egress_bw.as_f64()?,
                        ingress_latency: allocation.ingress_latency,
                        egress_latency: allocation.egress_latency,
                        blkio_capacity: allocation.blkio_capacity,
                    },
                });
            }
        }
        Ok(entries)
    }

    fn build_affinity(
        &self,
        scenario: &SimulationScenarioConfig,
    ) -> Result<Vec<AffinityRule>, ConfigError> {
        let mut rules = Vec::new();
        for affinity in &scenario.affinity_scenarios {
            for (ms_name, reference) in &affinity.microservice {
                let Some(ruleset_name) = &reference.affinity_ruleset else {
                    continue;
                };
                let ruleset = self
                    .document
                    .affinity_rulesets
                    .get(ruleset_name)
                    .ok_or_else(|| {
                        ConfigError::Validation(format!("unknown affinity ruleset {ruleset_name}"))
                    })?;
                rules.push(AffinityRule {
                    microservice: ms_name.clone(),
                    affinity_microservices: ruleset.affinity.microservice.clone(),
                    antiaffinity_microservices: ruleset.anti_affinity.microservice.clone(),
                    affinity_hosts: ruleset.affinity.host.clone(),
                    antiaffinity_hosts: ruleset.anti_affinity.host.clone(),
                });
            }
        }
        Ok(rules)
    }

    fn build_traffic(
        &self,
        scenario: &SimulationScenarioConfig,
    ) -> Result<Vec<TrafficBinding>, ConfigError> {
        let mut bindings = Vec::new();
        for (chain_name, reference) in &scenario.traffic_scenario.service_chains {
            let prototype = self
                .document
                .prototypes
                .traffics
                .get(&reference.traffic_type)
                .ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "unknown traffic prototype {}",
                        reference.traffic_type
                    ))
                })?;
            bindings.push(TrafficBinding {
                service_chain: chain_name.clone(),
                profile: TrafficProfile::new(
                    reference.traffic_type.clone(),
                    prototype.arrival_interval_ns,
                    prototype.duration,
                    prototype.parallel_user,
                    prototype.start_at,
                ),
            });
        }
        Ok(bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> &'static str {
        r#"{
          "prototypes": {
            "microservices": {
              "cpu_service": {
                "endpoint_functions": {
                  "compute": {
                    "threads": [{
                      "instructions": 1209325186,
                      "avg_cpi": 0.76008072,
                      "avg_cpu_usage": 1,
                      "avg_mem_accesses": 414016086,
                      "single_core_isolated_cache_misses": 75266,
                      "single_core_isolated_cache_refs": 799434,
                      "avg_cache_miss_penalty": 5.71
                    }],
                    "request_timeout": -1
                  }
                }
              }
            },
            "hosts": {
              "small_host": {
                "cpu_core_count": 1,
                "cpu_clock_rate": 1596090000,
                "memory_capacity": 17179869184,
                "ram_speed": 2675787694,
                "storage_capacity": 1000000000000,
                "storage_speed": 10695000,
                "network_bandwidth": 117300000
              }
            },
            "routers": {
              "simple_10g_router": {
                "latency": 730000,
                "egress_ingress_bw": 1250000000,
                "ports_count": 101
              }
            },
            "links": { "simple_link": { "latency": 420000 } },
            "traffics": {
              "single_shot": {
                "arrival_interval_ns": 1000000000,
                "duration": 1,
                "parallel_user": 1
              }
            }
          },
          "equipments": {
            "hosts": { "h0": "small_host" },
            "routers": { "r0": "simple_10g_router" }
          },
          "topologies": {
            "star": {
              "egress_err": 0.05,
              "ingress_err": 0.05,
              "nodes": {
                "0": { "type": "host", "name": "h0" },
                "1": { "type": "router", "name": "r0" }
              },
              "edges": {
                "l0": { "link_type": "simple_link", "connection": ["0", "1"] },
                "l1": { "link_type": "simple_link", "connection": ["1", "0"] }
              }
            }
          },
          "service_chains": {
            "sfc1": {
              "nodes": { "0": { "microservice": "cpu_service", "endpoint": "compute" } },
              "edges": {}
            }
          },
          "resource_allocation_scenarios": {
            "best_effort": {
              "cpu_requests": -1,
              "cpu_limits": -1,
              "memory_capacity": 0,
              "ingress_bw": "",
              "egress_bw": "",
              "ingress_latency": 0,
              "egress_latency": 0,
              "blkio_capacity": 0
            }
          },
          "affinity_rulesets": {},
          "placement_algorithms": {
            "least_fit_simple": {
              "algorithm": "least_fit",
              "options": { "w_cpu": 100, "w_mem": 100, "w_ingress": 100, "w_egress": 100, "w_blkio": 0 }
            }
          },
          "storage_driver": { "name": "file_storage", "type": "file", "base_dir": "results" },
          "simulation_scenarios": [{
            "name": "sim1",
            "traffic_scenario": {
              "name": "single",
              "service_chains": { "sfc1": { "traffic_type": "single_shot" } }
            },
            "scaling_scenarios": [{
              "microservice": {
                "cpu_service": { "replica_count": 1, "resource_allocation_scenario": "best_effort" }
              }
            }],
            "affinity_scenarios": [],
            "placement_algorithm": "least_fit_simple",
            "topology": "star",
            "network_timeout": -1,
            "debug": { "debug_level": 0, "log_cpu_events": true }
          }]
        }"#
    }

    #[test]
    fn sample_document_parses_and_builds() {
        let manager = ScenarioManager::from_json(sample_document()).unwrap();
        assert_eq!(manager.scenario_ids(), vec!["sim1"]);

        let sim = manager.build_simulation("sim1").unwrap();
        assert_eq!(sim.name, "sim1");
        assert_eq!(sim.cluster.hosts.len(), 1);
        assert_eq!(sim.cluster.routers.len(), 1);
        assert_eq!(sim.cluster.microservices.len(), 1);
        assert_eq!(sim.cluster.replicas.len(), 1);
        assert_eq!(sim.cluster.requests.len(), 1);
        assert_eq!(sim.load_generator.total_requests, 1);
    }

    #[test]
    fn built_simulation_runs_to_done() {
        let manager = ScenarioManager::from_json(sample_document()).unwrap();
        let mut sim = manager.build_simulation("sim1").unwrap();
        sim.run();

        let results = sim.results();
        let sfc = &results.service_chains["sfc1"];
        assert_eq!(sfc.total_requests, 1);
        assert_eq!(sfc.successful_requests, 1);
        assert_eq!(sfc.timeout_requests, 0);
        assert!(sfc.avg_latency > 0.0);
        // CPU events were enabled; the host sampled at least once.
        assert!(!sim.cpu_timelines().is_empty());
    }

    #[test]
    fn unknown_scenario_id_is_reported() {
        let manager = ScenarioManager::from_json(sample_document()).unwrap();
        let err = manager.build_simulation("nope").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownScenario(_)));
    }

    #[test]
    fn storage_driver_resolves_to_a_file_store() {
        let manager = ScenarioManager::from_json(sample_document()).unwrap();
        let store = manager.results_store().unwrap().unwrap();
        assert_eq!(store.name, "file_storage");
    }
}
