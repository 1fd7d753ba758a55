//! Hosts: one CPU, one ingress and one egress NIC, RAM and storage
//! accounting, the set of placed replicas, and the set of live threads.

use std::collections::BTreeSet;

use latsim_types::{HostId, QosClass, ReplicaId, RouterId, ThreadId, MILLICORES_PER_CORE};

use crate::equipments::cpu::Cpu;
use crate::equipments::nic::Nic;
use crate::equipments::resource::Resource;
use crate::error::SimResult;
use crate::service::microservice::{Microservice, Replica};

/// Cost-relevant periods per host. Recorded for a stable output schema;
/// the driver never prices them, so downstream consumers see zero cost.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CostEvents {
    pub power_on_periods: Vec<(f64, f64)>,
    pub best_effort_periods: Vec<(f64, f64)>,
    pub storage_reserved_periods: Vec<(f64, f64)>,
    pub core_reserved_periods: Vec<(f64, f64)>,
}

/// Static sizing of a host, shared between inventories and scenarios.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSpec {
    pub cpu_core_count: usize,
    /// Hertz.
    pub cpu_clock_rate: f64,
    /// Bytes.
    pub memory_capacity: f64,
    pub ram_speed: f64,
    /// Bytes.
    pub storage_capacity: f64,
    pub storage_speed: f64,
    /// Bytes per second, per NIC direction.
    pub network_bandwidth: f64,
}

#[derive(Debug, Clone)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub cpu: Cpu,
    pub egress_nic: Nic,
    pub ingress_nic: Nic,
    pub ram: Resource,
    pub blkio: Resource,
    pub ram_speed: f64,
    pub storage_speed: f64,

    pub replicas: BTreeSet<ReplicaId>,
    pub threads: BTreeSet<ThreadId>,
    pub load_balancing_needed: bool,
    pub router: Option<RouterId>,
    pub cost_events: CostEvents,
}

impl Host {
    pub fn new(id: HostId, name: impl Into<String>, spec: &HostSpec) -> Self {
        let name = name.into();
        Self {
            id,
            cpu: Cpu::new(
                format!("{name}_cpu0"),
                spec.cpu_core_count,
                spec.cpu_clock_rate,
            ),
            egress_nic: Nic::new(format!("{name}_nic0_egress"), spec.network_bandwidth),
            ingress_nic: Nic::new(format!("{name}_nic0_ingress"), spec.network_bandwidth),
            ram: Resource::new(format!("{name}_ram0"), spec.memory_capacity),
            blkio: Resource::new(format!("{name}_storage0"), spec.storage_capacity),
            ram_speed: spec.ram_speed,
            storage_speed: spec.storage_speed,
            replicas: BTreeSet::new(),
            threads: BTreeSet::new(),
            load_balancing_needed: false,
            router: None,
            cost_events: CostEvents::default(),
            name,
        }
    }

    /// A host is active while at least one live thread runs on it.
    pub fn is_active(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Whether the host's remaining CPU shares, RAM and storage can take
    /// this replica. Best-effort replicas bypass the CPU check.
    pub fn can_fit_replica(&self, ms: &Microservice) -> bool {
        let cpu_ok = self.cpu.can_reserve(ms.cpu_requests as f64)
            || ms.qos() == QosClass::BestEffort;
        cpu_ok
            && self.ram.can_reserve(ms.memory_requests)
            && self.blkio.can_reserve(ms.blkio_capacity)
    }

    /// Places a replica: reserves CPU shares (the request, or the limit for
    /// limited-burstable), RAM, storage, and records the NIC bandwidth
    /// requests. Best-effort replicas reserve no CPU but widen their
    /// process share to the whole host.
    pub fn place_replica(
        &mut self,
        ms: &Microservice,
        replica: &mut Replica,
        now: f64,
    ) -> SimResult<()> {
        // Check every dimension first so a refusal leaves no partial
        // reservation behind.
        let cpu_amount = match ms.qos() {
            QosClass::Guaranteed | QosClass::BurstableUnlimited => Some(ms.cpu_requests as f64),
            QosClass::BurstableLimited => Some(ms.cpu_limits as f64),
            QosClass::BestEffort => None,
        };
        if let Some(amount) = cpu_amount {
            if !self.cpu.can_reserve_uniform(amount) {
                return Err(crate::error::SimError::ResourceUnavailable(format!(
                    "host {} cannot reserve {amount} millicores for {}",
                    self.name, replica.name
                )));
            }
        }
        if !self.ram.can_reserve(ms.memory_requests) || !self.blkio.can_reserve(ms.blkio_capacity)
        {
            return Err(crate::error::SimError::ResourceUnavailable(format!(
                "host {} cannot fit replica {}",
                self.name, replica.name
            )));
        }

        match ms.qos() {
            QosClass::Guaranteed | QosClass::BurstableUnlimited => {
                self.cpu.reserve(ms.cpu_requests as f64)?;
            }
            QosClass::BurstableLimited => {
                self.cpu.reserve(ms.cpu_limits as f64)?;
            }
            QosClass::BestEffort => {
                replica.process.cpu_requests_share =
                    self.cpu.cores.len() as f64 * MILLICORES_PER_CORE;
            }
        }
        self.ram.reserve(ms.memory_requests)?;
        self.blkio.reserve(ms.blkio_capacity)?;
        self.egress_nic.request_bw(ms.egress_bw);
        self.ingress_nic.request_bw(ms.ingress_bw);

        self.replicas.insert(replica.id);
        if self.replicas.len() == 1 {
            self.cost_events.power_on_periods.push((now, f64::INFINITY));
        }
        replica.host = Some(self.id);
        Ok(())
    }

    /// Evicts a replica and releases everything placement reserved.
    pub fn evict_replica(&mut self, ms: &Microservice, replica: &mut Replica, now: f64) {
        self.replicas.remove(&replica.id);
        match ms.qos() {
            QosClass::Guaranteed => self.cpu.release(ms.cpu_requests as f64),
            QosClass::BurstableUnlimited => self.cpu.release(ms.cpu_requests as f64),
            QosClass::BurstableLimited => self.cpu.release(ms.cpu_limits as f64),
            QosClass::BestEffort => {}
        }
        self.ram.release(ms.memory_requests);
        self.blkio.release(ms.blkio_capacity);
        self.egress_nic.dismiss_bw(ms.egress_bw);
        self.ingress_nic.dismiss_bw(ms.ingress_bw);

        if self.replicas.is_empty() {
            if let Some(last) = self.cost_events.power_on_periods.last_mut() {
                assert!(
                    last.1.is_infinite(),
                    "host {} powered off while already off",
                    self.name
                );
                last.1 = now;
            }
        }
        replica.host = None;
    }
}
