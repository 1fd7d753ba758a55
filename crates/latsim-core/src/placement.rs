//! Placement policies: pure assignment of replicas to hosts under
//! affinity/anti-affinity constraints and residual-capacity checks.
//!
//! Policies are trait objects over one capability; the default least-fit
//! scorer prefers the host that stays least loaded relative to its
//! capacity, weighted per resource dimension.

use std::collections::BTreeSet;

use latsim_types::{HostId, ReplicaId};

use crate::equipments::host::Host;
use crate::error::{SimError, SimResult};
use crate::service::microservice::{Microservice, Replica};

/// Replica counts per (microservice, host), filled by placement.
#[derive(Debug, Clone)]
pub struct PlacementMatrix {
    pub counts: Vec<Vec<u32>>,
}

impl PlacementMatrix {
    pub fn zeros(microservices: usize, hosts: usize) -> Self {
        Self {
            counts: vec![vec![0; hosts]; microservices],
        }
    }

    pub fn bump(&mut self, ms: usize, host: usize) {
        self.counts[ms][host] += 1;
    }
}

pub trait PlacementPolicy: std::fmt::Debug {
    fn name(&self) -> &str;

    /// Assigns every replica in `order` a host, reserving its resources, or
    /// fails with [`SimError::ResourceUnavailable`].
    fn place(
        &self,
        matrix: &mut PlacementMatrix,
        order: &[ReplicaId],
        microservices: &mut [Microservice],
        replicas: &mut [Replica],
        hosts: &mut [Host],
        now: f64,
    ) -> SimResult<()>;
}

/// Hosts a replica may land on: the affinity intersection when any affinity
/// rule exists (hosts already running an affine microservice, plus explicit
/// affinity hosts), every host otherwise; minus anti-affinity hosts.
fn candidate_hosts(
    ms: &Microservice,
    microservices: &[Microservice],
    hosts: &[Host],
) -> Vec<HostId> {
    let mut candidates: BTreeSet<HostId> =
        if ms.ms_affinity.is_empty() && ms.host_affinity.is_empty() {
            hosts.iter().map(|h| h.id).collect()
        } else {
            let mut set: BTreeSet<HostId> = ms.host_affinity.iter().copied().collect();
            for affine in &ms.ms_affinity {
                set.extend(microservices[affine.index()].hosts.iter().copied());
            }
            set
        };

    for hostile in &ms.ms_antiaffinity {
        for host in &microservices[hostile.index()].hosts {
            candidates.remove(host);
        }
    }
    for host in &ms.host_antiaffinity {
        candidates.remove(host);
    }

    candidates.into_iter().collect()
}

fn commit_placement(
    matrix: &mut PlacementMatrix,
    microservices: &mut [Microservice],
    replicas: &mut [Replica],
    hosts: &mut [Host],
    rid: ReplicaId,
    host: HostId,
    now: f64,
) -> SimResult<()> {
    let ms_id = replicas[rid.index()].ms;
    hosts[host.index()].place_replica(
        &microservices[ms_id.index()],
        &mut replicas[rid.index()],
        now,
    )?;
    microservices[ms_id.index()].hosts.push(host);
    matrix.bump(ms_id.index(), host.index());
    Ok(())
}

// ============================================================================
// Least fit
// ============================================================================

/// Per-resource weights of the least-fit score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeastFitWeights {
    pub w_cpu: f64,
    pub w_mem: f64,
    pub w_ingress: f64,
    pub w_egress: f64,
    pub w_blkio: f64,
}

impl Default for LeastFitWeights {
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

impl LeastFitWeights {
    fn sum(&self) -> f64 {
        self.w_cpu + self.w_mem + self.w_ingress + self.w_egress + self.w_blkio
    }
}

#[derive(Debug, Clone)]
pub struct LeastFit {
    pub name: String,
    pub weights: LeastFitWeights,
}

impl LeastFit {
    pub fn new(name: impl Into<String>, weights: LeastFitWeights) -> Self {
        Self {
            name: name.into(),
            weights,
        }
    }

    /// Weighted occupancy of one dimension after hypothetically placing the
    /// request: higher means fuller. Requests beyond the capacity count as
    /// the full capacity.
    fn score(available: f64, capacity: f64, requested: f64, weight: f64) -> f64 {
        let requested = requested.min(capacity);
        (100.0 - ((available - requested) * (100.0 / capacity))) * weight
    }

    fn host_score(&self, host: &Host, ms: &Microservice) -> f64 {
        let w = &self.weights;
        let total = Self::score(
            host.cpu.available(),
            host.cpu.capacity(),
            ms.cpu_requests as f64,
            w.w_cpu,
        ) + Self::score(
            host.ram.available(),
            host.ram.capacity,
            ms.memory_requests,
            w.w_mem,
        ) + Self::score(
            host.ingress_nic.available(),
            host.ingress_nic.bandwidth,
            ms.ingress_bw,
            w.w_ingress,
        ) + Self::score(
            host.egress_nic.available(),
            host.egress_nic.bandwidth,
            ms.egress_bw,
            w.w_egress,
        ) + Self::score(
            host.blkio.available(),
            host.blkio.capacity,
            ms.blkio_capacity,
            w.w_blkio,
        );
        total / self.weights.sum()
    }
}

impl PlacementPolicy for LeastFit {
    fn name(&self) -> &str {
        &self.name
    }

    fn place(
        &self,
        matrix: &mut PlacementMatrix,
        order: &[ReplicaId],
        microservices: &mut [Microservice],
        replicas: &mut [Replica],
        hosts: &mut [Host],
        now: f64,
    ) -> SimResult<()> {
        for &rid in order {
            let ms_id = replicas[rid.index()].ms;
            let candidates = candidate_hosts(&microservices[ms_id.index()], microservices, hosts);

            let mut best: Option<(f64, HostId)> = None;
            for host_id in candidates {
                let host = &hosts[host_id.index()];
                let ms = &microservices[ms_id.index()];
                if !host.can_fit_replica(ms) {
                    continue;
                }
                let score = self.host_score(host, ms);
                best = match best {
                    None => Some((score, host_id)),
                    Some((lowest, _)) if score < lowest => Some((score, host_id)),
                    Some((lowest, incumbent))
                        if score == lowest
                            && host.replicas.len() < hosts[incumbent.index()].replicas.len() =>
                    {
                        Some((lowest, host_id))
                    }
                    keep => keep,
                };
            }

            let Some((_, chosen)) = best else {
                return Err(SimError::ResourceUnavailable(format!(
                    "available hosts are not enough to place replica {}",
                    replicas[rid.index()].name
                )));
            };
            commit_placement(matrix, microservices, replicas, hosts, rid, chosen, now)?;
        }
        Ok(())
    }
}

// ============================================================================
// First fit
// ============================================================================

#[derive(Debug, Clone)]
pub struct FirstFit {
    pub name: String,
}

impl FirstFit {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn place_in_order(
        matrix: &mut PlacementMatrix,
        order: &[ReplicaId],
        microservices: &mut [Microservice],
        replicas: &mut [Replica],
        hosts: &mut [Host],
        now: f64,
    ) -> SimResult<()> {
        for &rid in order {
            let ms_id = replicas[rid.index()].ms;
            let candidates = candidate_hosts(&microservices[ms_id.index()], microservices, hosts);

            let mut placed = false;
            for host_id in candidates {
                match commit_placement(matrix, microservices, replicas, hosts, rid, host_id, now) {
                    Ok(()) => {
                        placed = true;
                        break;
                    }
                    Err(SimError::ResourceUnavailable(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            if !placed {
                return Err(SimError::ResourceUnavailable(format!(
                    "available hosts are not enough to place replica {}",
                    replicas[rid.index()].name
                )));
            }
        }
        Ok(())
    }
}

impl PlacementPolicy for FirstFit {
    fn name(&self) -> &str {
        &self.name
    }

    fn place(
        &self,
        matrix: &mut PlacementMatrix,
        order: &[ReplicaId],
        microservices: &mut [Microservice],
        replicas: &mut [Replica],
        hosts: &mut [Host],
        now: f64,
    ) -> SimResult<()> {
        Self::place_in_order(matrix, order, microservices, replicas, hosts, now)
    }
}

/// First fit over replicas sorted by descending CPU request.
#[derive(Debug, Clone)]
pub struct FirstFitDecreasing {
    pub name: String,
}

impl FirstFitDecreasing {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PlacementPolicy for FirstFitDecreasing {
    fn name(&self) -> &str {
        &self.name
    }

    fn place(
        &self,
        matrix: &mut PlacementMatrix,
        order: &[ReplicaId],
        microservices: &mut [Microservice],
        replicas: &mut [Replica],
        hosts: &mut [Host],
        now: f64,
    ) -> SimResult<()> {
        let mut sorted: Vec<ReplicaId> = order.to_vec();
        sorted.sort_by_key(|rid| {
            let ms = replicas[rid.index()].ms;
            (
                std::cmp::Reverse(microservices[ms.index()].cpu_requests),
                *rid,
            )
        });
        FirstFit::place_in_order(matrix, &sorted, microservices, replicas, hosts, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equipments::host::HostSpec;
    use latsim_types::MsId;

    fn spec(cores: usize) -> HostSpec {
        HostSpec {
            cpu_core_count: cores,
            cpu_clock_rate: 1.59609e9,
            memory_capacity: 16e9,
            ram_speed: 2.675e9,
            storage_capacity: 1e12,
            storage_speed: 1.07e7,
            network_bandwidth: 117_300_000.0,
        }
    }

    fn world(
        ms_specs: &[(i64, i64, usize)],
        host_count: usize,
    ) -> (Vec<Microservice>, Vec<Replica>, Vec<Host>, Vec<ReplicaId>) {
        let mut microservices = Vec::new();
        let mut replicas = Vec::new();
        let mut order = Vec::new();
        for (i, (req, lim, count)) in ms_specs.iter().enumerate() {
            let mut ms = Microservice::new(MsId::from(i), format!("ms{i}"));
            ms.cpu_requests = *req;
            ms.cpu_limits = *lim;
            for _ in 0..*count {
                let rid = ReplicaId::from(replicas.len());
                let replica = Replica::new(rid, &ms, ms.replicas.len());
                ms.replicas.push(rid);
                replicas.push(replica);
                order.push(rid);
            }
            microservices.push(ms);
        }
        let hosts = (0..host_count)
            .map(|i| Host::new(HostId::from(i), format!("h{i}"), &spec(1)))
            .collect();
        (microservices, replicas, hosts, order)
    }

    #[test]
    fn least_fit_spreads_replicas() {
        let (mut ms, mut replicas, mut hosts, order) = world(&[(400, 400, 2)], 2);
        let mut matrix = PlacementMatrix::zeros(1, 2);
        let policy = LeastFit::new("least_fit", LeastFitWeights::default());
        policy
            .place(&mut matrix, &order, &mut ms, &mut replicas, &mut hosts, 0.0)
            .unwrap();
        assert_eq!(matrix.counts[0], vec![1, 1]);
    }

    #[test]
    fn first_fit_packs_the_first_host() {
        let (mut ms, mut replicas, mut hosts, order) = world(&[(400, 400, 2)], 2);
        let mut matrix = PlacementMatrix::zeros(1, 2);
        let policy = FirstFit::new("first_fit");
        policy
            .place(&mut matrix, &order, &mut ms, &mut replicas, &mut hosts, 0.0)
            .unwrap();
        assert_eq!(matrix.counts[0], vec![2, 0]);
    }

    #[test]
    fn overcommit_raises_resource_unavailable() {
        let (mut ms, mut replicas, mut hosts, order) = world(&[(800, 800, 2)], 1);
        let mut matrix = PlacementMatrix::zeros(1, 1);
        let policy = LeastFit::new("least_fit", LeastFitWeights::default());
        let err = policy
            .place(&mut matrix, &order, &mut ms, &mut replicas, &mut hosts, 0.0)
            .unwrap_err();
        assert!(matches!(err, SimError::ResourceUnavailable(_)));
    }

    #[test]
    fn anti_affinity_excludes_hosts() {
        let (mut ms, mut replicas, mut hosts, order) = world(&[(100, 100, 1)], 2);
        ms[0].host_antiaffinity.insert(HostId::new(0));
        let mut matrix = PlacementMatrix::zeros(1, 2);
        let policy = FirstFit::new("first_fit");
        policy
            .place(&mut matrix, &order, &mut ms, &mut replicas, &mut hosts, 0.0)
            .unwrap();
        assert_eq!(matrix.counts[0], vec![0, 1]);
    }

    #[test]
    fn no_affinity_rules_means_every_host_is_a_candidate() {
        let (ms, _, hosts, _) = world(&[(100, 100, 1)], 3);
        let candidates = candidate_hosts(&ms[0], &ms, &hosts);
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn first_fit_decreasing_places_big_replicas_first() {
        let (mut ms, mut replicas, mut hosts, order) = world(&[(200, 200, 1), (700, 700, 1)], 2);
        let mut matrix = PlacementMatrix::zeros(2, 2);
        let policy = FirstFitDecreasing::new("ffd");
        policy
            .place(&mut matrix, &order, &mut ms, &mut replicas, &mut hosts, 0.0)
            .unwrap();
        // The 700-millicore replica claims host 0 first; the 200 one joins it.
        assert_eq!(matrix.counts[1], vec![1, 0]);
        assert_eq!(matrix.counts[0], vec![1, 0]);
    }
}
