//! Results aggregation and persistence.
//!
//! The per-scenario output groups the latency table by service chain:
//! request counts, average latency, one-second throughput buckets, and
//! per-iteration maps of arrival/latency/completion/traffic-type. All
//! times are integer nanoseconds. Cost fields are present but zero; the
//! driver performs no cost accounting.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::cluster::LatencyRow;
use crate::equipments::cpu::CpuSample;

/// `{ "iterations": { iteration -> { request key -> value } } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Iterations<T> {
    pub iterations: BTreeMap<u64, BTreeMap<String, T>>,
}

impl<T> Iterations<T> {
    fn insert(&mut self, iteration: u64, key: String, value: T) {
        self.iterations
            .entry(iteration)
            .or_default()
            .insert(key, value);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceChainResult {
    pub simulation_name: String,
    pub estimated_cost: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub timeout_requests: u64,
    pub avg_latency: f64,
    /// Completed requests per one-second bucket of completion time; keys
    /// are `(lo, hi]` nanosecond intervals.
    pub throughput: BTreeMap<String, u64>,
    pub arrival_times: Iterations<u64>,
    pub latencies: Iterations<u64>,
    pub completion_times: Iterations<u64>,
    pub traffic_types: Iterations<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationResults {
    pub service_chains: BTreeMap<String, ServiceChainResult>,
}

/// Groups the latency table by service chain. `final_time_ns` bounds the
/// throughput bucket range; empty buckets are reported as zero.
pub fn build_results(
    simulation_name: &str,
    rows: &[LatencyRow],
    final_time_ns: f64,
) -> SimulationResults {
    let mut by_chain: BTreeMap<String, Vec<&LatencyRow>> = BTreeMap::new();
    for row in rows {
        by_chain.entry(row.service_chain.clone()).or_default().push(row);
    }

    let bucket_count = ((final_time_ns / 1e9).floor() as u64) + 1;

    let mut service_chains = BTreeMap::new();
    for (chain, rows) in by_chain {
        let mut throughput: BTreeMap<String, u64> = BTreeMap::new();
        for bucket in 0..bucket_count {
            throughput.insert(bucket_label(bucket), 0);
        }

        let mut arrival_times = Iterations::default();
        let mut latencies = Iterations::default();
        let mut completion_times = Iterations::default();
        let mut traffic_types = Iterations::default();
        let mut latency_sum = 0u64;

        for row in &rows {
            latency_sum += row.latency_ns;
            arrival_times.insert(row.iteration_id, row.request_key.clone(), row.arrival_ns);
            latencies.insert(row.iteration_id, row.request_key.clone(), row.latency_ns);
            completion_times.insert(
                row.iteration_id,
                row.request_key.clone(),
                row.completion_ns,
            );
            traffic_types.insert(
                row.iteration_id,
                row.request_key.clone(),
                row.traffic_type.clone(),
            );

            let bucket = if row.completion_ns == 0 {
                0
            } else {
                (row.completion_ns - 1) / 1_000_000_000
            };
            *throughput.entry(bucket_label(bucket)).or_insert(0) += 1;
        }

        let total = rows.len() as u64;
        service_chains.insert(
            chain,
            ServiceChainResult {
                simulation_name: simulation_name.to_string(),
                estimated_cost: 0.0,
                total_requests: total,
                successful_requests: total,
                timeout_requests: 0,
                avg_latency: if total == 0 {
                    0.0
                } else {
                    latency_sum as f64 / total as f64
                },
                throughput,
                arrival_times,
                latencies,
                completion_times,
                traffic_types,
            },
        );
    }

    SimulationResults { service_chains }
}

fn bucket_label(bucket: u64) -> String {
    let lo = bucket as f64 * 1e9;
    let hi = (bucket + 1) as f64 * 1e9;
    format!("({lo:.1}, {hi:.1}]")
}

// ============================================================================
// Persistence
// ============================================================================

/// Where results documents end up. File-backed by default; remote stores
/// plug in behind the same trait.
pub trait ResultsStore: std::fmt::Debug {
    fn name(&self) -> &str;

    /// Persists the results document (and CPU timelines, when sampled) for
    /// one simulation. Returns the directory written to.
    fn save_all(
        &self,
        simulation_name: &str,
        results: &SimulationResults,
        cpu_timelines: &BTreeMap<String, Vec<CpuSample>>,
    ) -> io::Result<PathBuf>;
}

/// Writes pretty-printed JSON under `<base_dir>/<simulation_name>/`.
#[derive(Debug, Clone)]
pub struct FileResultsStore {
    pub name: String,
    pub base_dir: PathBuf,
}

impl FileResultsStore {
    pub fn new(name: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.into(),
        }
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(io::BufWriter::new(file), value)
            .map_err(io::Error::other)
    }
}

impl ResultsStore for FileResultsStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn save_all(
        &self,
        simulation_name: &str,
        results: &SimulationResults,
        cpu_timelines: &BTreeMap<String, Vec<CpuSample>>,
    ) -> io::Result<PathBuf> {
        let dir = self.base_dir.join(simulation_name);
        fs::create_dir_all(&dir)?;
        Self::write_json(&dir.join("result.json"), results)?;
        if !cpu_timelines.is_empty() {
            Self::write_json(&dir.join("cpu_timelines.json"), cpu_timelines)?;
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(chain: &str, key: &str, iteration: u64, arrival: u64, completion: u64) -> LatencyRow {
        LatencyRow {
            scenario: "sim1".into(),
            service_chain: chain.into(),
            iteration_id: iteration,
            id_in_iteration: 0,
            request_key: key.into(),
            latency_ns: completion - arrival,
            arrival_ns: arrival,
            completion_ns: completion,
            status: "COMPLETED".into(),
            traffic_type: "t1".into(),
        }
    }

    #[test]
    fn groups_by_chain_and_averages_latency() {
        let rows = vec![
            row("sfc1", "r0", 0, 0, 400),
            row("sfc1", "r1", 1, 100, 300),
            row("sfc2", "r2", 0, 0, 1_500_000_000),
        ];
        let results = build_results("sim1", &rows, 2e9);

        let sfc1 = &results.service_chains["sfc1"];
        assert_eq!(sfc1.total_requests, 2);
        assert_eq!(sfc1.successful_requests, 2);
        assert_eq!(sfc1.timeout_requests, 0);
        assert_eq!(sfc1.avg_latency, 300.0);
        assert_eq!(sfc1.estimated_cost, 0.0);
        assert_eq!(sfc1.latencies.iterations[&1]["r1"], 200);
    }

    #[test]
    fn throughput_buckets_cover_the_whole_run() {
        let rows = vec![
            row("sfc1", "r0", 0, 0, 500_000_000),
            row("sfc1", "r1", 0, 0, 900_000_000),
            row("sfc1", "r2", 1, 0, 1_100_000_000),
        ];
        let results = build_results("sim1", &rows, 2.5e9);
        let throughput = &results.service_chains["sfc1"].throughput;

        assert_eq!(throughput[&bucket_label(0)], 2);
        assert_eq!(throughput[&bucket_label(1)], 1);
        // Empty trailing bucket still reported.
        assert_eq!(throughput[&bucket_label(2)], 0);
    }

    #[test]
    fn file_store_writes_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultsStore::new("file_storage", dir.path());
        let results = build_results("sim1", &[row("sfc1", "r0", 0, 0, 10)], 1e9);
        let written = store
            .save_all("sim1", &results, &BTreeMap::new())
            .unwrap();
        let text = fs::read_to_string(written.join("result.json")).unwrap();
        assert!(text.contains("\"sfc1\""));
        assert!(text.contains("\"avg_latency\""));
    }
}
