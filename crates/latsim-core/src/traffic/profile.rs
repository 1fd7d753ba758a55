//! Traffic profiles: deterministic arrival tables.
//!
//! A profile generates `floor(duration / interval)` batches of
//! `parallel_users` requests each, the first at `start_at` and the rest at
//! fixed intervals. All derived values recompute whenever a parameter
//! changes.

use latsim_types::sec_to_ns;

#[derive(Debug, Clone)]
pub struct TrafficProfile {
    pub name: String,
    arrival_interval_ns: u64,
    duration_s: u64,
    parallel_users: u64,
    start_at_s: u64,

    iterations: u64,
    arrival_table: Vec<u64>,
}

impl TrafficProfile {
    /// # Panics
    ///
    /// Panics on a zero arrival interval.
    pub fn new(
        name: impl Into<String>,
        arrival_interval_ns: u64,
        duration_s: u64,
        parallel_users: u64,
        start_at_s: u64,
    ) -> Self {
        assert!(arrival_interval_ns > 0, "arrival interval must be positive");
        let mut profile = Self {
            name: name.into(),
            arrival_interval_ns,
            duration_s,
            parallel_users,
            start_at_s,
            iterations: 0,
            arrival_table: Vec::new(),
        };
        profile.recalc();
        profile
    }

    fn recalc(&mut self) {
        self.iterations = sec_to_ns(self.duration_s) / self.arrival_interval_ns;
        self.arrival_table.clear();
        if self.start_at_s > self.duration_s {
            return;
        }
        let mut arrival = sec_to_ns(self.start_at_s);
        for _ in 0..self.iterations {
            self.arrival_table.push(arrival);
            arrival += self.arrival_interval_ns;
        }
    }

    pub fn set_arrival_interval_ns(&mut self, v: u64) {
        assert!(v > 0, "arrival interval must be positive");
        self.arrival_interval_ns = v;
        self.recalc();
    }

    pub fn set_duration_s(&mut self, v: u64) {
        self.duration_s = v;
        self.recalc();
    }

    pub fn set_parallel_users(&mut self, v: u64) {
        self.parallel_users = v;
        self.recalc();
    }

    pub fn arrival_interval_ns(&self) -> u64 {
        self.arrival_interval_ns
    }

    pub fn parallel_users(&self) -> u64 {
        self.parallel_users
    }

    /// Number of batch arrivals.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Total requests this profile generates.
    pub fn requests_count(&self) -> u64 {
        self.arrival_table.len() as u64 * self.parallel_users
    }

    /// Batch arrival clocks in nanoseconds, ascending.
    pub fn arrival_table(&self) -> &[u64] {
        &self.arrival_table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_batches_per_second_for_one_second() {
        let p = TrafficProfile::new("3batchps_1sec_2paralleluser", 333_333_333, 1, 2, 0);
        assert_eq!(p.iterations(), 3);
        assert_eq!(p.requests_count(), 6);
        assert_eq!(
            p.arrival_table(),
            &[0, 333_333_333, 666_666_666]
        );
    }

    #[test]
    fn interval_longer_than_duration_generates_nothing() {
        let p = TrafficProfile::new("slow", 2_000_000_000, 1, 4, 0);
        assert_eq!(p.iterations(), 0);
        assert_eq!(p.requests_count(), 0);
        assert!(p.arrival_table().is_empty());
    }

    #[test]
    fn start_at_past_duration_generates_nothing() {
        let p = TrafficProfile::new("late", 1_000_000, 1, 1, 5);
        assert_eq!(p.requests_count(), 0);
    }

    #[test]
    fn parameter_change_recomputes_the_table() {
        let mut p = TrafficProfile::new("t", 500_000_000, 1, 1, 0);
        assert_eq!(p.iterations(), 2);
        p.set_duration_s(2);
        assert_eq!(p.iterations(), 4);
        assert_eq!(p.arrival_table().len(), 4);
    }
}
