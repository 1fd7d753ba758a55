//! Network interface model.
//!
//! A NIC caps per-flow bandwidth through its `bandwidth` and carries a
//! separate `bandwidth_requests_total` running counter. The counter tracks
//! what placed replicas *asked* for and only feeds placement scoring; it is
//! unrelated to the per-flow allocation the topology computes.

use std::collections::BTreeMap;

use latsim_types::{RequestId, TransmissionId};

#[derive(Debug, Clone)]
pub struct Nic {
    pub name: String,
    /// Bytes per second.
    pub bandwidth: f64,
    /// Sum of bandwidth requests of placed replicas. May be infinite when a
    /// replica declares no bandwidth bound.
    pub bandwidth_requests_total: f64,
    /// Active transmissions reserved on this NIC, one per
    /// (request, subchain) pair.
    transmissions: BTreeMap<(RequestId, usize), TransmissionId>,
}

impl Nic {
    pub fn new(name: impl Into<String>, bandwidth: f64) -> Self {
        Self {
            name: name.into(),
            bandwidth,
            bandwidth_requests_total: 0.0,
            transmissions: BTreeMap::new(),
        }
    }

    /// Records a placement-time bandwidth request.
    pub fn request_bw(&mut self, bandwidth_request: f64) {
        self.bandwidth_requests_total += bandwidth_request;
    }

    /// Removes a placement-time bandwidth request.
    ///
    /// # Panics
    ///
    /// Panics when more bandwidth is dismissed than was ever requested.
    pub fn dismiss_bw(&mut self, bandwidth_request: f64) {
        self.bandwidth_requests_total -= bandwidth_request;
        assert!(
            self.bandwidth_requests_total >= 0.0 || self.bandwidth_requests_total.is_nan(),
            "NIC {} released more bandwidth requests than were made",
            self.name
        );
    }

    /// Headroom used by placement scoring. When requests already exceed the
    /// physical bandwidth the NIC reports its full capacity, so an
    /// over-subscribed NIC does not produce negative scores.
    pub fn available(&self) -> f64 {
        if self.bandwidth_requests_total > self.bandwidth {
            self.bandwidth
        } else {
            self.bandwidth - self.bandwidth_requests_total
        }
    }

    /// Registers a transmission for a (request, subchain) pair.
    ///
    /// # Panics
    ///
    /// Panics when a transmission for the pair is already reserved; the
    /// request state machine never starts the same hop twice.
    pub fn register_transmission(
        &mut self,
        request: RequestId,
        subchain_id: usize,
        transmission: TransmissionId,
    ) {
        let prev = self.transmissions.insert((request, subchain_id), transmission);
        assert!(
            prev.is_none(),
            "NIC {} already carries a transmission for request {request} subchain {subchain_id}",
            self.name
        );
    }

    /// Releases the transmission reserved for a (request, subchain) pair.
    ///
    /// # Panics
    ///
    /// Panics when no such reservation exists.
    pub fn release_transmission(&mut self, request: RequestId, subchain_id: usize) -> TransmissionId {
        self.transmissions
            .remove(&(request, subchain_id))
            .unwrap_or_else(|| {
                panic!(
                    "NIC {} has no transmission for request {request} subchain {subchain_id}",
                    self.name
                )
            })
    }

    pub fn active_transmissions(&self) -> usize {
        self.transmissions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_request_counter_round_trip() {
        let mut nic = Nic::new("h0_nic0_egress", 117_300_000.0);
        nic.request_bw(50_000_000.0);
        assert_eq!(nic.available(), 67_300_000.0);
        nic.dismiss_bw(50_000_000.0);
        assert_eq!(nic.available(), 117_300_000.0);
    }

    #[test]
    fn oversubscribed_nic_reports_full_capacity() {
        let mut nic = Nic::new("nic", 100.0);
        nic.request_bw(f64::INFINITY);
        assert_eq!(nic.available(), 100.0);
    }

    #[test]
    #[should_panic(expected = "already carries a transmission")]
    fn duplicate_reservation_panics() {
        let mut nic = Nic::new("nic", 100.0);
        nic.register_transmission(RequestId::new(1), 0, TransmissionId::new(0));
        nic.register_transmission(RequestId::new(1), 0, TransmissionId::new(1));
    }
}
