//! Transmissions: single payloads moving between two replicas along a
//! precomputed path.
//!
//! A transmission first drains its residual latency (links + intermediate
//! routers + replica egress/ingress), then its payload at the currently
//! allocated bandwidth. Completion clocks are tracked cluster-wide in a
//! refcounted ordered map the driver peeks for its next-event choice.

use std::collections::BTreeMap;

use latsim_types::{LinkId, OrderedFloat, ReplicaId, RequestId, TransmissionId};

/// Payload residues smaller than one byte snap to zero.
const PAYLOAD_EPSILON: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Transmission {
    pub id: TransmissionId,
    pub request: RequestId,
    pub subchain_id: usize,
    pub src_replica: ReplicaId,
    pub dst_replica: ReplicaId,

    pub original_payload: f64,
    pub remaining_payload: f64,

    /// Links crossed, in hop order. Empty for same-host transmissions.
    pub links: Vec<LinkId>,
    /// Residual latency: links + distinct intermediate routers + replica
    /// egress/ingress latencies.
    pub total_latency: f64,

    /// Bandwidth the flow would like, after every cap (bytes/s).
    pub requested_bw: f64,
    /// Bandwidth currently granted; `None` until the first allocation pass,
    /// infinite for same-host flows.
    pub current_bw: Option<f64>,

    /// Last predicted remaining duration / absolute completion clock.
    pub predicted_time: Option<f64>,
    pub predicted_clock: Option<f64>,

    pub done: bool,
}

impl Transmission {
    pub fn is_local(&self) -> bool {
        self.links.is_empty()
    }

    /// Recomputes the predicted remaining duration and completion clock.
    pub fn predict(&mut self, now: f64) -> f64 {
        let time = if self.is_local() {
            0.0
        } else {
            let bw = self
                .current_bw
                .expect("predicting a networked flow before bandwidth allocation");
            (self.remaining_payload / bw) * 1e9 + self.total_latency
        };
        self.predicted_time = Some(time);
        self.predicted_clock = Some(time + now);
        time
    }

    /// Advances the transmission by `duration` nanoseconds: residual latency
    /// first, payload second. Returns the refreshed predicted remaining
    /// duration.
    ///
    /// # Panics
    ///
    /// Panics when the payload undershoots -1 B; bandwidth accounting never
    /// overdraws by more than float noise.
    pub fn transmit(&mut self, duration: f64, now: f64) -> f64 {
        let mut duration = duration;
        if self.total_latency > 0.0 {
            if duration > self.total_latency {
                duration -= self.total_latency;
                self.total_latency = 0.0;
            } else {
                self.total_latency -= duration;
                return self.predict(now);
            }
        }

        let bw = self.current_bw.unwrap_or(f64::INFINITY);
        if bw.is_finite() {
            self.remaining_payload -= bw * (duration / 1e9);
        } else {
            self.remaining_payload = 0.0;
        }

        if self.remaining_payload.abs() < PAYLOAD_EPSILON {
            self.remaining_payload = 0.0;
        } else {
            assert!(
                self.remaining_payload >= 0.0,
                "transmission {} payload went {} bytes negative",
                self.id,
                -self.remaining_payload
            );
        }

        self.predict(now)
    }
}

// ============================================================================
// Completion clocks
// ============================================================================

/// Cluster-wide ordered map of predicted completion clocks. Each clock
/// carries a refcount so several flows finishing at the same instant pop
/// one at a time.
#[derive(Debug, Clone, Default)]
pub struct CompletionBoard {
    clocks: BTreeMap<OrderedFloat<f64>, u32>,
}

impl CompletionBoard {
    /// The earliest pending completion clock, if any flow is in flight.
    pub fn peek(&self) -> Option<f64> {
        self.clocks.first_key_value().map(|(k, _)| k.0)
    }

    pub fn insert(&mut self, clock: f64) {
        *self.clocks.entry(OrderedFloat(clock)).or_insert(0) += 1;
    }

    /// Drops one reference to `clock`. Unknown clocks are ignored: a flow
    /// may retime before its first prediction ever landed here.
    pub fn remove(&mut self, clock: f64) {
        if let Some(count) = self.clocks.get_mut(&OrderedFloat(clock)) {
            if *count > 1 {
                *count -= 1;
            } else {
                self.clocks.remove(&OrderedFloat(clock));
            }
        }
    }

    /// Drops one reference to the minimum entry when it equals `clock`.
    pub fn remove_min_if_equals(&mut self, clock: f64) {
        if self.peek() == Some(clock) {
            self.remove(clock);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(payload: f64, latency: f64, links: Vec<LinkId>) -> Transmission {
        Transmission {
            id: TransmissionId::new(0),
            request: RequestId::new(0),
            subchain_id: 0,
            src_replica: ReplicaId::new(0),
            dst_replica: ReplicaId::new(1),
            original_payload: payload,
            remaining_payload: payload,
            links,
            total_latency: latency,
            requested_bw: 0.0,
            current_bw: None,
            predicted_time: None,
            predicted_clock: None,
            done: false,
        }
    }

    #[test]
    fn latency_drains_before_payload() {
        let mut t = flow(1000.0, 500.0, vec![LinkId::new(0)]);
        t.current_bw = Some(1e9); // 1 GB/s -> 1 B/ns

        // Less than the residual latency: payload untouched.
        t.transmit(200.0, 200.0);
        assert_eq!(t.total_latency, 300.0);
        assert_eq!(t.remaining_payload, 1000.0);

        // Crossing the latency boundary spends the remainder on payload.
        t.transmit(800.0, 1000.0);
        assert_eq!(t.total_latency, 0.0);
        assert_eq!(t.remaining_payload, 500.0);
    }

    #[test]
    fn sub_byte_residue_snaps_to_zero() {
        let mut t = flow(1000.0, 0.0, vec![LinkId::new(0)]);
        t.current_bw = Some(1e9);
        let remaining = t.transmit(999.5, 999.5);
        assert_eq!(t.remaining_payload, 0.0);
        assert_eq!(remaining, 0.0);
    }

    #[test]
    fn local_flows_finish_in_zero_time() {
        let mut t = flow(123_456.0, 0.0, vec![]);
        t.current_bw = Some(f64::INFINITY);
        assert_eq!(t.predict(10.0), 0.0);
        assert_eq!(t.predicted_clock, Some(10.0));
    }

    #[test]
    fn prediction_combines_payload_and_latency() {
        let mut t = flow(100_000.0, 1_570_000.0, vec![LinkId::new(0)]);
        t.current_bw = Some(117_300_000.0);
        let time = t.predict(0.0);
        let expected = (100_000.0 / 117_300_000.0) * 1e9 + 1_570_000.0;
        assert!((time - expected).abs() < 1e-6);
    }

    #[test]
    fn completion_board_refcounts_equal_clocks() {
        let mut board = CompletionBoard::default();
        board.insert(100.0);
        board.insert(100.0);
        board.insert(50.0);

        assert_eq!(board.peek(), Some(50.0));
        board.remove(50.0);
        assert_eq!(board.peek(), Some(100.0));
        board.remove_min_if_equals(100.0);
        assert_eq!(board.peek(), Some(100.0));
        board.remove(100.0);
        assert!(board.is_empty());
    }
}
