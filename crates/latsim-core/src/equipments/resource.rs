//! Capacity accounting shared by every reservable host resource.
//!
//! Reserving past the available headroom is a recoverable error the
//! placement layer reacts to. Releasing more than was reserved is not: it
//! means the bookkeeping diverged, and the simulation aborts.

use crate::error::{SimError, SimResult};

/// A single reservable dimension of a host: CPU shares on one core, RAM
/// bytes, or storage bytes.
#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub capacity: f64,
    reserved: f64,
}

impl Resource {
    pub fn new(name: impl Into<String>, capacity: f64) -> Self {
        Self {
            name: name.into(),
            capacity,
            reserved: 0.0,
        }
    }

    pub fn reserved(&self) -> f64 {
        self.reserved
    }

    pub fn available(&self) -> f64 {
        self.capacity - self.reserved
    }

    pub fn can_reserve(&self, amount: f64) -> bool {
        self.available() >= amount
    }

    /// Reserves `amount`, failing when the headroom is insufficient.
    ///
    /// # Panics
    ///
    /// Panics on a negative `amount`; callers never construct negative
    /// reservations on purpose.
    pub fn reserve(&mut self, amount: f64) -> SimResult<()> {
        if !self.can_reserve(amount) {
            return Err(SimError::ResourceUnavailable(format!(
                "cannot reserve {amount} on {}: {} of {} available",
                self.name,
                self.available(),
                self.capacity
            )));
        }
        assert!(
            amount >= 0.0,
            "negative reservation of {amount} on {}",
            self.name
        );
        self.reserved += amount;
        Ok(())
    }

    /// Releases `amount` back to the pool.
    ///
    /// # Panics
    ///
    /// Panics when `amount` exceeds the current reservation; that is a
    /// bookkeeping bug, not a runtime condition.
    pub fn release(&mut self, amount: f64) {
        assert!(
            self.reserved >= amount,
            "releasing {amount} from {} exceeds reserved {}",
            self.name,
            self.reserved
        );
        self.reserved -= amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reserve_then_release_restores_headroom() {
        let mut r = Resource::new("ram", 1024.0);
        r.reserve(512.0).unwrap();
        assert_eq!(r.available(), 512.0);
        r.release(512.0);
        assert_eq!(r.available(), 1024.0);
        assert_eq!(r.reserved(), 0.0);
    }

    #[test]
    fn over_reservation_is_recoverable() {
        let mut r = Resource::new("blkio", 100.0);
        assert!(matches!(
            r.reserve(101.0),
            Err(SimError::ResourceUnavailable(_))
        ));
        // The failed attempt must not leak into the books.
        assert_eq!(r.reserved(), 0.0);
    }

    #[test]
    #[should_panic(expected = "exceeds reserved")]
    fn over_release_aborts() {
        let mut r = Resource::new("ram", 100.0);
        r.reserve(10.0).unwrap();
        r.release(11.0);
    }

    proptest! {
        #[test]
        fn reserve_release_round_trip(amounts in proptest::collection::vec(0.0f64..1000.0, 1..20)) {
            let capacity = 1000.0 * amounts.len() as f64;
            let mut r = Resource::new("cpu", capacity);
            for a in &amounts {
                r.reserve(*a).unwrap();
            }
            for a in &amounts {
                r.release(*a);
            }
            prop_assert!(r.reserved().abs() < 1e-6);
        }
    }
}
