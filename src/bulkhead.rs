//! Concurrency bulkhead for hot-path entries.
//!
//! Grounded on the same "reject over capacity" shape as the HTTP rate
//! limiter this codebase otherwise carries, but applied to concurrent
//! in-flight work rather than a sliding per-IP window: §4.8 and §5 require
//! a capacity cap on concurrent short-sell validations with a fail-fast
//! `BUSY` reply rather than unbounded queueing.

use std::sync::Arc;

use tokio::sync::{Semaphore, TryAcquireError};

use crate::error::HotPathError;

/// Caps the number of in-flight operations through a single entry point.
#[derive(Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// RAII guard; dropping it releases the bulkhead slot.
pub struct BulkheadPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Bulkhead {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Acquire a slot, failing fast rather than queueing when exhausted.
    pub fn try_enter(&self) -> Result<BulkheadPermit, HotPathError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(BulkheadPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(HotPathError::Busy),
            Err(TryAcquireError::Closed) => Err(HotPathError::Internal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_when_exhausted() {
        let bh = Bulkhead::new(2);
        let p1 = bh.try_enter().unwrap();
        let p2 = bh.try_enter().unwrap();
        assert_eq!(bh.in_flight(), 2);
        assert_eq!(bh.try_enter().unwrap_err(), HotPathError::Busy);
        drop(p1);
        assert!(bh.try_enter().is_ok());
        drop(p2);
    }
}
