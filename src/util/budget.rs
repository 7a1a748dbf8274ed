//! Shared memory accounting for posting pools.
//!
//! A [`MemoryBudget`] is a cheaply clonable handle onto one set of atomic
//! counters. Every pool chunk allocation charges the budget and every pool
//! reset or drop releases what it charged, so `used()` always reflects the
//! bytes currently held by live accumulators.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{IrIndexError, Result};

#[derive(Debug)]
struct BudgetCounters {
    used: AtomicU64,
    peak: AtomicU64,
    limit: Option<u64>,
}

/// A memory budget shared between all accumulators of an index writer.
#[derive(Debug, Clone)]
pub struct MemoryBudget(Arc<BudgetCounters>);

impl MemoryBudget {
    /// Create a budget with an optional hard limit in bytes.
    pub fn new(limit: Option<u64>) -> Self {
        MemoryBudget(Arc::new(BudgetCounters {
            used: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            limit,
        }))
    }

    /// Create a budget that never refuses an allocation.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Charge `amount` bytes against the budget.
    ///
    /// Fails with [`IrIndexError::OutOfMemory`] and leaves the counters
    /// untouched when the hard limit would be exceeded.
    pub fn try_allocate(&self, amount: u64) -> Result<()> {
        let counters = &self.0;
        let mut current = counters.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(amount);
            if let Some(limit) = counters.limit {
                if next > limit {
                    return Err(IrIndexError::out_of_memory(format!(
                        "allocation of {amount} bytes exceeds budget ({current} of {limit} used)"
                    )));
                }
            }
            match counters.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    counters.peak.fetch_max(next, Ordering::Relaxed);
                    return Ok(());
                }
                Err(updated) => current = updated,
            }
        }
    }

    /// Return `amount` bytes to the budget.
    pub fn release(&self, amount: u64) {
        let counters = &self.0;
        let mut current = counters.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(amount);
            match counters.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(updated) => current = updated,
            }
        }
    }

    /// Bytes currently charged (may be stale under concurrent use).
    pub fn used(&self) -> u64 {
        self.0.used.load(Ordering::Relaxed)
    }

    /// Highest value `used()` has reached.
    pub fn peak(&self) -> u64 {
        self.0.peak.load(Ordering::Relaxed)
    }

    /// The hard limit, if any.
    pub fn limit(&self) -> Option<u64> {
        self.0.limit
    }

    /// Bytes still available under the hard limit.
    pub fn remaining(&self) -> Option<u64> {
        self.0.limit.map(|limit| limit.saturating_sub(self.used()))
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}
