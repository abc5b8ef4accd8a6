//! Fatal conditions of the engine, and a budget for the non-fatal ones.

use crate::Scalar;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "neighbour list for cell {cell} holds {count} candidates, more than the capacity of {capacity}; increase max_neighbours"
    )]
    NeighbourOverflow {
        cell: usize,
        count: usize,
        capacity: usize,
    },

    #[error("sink particle capacity of {capacity} exhausted; increase max_sinks")]
    SinkCapacity { capacity: usize },

    #[error(
        "corrector did not converge after {iterations} iterations on step {step} (t = {time}): errmax = {errmax:e} with tolv = {tolv:e}"
    )]
    NonConvergence {
        iterations: usize,
        step: usize,
        time: Scalar,
        errmax: Scalar,
        tolv: Scalar,
    },

    #[error("corrupted link list: {0}")]
    CorruptLinkList(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Countdown shared between threads so a repeated warning is only logged a bounded number of
/// times.
#[derive(Debug)]
pub struct WarningBudget {
    remaining: AtomicUsize,
}

impl WarningBudget {
    pub const fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
        }
    }

    /// Returns `true` if the caller may still log.
    pub fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |r| r.checked_sub(1))
            .is_ok()
    }
}

impl Default for WarningBudget {
    fn default() -> Self {
        Self::new(10)
    }
}
