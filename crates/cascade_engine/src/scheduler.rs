//! Execution of independent commit work units.
//!
//! A commit cycle decomposes each phase into units that touch disjoint
//! state (one type memory, or one rule network) and hands them to a
//! [`TaskScheduler`]. `run_all` returns only after every unit finished, so
//! phases stay strictly ordered whatever the scheduler does inside a batch.

use rayon::prelude::*;

use cascade_foundation::Result;

use crate::config::Parallelism;

/// One independent unit of commit work.
pub type WorkUnit<'a> = Box<dyn FnOnce() -> Result<()> + Send + 'a>;

/// Runs batches of independent work units to completion.
pub trait TaskScheduler: Send + Sync {
    /// Runs every unit and waits for all of them.
    ///
    /// # Errors
    ///
    /// Returns the error of a failed unit. Other units of the batch may
    /// or may not have run.
    fn run_all<'a>(&self, units: Vec<WorkUnit<'a>>) -> Result<()>;
}

/// Runs units one after another on the calling thread.
#[derive(Copy, Clone, Debug, Default)]
pub struct SequentialScheduler;

impl TaskScheduler for SequentialScheduler {
    fn run_all<'a>(&self, units: Vec<WorkUnit<'a>>) -> Result<()> {
        units.into_iter().try_for_each(|unit| unit())
    }
}

/// Runs units on the rayon global pool.
#[derive(Copy, Clone, Debug, Default)]
pub struct RayonScheduler;

impl TaskScheduler for RayonScheduler {
    fn run_all<'a>(&self, units: Vec<WorkUnit<'a>>) -> Result<()> {
        match units.len() {
            0 => Ok(()),
            1 => units.into_iter().try_for_each(|unit| unit()),
            _ => units.into_par_iter().try_for_each(|unit| unit()),
        }
    }
}

/// Creates the scheduler for a parallelism setting.
#[must_use]
pub fn scheduler_for(parallelism: Parallelism) -> Box<dyn TaskScheduler> {
    match parallelism {
        Parallelism::Sequential => Box::new(SequentialScheduler),
        Parallelism::Rayon => Box::new(RayonScheduler),
    }
}
