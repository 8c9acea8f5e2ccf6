//! Session configuration.

use cascade_foundation::linear_hash::DEFAULT_MIN_CAPACITY;

/// How a commit cycle runs its independent work units.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Parallelism {
    /// Run every unit on the calling thread, in submission order.
    Sequential,
    /// Run independent units on the rayon global pool.
    #[default]
    Rayon,
}

/// Configuration for a working-memory session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Log a warning when an insert or update is skipped.
    pub warn_unknown_types: bool,

    /// Initial capacity of the action buffer.
    pub action_buffer_capacity: usize,

    /// Minimum capacity of every table the session creates.
    pub table_min_capacity: usize,

    /// Scheduler used by commit cycles.
    pub parallelism: Parallelism,

    /// Maximum commit cycles a single `fire` call may run.
    pub max_fire_cycles: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            warn_unknown_types: true,
            action_buffer_capacity: 1024,
            table_min_capacity: DEFAULT_MIN_CAPACITY,
            parallelism: Parallelism::Rayon,
            max_fire_cycles: 10_000,
        }
    }
}

impl SessionConfig {
    /// Creates a configuration that runs every commit on the calling thread.
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            parallelism: Parallelism::Sequential,
            ..Self::default()
        }
    }

    /// Builder method to enable/disable skip warnings.
    #[must_use]
    pub fn with_warn_unknown_types(mut self, warn: bool) -> Self {
        self.warn_unknown_types = warn;
        self
    }

    /// Builder method to set the action buffer capacity.
    #[must_use]
    pub fn with_action_buffer_capacity(mut self, capacity: usize) -> Self {
        self.action_buffer_capacity = capacity;
        self
    }

    /// Builder method to set the minimum table capacity.
    #[must_use]
    pub fn with_table_min_capacity(mut self, capacity: usize) -> Self {
        self.table_min_capacity = capacity;
        self
    }

    /// Builder method to set the scheduler.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Builder method to set the fire cycle limit.
    #[must_use]
    pub fn with_max_fire_cycles(mut self, cycles: usize) -> Self {
        self.max_fire_cycles = cycles;
        self
    }
}
