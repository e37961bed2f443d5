//! Route step table - the ordered steps of the active route
//!
//! The table is replaced wholesale on every successful route fetch. Readers take an
//! `Arc` snapshot under a short read lock, so a concurrent load can never be observed
//! half-applied: a reader sees either the complete old step list or the complete new one.

use crate::domain::types::{PlannedStep, RouteStep};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Immutable view of one loaded route
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    /// Increments on every load; 0 means nothing has been loaded yet
    pub generation: u64,
    pub steps: Vec<RouteStep>,
}

impl RouteSnapshot {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

/// Shared handle to the active route's steps. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct RouteStepTable {
    current: Arc<RwLock<Arc<RouteSnapshot>>>,
}

impl RouteStepTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table. Sequence indices are assigned in input order and
    /// absent maneuvers default to straight. Returns the new generation.
    pub fn load(&self, steps: Vec<PlannedStep>) -> u64 {
        let steps: Vec<RouteStep> = steps
            .into_iter()
            .enumerate()
            .map(|(index, planned)| RouteStep::from_planned(index, planned))
            .collect();
        let step_count = steps.len();

        // Build outside the lock; the write lock only covers the pointer swap
        let mut guard = self.current.write();
        let generation = guard.generation + 1;
        *guard = Arc::new(RouteSnapshot { generation, steps });
        drop(guard);

        info!(generation = %generation, steps = %step_count, "route_table_loaded");
        generation
    }

    /// Read-only snapshot of the current steps
    pub fn current_steps(&self) -> Arc<RouteSnapshot> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }
}
