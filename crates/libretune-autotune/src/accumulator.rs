//! Per-cell statistics
//!
//! Weighted running mean of the fractional fuel error observed in each cell.
//! Statistics only grow during a session; they are dropped by an explicit
//! clear or reset, never aged out.

use crate::table::{CellRef, TableGeometry};
use serde::{Deserialize, Serialize};

/// Running statistics for one table cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CellStats {
    /// Weighted mean of `actual / target - 1`
    pub mean_error: f64,
    /// Accumulated confidence weight
    pub weight: f64,
    /// Number of samples that contributed
    pub hits: u32,
    /// Timestamp of the latest contributing sample
    pub last_update_ms: Option<u64>,
    /// Operator lock; locked cells still accumulate
    pub locked: bool,
}

impl CellStats {
    /// Fold one observation into the running mean
    pub fn observe(&mut self, error: f64, increment: f64, timestamp_ms: u64) {
        let total = self.weight + increment;
        self.mean_error += (error - self.mean_error) * (increment / total);
        self.weight = total;
        self.hits = self.hits.saturating_add(1);
        self.last_update_ms = Some(timestamp_ms);
    }

    fn cleared(self) -> Self {
        Self {
            locked: self.locked,
            ..Self::default()
        }
    }
}

/// Statistics grid for the tuned table, cells created on first use
#[derive(Debug, Clone)]
pub struct CellAccumulator {
    x_size: usize,
    cells: Vec<Option<CellStats>>,
}

impl CellAccumulator {
    /// Empty accumulator sized for `geometry`
    pub fn new(geometry: &TableGeometry) -> Self {
        Self {
            x_size: geometry.x_size(),
            cells: vec![None; geometry.cell_count()],
        }
    }

    fn index(&self, cell: CellRef) -> Option<usize> {
        if cell.x >= self.x_size {
            return None;
        }
        let index = cell.y * self.x_size + cell.x;
        (index < self.cells.len()).then_some(index)
    }

    fn entry(&mut self, cell: CellRef) -> Option<&mut CellStats> {
        let index = self.index(cell)?;
        Some(self.cells[index].get_or_insert_with(CellStats::default))
    }

    /// Add an observation to a cell
    ///
    /// Returns `false` if the cell is outside the table or the increment is not
    /// a positive weight.
    pub fn update(
        &mut self,
        cell: CellRef,
        fractional_error: f64,
        increment: f64,
        timestamp_ms: u64,
    ) -> bool {
        if !(increment > 0.0) || !fractional_error.is_finite() {
            return false;
        }
        match self.entry(cell) {
            Some(stats) => {
                stats.observe(fractional_error, increment, timestamp_ms);
                true
            }
            None => false,
        }
    }

    /// Statistics for `cell`, `None` if it has never been touched
    pub fn get(&self, cell: CellRef) -> Option<&CellStats> {
        self.index(cell).and_then(|i| self.cells[i].as_ref())
    }

    /// Whether `cell` is locked
    pub fn is_locked(&self, cell: CellRef) -> bool {
        self.get(cell).is_some_and(|s| s.locked)
    }

    /// Lock or unlock a cell; statistics keep accumulating either way
    pub fn set_locked(&mut self, cell: CellRef, locked: bool) -> bool {
        match self.entry(cell) {
            Some(stats) => {
                stats.locked = locked;
                true
            }
            None => false,
        }
    }

    /// Drop statistics for one cell, keeping its lock
    pub fn clear(&mut self, cell: CellRef) {
        if let Some(index) = self.index(cell) {
            if let Some(stats) = self.cells[index].as_mut() {
                *stats = stats.cleared();
            }
        }
    }

    /// Drop statistics for every cell, keeping locks
    pub fn reset(&mut self) {
        for stats in self.cells.iter_mut().flatten() {
            *stats = stats.cleared();
        }
    }

    /// Cells that have statistics, in row-major order
    pub fn iter(&self) -> impl Iterator<Item = (CellRef, &CellStats)> + '_ {
        let x_size = self.x_size;
        self.cells.iter().enumerate().filter_map(move |(i, stats)| {
            stats
                .as_ref()
                .map(|s| (CellRef::new(i % x_size, i / x_size), s))
        })
    }

    /// Copy the whole grid into `out`, reusing its allocation
    pub fn copy_into(&self, out: &mut Vec<Option<CellStats>>) {
        out.clear();
        out.extend_from_slice(&self.cells);
    }

    /// Hit weight summed over every cell
    pub fn total_weight(&self) -> f64 {
        self.cells.iter().flatten().map(|s| s.weight).sum()
    }
}
