//! Recommendation Store
//!
//! Holds the current recommendation for every cell together with the session
//! baseline. Readers get lock-free, always-consistent snapshots: a new grid is
//! built off to the side and published in one swap. Writers (the update tick,
//! apply, reset) serialize on a single mutex scoped to the store.

use crate::accumulator::CellStats;
use crate::authority::{limit, CellLimitInput, ClampKind, LimitOutcome, SuppressReason};
use crate::config::{AutoTuneConfig, ConfidenceThresholds};
use crate::correction::{desired_value, fraction_from_current, propose};
use crate::error::{AutoTuneError, Result};
use crate::table::{CellRef, TableGeometry, TableValues};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use uuid::Uuid;

/// Heat map confidence classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBucket {
    /// Below the low threshold
    None,
    /// Past the low threshold
    Low,
    /// Past the medium threshold
    Medium,
    /// Past the high threshold
    High,
}

impl ConfidenceBucket {
    /// Bucket for an accumulated hit weight
    pub fn classify(weight: f64, thresholds: &ConfidenceThresholds) -> Self {
        if weight >= thresholds.high {
            ConfidenceBucket::High
        } else if weight >= thresholds.medium {
            ConfidenceBucket::Medium
        } else if weight >= thresholds.low {
            ConfidenceBucket::Low
        } else {
            ConfidenceBucket::None
        }
    }
}

/// Whether a cell's recommendation can be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    /// Can be applied
    Ready,
    /// Held back by a lock or missing data
    Suppressed(SuppressReason),
}

/// A single cell recommendation in the tuned table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// RPM axis index
    pub cell_x: usize,
    /// Load axis index
    pub cell_y: usize,
    /// Table value when the session (or the last reset) began
    pub beginning_value: f64,
    /// Authority-limited value
    pub recommended_value: f64,
    /// Samples attributed to the cell
    pub hit_count: u32,
    /// Accumulated confidence weight
    pub hit_weighting: f64,
    /// Weighted mean fractional error
    pub mean_error: f64,
    /// Operator lock
    pub locked: bool,
    /// Whether the value can be applied
    pub status: RecommendationStatus,
    /// Heat map confidence
    pub confidence: ConfidenceBucket,
    /// Limit that bound the last update
    pub clamp: ClampKind,
}

impl Recommendation {
    fn fresh(cell: CellRef, value: f64, locked: bool) -> Self {
        let status = if locked {
            RecommendationStatus::Suppressed(SuppressReason::Locked)
        } else {
            RecommendationStatus::Suppressed(SuppressReason::InsufficientData)
        };
        Self {
            cell_x: cell.x,
            cell_y: cell.y,
            beginning_value: value,
            recommended_value: value,
            hit_count: 0,
            hit_weighting: 0.0,
            mean_error: 0.0,
            locked,
            status,
            confidence: ConfidenceBucket::None,
            clamp: ClampKind::None,
        }
    }

    /// Position of this cell
    pub fn cell(&self) -> CellRef {
        CellRef::new(self.cell_x, self.cell_y)
    }

    /// Cumulative change from the baseline
    pub fn delta(&self) -> f64 {
        self.recommended_value - self.beginning_value
    }

    /// Cumulative change from the baseline, in percent
    pub fn delta_percent(&self) -> f64 {
        if self.beginning_value.abs() < f64::EPSILON {
            0.0
        } else {
            self.delta() / self.beginning_value * 100.0
        }
    }

    /// Ready and not locked
    pub fn is_ready(&self) -> bool {
        self.status == RecommendationStatus::Ready && !self.locked
    }
}

/// Heat map entry for the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatMapEntry {
    /// RPM axis index
    pub cell_x: usize,
    /// Load axis index
    pub cell_y: usize,
    /// Accumulated confidence weight
    pub hit_weighting: f64,
    /// Absolute change from the beginning value
    pub change_magnitude: f64,
    /// Signed change from the beginning value, in percent
    pub change_percent: f64,
    /// Table value when the session (or the last reset) began
    pub beginning_value: f64,
    /// Authority-limited value
    pub recommended_value: f64,
    /// Samples attributed to the cell
    pub hit_count: u32,
    /// Heat map confidence
    pub confidence: ConfidenceBucket,
    /// Operator lock
    pub locked: bool,
    /// Whether the value can be applied
    pub status: RecommendationStatus,
}

/// Immutable snapshot of every cell's recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationGrid {
    /// Number of RPM bins
    pub x_size: usize,
    /// Number of load bins
    pub y_size: usize,
    /// Number of update ticks folded into this grid
    pub tick: u64,
    cells: Vec<Recommendation>,
}

impl RecommendationGrid {
    fn from_baseline(geometry: &TableGeometry, baseline: &[f64]) -> Self {
        let cells = geometry
            .cells()
            .zip(baseline)
            .map(|(cell, value)| Recommendation::fresh(cell, *value, false))
            .collect();
        Self {
            x_size: geometry.x_size(),
            y_size: geometry.y_size(),
            tick: 0,
            cells,
        }
    }

    fn index(&self, cell: CellRef) -> Option<usize> {
        (cell.x < self.x_size && cell.y < self.y_size).then(|| cell.y * self.x_size + cell.x)
    }

    /// Recommendation for `cell`, `None` outside the table
    pub fn get(&self, cell: CellRef) -> Option<&Recommendation> {
        self.index(cell).map(|i| &self.cells[i])
    }

    /// Every cell in row-major order
    pub fn cells(&self) -> &[Recommendation] {
        &self.cells
    }

    /// Cells whose recommendation can be applied
    pub fn eligible(&self) -> impl Iterator<Item = &Recommendation> + '_ {
        self.cells.iter().filter(|r| r.is_ready())
    }

    /// Cells that have seen any data
    pub fn with_hits(&self) -> impl Iterator<Item = &Recommendation> + '_ {
        self.cells.iter().filter(|r| r.hit_count > 0)
    }

    /// Heat map entries for every cell
    pub fn heatmap(&self) -> Vec<HeatMapEntry> {
        self.cells
            .iter()
            .map(|r| HeatMapEntry {
                cell_x: r.cell_x,
                cell_y: r.cell_y,
                hit_weighting: r.hit_weighting,
                change_magnitude: r.delta().abs(),
                change_percent: r.delta_percent(),
                beginning_value: r.beginning_value,
                recommended_value: r.recommended_value,
                hit_count: r.hit_count,
                confidence: r.confidence,
                locked: r.locked,
                status: r.status,
            })
            .collect()
    }
}

/// Which cells an apply or reset targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellSelection {
    /// Every cell with an applicable recommendation
    AllEligible,
    /// Operator-chosen subset
    Cells(Vec<CellRef>),
}

/// A value written into the live table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellWrite {
    /// Cell written
    pub cell: CellRef,
    /// Value written
    pub value: f64,
    /// Live value it replaced
    pub previous: f64,
}

/// Why a requested cell was not written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Cell has no applicable recommendation
    Suppressed(SuppressReason),
    /// Live table already holds the recommended value
    Unchanged,
}

/// Outcome of an apply request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Cells written, in row-major order
    pub writes: Vec<CellWrite>,
    /// Only filled for explicitly selected cells
    pub skipped: Vec<(CellRef, SkipReason)>,
    /// Total applies performed this session, including this one
    pub apply_count: u64,
}

impl ApplyReport {
    /// Nothing was written
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Mutable store state, only reachable through [`StoreWriter`]
#[derive(Debug)]
struct StoreState {
    geometry: TableGeometry,
    /// Baseline per cell, row-major
    baseline: Vec<f64>,
    /// Live value the current statistics were measured against
    reference: Vec<f64>,
    apply_count: u64,
}

/// Current recommendations for one AutoTune session
#[derive(Debug)]
pub struct RecommendationStore {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    published: ArcSwap<RecommendationGrid>,
    state: Mutex<StoreState>,
    retry_hint_ms: AtomicU64,
}

impl RecommendationStore {
    /// Create a store, taking the baseline from the live table
    pub fn new(geometry: TableGeometry, live: &TableValues) -> Result<Self> {
        live.check_shape(&geometry)?;
        live.check_finite()?;
        let baseline: Vec<f64> = live.rows().iter().flatten().copied().collect();
        let grid = RecommendationGrid::from_baseline(&geometry, &baseline);

        Ok(Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            published: ArcSwap::from_pointee(grid),
            state: Mutex::new(StoreState {
                geometry,
                reference: baseline.clone(),
                baseline,
                apply_count: 0,
            }),
            retry_hint_ms: AtomicU64::new(0),
        })
    }

    /// Identifier of the owning session
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// When the session started or was last fully reset
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Consistent view of every cell
    pub fn snapshot(&self) -> Arc<RecommendationGrid> {
        self.published.load_full()
    }

    /// Heat map entries from the current snapshot
    pub fn heatmap(&self) -> Vec<HeatMapEntry> {
        self.published.load().heatmap()
    }

    /// Applies performed this session
    pub fn apply_count(&self) -> u64 {
        self.lock().state.apply_count
    }

    /// Exclusive write access, waiting for any in-progress writer
    pub fn lock(&self) -> StoreWriter<'_> {
        StoreWriter {
            store: self,
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Exclusive write access without waiting
    pub fn try_lock(&self) -> Result<StoreWriter<'_>> {
        let state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(AutoTuneError::ApplyConflict {
                    retry_after_ms: self.retry_hint_ms.load(Ordering::Relaxed),
                })
            }
        };
        Ok(StoreWriter { store: self, state })
    }

    pub(crate) fn set_retry_hint(&self, ms: u64) {
        self.retry_hint_ms.store(ms, Ordering::Relaxed);
    }
}

/// Write access to the store, held for the duration of one tick, apply or reset
pub struct StoreWriter<'a> {
    store: &'a RecommendationStore,
    state: MutexGuard<'a, StoreState>,
}

impl StoreWriter<'_> {
    /// Axes of the tuned table
    pub fn geometry(&self) -> &TableGeometry {
        &self.state.geometry
    }

    /// Value recommendations are measured from
    pub fn baseline(&self, cell: CellRef) -> Option<f64> {
        self.state
            .geometry
            .index_of(cell)
            .map(|i| self.state.baseline[i])
    }

    /// Compute the next grid from accumulated statistics without publishing it
    ///
    /// `stats` is the accumulator grid in row-major order.
    pub fn compute(&self, stats: &[Option<CellStats>], config: &AutoTuneConfig) -> RecommendationGrid {
        let previous = self.store.published.load();
        let min_hits = config.settings.min_hits;
        let thresholds = &config.settings.confidence;

        let cells = previous
            .cells
            .iter()
            .enumerate()
            .map(|(i, prev)| {
                let stats = stats.get(i).copied().flatten().unwrap_or_default();
                let baseline = self.state.baseline[i];
                let desired = desired_value(self.state.reference[i], propose(&stats));

                let input = CellLimitInput {
                    current: prev.recommended_value,
                    baseline,
                    proposed_fraction: fraction_from_current(prev.recommended_value, desired),
                    weight: stats.weight,
                    locked: stats.locked,
                };

                let (recommended_value, status, clamp) =
                    match limit(&input, min_hits, &config.authority) {
                        LimitOutcome::Limited { value, clamp } => {
                            (value, RecommendationStatus::Ready, clamp)
                        }
                        LimitOutcome::Suppressed(reason) => (
                            prev.recommended_value,
                            RecommendationStatus::Suppressed(reason),
                            ClampKind::None,
                        ),
                    };

                Recommendation {
                    cell_x: prev.cell_x,
                    cell_y: prev.cell_y,
                    beginning_value: baseline,
                    recommended_value,
                    hit_count: stats.hits,
                    hit_weighting: stats.weight,
                    mean_error: stats.mean_error,
                    locked: stats.locked,
                    status,
                    confidence: ConfidenceBucket::classify(stats.weight, thresholds),
                    clamp,
                }
            })
            .collect();

        RecommendationGrid {
            x_size: previous.x_size,
            y_size: previous.y_size,
            tick: previous.tick + 1,
            cells,
        }
    }

    /// Replace the published grid
    pub fn publish(&mut self, grid: RecommendationGrid) {
        self.store.published.store(Arc::new(grid));
    }

    /// Update the lock flag shown for cells without waiting for the next tick
    pub fn set_locked(&mut self, cells: &[CellRef], locked: bool) {
        let mut grid = RecommendationGrid::clone(&self.store.published.load());
        for cell in cells {
            if let Some(i) = grid.index(*cell) {
                let rec = &mut grid.cells[i];
                rec.locked = locked;
                if locked {
                    rec.status = RecommendationStatus::Suppressed(SuppressReason::Locked);
                } else if rec.status == RecommendationStatus::Suppressed(SuppressReason::Locked) {
                    // Re-evaluated on the next tick
                    rec.status = RecommendationStatus::Suppressed(SuppressReason::InsufficientData);
                }
            }
        }
        self.publish(grid);
    }

    /// Write already-limited recommendations into the live table
    ///
    /// Locked and suppressed cells are never written. When `rebase` is set the
    /// written value becomes the reference for statistics gathered from now on.
    pub fn apply(
        &mut self,
        selection: &CellSelection,
        live: &mut TableValues,
        rebase: bool,
    ) -> Result<ApplyReport> {
        live.check_shape(&self.state.geometry)?;
        let grid = self.store.published.load_full();

        let requested: Vec<CellRef> = match selection {
            CellSelection::AllEligible => grid.eligible().map(Recommendation::cell).collect(),
            CellSelection::Cells(cells) => {
                if let Some(bad) = cells.iter().find(|c| !self.state.geometry.contains(**c)) {
                    return Err(AutoTuneError::CellOutOfRange(*bad));
                }
                cells.clone()
            }
        };

        let mut updated = RecommendationGrid::clone(&grid);
        let mut report = ApplyReport::default();
        for cell in requested {
            let Some(rec) = grid.get(cell) else {
                continue;
            };

            if rec.locked {
                report
                    .skipped
                    .push((cell, SkipReason::Suppressed(SuppressReason::Locked)));
                continue;
            }
            if let RecommendationStatus::Suppressed(reason) = rec.status {
                report.skipped.push((cell, SkipReason::Suppressed(reason)));
                continue;
            }

            let previous = live.get(cell).ok_or(AutoTuneError::CellOutOfRange(cell))?;
            if previous == rec.recommended_value {
                report.skipped.push((cell, SkipReason::Unchanged));
                continue;
            }

            live.set(cell, rec.recommended_value)?;
            if rebase {
                if let Some(i) = self.state.geometry.index_of(cell) {
                    self.state.reference[i] = rec.recommended_value;
                    // Statistics restart against the applied value
                    let restarted = &mut updated.cells[i];
                    restarted.hit_count = 0;
                    restarted.hit_weighting = 0.0;
                    restarted.mean_error = 0.0;
                    restarted.confidence = ConfidenceBucket::None;
                    restarted.clamp = ClampKind::None;
                    restarted.status =
                        RecommendationStatus::Suppressed(SuppressReason::InsufficientData);
                }
            }
            report.writes.push(CellWrite {
                cell,
                value: rec.recommended_value,
                previous,
            });
        }

        if matches!(selection, CellSelection::AllEligible) {
            report.skipped.clear();
        }

        if !report.writes.is_empty() {
            self.state.apply_count += 1;
            if rebase {
                self.publish(updated);
            }
        }
        report.apply_count = self.state.apply_count;
        Ok(report)
    }

    /// Forget recommendations and re-read the baseline from the live table
    ///
    /// `None` resets every cell. Lock flags are kept.
    pub fn reset(&mut self, cells: Option<&[CellRef]>, live: &TableValues) -> Result<()> {
        live.check_shape(&self.state.geometry)?;
        if let Some(bad) = cells.and_then(|c| c.iter().find(|c| !self.state.geometry.contains(**c)))
        {
            return Err(AutoTuneError::CellOutOfRange(*bad));
        }

        let targets: Vec<CellRef> = match cells {
            Some(cells) => cells.to_vec(),
            None => self.state.geometry.cells().collect(),
        };

        // Validate every new baseline before touching any of them
        let mut rebased = Vec::with_capacity(targets.len());
        for cell in targets {
            let Some(i) = self.state.geometry.index_of(cell) else {
                continue;
            };
            let value = live.get(cell).ok_or(AutoTuneError::CellOutOfRange(cell))?;
            if !value.is_finite() {
                return Err(AutoTuneError::NonFiniteValue(cell));
            }
            rebased.push((cell, i, value));
        }

        let mut grid = RecommendationGrid::clone(&self.store.published.load());
        for (cell, i, value) in rebased {
            self.state.baseline[i] = value;
            self.state.reference[i] = value;
            let locked = grid.cells[i].locked;
            grid.cells[i] = Recommendation::fresh(cell, value, locked);
        }

        self.publish(grid);
        Ok(())
    }
}
