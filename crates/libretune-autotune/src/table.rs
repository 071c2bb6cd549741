//! Table geometry and cell attribution
//!
//! Maps an engine operating point onto the cells of the table being tuned.
//! X is the RPM axis (columns), Y the load axis (rows); values are stored
//! row-major as `z[y][x]`.

use crate::error::{AutoTuneError, Result};
use crate::telemetry::EngineState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A cell coordinate in the tuned table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellRef {
    /// RPM column
    pub x: usize,
    /// Load row
    pub y: usize,
}

impl CellRef {
    /// Cell at column `x`, row `y`
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Axis breakpoints of the tuned table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableGeometry {
    x_bins: Vec<f64>,
    y_bins: Vec<f64>,
}

impl TableGeometry {
    /// Create a geometry from RPM (X) and load (Y) breakpoints
    ///
    /// Both axes must be non-empty, finite and strictly increasing.
    pub fn new(x_bins: Vec<f64>, y_bins: Vec<f64>) -> Result<Self> {
        let geometry = Self { x_bins, y_bins };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Re-check axis invariants (used for deserialized geometries)
    pub fn validate(&self) -> Result<()> {
        validate_axis("X (RPM)", &self.x_bins)?;
        validate_axis("Y (load)", &self.y_bins)
    }

    /// RPM breakpoints
    pub fn x_bins(&self) -> &[f64] {
        &self.x_bins
    }

    /// Load breakpoints
    pub fn y_bins(&self) -> &[f64] {
        &self.y_bins
    }

    /// Number of columns
    pub fn x_size(&self) -> usize {
        self.x_bins.len()
    }

    /// Number of rows
    pub fn y_size(&self) -> usize {
        self.y_bins.len()
    }

    /// Total number of cells
    pub fn cell_count(&self) -> usize {
        self.x_size() * self.y_size()
    }

    /// Whether the cell lies inside the table
    pub fn contains(&self, cell: CellRef) -> bool {
        cell.x < self.x_size() && cell.y < self.y_size()
    }

    /// Flat row-major index of a cell
    pub fn index_of(&self, cell: CellRef) -> Option<usize> {
        self.contains(cell).then(|| cell.y * self.x_size() + cell.x)
    }

    /// Cell at a flat row-major index
    pub fn cell_at(&self, index: usize) -> CellRef {
        CellRef::new(index % self.x_size(), index / self.x_size())
    }

    /// All cells in row-major order
    pub fn cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        (0..self.cell_count()).map(|i| self.cell_at(i))
    }
}

fn validate_axis(name: &str, bins: &[f64]) -> Result<()> {
    if bins.is_empty() {
        return Err(AutoTuneError::GeometryInvalid(format!("{name} axis is empty")));
    }
    if let Some(bad) = bins.iter().find(|b| !b.is_finite()) {
        return Err(AutoTuneError::GeometryInvalid(format!(
            "{name} axis contains non-finite breakpoint {bad}"
        )));
    }
    if let Some(pair) = bins.windows(2).find(|pair| pair[1] <= pair[0]) {
        return Err(AutoTuneError::GeometryInvalid(format!(
            "{name} axis is not strictly increasing at {} -> {}",
            pair[0], pair[1]
        )));
    }
    Ok(())
}

/// Live values of the tuned table, `z[y][x]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableValues {
    z_values: Vec<Vec<f64>>,
}

impl TableValues {
    /// Wrap a value grid, checking it matches the geometry
    pub fn new(geometry: &TableGeometry, z_values: Vec<Vec<f64>>) -> Result<Self> {
        let values = Self { z_values };
        values.check_shape(geometry)?;
        Ok(values)
    }

    /// Build a grid by evaluating `f` for every cell
    pub fn from_fn(geometry: &TableGeometry, mut f: impl FnMut(CellRef) -> f64) -> Self {
        let z_values = (0..geometry.y_size())
            .map(|y| (0..geometry.x_size()).map(|x| f(CellRef::new(x, y))).collect())
            .collect();
        Self { z_values }
    }

    /// Same value in every cell
    pub fn filled(geometry: &TableGeometry, value: f64) -> Self {
        Self::from_fn(geometry, |_| value)
    }

    /// Fail unless the grid is rectangular and matches the geometry
    pub fn check_shape(&self, geometry: &TableGeometry) -> Result<()> {
        let actual_y = self.z_values.len();
        let actual_x = self.z_values.first().map_or(0, Vec::len);
        let ragged = self.z_values.iter().any(|row| row.len() != actual_x);

        if ragged || actual_x != geometry.x_size() || actual_y != geometry.y_size() {
            return Err(AutoTuneError::ShapeMismatch {
                expected_x: geometry.x_size(),
                expected_y: geometry.y_size(),
                actual_x,
                actual_y,
            });
        }
        Ok(())
    }

    /// Fail on the first NaN or infinite value
    pub fn check_finite(&self) -> Result<()> {
        for (y, row) in self.z_values.iter().enumerate() {
            if let Some(x) = row.iter().position(|v| !v.is_finite()) {
                return Err(AutoTuneError::NonFiniteValue(CellRef::new(x, y)));
            }
        }
        Ok(())
    }

    /// Value at a cell, `None` outside the grid
    pub fn get(&self, cell: CellRef) -> Option<f64> {
        self.z_values.get(cell.y).and_then(|row| row.get(cell.x)).copied()
    }

    /// Overwrite one cell
    pub fn set(&mut self, cell: CellRef, value: f64) -> Result<()> {
        let slot = self
            .z_values
            .get_mut(cell.y)
            .and_then(|row| row.get_mut(cell.x))
            .ok_or(AutoTuneError::CellOutOfRange(cell))?;
        *slot = value;
        Ok(())
    }

    /// Rows of the grid, one per load breakpoint
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.z_values
    }

    /// Unwrap into `z[y][x]` rows
    pub fn into_rows(self) -> Vec<Vec<f64>> {
        self.z_values
    }
}

/// How a sample's weight is distributed over table cells
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionPolicy {
    /// Full weight to the cell nearest the operating point
    #[default]
    Nearest,
    /// Weight split over the four surrounding cells
    Bilinear,
}

/// Cells a sample is attributed to, with their share of the sample weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attribution {
    entries: [(CellRef, f64); 4],
    len: usize,
}

impl Attribution {
    fn single(cell: CellRef) -> Self {
        let mut entries = [(cell, 0.0); 4];
        entries[0].1 = 1.0;
        Self { entries, len: 1 }
    }

    fn push(&mut self, cell: CellRef, weight: f64) {
        if weight > 0.0 && self.len < self.entries.len() {
            self.entries[self.len] = (cell, weight);
            self.len += 1;
        }
    }

    /// `(cell, weight)` pairs; weights sum to 1
    pub fn cells(&self) -> &[(CellRef, f64)] {
        &self.entries[..self.len]
    }

    /// Cell carrying the largest share (the first one on ties)
    pub fn primary(&self) -> CellRef {
        self.cells()
            .iter()
            .fold(self.entries[0], |best, e| if e.1 > best.1 { *e } else { best })
            .0
    }

    /// Whether the whole sample went to one cell
    pub fn is_single(&self) -> bool {
        self.len == 1
    }
}

/// Attribute an operating point to table cells
///
/// Returns `None` when the operating point is not a finite number.
pub fn attribute(
    state: &EngineState,
    geometry: &TableGeometry,
    policy: AttributionPolicy,
) -> Option<Attribution> {
    if !state.rpm.is_finite() || !state.load.is_finite() {
        return None;
    }

    match policy {
        AttributionPolicy::Nearest => {
            let x = nearest_index(state.rpm, geometry.x_bins())?;
            let y = nearest_index(state.load, geometry.y_bins())?;
            Some(Attribution::single(CellRef::new(x, y)))
        }
        AttributionPolicy::Bilinear => {
            let (x0, x1, tx) = find_surrounding_indices(state.rpm, geometry.x_bins())?;
            let (y0, y1, ty) = find_surrounding_indices(state.load, geometry.y_bins())?;

            let mut attribution = Attribution {
                entries: [(CellRef::new(x0, y0), 0.0); 4],
                len: 0,
            };
            attribution.push(CellRef::new(x0, y0), (1.0 - tx) * (1.0 - ty));
            attribution.push(CellRef::new(x1, y0), tx * (1.0 - ty));
            attribution.push(CellRef::new(x0, y1), (1.0 - tx) * ty);
            attribution.push(CellRef::new(x1, y1), tx * ty);
            Some(attribution)
        }
    }
}

/// Index of the breakpoint closest to `value`, ties toward the lower index
pub fn nearest_index(value: f64, bins: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;

    for (i, bin) in bins.iter().enumerate() {
        let distance = (bin - value).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((i, distance)),
        }
    }

    best.map(|(i, _)| i)
}

/// Find surrounding bin indices and interpolation ratio (clamped to edges)
fn find_surrounding_indices(value: f64, bins: &[f64]) -> Option<(usize, usize, f64)> {
    let last_idx = bins.len().checked_sub(1)?;

    // Clamp below first bin
    if value <= bins[0] {
        return Some((0, 0, 0.0));
    }

    // Clamp above last bin
    if value >= bins[last_idx] {
        return Some((last_idx, last_idx, 0.0));
    }

    bins.windows(2)
        .enumerate()
        .find(|(_, pair)| value >= pair[0] && value <= pair[1])
        .map(|(i, pair)| (i, i + 1, (value - pair[0]) / (pair[1] - pair[0])))
}
