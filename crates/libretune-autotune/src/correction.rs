//! Correction calculation
//!
//! Turns AFR error into a proposed fuel correction. A positive error means the
//! mixture is leaner than target, so the proposal adds fuel in proportion.

use crate::accumulator::CellStats;
use crate::error::{AutoTuneError, Result};
use crate::table::{nearest_index, CellRef, TableGeometry, TableValues};
use crate::telemetry::{EngineState, TelemetrySample};
use serde::{Deserialize, Serialize};

/// AFR (or lambda) readings below this are treated as a dead sensor
const MIN_VALID_AFR: f64 = 0.1;

/// Externally supplied target AFR table, looked up at the nearest cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetAfrTable {
    /// Axes of the target table
    pub geometry: TableGeometry,
    /// Target AFR per cell
    pub values: TableValues,
}

impl TargetAfrTable {
    /// Fails when `values` does not match `geometry`
    pub fn new(geometry: TableGeometry, values: TableValues) -> Result<Self> {
        values.check_shape(&geometry)?;
        Ok(Self { geometry, values })
    }

    /// Target at an operating point
    pub fn lookup(&self, rpm: f64, load: f64) -> Option<f64> {
        let x = nearest_index(rpm, self.geometry.x_bins())?;
        let y = nearest_index(load, self.geometry.y_bins())?;
        self.values.get(CellRef::new(x, y))
    }
}

/// Where the target AFR for a sample comes from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetAfrPolicy {
    /// The target channel carried by the sample
    #[default]
    FromSample,
    /// One target for every operating point
    Fixed(f64),
    /// Per-operating-point target table
    Table(TargetAfrTable),
}

impl TargetAfrPolicy {
    /// Target AFR for a sample attributed to `state`
    ///
    /// Table lookups use the delay-compensated operating point.
    pub fn target_for(&self, sample: &TelemetrySample, state: &EngineState) -> Option<f64> {
        let target = match self {
            TargetAfrPolicy::FromSample => sample.target_afr?,
            TargetAfrPolicy::Fixed(afr) => *afr,
            TargetAfrPolicy::Table(table) => table.lookup(state.rpm, state.load)?,
        };
        (target.is_finite() && target >= MIN_VALID_AFR).then_some(target)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            TargetAfrPolicy::FromSample => Ok(()),
            TargetAfrPolicy::Fixed(afr) => {
                if afr.is_finite() && *afr >= MIN_VALID_AFR {
                    Ok(())
                } else {
                    Err(AutoTuneError::config(
                        "settings.target_afr",
                        format!("fixed target {afr} is not a usable AFR"),
                    ))
                }
            }
            TargetAfrPolicy::Table(table) => {
                table.geometry.validate()?;
                table.values.check_shape(&table.geometry)?;
                if table
                    .values
                    .rows()
                    .iter()
                    .flatten()
                    .any(|v| !v.is_finite() || *v < MIN_VALID_AFR)
                {
                    return Err(AutoTuneError::config(
                        "settings.target_afr",
                        "target table contains unusable AFR values",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Fractional fuel error: `actual / target - 1`
///
/// Returns `None` for a dead sensor reading or an unusable target.
pub fn fractional_error(actual_afr: f64, target_afr: f64) -> Option<f64> {
    if !actual_afr.is_finite() || actual_afr < MIN_VALID_AFR {
        return None;
    }
    if !target_afr.is_finite() || target_afr < MIN_VALID_AFR {
        return None;
    }
    Some(actual_afr / target_afr - 1.0)
}

/// Proposed correction fraction for a cell: lean error adds fuel
pub fn propose(stats: &CellStats) -> f64 {
    stats.mean_error
}

/// Value the statistics ask for, given the value they were measured against
pub fn desired_value(reference: f64, proposed_fraction: f64) -> f64 {
    reference * (1.0 + proposed_fraction)
}

/// Express a desired value as a fraction of the current recommendation
///
/// A zero current value has no meaningful ratio, so no step is proposed.
pub fn fraction_from_current(current: f64, desired: f64) -> f64 {
    if current.abs() < f64::EPSILON {
        0.0
    } else {
        desired / current - 1.0
    }
}
