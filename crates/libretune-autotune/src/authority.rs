//! Authority limiting
//!
//! Bounds how far AutoTune may move a cell: per update tick relative to the
//! current recommendation, and in total relative to the session baseline.
//! Both clamps always apply, so the tighter one decides.

use crate::config::AuthorityConfig;
use serde::{Deserialize, Serialize};

/// Why a cell produced no applicable recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// The operator locked the cell
    Locked,
    /// Not enough hit weight yet
    InsufficientData,
    /// Current or baseline value is not a finite number
    InvalidValue,
}

/// Which limit bound the value, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampKind {
    /// Proposal passed unchanged
    None,
    /// Per-update increase or decrease limit
    PerTick,
    /// Limit relative to the baseline
    Absolute,
}

/// Result of limiting one cell's proposal
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitOutcome {
    /// New recommended value and the limit that bound it
    Limited {
        /// Value after limiting
        value: f64,
        /// Limit that bound it
        clamp: ClampKind,
    },
    /// No recommendation for this cell
    Suppressed(SuppressReason),
}

/// Inputs describing the cell being limited
#[derive(Debug, Clone, Copy)]
pub struct CellLimitInput {
    /// Current recommended value
    pub current: f64,
    /// Session baseline
    pub baseline: f64,
    /// Proposed change as a fraction of `current`
    pub proposed_fraction: f64,
    /// Accumulated hit weight
    pub weight: f64,
    /// Operator lock
    pub locked: bool,
}

/// Apply lock, confidence and authority rules to a proposal
pub fn limit(input: &CellLimitInput, min_hits: f64, authority: &AuthorityConfig) -> LimitOutcome {
    if input.locked {
        return LimitOutcome::Suppressed(SuppressReason::Locked);
    }
    if !input.current.is_finite() || !input.baseline.is_finite() {
        return LimitOutcome::Suppressed(SuppressReason::InvalidValue);
    }
    if input.weight < min_hits {
        return LimitOutcome::Suppressed(SuppressReason::InsufficientData);
    }

    let max_step_up = authority.max_increase_percent / 100.0;
    let max_step_down = authority.max_decrease_percent / 100.0;

    let proposed = if input.proposed_fraction.is_finite() {
        input.proposed_fraction
    } else {
        0.0
    };
    let step = proposed.clamp(-max_step_down, max_step_up);
    let stepped = input.current * (1.0 + step);
    let mut clamp = if step != proposed {
        ClampKind::PerTick
    } else {
        ClampKind::None
    };

    let (low, high) = absolute_bounds(input.baseline, authority);
    let value = stepped.clamp(low, high);
    if value != stepped {
        clamp = ClampKind::Absolute;
    }

    LimitOutcome::Limited { value, clamp }
}

/// Lowest and highest value a cell may reach this session
pub fn absolute_bounds(baseline: f64, authority: &AuthorityConfig) -> (f64, f64) {
    let span = authority.absolute_max_percent / 100.0;
    let a = baseline * (1.0 - span);
    let b = baseline * (1.0 + span);
    (a.min(b), a.max(b))
}
