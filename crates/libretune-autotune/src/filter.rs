//! Sample admission filters
//!
//! Decides whether a telemetry sample is steady-state data worth learning from.
//! Filters run in a fixed order and the first one that fails names the
//! rejection. Every threshold is inclusive: a value exactly on a limit passes.

use crate::config::FilterConfig;
use crate::telemetry::TelemetrySample;
use evalexpr::{eval_with_context, ContextWithMutableVariables, HashMapContext, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a sample was filtered out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// RPM below the minimum
    RpmTooLow,
    /// RPM above the maximum
    RpmTooHigh,
    /// Engine not yet warm
    CoolantTooCold,
    /// Throttle below the minimum
    ThrottleTooLow,
    /// Throttle moving faster than the allowed rate
    ThrottleTransient,
    /// ECU reports acceleration enrichment active
    AccelEnrichment,
    /// User expression evaluated false
    CustomFilter,
}

impl RejectReason {
    /// Every reason, in filter order
    pub const ALL: [RejectReason; 7] = [
        RejectReason::RpmTooLow,
        RejectReason::RpmTooHigh,
        RejectReason::CoolantTooCold,
        RejectReason::ThrottleTooLow,
        RejectReason::ThrottleTransient,
        RejectReason::AccelEnrichment,
        RejectReason::CustomFilter,
    ];

    /// Position in [`RejectReason::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable snake_case name
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::RpmTooLow => "rpm_too_low",
            RejectReason::RpmTooHigh => "rpm_too_high",
            RejectReason::CoolantTooCold => "coolant_too_cold",
            RejectReason::ThrottleTooLow => "throttle_too_low",
            RejectReason::ThrottleTransient => "throttle_transient",
            RejectReason::AccelEnrichment => "accel_enrichment",
            RejectReason::CustomFilter => "custom_filter",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running a sample through the filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Passed every filter
    Accepted,
    /// Failed the named filter
    Rejected(RejectReason),
}

impl Admission {
    /// True when every filter passed
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Run the filters over a sample
pub fn admit(sample: &TelemetrySample, filters: &FilterConfig) -> Admission {
    match first_rejection(sample, filters) {
        Some(reason) => Admission::Rejected(reason),
        None => Admission::Accepted,
    }
}

fn first_rejection(sample: &TelemetrySample, filters: &FilterConfig) -> Option<RejectReason> {
    // Basic RPM and CLT filters
    if sample.rpm < filters.min_rpm {
        return Some(RejectReason::RpmTooLow);
    }
    if sample.rpm > filters.max_rpm {
        return Some(RejectReason::RpmTooHigh);
    }
    if sample.clt < filters.min_clt {
        return Some(RejectReason::CoolantTooCold);
    }
    if sample.tps < filters.min_tps {
        return Some(RejectReason::ThrottleTooLow);
    }

    // Transient filtering: reject if TPS is changing too fast
    if let Some(rate) = sample.tps_rate {
        if rate.abs() > filters.max_tps_rate {
            return Some(RejectReason::ThrottleTransient);
        }
    }

    // Transient filtering: reject if accel enrichment is active (if flag available)
    if filters.exclude_accel_enrich && sample.accel_enrich_active == Some(true) {
        return Some(RejectReason::AccelEnrichment);
    }

    if let Some(ref expr) = filters.custom_filter {
        let trimmed = expr.trim();
        if !trimmed.is_empty() {
            match evaluate_custom_filter(trimmed, sample) {
                Ok(true) => {}
                Ok(false) => return Some(RejectReason::CustomFilter),
                Err(e) => {
                    tracing::warn!("AutoTune custom filter rejected data: {e}");
                    return Some(RejectReason::CustomFilter);
                }
            }
        }
    }

    None
}

fn evaluate_custom_filter(expr: &str, sample: &TelemetrySample) -> Result<bool, String> {
    let mut ctx = HashMapContext::new();

    let set_value = |ctx: &mut HashMapContext, name: &str, value: Value| {
        ctx.set_value(name.to_string(), value)
            .map_err(|e| format!("Failed to set {name}: {e}"))
    };

    set_value(&mut ctx, "rpm", sample.rpm.into())?;
    set_value(&mut ctx, "load", sample.load.into())?;
    set_value(&mut ctx, "clt", sample.clt.into())?;
    set_value(&mut ctx, "tps", sample.tps.into())?;
    set_value(&mut ctx, "tps_rate", sample.tps_rate.unwrap_or(0.0).into())?;
    set_value(&mut ctx, "afr", sample.afr.into())?;
    set_value(&mut ctx, "target_afr", sample.target_afr.unwrap_or(0.0).into())?;

    let accel_enrich = sample.accel_enrich_active.unwrap_or(false);
    set_value(&mut ctx, "accel_enrich", accel_enrich.into())?;

    match eval_with_context(expr, &ctx) {
        Ok(Value::Boolean(val)) => Ok(val),
        Ok(Value::Int(val)) => Ok(val != 0),
        Ok(Value::Float(val)) => Ok(val != 0.0),
        Ok(other) => Err(format!(
            "Custom filter must return boolean or number, got {other:?}"
        )),
        Err(e) => Err(format!("Custom filter eval error: {e}")),
    }
}
