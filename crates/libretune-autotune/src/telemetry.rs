//! Telemetry records
//!
//! Samples delivered by the ECU transport for AutoTune analysis.

use serde::{Deserialize, Serialize};

/// One timestamped reading from the ECU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Monotonic timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Engine speed
    pub rpm: f64,
    /// Load proxy matching the table's Y axis (MAP or TPS)
    pub load: f64,
    /// Coolant temperature
    pub clt: f64,
    /// Throttle position (%)
    pub tps: f64,
    /// Throttle change rate (%/sec), if the ECU provides it
    pub tps_rate: Option<f64>,
    /// Measured AFR or lambda
    pub afr: f64,
    /// Target AFR or lambda reported by the ECU, if logged
    pub target_afr: Option<f64>,
    /// ECU accel enrichment flag (if available)
    pub accel_enrich_active: Option<bool>,
}

impl Default for TelemetrySample {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            rpm: 0.0,
            load: 0.0,
            clt: 0.0,
            tps: 0.0,
            tps_rate: None,
            afr: 0.0,
            target_afr: None,
            accel_enrich_active: None,
        }
    }
}

impl TelemetrySample {
    /// The engine operating point this sample was taken at
    pub fn engine_state(&self) -> EngineState {
        EngineState {
            timestamp_ms: self.timestamp_ms,
            rpm: self.rpm,
            load: self.load,
        }
    }

    /// Whether the fields the pipeline depends on hold usable numbers
    pub fn is_well_formed(&self) -> bool {
        self.rpm.is_finite()
            && self.load.is_finite()
            && self.clt.is_finite()
            && self.tps.is_finite()
            && self.afr.is_finite()
            && self.tps_rate.map_or(true, f64::is_finite)
    }
}

/// Engine operating point used for cell attribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// Timestamp of the sample this state came from
    pub timestamp_ms: u64,
    /// Engine speed
    pub rpm: f64,
    /// Load axis value
    pub load: f64,
}

/// Derives throttle rate for ECUs that do not report one
///
/// Rate is computed from consecutive TPS readings. The first reading, and any
/// reading sharing a timestamp with the previous one, has no rate.
#[derive(Debug, Default, Clone)]
pub struct TpsRateTracker {
    last: Option<(u64, f64)>,
}

impl TpsRateTracker {
    /// Tracker with no previous reading
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill in `tps_rate` when missing and remember this reading
    pub fn fill(&mut self, sample: &mut TelemetrySample) {
        if sample.tps_rate.is_none() {
            sample.tps_rate = self.rate_to(sample.timestamp_ms, sample.tps);
        }
        self.last = Some((sample.timestamp_ms, sample.tps));
    }

    fn rate_to(&self, timestamp_ms: u64, tps: f64) -> Option<f64> {
        let (last_ms, last_tps) = self.last?;
        let dt_ms = timestamp_ms.checked_sub(last_ms)?;
        if dt_ms == 0 {
            return None;
        }
        Some((tps - last_tps) / (dt_ms as f64 / 1000.0))
    }

    /// Forget the previous reading
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_computes_rate_in_percent_per_second() {
        let mut tracker = TpsRateTracker::new();

        let mut first = TelemetrySample {
            timestamp_ms: 1000,
            tps: 10.0,
            ..Default::default()
        };
        tracker.fill(&mut first);
        assert_eq!(first.tps_rate, None);

        let mut second = TelemetrySample {
            timestamp_ms: 1100,
            tps: 15.0,
            ..Default::default()
        };
        tracker.fill(&mut second);
        assert!((second.tps_rate.unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn tracker_keeps_provided_rate() {
        let mut tracker = TpsRateTracker::new();
        tracker.fill(&mut TelemetrySample {
            timestamp_ms: 0,
            tps: 0.0,
            ..Default::default()
        });

        let mut sample = TelemetrySample {
            timestamp_ms: 100,
            tps: 90.0,
            tps_rate: Some(2.0),
            ..Default::default()
        };
        tracker.fill(&mut sample);
        assert_eq!(sample.tps_rate, Some(2.0));
    }

    #[test]
    fn nan_fields_are_malformed() {
        let sample = TelemetrySample {
            afr: f64::NAN,
            ..Default::default()
        };
        assert!(!sample.is_well_formed());
        assert!(TelemetrySample::default().is_well_formed());
    }
}
