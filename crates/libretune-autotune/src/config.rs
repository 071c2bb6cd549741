//! AutoTune configuration
//!
//! Operator-adjustable settings for a session: data filters, authority limits
//! and engine settings. Loaded from a JSON settings file at session start and
//! replaceable at runtime through [`crate::session::AutoTuneSession::update_config`].

use crate::correction::TargetAfrPolicy;
use crate::error::{AutoTuneError, Result};
use crate::table::AttributionPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings file name inside the LibreTune config directory
const SETTINGS_FILE: &str = "autotune.json";

/// Data filters for VE Analyze
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Samples below this RPM are rejected
    pub min_rpm: f64,
    /// Samples above this RPM are rejected
    pub max_rpm: f64,
    /// Minimum coolant temperature
    pub min_clt: f64,
    /// Minimum throttle position (%)
    pub min_tps: f64,
    // Transient filtering
    /// Max TPS change rate (%/sec) before filtering
    pub max_tps_rate: f64,
    /// Exclude data when accel enrichment is active
    pub exclude_accel_enrich: bool,
    /// Wideband transport delay (ms) between combustion and the AFR reading
    pub lambda_delay_ms: u32,
    /// RPM-dependent delay, overrides `lambda_delay_ms` when set
    pub lambda_delay_curve: Option<LambdaDelayCurve>,
    /// Boolean expression evaluated against each sample
    pub custom_filter: Option<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_rpm: 1000.0,
            max_rpm: 7000.0,
            min_clt: 160.0,
            min_tps: 1.0,
            max_tps_rate: 10.0,         // 10%/sec threshold
            exclude_accel_enrich: true, // Exclude accel enrichment by default
            lambda_delay_ms: 0,
            lambda_delay_curve: None,
            custom_filter: None,
        }
    }
}

impl FilterConfig {
    /// Lambda delay to use for a sample at the given RPM
    pub fn lambda_delay_for(&self, rpm: f64) -> u64 {
        match &self.lambda_delay_curve {
            Some(curve) => curve.delay_ms(rpm),
            None => u64::from(self.lambda_delay_ms),
        }
    }

    /// Longest delay this configuration can ask for
    pub fn max_lambda_delay_ms(&self) -> u64 {
        match &self.lambda_delay_curve {
            Some(curve) => curve.idle_delay_ms.max(curve.redline_delay_ms) as u64,
            None => u64::from(self.lambda_delay_ms),
        }
    }

    fn validate(&self) -> Result<()> {
        non_negative("filters.min_rpm", self.min_rpm)?;
        non_negative("filters.max_rpm", self.max_rpm)?;
        if self.max_rpm < self.min_rpm {
            return Err(AutoTuneError::config(
                "filters.max_rpm",
                format!("{} is below min_rpm {}", self.max_rpm, self.min_rpm),
            ));
        }
        finite("filters.min_clt", self.min_clt)?;
        non_negative("filters.min_tps", self.min_tps)?;
        positive("filters.max_tps_rate", self.max_tps_rate)?;
        if let Some(curve) = &self.lambda_delay_curve {
            curve.validate()?;
        }
        Ok(())
    }
}

/// Lambda sensor delay as a function of RPM
///
/// Higher RPM means faster exhaust flow and less delay. The delay is linearly
/// interpolated between the idle and redline points and clamped outside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaDelayCurve {
    /// RPM of the idle point
    pub idle_rpm: f64,
    /// Delay at or below idle RPM
    pub idle_delay_ms: f64,
    /// RPM of the redline point
    pub redline_rpm: f64,
    /// Delay at or above redline RPM
    pub redline_delay_ms: f64,
}

impl Default for LambdaDelayCurve {
    fn default() -> Self {
        // At idle (800 RPM): ~200ms delay, at redline (6000 RPM): ~50ms delay
        Self {
            idle_rpm: 800.0,
            idle_delay_ms: 200.0,
            redline_rpm: 6000.0,
            redline_delay_ms: 50.0,
        }
    }
}

impl LambdaDelayCurve {
    /// Delay in milliseconds at the given RPM
    pub fn delay_ms(&self, rpm: f64) -> u64 {
        let clamped_rpm = rpm.clamp(self.idle_rpm, self.redline_rpm);
        let rpm_ratio = (clamped_rpm - self.idle_rpm) / (self.redline_rpm - self.idle_rpm);
        let delay =
            self.idle_delay_ms - (rpm_ratio * (self.idle_delay_ms - self.redline_delay_ms));

        delay.round().max(0.0) as u64
    }

    fn validate(&self) -> Result<()> {
        non_negative("filters.lambda_delay_curve.idle_rpm", self.idle_rpm)?;
        non_negative("filters.lambda_delay_curve.idle_delay_ms", self.idle_delay_ms)?;
        non_negative(
            "filters.lambda_delay_curve.redline_delay_ms",
            self.redline_delay_ms,
        )?;
        if !(self.redline_rpm > self.idle_rpm) {
            return Err(AutoTuneError::config(
                "filters.lambda_delay_curve.redline_rpm",
                "must be above idle_rpm",
            ));
        }
        Ok(())
    }
}

/// Authority limits to restrict VE changes
///
/// All values are percentages. The per-update limits bound how far one update
/// tick may move a cell; the absolute limit bounds the cell against its session
/// baseline. An absolute limit below the per-update limits is accepted as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Largest increase per update, in percent of the current value
    pub max_increase_percent: f64,
    /// Largest decrease per update, in percent of the current value
    pub max_decrease_percent: f64,
    /// Largest total change from the baseline, in percent
    pub absolute_max_percent: f64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            max_increase_percent: 10.0,
            max_decrease_percent: 10.0,
            absolute_max_percent: 20.0,
        }
    }
}

impl AuthorityConfig {
    fn validate(&self) -> Result<()> {
        positive("authority.max_increase_percent", self.max_increase_percent)?;
        positive("authority.max_decrease_percent", self.max_decrease_percent)?;
        positive("authority.absolute_max_percent", self.absolute_max_percent)?;
        if self.max_decrease_percent >= 100.0 {
            return Err(AutoTuneError::config(
                "authority.max_decrease_percent",
                "must be below 100%",
            ));
        }
        if self.absolute_max_percent > 100.0 {
            return Err(AutoTuneError::config(
                "authority.absolute_max_percent",
                "must not exceed 100%",
            ));
        }
        Ok(())
    }
}

/// Hit-weight thresholds for the heat map confidence buckets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceThresholds {
    /// Weight at which a cell shows low confidence
    pub low: f64,
    /// Weight for medium confidence
    pub medium: f64,
    /// Weight for high confidence
    pub high: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            low: 1.0,
            medium: 10.0,
            high: 50.0,
        }
    }
}

impl ConfidenceThresholds {
    fn validate(&self) -> Result<()> {
        positive("settings.confidence.low", self.low)?;
        if !(self.low < self.medium && self.medium < self.high) {
            return Err(AutoTuneError::config(
                "settings.confidence",
                "thresholds must be strictly increasing",
            ));
        }
        Ok(())
    }
}

/// AutoTune engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTuneSettings {
    /// Name of the table being tuned
    pub target_table: String,
    /// Period of the recommendation update tick
    pub update_interval_ms: u64,
    /// Minimum accumulated hit weight before a cell gets a recommendation
    pub min_hits: f64,
    /// How a sample is split over cells
    pub attribution: AttributionPolicy,
    /// Where the target AFR for each sample comes from
    pub target_afr: TargetAfrPolicy,
    /// Heat map confidence thresholds
    pub confidence: ConfidenceThresholds,
    /// How much engine history the lambda delay buffer keeps
    pub history_window_ms: u64,
    /// Largest distance between the delayed timestamp and its nearest history entry
    pub max_history_gap_ms: u64,
    /// Periodically apply eligible recommendations to the table writer
    pub auto_send_updates: bool,
    /// Period of auto-send
    pub send_interval_ms: u64,
    /// Restart accumulation for cells once their recommendation is applied
    pub clear_on_apply: bool,
}

impl Default for AutoTuneSettings {
    fn default() -> Self {
        Self {
            target_table: "veTable1".to_string(),
            update_interval_ms: 250,
            min_hits: 1.0,
            attribution: AttributionPolicy::Nearest,
            target_afr: TargetAfrPolicy::FromSample,
            confidence: ConfidenceThresholds::default(),
            history_window_ms: 1000,
            max_history_gap_ms: 50,
            auto_send_updates: false,
            send_interval_ms: 15000,
            clear_on_apply: true,
        }
    }
}

impl AutoTuneSettings {
    fn validate(&self) -> Result<()> {
        if !(10..=10_000).contains(&self.update_interval_ms) {
            return Err(AutoTuneError::config(
                "settings.update_interval_ms",
                format!("{} is outside 10..=10000", self.update_interval_ms),
            ));
        }
        positive("settings.min_hits", self.min_hits)?;
        if self.max_history_gap_ms == 0 {
            return Err(AutoTuneError::config(
                "settings.max_history_gap_ms",
                "must be greater than zero",
            ));
        }
        // Validated whether or not auto-send is on
        if self.send_interval_ms < 100 {
            return Err(AutoTuneError::config(
                "settings.send_interval_ms",
                "must be at least 100 ms",
            ));
        }
        self.target_afr.validate()?;
        self.confidence.validate()
    }
}

/// Complete AutoTune configuration as stored in the settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTuneConfig {
    /// Engine settings
    pub settings: AutoTuneSettings,
    /// Admission filters
    pub filters: FilterConfig,
    /// Authority limits
    pub authority: AuthorityConfig,
}

impl AutoTuneConfig {
    /// Check every threshold; a session cannot start with an invalid config
    pub fn validate(&self) -> Result<()> {
        self.filters.validate()?;
        self.authority.validate()?;
        self.settings.validate()
    }

    /// Load and validate a settings file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AutoTuneConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save settings as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Default settings location in the user's config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("LibreTune").join(SETTINGS_FILE))
    }

    /// Load from the default location, falling back to defaults if no file exists
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// History the delay buffer must retain for this configuration
    pub(crate) fn required_history_ms(&self) -> u64 {
        self.settings
            .history_window_ms
            .max(self.filters.max_lambda_delay_ms() + self.settings.max_history_gap_ms)
    }
}

fn finite(field: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(AutoTuneError::config(field, "must be a finite number"))
    }
}

fn non_negative(field: &str, value: f64) -> Result<()> {
    finite(field, value)?;
    if value < 0.0 {
        return Err(AutoTuneError::config(field, format!("{value} is negative")));
    }
    Ok(())
}

fn positive(field: &str, value: f64) -> Result<()> {
    finite(field, value)?;
    if value <= 0.0 {
        return Err(AutoTuneError::config(
            field,
            format!("{value} must be greater than zero"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(AutoTuneConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_authority_is_rejected() {
        let mut config = AutoTuneConfig::default();
        config.authority.max_increase_percent = 0.0;

        match config.validate() {
            Err(AutoTuneError::ConfigInvalid { field, .. }) => {
                assert_eq!(field, "authority.max_increase_percent")
            }
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn absolute_below_per_tick_is_kept() {
        let mut config = AutoTuneConfig::default();
        config.authority.max_increase_percent = 15.0;
        config.authority.absolute_max_percent = 5.0;

        assert!(config.validate().is_ok());
        assert_eq!(config.authority.absolute_max_percent, 5.0);
    }

    #[test]
    fn negative_rpm_threshold_is_rejected() {
        let mut config = AutoTuneConfig::default();
        config.filters.min_rpm = -100.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_min_hits_is_rejected() {
        let mut config = AutoTuneConfig::default();
        config.settings.min_hits = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn delay_curve_interpolates_and_clamps() {
        let curve = LambdaDelayCurve::default();
        assert_eq!(curve.delay_ms(500.0), 200);
        assert_eq!(curve.delay_ms(800.0), 200);
        assert_eq!(curve.delay_ms(3400.0), 125);
        assert_eq!(curve.delay_ms(9000.0), 50);
    }

    #[test]
    fn curve_overrides_fixed_delay() {
        let mut filters = FilterConfig {
            lambda_delay_ms: 80,
            ..Default::default()
        };
        assert_eq!(filters.lambda_delay_for(3000.0), 80);

        filters.lambda_delay_curve = Some(LambdaDelayCurve::default());
        assert_eq!(filters.lambda_delay_for(6000.0), 50);
        assert_eq!(filters.max_lambda_delay_ms(), 200);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "filters": { "min_rpm": 800.0 } }"#;
        let config: AutoTuneConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.filters.min_rpm, 800.0);
        assert_eq!(config.filters.max_rpm, 7000.0);
        assert_eq!(config.settings.update_interval_ms, 250);
    }
}
