//! # LibreTune AutoTune
//!
//! Real-time fuel table correction for the LibreTune ECU tuning software.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Sample admission filters (RPM, coolant, throttle, accel enrichment)
//! - Lambda transport delay compensation
//! - Per-cell weighted error accumulation
//! - Authority-limited VE recommendations with lock/apply/reset
//! - Background update, ingestion and auto-send tasks on tokio
//!
//! ## Example
//!
//! ```rust,ignore
//! use libretune_autotune::prelude::*;
//!
//! let geometry = TableGeometry::new(rpm_bins, map_bins)?;
//! let session = AutoTuneSession::start(geometry, &live_ve, AutoTuneConfig::load_or_default()?)?;
//!
//! // Feed telemetry as it arrives
//! session.ingest(sample);
//!
//! // Refresh recommendations and write them back
//! session.tick()?;
//! session.apply(&CellSelection::AllEligible, &mut live_ve)?;
//! ```

pub mod accumulator;
pub mod authority;
pub mod config;
pub mod correction;
pub mod delay;
pub mod demo;
pub mod error;
pub mod filter;
pub mod session;
pub mod store;
pub mod table;
pub mod telemetry;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::accumulator::CellStats;
    pub use crate::authority::{ClampKind, SuppressReason};
    pub use crate::config::{
        AuthorityConfig, AutoTuneConfig, AutoTuneSettings, ConfidenceThresholds, FilterConfig,
        LambdaDelayCurve,
    };
    pub use crate::correction::{TargetAfrPolicy, TargetAfrTable};
    pub use crate::demo::DemoSimulator;
    pub use crate::error::{AutoTuneError, Result};
    pub use crate::filter::RejectReason;
    pub use crate::session::{
        AutoTuneSession, DropReason, IngestStats, SampleOutcome, TableWriter,
    };
    pub use crate::store::{
        ApplyReport, CellSelection, CellWrite, ConfidenceBucket, HeatMapEntry, Recommendation,
        RecommendationGrid, RecommendationStatus, SkipReason,
    };
    pub use crate::table::{AttributionPolicy, CellRef, TableGeometry, TableValues};
    pub use crate::telemetry::{EngineState, TelemetrySample};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
