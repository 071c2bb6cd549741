//! AutoTune session
//!
//! One continuous AutoTune run against one table. Samples are processed
//! synchronously on arrival (filter, delay compensation, attribution,
//! accumulation); recommendations are recomputed on a separate, slower update
//! tick so the per-update authority limit keeps its meaning.
//!
//! Lock order is always store, then accumulator. Ingestion only ever takes the
//! accumulator and its own history lock, so UI actions never stall it for
//! longer than a tick's statistics copy.

use crate::accumulator::{CellAccumulator, CellStats};
use crate::config::AutoTuneConfig;
use crate::correction::fractional_error;
use crate::delay::{DelayCompensator, DelayMiss};
use crate::error::{AutoTuneError, Result};
use crate::filter::{admit, Admission, RejectReason};
use crate::store::{
    ApplyReport, CellSelection, CellWrite, HeatMapEntry, RecommendationGrid, RecommendationStore,
    StoreWriter,
};
use crate::table::{attribute, Attribution, CellRef, TableGeometry, TableValues};
use crate::telemetry::{EngineState, TelemetrySample, TpsRateTracker};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a sample was dropped before reaching the accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Timestamp older than the previous sample
    OutOfOrder,
    /// Non-finite channel, dead sensor or no usable target AFR
    Malformed,
    /// Delay history does not reach back far enough yet
    InsufficientHistory,
    /// No history entry near the delayed timestamp
    HistoryGap,
}

impl DropReason {
    /// Every reason, in declaration order
    pub const ALL: [DropReason; 4] = [
        DropReason::OutOfOrder,
        DropReason::Malformed,
        DropReason::InsufficientHistory,
        DropReason::HistoryGap,
    ];

    /// Position in [`DropReason::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl From<DelayMiss> for DropReason {
    fn from(miss: DelayMiss) -> Self {
        match miss {
            DelayMiss::InsufficientHistory => DropReason::InsufficientHistory,
            DelayMiss::HistoryGap => DropReason::HistoryGap,
        }
    }
}

/// What happened to one ingested sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// Sample contributed to the accumulator
    Accepted {
        /// Cells and weights the sample was folded into
        attribution: Attribution,
        /// `actual / target - 1` for this sample
        fractional_error: f64,
        /// Delay-compensated operating point the sample was attributed to
        operating_point: EngineState,
    },
    /// Filtered out before attribution
    Rejected(RejectReason),
    /// Passed the filters but could not be used
    Dropped(DropReason),
    /// Session has been stopped
    Inactive,
}

impl SampleOutcome {
    /// True when the sample reached the accumulator
    pub fn is_accepted(&self) -> bool {
        matches!(self, SampleOutcome::Accepted { .. })
    }
}

/// Ingestion counters for the "accepting / filtered" status indicator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestStats {
    /// Samples folded into the accumulator
    pub accepted: u64,
    /// Filter rejections, one entry per reason
    pub rejected: Vec<(RejectReason, u64)>,
    /// Post-filter drops, one entry per reason
    pub dropped: Vec<(DropReason, u64)>,
    /// Most recent filter that rejected a sample
    pub last_rejection: Option<RejectReason>,
}

impl IngestStats {
    /// Rejections across all filters
    pub fn rejected_total(&self) -> u64 {
        self.rejected.iter().map(|(_, n)| n).sum()
    }

    /// Rejections by one filter
    pub fn rejected_for(&self, reason: RejectReason) -> u64 {
        self.rejected
            .iter()
            .find(|(r, _)| *r == reason)
            .map_or(0, |(_, n)| *n)
    }

    /// Drops for one reason
    pub fn dropped_for(&self, reason: DropReason) -> u64 {
        self.dropped
            .iter()
            .find(|(r, _)| *r == reason)
            .map_or(0, |(_, n)| *n)
    }
}

/// Lock-free counters updated on the ingestion path
#[derive(Debug, Default)]
struct IngestCounters {
    accepted: AtomicU64,
    rejected: [AtomicU64; RejectReason::ALL.len()],
    dropped: [AtomicU64; DropReason::ALL.len()],
    /// Index + 1 of the last rejection, 0 for none
    last_rejection: AtomicUsize,
}

impl IngestCounters {
    fn reject(&self, reason: RejectReason) {
        self.rejected[reason.index()].fetch_add(1, Ordering::Relaxed);
        self.last_rejection
            .store(reason.index() + 1, Ordering::Relaxed);
    }

    fn drop_sample(&self, reason: DropReason) {
        self.dropped[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IngestStats {
        IngestStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: RejectReason::ALL
                .iter()
                .map(|r| (*r, self.rejected[r.index()].load(Ordering::Relaxed)))
                .collect(),
            dropped: DropReason::ALL
                .iter()
                .map(|r| (*r, self.dropped[r.index()].load(Ordering::Relaxed)))
                .collect(),
            last_rejection: self
                .last_rejection
                .load(Ordering::Relaxed)
                .checked_sub(1)
                .and_then(|i| RejectReason::ALL.get(i).copied()),
        }
    }
}

/// Per-stream state touched only by ingestion
#[derive(Debug)]
struct IngestState {
    delay: DelayCompensator,
    tps_rate: TpsRateTracker,
    last_timestamp_ms: Option<u64>,
}

/// Destination for auto-sent recommendations
///
/// Implemented by the tune cache / ECU connection layer.
pub trait TableWriter: Send + 'static {
    /// Current live values of the tuned table
    fn live_values(&mut self, table: &str) -> Result<TableValues>;

    /// Store the updated table (and push it to the ECU if configured)
    fn write_cells(&mut self, table: &str, writes: &[CellWrite], values: &TableValues)
        -> Result<()>;
}

/// One AutoTune run against one table
#[derive(Debug)]
pub struct AutoTuneSession {
    geometry: TableGeometry,
    config: ArcSwap<AutoTuneConfig>,
    ingest: Mutex<IngestState>,
    accumulator: Mutex<CellAccumulator>,
    store: RecommendationStore,
    counters: IngestCounters,
    cancel: CancellationToken,
}

impl AutoTuneSession {
    /// Start a session, capturing the baseline from the live table
    ///
    /// Fails if the configuration is invalid or the live table does not match
    /// the geometry.
    pub fn start(
        geometry: TableGeometry,
        live: &TableValues,
        config: AutoTuneConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        geometry.validate()?;

        let store = RecommendationStore::new(geometry.clone(), live)?;
        store.set_retry_hint(config.settings.update_interval_ms);

        let session = Self {
            accumulator: Mutex::new(CellAccumulator::new(&geometry)),
            ingest: Mutex::new(IngestState {
                delay: DelayCompensator::new(config.required_history_ms()),
                tps_rate: TpsRateTracker::new(),
                last_timestamp_ms: None,
            }),
            geometry,
            config: ArcSwap::from_pointee(config),
            store,
            counters: IngestCounters::default(),
            cancel: CancellationToken::new(),
        };

        tracing::info!(
            "AutoTune session {} started on {} ({}x{} cells)",
            session.id(),
            session.config().settings.target_table,
            session.geometry.x_size(),
            session.geometry.y_size()
        );

        Ok(Arc::new(session))
    }

    /// Session identifier, also carried by the store
    pub fn id(&self) -> Uuid {
        self.store.session_id()
    }

    /// Axes of the table being tuned
    pub fn geometry(&self) -> &TableGeometry {
        &self.geometry
    }

    /// Published recommendations
    pub fn store(&self) -> &RecommendationStore {
        &self.store
    }

    /// False once [`stop`](Self::stop) has been called
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop consuming telemetry; spawned tasks exit and pending ticks are discarded
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let stats = self.counters.snapshot();
        tracing::info!(
            "AutoTune session {} stopped: {} accepted, {} filtered",
            self.id(),
            stats.accepted,
            stats.rejected_total()
        );
    }

    /// Token cancelled when the session stops
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Configuration currently in effect
    pub fn config(&self) -> Arc<AutoTuneConfig> {
        self.config.load_full()
    }

    /// Replace the configuration; takes effect from the next sample and tick
    pub fn update_config(&self, config: AutoTuneConfig) -> Result<()> {
        config.validate()?;
        self.store
            .set_retry_hint(config.settings.update_interval_ms);
        self.config.store(Arc::new(config));
        Ok(())
    }

    fn accumulator(&self) -> MutexGuard<'_, CellAccumulator> {
        self.accumulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Process one telemetry sample
    ///
    /// Never fails: bad samples are counted and dropped.
    pub fn ingest(&self, mut sample: TelemetrySample) -> SampleOutcome {
        if self.cancel.is_cancelled() {
            return SampleOutcome::Inactive;
        }

        let config = self.config.load();
        let timestamp_ms = sample.timestamp_ms;

        if !sample.is_well_formed() {
            return self.dropped(DropReason::Malformed, timestamp_ms);
        }

        let lookup = {
            let mut ingest = self.ingest.lock().unwrap_or_else(PoisonError::into_inner);

            if let Some(last) = ingest.last_timestamp_ms {
                if timestamp_ms < last {
                    return self.dropped(DropReason::OutOfOrder, timestamp_ms);
                }
            }
            ingest.last_timestamp_ms = Some(timestamp_ms);

            // Always add to history for lambda delay correlation
            ingest.delay.set_window(config.required_history_ms());
            ingest.tps_rate.fill(&mut sample);
            ingest.delay.record(sample.engine_state());

            if let Admission::Rejected(reason) = admit(&sample, &config.filters) {
                self.counters.reject(reason);
                return SampleOutcome::Rejected(reason);
            }

            // The current AFR corresponds to conditions from delay_ms ago
            let delay_ms = config.filters.lambda_delay_for(sample.rpm);
            ingest
                .delay
                .lookup(timestamp_ms, delay_ms, config.settings.max_history_gap_ms)
        };

        let operating_point = match lookup {
            Ok(state) => state,
            Err(miss) => return self.dropped(miss.into(), timestamp_ms),
        };

        let error = config
            .settings
            .target_afr
            .target_for(&sample, &operating_point)
            .and_then(|target| fractional_error(sample.afr, target));
        let Some(error) = error else {
            return self.dropped(DropReason::Malformed, timestamp_ms);
        };

        let Some(attribution) =
            attribute(&operating_point, &self.geometry, config.settings.attribution)
        else {
            // Only a non-finite operating point has no cell
            return self.dropped(DropReason::Malformed, timestamp_ms);
        };

        {
            let mut accumulator = self.accumulator();
            for (cell, weight) in attribution.cells() {
                accumulator.update(*cell, error, *weight, timestamp_ms);
            }
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        SampleOutcome::Accepted {
            attribution,
            fractional_error: error,
            operating_point,
        }
    }

    fn dropped(&self, reason: DropReason, timestamp_ms: u64) -> SampleOutcome {
        tracing::debug!("AutoTune dropped sample at {timestamp_ms} ms: {reason:?}");
        self.counters.drop_sample(reason);
        SampleOutcome::Dropped(reason)
    }

    /// Run one update tick and publish the new recommendations
    ///
    /// A tick that finds the session stopped before publishing is discarded.
    pub fn tick(&self) -> Result<Arc<RecommendationGrid>> {
        if self.cancel.is_cancelled() {
            return Err(AutoTuneError::SessionNotRunning);
        }

        let config = self.config.load_full();
        let mut writer = self.store.lock();

        let mut stats: Vec<Option<CellStats>> = Vec::with_capacity(self.geometry.cell_count());
        self.accumulator().copy_into(&mut stats);

        let grid = writer.compute(&stats, &config);
        if self.cancel.is_cancelled() {
            tracing::debug!("AutoTune session {} stopped mid-tick, discarding", self.id());
            return Err(AutoTuneError::SessionNotRunning);
        }
        writer.publish(grid);
        drop(writer);

        Ok(self.store.snapshot())
    }

    /// Current recommendations
    pub fn snapshot(&self) -> Arc<RecommendationGrid> {
        self.store.snapshot()
    }

    /// Heat map of the latest published grid
    pub fn heatmap(&self) -> Vec<HeatMapEntry> {
        self.store.heatmap()
    }

    /// Snapshot of the ingestion counters
    pub fn ingest_stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    /// Accumulated statistics for one cell
    pub fn cell_stats(&self, cell: CellRef) -> Option<CellStats> {
        self.accumulator().get(cell).copied()
    }

    /// Write recommendations into the live table, waiting for a running tick
    pub fn apply(&self, selection: &CellSelection, live: &mut TableValues) -> Result<ApplyReport> {
        let writer = self.store.lock();
        self.apply_with(writer, selection, live)
    }

    /// Like [`apply`](Self::apply), but fails with `ApplyConflict` instead of waiting
    pub fn try_apply(
        &self,
        selection: &CellSelection,
        live: &mut TableValues,
    ) -> Result<ApplyReport> {
        let writer = self.store.try_lock()?;
        self.apply_with(writer, selection, live)
    }

    fn apply_with(
        &self,
        mut writer: StoreWriter<'_>,
        selection: &CellSelection,
        live: &mut TableValues,
    ) -> Result<ApplyReport> {
        let rebase = self.config.load().settings.clear_on_apply;
        let report = writer.apply(selection, live, rebase)?;

        if rebase {
            let mut accumulator = self.accumulator();
            for write in &report.writes {
                accumulator.clear(write.cell);
            }
        }

        if !report.is_empty() {
            tracing::info!(
                "AutoTune applied {} cells (apply #{})",
                report.writes.len(),
                report.apply_count
            );
        }
        Ok(report)
    }

    /// Clear statistics and recommendations, re-reading the baseline from `live`
    ///
    /// `None` resets the whole table.
    pub fn reset(&self, cells: Option<&[CellRef]>, live: &TableValues) -> Result<()> {
        let mut writer = self.store.lock();
        writer.reset(cells, live)?;

        let mut accumulator = self.accumulator();
        match cells {
            Some(cells) => {
                for cell in cells {
                    accumulator.clear(*cell);
                }
                tracing::info!("AutoTune reset {} cells", cells.len());
            }
            None => {
                accumulator.reset();
                drop(accumulator);

                let mut ingest = self.ingest.lock().unwrap_or_else(PoisonError::into_inner);
                ingest.delay.clear();
                ingest.tps_rate.reset();
                tracing::info!("AutoTune reset all cells");
            }
        }
        Ok(())
    }

    /// Freeze cells at their current recommendation
    pub fn lock_cells(&self, cells: &[CellRef]) -> Result<()> {
        self.set_locked(cells, true)
    }

    /// Release locks; cells update again from the next tick
    pub fn unlock_cells(&self, cells: &[CellRef]) -> Result<()> {
        self.set_locked(cells, false)
    }

    fn set_locked(&self, cells: &[CellRef], locked: bool) -> Result<()> {
        if let Some(bad) = cells.iter().find(|c| !self.geometry.contains(**c)) {
            tracing::warn!("AutoTune cannot lock cell {bad}: outside the table");
            return Err(AutoTuneError::CellOutOfRange(*bad));
        }

        let mut writer = self.store.lock();
        {
            let mut accumulator = self.accumulator();
            for cell in cells {
                accumulator.set_locked(*cell, locked);
            }
        }
        writer.set_locked(cells, locked);
        Ok(())
    }

    /// Whether the operator has locked `cell`
    pub fn is_cell_locked(&self, cell: CellRef) -> bool {
        self.accumulator().is_locked(cell)
    }

    /// Run update ticks on the configured interval until the session stops
    pub fn spawn_update_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let mut period_ms = session.config().settings.update_interval_ms;
            let mut ticker = ticker_for(period_ms);

            loop {
                tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = session.tick() {
                    if !session.is_running() {
                        break;
                    }
                    tracing::warn!("AutoTune update tick failed: {e}");
                }

                let configured = session.config().settings.update_interval_ms;
                if configured != period_ms {
                    period_ms = configured;
                    ticker = ticker_for(period_ms);
                }
            }

            tracing::debug!("AutoTune update loop for {} stopped", session.id());
        })
    }

    /// Feed samples from a telemetry channel until it closes or the session stops
    pub fn spawn_ingest_loop(
        self: &Arc<Self>,
        mut samples: mpsc::Receiver<TelemetrySample>,
    ) -> JoinHandle<()> {
        let session = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => break,
                    sample = samples.recv() => match sample {
                        Some(sample) => {
                            session.ingest(sample);
                        }
                        None => break,
                    },
                }
            }
        })
    }

    /// Periodically apply all eligible recommendations through `writer`
    ///
    /// Runs until the session stops. Each interval re-reads the settings, so
    /// clearing `auto_send_updates` pauses sending and a new `send_interval_ms`
    /// takes effect after the pending send.
    pub fn spawn_auto_send<W: TableWriter>(self: &Arc<Self>, mut writer: W) -> JoinHandle<()> {
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let mut period_ms = session.config().settings.send_interval_ms;
            let mut ticker = ticker_for(period_ms);

            loop {
                tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let config = session.config();
                if config.settings.auto_send_updates {
                    let table = &config.settings.target_table;
                    if let Err(e) = session.send_once(&mut writer, table) {
                        tracing::warn!("AutoTune auto-send to {table} failed: {e}");
                    }
                }

                if config.settings.send_interval_ms != period_ms {
                    period_ms = config.settings.send_interval_ms;
                    ticker = ticker_for(period_ms);
                }
            }

            tracing::debug!("AutoTune auto-send for {} stopped", session.id());
        })
    }

    fn send_once<W: TableWriter>(&self, writer: &mut W, table: &str) -> Result<()> {
        let mut live = writer.live_values(table)?;
        let report = self.apply(&CellSelection::AllEligible, &mut live)?;
        if report.is_empty() {
            return Ok(());
        }
        writer.write_cells(table, &report.writes, &live)
    }
}

/// Interval whose first tick fires one period from now
fn ticker_for(period_ms: u64) -> Interval {
    let period = Duration::from_millis(period_ms.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
