use libretune_autotune::prelude::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn geometry() -> TableGeometry {
    TableGeometry::new(
        vec![1000.0, 2000.0, 3000.0, 4000.0],
        vec![30.0, 60.0, 90.0, 120.0],
    )
    .unwrap()
}

fn start(config: AutoTuneConfig) -> (Arc<AutoTuneSession>, TableValues) {
    let geometry = geometry();
    let live = TableValues::filled(&geometry, 80.0);
    let session = AutoTuneSession::start(geometry, &live, config).unwrap();
    (session, live)
}

fn sample(timestamp_ms: u64, rpm: f64, load: f64, afr: f64) -> TelemetrySample {
    TelemetrySample {
        timestamp_ms,
        rpm,
        load,
        clt: 180.0,
        tps: 5.0,
        tps_rate: Some(0.0),
        afr,
        target_afr: Some(14.7),
        accel_enrich_active: Some(false),
    }
}

/// Feed `count` samples 5% lean at 3000 RPM / 60 kPa
fn feed_lean(session: &AutoTuneSession, start_ms: u64, count: u64) {
    for i in 0..count {
        let outcome = session.ingest(sample(start_ms + i * 20, 3000.0, 60.0, 14.7 * 1.05));
        assert!(outcome.is_accepted(), "sample {i} not accepted: {outcome:?}");
    }
}

const CRUISE: CellRef = CellRef { x: 2, y: 1 };

/// Filter window used by the reference end-to-end scenario
fn scenario_config() -> AutoTuneConfig {
    let mut config = AutoTuneConfig::default();
    config.filters.min_rpm = 800.0;
    config.filters.max_rpm = 6500.0;
    config
}

fn recommended(session: &AutoTuneSession, cell: CellRef) -> f64 {
    session.snapshot().get(cell).unwrap().recommended_value
}

#[test]
fn low_rpm_sample_is_rejected() {
    let (session, _) = start(scenario_config());

    let outcome = session.ingest(sample(0, 500.0, 60.0, 15.5));
    assert_eq!(outcome, SampleOutcome::Rejected(RejectReason::RpmTooLow));

    let stats = session.ingest_stats();
    assert_eq!(stats.rejected_for(RejectReason::RpmTooLow), 1);
    assert_eq!(stats.accepted, 0);
    assert!(session.store().snapshot().with_hits().next().is_none());
}

#[test]
fn lean_sample_is_attributed_with_fractional_error() {
    let (session, _) = start(scenario_config());

    let outcome = session.ingest(sample(0, 3000.0, 60.0, 15.5));
    let SampleOutcome::Accepted {
        attribution,
        fractional_error,
        ..
    } = outcome
    else {
        panic!("expected accepted sample, got {outcome:?}");
    };
    assert!((fractional_error - 0.0544).abs() < 1e-3);
    assert_eq!(attribution.primary(), CRUISE);
    assert!(attribution.is_single());

    let stats = session.cell_stats(CRUISE).unwrap();
    assert_eq!(stats.hits, 1);
    assert!((stats.weight - 1.0).abs() < 1e-9);
    assert!((stats.mean_error - 0.0544).abs() < 1e-3);
}

#[test]
fn consistent_lean_error_recommends_more_fuel() {
    let (session, _) = start(AutoTuneConfig::default());
    feed_lean(&session, 0, 10);

    let grid = session.tick().unwrap();
    let rec = grid.get(CRUISE).unwrap();
    assert!((rec.recommended_value - 84.0).abs() < 1e-9);
    assert_eq!(rec.beginning_value, 80.0);
    assert_eq!(rec.hit_count, 10);
    assert_eq!(rec.status, RecommendationStatus::Ready);
    assert_eq!(rec.confidence, ConfidenceBucket::Medium);
    assert_eq!(rec.clamp, ClampKind::None);

    // Further ticks with the same statistics hold the value
    session.tick().unwrap();
    assert!((recommended(&session, CRUISE) - 84.0).abs() < 1e-9);
}

#[test]
fn large_error_moves_in_limited_steps_until_absolute_limit() {
    let (session, _) = start(AutoTuneConfig::default());
    for i in 0..5 {
        session.ingest(sample(i * 20, 3000.0, 60.0, 14.7 * 1.5));
    }

    let first = session.tick().unwrap();
    let rec = first.get(CRUISE).unwrap();
    assert!((rec.recommended_value - 88.0).abs() < 1e-9);
    assert_eq!(rec.clamp, ClampKind::PerTick);

    // 88 * 1.1 would pass 80 * 1.2
    let second = session.tick().unwrap();
    let rec = second.get(CRUISE).unwrap();
    assert!((rec.recommended_value - 96.0).abs() < 1e-9);
    assert_eq!(rec.clamp, ClampKind::Absolute);

    for _ in 0..10 {
        session.tick().unwrap();
        assert!(recommended(&session, CRUISE) <= 96.0 + 1e-9);
    }
}

#[test]
fn thin_cells_are_not_applied() {
    let mut config = AutoTuneConfig::default();
    config.settings.min_hits = 5.0;
    let (session, mut live) = start(config);
    feed_lean(&session, 0, 3);
    session.tick().unwrap();

    let rec = session.snapshot().get(CRUISE).unwrap().clone();
    assert_eq!(
        rec.status,
        RecommendationStatus::Suppressed(SuppressReason::InsufficientData)
    );
    assert_eq!(rec.recommended_value, 80.0);

    let report = session
        .apply(&CellSelection::Cells(vec![CRUISE]), &mut live)
        .unwrap();
    assert!(report.writes.is_empty());
    assert_eq!(
        report.skipped,
        vec![(
            CRUISE,
            SkipReason::Suppressed(SuppressReason::InsufficientData)
        )]
    );
}

#[test]
fn locked_cell_is_never_written() {
    let (session, mut live) = start(AutoTuneConfig::default());
    feed_lean(&session, 0, 10);
    session.lock_cells(&[CRUISE]).unwrap();
    session.tick().unwrap();

    assert!(session.is_cell_locked(CRUISE));
    assert_eq!(recommended(&session, CRUISE), 80.0);

    let report = session
        .apply(&CellSelection::Cells(vec![CRUISE]), &mut live)
        .unwrap();
    assert!(report.writes.is_empty());
    assert_eq!(
        report.skipped,
        vec![(CRUISE, SkipReason::Suppressed(SuppressReason::Locked))]
    );
    assert_eq!(live.get(CRUISE), Some(80.0));

    // Statistics kept accumulating while locked
    session.unlock_cells(&[CRUISE]).unwrap();
    session.tick().unwrap();
    assert!((recommended(&session, CRUISE) - 84.0).abs() < 1e-9);
}

#[test]
fn apply_writes_eligible_cells() {
    let (session, mut live) = start(AutoTuneConfig::default());
    feed_lean(&session, 0, 10);
    session.tick().unwrap();

    let report = session.apply(&CellSelection::AllEligible, &mut live).unwrap();
    assert_eq!(report.writes.len(), 1);
    assert_eq!(report.writes[0].cell, CRUISE);
    assert_eq!(report.writes[0].previous, 80.0);
    assert_eq!(report.apply_count, 1);
    assert!((live.get(CRUISE).unwrap() - 84.0).abs() < 1e-9);

    // Nothing left to apply
    let again = session.apply(&CellSelection::AllEligible, &mut live).unwrap();
    assert!(again.is_empty());
    assert_eq!(again.apply_count, 1);
}

#[test]
fn applied_cells_restart_against_new_value() {
    let (session, mut live) = start(AutoTuneConfig::default());
    feed_lean(&session, 0, 10);
    session.tick().unwrap();
    session.apply(&CellSelection::AllEligible, &mut live).unwrap();

    let rec = session.snapshot().get(CRUISE).unwrap().clone();
    assert_eq!(rec.hit_count, 0);
    assert_eq!(
        rec.status,
        RecommendationStatus::Suppressed(SuppressReason::InsufficientData)
    );
    assert_eq!(rec.beginning_value, 80.0);

    // Still 5% lean after the first correction
    feed_lean(&session, 1000, 10);
    session.tick().unwrap();
    assert!((recommended(&session, CRUISE) - 88.2).abs() < 1e-9);
}

#[test]
fn keeping_statistics_after_apply_does_not_double_correct() {
    let mut config = AutoTuneConfig::default();
    config.settings.clear_on_apply = false;
    let (session, mut live) = start(config);
    feed_lean(&session, 0, 10);
    session.tick().unwrap();
    session.apply(&CellSelection::AllEligible, &mut live).unwrap();

    session.tick().unwrap();
    assert!((recommended(&session, CRUISE) - 84.0).abs() < 1e-9);
    assert_eq!(session.cell_stats(CRUISE).unwrap().hits, 10);
}

#[test]
fn reset_rereads_baseline_and_keeps_locks() {
    let (session, mut live) = start(AutoTuneConfig::default());
    feed_lean(&session, 0, 10);
    session.lock_cells(&[CellRef::new(0, 0)]).unwrap();
    session.tick().unwrap();
    session.apply(&CellSelection::AllEligible, &mut live).unwrap();

    session.reset(None, &live).unwrap();

    let grid = session.snapshot();
    let rec = grid.get(CRUISE).unwrap();
    assert!((rec.beginning_value - 84.0).abs() < 1e-9);
    assert!((rec.recommended_value - 84.0).abs() < 1e-9);
    assert_eq!(rec.hit_count, 0);
    assert_eq!(session.cell_stats(CRUISE).map_or(0.0, |s| s.weight), 0.0);

    assert!(grid.get(CellRef::new(0, 0)).unwrap().locked);
    assert!(session.is_cell_locked(CellRef::new(0, 0)));
}

#[test]
fn partial_reset_leaves_other_cells() {
    let (session, live) = start(AutoTuneConfig::default());
    feed_lean(&session, 0, 10);
    for i in 0..10 {
        session.ingest(sample(1000 + i * 20, 1000.0, 30.0, 14.7 * 1.05));
    }
    session.tick().unwrap();

    session.reset(Some(&[CRUISE]), &live).unwrap();
    let grid = session.snapshot();
    assert_eq!(grid.get(CRUISE).unwrap().hit_count, 0);
    assert_eq!(grid.get(CellRef::new(0, 0)).unwrap().hit_count, 10);
}

#[test]
fn lambda_delay_attributes_to_earlier_operating_point() {
    let mut config = AutoTuneConfig::default();
    config.filters.lambda_delay_ms = 100;
    let (session, _) = start(config);

    // Nothing this old in history yet
    assert_eq!(
        session.ingest(sample(0, 2000.0, 60.0, 15.0)),
        SampleOutcome::Dropped(DropReason::InsufficientHistory)
    );
    for t in (10..100).step_by(10) {
        session.ingest(sample(t, 2000.0, 60.0, 15.0));
    }

    // AFR read at 100 ms belongs to the 2000 RPM point recorded at 0 ms
    let outcome = session.ingest(sample(100, 4000.0, 60.0, 15.0));
    let SampleOutcome::Accepted {
        attribution,
        operating_point,
        ..
    } = outcome
    else {
        panic!("expected accepted sample, got {outcome:?}");
    };
    assert_eq!(operating_point.timestamp_ms, 0);
    assert_eq!(attribution.primary(), CellRef::new(1, 1));

    for t in (110..=200).step_by(10) {
        session.ingest(sample(t, 4000.0, 60.0, 15.0));
    }
    assert!(session.cell_stats(CellRef::new(3, 1)).is_some());
    assert_eq!(
        session
            .ingest_stats()
            .dropped_for(DropReason::InsufficientHistory),
        10
    );
}

#[test]
fn history_gap_drops_sample() {
    let mut config = AutoTuneConfig::default();
    config.filters.lambda_delay_ms = 100;
    let (session, _) = start(config);

    session.ingest(sample(0, 3000.0, 60.0, 15.0));
    // Telemetry stalled; nothing recorded near 400 ms
    assert_eq!(
        session.ingest(sample(500, 3000.0, 60.0, 15.0)),
        SampleOutcome::Dropped(DropReason::HistoryGap)
    );
}

#[test]
fn bilinear_attribution_splits_weight() {
    let mut config = AutoTuneConfig::default();
    config.settings.attribution = AttributionPolicy::Bilinear;
    let (session, _) = start(config);

    let outcome = session.ingest(sample(0, 2500.0, 75.0, 15.0));
    let SampleOutcome::Accepted { attribution, .. } = outcome else {
        panic!("expected accepted sample, got {outcome:?}");
    };
    assert_eq!(attribution.cells().len(), 4);

    for cell in [
        CellRef::new(1, 1),
        CellRef::new(2, 1),
        CellRef::new(1, 2),
        CellRef::new(2, 2),
    ] {
        let stats = session.cell_stats(cell).unwrap();
        assert!((stats.weight - 0.25).abs() < 1e-9, "{cell}: {}", stats.weight);
    }
}

#[test]
fn fixed_target_replaces_sample_target() {
    let mut config = AutoTuneConfig::default();
    config.settings.target_afr = TargetAfrPolicy::Fixed(13.0);
    let (session, _) = start(config);

    let outcome = session.ingest(TelemetrySample {
        target_afr: None,
        ..sample(0, 3000.0, 60.0, 13.65)
    });
    let SampleOutcome::Accepted {
        fractional_error, ..
    } = outcome
    else {
        panic!("expected accepted sample, got {outcome:?}");
    };
    assert!((fractional_error - 0.05).abs() < 1e-9);
}

#[test]
fn custom_filter_rejects_samples() {
    let mut config = AutoTuneConfig::default();
    config.filters.custom_filter = Some("load < 100.0".to_string());
    let (session, _) = start(config);

    assert!(session.ingest(sample(0, 3000.0, 60.0, 15.0)).is_accepted());
    assert_eq!(
        session.ingest(sample(20, 3000.0, 110.0, 15.0)),
        SampleOutcome::Rejected(RejectReason::CustomFilter)
    );
}

#[test]
fn apply_waits_or_reports_conflict() {
    let (session, mut live) = start(AutoTuneConfig::default());
    feed_lean(&session, 0, 10);
    session.tick().unwrap();

    let busy = session.store().lock();
    let err = session
        .try_apply(&CellSelection::AllEligible, &mut live)
        .unwrap_err();
    assert!(matches!(
        err,
        AutoTuneError::ApplyConflict {
            retry_after_ms: 250
        }
    ));
    drop(busy);

    let report = session
        .try_apply(&CellSelection::AllEligible, &mut live)
        .unwrap();
    assert_eq!(report.writes.len(), 1);
}

#[test]
fn cells_outside_table_are_errors() {
    let (session, mut live) = start(AutoTuneConfig::default());
    let outside = CellRef::new(9, 0);

    assert!(matches!(
        session.lock_cells(&[outside]),
        Err(AutoTuneError::CellOutOfRange(_))
    ));
    assert!(matches!(
        session.apply(&CellSelection::Cells(vec![outside]), &mut live),
        Err(AutoTuneError::CellOutOfRange(_))
    ));
}

#[test]
fn start_rejects_non_finite_live_value() {
    let geometry = geometry();
    let mut live = TableValues::filled(&geometry, 80.0);
    live.set(CellRef::new(1, 1), f64::NAN).unwrap();

    assert!(matches!(
        AutoTuneSession::start(geometry, &live, AutoTuneConfig::default()),
        Err(AutoTuneError::NonFiniteValue(cell)) if cell == CellRef::new(1, 1)
    ));
}

#[test]
fn reset_with_non_finite_value_keeps_session_ticking() {
    let (session, mut live) = start(AutoTuneConfig::default());
    live.set(CellRef::new(1, 1), f64::NAN).unwrap();

    assert!(matches!(
        session.reset(None, &live),
        Err(AutoTuneError::NonFiniteValue(_))
    ));

    // Baselines are untouched, so a cell with hits still gets a recommendation
    for i in 0..10 {
        let outcome = session.ingest(sample(i * 20, 2000.0, 60.0, 14.7 * 1.05));
        assert!(outcome.is_accepted(), "sample {i} not accepted: {outcome:?}");
    }
    let grid = session.tick().unwrap();
    let rec = grid.get(CellRef::new(1, 1)).unwrap();
    assert_eq!(rec.beginning_value, 80.0);
    assert!((rec.recommended_value - 84.0).abs() < 1e-9);
}

#[test]
fn start_rejects_mismatched_live_table() {
    let geometry = geometry();
    let small = TableGeometry::new(vec![1000.0, 2000.0], vec![30.0, 60.0]).unwrap();
    let live = TableValues::filled(&small, 80.0);

    assert!(matches!(
        AutoTuneSession::start(geometry, &live, AutoTuneConfig::default()),
        Err(AutoTuneError::ShapeMismatch { .. })
    ));
}

#[test]
fn apply_is_allowed_after_stop() {
    let (session, mut live) = start(AutoTuneConfig::default());
    feed_lean(&session, 0, 10);
    session.tick().unwrap();
    session.stop();

    assert!(!session.is_running());
    let report = session.apply(&CellSelection::AllEligible, &mut live).unwrap();
    assert_eq!(report.writes.len(), 1);
}

#[test]
fn demo_engine_converges_to_its_fueling_error() {
    let mut config = AutoTuneConfig::default();
    config.filters.min_clt = 0.0;
    config.filters.min_rpm = 700.0;
    let (session, _) = start(config);

    let mut sim = DemoSimulator::with_seed(3);
    sim.set_afr_noise(0.0);
    sim.set_lean_fraction(0.06);

    for t in (0..30_000).step_by(20) {
        session.ingest(sim.update(t));
        if t % 500 == 0 {
            session.tick().unwrap();
        }
    }
    let grid = session.tick().unwrap();

    assert!(session.ingest_stats().accepted > 0);
    assert!(session.ingest_stats().rejected_total() > 0);

    let ready: Vec<_> = grid.eligible().collect();
    assert!(!ready.is_empty());
    for rec in ready {
        assert!(
            (rec.recommended_value - rec.beginning_value * 1.06).abs() < 1e-6,
            "cell {} recommended {}",
            rec.cell(),
            rec.recommended_value
        );
    }
}
