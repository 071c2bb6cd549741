use libretune_autotune::prelude::*;
use pretty_assertions::assert_eq;

#[test]
fn settings_round_trip_through_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nested").join("autotune.json");

    let mut config = AutoTuneConfig::default();
    config.settings.target_table = "veTable2".to_string();
    config.settings.attribution = AttributionPolicy::Bilinear;
    config.settings.target_afr = TargetAfrPolicy::Fixed(13.2);
    config.filters.min_clt = 150.0;
    config.filters.lambda_delay_curve = Some(LambdaDelayCurve::default());
    config.filters.custom_filter = Some("tps > 5".to_string());
    config.authority.absolute_max_percent = 15.0;

    config.save(&path)?;
    let loaded = AutoTuneConfig::load(&path)?;
    assert_eq!(loaded, config);
    Ok(())
}

#[test]
fn partial_settings_fill_in_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("autotune.json");
    std::fs::write(
        &path,
        r#"{ "filters": { "min_rpm": 1500 }, "authority": { "max_increase_percent": 5 } }"#,
    )?;

    let loaded = AutoTuneConfig::load(&path)?;
    assert_eq!(loaded.filters.min_rpm, 1500.0);
    assert_eq!(loaded.filters.max_rpm, 7000.0);
    assert_eq!(loaded.authority.max_increase_percent, 5.0);
    assert_eq!(loaded.authority.absolute_max_percent, 20.0);
    assert_eq!(loaded.settings, AutoTuneSettings::default());
    Ok(())
}

#[test]
fn invalid_settings_file_is_refused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("autotune.json");
    std::fs::write(&path, r#"{ "filters": { "min_rpm": 5000, "max_rpm": 2000 } }"#)?;

    match AutoTuneConfig::load(&path) {
        Err(AutoTuneError::ConfigInvalid { field, .. }) => assert_eq!(field, "filters.max_rpm"),
        other => panic!("expected invalid config, got {other:?}"),
    }
    Ok(())
}

#[test]
fn unreadable_settings_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        AutoTuneConfig::load(dir.path().join("missing.json")),
        Err(AutoTuneError::IoError(_))
    ));

    let garbled = dir.path().join("garbled.json");
    std::fs::write(&garbled, "{ not json").unwrap();
    assert!(matches!(
        AutoTuneConfig::load(&garbled),
        Err(AutoTuneError::JsonError(_))
    ));
}

#[test]
fn session_refuses_invalid_authority() {
    let geometry = TableGeometry::new(vec![1000.0, 2000.0], vec![30.0, 60.0]).unwrap();
    let live = TableValues::filled(&geometry, 80.0);

    let mut config = AutoTuneConfig::default();
    config.authority.max_increase_percent = 0.0;
    assert!(matches!(
        AutoTuneSession::start(geometry, &live, config),
        Err(AutoTuneError::ConfigInvalid { .. })
    ));
}

#[test]
fn geometry_must_be_increasing() {
    assert!(matches!(
        TableGeometry::new(vec![1000.0, 1000.0], vec![30.0]),
        Err(AutoTuneError::GeometryInvalid(_))
    ));
    assert!(matches!(
        TableGeometry::new(vec![], vec![30.0]),
        Err(AutoTuneError::GeometryInvalid(_))
    ));
}
