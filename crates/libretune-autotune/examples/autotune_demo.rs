//! AutoTune against the demo simulator
//!
//! Streams simulated telemetry through a session for a few seconds, then
//! applies the recommendations and prints the heat map.
//!
//! ```sh
//! RUST_LOG=libretune_autotune=debug cargo run --example autotune_demo -- 10
//! ```

use anyhow::{Context, Result};
use libretune_autotune::prelude::*;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const SAMPLE_PERIOD_MS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let seconds: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("duration must be whole seconds")?,
        None => 10,
    };

    let geometry = TableGeometry::new(
        vec![500.0, 1000.0, 1500.0, 2000.0, 2500.0, 3000.0, 3500.0, 4000.0],
        vec![20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 100.0],
    )?;
    let mut live = TableValues::filled(&geometry, 60.0);

    let mut config = AutoTuneConfig::default();
    // The simulated engine starts cold and idles below the default window
    config.filters.min_clt = 0.0;
    config.filters.min_rpm = 700.0;
    config.filters.lambda_delay_curve = Some(LambdaDelayCurve::default());

    let session = AutoTuneSession::start(geometry, &live, config)?;
    let (tx, rx) = mpsc::channel(256);
    let ingest = session.spawn_ingest_loop(rx);
    let updates = session.spawn_update_loop();

    let mut sim = DemoSimulator::with_seed(0x5eed);
    sim.set_lean_fraction(0.06);

    let mut ticker = tokio::time::interval(Duration::from_millis(SAMPLE_PERIOD_MS));
    let total_ms = seconds * 1000;
    let mut elapsed_ms = 0;
    while elapsed_ms < total_ms {
        ticker.tick().await;
        if tx.send(sim.update(elapsed_ms)).await.is_err() {
            break;
        }
        elapsed_ms += SAMPLE_PERIOD_MS;
    }
    drop(tx);
    ingest.await?;

    // One last tick so the final samples are reflected before stopping
    session.tick()?;
    session.stop();
    updates.await?;

    let stats = session.ingest_stats();
    println!(
        "accepted {} samples, filtered {}",
        stats.accepted,
        stats.rejected_total()
    );
    for (reason, count) in stats.rejected.iter().filter(|(_, n)| *n > 0) {
        println!("  {reason}: {count}");
    }

    for entry in session.heatmap().iter().filter(|e| e.hit_count > 0) {
        println!(
            "cell ({}, {}) hits {:>4} weight {:>7.2} {:>6.2} -> {:>6.2} ({:+.1}%) {:?}",
            entry.cell_x,
            entry.cell_y,
            entry.hit_count,
            entry.hit_weighting,
            entry.beginning_value,
            entry.recommended_value,
            entry.change_percent,
            entry.confidence
        );
    }

    let report = session.apply(&CellSelection::AllEligible, &mut live)?;
    println!("applied {} cells", report.writes.len());

    Ok(())
}
