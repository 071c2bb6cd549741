//! Demo Mode - Simulated telemetry for AutoTune
//!
//! Generates engine telemetry without a real ECU connection. The simulated
//! engine idles at ~850 RPM with random throttle blips, and its fueling is off
//! by a configurable fraction so AutoTune has something to correct.

use crate::telemetry::TelemetrySample;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

/// Demo ECU simulator that generates telemetry samples
pub struct DemoSimulator {
    /// Time when simulation started (ms)
    start_time_ms: Option<u64>,
    /// Last update time (ms)
    last_update_ms: Option<u64>,
    /// Time of next throttle blip (ms from start)
    next_blip_at_ms: u64,
    /// Current blip state
    blip_state: BlipState,
    /// Current RPM (smoothed)
    current_rpm: f64,
    /// Target RPM for current blip
    blip_target_rpm: f64,
    /// Fueling error: positive runs lean
    lean_fraction: f64,
    /// Peak-to-peak wideband noise in AFR
    afr_noise: f64,
    rng: StdRng,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlipState {
    /// Engine idling normally
    Idle,
    /// Throttle opening, RPM rising
    RampUp { start_ms: u64 },
    /// At peak RPM, holding
    Hold { start_ms: u64 },
    /// Throttle closing, RPM falling
    RampDown { start_ms: u64 },
}

const IDLE_RPM: f64 = 850.0;
const RAMP_UP_MS: u64 = 300;
const HOLD_MS: u64 = 2000;
const RAMP_DOWN_MS: u64 = 800;

impl Default for DemoSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoSimulator {
    /// Create a simulator with a random seed
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Create a reproducible simulator
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(mut rng: StdRng) -> Self {
        let first_blip = rng.gen_range(1000..3000);

        Self {
            start_time_ms: None,
            last_update_ms: None,
            next_blip_at_ms: first_blip,
            blip_state: BlipState::Idle,
            current_rpm: IDLE_RPM,
            blip_target_rpm: 0.0,
            lean_fraction: 0.05,
            afr_noise: 0.2,
            rng,
        }
    }

    /// Set how far off the simulated fueling is (0.05 = 5% lean)
    pub fn set_lean_fraction(&mut self, fraction: f64) {
        self.lean_fraction = fraction;
    }

    /// Set peak-to-peak AFR noise
    pub fn set_afr_noise(&mut self, noise: f64) {
        self.afr_noise = noise.max(0.0);
    }

    /// Advance the simulation and produce the sample for `elapsed_ms`
    pub fn update(&mut self, elapsed_ms: u64) -> TelemetrySample {
        let start = *self.start_time_ms.get_or_insert(elapsed_ms);
        let sim_time = elapsed_ms.saturating_sub(start);
        let delta_ms = self
            .last_update_ms
            .map_or(0, |last| elapsed_ms.saturating_sub(last));
        self.last_update_ms = Some(elapsed_ms);

        self.update_blip_state(sim_time);

        // Smooth RPM changes
        let target_rpm = self.calculate_target_rpm(sim_time);
        let rpm_rate = if target_rpm > self.current_rpm { 8000.0 } else { 3000.0 }; // RPM/sec
        let max_change = rpm_rate * (delta_ms as f64 / 1000.0);
        self.current_rpm += (target_rpm - self.current_rpm).clamp(-max_change, max_change);

        // Add idle wobble
        let t = sim_time as f64 / 1000.0;
        let idle_wobble = if matches!(self.blip_state, BlipState::Idle) {
            20.0 * (t * 2.5).sin() + 10.0 * (t * 7.3).sin()
        } else {
            0.0
        };
        let rpm = (self.current_rpm + idle_wobble).max(0.0);

        let progress = if self.blip_target_rpm > IDLE_RPM {
            ((self.current_rpm - IDLE_RPM) / (self.blip_target_rpm - IDLE_RPM)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let tps = match self.blip_state {
            BlipState::Idle => 1.5 + 1.0 * (t * 0.3).sin().abs(),
            BlipState::RampUp { .. } => 2.0 + progress * 45.0,
            BlipState::Hold { .. } => 45.0 + 0.5 * (t * 3.0).sin(),
            BlipState::RampDown { .. } => 2.0 + progress * 40.0,
        }
        .clamp(0.0, 100.0);

        // MAP rises with RPM under load
        let map = if rpm < 1000.0 {
            35.0 + 10.0 * (1.0 - rpm / 1000.0)
        } else {
            25.0 + (rpm / 100.0)
        }
        .clamp(20.0, 105.0);

        let target_afr = if rpm < 1500.0 { 14.7 } else { 13.5 };
        let noise = if self.afr_noise > 0.0 {
            self.rng.gen_range(-0.5..0.5) * self.afr_noise
        } else {
            0.0
        };
        let afr = target_afr * (1.0 + self.lean_fraction) + noise;

        // Coolant warming up over time (°F)
        let clt = 68.0 + 126.0 * (1.0 - (-t / 120.0).exp());

        let accel_enrich = matches!(self.blip_state, BlipState::RampUp { .. });

        TelemetrySample {
            timestamp_ms: elapsed_ms,
            rpm,
            load: map,
            clt,
            tps,
            tps_rate: None,
            afr,
            target_afr: Some(target_afr),
            accel_enrich_active: Some(accel_enrich),
        }
    }

    /// Update the blip state machine
    fn update_blip_state(&mut self, sim_time: u64) {
        match self.blip_state {
            BlipState::Idle => {
                if sim_time >= self.next_blip_at_ms {
                    self.blip_target_rpm = self.rng.gen_range(2000.0..4000.0);
                    self.blip_state = BlipState::RampUp { start_ms: sim_time };
                }
            }
            BlipState::RampUp { start_ms } => {
                if sim_time >= start_ms + RAMP_UP_MS {
                    self.blip_state = BlipState::Hold { start_ms: sim_time };
                }
            }
            BlipState::Hold { start_ms } => {
                if sim_time >= start_ms + HOLD_MS {
                    self.blip_state = BlipState::RampDown { start_ms: sim_time };
                }
            }
            BlipState::RampDown { start_ms } => {
                if sim_time >= start_ms + RAMP_DOWN_MS {
                    // Back to idle, schedule next blip
                    self.blip_state = BlipState::Idle;
                    let next_interval = self.rng.gen_range(1000..3000);
                    self.next_blip_at_ms = sim_time + next_interval;
                }
            }
        }
    }

    /// Calculate target RPM based on current blip state
    fn calculate_target_rpm(&self, sim_time: u64) -> f64 {
        match self.blip_state {
            BlipState::Idle => IDLE_RPM,
            BlipState::RampUp { start_ms } => {
                let progress = ((sim_time - start_ms) as f64 / RAMP_UP_MS as f64).min(1.0);
                IDLE_RPM + (self.blip_target_rpm - IDLE_RPM) * progress
            }
            BlipState::Hold { .. } => self.blip_target_rpm,
            BlipState::RampDown { start_ms } => {
                let progress = ((sim_time - start_ms) as f64 / RAMP_DOWN_MS as f64).min(1.0);
                self.blip_target_rpm + (IDLE_RPM - self.blip_target_rpm) * progress
            }
        }
    }
}
