//! Simulation clock: the single notion of "now" every other subsystem reads.
//!
//! The driving host calls [`SimulationClock::update`] exactly once per tick,
//! before anything else reads the current time for that tick. `start` marks
//! the point where scenario logic begins running; it may be called at most
//! once per clock instance.

use std::time::{Duration, SystemTime};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error(
        "simulation clock is already started; check that the clock instance \
         was not reused across runs"
    )]
    AlreadyStarted,
}

#[derive(Debug, Clone)]
pub struct SimulationClock {
    use_raw_clock: bool,
    realtime_factor: f64,
    frame_rate: f64,
    simulation_time: f64,
    time_offset: f64,
    started: bool,
    time_on_initialize: SystemTime,
}

impl SimulationClock {
    /// `use_sim_time = false` keeps reported timestamps synced to the wall
    /// clock; `true` derives them from accumulated simulation time instead.
    /// The two modes must never be mixed within one run.
    pub fn new(use_sim_time: bool, realtime_factor: f64, frame_rate: f64) -> Self {
        Self {
            use_raw_clock: !use_sim_time,
            realtime_factor,
            frame_rate,
            simulation_time: 0.0,
            time_offset: 0.0,
            started: false,
            time_on_initialize: SystemTime::now(),
        }
    }

    /// Advance simulated time by one tick. Legal before `start`, but scenario
    /// time is not reported as running until `start` has been called.
    pub fn update(&mut self) {
        self.simulation_time += self.realtime_factor / self.frame_rate;
    }

    pub fn start(&mut self) -> Result<(), ClockError> {
        if self.started {
            return Err(ClockError::AlreadyStarted);
        }
        self.time_offset = self.simulation_time;
        self.started = true;
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Simulated seconds added per `update` call.
    pub fn step_duration(&self) -> f64 {
        self.realtime_factor / self.frame_rate
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    /// Raw accumulated simulation time since construction.
    pub fn current_simulation_time(&self) -> f64 {
        self.simulation_time
    }

    /// Seconds since `start`, or `None` while the clock has not been started.
    pub fn current_scenario_time(&self) -> Option<f64> {
        self.started
            .then(|| self.simulation_time - self.time_offset)
    }

    /// Wall-clock-comparable timestamp for the current tick.
    pub fn current_time(&self) -> SystemTime {
        if self.use_raw_clock {
            SystemTime::now()
        } else {
            self.time_on_initialize + Duration::from_secs_f64(self.simulation_time)
        }
    }
}
