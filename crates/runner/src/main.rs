use std::env;
use std::path::Path;
use std::process::ExitCode;

use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod driver;

use config::{load_run_config, ConfigError};
use driver::{DriverError, RunSummary, ScenarioDriver};

#[derive(Debug, Error)]
enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

fn run(config_path: &Path) -> Result<RunSummary, RunnerError> {
    let config = load_run_config(config_path)?;
    info!(
        path = %config_path.display(),
        ticks = config.ticks,
        entities = config.entities.len(),
        sensors = config.sensors.len(),
        "run configuration loaded"
    );
    let mut driver = ScenarioDriver::new(&config)?;
    Ok(driver.run()?)
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let Some(config_path) = env::args().nth(1) else {
        error!("usage: scenario-runner <run-config.json>");
        return ExitCode::FAILURE;
    };

    match run(Path::new(&config_path)) {
        Ok(summary) => {
            info!(
                ticks = summary.ticks,
                detections = summary.detection_messages,
                ground_truth = summary.ground_truth_messages,
                scenario_time = summary.final_scenario_time,
                "run complete"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
