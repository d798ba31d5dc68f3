//! JSON run configuration: the scripted world and sensor set a run executes.
//!
//! Scenario XOSC parsing belongs to the external interpreter; the runner
//! consumes a plain JSON description of spawned entities with constant
//! velocities, enough to drive the core closed-loop.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use simcore::{DetectionSensorConfig, EntityClassification, EntityKind, Vec3};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read run configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse run configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_path_to_error::Error<serde_json::Error>,
    },
    #[error("ticks must be at least 1")]
    NoTicks,
    #[error("frame_rate must be positive, got {0}")]
    NonPositiveFrameRate(f64),
    #[error("realtime_factor must be positive, got {0}")]
    NonPositiveRealtimeFactor(f64),
    #[error("duplicate entity name in run configuration: {0:?}")]
    DuplicateEntity(String),
    #[error("sensor is attached to {entity:?}, which is not a configured ego entity")]
    SensorOwnerNotEgo { entity: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedEntity {
    pub name: String,
    pub kind: EntityKind,
    pub classification: EntityClassification,
    pub spawn_position: Vec3,
    #[serde(default)]
    pub velocity: Vec3,
    #[serde(default)]
    pub bounding_center: Vec3,
    #[serde(default = "default_dimensions")]
    pub dimensions: Vec3,
}

fn default_dimensions() -> Vec3 {
    // Compact-car footprint.
    Vec3::new(4.0, 1.8, 1.5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Scenario base path, recorded in the scope's global environment.
    pub scenario_path: PathBuf,
    pub ticks: u32,
    pub frame_rate: f64,
    #[serde(default = "default_realtime_factor")]
    pub realtime_factor: f64,
    #[serde(default = "default_use_sim_time")]
    pub use_sim_time: bool,
    pub entities: Vec<ScriptedEntity>,
    #[serde(default)]
    pub sensors: Vec<DetectionSensorConfig>,
}

fn default_realtime_factor() -> f64 {
    1.0
}

fn default_use_sim_time() -> bool {
    true
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticks == 0 {
            return Err(ConfigError::NoTicks);
        }
        if self.frame_rate <= 0.0 {
            return Err(ConfigError::NonPositiveFrameRate(self.frame_rate));
        }
        if self.realtime_factor <= 0.0 {
            return Err(ConfigError::NonPositiveRealtimeFactor(self.realtime_factor));
        }
        let mut seen = HashSet::new();
        for entity in &self.entities {
            if !seen.insert(entity.name.as_str()) {
                return Err(ConfigError::DuplicateEntity(entity.name.clone()));
            }
        }
        for sensor in &self.sensors {
            let owner_is_ego = self.entities.iter().any(|entity| {
                entity.name == sensor.entity_name && entity.kind == EntityKind::Ego
            });
            if !owner_is_ego {
                return Err(ConfigError::SensorOwnerNotEgo {
                    entity: sensor.entity_name.clone(),
                });
            }
        }
        Ok(())
    }
}

pub fn load_run_config(path: &Path) -> Result<RunConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut deserializer = serde_json::Deserializer::from_str(&text);
    let config: RunConfig =
        serde_path_to_error::deserialize(&mut deserializer).map_err(|source| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
    config.validate()?;
    Ok(config)
}
