//! Detection sensor: turns ground-truth snapshots into delayed, lossy, noisy
//! perception messages.
//!
//! Each tick the host hands in the current simulation time and the full
//! world snapshot. Output is throttled to the configured update period; fresh
//! messages pass through two independent FIFO delay queues (detections and
//! ground truth), and only the detections channel is degraded by per-object
//! Bernoulli loss and Gaussian position noise. All sampling is seeded, so a
//! given configuration reproduces the same degraded stream run after run.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::trace;

use crate::world::{BoundingBox, EntityClassification, EntityKind, EntityStatus, Pose, Twist};

/// Slack absorbing tick-rate jitter when deciding whether an update period
/// has elapsed.
const UPDATE_PERIOD_TOLERANCE: f64 = 0.002;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error(
        "detection sensor can be attached only to an ego entity; {entity:?} \
         is missing from the world snapshot or is not ego"
    )]
    NotAttachedToEgo { entity: String },
    #[error(
        "candidate entity {entity:?} reported by the external detection model \
         is not present in the world snapshot"
    )]
    UnknownCandidate { entity: String },
    #[error("invalid configuration for detection sensor on {entity:?}: {reason}")]
    InvalidConfiguration { entity: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSensorConfig {
    /// Name of the (ego) entity the sensor is mounted on.
    pub entity_name: String,
    /// Detection range in meters, inclusive.
    pub range: f64,
    /// Seconds between output recomputations.
    pub update_period: f64,
    /// Standard deviation of the Gaussian noise added to detected x/y
    /// positions.
    pub position_noise_stddev: f64,
    /// Per-object probability that a detection is dropped from the output.
    pub probability_of_lost: f64,
    /// Latency of the detections channel, in seconds.
    pub object_recognition_delay: f64,
    /// Latency of the ground-truth channel, in seconds.
    pub object_recognition_ground_truth_delay: f64,
    /// `true`: detect every entity within `range`. `false`: consume the
    /// externally computed candidate list (e.g. from a ray-cast lidar model)
    /// instead, still filtered against `range`.
    pub detect_all_objects_in_range: bool,
    /// Seed for the loss/noise RNG stream.
    pub random_seed: u64,
}

impl Default for DetectionSensorConfig {
    fn default() -> Self {
        Self {
            entity_name: String::new(),
            range: 300.0,
            update_period: 0.1,
            position_noise_stddev: 0.0,
            probability_of_lost: 0.0,
            object_recognition_delay: 0.0,
            object_recognition_ground_truth_delay: 0.0,
            detect_all_objects_in_range: true,
            random_seed: 0,
        }
    }
}

/// Stable 16-byte identifier derived from the entity name, so one entity
/// keeps one id across the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 16]);

impl ObjectId {
    pub fn from_entity_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectClassification {
    pub label: EntityClassification,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseWithCovariance {
    pub pose: Pose,
    /// Row-major 6x6 covariance over (x, y, z, roll, pitch, yaw).
    pub covariance: [[f64; 6]; 6],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwistWithCovariance {
    pub twist: Twist,
    pub covariance: [[f64; 6]; 6],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub object_id: ObjectId,
    pub classification: ObjectClassification,
    pub pose: PoseWithCovariance,
    pub twist: TwistWithCovariance,
    pub shape: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub object_id: ObjectId,
    pub classification: ObjectClassification,
    pub pose: PoseWithCovariance,
    pub twist: TwistWithCovariance,
    pub shape: BoundingBox,
}

/// Detections channel message: what the perception stack under test sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObjects {
    /// Simulation time at which the message was produced.
    pub stamp: f64,
    pub objects: Vec<DetectedObject>,
}

/// Ground-truth channel message: same candidate set, undegraded content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObjects {
    pub stamp: f64,
    pub objects: Vec<TrackedObject>,
}

/// Per-tick pipeline output. A channel is `None` when its delay queue had
/// nothing due this tick (including throttled no-op ticks).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorOutput {
    pub detections: Option<DetectedObjects>,
    pub ground_truth: Option<TrackedObjects>,
}

#[derive(Debug)]
pub struct DetectionSensor {
    config: DetectionSensorConfig,
    previous_update_time: f64,
    detections_queue: VecDeque<(DetectedObjects, f64)>,
    ground_truth_queue: VecDeque<(TrackedObjects, f64)>,
    rng: Pcg32,
}

impl DetectionSensor {
    pub fn new(config: DetectionSensorConfig) -> Result<Self, SensorError> {
        let invalid = |reason: &str| SensorError::InvalidConfiguration {
            entity: config.entity_name.clone(),
            reason: reason.to_string(),
        };
        if !(0.0..=1.0).contains(&config.probability_of_lost) {
            return Err(invalid("probability_of_lost must be within [0, 1]"));
        }
        if config.update_period <= 0.0 {
            return Err(invalid("update_period must be positive"));
        }
        if config.range < 0.0 {
            return Err(invalid("range must be non-negative"));
        }
        if config.position_noise_stddev < 0.0 {
            return Err(invalid("position_noise_stddev must be non-negative"));
        }
        if config.object_recognition_delay < 0.0
            || config.object_recognition_ground_truth_delay < 0.0
        {
            return Err(invalid("delays must be non-negative"));
        }
        let rng = Pcg32::seed_from_u64(config.random_seed);
        Ok(Self {
            config,
            previous_update_time: f64::NEG_INFINITY,
            detections_queue: VecDeque::new(),
            ground_truth_queue: VecDeque::new(),
            rng,
        })
    }

    pub fn config(&self) -> &DetectionSensorConfig {
        &self.config
    }

    /// One tick of the pipeline. `externally_detected` is consulted only when
    /// `detect_all_objects_in_range` is off.
    pub fn update(
        &mut self,
        current_simulation_time: f64,
        statuses: &[EntityStatus],
        externally_detected: &[String],
    ) -> Result<SensorOutput, SensorError> {
        if current_simulation_time - self.previous_update_time - self.config.update_period
            < -UPDATE_PERIOD_TOLERANCE
        {
            trace!(
                sensor = %self.config.entity_name,
                time = current_simulation_time,
                "update period not yet elapsed"
            );
            return Ok(SensorOutput::default());
        }

        let sensor_pose = self.sensor_pose(statuses)?;
        let candidates =
            self.select_candidates(statuses, externally_detected, &sensor_pose)?;
        self.previous_update_time = current_simulation_time;

        let mut detections = DetectedObjects {
            stamp: current_simulation_time,
            objects: Vec::with_capacity(candidates.len()),
        };
        let mut ground_truth = TrackedObjects {
            stamp: current_simulation_time,
            objects: Vec::with_capacity(candidates.len()),
        };
        for status in &candidates {
            // Ego entities never show up in perception output, the sensor's
            // own carrier included.
            if status.kind == EntityKind::Ego {
                continue;
            }
            let detected = make_detected_object(status);
            ground_truth.objects.push(make_tracked_object(&detected));
            detections.objects.push(detected);
        }

        self.detections_queue
            .push_back((detections, current_simulation_time));
        self.ground_truth_queue
            .push_back((ground_truth, current_simulation_time));

        let delayed_detections = pop_due(
            &mut self.detections_queue,
            current_simulation_time,
            self.config.object_recognition_delay,
        );
        let delayed_ground_truth = pop_due(
            &mut self.ground_truth_queue,
            current_simulation_time,
            self.config.object_recognition_ground_truth_delay,
        );

        Ok(SensorOutput {
            detections: delayed_detections.map(|message| self.degrade(message)),
            ground_truth: delayed_ground_truth,
        })
    }

    /// The pose of the owning entity, which must be present and ego.
    fn sensor_pose(&self, statuses: &[EntityStatus]) -> Result<Pose, SensorError> {
        statuses
            .iter()
            .find(|status| {
                status.kind == EntityKind::Ego && status.name == self.config.entity_name
            })
            .map(|status| status.pose)
            .ok_or_else(|| SensorError::NotAttachedToEgo {
                entity: self.config.entity_name.clone(),
            })
    }

    fn select_candidates<'a>(
        &self,
        statuses: &'a [EntityStatus],
        externally_detected: &[String],
        sensor_pose: &Pose,
    ) -> Result<Vec<&'a EntityStatus>, SensorError> {
        let in_range = |status: &EntityStatus| {
            status.pose.position.distance_to(sensor_pose.position) <= self.config.range
        };
        if self.config.detect_all_objects_in_range {
            Ok(statuses
                .iter()
                .filter(|status| status.name != self.config.entity_name && in_range(status))
                .collect())
        } else {
            let mut candidates = Vec::with_capacity(externally_detected.len());
            for name in externally_detected {
                let status = statuses
                    .iter()
                    .find(|status| &status.name == name)
                    .ok_or_else(|| SensorError::UnknownCandidate {
                        entity: name.clone(),
                    })?;
                if status.name != self.config.entity_name && in_range(status) {
                    candidates.push(status);
                }
            }
            Ok(candidates)
        }
    }

    /// Per-object loss then position noise, detections channel only.
    fn degrade(&mut self, message: DetectedObjects) -> DetectedObjects {
        let mut degraded = DetectedObjects {
            stamp: message.stamp,
            objects: Vec::with_capacity(message.objects.len()),
        };
        for mut object in message.objects {
            // Survives with probability 1 - probability_of_lost; the >=
            // comparison keeps both endpoints exact (0.0 never drops, 1.0
            // always drops).
            if self.rng.random::<f64>() >= self.config.probability_of_lost {
                let stddev = self.config.position_noise_stddev;
                object.pose.pose.position.x += gaussian(&mut self.rng) * stddev;
                object.pose.pose.position.y += gaussian(&mut self.rng) * stddev;
                degraded.objects.push(object);
            }
        }
        degraded
    }
}

/// Pop the queue front if its message has aged past `delay`.
fn pop_due<T>(queue: &mut VecDeque<(T, f64)>, current_time: f64, delay: f64) -> Option<T> {
    let due = queue
        .front()
        .is_some_and(|(_, stamp)| current_time - stamp >= delay);
    due.then(|| queue.pop_front())
        .flatten()
        .map(|(message, _)| message)
}

/// Standard normal sample via Box-Muller over the uniform source.
fn gaussian(rng: &mut Pcg32) -> f64 {
    let u1 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

fn identity_covariance() -> [[f64; 6]; 6] {
    let mut covariance = [[0.0; 6]; 6];
    for (row, entries) in covariance.iter_mut().enumerate() {
        entries[row] = 1.0;
    }
    covariance
}

fn make_detected_object(status: &EntityStatus) -> DetectedObject {
    // Report the bounding-box center, not the entity origin: shift the pose
    // by the box-center offset rotated into the world frame.
    let center_offset = status.pose.orientation.rotate(status.bounding_box.center);
    let pose = Pose {
        position: status.pose.position.add(center_offset),
        orientation: status.pose.orientation,
    };
    DetectedObject {
        object_id: ObjectId::from_entity_name(&status.name),
        classification: ObjectClassification {
            label: status.classification,
            probability: 1.0,
        },
        pose: PoseWithCovariance {
            pose,
            covariance: identity_covariance(),
        },
        twist: TwistWithCovariance {
            twist: status.twist,
            covariance: identity_covariance(),
        },
        shape: status.bounding_box,
    }
}

fn make_tracked_object(detected: &DetectedObject) -> TrackedObject {
    TrackedObject {
        object_id: detected.object_id,
        classification: detected.classification,
        pose: detected.pose.clone(),
        twist: detected.twist.clone(),
        shape: detected.shape,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{EntityClassification, Vec3};

    fn ego(name: &str, position: Vec3) -> EntityStatus {
        EntityStatus {
            name: name.to_string(),
            kind: EntityKind::Ego,
            classification: EntityClassification::Car,
            pose: Pose {
                position,
                ..Pose::default()
            },
            twist: Twist::default(),
            bounding_box: BoundingBox::default(),
        }
    }

    fn car(name: &str, position: Vec3) -> EntityStatus {
        EntityStatus {
            name: name.to_string(),
            kind: EntityKind::Vehicle,
            classification: EntityClassification::Car,
            pose: Pose {
                position,
                ..Pose::default()
            },
            twist: Twist::default(),
            bounding_box: BoundingBox::default(),
        }
    }

    fn sensor(config: DetectionSensorConfig) -> DetectionSensor {
        DetectionSensor::new(config).unwrap()
    }

    fn base_config() -> DetectionSensorConfig {
        DetectionSensorConfig {
            entity_name: "ego".to_string(),
            ..DetectionSensorConfig::default()
        }
    }

    fn one_car_snapshot() -> Vec<EntityStatus> {
        vec![
            ego("ego", Vec3::ZERO),
            car("npc1", Vec3::new(10.0, 0.0, 0.0)),
        ]
    }

    #[test]
    fn throttles_to_the_update_period() {
        let mut sensor = sensor(DetectionSensorConfig {
            update_period: 0.1,
            ..base_config()
        });
        let snapshot = one_car_snapshot();

        let mut emitted_at = Vec::new();
        for tick in 0..=10 {
            let time = tick as f64 * 0.02;
            let output = sensor.update(time, &snapshot, &[]).unwrap();
            if output.detections.is_some() {
                emitted_at.push(tick);
            }
        }
        // Ticks every 0.02s against a 0.1s period: the first tick fires, then
        // roughly every fifth one.
        assert_eq!(emitted_at, vec![0, 5, 10]);
    }

    #[test]
    fn delayed_channel_stays_empty_until_the_delay_elapses() {
        let mut sensor = sensor(DetectionSensorConfig {
            update_period: 0.1,
            object_recognition_delay: 0.3,
            ..base_config()
        });
        let snapshot = one_car_snapshot();

        let mut first_output_time = None;
        for tick in 0..=6 {
            let time = tick as f64 * 0.1;
            let output = sensor.update(time, &snapshot, &[]).unwrap();
            if let Some(detections) = output.detections {
                first_output_time.get_or_insert(time);
                assert_eq!(detections.objects.len(), 1);
                // The popped message is older than "now" by the delay.
                assert!(time - detections.stamp >= 0.3);
            }
        }
        let first_output_time = first_output_time.expect("delay elapsed within the run");
        assert!((first_output_time - 0.3).abs() < 1e-9);
    }

    #[test]
    fn detection_and_ground_truth_delays_are_independent() {
        let mut sensor = sensor(DetectionSensorConfig {
            update_period: 0.1,
            object_recognition_delay: 0.2,
            object_recognition_ground_truth_delay: 0.0,
            ..base_config()
        });
        let snapshot = one_car_snapshot();

        let output = sensor.update(0.0, &snapshot, &[]).unwrap();
        assert!(output.detections.is_none());
        assert!(output.ground_truth.is_some());

        sensor.update(0.1, &snapshot, &[]).unwrap();
        let output = sensor.update(0.2, &snapshot, &[]).unwrap();
        let detections = output.detections.expect("0.2s of backlog is due now");
        assert!((detections.stamp - 0.0).abs() < 1e-9);
    }

    #[test]
    fn probability_of_lost_one_drops_everything() {
        let mut sensor = sensor(DetectionSensorConfig {
            probability_of_lost: 1.0,
            ..base_config()
        });
        let snapshot = one_car_snapshot();
        for tick in 0..5 {
            let output = sensor.update(tick as f64 * 0.1, &snapshot, &[]).unwrap();
            let detections = output.detections.expect("zero delay");
            assert!(detections.objects.is_empty());
            // Loss never touches the ground-truth channel.
            assert_eq!(output.ground_truth.unwrap().objects.len(), 1);
        }
    }

    #[test]
    fn probability_of_lost_zero_drops_nothing() {
        let mut sensor = sensor(DetectionSensorConfig {
            probability_of_lost: 0.0,
            position_noise_stddev: 0.5,
            ..base_config()
        });
        let snapshot = one_car_snapshot();
        for tick in 0..5 {
            let output = sensor.update(tick as f64 * 0.1, &snapshot, &[]).unwrap();
            assert_eq!(output.detections.unwrap().objects.len(), 1);
        }
    }

    #[test]
    fn noise_perturbs_xy_only_and_is_seed_deterministic() {
        let config = DetectionSensorConfig {
            position_noise_stddev: 0.5,
            random_seed: 7,
            ..base_config()
        };
        let snapshot = one_car_snapshot();

        let mut first = sensor(config.clone());
        let mut second = sensor(config);
        let a = first.update(0.0, &snapshot, &[]).unwrap();
        let b = second.update(0.0, &snapshot, &[]).unwrap();
        assert_eq!(a.detections, b.detections);

        let detections = a.detections.unwrap();
        let truths = a.ground_truth.unwrap();
        let object = &detections.objects[0];
        let truth = &truths.objects[0];
        assert_ne!(object.pose.pose.position.x, truth.pose.pose.position.x);
        assert_ne!(object.pose.pose.position.y, truth.pose.pose.position.y);
        assert_eq!(object.pose.pose.position.z, truth.pose.pose.position.z);
    }

    #[test]
    fn range_boundary_is_inclusive() {
        let mut sensor = sensor(DetectionSensorConfig {
            range: 10.0,
            ..base_config()
        });
        let snapshot = vec![
            ego("ego", Vec3::ZERO),
            car("at_range", Vec3::new(10.0, 0.0, 0.0)),
            car("past_range", Vec3::new(10.0 + 1e-6, 0.0, 0.0)),
        ];
        let output = sensor.update(0.0, &snapshot, &[]).unwrap();
        let objects = output.ground_truth.unwrap().objects;
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].object_id, ObjectId::from_entity_name("at_range"));
    }

    #[test]
    fn external_candidate_list_is_range_filtered_and_owner_excluded() {
        let mut sensor = sensor(DetectionSensorConfig {
            range: 50.0,
            detect_all_objects_in_range: false,
            ..base_config()
        });
        let snapshot = vec![
            ego("ego", Vec3::ZERO),
            car("near", Vec3::new(5.0, 0.0, 0.0)),
            car("far", Vec3::new(100.0, 0.0, 0.0)),
            car("occluded", Vec3::new(6.0, 0.0, 0.0)),
        ];
        // "occluded" was filtered out upstream by the ray-cast model.
        let candidates = vec!["ego".to_string(), "near".to_string(), "far".to_string()];
        let output = sensor.update(0.0, &snapshot, &candidates).unwrap();
        let objects = output.ground_truth.unwrap().objects;
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].object_id, ObjectId::from_entity_name("near"));
    }

    #[test]
    fn unknown_external_candidate_is_an_error() {
        let mut sensor = sensor(DetectionSensorConfig {
            detect_all_objects_in_range: false,
            ..base_config()
        });
        let snapshot = one_car_snapshot();
        let candidates = vec!["ghost".to_string()];
        let err = sensor.update(0.0, &snapshot, &candidates).unwrap_err();
        assert!(matches!(err, SensorError::UnknownCandidate { entity } if entity == "ghost"));
    }

    #[test]
    fn attachment_to_a_missing_or_non_ego_entity_fails() {
        let mut sensor = sensor(base_config());
        let no_ego = vec![car("ego", Vec3::ZERO)];
        assert!(matches!(
            sensor.update(0.0, &no_ego, &[]),
            Err(SensorError::NotAttachedToEgo { .. })
        ));
        let absent = vec![car("npc1", Vec3::ZERO)];
        assert!(matches!(
            sensor.update(0.0, &absent, &[]),
            Err(SensorError::NotAttachedToEgo { .. })
        ));
    }

    #[test]
    fn ego_entities_never_appear_in_output() {
        let mut sensor = sensor(base_config());
        let snapshot = vec![
            ego("ego", Vec3::ZERO),
            ego("ego2", Vec3::new(3.0, 0.0, 0.0)),
            car("npc1", Vec3::new(5.0, 0.0, 0.0)),
        ];
        let output = sensor.update(0.0, &snapshot, &[]).unwrap();
        let objects = output.ground_truth.unwrap().objects;
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].object_id, ObjectId::from_entity_name("npc1"));
    }

    #[test]
    fn detected_pose_is_shifted_to_the_bounding_box_center() {
        let mut sensor = sensor(base_config());
        let mut npc = car("npc1", Vec3::new(10.0, 0.0, 0.0));
        npc.bounding_box.center = Vec3::new(1.5, 0.0, 0.75);
        let snapshot = vec![ego("ego", Vec3::ZERO), npc];
        let output = sensor.update(0.0, &snapshot, &[]).unwrap();
        let detections = output.detections.unwrap();
        let object = &detections.objects[0];
        assert!((object.pose.pose.position.x - 11.5).abs() < 1e-9);
        assert!((object.pose.pose.position.z - 0.75).abs() < 1e-9);
    }

    #[test]
    fn invalid_configuration_is_rejected_at_attachment() {
        let bad = DetectionSensorConfig {
            probability_of_lost: 1.5,
            ..base_config()
        };
        assert!(matches!(
            DetectionSensor::new(bad),
            Err(SensorError::InvalidConfiguration { .. })
        ));
        let bad = DetectionSensorConfig {
            update_period: 0.0,
            ..base_config()
        };
        assert!(DetectionSensor::new(bad).is_err());
    }

    #[test]
    fn queues_are_per_instance_state() {
        let config = DetectionSensorConfig {
            object_recognition_delay: 0.2,
            ..base_config()
        };
        let snapshot = one_car_snapshot();
        let mut first = sensor(config.clone());
        let mut second = sensor(config);

        first.update(0.0, &snapshot, &[]).unwrap();
        first.update(0.1, &snapshot, &[]).unwrap();
        // A fresh sensor must not see the first sensor's backlog.
        let output = second.update(0.1, &snapshot, &[]).unwrap();
        assert!(output.detections.is_none());
        let output = first.update(0.2, &snapshot, &[]).unwrap();
        assert!(output.detections.is_some());
    }
}
