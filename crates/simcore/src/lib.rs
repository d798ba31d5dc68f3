//! Core machinery for the scenario traffic/perception simulator: the
//! simulation clock, the scenario scope resolver, and the detection-sensor
//! pipeline. The scenario interpreter, map queries, and transport all live
//! outside this crate and drive it through one synchronous tick per step.

pub mod clock;
pub mod scope;
pub mod sensor;
pub mod world;

pub use clock::{ClockError, SimulationClock};
pub use scope::{
    Element, EntitySelection, FrameId, GlobalEnvironment, ParameterValue, ScenarioObject, Scope,
    ScopeError,
};
pub use sensor::{
    DetectedObject, DetectedObjects, DetectionSensor, DetectionSensorConfig, ObjectClassification,
    ObjectId, PoseWithCovariance, SensorError, SensorOutput, TrackedObject, TrackedObjects,
    TwistWithCovariance,
};
pub use world::{
    BoundingBox, EntityClassification, EntityKind, EntityStatus, Pose, Quaternion, Twist, Vec3,
};
