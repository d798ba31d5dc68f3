//! Simulated perception sensors. One [`detection::DetectionSensor`] instance
//! exists per configured sensor; each owns its delay queues and RNG stream.

mod detection;

pub use detection::{
    DetectedObject, DetectedObjects, DetectionSensor, DetectionSensorConfig, ObjectClassification,
    ObjectId, PoseWithCovariance, SensorError, SensorOutput, TrackedObject, TrackedObjects,
    TwistWithCovariance,
};
