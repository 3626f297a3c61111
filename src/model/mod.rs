pub mod crop;
pub mod detector;
pub mod keypoint;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use crop::{extract_patch, roi_rotation_angle, SimilarityWarp};
pub use detector::{DetectorOutput, HandDetector};
pub use keypoint::{KeypointEstimator, KeypointPrediction, KeypointRequest};
