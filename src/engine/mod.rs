//! Inference engine module
//!
//! Provides the ingredient detection pipeline stages:
//! - Image decoding and validation
//! - A load-once YOLO detector on OpenVINO
//! - Reduction of detections into ingredient names

pub mod model;
pub mod detector;
pub mod preprocess;
pub mod reducer;

pub use model::{DetectParams, Detection, DetectionBackend, DetectionModel};
pub use detector::OpenVinoDetector;
pub use preprocess::{decode_image, DecodedImage, InvalidImage};
pub use reducer::{reduce, IngredientSet, ReduceError};
