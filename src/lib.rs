pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod model;
pub mod registry;
pub mod stream;

// Default frontend geometry - matches the trained model artifacts
pub const SAMPLE_RATE: u32 = 16000;
pub const NFFT: usize = 512;
pub const MEL_COUNT: usize = 40;
pub const LOWER_FREQ: f32 = 20.0;
pub const UPPER_FREQ: f32 = 8000.0;
pub const WINDOW_LEN: f32 = 0.03; // seconds
pub const FRAME_SHIFT: f32 = 0.01; // seconds

// Mel frames a classifier sees per decision (0.8s of context)
pub const DETECTION_WINDOW_FRAMES: usize = 80;

pub use config::{EngineConfig, FeatureConfig};
pub use engine::{Detection, EngineSession};
pub use error::{EngineError, VersionMismatch};
pub use features::{FeatureExtractor, MelFeatureBlock};
pub use model::{Classifier, ModelSource, RawPrediction};
pub use registry::{ModelId, ModelRegistry};
pub use stream::{AudioSource, ControllerState, DetectionEvent, ReadOutcome, StreamingController};
