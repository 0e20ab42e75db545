use crate::registry::ModelId;

/// Errors returned by engine operations.
///
/// `Display` and `Error` are implemented by hand because the `ModelLoad`
/// variant has a descriptive `source: String` field, which the thiserror
/// derive would treat as an error-source and reject.
#[derive(Debug)]
pub enum EngineError {
    /// Invalid extractor or engine geometry, rejected at construction.
    Configuration { reason: String },

    /// A model artifact could not be loaded. Local to the failing
    /// `register` call; the registry is left unchanged.
    ModelLoad { source: String, reason: String },

    /// Operation referenced a model id that is not registered (or is stale).
    UnknownModel(ModelId),

    /// Caller-provided feature buffer does not match the frame count the
    /// configured geometry produces. Indicates a wiring bug, never truncated.
    FeatureSizeMismatch { expected: usize, got: usize },

    /// Classifier inference failed. Distinct from a negative detection.
    Inference(String),

    /// The audio source reported an unrecoverable failure.
    Audio(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Configuration { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
            EngineError::ModelLoad { source, reason } => {
                write!(f, "failed to load model from {source}: {reason}")
            }
            EngineError::UnknownModel(id) => write!(f, "unknown model id {id}"),
            EngineError::FeatureSizeMismatch { expected, got } => {
                write!(
                    f,
                    "feature buffer size mismatch: expected {expected} values, got {got}"
                )
            }
            EngineError::Inference(reason) => write!(f, "inference failed: {reason}"),
            EngineError::Audio(reason) => write!(f, "audio source failure: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Non-fatal warning raised when the inference runtime's major version does
/// not match the one this engine was built against. Detection proceeds but
/// correctness is not guaranteed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMismatch {
    pub reported: String,
    pub supported_major: u32,
}

impl std::fmt::Display for VersionMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "runtime version {} is not compatible with supported major {}",
            self.reported, self.supported_major
        )
    }
}
