use std::path::{Path, PathBuf};

use ndarray::Array3;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use crate::error::EngineError;
use crate::features::MelFeatureBlock;

/// ONNX Runtime version this engine is built and tested against. Only the
/// major component is checked at session start; a mismatch is surfaced as a
/// warning, not an error.
pub const RUNTIME_VERSION: &str = "1.22.0";
pub const SUPPORTED_RUNTIME_MAJOR: u32 = 1;

/// Bundled preset names and their artifact file stems.
const PRESETS: [&str; 4] = ["alexa", "marvin", "sheila", "firefox"];
const PRESET_VERSION: &str = "v1.0.0";

pub fn runtime_version() -> &'static str {
    RUNTIME_VERSION
}

/// Raw classifier output: confidence in the trained range plus the
/// predicted class index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPrediction {
    pub confidence: f32,
    pub class: u32,
}

/// One trained trigger-phrase classifier.
///
/// The engine guarantees `infer` is only called with at least
/// `input_frames()` frames; the classifier reads the trailing window.
pub trait Classifier: Send {
    /// Mel frames required per decision.
    fn input_frames(&self) -> usize;

    fn infer(&mut self, block: &MelFeatureBlock) -> Result<RawPrediction, EngineError>;
}

/// Where a model artifact comes from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    Path(PathBuf),
    Buffer(Vec<u8>),
}

impl ModelSource {
    pub fn describe(&self) -> String {
        match self {
            ModelSource::Path(path) => path.display().to_string(),
            ModelSource::Buffer(data) => format!("<buffer of {} bytes>", data.len()),
        }
    }
}

/// Resolves a model name to an artifact path: a bundled preset name, an
/// existing path, or a file under `models_dir`.
pub fn resolve_model(name_or_path: &str, models_dir: &Path) -> Result<PathBuf, EngineError> {
    if PRESETS.contains(&name_or_path) {
        return Ok(models_dir.join(format!("{name_or_path}_{PRESET_VERSION}.onnx")));
    }
    let direct = PathBuf::from(name_or_path);
    if direct.exists() {
        return Ok(direct);
    }
    let bundled = models_dir.join(name_or_path);
    if bundled.exists() {
        return Ok(bundled);
    }
    Err(EngineError::ModelLoad {
        source: name_or_path.to_string(),
        reason: "not a bundled preset and no such file".to_string(),
    })
}

/// ONNX-backed classifier. The artifact is opaque to the engine; the
/// runtime's own decoder validates it at load time.
#[derive(Debug)]
pub struct OnnxClassifier {
    session: Session,
    melcount: usize,
    input_frames: usize,
}

impl OnnxClassifier {
    pub fn from_source(
        source: &ModelSource,
        melcount: usize,
        input_frames: usize,
    ) -> Result<Self, EngineError> {
        let load_err = |reason: String| EngineError::ModelLoad {
            source: source.describe(),
            reason,
        };

        if let ModelSource::Path(path) = source {
            if !path.is_file() {
                return Err(load_err("no such file".to_string()));
            }
        }

        let mut builder = Session::builder()
            .and_then(|b| Ok(b.with_optimization_level(GraphOptimizationLevel::Level3)?))
            .and_then(|b| Ok(b.with_intra_threads(1)?))
            .and_then(|b| Ok(b.with_inter_threads(1)?))
            .map_err(|e| load_err(e.to_string()))?;

        let session = match source {
            ModelSource::Path(path) => builder.commit_from_file(path),
            ModelSource::Buffer(data) => builder.commit_from_memory(data),
        }
        .map_err(|e| load_err(e.to_string()))?;

        Ok(Self {
            session,
            melcount,
            input_frames,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn input_frames(&self) -> usize {
        self.input_frames
    }

    fn infer(&mut self, block: &MelFeatureBlock) -> Result<RawPrediction, EngineError> {
        let n_frames = block.n_frames();
        let start = n_frames - self.input_frames;

        let mut data = Vec::with_capacity(self.input_frames * self.melcount);
        for t in start..n_frames {
            data.extend(block.frame(t).iter().map(|&v| v as f32 / 255.0));
        }

        let input = Array3::from_shape_vec((1, self.input_frames, self.melcount), data)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        let tensor = Tensor::from_array(input).map_err(|e| EngineError::Inference(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        let scores: Vec<f32> = output.iter().copied().collect();
        match scores.len() {
            0 => Err(EngineError::Inference("classifier produced no output".to_string())),
            1 => Ok(RawPrediction {
                confidence: scores[0],
                class: 0,
            }),
            _ => {
                let (class, &confidence) = scores
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .ok_or_else(|| EngineError::Inference("empty score vector".to_string()))?;
                Ok(RawPrediction {
                    confidence,
                    class: class as u32,
                })
            }
        }
    }
}
