use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{EngineError, VersionMismatch};
use crate::features::{FeatureExtractor, MelFeatureBlock};
use crate::model::{self, Classifier, ModelSource, OnnxClassifier, RawPrediction};
use crate::registry::{ModelId, ModelRegistry};

/// Per-model decision for one feature block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub detected: bool,
    pub confidence: f32,
}

impl Detection {
    const NEGATIVE: Detection = Detection {
        detected: false,
        confidence: 0.0,
    };
}

/// One detection session: a feature extractor configuration bound to a model
/// registry and the inference runtime.
///
/// The session owns every native resource exclusively. Independent audio
/// channels need independent sessions; handles are never shared.
pub struct EngineSession {
    extractor: FeatureExtractor,
    registry: ModelRegistry,
    gain: f32,
    detection_window_frames: usize,
    version_warning: Option<VersionMismatch>,
}

impl EngineSession {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let extractor = FeatureExtractor::new(&config.features)?;

        let version_warning = check_runtime_version(model::runtime_version());
        if let Some(mismatch) = &version_warning {
            warn!(
                reported = %mismatch.reported,
                supported_major = mismatch.supported_major,
                "inference runtime version differs from the supported major; \
                 detection may be unreliable"
            );
        }

        Ok(Self {
            extractor,
            registry: ModelRegistry::new(),
            gain: config.extractor_gain,
            detection_window_frames: config.detection_window_frames,
            version_warning,
        })
    }

    /// Loads a model artifact and registers it. On failure the registry is
    /// left exactly as it was.
    pub fn register_model(
        &mut self,
        source: &ModelSource,
        sensitivity: f32,
    ) -> Result<ModelId, EngineError> {
        let classifier = OnnxClassifier::from_source(
            source,
            self.extractor.melcount(),
            self.detection_window_frames,
        )?;
        Ok(self.registry.register(Box::new(classifier), sensitivity))
    }

    /// Registers a prebuilt classifier. Seam for alternative inference
    /// backends.
    pub fn register_classifier(
        &mut self,
        classifier: Box<dyn Classifier>,
        sensitivity: f32,
    ) -> ModelId {
        self.registry.register(classifier, sensitivity)
    }

    pub fn unregister(&mut self, id: ModelId) -> Result<(), EngineError> {
        self.registry.unregister(id)
    }

    pub fn set_sensitivity(&mut self, id: ModelId, sensitivity: f32) -> Result<(), EngineError> {
        self.registry.set_sensitivity(id, sensitivity.clamp(0.0, 1.0))
    }

    pub fn set_active(&mut self, id: ModelId, active: bool) -> Result<(), EngineError> {
        self.registry.set_active(id, active)
    }

    pub fn compact(&mut self) {
        self.registry.compact();
    }

    pub fn model_count(&self) -> usize {
        self.registry.len()
    }

    /// Samples the streaming controller should read per block so that every
    /// block yields one full detection window.
    pub fn input_size_samples(&self) -> usize {
        self.detection_window_frames * self.extractor.shift_samples()
    }

    /// Runs the frontend on a raw audio block with the configured gain.
    pub fn extract(&self, samples: &[i16]) -> MelFeatureBlock {
        self.extractor.extract(samples, self.gain)
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Scores every active model against `block`, in slot order. Inactive
    /// models are skipped entirely. A block shorter than a model's window
    /// yields a negative decision for that model, not an error; an inference
    /// failure is an error, never a silent negative.
    pub fn score(&mut self, block: &MelFeatureBlock) -> Result<Vec<(ModelId, Detection)>, EngineError> {
        let mut results = Vec::new();
        for (id, entry) in self.registry.iter_mut() {
            if !entry.active {
                continue;
            }
            let detection = if block.n_frames() < entry.classifier.input_frames() {
                Detection::NEGATIVE
            } else {
                let prediction = entry.classifier.infer(block)?;
                Detection {
                    detected: prediction.confidence > threshold_for(entry.sensitivity),
                    confidence: prediction.confidence,
                }
            };
            results.push((id, detection));
        }
        Ok(results)
    }

    /// Raw confidence and class for one model, bypassing the threshold. For
    /// calibration and diagnostics; ignores the active flag.
    pub fn score_raw(
        &mut self,
        block: &MelFeatureBlock,
        id: ModelId,
    ) -> Result<RawPrediction, EngineError> {
        let entry = self.registry.entry_mut(id)?;
        if block.n_frames() < entry.classifier.input_frames() {
            return Ok(RawPrediction {
                confidence: 0.0,
                class: 0,
            });
        }
        entry.classifier.infer(block)
    }

    pub fn version_warning(&self) -> Option<&VersionMismatch> {
        self.version_warning.as_ref()
    }

    pub fn runtime_version(&self) -> &'static str {
        model::runtime_version()
    }
}

/// Effective detection threshold for a sensitivity value. Lower sensitivity
/// means a higher threshold: 0.1 is hard to trigger, 0.9 triggers easily.
fn threshold_for(sensitivity: f32) -> f32 {
    (1.0 - sensitivity).clamp(0.0, 1.0)
}

/// Parses `major.minor.patch` and compares the major component against the
/// supported runtime major. Unparseable strings count as a mismatch.
pub(crate) fn check_runtime_version(reported: &str) -> Option<VersionMismatch> {
    let major = reported
        .split('.')
        .next()
        .and_then(|m| m.trim().parse::<u32>().ok());
    match major {
        Some(major) if major == model::SUPPORTED_RUNTIME_MAJOR => None,
        _ => Some(VersionMismatch {
            reported: reported.to_string(),
            supported_major: model::SUPPORTED_RUNTIME_MAJOR,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct FixtureClassifier {
        input_frames: usize,
        confidence: f32,
    }

    impl FixtureClassifier {
        fn boxed(input_frames: usize, confidence: f32) -> Box<dyn Classifier> {
            Box::new(Self {
                input_frames,
                confidence,
            })
        }
    }

    impl Classifier for FixtureClassifier {
        fn input_frames(&self) -> usize {
            self.input_frames
        }

        fn infer(&mut self, _block: &MelFeatureBlock) -> Result<RawPrediction, EngineError> {
            Ok(RawPrediction {
                confidence: self.confidence,
                class: 1,
            })
        }
    }

    fn session() -> EngineSession {
        EngineSession::new(&EngineConfig::default()).unwrap()
    }

    /// One frame of features per 160 samples with the default geometry.
    fn block_of(session: &EngineSession, frames: usize) -> MelFeatureBlock {
        session.extract(&vec![0i16; frames * 160])
    }

    #[test]
    fn positive_detection_above_threshold() {
        let mut session = session();
        let id = session.register_classifier(FixtureClassifier::boxed(1, 0.8), 0.5);

        let block = block_of(&session, 1);
        let results = session.score(&block).unwrap();
        assert_eq!(results.len(), 1);
        let (got_id, detection) = results[0];
        assert_eq!(got_id, id);
        assert!(detection.detected);
        assert!(detection.confidence > 0.5);
    }

    #[test]
    fn lowering_sensitivity_never_flips_negative_to_positive() {
        let mut session = session();
        let id = session.register_classifier(FixtureClassifier::boxed(1, 0.45), 0.5);
        let block = block_of(&session, 1);

        // 0.45 < threshold(0.5) = 0.5: negative
        assert!(!session.score(&block).unwrap()[0].1.detected);

        // stricter sensitivities keep it negative
        for sensitivity in [0.4, 0.3, 0.1, 0.0] {
            session.set_sensitivity(id, sensitivity).unwrap();
            assert!(
                !session.score(&block).unwrap()[0].1.detected,
                "flipped positive at sensitivity {sensitivity}"
            );
        }

        // and a laxer one can flip it positive
        session.set_sensitivity(id, 0.6).unwrap();
        assert!(session.score(&block).unwrap()[0].1.detected);
    }

    #[test]
    fn deactivated_model_is_skipped_entirely() {
        let mut session = session();
        let first = session.register_classifier(FixtureClassifier::boxed(1, 0.9), 0.5);
        let second = session.register_classifier(FixtureClassifier::boxed(1, 0.9), 0.5);
        session.set_active(second, false).unwrap();

        let block = block_of(&session, 1);
        let results = session.score(&block).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, first);
    }

    #[test]
    fn toggling_one_model_does_not_change_another_score() {
        let mut session = session();
        let a = session.register_classifier(FixtureClassifier::boxed(1, 0.2), 0.5);
        let b = session.register_classifier(FixtureClassifier::boxed(1, 0.8), 0.5);
        let block = block_of(&session, 1);

        let before: Vec<_> = session
            .score(&block)
            .unwrap()
            .into_iter()
            .filter(|(id, _)| *id == b)
            .collect();
        session.set_active(a, false).unwrap();
        let after: Vec<_> = session
            .score(&block)
            .unwrap()
            .into_iter()
            .filter(|(id, _)| *id == b)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn short_block_is_negative_for_all_models_without_error() {
        let mut session = session();
        session.register_classifier(FixtureClassifier::boxed(4, 0.99), 0.9);
        session.register_classifier(FixtureClassifier::boxed(8, 0.99), 0.9);

        let block = block_of(&session, 2);
        let results = session.score(&block).unwrap();
        assert_eq!(results.len(), 2);
        for (_, detection) in results {
            assert!(!detection.detected);
            assert_eq!(detection.confidence, 0.0);
        }
    }

    #[test]
    fn empty_block_is_a_no_op() {
        let mut session = session();
        session.register_classifier(FixtureClassifier::boxed(1, 0.99), 0.9);
        let block = session.extract(&[]);
        assert!(block.is_empty());
        let results = session.score(&block).unwrap();
        assert!(!results[0].1.detected);
    }

    #[test]
    fn failed_register_leaves_registry_unchanged() {
        let mut session = session();
        session.register_classifier(FixtureClassifier::boxed(1, 0.5), 0.5);
        assert_eq!(session.model_count(), 1);

        let missing = ModelSource::Path(PathBuf::from("/no/such/model.onnx"));
        let err = session.register_model(&missing, 0.5).unwrap_err();
        assert!(matches!(err, EngineError::ModelLoad { .. }));
        assert_eq!(session.model_count(), 1);
    }

    #[test]
    fn score_raw_bypasses_threshold() {
        let mut session = session();
        let id = session.register_classifier(FixtureClassifier::boxed(1, 0.3), 0.1);
        let block = block_of(&session, 1);

        // far below the 0.9 threshold, but raw scoring still reports it
        assert!(!session.score(&block).unwrap()[0].1.detected);
        let raw = session.score_raw(&block, id).unwrap();
        assert_eq!(raw.confidence, 0.3);
        assert_eq!(raw.class, 1);
    }

    #[test]
    fn score_raw_unknown_id_fails() {
        let mut session = session();
        let id = session.register_classifier(FixtureClassifier::boxed(1, 0.3), 0.5);
        session.unregister(id).unwrap();
        let block = block_of(&session, 1);
        assert!(matches!(
            session.score_raw(&block, id),
            Err(EngineError::UnknownModel(_))
        ));
    }

    #[test]
    fn input_size_follows_geometry() {
        let session = session();
        // 80 frames x 160 samples per shift
        assert_eq!(session.input_size_samples(), 12800);
    }

    #[test]
    fn version_check_accepts_supported_major() {
        assert!(check_runtime_version("1.22.0").is_none());
        assert!(check_runtime_version("1.0.3").is_none());
    }

    #[test]
    fn version_check_flags_other_majors_and_garbage() {
        let mismatch = check_runtime_version("2.1.0").unwrap();
        assert_eq!(mismatch.reported, "2.1.0");
        assert_eq!(mismatch.supported_major, 1);
        assert!(check_runtime_version("not-a-version").is_some());
    }
}
