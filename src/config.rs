use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::{
    DETECTION_WINDOW_FRAMES, FRAME_SHIFT, LOWER_FREQ, MEL_COUNT, NFFT, SAMPLE_RATE, UPPER_FREQ,
    WINDOW_LEN,
};

/// Mel frontend geometry. Fixed once at extractor construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub nfft: usize,
    pub melcount: usize,
    pub sample_rate: u32,
    pub lower_freq: f32,
    pub upper_freq: f32,
    /// Analysis window length in seconds.
    pub window_len: f32,
    /// Hop between successive frames in seconds.
    pub shift: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            nfft: NFFT,
            melcount: MEL_COUNT,
            sample_rate: SAMPLE_RATE,
            lower_freq: LOWER_FREQ,
            upper_freq: UPPER_FREQ,
            window_len: WINDOW_LEN,
            shift: FRAME_SHIFT,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let nyquist = self.sample_rate as f32 / 2.0;
        if self.lower_freq <= 0.0 || self.lower_freq >= self.upper_freq {
            return Err(config_err(format!(
                "lower_freq must satisfy 0 < lower_freq < upper_freq, got {} and {}",
                self.lower_freq, self.upper_freq
            )));
        }
        if self.upper_freq > nyquist {
            return Err(config_err(format!(
                "upper_freq {} exceeds Nyquist frequency {}",
                self.upper_freq, nyquist
            )));
        }
        if self.window_len <= 0.0 {
            return Err(config_err(format!(
                "window_len must be positive, got {}",
                self.window_len
            )));
        }
        if self.shift <= 0.0 {
            return Err(config_err(format!("shift must be positive, got {}", self.shift)));
        }
        if self.melcount == 0 {
            return Err(config_err("melcount must be positive".into()));
        }
        if self.nfft == 0 || !self.nfft.is_power_of_two() {
            return Err(config_err(format!(
                "nfft must be a power of two, got {}",
                self.nfft
            )));
        }
        if self.window_samples() > self.nfft {
            return Err(config_err(format!(
                "window of {} samples does not fit in nfft {}",
                self.window_samples(),
                self.nfft
            )));
        }
        if self.shift_samples() == 0 {
            return Err(config_err("shift is shorter than one sample".into()));
        }
        if self.window_samples() == 0 {
            return Err(config_err("window is shorter than one sample".into()));
        }
        Ok(())
    }

    pub fn window_samples(&self) -> usize {
        (self.window_len * self.sample_rate as f32) as usize
    }

    pub fn shift_samples(&self) -> usize {
        (self.shift * self.sample_rate as f32) as usize
    }
}

/// Full engine configuration surface. Hosts typically deserialize this from
/// their own configuration file; the frontend keys are flattened so the
/// surface stays flat on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model artifact path or bundled preset name.
    pub model: Option<String>,
    /// Detection sensitivity in (0, 1]. Lower values are stricter.
    pub sensitivity: f32,
    /// Linear gain applied to the signal before feature quantization.
    pub extractor_gain: f32,
    /// Mel frames per classification decision.
    pub detection_window_frames: usize,
    #[serde(flatten)]
    pub features: FeatureConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: None,
            sensitivity: 0.5,
            extractor_gain: 1.0,
            detection_window_frames: DETECTION_WINDOW_FRAMES,
            features: FeatureConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.features.validate()?;
        if self.extractor_gain < 0.0 {
            return Err(config_err(format!(
                "extractor_gain must be non-negative, got {}",
                self.extractor_gain
            )));
        }
        if self.detection_window_frames == 0 {
            return Err(config_err("detection_window_frames must be positive".into()));
        }
        Ok(())
    }
}

fn config_err(reason: String) -> EngineError {
    EngineError::Configuration { reason }
}
