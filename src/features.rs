use std::sync::Arc;

use realfft::{RealFftPlanner, RealToComplex};

use crate::config::FeatureConfig;
use crate::error::EngineError;

// Quantization of log-mel energies into u8. Fixed so that identical input
// and geometry always produce identical bytes.
const ENERGY_FLOOR: f32 = 1e-10;
const QUANT_SCALE: f32 = 6.0;
const QUANT_OFFSET: f32 = 64.0;

/// A block of quantized log-mel frames, row-major `n_frames x melcount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MelFeatureBlock {
    data: Vec<u8>,
    melcount: usize,
}

impl MelFeatureBlock {
    /// Wraps raw quantized features. The data length must be a whole number
    /// of frames.
    pub fn new(data: Vec<u8>, melcount: usize) -> Result<Self, EngineError> {
        if melcount == 0 || data.len() % melcount != 0 {
            let got = data.len();
            let expected = if melcount == 0 {
                0
            } else {
                (got / melcount) * melcount
            };
            return Err(EngineError::FeatureSizeMismatch { expected, got });
        }
        Ok(Self { data, melcount })
    }

    pub fn n_frames(&self) -> usize {
        if self.melcount == 0 {
            0
        } else {
            self.data.len() / self.melcount
        }
    }

    pub fn melcount(&self) -> usize {
        self.melcount
    }

    pub fn frame(&self, index: usize) -> &[u8] {
        let start = index * self.melcount;
        &self.data[start..start + self.melcount]
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Turns 16-bit PCM into quantized log-mel frames.
///
/// Geometry is fixed at construction. `extract` is a pure function of its
/// inputs: the same samples, gain, and configuration always produce the same
/// bytes, which downstream thresholding relies on.
pub struct FeatureExtractor {
    melcount: usize,
    nfft: usize,
    window_samples: usize,
    shift_samples: usize,
    window: Vec<f32>,
    filterbank: Vec<Vec<f32>>,
    fft: Arc<dyn RealToComplex<f32>>,
}

impl FeatureExtractor {
    pub fn new(config: &FeatureConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let window_samples = config.window_samples();
        let shift_samples = config.shift_samples();
        let window = hann(window_samples);
        let filterbank = mel_filterbank(
            config.melcount,
            config.nfft,
            config.sample_rate,
            config.lower_freq,
            config.upper_freq,
        );

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(config.nfft);

        Ok(Self {
            melcount: config.melcount,
            nfft: config.nfft,
            window_samples,
            shift_samples,
            window,
            filterbank,
            fft,
        })
    }

    pub fn melcount(&self) -> usize {
        self.melcount
    }

    pub fn shift_samples(&self) -> usize {
        self.shift_samples
    }

    /// Frames produced for a block of `sample_count` samples. The trailing
    /// partial frame is truncated.
    pub fn frames_for(&self, sample_count: usize) -> usize {
        sample_count / self.shift_samples
    }

    /// Extracts quantized log-mel frames from `samples`, pre-scaling the
    /// signal by `gain`.
    pub fn extract(&self, samples: &[i16], gain: f32) -> MelFeatureBlock {
        let n_frames = self.frames_for(samples.len());
        let mut data = vec![0u8; n_frames * self.melcount];
        self.compute(samples, gain, &mut data);
        MelFeatureBlock {
            data,
            melcount: self.melcount,
        }
    }

    /// Extracts into a caller-sized buffer. The buffer must hold exactly
    /// `frames_for(samples.len()) * melcount` values; anything else is a
    /// wiring bug and fails loudly.
    pub fn extract_into(
        &self,
        samples: &[i16],
        gain: f32,
        out: &mut [u8],
    ) -> Result<usize, EngineError> {
        let expected = self.frames_for(samples.len()) * self.melcount;
        if out.len() != expected {
            return Err(EngineError::FeatureSizeMismatch {
                expected,
                got: out.len(),
            });
        }
        self.compute(samples, gain, out);
        Ok(expected)
    }

    fn compute(&self, samples: &[i16], gain: f32, out: &mut [u8]) {
        let n_frames = self.frames_for(samples.len());
        let mut input = vec![0.0f32; self.nfft];
        let mut spectrum = self.fft.make_output_vec();

        for t in 0..n_frames {
            let start = t * self.shift_samples;
            let end = (start + self.window_samples).min(samples.len());

            // Windows reaching past the block end are zero-padded so the
            // frame count stays floor(len / shift).
            input.fill(0.0);
            for (i, &s) in samples[start..end].iter().enumerate() {
                input[i] = s as f32 * gain * self.window[i];
            }

            // Lengths are fixed at construction, process cannot fail here.
            self.fft.process(&mut input, &mut spectrum).ok();

            let row = &mut out[t * self.melcount..(t + 1) * self.melcount];
            for (value, filter) in row.iter_mut().zip(&self.filterbank) {
                let mut energy = 0.0f32;
                for (&weight, bin) in filter.iter().zip(&spectrum) {
                    if weight > 0.0 {
                        energy += weight * bin.norm_sqr();
                    }
                }
                *value = quantize(energy);
            }
        }
    }
}

fn quantize(energy: f32) -> u8 {
    let scaled = (energy + ENERGY_FLOOR).ln() * QUANT_SCALE + QUANT_OFFSET;
    scaled.round().clamp(0.0, 255.0) as u8
}

fn hann(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let t = (std::f32::consts::PI * i as f32) / (n as f32);
            t.sin() * t.sin()
        })
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank: `melcount` rows over `nfft / 2 + 1` FFT bins.
fn mel_filterbank(
    melcount: usize,
    nfft: usize,
    sample_rate: u32,
    lower_freq: f32,
    upper_freq: f32,
) -> Vec<Vec<f32>> {
    let n_bins = nfft / 2 + 1;
    let bin_hz = sample_rate as f32 / nfft as f32;

    let mel_lo = hz_to_mel(lower_freq);
    let mel_hi = hz_to_mel(upper_freq);
    let mel_step = (mel_hi - mel_lo) / (melcount + 1) as f32;

    // Band edges in fractional FFT bins, melcount + 2 points.
    let edges: Vec<f32> = (0..melcount + 2)
        .map(|m| mel_to_hz(mel_lo + mel_step * m as f32) / bin_hz)
        .collect();

    (0..melcount)
        .map(|m| {
            let (left, center, right) = (edges[m], edges[m + 1], edges[m + 2]);
            (0..n_bins)
                .map(|k| {
                    let k = k as f32;
                    if k <= left || k >= right {
                        0.0
                    } else if k <= center {
                        (k - left) / (center - left)
                    } else {
                        (right - k) / (right - center)
                    }
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(&FeatureConfig::default()).unwrap()
    }

    fn tone(len: usize, freq: f32) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f32 / 16000.0;
                ((t * freq * 2.0 * std::f32::consts::PI).sin() * 12000.0) as i16
            })
            .collect()
    }

    #[test]
    fn extract_is_deterministic() {
        let ex = extractor();
        let audio = tone(16000, 440.0);
        let a = ex.extract(&audio, 1.0);
        let b = ex.extract(&audio, 1.0);
        assert_eq!(a, b);
    }

    #[test]
    fn frame_count_is_floor_of_len_over_shift() {
        let ex = extractor();
        // default shift is 160 samples at 16 kHz
        for len in [0usize, 159, 160, 1599, 1600, 16000, 16001] {
            let block = ex.extract(&vec![0i16; len], 1.0);
            assert_eq!(block.n_frames(), len / 160, "len {}", len);
            assert_eq!(block.data().len(), (len / 160) * ex.melcount());
        }
    }

    #[test]
    fn frames_have_melcount_values() {
        let ex = extractor();
        let block = ex.extract(&tone(3200, 1000.0), 1.0);
        assert_eq!(block.melcount(), 40);
        for t in 0..block.n_frames() {
            assert_eq!(block.frame(t).len(), 40);
        }
    }

    #[test]
    fn gain_changes_quantized_output() {
        let ex = extractor();
        let audio = tone(1600, 440.0);
        let unity = ex.extract(&audio, 1.0);
        let muted = ex.extract(&audio, 0.0);
        assert_ne!(unity, muted);
        // zero gain collapses every bin to the quantization floor
        let floor = muted.data()[0];
        assert!(muted.data().iter().all(|&v| v == floor));
    }

    #[test]
    fn extract_into_rejects_wrong_buffer_size() {
        let ex = extractor();
        let audio = tone(1600, 440.0);
        let mut out = vec![0u8; 10 * 40 + 1];
        let err = ex.extract_into(&audio, 1.0, &mut out).unwrap_err();
        match err {
            EngineError::FeatureSizeMismatch { expected, got } => {
                assert_eq!(expected, 400);
                assert_eq!(got, 401);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn extract_into_matches_extract() {
        let ex = extractor();
        let audio = tone(1600, 2000.0);
        let block = ex.extract(&audio, 1.0);
        let mut out = vec![0u8; block.data().len()];
        let written = ex.extract_into(&audio, 1.0, &mut out).unwrap();
        assert_eq!(written, block.data().len());
        assert_eq!(out, block.data());
    }

    #[test]
    fn tone_energy_lands_in_matching_band() {
        let ex = extractor();
        // a 1 kHz tone should put more energy near its band than at the top
        let block = ex.extract(&tone(16000, 1000.0), 1.0);
        let frame = block.frame(10);
        let peak = frame.iter().copied().max().unwrap();
        assert!(frame[39] < peak);
    }

    #[test]
    fn block_constructor_rejects_ragged_data() {
        assert!(MelFeatureBlock::new(vec![0u8; 41], 40).is_err());
        let block = MelFeatureBlock::new(vec![0u8; 80], 40).unwrap();
        assert_eq!(block.n_frames(), 2);
    }

    #[test]
    fn rejects_invalid_geometry() {
        let config = FeatureConfig {
            lower_freq: 0.0,
            ..FeatureConfig::default()
        };
        assert!(matches!(
            FeatureExtractor::new(&config),
            Err(EngineError::Configuration { .. })
        ));
    }
}
