use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tracing::warn;

use crate::error::EngineError;
use crate::stream::{AudioSource, ReadOutcome};

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Holds the live cpal stream. Must stay alive for as long as the paired
/// `MicrophoneSource` is in use; cpal streams are not `Send`, so the capture
/// half stays on the thread that opened the device while the source half
/// moves into the streaming worker.
pub struct MicrophoneCapture {
    _stream: Stream,
}

/// Microphone-backed `AudioSource`. Accumulates callback data until a full
/// block is available; a quiet device yields `Retry` after a short timeout
/// so the stream loop can observe its stop flag.
pub struct MicrophoneSource {
    receiver: Receiver<Vec<i16>>,
    pending: Vec<i16>,
}

impl MicrophoneCapture {
    /// Opens the default input device in mono f32 at `sample_rate` and
    /// starts capturing.
    pub fn open(sample_rate: u32) -> Result<(MicrophoneCapture, MicrophoneSource), EngineError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| EngineError::Audio("no input device available".to_string()))?;

        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (sender, receiver) = mpsc::channel();
        let stream = build_stream(&device, &config, sender)?;
        stream
            .play()
            .map_err(|e| EngineError::Audio(format!("failed to start audio stream: {e}")))?;

        Ok((
            MicrophoneCapture { _stream: stream },
            MicrophoneSource {
                receiver,
                pending: Vec::new(),
            },
        ))
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sender: Sender<Vec<i16>>,
) -> Result<Stream, EngineError> {
    let err_fn = |err| warn!(%err, "audio stream error");

    device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Convert f32 [-1.0, 1.0] to i16
                let samples: Vec<i16> = data
                    .iter()
                    .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                    .collect();
                let _ = sender.send(samples);
            },
            err_fn,
            None,
        )
        .map_err(|e| EngineError::Audio(format!("failed to open input stream: {e}")))
}

impl AudioSource for MicrophoneSource {
    fn read(&mut self, block_size: usize) -> Result<ReadOutcome, EngineError> {
        while self.pending.len() < block_size {
            match self.receiver.recv_timeout(READ_TIMEOUT) {
                Ok(samples) => self.pending.extend_from_slice(&samples),
                Err(RecvTimeoutError::Timeout) => return Ok(ReadOutcome::Retry),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Audio("capture stream closed".to_string()))
                }
            }
        }
        Ok(ReadOutcome::Samples(self.pending.drain(..block_size).collect()))
    }
}
