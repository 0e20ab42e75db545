use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hotword_rs::audio::MicrophoneCapture;
use hotword_rs::model::{resolve_model, ModelSource};
use hotword_rs::{EngineConfig, EngineSession, StreamingController, SAMPLE_RATE};

#[derive(Parser)]
#[command(name = "hotword-rs")]
#[command(about = "Streaming wake word detector")]
struct Args {
    /// Model artifact path or bundled preset name
    /// (alexa, marvin, sheila, firefox)
    #[arg(short, long, default_value = "alexa")]
    model: String,

    /// Directory holding bundled model artifacts
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// Detection sensitivity. A lower value means fewer false positives but
    /// is harder to trigger; a higher value triggers easily.
    #[arg(short, long, default_value = "0.5")]
    sensitivity: f32,

    /// Linear gain applied to the signal before feature quantization
    #[arg(short, long, default_value = "1.0")]
    gain: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = EngineConfig {
        model: Some(args.model.clone()),
        sensitivity: args.sensitivity,
        extractor_gain: args.gain,
        ..EngineConfig::default()
    };

    let mut session = EngineSession::new(&config).context("failed to create engine session")?;
    info!(version = session.runtime_version(), "engine session ready");

    let model_path = resolve_model(&args.model, &args.models_dir)?;
    let model_id = session
        .register_model(&ModelSource::Path(model_path.clone()), config.sensitivity)
        .with_context(|| format!("failed to register model {}", model_path.display()))?;
    info!(model = %model_id, path = %model_path.display(), sensitivity = config.sensitivity, "model registered");

    // the capture half must outlive the streaming run
    let (_capture, source) =
        MicrophoneCapture::open(SAMPLE_RATE).context("failed to open microphone")?;

    let mut controller = StreamingController::new(session, Box::new(source));
    controller.start().context("failed to start stream")?;
    println!("Listening... (Ctrl+C to quit)");

    loop {
        match controller.events().recv_timeout(Duration::from_millis(250)) {
            Ok(event) => {
                println!(
                    ">>> detected {} at {:.2}s (confidence {:.3})",
                    event.model_id,
                    event.timestamp.as_secs_f32(),
                    event.confidence
                );
            }
            Err(RecvTimeoutError::Timeout) => {
                if !controller.is_running() {
                    controller.stop().ok();
                    if let Some(err) = controller.take_terminal_error() {
                        return Err(err).context("stream terminated");
                    }
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}
