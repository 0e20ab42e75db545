use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::engine::EngineSession;
use crate::error::EngineError;
use crate::registry::ModelId;

/// Result of one audio read.
pub enum ReadOutcome {
    /// Exactly one block of samples.
    Samples(Vec<i16>),
    /// Nothing available yet; try again. Not an error.
    Retry,
}

/// Blocking source of raw PCM blocks. An `Err` is terminal for the stream;
/// transient shortfalls are reported as `ReadOutcome::Retry`.
pub trait AudioSource: Send {
    fn read(&mut self, block_size: usize) -> Result<ReadOutcome, EngineError>;
}

/// Emitted once per positive model decision per feature block.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub model_id: ModelId,
    /// Monotonic offset from the start of the current run.
    pub timestamp: Duration,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    Stopping,
}

type WorkerResult = (EngineSession, Box<dyn AudioSource>, Option<EngineError>);

/// Owns the read -> extract -> score loop on a dedicated worker thread.
///
/// `start` and `stop` are idempotent. The stop flag is checked at the top of
/// every loop iteration, so shutdown latency is bounded by one blocking
/// read. `stop` joins the worker before returning, which guarantees no
/// in-flight scoring races teardown and resources are released exactly once.
pub struct StreamingController {
    idle: Option<(EngineSession, Box<dyn AudioSource>)>,
    worker: Option<JoinHandle<WorkerResult>>,
    stop_flag: Arc<AtomicBool>,
    events_tx: Sender<DetectionEvent>,
    events_rx: Receiver<DetectionEvent>,
    terminal_error: Option<EngineError>,
    state: ControllerState,
}

impl StreamingController {
    pub fn new(session: EngineSession, source: Box<dyn AudioSource>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            idle: Some((session, source)),
            worker: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx,
            terminal_error: None,
            state: ControllerState::Idle,
        }
    }

    /// Idle -> Running. A no-op when already running.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.worker.is_some() {
            if self.is_running() {
                return Ok(());
            }
            // worker exited on its own (terminal source error); reap it
            // before starting over
            self.reap();
        }

        let (mut session, mut source) = self
            .idle
            .take()
            .ok_or_else(|| EngineError::Audio("session lost after worker panic".to_string()))?;

        let block_size = session.input_size_samples();
        self.stop_flag.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop_flag);
        let events = self.events_tx.clone();

        self.worker = Some(std::thread::spawn(move || {
            let started = Instant::now();
            let mut terminal = None;

            while !stop.load(Ordering::SeqCst) {
                let samples = match source.read(block_size) {
                    Ok(ReadOutcome::Samples(samples)) => samples,
                    Ok(ReadOutcome::Retry) => continue,
                    Err(err) => {
                        error!(%err, "audio source failed, stopping stream");
                        terminal = Some(err);
                        break;
                    }
                };

                let block = session.extract(&samples);
                match session.score(&block) {
                    Ok(results) => {
                        for (model_id, detection) in results {
                            if detection.detected {
                                debug!(model = %model_id, confidence = detection.confidence, "detection");
                                let _ = events.send(DetectionEvent {
                                    model_id,
                                    timestamp: started.elapsed(),
                                    confidence: detection.confidence,
                                });
                            }
                        }
                    }
                    Err(err) => {
                        error!(%err, "scoring failed, stopping stream");
                        terminal = Some(err);
                        break;
                    }
                }
            }

            (session, source, terminal)
        }));
        self.state = ControllerState::Running;
        Ok(())
    }

    /// Running -> Stopping -> Idle. A no-op when already idle. Safe to call
    /// any number of times.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        if self.worker.is_none() {
            self.state = ControllerState::Idle;
            return Ok(());
        }
        self.state = ControllerState::Stopping;
        self.stop_flag.store(true, Ordering::SeqCst);
        self.reap();
        Ok(())
    }

    fn reap(&mut self) {
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok((session, source, terminal)) => {
                    self.idle = Some((session, source));
                    if let Some(err) = terminal {
                        self.terminal_error.get_or_insert(err);
                    }
                }
                Err(_) => {
                    self.terminal_error
                        .get_or_insert(EngineError::Audio("stream worker panicked".to_string()));
                }
            }
        }
        self.state = ControllerState::Idle;
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Receiver for detection events from the current and past runs.
    pub fn events(&self) -> &Receiver<DetectionEvent> {
        &self.events_rx
    }

    /// The error that terminated the last run, surfaced once.
    pub fn take_terminal_error(&mut self) -> Option<EngineError> {
        if self.worker.as_ref().is_some_and(|h| h.is_finished()) {
            self.reap();
        }
        self.terminal_error.take()
    }

    /// Engine access between runs. `None` while the worker owns the session.
    pub fn session_mut(&mut self) -> Option<&mut EngineSession> {
        self.idle.as_mut().map(|(session, _)| session)
    }
}

impl Drop for StreamingController {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.reap();
    }
}
