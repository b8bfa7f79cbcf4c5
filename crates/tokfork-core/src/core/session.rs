//! Generation session for UI-agnostic execution.
//!
//! The session drives the tokenize/evaluate/sample loop on a blocking worker
//! and emits `SessionEvent`s over an unbounded channel. The worker never
//! touches the branch tree; consumers build it from the events they receive.
//!
//! ## Worker flow
//!
//! ```text
//!   start(prompt) ──► tokenize ──► rewind context to shared prefix
//!                                        │
//!             ┌──────────────────────────┘
//!             ▼
//!         evaluate pending ──► sample ──► emit StepProduced
//!             ▲                              │
//!             │         resync (truncate)    ▼
//!             └─────────────────────── stop checks ──► SessionEnded
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::candidates::{CandidateSet, TokenId};
use crate::core::events::{EndReason, SessionEvent};
use crate::engine::{EngineError, EngineLoader, SamplingEngine, SharedEngine, common_prefix_len};
use crate::settings::SampleSettings;

/// Channel-based event sender (unbounded, never blocks the worker).
pub type SessionEventTx = mpsc::UnboundedSender<SessionEvent>;

/// Channel-based event receiver.
pub type SessionEventRx = mpsc::UnboundedReceiver<SessionEvent>;

/// Message returned by a successful [`GenerationSession::load_model`].
pub const MODEL_LOADED_MESSAGE: &str = "Model loaded successfully.";

/// Errors returned synchronously by session commands.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("generation already running")]
    AlreadyRunning,
    #[error("no model loaded")]
    NoModelLoaded,
    #[error("candidate {index} out of range ({len} candidates)")]
    CandidateOutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors returned by [`GenerationSession::load_model`].
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("load aborted, model in use")]
    InUse,
    #[error("Error loading model {}: {message}", path.display())]
    Failed { path: PathBuf, message: String },
}

/// Lifecycle of a session. There is no paused state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
}

/// What the worker has produced for the current branch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    /// Prompt the current branch started from.
    pub prompt: String,
    /// Concatenated text of every produced token.
    pub response_text: String,
    /// Candidate sets in production order.
    pub steps: Vec<Arc<CandidateSet>>,
}

struct Shared {
    running: AtomicBool,
    /// Guards the transcript and the act of sending events.
    transcript: Mutex<Transcript>,
    cancel: Mutex<CancellationToken>,
}

/// Cloneable handle that requests cancellation from any thread.
#[derive(Clone)]
pub struct SessionStopper {
    shared: Arc<Shared>,
}

impl SessionStopper {
    /// Requests cooperative cancellation. Never blocks.
    pub fn stop(&self) {
        self.shared.cancel.lock().cancel();
    }
}

/// Branching generation session.
///
/// Owns the loaded engine and at most one background worker.
pub struct GenerationSession {
    loader: Arc<dyn EngineLoader>,
    engine: Option<SharedEngine>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl GenerationSession {
    /// Creates an idle session with no model loaded.
    pub fn new(loader: impl EngineLoader + 'static) -> Self {
        Self {
            loader: Arc::new(loader),
            engine: None,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                transcript: Mutex::new(Transcript::default()),
                cancel: Mutex::new(CancellationToken::new()),
            }),
            worker: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.is_running() {
            SessionState::Running
        } else {
            SessionState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn has_model(&self) -> bool {
        self.engine.is_some()
    }

    /// Loads a model through the session's loader.
    ///
    /// On failure the previously loaded engine (if any) stays in place.
    ///
    /// # Errors
    /// Returns `LoadError::InUse` while a branch is generating, or
    /// `LoadError::Failed` when the loader rejects the model.
    pub fn load_model(&mut self, path: &Path) -> Result<String, LoadError> {
        if self.is_running() {
            warn!(path = %path.display(), "model load rejected while generating");
            return Err(LoadError::InUse);
        }
        match self.loader.load(path) {
            Ok(engine) => {
                self.engine = Some(Arc::new(Mutex::new(engine)));
                info!(path = %path.display(), "model loaded");
                Ok(MODEL_LOADED_MESSAGE.to_string())
            }
            Err(err) => {
                error!(path = %path.display(), "model load failed: {err:#}");
                Err(LoadError::Failed {
                    path: path.to_path_buf(),
                    message: format!("{err:#}"),
                })
            }
        }
    }

    /// Installs an already constructed engine.
    ///
    /// # Errors
    /// Returns `LoadError::InUse` while a branch is generating.
    pub fn set_engine(&mut self, engine: Box<dyn SamplingEngine>) -> Result<(), LoadError> {
        if self.is_running() {
            return Err(LoadError::InUse);
        }
        self.engine = Some(Arc::new(Mutex::new(engine)));
        Ok(())
    }

    /// Starts generating from `prompt` on a blocking worker.
    ///
    /// `settings` is moved into the worker, so later edits by the caller do
    /// not reach this branch. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `SessionError::NoModelLoaded` or `SessionError::AlreadyRunning`;
    /// nothing changes in either case.
    pub fn start(
        &mut self,
        prompt: impl Into<String>,
        settings: SampleSettings,
    ) -> Result<SessionEventRx, SessionError> {
        let engine = self.engine.clone().ok_or(SessionError::NoModelLoaded)?;
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::AlreadyRunning);
        }

        let prompt = prompt.into();
        let cancel = CancellationToken::new();
        *self.shared.cancel.lock() = cancel.clone();
        *self.shared.transcript.lock() = Transcript {
            prompt: prompt.clone(),
            ..Transcript::default()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        info!(
            prompt_len = prompt.len(),
            max_samples = settings.max_samples,
            "starting branch"
        );
        let worker = Worker {
            engine,
            shared: Arc::clone(&self.shared),
            tx,
            cancel,
            settings,
            prompt,
        };
        self.worker = Some(tokio::task::spawn_blocking(move || worker.run()));
        Ok(rx)
    }

    /// Requests cooperative cancellation of the running branch.
    ///
    /// The step in progress completes first. Safe to call when idle.
    pub fn stop(&self) {
        self.stopper().stop();
    }

    pub fn stopper(&self) -> SessionStopper {
        SessionStopper {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Waits for the current worker (if any) to exit.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.worker.take()
            && let Err(err) = handle.await
        {
            warn!("generation worker did not finish cleanly: {err}");
        }
    }

    /// Snapshot of the current branch's produced text and candidate sets.
    pub fn transcript(&self) -> Transcript {
        self.shared.transcript.lock().clone()
    }

    /// Decodes the text of one candidate in `set`.
    ///
    /// Candidate texts are only decoded on demand; the selected one is
    /// already stored on the set.
    ///
    /// # Errors
    /// Returns an error when no model is loaded, the index is out of range or
    /// the engine cannot detokenize the candidate.
    pub fn decode_candidate(&self, set: &CandidateSet, index: usize) -> Result<String, SessionError> {
        let engine = self.engine.as_ref().ok_or(SessionError::NoModelLoaded)?;
        let candidate = set.get(index).ok_or(SessionError::CandidateOutOfRange {
            index,
            len: set.len(),
        })?;
        if index == set.selected_index() {
            return Ok(set.text().to_string());
        }
        Ok(engine.lock().detokenize(&[candidate.id])?)
    }
}

struct Worker {
    engine: SharedEngine,
    shared: Arc<Shared>,
    tx: SessionEventTx,
    cancel: CancellationToken,
    settings: SampleSettings,
    prompt: String,
}

impl Worker {
    fn run(self) {
        let mut finisher = Finisher {
            shared: Arc::clone(&self.shared),
            tx: self.tx.clone(),
            done: false,
        };
        let reason = match self.drive() {
            Ok(reason) => reason,
            Err(err) => {
                error!("generation failed: {err}");
                EndReason::Failed {
                    message: err.message,
                }
            }
        };
        finisher.finish(reason);
    }

    fn drive(&self) -> Result<EndReason, EngineError> {
        let (mut pending, mut index) = self.prepare_branch()?;
        let mut steps = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(EndReason::Cancelled);
            }
            {
                let mut engine = self.engine.lock();
                if !pending.is_empty() {
                    engine.evaluate(&pending)?;
                }
                if index >= engine.context().len() {
                    return Err(EngineError::new(format!(
                        "engine did not evaluate position {index}"
                    )));
                }
            }

            loop {
                let (token, candidates, text, end_of_generation) = {
                    let mut engine = self.engine.lock();
                    if index >= engine.context().len() {
                        break;
                    }
                    let sampled = engine.sample(index, &self.settings)?;
                    let text = engine.detokenize(&[sampled.token])?;
                    let eog = engine.is_end_of_generation(sampled.token);
                    (sampled.token, sampled.candidates, text, eog)
                };

                self.emit_step(CandidateSet::from_sample(token, candidates, text));
                steps += 1;
                index += 1;
                pending = vec![token];
                let resynced = self.resync(index, token);

                if end_of_generation {
                    return Ok(EndReason::EndOfGeneration);
                }
                if self.cancel.is_cancelled() {
                    return Ok(EndReason::Cancelled);
                }
                if self.settings.reached_limit(steps) {
                    return Ok(EndReason::MaxSamples);
                }
                if resynced {
                    break;
                }
            }
        }
    }

    /// Tokenizes the prompt and rewinds the engine to the longest prefix it
    /// already evaluated. Returns the tokens still to evaluate and the index
    /// of the first position to sample from.
    fn prepare_branch(&self) -> Result<(Vec<TokenId>, usize), EngineError> {
        let mut engine = self.engine.lock();
        let tokens = engine.tokenize(&self.prompt)?;
        if tokens.is_empty() {
            return Err(EngineError::new("prompt produced no tokens"));
        }
        let reused = common_prefix_len(engine.context(), &tokens);
        if reused < tokens.len() && reused < engine.context().len() {
            debug!(reused, "rewinding engine context to shared prefix");
            engine.truncate_context(reused);
        }
        Ok((tokens[reused..].to_vec(), tokens.len() - 1))
    }

    /// Drops the engine's assumed continuation from `index` on when it
    /// disagrees with the token just sampled. Returns true if it truncated.
    fn resync(&self, index: usize, token: TokenId) -> bool {
        let mut engine = self.engine.lock();
        match engine.context().get(index) {
            Some(&assumed) if assumed != token => {
                debug!(index, assumed, token, "resync: truncating engine context");
                engine.truncate_context(index);
                true
            }
            _ => false,
        }
    }

    fn emit_step(&self, candidates: CandidateSet) {
        let candidates = Arc::new(candidates);
        let text = candidates.text().to_string();
        let mut transcript = self.shared.transcript.lock();
        transcript.response_text.push_str(&text);
        transcript.steps.push(Arc::clone(&candidates));
        let _ = self
            .tx
            .send(SessionEvent::StepProduced { candidates, text });
    }
}

/// Sends `SessionEnded` exactly once, even if the worker unwinds.
struct Finisher {
    shared: Arc<Shared>,
    tx: SessionEventTx,
    done: bool,
}

impl Finisher {
    fn finish(&mut self, reason: EndReason) {
        if self.done {
            return;
        }
        self.done = true;
        info!(%reason, "branch ended");
        let _transcript = self.shared.transcript.lock();
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.tx.send(SessionEvent::SessionEnded { reason });
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        self.finish(EndReason::Failed {
            message: "generation worker panicked".to_string(),
        });
    }
}
