use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use tracing::{debug, info, warn};

use crate::backend::{ModelHandle, SessionLoader};
use crate::config::EngineConfig;
use crate::decode::{CancelToken, CorrectionResult, DecodeEngine, DecodeState};
use crate::error::{CorrectorError, Result};
use crate::prompting::{build_prompt, template_markers};
use crate::vocab::Vocabulary;

use super::tokenizer::{resolve_special_tokens, ByteTokenizer};
use super::{CorrectionEngine, LifecycleState, Runtime, Slot};

impl CorrectionEngine {
    pub fn new(config: EngineConfig, loader: impl SessionLoader + 'static) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            loader: Box::new(loader),
            slot: Mutex::new(Slot {
                state: LifecycleState::Uninitialized,
                runtime: None,
                last_error: None,
            }),
        })
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LifecycleState {
        self.lock_slot().state
    }

    /// Cause of the most recent failed initialization, while in Error.
    pub fn last_error(&self) -> Option<CorrectorError> {
        self.lock_slot().last_error.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Decode-loop state, `None` unless a model is loaded.
    pub fn decode_state(&self) -> Option<DecodeState> {
        self.lock_slot().runtime.as_ref().map(|rt| rt.decoder.state())
    }

    /// Shared tokenizer for host-side encode/decode; safe to use from any thread.
    pub fn tokenizer(&self) -> Option<Arc<ByteTokenizer>> {
        self.lock_slot().runtime.as_ref().map(|rt| Arc::clone(&rt.tokenizer))
    }

    pub fn model_handle(&self) -> Option<ModelHandle> {
        self.lock_slot().runtime.as_ref().map(|rt| rt.handle.clone())
    }

    /// Load the vocabulary and scoring session. Valid from Uninitialized,
    /// Error (retry) and Ready (replaces the loaded model).
    pub fn initialize(&self, handle: ModelHandle, vocab_content: &str) -> Result<()> {
        self.run_initialization(|| self.build_runtime(handle, vocab_content))
    }

    /// Like [`initialize`](Self::initialize), reading the vocabulary from disk.
    pub fn initialize_from_paths(&self, model_path: impl AsRef<Path>, vocab_path: impl AsRef<Path>) -> Result<()> {
        let model_path = model_path.as_ref();
        let vocab_path = vocab_path.as_ref();
        self.run_initialization(|| {
            if !model_path.exists() {
                return Err(CorrectorError::Resource(format!(
                    "model not found at {}",
                    model_path.display()
                )));
            }
            let content = std::fs::read_to_string(vocab_path).map_err(|e| {
                CorrectorError::Resource(format!("vocabulary {}: {}", vocab_path.display(), e))
            })?;
            self.build_runtime(ModelHandle::new(model_path), &content)
        })
    }

    fn run_initialization(&self, build: impl FnOnce() -> Result<Runtime>) -> Result<()> {
        {
            let mut slot = self.lock_slot();
            if slot.state == LifecycleState::Loading {
                return Err(CorrectorError::Busy);
            }
            info!(from = ?slot.state, "ENGINE: initializing");
            slot.state = LifecycleState::Loading;
        }

        let outcome = build();

        let mut slot = self.lock_slot();
        let previous = match outcome {
            Ok(runtime) => {
                let previous = slot.runtime.replace(Arc::new(runtime));
                slot.state = LifecycleState::Ready;
                slot.last_error = None;
                info!("ENGINE: ready");
                previous
            }
            Err(e) => {
                let previous = slot.runtime.take();
                slot.state = LifecycleState::Error;
                slot.last_error = Some(e.clone());
                drop(slot);
                warn!(error = %e, "ENGINE: initialization failed");
                drop(previous);
                return Err(e);
            }
        };
        drop(slot);
        drop(previous);
        Ok(())
    }

    fn build_runtime(&self, handle: ModelHandle, vocab_content: &str) -> Result<Runtime> {
        let family = self.config.family;

        let vocab = Arc::new(Vocabulary::load(vocab_content)?);
        info!(entries = vocab.len(), "ENGINE: vocabulary loaded");

        let session = self
            .loader
            .load(&handle)
            .map_err(|e| CorrectorError::Session(format!("{:#}", e)))?;

        let id_bound = vocab.id_bound().max(session.vocab_size().unwrap_or(0));
        let specials = resolve_special_tokens(
            &vocab,
            family,
            self.config.special_tokens,
            self.config.special_threshold,
            id_bound,
        )?;
        info!(
            eos = specials.eos,
            eot = specials.eot,
            threshold = specials.threshold,
            "ENGINE: special tokens identified"
        );

        let mut tokenizer = ByteTokenizer::new(vocab, specials).for_family(family);
        if self.config.recognize_special_markers {
            tokenizer = tokenizer.with_special_markers(template_markers(family));
        }

        Ok(Runtime {
            handle,
            tokenizer: Arc::new(tokenizer),
            session: Mutex::new(session),
            decoder: DecodeEngine::new(self.config.max_new_tokens, family),
        })
    }

    /// Drop the model and vocabulary. No-op when already Uninitialized.
    pub fn unload(&self) -> Result<()> {
        let previous = {
            let mut slot = self.lock_slot();
            match slot.state {
                LifecycleState::Uninitialized => return Ok(()),
                LifecycleState::Loading => return Err(CorrectorError::Busy),
                LifecycleState::Ready | LifecycleState::Error => {}
            }
            info!(from = ?slot.state, "ENGINE: unloading");
            slot.state = LifecycleState::Uninitialized;
            slot.last_error = None;
            slot.runtime.take()
        };
        drop(previous);
        Ok(())
    }

    pub fn correct(&self, text: &str) -> Result<CorrectionResult> {
        self.correct_with_cancel(text, &CancelToken::new())
    }

    /// Correct `text`, giving up with `Cancelled` once `cancel` fires.
    pub fn correct_with_cancel(&self, text: &str, cancel: &CancelToken) -> Result<CorrectionResult> {
        let runtime = {
            let slot = self.lock_slot();
            match (slot.state, slot.runtime.as_ref()) {
                (LifecycleState::Ready, Some(rt)) => Arc::clone(rt),
                (state, _) => return Err(CorrectorError::NotReady(state)),
            }
        };

        let mut session = match runtime.session.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(CorrectorError::Busy),
            // a previous decode panicked inside the session
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let prompt = build_prompt(text, self.config.family);
        let prompt_ids = if self.config.recognize_special_markers {
            runtime.tokenizer.encode_prompt(&prompt)
        } else {
            runtime.tokenizer.encode(&prompt)
        };
        debug!(input_bytes = text.len(), prompt_tokens = prompt_ids.len(), "starting correction");

        runtime
            .decoder
            .run(&mut **session, &runtime.tokenizer, prompt_ids, cancel)
    }
}
