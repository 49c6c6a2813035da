mod lifecycle;
mod tokenizer;

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::backend::{ModelHandle, ModelSession, SessionLoader};
use crate::config::EngineConfig;
use crate::decode::DecodeEngine;
use crate::error::CorrectorError;

pub use tokenizer::{byte_fallback_token, resolve_special_tokens, ByteTokenizer, SpecialTokens};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Loading,
    Ready,
    Error,
}

/// Everything a loaded engine owns. Shared with in-flight corrections so an
/// unload never pulls the session out from under a running decode.
pub(super) struct Runtime {
    pub(super) handle: ModelHandle,
    pub(super) tokenizer: Arc<ByteTokenizer>,
    pub(super) session: Mutex<Box<dyn ModelSession>>,
    pub(super) decoder: DecodeEngine,
}

impl Drop for Runtime {
    fn drop(&mut self) {
        debug!(model = %self.handle.path().display(), "releasing model session and vocabulary");
    }
}

pub(super) struct Slot {
    pub(super) state: LifecycleState,
    pub(super) runtime: Option<Arc<Runtime>>,
    pub(super) last_error: Option<CorrectorError>,
}

/// A text-correction engine instance.
///
/// Construct one per model; instances share nothing, so tests and hosts can
/// run several side by side. All methods take `&self`; wrap in an `Arc` to
/// hand the engine to worker threads.
pub struct CorrectionEngine {
    pub(super) config: EngineConfig,
    pub(super) loader: Box<dyn SessionLoader>,
    pub(super) slot: Mutex<Slot>,
}
