use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace, warn};

use crate::backend::ModelSession;
use crate::engine::ByteTokenizer;
use crate::error::{CorrectorError, Result};
use crate::prompting::{strip_residual_markup, PromptFamily};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Idle,
    Generating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    TurnEnd,
    /// Step cap reached; the text is truncated, not wrong.
    MaxTokens,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionResult {
    pub text: String,
    pub new_tokens: usize,
    pub stop: StopReason,
}

/// Host-side cancellation flag, checked around every scoring call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Ids of one correction: the encoded prompt followed by generated ids.
struct TokenSequence {
    ids: Vec<u32>,
    mask: Vec<u32>,
    prompt_len: usize,
}

impl TokenSequence {
    fn new(prompt_ids: Vec<u32>, max_new_tokens: usize) -> Self {
        let prompt_len = prompt_ids.len();
        let mut ids = prompt_ids;
        ids.reserve(max_new_tokens);
        let mut mask = vec![1; prompt_len];
        mask.reserve(max_new_tokens);
        Self {
            ids,
            mask,
            prompt_len,
        }
    }

    fn push(&mut self, id: u32) {
        self.ids.push(id);
        self.mask.push(1);
    }

    fn generated(&self) -> &[u32] {
        &self.ids[self.prompt_len..]
    }

    fn new_tokens(&self) -> usize {
        self.ids.len() - self.prompt_len
    }
}

/// Index of the highest score; ties go to the lowest index and NaN never wins.
pub fn greedy_argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Greedy autoregressive loop over a [`ModelSession`].
///
/// The full sequence is re-scored every step; the session is the place to
/// add an incremental cache.
pub struct DecodeEngine {
    state: Mutex<DecodeState>,
    max_new_tokens: usize,
    family: PromptFamily,
}

impl DecodeEngine {
    pub fn new(max_new_tokens: usize, family: PromptFamily) -> Self {
        Self {
            state: Mutex::new(DecodeState::Idle),
            max_new_tokens,
            family,
        }
    }

    pub fn state(&self) -> DecodeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: DecodeState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    /// Generate a correction for already-encoded prompt ids.
    ///
    /// Leaves the engine Idle on return or unwind, whatever the outcome.
    pub fn run(
        &self,
        session: &mut dyn ModelSession,
        tokenizer: &ByteTokenizer,
        prompt_ids: Vec<u32>,
        cancel: &CancelToken,
    ) -> Result<CorrectionResult> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != DecodeState::Idle {
                return Err(CorrectorError::Busy);
            }
            *state = DecodeState::Generating;
        }
        // also restores Idle when the session unwinds mid-step
        let _idle = IdleOnDrop(self);

        let prompt_len = prompt_ids.len();
        let outcome = self.generate(session, tokenizer, prompt_ids, cancel);

        match &outcome {
            Ok(result) => {
                self.transition(DecodeState::Completed);
                debug!(
                    prompt_tokens = prompt_len,
                    new_tokens = result.new_tokens,
                    stop = ?result.stop,
                    "correction completed"
                );
            }
            Err(CorrectorError::Cancelled) => {
                warn!(prompt_tokens = prompt_len, "correction cancelled, partial sequence discarded");
            }
            Err(e) => {
                self.transition(DecodeState::Failed);
                warn!(prompt_tokens = prompt_len, error = %e, "correction failed");
            }
        }

        outcome
    }

    fn generate(
        &self,
        session: &mut dyn ModelSession,
        tokenizer: &ByteTokenizer,
        prompt_ids: Vec<u32>,
        cancel: &CancelToken,
    ) -> Result<CorrectionResult> {
        let specials = tokenizer.specials();
        let mut seq = TokenSequence::new(prompt_ids, self.max_new_tokens);

        let stop = loop {
            if cancel.is_cancelled() {
                return Err(CorrectorError::Cancelled);
            }

            let logits = session
                .score(&seq.ids, &seq.mask)
                .map_err(|e| CorrectorError::Correction(format!("{:#}", e)))?
                .ok_or_else(|| CorrectorError::NoOutput("session returned no logits".to_string()))?;

            if cancel.is_cancelled() {
                return Err(CorrectorError::Cancelled);
            }

            let row = logits.last_position().ok_or_else(|| {
                CorrectorError::NoOutput(format!(
                    "malformed logits: {} positions x {} vocab",
                    logits.positions(),
                    logits.vocab_size()
                ))
            })?;
            let next = greedy_argmax(row)
                .ok_or_else(|| CorrectorError::NoOutput("no finite score in final position".to_string()))?;
            let next = u32::try_from(next)
                .map_err(|_| CorrectorError::NoOutput(format!("token index {} exceeds id range", next)))?;

            seq.push(next);
            trace!(step = seq.new_tokens(), token = next, "decode step");

            if next == specials.eos {
                break StopReason::EndOfSequence;
            }
            if next == specials.eot {
                break StopReason::TurnEnd;
            }
            if seq.new_tokens() >= self.max_new_tokens {
                break StopReason::MaxTokens;
            }
        };

        let decoded = tokenizer.decode(seq.generated());
        let text = strip_residual_markup(&decoded, self.family).trim().to_string();

        Ok(CorrectionResult {
            text,
            new_tokens: seq.new_tokens(),
            stop,
        })
    }
}

struct IdleOnDrop<'a>(&'a DecodeEngine);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.transition(DecodeState::Idle);
    }
}
