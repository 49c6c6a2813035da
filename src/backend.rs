//! Scoring-function boundary.
//!
//! The engine only ever sees [`ModelSession`]: give it the whole sequence so
//! far, get next-token scores back. Backends (candle, ONNX, accelerators) plug
//! in here. A session may keep an incremental cache internally; the engine's
//! contract stays "full sequence in, scores out".

use std::path::{Path, PathBuf};

#[cfg(feature = "candle")]
mod candle;

#[cfg(feature = "candle")]
pub use self::candle::{CandleLoader, CandleSession, RuntimeModel};

/// Opaque reference to the frozen model resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHandle {
    path: PathBuf,
}

impl ModelHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Score tensor of shape `positions x vocab_size`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    data: Vec<f32>,
    positions: usize,
    vocab_size: usize,
}

impl Logits {
    pub fn new(data: Vec<f32>, positions: usize, vocab_size: usize) -> Self {
        Self {
            data,
            positions,
            vocab_size,
        }
    }

    /// Backends that only materialize the final position.
    pub fn from_last_position(row: Vec<f32>) -> Self {
        let vocab_size = row.len();
        Self::new(row, 1, vocab_size)
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Scores for the final position, or `None` if the shape is inconsistent.
    pub fn last_position(&self) -> Option<&[f32]> {
        if self.positions == 0 || self.vocab_size == 0 {
            return None;
        }
        let expected = self.positions.checked_mul(self.vocab_size)?;
        if self.data.len() != expected {
            return None;
        }
        Some(&self.data[(self.positions - 1) * self.vocab_size..])
    }
}

/// Stateless next-token scoring function.
pub trait ModelSession: Send {
    /// Width of the score rows, when the backend knows it up front.
    fn vocab_size(&self) -> Option<usize> {
        None
    }

    /// Score `input_ids` with an equal-length all-ones `attention_mask`.
    ///
    /// `Ok(None)` means the backend produced no logits output.
    fn score(&mut self, input_ids: &[u32], attention_mask: &[u32]) -> anyhow::Result<Option<Logits>>;
}

/// Builds a [`ModelSession`] from a model handle during initialization.
pub trait SessionLoader: Send + Sync {
    fn load(&self, handle: &ModelHandle) -> anyhow::Result<Box<dyn ModelSession>>;
}

impl<F> SessionLoader for F
where
    F: Fn(&ModelHandle) -> anyhow::Result<Box<dyn ModelSession>> + Send + Sync,
{
    fn load(&self, handle: &ModelHandle) -> anyhow::Result<Box<dyn ModelSession>> {
        self(handle)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{Logits, ModelSession};

    /// Session driven by a closure over the current sequence.
    pub struct FnSession<F> {
        score_fn: F,
        vocab_size: Option<usize>,
        drops: Option<Arc<AtomicUsize>>,
    }

    impl<F> FnSession<F>
    where
        F: FnMut(&[u32]) -> anyhow::Result<Option<Logits>> + Send,
    {
        pub fn new(score_fn: F) -> Self {
            Self {
                score_fn,
                vocab_size: None,
                drops: None,
            }
        }

        pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
            self.vocab_size = Some(vocab_size);
            self
        }

        pub fn counting_drops(mut self, drops: Arc<AtomicUsize>) -> Self {
            self.drops = Some(drops);
            self
        }
    }

    impl<F> ModelSession for FnSession<F>
    where
        F: FnMut(&[u32]) -> anyhow::Result<Option<Logits>> + Send,
    {
        fn vocab_size(&self) -> Option<usize> {
            self.vocab_size
        }

        fn score(&mut self, input_ids: &[u32], attention_mask: &[u32]) -> anyhow::Result<Option<Logits>> {
            assert_eq!(input_ids.len(), attention_mask.len());
            assert!(attention_mask.iter().all(|&m| m == 1));
            (self.score_fn)(input_ids)
        }
    }

    impl<F> Drop for FnSession<F> {
        fn drop(&mut self) {
            if let Some(drops) = &self.drops {
                drops.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Row of `vocab` zeros with `pick` scored highest.
    pub fn one_hot(vocab: usize, pick: u32) -> Vec<f32> {
        let mut row = vec![0.0; vocab];
        row[pick as usize] = 1.0;
        row
    }

    /// Full `n x vocab` logits whose final row favours `pick`.
    pub fn logits_favouring(n: usize, vocab: usize, pick: u32) -> Logits {
        let mut data = vec![0.0; n.max(1) * vocab];
        let last = (n.max(1) - 1) * vocab;
        data[last + pick as usize] = 1.0;
        Logits::new(data, n.max(1), vocab)
    }

    /// Session that always favours `pick`.
    pub fn always(
        vocab: usize,
        pick: u32,
    ) -> FnSession<impl FnMut(&[u32]) -> anyhow::Result<Option<Logits>> + Send> {
        FnSession::new(move |ids: &[u32]| Ok(Some(logits_favouring(ids.len(), vocab, pick))))
            .with_vocab_size(vocab)
    }

    /// Session that emits `script` in order, then keeps repeating its last id.
    pub fn scripted(
        vocab: usize,
        script: Vec<u32>,
    ) -> FnSession<impl FnMut(&[u32]) -> anyhow::Result<Option<Logits>> + Send> {
        let mut step = 0usize;
        FnSession::new(move |ids: &[u32]| {
            let pick = script[step.min(script.len() - 1)];
            step += 1;
            Ok(Some(logits_favouring(ids.len(), vocab, pick)))
        })
        .with_vocab_size(vocab)
    }
}
