//! On-device typing correction.
//!
//! Wraps noisy text in a fixed instruction prompt, tokenizes it byte by byte
//! against a frozen vocabulary, and greedily decodes a correction through a
//! pluggable [`ModelSession`](backend::ModelSession).
//!
//! ```no_run
//! use typing_corrector::{CorrectionEngine, EngineConfig};
//! # fn loader(_: &typing_corrector::ModelHandle) -> anyhow::Result<Box<dyn typing_corrector::ModelSession>> { unimplemented!() }
//!
//! let engine = CorrectionEngine::new(EngineConfig::default(), loader)?;
//! engine.initialize_from_paths("models/corrector.gguf", "models/vocab.json")?;
//! let fixed = engine.correct("teh quikc brown fox")?;
//! println!("{}", fixed.text);
//! # Ok::<(), typing_corrector::CorrectorError>(())
//! ```

pub mod backend;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod prompting;
pub mod telemetry;
pub mod vocab;

pub use backend::{Logits, ModelHandle, ModelSession, SessionLoader};
pub use config::EngineConfig;
pub use decode::{CancelToken, CorrectionResult, DecodeState, StopReason};
pub use engine::{ByteTokenizer, CorrectionEngine, LifecycleState, SpecialTokens};
pub use error::{CorrectorError, Result};
pub use prompting::{build_prompt, PieceScheme, PromptFamily};
pub use vocab::Vocabulary;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
