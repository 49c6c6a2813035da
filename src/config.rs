use std::path::Path;

use serde::Deserialize;

use crate::error::{CorrectorError, Result};
use crate::prompting::PromptFamily;

pub const DEFAULT_MAX_NEW_TOKENS: usize = 100;

/// Explicit stop-marker ids, overriding lookup by marker string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SpecialTokenIds {
    pub eos: u32,
    pub eot: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub family: PromptFamily,
    /// Cap on ids generated per correction; reaching it truncates, it is not an error.
    pub max_new_tokens: usize,
    /// Map chat-template markers in the prompt to their single special ids.
    pub recognize_special_markers: bool,
    pub special_tokens: Option<SpecialTokenIds>,
    /// Ids at or above this are never rendered by decode. Defaults to the
    /// smaller of the resolved stop ids for byte-level families and to no
    /// cut-off for SentencePiece ones.
    pub special_threshold: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            family: PromptFamily::Qwen,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            recognize_special_markers: true,
            special_tokens: None,
            special_threshold: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: EngineConfig =
            toml::from_str(raw).map_err(|e| CorrectorError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CorrectorError::Resource(format!("config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_special_tokens(mut self, eos: u32, eot: u32) -> Self {
        self.special_tokens = Some(SpecialTokenIds { eos, eot });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(CorrectorError::Config("max_new_tokens must be > 0".to_string()));
        }
        Ok(())
    }
}
