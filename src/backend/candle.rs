use std::path::Path;

use anyhow::{Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;
use tracing::info;

use crate::prompting::PromptFamily;

use super::{Logits, ModelHandle, ModelSession, SessionLoader};

pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    pub fn load_from_gguf(path: &Path, family: PromptFamily, device: &Device) -> Result<(Self, Option<usize>)> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| E::msg(format!("Failed to open model file {}: {}", path.display(), e)))?;
        let content = gguf_file::Content::read(&mut file)?;

        let vocab_size = match content.metadata.get("tokenizer.ggml.tokens") {
            Some(gguf_file::Value::Array(tokens)) => Some(tokens.len()),
            _ => None,
        };

        let model = match family {
            // Mistral GGUF exports use the llama tensor layout.
            PromptFamily::Llama | PromptFamily::Mistral => {
                Self::Llama(quantized_llama::ModelWeights::from_gguf(content, &mut file, device)?)
            }
            PromptFamily::Qwen => {
                match quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device) {
                    Ok(model) => Self::Qwen2(model),
                    Err(e) => {
                        let msg = format!("{}", e);
                        if msg.contains("cannot find tensor info for output_norm.weight") {
                            return Err(E::msg(
                                "Qwen load failed: missing 'output_norm.weight'. The GGUF is likely an incomplete split shard. Use a full single-file GGUF.",
                            ));
                        }
                        return Err(E::msg(msg));
                    }
                }
            }
        };

        Ok((model, vocab_size))
    }

    /// Position 0 makes the weights discard their internal KV cache, so each
    /// call scores the given sequence from scratch.
    pub fn forward(&mut self, input_tensor: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input_tensor, position)?),
            Self::Qwen2(model) => Ok(model.forward(input_tensor, position)?),
        }
    }
}

/// CPU scoring session over quantized GGUF weights.
pub struct CandleSession {
    model: RuntimeModel,
    device: Device,
    vocab_size: Option<usize>,
}

impl CandleSession {
    pub fn load(path: &Path, family: PromptFamily) -> Result<Self> {
        info!(path = %path.display(), ?family, "loading GGUF weights");
        let device = Device::Cpu;
        let (model, vocab_size) = RuntimeModel::load_from_gguf(path, family, &device)?;
        info!(?vocab_size, "GGUF weights loaded");
        Ok(Self {
            model,
            device,
            vocab_size,
        })
    }
}

impl ModelSession for CandleSession {
    fn vocab_size(&self) -> Option<usize> {
        self.vocab_size
    }

    fn score(&mut self, input_ids: &[u32], _attention_mask: &[u32]) -> Result<Option<Logits>> {
        // The quantized weights build their own causal mask.
        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, 0)?;
        let row = logits
            .squeeze(0)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Some(Logits::from_last_position(row)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CandleLoader {
    pub family: PromptFamily,
}

impl SessionLoader for CandleLoader {
    fn load(&self, handle: &ModelHandle) -> Result<Box<dyn ModelSession>> {
        Ok(Box::new(CandleSession::load(handle.path(), self.family)?))
    }
}
