use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{CorrectorError, Result};

/// Immutable token <-> id mapping, built once at load time.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    token_to_id: HashMap<String, u32>,
    id_to_token: HashMap<u32, String>,
    id_bound: usize,
}

impl Vocabulary {
    /// Parse a vocabulary resource.
    ///
    /// Accepts either a flat `{"token": id}` object or a `tokenizer.json`
    /// document, in which case `model.vocab` is merged with `added_tokens`.
    pub fn load(content: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(content)
            .map_err(|e| CorrectorError::Format(format!("invalid JSON: {}", e)))?;
        let root = doc
            .as_object()
            .ok_or_else(|| CorrectorError::Format("expected a JSON object of token -> id".to_string()))?;

        let mut vocab = Self::default();

        match root.get("model").and_then(|m| m.get("vocab")) {
            Some(model_vocab) => {
                let entries = model_vocab.as_object().ok_or_else(|| {
                    CorrectorError::Format("tokenizer.json 'model.vocab' is not an object".to_string())
                })?;
                vocab.extend_from_map(entries)?;

                if let Some(added) = root.get("added_tokens") {
                    let added = added.as_array().ok_or_else(|| {
                        CorrectorError::Format("tokenizer.json 'added_tokens' is not an array".to_string())
                    })?;
                    for item in added {
                        let token = item.get("content").and_then(Value::as_str).ok_or_else(|| {
                            CorrectorError::Format("added token without string 'content'".to_string())
                        })?;
                        let raw = item.get("id").ok_or_else(|| {
                            CorrectorError::Format(format!("added token '{}' has no 'id'", token))
                        })?;
                        vocab.insert(token, parse_id(token, raw)?)?;
                    }
                }
            }
            None => vocab.extend_from_map(root)?,
        }

        Ok(vocab)
    }

    fn extend_from_map(&mut self, entries: &Map<String, Value>) -> Result<()> {
        self.token_to_id.reserve(entries.len());
        self.id_to_token.reserve(entries.len());
        for (token, raw) in entries {
            self.insert(token, parse_id(token, raw)?)?;
        }
        Ok(())
    }

    fn insert(&mut self, token: &str, id: u32) -> Result<()> {
        if let Some(existing) = self.id_to_token.get(&id) {
            if existing == token {
                return Ok(());
            }
            return Err(CorrectorError::Format(format!(
                "duplicate id {}: '{}' and '{}'",
                id, existing, token
            )));
        }
        if let Some(existing) = self.token_to_id.get(token) {
            return Err(CorrectorError::Format(format!(
                "token '{}' mapped to both {} and {}",
                token, existing, id
            )));
        }

        self.token_to_id.insert(token.to_string(), id);
        self.id_to_token.insert(id, token.to_string());
        self.id_bound = self.id_bound.max(id as usize + 1);
        Ok(())
    }

    pub fn id_for(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn token_for(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_id.is_empty()
    }

    /// One past the largest id present (ids may be sparse).
    pub fn id_bound(&self) -> usize {
        self.id_bound
    }
}

fn parse_id(token: &str, raw: &Value) -> Result<u32> {
    if let Some(id) = raw.as_u64() {
        return u32::try_from(id)
            .map_err(|_| CorrectorError::Format(format!("id {} for '{}' is out of range", id, token)));
    }
    if raw.as_i64().is_some_and(|v| v < 0) {
        return Err(CorrectorError::Format(format!("negative id {} for '{}'", raw, token)));
    }
    Err(CorrectorError::Format(format!("non-integer id {} for '{}'", raw, token)))
}
