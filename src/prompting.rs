use serde::Deserialize;

/// Instruction placed before the user's text inside the user turn.
pub const CORRECTION_INSTRUCTION: &str = "Correct this text: ";

/// How a family's vocabulary spells raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceScheme {
    /// GPT-2 byte glyphs: every byte has a printable stand-in, space is `Ġ`.
    ByteLevel,
    /// SentencePiece: `▁` marks a word boundary, other bytes use `<0xNN>`.
    SentencePiece,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFamily {
    #[default]
    Qwen,
    Llama,
    Mistral,
}

impl PromptFamily {
    /// End-of-sequence and end-of-turn marker strings for this chat format.
    pub fn stop_markers(self) -> (&'static str, &'static str) {
        match self {
            PromptFamily::Qwen => ("<|endoftext|>", "<|im_end|>"),
            PromptFamily::Llama => ("<|end_of_text|>", "<|eot_id|>"),
            PromptFamily::Mistral => ("</s>", "</s>"),
        }
    }

    /// Published ids of the stop markers, used when the vocabulary resource
    /// carries only the base vocab and not the added special tokens.
    pub fn default_stop_ids(self) -> (u32, u32) {
        match self {
            PromptFamily::Qwen => (151_643, 151_645),
            PromptFamily::Llama => (128_001, 128_009),
            PromptFamily::Mistral => (2, 2),
        }
    }

    pub fn piece_scheme(self) -> PieceScheme {
        match self {
            PromptFamily::Qwen | PromptFamily::Llama => PieceScheme::ByteLevel,
            PromptFamily::Mistral => PieceScheme::SentencePiece,
        }
    }

    /// Structural tokens that decode never renders, wherever their ids fall.
    pub fn reserved_markers(self) -> &'static [&'static str] {
        match self {
            PromptFamily::Qwen => &["<|endoftext|>", "<|im_start|>", "<|im_end|>"],
            PromptFamily::Llama => &[
                "<|begin_of_text|>",
                "<|end_of_text|>",
                "<|start_header_id|>",
                "<|end_header_id|>",
                "<|eot_id|>",
            ],
            PromptFamily::Mistral => &["<unk>", "<s>", "</s>"],
        }
    }
}

/// Wrap `raw` in the family's single-turn correction template, leaving an
/// empty assistant turn open for the model to fill.
///
/// `raw` is inserted verbatim; surrounding whitespace is significant to the
/// trained model.
pub fn build_prompt(raw: &str, family: PromptFamily) -> String {
    match family {
        PromptFamily::Qwen => format!(
            "<|im_start|>user\n{}{}<|im_end|>\n<|im_start|>assistant\n",
            CORRECTION_INSTRUCTION, raw
        ),
        PromptFamily::Llama => format!(
            "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\n{}{}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n",
            CORRECTION_INSTRUCTION, raw
        ),
        PromptFamily::Mistral => format!("<s>[INST] {}{} [/INST]", CORRECTION_INSTRUCTION, raw),
    }
}

/// Markup that may survive decoding when the model spells a marker out of
/// ordinary tokens; stripped from the final text.
pub fn residual_markup(family: PromptFamily) -> &'static [&'static str] {
    match family {
        PromptFamily::Qwen => &["<|im_end|>", "<|endoftext|>", "<|im_start|>"],
        PromptFamily::Llama => &[
            "<|eot_id|>",
            "<|end_of_text|>",
            "<|begin_of_text|>",
            "<|start_header_id|>",
            "<|end_header_id|>",
        ],
        PromptFamily::Mistral => &["</s>", "<s>", "[INST]", "[/INST]"],
    }
}

/// Special markers a prompt of this family contains; these are mapped to
/// single ids when the vocabulary knows them.
pub fn template_markers(family: PromptFamily) -> &'static [&'static str] {
    match family {
        PromptFamily::Qwen => &["<|im_start|>", "<|im_end|>", "<|endoftext|>"],
        PromptFamily::Llama => &[
            "<|begin_of_text|>",
            "<|start_header_id|>",
            "<|end_header_id|>",
            "<|eot_id|>",
            "<|end_of_text|>",
        ],
        PromptFamily::Mistral => &["<s>", "</s>"],
    }
}

pub fn strip_residual_markup(text: &str, family: PromptFamily) -> String {
    let mut cleaned = text.to_string();
    for marker in residual_markup(family) {
        if cleaned.contains(marker) {
            cleaned = cleaned.replace(marker, "");
        }
    }
    cleaned
}
