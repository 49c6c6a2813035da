use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use tracing::trace;

use crate::config::SpecialTokenIds;
use crate::error::{CorrectorError, Result};
use crate::prompting::{PieceScheme, PromptFamily};
use crate::vocab::Vocabulary;

/// Stop-marker ids and the decode cut-off for reserved ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub eos: u32,
    pub eot: u32,
    /// Ids at or above this are structural and never rendered. `u32::MAX`
    /// disables the cut-off.
    pub threshold: u32,
}

impl SpecialTokens {
    pub fn new(eos: u32, eot: u32, threshold: u32) -> Self {
        Self { eos, eot, threshold }
    }
}

struct ByteGlyphs {
    byte_to_glyph: [char; 256],
    glyph_to_byte: HashMap<char, u8>,
}

/// GPT-2 style byte <-> glyph table: printable Latin-1 bytes stand for
/// themselves, the rest are shifted to U+0100.. in byte order, so space is
/// `Ġ` and newline is `Ċ`.
fn glyphs() -> &'static ByteGlyphs {
    static GLYPHS: OnceLock<ByteGlyphs> = OnceLock::new();
    GLYPHS.get_or_init(|| {
        let mut byte_to_glyph = [char::REPLACEMENT_CHARACTER; 256];
        let mut glyph_to_byte = HashMap::with_capacity(256);
        let mut shifted = 0u32;
        for b in 0..=255u8 {
            let glyph = if matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF) {
                char::from(b)
            } else {
                let c = char::from_u32(256 + shifted).unwrap_or(char::REPLACEMENT_CHARACTER);
                shifted += 1;
                c
            };
            byte_to_glyph[b as usize] = glyph;
            glyph_to_byte.insert(glyph, b);
        }
        ByteGlyphs {
            byte_to_glyph,
            glyph_to_byte,
        }
    })
}

/// SentencePiece word-boundary glyph, rendered as a space.
const WORD_BOUNDARY: char = '\u{2581}';

pub(crate) fn byte_glyph(b: u8) -> char {
    glyphs().byte_to_glyph[b as usize]
}

/// Byte-fallback token name, e.g. `<0x0A>`.
pub fn byte_fallback_token(b: u8) -> String {
    format!("<0x{:02X}>", b)
}

fn parse_byte_fallback(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Byte-level tokenizer over a loaded [`Vocabulary`].
///
/// Encoding never fails: a byte with no canonical glyph token, no literal
/// ASCII token and no `<0xNN>` fallback is dropped. Decoding never fails:
/// reserved and unknown ids are skipped.
///
/// Starts out byte-level; [`for_family`](Self::for_family) switches to the
/// family's piece scheme and reserved markers.
pub struct ByteTokenizer {
    vocab: Arc<Vocabulary>,
    specials: SpecialTokens,
    scheme: PieceScheme,
    byte_ids: [Option<u32>; 256],
    reserved: HashSet<u32>,
    markers: Vec<(String, u32)>,
}

impl ByteTokenizer {
    pub fn new(vocab: Arc<Vocabulary>, specials: SpecialTokens) -> Self {
        let scheme = PieceScheme::ByteLevel;
        Self {
            byte_ids: byte_ids(&vocab, scheme),
            reserved: HashSet::from([specials.eos, specials.eot]),
            vocab,
            specials,
            scheme,
            markers: Vec::new(),
        }
    }

    /// Adopt `family`'s piece scheme and skip its reserved markers on decode.
    pub fn for_family(mut self, family: PromptFamily) -> Self {
        self.scheme = family.piece_scheme();
        self.byte_ids = byte_ids(&self.vocab, self.scheme);
        let vocab = &self.vocab;
        self.reserved
            .extend(family.reserved_markers().iter().filter_map(|m| vocab.id_for(m)));
        self
    }

    /// Register special markers that `encode_prompt` maps straight to ids.
    /// Markers missing from the vocabulary are ignored.
    pub fn with_special_markers(mut self, markers: &[&str]) -> Self {
        self.markers = markers
            .iter()
            .filter(|m| !m.is_empty())
            .filter_map(|m| self.vocab.id_for(m).map(|id| (m.to_string(), id)))
            .collect();
        self.markers.sort_by_key(|(m, _)| Reverse(m.len()));
        self
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn specials(&self) -> SpecialTokens {
        self.specials
    }

    pub fn scheme(&self) -> PieceScheme {
        self.scheme
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::with_capacity(text.len());
        for &b in text.as_bytes() {
            match self.byte_ids[b as usize] {
                Some(id) => ids.push(id),
                None => trace!(byte = b, "dropping byte with no vocabulary entry"),
            }
        }
        ids
    }

    /// Like [`encode`](Self::encode), but registered special markers become
    /// their single ids instead of being spelled out byte by byte.
    pub fn encode_prompt(&self, text: &str) -> Vec<u32> {
        if self.markers.is_empty() {
            return self.encode(text);
        }

        let mut ids = Vec::with_capacity(text.len());
        let mut rest = text;
        while !rest.is_empty() {
            // earliest match wins, longer marker on a tie
            let next = self
                .markers
                .iter()
                .filter_map(|(marker, id)| rest.find(marker.as_str()).map(|pos| (pos, marker.len(), *id)))
                .min_by_key(|&(pos, len, _)| (pos, Reverse(len)));

            match next {
                Some((pos, len, id)) => {
                    ids.extend(self.encode(&rest[..pos]));
                    ids.push(id);
                    rest = &rest[pos + len..];
                }
                None => {
                    ids.extend(self.encode(rest));
                    break;
                }
            }
        }
        ids
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        let table = glyphs();
        let mut bytes = Vec::with_capacity(ids.len() * 2);

        for &id in ids {
            if id >= self.specials.threshold || self.reserved.contains(&id) {
                continue;
            }
            let Some(token) = self.vocab.token_for(id) else {
                trace!(id, "skipping unknown id");
                continue;
            };

            if let Some(b) = parse_byte_fallback(token) {
                bytes.push(b);
                continue;
            }

            for c in token.chars() {
                let glyph_byte = match self.scheme {
                    PieceScheme::ByteLevel => table.glyph_to_byte.get(&c).copied(),
                    PieceScheme::SentencePiece => (c == WORD_BOUNDARY).then_some(b' '),
                };
                match glyph_byte {
                    Some(b) => bytes.push(b),
                    None => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
        }

        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn byte_ids(vocab: &Vocabulary, scheme: PieceScheme) -> [Option<u32>; 256] {
    let mut ids = [None; 256];
    for b in 0..=255u8 {
        ids[b as usize] = resolve_byte(vocab, b, scheme);
    }
    ids
}

fn resolve_byte(vocab: &Vocabulary, b: u8, scheme: PieceScheme) -> Option<u32> {
    let mut buf = [0u8; 4];
    let glyph = match scheme {
        PieceScheme::ByteLevel => Some(byte_glyph(b)),
        PieceScheme::SentencePiece if b == b' ' => Some(WORD_BOUNDARY),
        // non-ASCII bytes only exist as <0xNN> pieces here
        PieceScheme::SentencePiece => None,
    };
    if let Some(id) = glyph.and_then(|g| vocab.id_for(g.encode_utf8(&mut buf))) {
        return Some(id);
    }
    if b.is_ascii() && Some(char::from(b)) != glyph {
        if let Some(id) = vocab.id_for(char::from(b).encode_utf8(&mut buf)) {
            return Some(id);
        }
    }
    vocab.id_for(&byte_fallback_token(b))
}

/// Pick the stop-marker ids: explicit ids first, then the family's marker
/// strings in the vocabulary, then the family's published ids. Both must lie
/// below `id_bound`.
pub fn resolve_special_tokens(
    vocab: &Vocabulary,
    family: PromptFamily,
    explicit: Option<SpecialTokenIds>,
    threshold: Option<u32>,
    id_bound: usize,
) -> Result<SpecialTokens> {
    let (eos, eot) = match explicit {
        Some(ids) => (ids.eos, ids.eot),
        None => {
            let (eos_marker, eot_marker) = family.stop_markers();
            let (eos_default, eot_default) = family.default_stop_ids();
            (
                vocab.id_for(eos_marker).unwrap_or(eos_default),
                vocab.id_for(eot_marker).unwrap_or(eot_default),
            )
        }
    };

    for (name, id) in [("end-of-sequence", eos), ("turn-end", eot)] {
        if id as usize >= id_bound {
            return Err(CorrectorError::Format(format!(
                "{} id {} outside vocabulary range 0..{}",
                name, id, id_bound
            )));
        }
    }

    let threshold = threshold.unwrap_or(match family.piece_scheme() {
        PieceScheme::ByteLevel => eos.min(eot),
        // specials sit at the bottom of the id range; reserved ids cover them
        PieceScheme::SentencePiece => u32::MAX,
    });
    Ok(SpecialTokens::new(eos, eot, threshold))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Map, Value};

    use super::{byte_fallback_token, byte_glyph, resolve_special_tokens, ByteTokenizer, SpecialTokens};
    use crate::config::SpecialTokenIds;
    use crate::error::CorrectorError;
    use crate::prompting::{PieceScheme, PromptFamily};
    use crate::vocab::Vocabulary;

    fn tokenizer(json: &str, specials: SpecialTokens) -> ByteTokenizer {
        ByteTokenizer::new(Arc::new(Vocabulary::load(json).expect("load vocab")), specials)
    }

    /// Vocabulary with one glyph token per byte (ids 0..256) plus two specials.
    fn byte_level_json() -> String {
        let mut map = Map::new();
        for b in 0..=255u8 {
            map.insert(byte_glyph(b).to_string(), Value::from(b as u64));
        }
        map.insert("<|endoftext|>".to_string(), Value::from(300u64));
        map.insert("<|im_end|>".to_string(), Value::from(301u64));
        map.insert("<|im_start|>".to_string(), Value::from(302u64));
        Value::Object(map).to_string()
    }

    #[test]
    fn encodes_hello_with_single_byte_tokens() {
        let tok = tokenizer(r#"{"h":1,"e":2,"l":3,"o":4}"#, SpecialTokens::new(100, 101, 100));
        assert_eq!(tok.encode("hello"), vec![1, 2, 3, 3, 4]);
    }

    #[test]
    fn glyph_table_matches_byte_level_convention() {
        assert_eq!(byte_glyph(b' '), 'Ġ');
        assert_eq!(byte_glyph(b'\n'), 'Ċ');
        assert_eq!(byte_glyph(b'a'), 'a');
        assert_eq!(byte_glyph(0xE9), 'é');
        assert_eq!(byte_fallback_token(0x0A), "<0x0A>");
    }

    #[test]
    fn space_resolves_through_glyph_or_literal() {
        let glyph = tokenizer(r#"{"a":1,"Ġ":2}"#, SpecialTokens::new(9, 9, 9));
        assert_eq!(glyph.encode("a a"), vec![1, 2, 1]);
        assert_eq!(glyph.decode(&[1, 2, 1]), "a a");

        let literal = tokenizer(r#"{"a":1," ":2}"#, SpecialTokens::new(9, 9, 9));
        assert_eq!(literal.encode("a a"), vec![1, 2, 1]);
        assert_eq!(literal.decode(&[1, 2, 1]), "a a");
    }

    #[test]
    fn byte_fallback_tokens_cover_missing_glyphs() {
        let tok = tokenizer(r#"{"a":1,"<0x0A>":2,"<0xC3>":3,"<0xA9>":4}"#, SpecialTokens::new(9, 9, 9));
        assert_eq!(tok.encode("a\né"), vec![1, 2, 3, 4]);
        assert_eq!(tok.decode(&[1, 2, 3, 4]), "a\né");
    }

    #[test]
    fn unencodable_bytes_are_dropped() {
        let tok = tokenizer(r#"{"h":1,"i":2}"#, SpecialTokens::new(9, 9, 9));
        assert_eq!(tok.encode("h?i!"), vec![1, 2]);
        assert!(tok.encode("").is_empty());
        assert!(tok.encode("???").is_empty());
    }

    #[test]
    fn decode_skips_reserved_and_unknown_ids() {
        let tok = tokenizer(r#"{"o":1,"k":2,"<|im_end|>":10}"#, SpecialTokens::new(10, 10, 10));
        assert_eq!(tok.decode(&[1, 10, 55, 2]), "ok");
        assert_eq!(tok.decode(&[]), "");
    }

    #[test]
    fn decode_keeps_order_and_adds_no_whitespace() {
        let tok = tokenizer(r#"{"Ġthe":1,"Ġcat":2,"s":3}"#, SpecialTokens::new(9, 9, 9));
        assert_eq!(tok.decode(&[1, 2, 3]), " the cats");
        assert_eq!(tok.decode(&[3, 2, 1]), "s cat the");
    }

    #[test]
    fn byte_level_round_trip_covers_multibyte_text() {
        let tok = tokenizer(&byte_level_json(), SpecialTokens::new(300, 301, 300));
        for text in ["hello world", "line one\nline two\t", "naïve café ✓ 日本", "  padded  "] {
            let ids = tok.encode(text);
            assert_eq!(ids.len(), text.len());
            assert_eq!(tok.decode(&ids), text);
        }
    }

    #[test]
    fn split_multibyte_sequences_rejoin_across_tokens() {
        let tok = tokenizer(&byte_level_json(), SpecialTokens::new(300, 301, 300));
        let ids = tok.encode("é");
        assert_eq!(ids.len(), 2);
        assert_eq!(tok.decode(&ids[..1]), "\u{FFFD}");
        assert_eq!(tok.decode(&ids), "é");
    }

    #[test]
    fn encode_prompt_maps_known_markers_to_single_ids() {
        let tok = tokenizer(&byte_level_json(), SpecialTokens::new(300, 301, 300))
            .with_special_markers(&["<|im_start|>", "<|im_end|>", "<|missing|>"]);

        let ids = tok.encode_prompt("<|im_start|>hi<|im_end|>\n");
        assert_eq!(ids, vec![302, b'h' as u32, b'i' as u32, 301, b'\n' as u32]);

        // plain encode spells markers out byte by byte
        assert_eq!(tok.encode("<|im_end|>").len(), "<|im_end|>".len());
        // unregistered marker text stays bytes
        assert_eq!(tok.encode_prompt("<|missing|>").len(), "<|missing|>".len());
    }

    #[test]
    fn special_tokens_resolve_from_marker_strings() {
        let vocab = Vocabulary::load(r#"{"a":1,"<|endoftext|>":10,"<|im_end|>":11}"#).expect("vocab");
        let specials = resolve_special_tokens(&vocab, PromptFamily::Qwen, None, None, vocab.id_bound())
            .expect("resolve specials");
        assert_eq!(specials, SpecialTokens::new(10, 11, 10));
    }

    #[test]
    fn special_tokens_fall_back_to_published_ids_within_model_range() {
        let vocab = Vocabulary::load(r#"{"a":1}"#).expect("vocab");
        let specials = resolve_special_tokens(&vocab, PromptFamily::Qwen, None, None, 151_936)
            .expect("resolve against model width");
        assert_eq!(specials, SpecialTokens::new(151_643, 151_645, 151_643));

        let err = resolve_special_tokens(&vocab, PromptFamily::Qwen, None, None, vocab.id_bound())
            .expect_err("published ids exceed tiny vocab");
        assert!(matches!(err, CorrectorError::Format(ref msg) if msg.contains("outside vocabulary range")));
    }

    #[test]
    fn explicit_ids_and_threshold_win() {
        let vocab = Vocabulary::load(r#"{"a":1,"<|endoftext|>":10}"#).expect("vocab");
        let specials = resolve_special_tokens(
            &vocab,
            PromptFamily::Qwen,
            Some(SpecialTokenIds { eos: 5, eot: 6 }),
            Some(8),
            vocab.id_bound(),
        )
        .expect("explicit specials");
        assert_eq!(specials, SpecialTokens::new(5, 6, 8));
    }

    const SENTENCEPIECE_JSON: &str =
        r#"{"<unk>":0,"<s>":1,"</s>":2,"<0x0A>":3,"<0xC3>":4,"<0xA9>":5,"h":6,"i":7,"▁":8,"▁there":9,"é":10}"#;

    #[test]
    fn sentencepiece_specials_are_skipped_without_a_cut_off() {
        let vocab = Vocabulary::load(SENTENCEPIECE_JSON).expect("vocab");
        let specials = resolve_special_tokens(&vocab, PromptFamily::Mistral, None, None, vocab.id_bound())
            .expect("resolve specials");
        assert_eq!(specials, SpecialTokens::new(2, 2, u32::MAX));

        let tok = ByteTokenizer::new(Arc::new(vocab), specials).for_family(PromptFamily::Mistral);
        assert_eq!(tok.scheme(), PieceScheme::SentencePiece);
        assert_eq!(tok.decode(&[1, 6, 7, 0, 9, 2]), "hi there");
    }

    #[test]
    fn sentencepiece_word_boundary_and_byte_pieces() {
        let tok = tokenizer(SENTENCEPIECE_JSON, SpecialTokens::new(2, 2, u32::MAX))
            .for_family(PromptFamily::Mistral);

        // space becomes the boundary piece, non-ASCII goes through <0xNN>
        assert_eq!(tok.encode("hi é\n"), vec![6, 7, 8, 4, 5, 3]);
        assert_eq!(tok.decode(&[6, 7, 8, 4, 5, 3]), "hi é\n");
        // whole-character pieces keep their UTF-8 text
        assert_eq!(tok.decode(&[8, 10]), " é");
    }

    #[test]
    fn byte_level_decode_skips_reserved_markers_below_threshold() {
        let tok = tokenizer(r#"{"<|im_start|>":0,"o":1,"k":2,"<|im_end|>":10}"#, SpecialTokens::new(10, 10, 10))
            .for_family(PromptFamily::Qwen);
        assert_eq!(tok.scheme(), PieceScheme::ByteLevel);
        assert_eq!(tok.decode(&[0, 1, 2]), "ok");
    }
}
