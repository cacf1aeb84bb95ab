//! # genlm-tokenizer
//!
//! Deterministic tokenization for genlm.
//!
//! This crate provides:
//! - A `Tokenizer` trait for pluggable tokenization backends
//! - `Vocabulary`, the serialisable piece table shipped inside model artifacts
//! - `VocabTokenizer`, a greedy longest-match tokenizer over a `Vocabulary`
//!
//! Every piece is a complete UTF-8 string, so generated text is produced one
//! token at a time with [`VocabTokenizer::piece`] and needs no buffering.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Vocabulary index of a token.
pub type TokenId = u32;

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
    #[error("Invalid vocabulary: {0}")]
    InvalidVocabulary(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Implementations can be swapped without changing app code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs.
    fn encode(&self, text: &str) -> TokenizerResult<Vec<TokenId>>;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Ids with a structural meaning (end of sequence, padding, ...).
    fn special_tokens(&self) -> &SpecialTokens;

    /// Control tokens never appear in decoded text and are never sampled.
    /// EOS is handled separately by the generation loop.
    fn control_tokens(&self) -> Vec<TokenId> {
        let special = self.special_tokens();
        let mut ids = vec![special.pad];
        ids.extend(special.unk);
        ids.extend(special.image);
        ids
    }
}

/// Ids of the structural tokens of a vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub pad: TokenId,
    pub eos: TokenId,
    #[serde(default)]
    pub unk: Option<TokenId>,
    /// Placeholder id recorded in history for image soft tokens.
    #[serde(default)]
    pub image: Option<TokenId>,
}

impl SpecialTokens {
    fn ids(&self) -> impl Iterator<Item = TokenId> {
        [Some(self.pad), Some(self.eos), self.unk, self.image]
            .into_iter()
            .flatten()
    }

    pub fn is_special(&self, id: TokenId) -> bool {
        self.ids().any(|special| special == id)
    }
}

/// Piece table of a model. Index in `pieces` is the token id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub pieces: Vec<String>,
    pub special: SpecialTokens,
}

/// Word pieces added on top of the single characters in `Vocabulary::standard`.
const STANDARD_WORDS: &[&str] = &[
    "Hello", " Hello", "hello", " world", "Hi", " the", " The", "The", " and", " is",
    " are", " you", "How", " How", " What", "What", " a", " of", " to", " in", "ing",
    " image", " this", " I", "'m", " fine", " thanks", " today", " model", " answer",
];

impl Vocabulary {
    /// Piece used for the end-of-turn marker of chat-formatted models.
    pub const END_OF_TURN: &'static str = "<end_of_turn>";

    /// Default vocabulary: control pieces, an end-of-turn marker, every
    /// printable ASCII character plus newline, and a handful of common words.
    pub fn standard() -> Self {
        let mut pieces: Vec<String> = ["<pad>", "<eos>", "<unk>", "<image>", Self::END_OF_TURN]
            .iter()
            .map(|p| p.to_string())
            .collect();

        pieces.push("\n".to_string());
        pieces.extend((0x20u8..=0x7e).map(|b| (b as char).to_string()));
        for word in STANDARD_WORDS {
            if !pieces.iter().any(|p| p == word) {
                pieces.push(word.to_string());
            }
        }

        Self {
            pieces,
            special: SpecialTokens {
                pad: 0,
                eos: 1,
                unk: Some(2),
                image: Some(3),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Id of an exact piece, if present.
    pub fn id_of(&self, piece: &str) -> Option<TokenId> {
        self.pieces
            .iter()
            .position(|p| p == piece)
            .map(|idx| idx as TokenId)
    }

    pub fn validate(&self) -> TokenizerResult<()> {
        if self.pieces.is_empty() {
            return Err(TokenizerError::InvalidVocabulary(
                "vocabulary has no pieces".to_string(),
            ));
        }

        for id in self.special.ids() {
            if id as usize >= self.pieces.len() {
                return Err(TokenizerError::InvalidVocabulary(format!(
                    "special token {id} outside vocabulary of {}",
                    self.pieces.len()
                )));
            }
        }

        let mut seen = HashMap::with_capacity(self.pieces.len());
        for (idx, piece) in self.pieces.iter().enumerate() {
            if piece.is_empty() {
                return Err(TokenizerError::InvalidVocabulary(format!(
                    "piece {idx} is empty"
                )));
            }
            if let Some(first) = seen.insert(piece.as_str(), idx) {
                return Err(TokenizerError::InvalidVocabulary(format!(
                    "piece {piece:?} appears at {first} and {idx}"
                )));
            }
        }

        Ok(())
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::standard()
    }
}

/// Greedy longest-match tokenizer over a fixed `Vocabulary`.
///
/// Stateless after construction, so it can be shared across threads freely.
/// Text that no piece covers maps to `<unk>` one character at a time; a
/// vocabulary without an unk token rejects such text instead.
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    vocab: Vocabulary,
    lookup: HashMap<String, TokenId>,
    max_piece_len: usize,
}

impl VocabTokenizer {
    pub fn new(vocab: Vocabulary) -> TokenizerResult<Self> {
        vocab.validate()?;

        let mut lookup = HashMap::with_capacity(vocab.pieces.len());
        let mut max_piece_len = 0;
        for (idx, piece) in vocab.pieces.iter().enumerate() {
            let id = idx as TokenId;
            // Control pieces are never produced from user text.
            if vocab.special.is_special(id) {
                continue;
            }
            max_piece_len = max_piece_len.max(piece.len());
            lookup.insert(piece.clone(), id);
        }

        Ok(Self {
            vocab,
            lookup,
            max_piece_len,
        })
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Text of a token; control tokens render as the empty string.
    pub fn piece(&self, token: TokenId) -> TokenizerResult<&str> {
        let piece = self
            .vocab
            .pieces
            .get(token as usize)
            .ok_or(TokenizerError::InvalidToken(token))?;
        if self.vocab.special.is_special(token) {
            Ok("")
        } else {
            Ok(piece)
        }
    }

    fn longest_match(&self, rest: &str) -> Option<(TokenId, usize)> {
        let mut end = rest.len().min(self.max_piece_len);
        while end > 0 {
            if rest.is_char_boundary(end) {
                if let Some(&id) = self.lookup.get(&rest[..end]) {
                    return Some((id, end));
                }
            }
            end -= 1;
        }
        None
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str) -> TokenizerResult<Vec<TokenId>> {
        let mut ids = Vec::new();
        let mut pos = 0;

        while pos < text.len() {
            let rest = &text[pos..];
            match self.longest_match(rest) {
                Some((id, len)) => {
                    ids.push(id);
                    pos += len;
                }
                None => {
                    let ch = rest.chars().next().ok_or_else(|| {
                        TokenizerError::EncodingError(format!("no character at byte {pos}"))
                    })?;
                    let unk = self.vocab.special.unk.ok_or_else(|| {
                        TokenizerError::EncodingError(format!(
                            "no vocabulary piece covers {ch:?} at byte {pos}"
                        ))
                    })?;
                    ids.push(unk);
                    pos += ch.len_utf8();
                }
            }
        }

        Ok(ids)
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn special_tokens(&self) -> &SpecialTokens {
        &self.vocab.special
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> VocabTokenizer {
        VocabTokenizer::new(Vocabulary::standard()).unwrap()
    }

    fn text(tok: &VocabTokenizer, ids: &[TokenId]) -> TokenizerResult<String> {
        ids.iter().map(|&id| tok.piece(id)).collect()
    }

    #[test]
    fn standard_vocabulary_is_valid() {
        let vocab = Vocabulary::standard();
        vocab.validate().unwrap();
        assert_eq!(vocab.id_of("<eos>"), Some(1));
        assert!(vocab.id_of("Hello").is_some());
        assert!(vocab.id_of(" ").is_some());
    }

    #[test]
    fn encode_prefers_longest_piece() {
        let tok = standard();
        let ids = tok.encode("Hello world").unwrap();
        let vocab = tok.vocabulary();
        assert_eq!(
            ids,
            vec![vocab.id_of("Hello").unwrap(), vocab.id_of(" world").unwrap()]
        );
    }

    #[test]
    fn encode_empty_string() {
        let tok = standard();
        assert!(tok.encode("").unwrap().is_empty());
    }

    #[test]
    fn control_text_is_spelled_out() {
        let tok = standard();
        let ids = tok.encode("<eos>").unwrap();
        assert_eq!(ids.len(), 5);
        assert!(!ids.contains(&tok.special_tokens().eos));
        assert_eq!(text(&tok, &ids).unwrap(), "<eos>");
    }

    #[test]
    fn unknown_characters_map_to_unk() {
        let tok = standard();
        let ids = tok.encode("a\u{e9}b").unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[1], 2);
        assert_eq!(text(&tok, &ids).unwrap(), "ab");
    }

    #[test]
    fn unknown_characters_without_unk_fail() {
        let mut vocab = Vocabulary::standard();
        vocab.special.unk = None;
        let tok = VocabTokenizer::new(vocab).unwrap();
        let err = tok.encode("\u{1f600}").unwrap_err();
        assert!(matches!(err, TokenizerError::EncodingError(_)));
    }

    #[test]
    fn invalid_token_has_no_piece() {
        let tok = standard();
        assert_eq!(
            tok.piece(999_999).unwrap_err(),
            TokenizerError::InvalidToken(999_999)
        );
    }

    #[test]
    fn control_tokens_render_empty() {
        let tok = standard();
        let special = tok.special_tokens().clone();
        assert_eq!(tok.piece(special.eos).unwrap(), "");
        assert_eq!(tok.piece(special.pad).unwrap(), "");
        let ids = tok.encode("Hello world").unwrap();
        assert_eq!(tok.piece(ids[1]).unwrap(), " world");
    }

    #[test]
    fn duplicate_pieces_are_rejected() {
        let mut vocab = Vocabulary::standard();
        vocab.pieces.push("Hello".to_string());
        assert!(matches!(
            VocabTokenizer::new(vocab),
            Err(TokenizerError::InvalidVocabulary(_))
        ));
    }

    #[test]
    fn special_ids_must_be_in_range() {
        let mut vocab = Vocabulary::standard();
        vocab.special.eos = vocab.pieces.len() as TokenId;
        assert!(vocab.validate().is_err());
    }

    #[test]
    fn control_tokens_exclude_eos() {
        let tok = standard();
        let controls = tok.control_tokens();
        assert_eq!(controls, vec![0, 2, 3]);
    }
}
