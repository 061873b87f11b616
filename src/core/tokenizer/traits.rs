use super::Vocabulary;
use crate::core::{Result, TokenId};

pub trait Tokenizer: Send + Sync {
    fn vocab(&self) -> &Vocabulary;

    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>>;
    fn decode(&self, tokens: &[TokenId]) -> Result<String>;

    fn eos_token(&self) -> TokenId {
        self.vocab().eos_token
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenizerKind {
    /// `tokenizer.ggml.model = "llama"`
    SentencePiece,
    /// `tokenizer.ggml.model = "gpt2"`
    Bpe,
}

impl TokenizerKind {
    pub fn from_gguf(model: &str) -> Option<Self> {
        match model {
            "llama" | "spm" => Some(Self::SentencePiece),
            "gpt2" | "bpe" => Some(Self::Bpe),
            _ => None,
        }
    }
}

/// Turns a growing token sequence into text pieces.
///
/// A single token may hold only part of a multi-byte character, so text is
/// released once the decoded tail no longer ends in a replacement character.
pub struct DecodeStream<'a> {
    tokenizer: &'a dyn Tokenizer,
    tokens: Vec<TokenId>,
    prev_index: usize,
    current_index: usize,
}

impl<'a> DecodeStream<'a> {
    pub fn new(tokenizer: &'a dyn Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    pub fn next_token(&mut self, token: TokenId) -> Result<Option<String>> {
        let prev_text = self.tokenizer.decode(&self.tokens[self.prev_index..self.current_index])?;
        self.tokens.push(token);
        let text = self.tokenizer.decode(&self.tokens[self.prev_index..])?;

        if text.len() > prev_text.len() && !text.ends_with('\u{FFFD}') {
            if let Some(piece) = text.get(prev_text.len()..) {
                let piece = piece.to_string();
                self.prev_index = self.current_index;
                self.current_index = self.tokens.len();
                return Ok(Some(piece));
            }
        }
        Ok(None)
    }

    /// Text still held back, e.g. an incomplete character at end of stream.
    pub fn flush(&mut self) -> Result<Option<String>> {
        let prev_text = self.tokenizer.decode(&self.tokens[self.prev_index..self.current_index])?;
        let text = self.tokenizer.decode(&self.tokens[self.prev_index..])?;
        self.prev_index = self.tokens.len();
        self.current_index = self.tokens.len();

        Ok(text
            .get(prev_text.len()..)
            .filter(|rest| !rest.is_empty())
            .map(String::from))
    }
}
