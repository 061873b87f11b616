pub mod traits;
pub mod bpe;
pub mod sentencepiece;

pub use traits::{DecodeStream, Tokenizer, TokenizerKind};
pub use bpe::BpeTokenizer;
pub use sentencepiece::SentencePieceTokenizer;

use crate::core::{Result, TokenId};

pub fn create_tokenizer(kind: TokenizerKind, vocab: Vocabulary) -> Result<Box<dyn Tokenizer>> {
    vocab.validate()?;
    Ok(match kind {
        TokenizerKind::SentencePiece => Box::new(SentencePieceTokenizer::new(vocab)),
        TokenizerKind::Bpe => Box::new(BpeTokenizer::new(vocab)?),
    })
}

/// Token table as stored in GGUF `tokenizer.ggml.*` metadata.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub tokens: Vec<String>,
    pub scores: Vec<f32>,
    pub types: Vec<TokenType>,
    pub merges: Vec<String>,
    pub bos_token: TokenId,
    pub eos_token: TokenId,
    pub unk_token: Option<TokenId>,
}

impl Vocabulary {
    pub fn new(tokens: Vec<String>) -> Self {
        let len = tokens.len();
        Self {
            tokens,
            scores: vec![0.0; len],
            types: vec![TokenType::Normal; len],
            merges: Vec::new(),
            bos_token: TokenId::BOS,
            eos_token: TokenId::EOS,
            unk_token: None,
        }
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id.0 as usize).map(|s| s.as_str())
    }

    pub fn score(&self, id: TokenId) -> f32 {
        self.scores.get(id.0 as usize).copied().unwrap_or(0.0)
    }

    pub fn token_type(&self, id: TokenId) -> TokenType {
        self.types.get(id.0 as usize).copied().unwrap_or(TokenType::Normal)
    }

    /// Control tokens never contribute text when decoding.
    pub fn is_control(&self, id: TokenId) -> bool {
        id == self.bos_token
            || id == self.eos_token
            || matches!(self.token_type(id), TokenType::Control | TokenType::Unused)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tokens.is_empty() {
            anyhow::bail!("vocabulary is empty");
        }
        if self.scores.len() != self.tokens.len() || self.types.len() != self.tokens.len() {
            anyhow::bail!(
                "vocabulary tables disagree: {} tokens, {} scores, {} types",
                self.tokens.len(),
                self.scores.len(),
                self.types.len()
            );
        }
        for (what, id) in [("bos", Some(self.bos_token)), ("eos", Some(self.eos_token)), ("unk", self.unk_token)] {
            if let Some(id) = id {
                if self.token(id).is_none() {
                    anyhow::bail!("{} token {} outside vocabulary of {}", what, id.0, self.size());
                }
            }
        }
        Ok(())
    }
}

/// GGUF `tokenizer.ggml.token_type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl TokenType {
    pub fn from_gguf(value: i32) -> Self {
        match value {
            2 => TokenType::Unknown,
            3 => TokenType::Control,
            4 => TokenType::UserDefined,
            5 => TokenType::Unused,
            6 => TokenType::Byte,
            _ => TokenType::Normal,
        }
    }
}
