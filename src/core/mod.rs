pub mod params;
pub mod tokenizer;

pub use params::ContextParams;
pub use tokenizer::{DecodeStream, Tokenizer, TokenizerKind, Vocabulary};

pub type Result<T> = anyhow::Result<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(pub u32);

impl TokenId {
    pub const BOS: Self = Self(1);
    pub const EOS: Self = Self(2);
}
