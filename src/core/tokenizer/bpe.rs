use super::traits::Tokenizer;
use super::Vocabulary;
use crate::core::{Result, TokenId};
use std::collections::HashMap;

const PRE_TOKENIZE: &str =
    r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

/// Byte-level BPE tokenizer for `gpt2`-style GGUF vocabularies.
pub struct BpeTokenizer {
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    bpe_ranks: HashMap<(String, String), usize>,
    byte_encoder: HashMap<u8, char>,
    byte_decoder: HashMap<char, u8>,
    pattern: fancy_regex::Regex,
}

impl BpeTokenizer {
    pub fn new(vocab: Vocabulary) -> Result<Self> {
        let byte_encoder = Self::build_byte_encoder();
        let byte_decoder: HashMap<char, u8> = byte_encoder.iter().map(|(&k, &v)| (v, k)).collect();

        let mut encoder = HashMap::with_capacity(vocab.size());
        for (i, token) in vocab.tokens.iter().enumerate() {
            encoder.entry(token.clone()).or_insert(TokenId(i as u32));
        }

        let mut bpe_ranks = HashMap::with_capacity(vocab.merges.len());
        for (i, merge) in vocab.merges.iter().enumerate() {
            if let Some((left, right)) = merge.split_once(' ') {
                bpe_ranks.insert((left.to_string(), right.to_string()), i);
            }
        }

        let pattern = fancy_regex::Regex::new(PRE_TOKENIZE)?;

        Ok(Self {
            vocab,
            encoder,
            bpe_ranks,
            byte_encoder,
            byte_decoder,
            pattern,
        })
    }

    /// GPT-2 printable stand-ins for all 256 byte values.
    fn build_byte_encoder() -> HashMap<u8, char> {
        let mut mapping = HashMap::with_capacity(256);
        for b in (b'!'..=b'~').chain(0xA1..=0xAC).chain(0xAE..=0xFF) {
            mapping.insert(b, char::from(b));
        }

        let mut offset: u32 = 256;
        for b in 0..=255u8 {
            if let std::collections::hash_map::Entry::Vacant(e) = mapping.entry(b) {
                e.insert(char::from_u32(offset).unwrap_or(char::REPLACEMENT_CHARACTER));
                offset += 1;
            }
        }

        mapping
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        let mut word: Vec<String> = token.chars().map(String::from).collect();

        while word.len() > 1 {
            let bigram = word
                .windows(2)
                .filter_map(|pair| {
                    self.bpe_ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, pair[0].clone(), pair[1].clone()))
                })
                .min_by_key(|(rank, _, _)| *rank);

            let Some((_, left, right)) = bigram else { break };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == left && word[i + 1] == right {
                    merged.push(format!("{}{}", left, right));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }

        word
    }

    fn byte_encode(&self, text: &str) -> String {
        text.bytes().filter_map(|b| self.byte_encoder.get(&b)).collect()
    }
}

impl Tokenizer for BpeTokenizer {
    fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(self.vocab.bos_token);
        }

        for m in self.pattern.find_iter(text) {
            let encoded = self.byte_encode(m?.as_str());
            if let Some(&id) = self.encoder.get(&encoded) {
                tokens.push(id);
                continue;
            }
            for piece in self.bpe(&encoded) {
                match self.encoder.get(&piece) {
                    Some(&id) => tokens.push(id),
                    None => {
                        if let Some(unk) = self.vocab.unk_token {
                            tokens.push(unk);
                        }
                    }
                }
            }
        }

        Ok(tokens)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        let mut bytes = Vec::new();

        for &id in tokens {
            let token = self.vocab.token(id).ok_or_else(|| {
                anyhow::anyhow!("token id {} outside vocabulary of {}", id.0, self.vocab.size())
            })?;
            if self.vocab.is_control(id) {
                continue;
            }
            for c in token.chars() {
                match self.byte_decoder.get(&c) {
                    Some(&b) => bytes.push(b),
                    None => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
