use super::traits::Tokenizer;
use super::{TokenType, Vocabulary};
use crate::core::{Result, TokenId};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

const SPACE: char = '\u{2581}';

/// A run of the normalized text, linked to its neighbours. Merged-away
/// symbols keep `len == 0`.
struct Symbol {
    start: usize,
    len: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Bigram {
    score: f32,
    left: usize,
    right: usize,
    len: usize,
}

impl Ord for Bigram {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.left.cmp(&self.left))
    }
}

impl PartialOrd for Bigram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Bigram {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Bigram {}

/// Score-driven SentencePiece tokenizer for llama-family GGUF vocabularies.
pub struct SentencePieceTokenizer {
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    byte_tokens: [Option<TokenId>; 256],
}

impl SentencePieceTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let mut encoder = HashMap::with_capacity(vocab.size());
        let mut byte_tokens = [None; 256];

        for (i, token) in vocab.tokens.iter().enumerate() {
            let id = TokenId(i as u32);
            if let Some(b) = parse_byte_token(token) {
                byte_tokens[b as usize] = Some(id);
                continue;
            }
            encoder.entry(token.clone()).or_insert(id);
        }

        Self {
            vocab,
            encoder,
            byte_tokens,
        }
    }

    /// Merge adjacent symbols, always taking the highest-scoring pair first
    /// (leftmost on ties). Candidate pairs live in a heap over a linked list
    /// of symbols, so each merge only revisits its two neighbours.
    fn merge_symbols<'t>(&self, text: &'t str) -> Vec<&'t str> {
        let mut symbols: Vec<Symbol> = text
            .char_indices()
            .enumerate()
            .map(|(i, (start, c))| Symbol {
                start,
                len: c.len_utf8(),
                prev: i.checked_sub(1),
                next: Some(i + 1),
            })
            .collect();
        if let Some(last) = symbols.last_mut() {
            last.next = None;
        }

        let mut queue = BinaryHeap::new();
        for i in 1..symbols.len() {
            self.push_bigram(text, &symbols, i - 1, i, &mut queue);
        }

        while let Some(bigram) = queue.pop() {
            let (left, right) = (bigram.left, bigram.right);
            // Skip pairs invalidated by an earlier merge.
            if symbols[left].len == 0
                || symbols[right].len == 0
                || symbols[left].len + symbols[right].len != bigram.len
            {
                continue;
            }

            symbols[left].len += symbols[right].len;
            symbols[right].len = 0;
            symbols[left].next = symbols[right].next;
            if let Some(next) = symbols[right].next {
                symbols[next].prev = Some(left);
            }

            if let Some(prev) = symbols[left].prev {
                self.push_bigram(text, &symbols, prev, left, &mut queue);
            }
            if let Some(next) = symbols[left].next {
                self.push_bigram(text, &symbols, left, next, &mut queue);
            }
        }

        let mut pieces = Vec::new();
        let mut cursor = if symbols.is_empty() { None } else { Some(0) };
        while let Some(i) = cursor {
            let symbol = &symbols[i];
            pieces.push(&text[symbol.start..symbol.start + symbol.len]);
            cursor = symbol.next;
        }
        pieces
    }

    fn push_bigram(
        &self,
        text: &str,
        symbols: &[Symbol],
        left: usize,
        right: usize,
        queue: &mut BinaryHeap<Bigram>,
    ) {
        let start = symbols[left].start;
        let len = symbols[left].len + symbols[right].len;
        if let Some(&id) = self.encoder.get(&text[start..start + len]) {
            queue.push(Bigram {
                score: self.vocab.score(id),
                left,
                right,
                len,
            });
        }
    }

    fn push_byte_fallback(&self, symbol: &str, out: &mut Vec<TokenId>) {
        for b in symbol.bytes() {
            match self.byte_tokens[b as usize].or(self.vocab.unk_token) {
                Some(id) => out.push(id),
                None => tracing::trace!("dropping byte {:#04x} with no vocabulary entry", b),
            }
        }
    }
}

impl Tokenizer for SentencePieceTokenizer {
    fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(self.vocab.bos_token);
        }
        if text.is_empty() {
            return Ok(tokens);
        }

        let mut normalized = String::with_capacity(text.len() + SPACE.len_utf8());
        normalized.push(SPACE);
        normalized.extend(text.chars().map(|c| if c == ' ' { SPACE } else { c }));

        for symbol in self.merge_symbols(&normalized) {
            match self.encoder.get(symbol) {
                Some(&id) => tokens.push(id),
                None => self.push_byte_fallback(symbol, &mut tokens),
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
            if self.vocab.token_type(id) != TokenType::UserDefined {
                if let Some(b) = parse_byte_token(token) {
                    bytes.push(b);
                    continue;
                }
            }
            for c in token.chars() {
                let c = if c == SPACE { ' ' } else { c };
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// `<0x0A>` -> `0x0A`
fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> SentencePieceTokenizer {
        let tokens: Vec<String> = [
            "<unk>", "<s>", "</s>", "<0x0A>", "<0xC3>", "<0xA9>", "▁", "H", "e", "l", "o", "w", "r", "d",
            "▁H", "He", "ll", "llo", "Hello", "▁Hello", "▁w", "or", "▁wor", "▁worl", "▁world",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let mut vocab = Vocabulary::new(tokens);
        for (i, score) in vocab.scores.iter_mut().enumerate() {
            *score = i as f32;
        }
        vocab.unk_token = Some(TokenId(0));
        SentencePieceTokenizer::new(vocab)
    }

    #[test]
    fn test_merges_by_score() {
        let tok = tokenizer();
        let ids = tok.encode("Hello world", true).unwrap();
        let pieces: Vec<&str> = ids.iter().map(|&id| tok.vocab().token(id).unwrap()).collect();
        assert_eq!(pieces, vec!["<s>", "▁Hello", "▁world"]);
    }

    #[test]
    fn test_byte_fallback_and_decode() {
        let tok = tokenizer();
        let ids = tok.encode("é\n", false).unwrap();
        let pieces: Vec<&str> = ids.iter().map(|&id| tok.vocab().token(id).unwrap()).collect();
        assert_eq!(pieces, vec!["▁", "<0xC3>", "<0xA9>", "<0x0A>"]);
        assert_eq!(tok.decode(&ids).unwrap(), " é\n");
    }

    #[test]
    fn test_decode_skips_control_tokens() {
        let tok = tokenizer();
        let ids = tok.encode("Hello world", true).unwrap();
        let mut with_eos = ids.clone();
        with_eos.push(tok.eos_token());
        assert_eq!(tok.decode(&with_eos).unwrap(), " Hello world");
        assert!(tok.decode(&[TokenId(999)]).is_err());
    }

    #[test]
    fn test_long_prompt_merges_every_word() {
        let tok = tokenizer();
        let words = 5000;
        let ids = tok.encode(&"Hello world ".repeat(words), true).unwrap();

        // BOS, two tokens per repetition, then the trailing space marker.
        assert_eq!(ids.len(), 2 * words + 2);
        let pieces: Vec<&str> = ids.iter().map(|&id| tok.vocab().token(id).unwrap()).collect();
        assert_eq!(&pieces[..5], &["<s>", "▁Hello", "▁world", "▁Hello", "▁world"]);
        assert_eq!(pieces.last(), Some(&"▁"));
    }

    #[test]
    fn test_ties_merge_leftmost_first() {
        let tokens: Vec<String> = ["<unk>", "<s>", "</s>", "▁", "a", "aa"].iter().map(|s| s.to_string()).collect();
        let tok = SentencePieceTokenizer::new(Vocabulary::new(tokens));
        let ids = tok.encode("aaa", false).unwrap();
        let pieces: Vec<&str> = ids.iter().map(|&id| tok.vocab().token(id).unwrap()).collect();
        assert_eq!(pieces, vec!["▁", "aa", "a"]);
    }

    #[test]
    fn test_empty_text() {
        let tok = tokenizer();
        assert_eq!(tok.encode("", true).unwrap(), vec![TokenId::BOS]);
        assert!(tok.encode("", false).unwrap().is_empty());
    }

    #[test]
    fn test_parse_byte_token() {
        assert_eq!(parse_byte_token("<0x0A>"), Some(0x0a));
        assert_eq!(parse_byte_token("<0xff>"), Some(0xff));
        assert_eq!(parse_byte_token("<0x1>"), None);
        assert_eq!(parse_byte_token("0x0A"), None);
    }
}
