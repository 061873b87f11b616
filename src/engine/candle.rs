use super::{Context, Engine, Generation, ModelMeta, StopMatcher, StopReason};
use crate::core::tokenizer::{create_tokenizer, TokenType, Tokenizer, TokenizerKind, Vocabulary};
use crate::core::{ContextParams, DecodeStream, Result, TokenId};
use anyhow::Context as _;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama::ModelWeights;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::time::Instant;

/// Loads llama-family GGUF files with candle's quantized llama model.
#[derive(Debug, Default, Clone)]
pub struct CandleEngine;

impl CandleEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for CandleEngine {
    fn name(&self) -> &str {
        "candle"
    }

    fn load_from_file(&self, path: &Path, params: &ContextParams) -> Result<Box<dyn Context>> {
        let start = Instant::now();

        let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let content = gguf_file::Content::read(&mut file)
            .with_context(|| format!("reading GGUF header from {}", path.display()))?;

        let meta = model_meta(&content.metadata, path);
        let (kind, vocab, add_bos_default) = vocabulary_from_gguf(&content.metadata)?;
        let tokenizer = create_tokenizer(kind, vocab)?;

        let device = select_device(params.use_gpu)?;
        let weights = ModelWeights::from_gguf(content, &mut file, &device)
            .with_context(|| format!("loading {} weights", meta.architecture))?;

        tracing::info!(
            "Loaded {} ({}, ctx {}, vocab {}) on {:?} in {:.2?}",
            meta.name,
            meta.architecture,
            meta.context_length,
            meta.vocab_size,
            device,
            start.elapsed()
        );

        Ok(Box::new(CandleContext {
            add_bos: params.add_bos && add_bos_default,
            params: params.clone(),
            weights,
            tokenizer,
            device,
            meta,
        }))
    }
}

pub struct CandleContext {
    params: ContextParams,
    weights: ModelWeights,
    tokenizer: Box<dyn Tokenizer>,
    device: Device,
    meta: ModelMeta,
    add_bos: bool,
}

impl Context for CandleContext {
    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn generate(&mut self, prompt: &str, on_token: &mut dyn FnMut(&str) -> bool) -> Result<Generation> {
        let start = Instant::now();

        let prompt_ids = self.tokenizer.encode(prompt, self.add_bos)?;
        let budget = budget(prompt_ids.len(), &self.params, &self.meta)?;

        let eos = self.tokenizer.eos_token();
        let mut logits_processor = LogitsProcessor::from_sampling(self.params.seed, sampling(&self.params));
        let mut all_tokens: Vec<u32> = prompt_ids.iter().map(|t| t.0).collect();
        let mut stops = StopMatcher::new(&self.params.stop);
        let mut stream = DecodeStream::new(self.tokenizer.as_ref());
        let mut reason = StopReason::Length;
        let mut generated = 0;

        for index in 0..budget {
            // Position 0 makes candle discard the KV cache from the last call.
            let (context, pos) = if index == 0 {
                (&all_tokens[..], 0)
            } else {
                (&all_tokens[all_tokens.len() - 1..], all_tokens.len() - 1)
            };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = self.weights.forward(&input, pos)?.squeeze(0)?.to_dtype(DType::F32)?;

            let logits = if self.params.repeat_penalty == 1.0 {
                logits
            } else {
                let from = all_tokens.len().saturating_sub(self.params.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    self.params.repeat_penalty,
                    &all_tokens[from..],
                )?
            };

            let next = logits_processor.sample(&logits)?;
            all_tokens.push(next);
            generated += 1;

            if TokenId(next) == eos {
                reason = StopReason::Eos;
                break;
            }

            if let Some(piece) = stream.next_token(TokenId(next))? {
                let ready = stops.push(&piece);
                if !ready.is_empty() && !on_token(&ready) {
                    reason = StopReason::Cancelled;
                    break;
                }
                if stops.is_stopped() {
                    reason = StopReason::StopSequence;
                    break;
                }
            }
        }

        if reason != StopReason::Cancelled {
            let mut tail = match stream.flush()? {
                Some(rest) => stops.push(&rest),
                None => String::new(),
            };
            tail.push_str(&stops.finish());
            if stops.is_stopped() {
                reason = StopReason::StopSequence;
            }
            if !tail.is_empty() {
                on_token(&tail);
            }
        }

        let generation = Generation {
            text: stops.into_text(),
            prompt_tokens: prompt_ids.len(),
            generated_tokens: generated,
            stop_reason: reason,
            duration: start.elapsed(),
        };
        tracing::debug!(
            "Generated {} tokens from a {}-token prompt ({:?}, {:.1} tok/s)",
            generation.generated_tokens,
            generation.prompt_tokens,
            generation.stop_reason,
            generation.tokens_per_second()
        );
        Ok(generation)
    }
}

/// Tokens left to generate after a prompt of `prompt_len` tokens.
///
/// The window is `num_ctx`, capped by the model's trained context length when
/// the file declares one. A negative `num_predict` fills the window.
fn budget(prompt_len: usize, params: &ContextParams, meta: &ModelMeta) -> Result<usize> {
    if prompt_len == 0 {
        anyhow::bail!("prompt produced no tokens");
    }
    let window = if meta.context_length > 0 {
        params.num_ctx.min(meta.context_length)
    } else {
        params.num_ctx
    };
    if prompt_len >= window {
        anyhow::bail!("prompt is {} tokens but the context window is {}", prompt_len, window);
    }

    let remaining = window - prompt_len;
    Ok(match usize::try_from(params.num_predict) {
        Ok(n) => n.min(remaining),
        Err(_) => remaining,
    })
}

fn select_device(use_gpu: bool) -> Result<Device> {
    if use_gpu && candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if use_gpu && candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

fn sampling(params: &ContextParams) -> Sampling {
    if params.is_greedy() {
        return Sampling::ArgMax;
    }
    let temperature = params.temperature;
    let p = params.top_p;
    match (params.top_k, p < 1.0) {
        (0, false) => Sampling::All { temperature },
        (k, false) => Sampling::TopK { k, temperature },
        (0, true) => Sampling::TopP { p, temperature },
        (k, true) => Sampling::TopKThenTopP { k, p, temperature },
    }
}

type Metadata = HashMap<String, gguf_file::Value>;

fn meta_uint(md: &Metadata, key: &str) -> Option<u64> {
    use gguf_file::Value;
    match md.get(key)? {
        Value::U8(v) => Some(*v as u64),
        Value::U16(v) => Some(*v as u64),
        Value::U32(v) => Some(*v as u64),
        Value::U64(v) => Some(*v),
        Value::I8(v) => u64::try_from(*v).ok(),
        Value::I16(v) => u64::try_from(*v).ok(),
        Value::I32(v) => u64::try_from(*v).ok(),
        Value::I64(v) => u64::try_from(*v).ok(),
        _ => None,
    }
}

fn meta_str<'a>(md: &'a Metadata, key: &str) -> Option<&'a str> {
    md.get(key).and_then(|v| v.to_string().ok()).map(|s| s.as_str())
}

fn meta_array<'a>(md: &'a Metadata, key: &str) -> Option<&'a Vec<gguf_file::Value>> {
    md.get(key).and_then(|v| v.to_vec().ok())
}

fn model_meta(md: &Metadata, path: &Path) -> ModelMeta {
    let architecture = meta_str(md, "general.architecture").unwrap_or("llama").to_string();
    let name = meta_str(md, "general.name")
        .map(String::from)
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_default();

    ModelMeta {
        context_length: meta_uint(md, &format!("{}.context_length", architecture)).unwrap_or(0) as usize,
        vocab_size: meta_array(md, "tokenizer.ggml.tokens").map(|t| t.len()).unwrap_or(0),
        file_type: meta_uint(md, "general.file_type").map(|v| v as u32),
        name,
        architecture,
    }
}

/// Build the tokenizer tables from `tokenizer.ggml.*` metadata.
///
/// Returns the tokenizer kind, the vocabulary and whether the model wants a
/// BOS token prepended.
fn vocabulary_from_gguf(md: &Metadata) -> Result<(TokenizerKind, Vocabulary, bool)> {
    use gguf_file::Value;

    let model = meta_str(md, "tokenizer.ggml.model").unwrap_or("llama");
    let kind = TokenizerKind::from_gguf(model)
        .ok_or_else(|| anyhow::anyhow!("unsupported tokenizer model {:?}", model))?;

    let tokens: Vec<String> = meta_array(md, "tokenizer.ggml.tokens")
        .context("missing tokenizer.ggml.tokens")?
        .iter()
        .map(|v| v.to_string().cloned())
        .collect::<std::result::Result<_, _>>()
        .context("tokenizer.ggml.tokens holds a non-string")?;

    let mut vocab = Vocabulary::new(tokens);

    if let Some(scores) = meta_array(md, "tokenizer.ggml.scores") {
        for (slot, v) in vocab.scores.iter_mut().zip(scores) {
            if let Value::F32(s) = v {
                *slot = *s;
            }
        }
    }
    if let Some(types) = meta_array(md, "tokenizer.ggml.token_type") {
        for (slot, v) in vocab.types.iter_mut().zip(types) {
            if let Value::I32(t) = v {
                *slot = TokenType::from_gguf(*t);
            }
        }
    }
    if let Some(merges) = meta_array(md, "tokenizer.ggml.merges") {
        vocab.merges = merges.iter().filter_map(|v| v.to_string().ok().cloned()).collect();
    }

    if let Some(id) = meta_uint(md, "tokenizer.ggml.bos_token_id") {
        vocab.bos_token = TokenId(id as u32);
    }
    if let Some(id) = meta_uint(md, "tokenizer.ggml.eos_token_id") {
        vocab.eos_token = TokenId(id as u32);
    }
    vocab.unk_token = meta_uint(md, "tokenizer.ggml.unknown_token_id")
        .map(|id| TokenId(id as u32))
        .or_else(|| vocab.types.iter().position(|t| *t == TokenType::Unknown).map(|i| TokenId(i as u32)));

    let add_bos = match md.get("tokenizer.ggml.add_bos_token") {
        Some(Value::Bool(b)) => *b,
        _ => kind == TokenizerKind::SentencePiece,
    };

    Ok((kind, vocab, add_bos))
}
