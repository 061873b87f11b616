#![allow(dead_code)]

use llama_bridge::{Context, ContextParams, Engine, Generation, ModelMeta, StopMatcher, StopReason};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Engine whose contexts answer `echo: <prompt>` one word at a time and
/// count their own teardown. Loading fails for paths containing `missing`
/// and for `num_ctx == 0`.
#[derive(Default)]
pub struct EchoEngine {
    loads: AtomicUsize,
    drops: Arc<AtomicUsize>,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

impl Engine for EchoEngine {
    fn name(&self) -> &str {
        "echo"
    }

    fn default_params(&self) -> ContextParams {
        ContextParams::default()
    }

    fn load_from_file(&self, path: &Path, params: &ContextParams) -> anyhow::Result<Box<dyn Context>> {
        if path.to_string_lossy().contains("missing") {
            anyhow::bail!("no such model: {}", path.display());
        }
        if params.num_ctx == 0 {
            anyhow::bail!("context window of 0 tokens");
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(EchoContext {
            meta: ModelMeta {
                name: path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
                architecture: "echo".into(),
                context_length: params.num_ctx,
                vocab_size: 0,
                file_type: None,
            },
            params: params.clone(),
            drops: Arc::clone(&self.drops),
        }))
    }
}

struct EchoContext {
    meta: ModelMeta,
    params: ContextParams,
    drops: Arc<AtomicUsize>,
}

impl Context for EchoContext {
    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn generate(&mut self, prompt: &str, on_token: &mut dyn FnMut(&str) -> bool) -> anyhow::Result<Generation> {
        let start = Instant::now();
        if prompt.is_empty() {
            anyhow::bail!("prompt produced no tokens");
        }

        let reply = format!("echo: {}", prompt);
        let limit = usize::try_from(self.params.num_predict).unwrap_or(usize::MAX);
        let mut stops = StopMatcher::new(&self.params.stop);
        let mut reason = StopReason::Eos;
        let mut generated = 0;

        for (i, piece) in reply.split_inclusive(' ').enumerate() {
            if i == limit {
                reason = StopReason::Length;
                break;
            }
            generated += 1;
            let ready = stops.push(piece);
            if !ready.is_empty() && !on_token(&ready) {
                reason = StopReason::Cancelled;
                break;
            }
            if stops.is_stopped() {
                reason = StopReason::StopSequence;
                break;
            }
        }

        if reason != StopReason::Cancelled {
            let tail = stops.finish();
            if !tail.is_empty() {
                on_token(&tail);
            }
        }

        Ok(Generation {
            text: stops.into_text(),
            prompt_tokens: prompt.split_whitespace().count(),
            generated_tokens: generated,
            stop_reason: reason,
            duration: start.elapsed(),
        })
    }
}

impl Drop for EchoContext {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
