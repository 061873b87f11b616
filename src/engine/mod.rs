//! The inference engine seam.
//!
//! The bridge never evaluates a model itself. It asks an [`Engine`] to turn a
//! file into a [`Context`] and asks the context for text. Dropping the context
//! is the engine's teardown.

pub mod candle;

pub use self::candle::CandleEngine;

use crate::core::{ContextParams, Result};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Default parameters for a new context.
    fn default_params(&self) -> ContextParams {
        ContextParams::from_env()
    }

    fn load_from_file(&self, path: &Path, params: &ContextParams) -> Result<Box<dyn Context>>;
}

/// A loaded model plus whatever per-model state the engine keeps.
pub trait Context: Send {
    fn meta(&self) -> &ModelMeta;

    /// Generate a continuation of `prompt`.
    ///
    /// `on_token` receives each decoded piece as soon as it is safe to show;
    /// returning `false` stops generation with [`StopReason::Cancelled`].
    fn generate(&mut self, prompt: &str, on_token: &mut dyn FnMut(&str) -> bool) -> Result<Generation>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelMeta {
    pub name: String,
    pub architecture: String,
    pub context_length: usize,
    pub vocab_size: usize,
    pub file_type: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Eos,
    Length,
    StopSequence,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub stop_reason: StopReason,
    pub duration: Duration,
}

impl Generation {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.generated_tokens as f64 / secs
        } else {
            0.0
        }
    }
}

/// Cuts generated text at the first stop sequence.
///
/// Text that might be the beginning of a stop sequence is held back until
/// the next piece settles it, so nothing of a stop sequence is ever released.
#[derive(Debug, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    text: String,
    emitted: usize,
    stopped: bool,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            ..Default::default()
        }
    }

    /// Append a piece and return the text that is now safe to release.
    pub fn push(&mut self, piece: &str) -> String {
        if self.stopped {
            return String::new();
        }
        self.text.push_str(piece);

        if let Some(pos) = self.stops.iter().filter_map(|s| self.text.find(s.as_str())).min() {
            self.text.truncate(pos);
            self.stopped = true;
            return self.release(self.text.len());
        }

        let held = self.partial_suffix_len();
        self.release(self.text.len() - held)
    }

    /// Release everything still held back.
    pub fn finish(&mut self) -> String {
        self.release(self.text.len())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    fn release(&mut self, upto: usize) -> String {
        if upto <= self.emitted {
            return String::new();
        }
        let ready = self.text[self.emitted..upto].to_string();
        self.emitted = upto;
        ready
    }

    /// Longest tail of the text that is a proper prefix of some stop sequence.
    fn partial_suffix_len(&self) -> usize {
        self.stops
            .iter()
            .flat_map(|stop| {
                (1..stop.len())
                    .filter(|&k| stop.is_char_boundary(k))
                    .filter(|&k| self.text.ends_with(&stop[..k]))
            })
            .max()
            .unwrap_or(0)
    }
}
