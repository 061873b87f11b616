//! llama-bridge: load a GGUF model, generate text and release it through an
//! opaque handle.
//!
//! The crate builds as both an `rlib` and a `cdylib`. Rust callers use
//! [`Bridge`] (handle based) or [`LoadedModel`] (single owner). Managed
//! runtimes call the `llama_bridge_*` functions in [`ffi`], declared in
//! `include/llama_bridge.h`.
//!
//! ```ignore
//! use llama_bridge::{Bridge, CandleEngine};
//! use std::sync::Arc;
//!
//! let bridge = Bridge::new(Arc::new(CandleEngine::new()));
//! let handle = bridge.initialize_model("models/tinyllama.Q4_K_M.gguf")?;
//! println!("{}", bridge.generate(handle, "Once upon a time")?);
//! bridge.free_model(handle)?;
//! ```
//!
//! Handles are checked on every call: a released handle is rejected with
//! [`BridgeError::Released`] instead of reaching the engine.
//!
//! # Features
//!
//! - **cuda**: run on the first CUDA device when one is available
//! - **metal**: run on the default Metal device when one is available

pub mod bridge;
pub mod core;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod logging;

pub use self::bridge::{Bridge, Handle, HandleTable, LoadedModel};
pub use self::core::{ContextParams, TokenId};
pub use self::engine::{CandleEngine, Context, Engine, Generation, ModelMeta, StopMatcher, StopReason};
pub use self::error::{BridgeError, Result};
