//! Error types for the bridge.

use std::path::PathBuf;
use std::str::Utf8Error;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by the handle bridge and its C ABI.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The engine could not load the model file.
    #[error("Model loading failed for {}: {message}", .path.display())]
    ModelLoad { path: PathBuf, message: String },

    /// The engine failed while generating.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// The handle was never issued by this bridge.
    #[error("Invalid handle: {0:#x}")]
    InvalidHandle(u64),

    /// The handle was issued but has since been released.
    #[error("Handle {0:#x} has already been released")]
    Released(u64),

    /// The handle was used from inside one of its own generation callbacks.
    #[error("Handle {0:#x} is busy: called again from inside its own generation callback")]
    Busy(u64),

    /// A required pointer argument was null.
    #[error("Null pointer passed for {0}")]
    NullPointer(&'static str),

    /// A string crossing the boundary was not UTF-8.
    #[error("{what} is not valid UTF-8: {source}")]
    InvalidUtf8 {
        what: &'static str,
        #[source]
        source: Utf8Error,
    },

    /// A string cannot be handed out as a C string.
    #[error("String contains an interior NUL byte at position {0}")]
    InteriorNul(usize),

    /// Options JSON could not be parsed.
    #[error("Invalid options: {0}")]
    Options(#[from] serde_json::Error),

    /// A panic was caught at the FFI boundary.
    #[error("Panic inside bridge call: {0}")]
    Panic(String),
}

impl BridgeError {
    /// Create a model load error from an engine failure.
    pub fn model_load(path: impl Into<PathBuf>, err: &anyhow::Error) -> Self {
        Self::ModelLoad {
            path: path.into(),
            message: format!("{:#}", err),
        }
    }

    /// Create a generation error from an engine failure.
    pub fn generation(err: &anyhow::Error) -> Self {
        Self::Generation(format!("{:#}", err))
    }

    /// Whether the error came from using a stale or unknown handle.
    pub fn is_handle_error(&self) -> bool {
        matches!(self, Self::InvalidHandle(_) | Self::Released(_))
    }
}
