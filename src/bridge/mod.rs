//! The handle bridge: load, generate and release models by opaque handle.

pub mod handle;

pub use handle::{Handle, HandleTable};

use crate::core::ContextParams;
use crate::engine::{Context, Engine, Generation, ModelMeta};
use crate::error::{BridgeError, Result};
use parking_lot::{ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// A single loaded model with exactly one owner.
///
/// Dropping it runs the engine's teardown.
pub struct LoadedModel {
    path: PathBuf,
    context: Box<dyn Context>,
}

impl LoadedModel {
    /// No validation of `path` happens here; whatever the engine reports is
    /// returned as [`BridgeError::ModelLoad`].
    pub fn load(engine: &dyn Engine, path: impl AsRef<Path>, params: &ContextParams) -> Result<Self> {
        let path = path.as_ref();
        let start = Instant::now();
        let context = engine
            .load_from_file(path, params)
            .map_err(|e| BridgeError::model_load(path, &e))?;

        tracing::debug!("{} engine loaded {} in {:.2?}", engine.name(), path.display(), start.elapsed());
        Ok(Self {
            path: path.to_path_buf(),
            context,
        })
    }

    pub fn generate(&mut self, prompt: &str) -> Result<String> {
        Ok(self.generate_stream(prompt, |_| true)?.text)
    }

    pub fn generate_stream<F>(&mut self, prompt: &str, mut on_token: F) -> Result<Generation>
    where
        F: FnMut(&str) -> bool,
    {
        self.context
            .generate(prompt, &mut on_token)
            .map_err(|e| BridgeError::generation(&e))
    }

    pub fn meta(&self) -> &ModelMeta {
        self.context.meta()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LoadedModel {
    fn drop(&mut self) {
        tracing::debug!("Releasing model {}", self.path.display());
    }
}

// Other threads wait on the lock. The owning thread re-entering from a
// callback gets through the lock but finds the cell borrowed.
type SharedModel = Arc<ReentrantMutex<RefCell<LoadedModel>>>;

/// Maps opaque handles to loaded models.
///
/// The table lock is held only to look up, insert or remove an entry. Each
/// model has its own lock, so calls on one handle run one at a time while
/// other handles proceed. Releasing a handle while a call on it is in flight
/// is allowed: the handle stops resolving at once and the model is dropped
/// when that call returns. Using a handle from inside its own streaming
/// callback fails with [`BridgeError::Busy`].
pub struct Bridge {
    engine: Arc<dyn Engine>,
    models: RwLock<HandleTable<SharedModel>>,
}

impl Bridge {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            models: RwLock::new(HandleTable::new()),
        }
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    /// Load a model with the engine's default parameters.
    pub fn initialize_model(&self, path: impl AsRef<Path>) -> Result<Handle> {
        let params = self.engine.default_params();
        self.initialize_model_with(path, &params)
    }

    pub fn initialize_model_with(&self, path: impl AsRef<Path>, params: &ContextParams) -> Result<Handle> {
        let model = LoadedModel::load(self.engine.as_ref(), path.as_ref(), params)?;
        let handle = self.models.write().insert(Arc::new(ReentrantMutex::new(RefCell::new(model))));
        tracing::info!("Model {} loaded as handle {}", path.as_ref().display(), handle);
        Ok(handle)
    }

    pub fn generate(&self, handle: Handle, prompt: &str) -> Result<String> {
        Ok(self.generate_stream(handle, prompt, |_| true)?.text)
    }

    pub fn generate_stream<F>(&self, handle: Handle, prompt: &str, on_token: F) -> Result<Generation>
    where
        F: FnMut(&str) -> bool,
    {
        let shared = self.lookup(handle)?;
        let guard = shared.lock();
        let mut model = guard.try_borrow_mut().map_err(|_| Self::busy(handle))?;
        model.generate_stream(prompt, on_token)
    }

    pub fn meta(&self, handle: Handle) -> Result<ModelMeta> {
        let shared = self.lookup(handle)?;
        let guard = shared.lock();
        let model = guard.try_borrow().map_err(|_| Self::busy(handle))?;
        Ok(model.meta().clone())
    }

    /// Release a model. A second release of the same handle is rejected.
    pub fn free_model(&self, handle: Handle) -> Result<()> {
        let removed = self.models.write().remove(handle);
        match removed {
            Ok(model) => {
                if Arc::strong_count(&model) > 1 {
                    tracing::debug!("Handle {} released while a call is in flight", handle);
                }
                drop(model);
                tracing::info!("Handle {} released", handle);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("free_model rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Load the model behind `handle` again with new parameters. The old
    /// handle is released only once the new one is live, so a failed reload
    /// leaves it usable.
    pub fn reload_with(&self, handle: Handle, params: &ContextParams) -> Result<Handle> {
        let path = {
            let shared = self.lookup(handle)?;
            let guard = shared.lock();
            let model = guard.try_borrow().map_err(|_| Self::busy(handle))?;
            model.path().to_path_buf()
        };

        let reloaded = self.initialize_model_with(&path, params)?;
        if self.free_model(handle).is_err() {
            tracing::debug!("Handle {} was released during reload of {}", handle, path.display());
        }
        Ok(reloaded)
    }

    pub fn live_models(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.models.read().contains(handle)
    }

    fn busy(handle: Handle) -> BridgeError {
        tracing::warn!("Handle {} used from inside its own callback", handle);
        BridgeError::Busy(handle.into_raw())
    }

    fn lookup(&self, handle: Handle) -> Result<SharedModel> {
        self.models.read().get(handle).map(Arc::clone).map_err(|e| {
            tracing::warn!("lookup rejected: {}", e);
            e
        })
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let leftover = self.models.get_mut().drain();
        if !leftover.is_empty() {
            tracing::debug!("Bridge dropped with {} live models", leftover.len());
        }
    }
}
