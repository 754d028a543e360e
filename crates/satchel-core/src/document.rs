//! External-collaborator traits for the application document.

use std::sync::{Arc, RwLock};

/// The application document as this engine sees it: an opaque, cloneable
/// value that knows which asset keys it references.
///
/// The business schema lives with the embedding application; the engine only
/// needs enough surface to purge orphans, restore backups and patch the
/// first-run flag after a remote restore.
pub trait Document: Clone + Default + Send + Sync + 'static {
    /// Asset keys (or basenames) referenced by any field of the document.
    fn asset_refs(&self) -> Vec<String>;

    /// Mark first-run setup as complete. Called on restored documents so the
    /// application skips its onboarding flow after a restore.
    fn complete_first_run(&mut self);
}

/// Source of document snapshots for the save loop.
pub trait DocumentSource<D>: Send + Sync {
    /// A clone of the current document state.
    fn snapshot(&self) -> D;
}

/// Shared mutable document handle, usable as a [`DocumentSource`].
pub struct SharedDocument<D> {
    inner: Arc<RwLock<D>>,
}

impl<D: Clone> SharedDocument<D> {
    pub fn new(doc: D) -> Self {
        Self {
            inner: Arc::new(RwLock::new(doc)),
        }
    }

    /// Replace the whole document.
    pub fn replace(&self, doc: D) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = doc;
    }

    /// Mutate the document in place.
    pub fn update(&self, f: impl FnOnce(&mut D)) {
        f(&mut self.inner.write().unwrap_or_else(|e| e.into_inner()));
    }
}

impl<D> Clone for SharedDocument<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Clone + Send + Sync> DocumentSource<D> for SharedDocument<D> {
    fn snapshot(&self) -> D {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
