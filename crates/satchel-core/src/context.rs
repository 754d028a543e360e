//! The storage engine context.
//!
//! All engine state lives in one explicit context object constructed at
//! startup and threaded through every call, so embedders and tests can swap
//! any collaborator.

use crate::codec::DocumentCodec;
use crate::status::{LogSink, StatusSink};
use crate::storage::{Backend, FileBackend, KvBackend, StorageResult, WorkerBackend};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything the engine needs to operate on one logical store.
pub struct StorageContext<D> {
    /// Backend holding the document and its backups (worker-mediated in the
    /// default configuration).
    pub docs: Arc<dyn Backend>,
    /// Backend holding binary assets.
    pub assets: Arc<dyn Backend>,
    /// Pre-migration store, read as a fallback for legacy installs.
    pub legacy: Option<Arc<dyn Backend>>,
    /// Document codec.
    pub codec: Arc<dyn DocumentCodec<D>>,
    /// Progress/result sink.
    pub sink: Arc<dyn StatusSink>,
    encoder_reload: AtomicBool,
    saving: AtomicBool,
}

impl<D> StorageContext<D> {
    pub fn new(
        docs: Arc<dyn Backend>,
        assets: Arc<dyn Backend>,
        codec: Arc<dyn DocumentCodec<D>>,
    ) -> Self {
        Self {
            docs,
            assets,
            legacy: None,
            codec,
            sink: Arc::new(LogSink),
            encoder_reload: AtomicBool::new(false),
            saving: AtomicBool::new(false),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_legacy(mut self, legacy: Arc<dyn Backend>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    /// Ask the save loop to rebuild its encoder from the full document
    /// before the next encode.
    pub fn request_encoder_reload(&self) {
        self.encoder_reload.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_encoder_reload(&self) -> bool {
        self.encoder_reload.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_saving(&self, value: bool) {
        self.saving.store(value, Ordering::SeqCst);
    }

    /// Whether a save tick is currently writing.
    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }
}

/// Default data location, `<platform data dir>/satchel`.
pub fn default_base_dir() -> StorageResult<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| {
            crate::storage::StorageError::Io("Could not determine home directory".to_string())
        })?;
    Ok(base.join("satchel"))
}

/// Open the default backend arrangement under `base`.
///
/// The document store is the worker-mediated private tree with the
/// key-value store as its fallback; assets live in the key-value store. If
/// a pre-migration `data/` tree exists it is attached as the legacy
/// backend so boot can migrate it.
pub fn open_default_context<D>(
    base: &Path,
    codec: Arc<dyn DocumentCodec<D>>,
) -> StorageResult<StorageContext<D>> {
    let kv: Arc<KvBackend> = Arc::new(KvBackend::open(base.join("kv"))?);
    let docs = Arc::new(WorkerBackend::new(base.join("private"), kv.clone()));

    let mut ctx = StorageContext::new(docs, kv, codec);

    let legacy_dir = base.join("data");
    if legacy_dir.is_dir() {
        ctx = ctx.with_legacy(Arc::new(FileBackend::new(legacy_dir)?));
    }
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, EncodeOptions};
    use crate::storage::MemoryBackend;

    struct NullCodec;

    impl DocumentCodec<Vec<u8>> for NullCodec {
        fn encode(&self, doc: &Vec<u8>, _options: EncodeOptions) -> Result<Vec<u8>, CodecError> {
            Ok(doc.clone())
        }

        fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
            Ok(bytes.to_vec())
        }
    }

    #[test]
    fn test_encoder_reload_flag_is_taken_once() {
        let ctx = StorageContext::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::new()),
            Arc::new(NullCodec),
        );

        assert!(!ctx.take_encoder_reload());
        ctx.request_encoder_reload();
        assert!(ctx.take_encoder_reload());
        assert!(!ctx.take_encoder_reload());
    }
}
