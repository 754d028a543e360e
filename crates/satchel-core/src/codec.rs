//! Document codec seams.
//!
//! The binary encoding of the document is external; the engine consumes it
//! as an opaque fallible transform. Corruption is signaled by a failed
//! decode.

use std::sync::Arc;
use thiserror::Error;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Options passed through to the encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    /// Whether the payload should be compressed.
    pub compression: bool,
}

/// Whole-document codec.
pub trait DocumentCodec<D>: Send + Sync {
    fn encode(&self, doc: &D, options: EncodeOptions) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<D, CodecError>;
}

/// Minimal delta describing what changed since the last save, used by
/// encoders capable of partial re-encoding.
#[derive(Debug, Clone, Default)]
pub struct ChangeManifest {
    /// Touched record identifiers, most recent first.
    pub records: Vec<String>,
}

impl ChangeManifest {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Stateful encoder fed incremental change manifests between encodes.
///
/// `init` rebuilds encoder state from a full document; the save loop calls
/// it again whenever a full reload is requested (for example after an
/// import replaced the stored document out from under the encoder).
pub trait IncrementalEncoder<D>: Send {
    fn init(&mut self, doc: &D, options: EncodeOptions) -> Result<(), CodecError>;
    fn apply(&mut self, doc: &D, manifest: &ChangeManifest) -> Result<(), CodecError>;
    fn encode(&mut self) -> Result<Vec<u8>, CodecError>;
}

/// Encoder that ignores manifests and re-encodes the full document each
/// time. The default when the codec has no partial re-encoding support.
pub struct FullEncoder<D> {
    codec: Arc<dyn DocumentCodec<D>>,
    options: EncodeOptions,
    latest: Option<D>,
}

impl<D> FullEncoder<D> {
    pub fn new(codec: Arc<dyn DocumentCodec<D>>) -> Self {
        Self {
            codec,
            options: EncodeOptions::default(),
            latest: None,
        }
    }
}

impl<D: Clone + Send> IncrementalEncoder<D> for FullEncoder<D> {
    fn init(&mut self, doc: &D, options: EncodeOptions) -> Result<(), CodecError> {
        self.options = options;
        self.latest = Some(doc.clone());
        Ok(())
    }

    fn apply(&mut self, doc: &D, _manifest: &ChangeManifest) -> Result<(), CodecError> {
        self.latest = Some(doc.clone());
        Ok(())
    }

    fn encode(&mut self) -> Result<Vec<u8>, CodecError> {
        let doc = self
            .latest
            .as_ref()
            .ok_or_else(|| CodecError::Encode("encoder not initialized".to_string()))?;
        self.codec.encode(doc, self.options)
    }
}
