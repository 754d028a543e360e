//! satchel-core: local-first persistence engine.
//!
//! Durably stores one mutable document plus a set of binary assets across
//! pluggable storage backends, keeps them consistent across backend
//! migrations, debounces and serializes writes, and rotates timestamped
//! backups. The document's business schema and binary encoding are external
//! collaborators, consumed through the [`document::Document`] and
//! [`codec::DocumentCodec`] seams.
//!
//! The usual wiring at application boot:
//!
//! 1. [`context::open_default_context`] (or hand-built backends) to get a
//!    [`context::StorageContext`];
//! 2. [`boot::boot_document`] to migrate, load and repair the document;
//! 3. spawn [`autosave::SaveLoop::run`] and feed its
//!    [`autosave::ChangeTracker`] from the application's mutation points.

pub mod assets;
pub mod autosave;
pub mod boot;
pub mod codec;
pub mod context;
pub mod document;
pub mod migration;
pub mod retention;
pub mod status;
pub mod storage;

pub use autosave::{ChangeTracker, SaveLoop, SaveLoopConfig, WriteOwnership};
pub use boot::boot_document;
pub use codec::{ChangeManifest, CodecError, DocumentCodec, EncodeOptions, IncrementalEncoder};
pub use context::{default_base_dir, open_default_context, StorageContext};
pub use document::{Document, DocumentSource, SharedDocument};
pub use status::{LogSink, StatusSink};
pub use storage::{
    Backend, BoxFuture, FileBackend, KvBackend, MemoryBackend, StorageError, StorageResult,
    WorkerBackend, WorkerChannel, DATABASE_KEY,
};
