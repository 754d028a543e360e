//! satchel-drive: remote synchronization and portable backups.
//!
//! Two ways of moving a satchel store off the machine it lives on:
//!
//! - a remote object store (cloud-drive HTTP API): [`backup::backup_to_remote`]
//!   uploads missing assets plus a timestamped document snapshot with bounded
//!   concurrency, [`restore::restore_from_remote`] picks a snapshot and pulls
//!   back whatever is missing locally, and [`restore::sync_from_remote`] is
//!   the timestamp-gated continuous variant;
//! - a portable single-file backup: [`local::export_backup`] streams the
//!   document and every asset into one self-describing file,
//!   [`local::import_backup`] reads such a file back incrementally.
//!
//! Both paths go through the same `satchel_core` storage context and treat
//! missing data as a diagnostic, not a failure.

pub mod backup;
pub mod client;
pub mod local;
pub mod names;
pub mod pool;
pub mod restore;

pub use backup::{backup_to_remote, BackupReport, DEFAULT_PARALLEL_TRANSFERS};
pub use client::{DriveClient, DriveError, RemoteObject, RemoteStore};
pub use local::{export_backup, import_backup, ExportReport, ImportOutcome};
pub use names::{PORTABLE_DOCUMENT_NAME, SNAPSHOT_SUFFIX, SYNC_SUFFIX};
pub use restore::{
    restore_from_remote, sync_from_remote, NewestPicker, RestoreOutcome, RestoreReport,
    SnapshotDescriptor, SnapshotPicker, SyncOutcome,
};
