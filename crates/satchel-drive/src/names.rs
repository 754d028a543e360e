//! Remote object naming.
//!
//! Two naming schemes coexist remotely. The current scheme is the asset's
//! basename plus `.bin`; the legacy scheme escapes the basename and appends
//! `.png`. Uploads always use the current scheme; restore resolves the
//! current scheme first, then the legacy one, so objects uploaded by either
//! generation of the application stay reachable.

use satchel_core::storage::basename;

/// File name of the document record inside a portable backup stream.
pub const PORTABLE_DOCUMENT_NAME: &str = "database.risudat";

/// Suffix of remote document snapshots created by explicit backups.
pub const SNAPSHOT_SUFFIX: &str = "-database.risudat";

/// Suffix of remote document snapshots created by continuous sync.
pub const SYNC_SUFFIX: &str = "-database.risudat2";

/// Remote object name for an asset key under the current scheme.
pub fn current_object_name(key: &str) -> String {
    format!("{}.bin", basename(key))
}

/// Remote object name for an asset key under the legacy scheme.
pub fn legacy_object_name(key: &str) -> String {
    let name = basename(key)
        .replace('_', "__")
        .replace('.', "_d")
        .replacen('/', "_s", 1);
    format!("{name}.png")
}

/// Remote name for a document snapshot taken at `epoch_seconds`.
pub fn snapshot_name(epoch_seconds: u64) -> String {
    format!("{epoch_seconds}{SNAPSHOT_SUFFIX}")
}

/// Parse the leading epoch-seconds prefix out of a snapshot name.
pub fn snapshot_timestamp(name: &str) -> Option<u64> {
    name.split('-').next()?.parse().ok()
}
