//! Backup retention.

use crate::storage::{backup_key, backup_stamp, Backend, StorageResult, DATABASE_DIR};

/// Default number of timestamped backups to retain.
pub const DEFAULT_MAX_BACKUPS: usize = 20;

/// Delete the oldest backups until at most `max_backups` remain.
///
/// Returns the retained backup timestamps, newest first. Runs after every
/// full save and once at boot, where the returned list doubles as the
/// fallback chain for corrupted-document recovery.
pub async fn prune_backups(backend: &dyn Backend, max_backups: usize) -> StorageResult<Vec<u64>> {
    let files = backend.list(DATABASE_DIR).await?;
    let mut stamps: Vec<u64> = files.iter().filter_map(|f| backup_stamp(f)).collect();
    stamps.sort_unstable_by(|a, b| b.cmp(a));

    while stamps.len() > max_backups {
        if let Some(oldest) = stamps.pop() {
            log::debug!("pruning backup {oldest}");
            backend.delete(&backup_key(oldest)).await?;
        }
    }
    Ok(stamps)
}
