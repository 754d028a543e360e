//! One-shot storage migrations.
//!
//! Each migration is idempotent and resumable: a crash mid-run leaves both
//! source and destination populated, and re-running detects what is left to
//! do. Sources are never cleared until every destination write succeeded.

use crate::status::StatusSink;
use crate::storage::{
    is_backup_key, Backend, StorageResult, ASSET_DIR, DATABASE_KEY, MIGRATION_FLAG_KEY,
};

/// Move every asset from `source` to `dest`, then clear the source.
///
/// A no-op when the source holds no assets — that is also how a completed
/// run is recognized on restart. Items already present at the destination
/// are skipped, so re-copying after a crash neither duplicates nor loses
/// data. Unreadable items are logged and skipped; a failed destination
/// write aborts before anything is deleted.
pub async fn migrate_assets(
    source: &dyn Backend,
    dest: &dyn Backend,
    sink: &dyn StatusSink,
) -> StorageResult<usize> {
    let names = source.list(ASSET_DIR).await?;
    if names.is_empty() {
        return Ok(0);
    }

    log::info!("starting asset migration for {} assets", names.len());
    sink.waiting(&format!("Migrating assets... (0 / {})", names.len()));

    let mut migrated = 0;
    for (i, name) in names.iter().enumerate() {
        sink.waiting(&format!("Migrating assets... ({} / {})", i + 1, names.len()));
        let key = format!("{ASSET_DIR}/{name}");
        match source.get(&key).await {
            Ok(Some(data)) if !data.is_empty() => {
                if dest.get(&key).await?.is_none() {
                    dest.set(&key, data).await?;
                    migrated += 1;
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("failed to read asset during migration: {name}: {e}");
            }
        }
    }
    log::info!("asset migration completed ({migrated} assets migrated)");

    sink.waiting("Cleaning up migrated assets...");
    for name in &names {
        source.delete(&format!("{ASSET_DIR}/{name}")).await?;
    }
    Ok(migrated)
}

/// Move the document and its backups from `source` to `dest`, once.
///
/// Guarded by the [`MIGRATION_FLAG_KEY`] sentinel on the destination: once
/// the flag is set this is a no-op forever. An absent source document just
/// sets the flag. The source copies are deleted only after the flag write,
/// so a crash anywhere leaves a re-runnable state.
pub async fn migrate_document(
    source: &dyn Backend,
    dest: &dyn Backend,
    sink: &dyn StatusSink,
) -> StorageResult<bool> {
    if dest.get(MIGRATION_FLAG_KEY).await?.is_some() {
        return Ok(false);
    }

    let Some(document) = source.get(DATABASE_KEY).await? else {
        dest.set(MIGRATION_FLAG_KEY, vec![1]).await?;
        return Ok(false);
    };

    log::info!("starting document migration");
    sink.waiting("Migrating database...");

    dest.set(DATABASE_KEY, document).await?;

    let backup_keys: Vec<String> = source
        .keys()
        .await?
        .into_iter()
        .filter(|k| is_backup_key(k))
        .collect();
    for key in &backup_keys {
        if let Some(data) = source.get(key).await? {
            if !data.is_empty() {
                dest.set(key, data).await?;
            }
        }
    }

    dest.set(MIGRATION_FLAG_KEY, vec![1]).await?;
    log::info!("document migration completed");

    source.delete(DATABASE_KEY).await?;
    for key in &backup_keys {
        source.delete(key).await?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::LogSink;
    use crate::storage::{backup_key, MemoryBackend};

    #[tokio::test]
    async fn test_asset_migration_moves_everything() {
        let source = MemoryBackend::new();
        let dest = MemoryBackend::new();
        source.set("assets/a.png", vec![1]).await.unwrap();
        source.set("assets/b.png", vec![2]).await.unwrap();

        let migrated = migrate_assets(&source, &dest, &LogSink).await.unwrap();

        assert_eq!(migrated, 2);
        assert!(source.list("assets").await.unwrap().is_empty());
        assert_eq!(dest.get("assets/a.png").await.unwrap(), Some(vec![1]));
        assert_eq!(dest.get("assets/b.png").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_asset_migration_is_idempotent() {
        let source = MemoryBackend::new();
        let dest = MemoryBackend::new();
        source.set("assets/a.png", vec![1]).await.unwrap();

        migrate_assets(&source, &dest, &LogSink).await.unwrap();
        let snapshot = dest.keys().await.unwrap();

        // Second run: source is empty, nothing changes.
        let migrated = migrate_assets(&source, &dest, &LogSink).await.unwrap();
        assert_eq!(migrated, 0);
        assert_eq!(dest.keys().await.unwrap(), snapshot);
        assert!(source.list("assets").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_asset_migration_resumes_after_partial_copy() {
        let source = MemoryBackend::new();
        let dest = MemoryBackend::new();
        source.set("assets/a.png", vec![1]).await.unwrap();
        source.set("assets/b.png", vec![2]).await.unwrap();
        // A previous run already copied one item before crashing.
        dest.set("assets/a.png", vec![1]).await.unwrap();

        let migrated = migrate_assets(&source, &dest, &LogSink).await.unwrap();

        // Only the missing item was copied, nothing duplicated or lost.
        assert_eq!(migrated, 1);
        assert_eq!(dest.get("assets/a.png").await.unwrap(), Some(vec![1]));
        assert_eq!(dest.get("assets/b.png").await.unwrap(), Some(vec![2]));
        assert!(source.list("assets").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_source_is_noop() {
        let source = MemoryBackend::new();
        let dest = MemoryBackend::new();
        let migrated = migrate_assets(&source, &dest, &LogSink).await.unwrap();
        assert_eq!(migrated, 0);
        assert!(dest.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_document_migration_copies_document_and_backups() {
        let source = MemoryBackend::new();
        let dest = MemoryBackend::new();
        source.set(DATABASE_KEY, vec![42]).await.unwrap();
        source.set(&backup_key(100), vec![1]).await.unwrap();
        source.set(&backup_key(200), vec![2]).await.unwrap();
        source.set("assets/keep.png", vec![9]).await.unwrap();

        let ran = migrate_document(&source, &dest, &LogSink).await.unwrap();

        assert!(ran);
        assert_eq!(dest.get(DATABASE_KEY).await.unwrap(), Some(vec![42]));
        assert_eq!(dest.get(&backup_key(100)).await.unwrap(), Some(vec![1]));
        assert_eq!(dest.get(&backup_key(200)).await.unwrap(), Some(vec![2]));
        assert!(dest.get(MIGRATION_FLAG_KEY).await.unwrap().is_some());
        // Source document and backups are gone, assets untouched.
        assert_eq!(source.get(DATABASE_KEY).await.unwrap(), None);
        assert_eq!(source.get(&backup_key(100)).await.unwrap(), None);
        assert_eq!(source.get("assets/keep.png").await.unwrap(), Some(vec![9]));
    }

    #[tokio::test]
    async fn test_document_migration_flag_makes_noop() {
        let source = MemoryBackend::new();
        let dest = MemoryBackend::new();
        dest.set(MIGRATION_FLAG_KEY, vec![1]).await.unwrap();
        source.set(DATABASE_KEY, vec![42]).await.unwrap();

        let ran = migrate_document(&source, &dest, &LogSink).await.unwrap();

        assert!(!ran);
        assert_eq!(dest.get(DATABASE_KEY).await.unwrap(), None);
        assert_eq!(source.get(DATABASE_KEY).await.unwrap(), Some(vec![42]));
    }

    #[tokio::test]
    async fn test_document_migration_absent_source_sets_flag() {
        let source = MemoryBackend::new();
        let dest = MemoryBackend::new();

        let ran = migrate_document(&source, &dest, &LogSink).await.unwrap();

        assert!(!ran);
        assert!(dest.get(MIGRATION_FLAG_KEY).await.unwrap().is_some());

        // And the flag sticks on the next run.
        source.set(DATABASE_KEY, vec![1]).await.unwrap();
        let ran = migrate_document(&source, &dest, &LogSink).await.unwrap();
        assert!(!ran);
    }
}
