//! Boot-time document loading and recovery.

use crate::codec::EncodeOptions;
use crate::context::StorageContext;
use crate::document::Document;
use crate::migration::{migrate_assets, migrate_document};
use crate::retention::prune_backups;
use crate::storage::{
    backup_key, backup_stamp, basename, Backend, StorageError, StorageResult, ASSET_DIR,
    DATABASE_DIR, DATABASE_KEY,
};
use std::collections::HashSet;

/// Load the document at application boot.
///
/// Runs the one-shot migrations (assets strictly before any document
/// decode, since the document may reference assets that only exist
/// post-migration), prunes backups, then reads and decodes the canonical
/// document. A corrupt document falls back to the retained backups, newest
/// first; if none decodes the store is unrecoverable. A missing document is
/// not an error: a fresh default document is persisted and returned.
pub async fn boot_document<D: Document>(
    ctx: &StorageContext<D>,
    max_backups: usize,
) -> StorageResult<D> {
    if let Some(legacy) = &ctx.legacy {
        if let Err(e) = migrate_assets(legacy.as_ref(), ctx.assets.as_ref(), ctx.sink.as_ref()).await
        {
            log::warn!("asset migration failed, continuing with unmigrated assets: {e}");
        }
    }
    if let Err(e) =
        migrate_document(ctx.assets.as_ref(), ctx.docs.as_ref(), ctx.sink.as_ref()).await
    {
        log::warn!("document migration failed: {e}");
    }

    ctx.sink.waiting("Cleaning old backups...");
    let backups = match prune_backups(ctx.docs.as_ref(), max_backups).await {
        Ok(backups) => backups,
        Err(e) => {
            log::warn!("backup pruning failed: {e}");
            vec![]
        }
    };

    ctx.sink.waiting("Reading save file...");
    let mut raw = ctx.docs.get(DATABASE_KEY).await?;

    // Legacy installs keep the document in the old filesystem tree; pull it
    // across on first boot.
    if raw.is_none() {
        if let Some(legacy) = &ctx.legacy {
            if let Some(data) = legacy.get(DATABASE_KEY).await? {
                log::info!("migrating document from legacy store");
                ctx.docs.set(DATABASE_KEY, data.clone()).await?;
                raw = Some(data);
            }
        }
    }

    let doc = match raw {
        None => {
            log::info!("no existing document, creating a fresh one");
            let doc = D::default();
            let data = ctx.codec.encode(&doc, EncodeOptions::default())?;
            ctx.docs.set(DATABASE_KEY, data).await?;
            doc
        }
        Some(data) => {
            ctx.sink.waiting("Decoding save file...");
            match ctx.codec.decode(&data) {
                Ok(doc) => doc,
                Err(e) => {
                    log::error!("document decode failed, trying backups: {e}");
                    recover_from_backups(ctx, &backups).await?
                }
            }
        }
    };

    ctx.sink.waiting("Checking unnecessary files...");
    if let Err(e) = purge_orphans(ctx, &doc).await {
        log::warn!("asset purge failed: {e}");
    }

    Ok(doc)
}

/// Try each retained backup, newest first, until one decodes.
async fn recover_from_backups<D: Document>(
    ctx: &StorageContext<D>,
    backups: &[u64],
) -> StorageResult<D> {
    for stamp in backups {
        ctx.sink.waiting(&format!("Reading backup file {stamp}..."));
        let key = backup_key(*stamp);
        let mut data = ctx.docs.get(&key).await.ok().flatten();
        if data.is_none() {
            if let Some(legacy) = &ctx.legacy {
                data = legacy.get(&key).await.ok().flatten();
            }
        }
        let Some(data) = data else { continue };
        match ctx.codec.decode(&data) {
            Ok(doc) => {
                log::info!("recovered document from backup {stamp}");
                return Ok(doc);
            }
            Err(e) => log::warn!("backup {stamp} failed to decode: {e}"),
        }
    }
    Err(StorageError::Corrupted(
        "no retained backup could be decoded".to_string(),
    ))
}

/// Delete assets no field of the document references.
pub async fn purge_orphans<D: Document>(
    ctx: &StorageContext<D>,
    doc: &D,
) -> StorageResult<usize> {
    let referenced: HashSet<String> = doc
        .asset_refs()
        .iter()
        .map(|r| basename(r).to_string())
        .collect();

    let mut removed = 0;
    for key in ctx.assets.keys().await? {
        let Some(rest) = key.strip_prefix(ASSET_DIR) else {
            continue;
        };
        if !rest.starts_with('/') {
            continue;
        }
        if !referenced.contains(basename(&key)) {
            log::debug!("purging orphaned asset {key}");
            ctx.assets.delete(&key).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Timestamps of retained internal backups, newest first.
pub async fn list_internal_backups<D>(ctx: &StorageContext<D>) -> StorageResult<Vec<u64>> {
    let files = ctx.docs.list(DATABASE_DIR).await?;
    let mut stamps: Vec<u64> = files.iter().filter_map(|f| backup_stamp(f)).collect();
    stamps.sort_unstable_by(|a, b| b.cmp(a));
    Ok(stamps)
}

/// Decode one retained backup without persisting anything.
///
/// The caller decides whether to adopt the returned document as current
/// state.
pub async fn restore_internal_backup<D: Document>(
    ctx: &StorageContext<D>,
    stamp: u64,
) -> StorageResult<D> {
    let data = ctx
        .docs
        .get(&backup_key(stamp))
        .await?
        .ok_or_else(|| StorageError::Other(format!("backup {stamp} not found")))?;
    Ok(ctx.codec.decode(&data)?)
}
