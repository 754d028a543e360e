//! Remote restore and sync protocols.

use crate::client::{DriveError, RemoteObject, RemoteStore};
use crate::names::{
    current_object_name, legacy_object_name, snapshot_timestamp, SNAPSHOT_SUFFIX, SYNC_SUFFIX,
};
use crate::pool::run_bounded;
use satchel_core::codec::EncodeOptions;
use satchel_core::context::StorageContext;
use satchel_core::document::Document;
use satchel_core::storage::{basename, BoxFuture, ASSET_DIR, DATABASE_KEY};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Older snapshot candidates offered for manual selection, beyond the
/// newest one.
pub const SNAPSHOT_MENU_LIMIT: usize = 7;

/// Unresolved asset names captured for diagnostics.
pub const UNRESOLVED_LOG_LIMIT: usize = 20;

/// One restorable remote snapshot, ranked by its embedded timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    pub remote_id: String,
    pub name: String,
    pub timestamp: u64,
}

/// Chooses which snapshot to restore when several exist.
pub trait SnapshotPicker: Send + Sync {
    /// Returns an index into the candidate list: 0 for `newest`, 1-based
    /// positions for entries of `older`.
    fn pick<'a>(
        &'a self,
        newest: &'a SnapshotDescriptor,
        older: &'a [SnapshotDescriptor],
    ) -> BoxFuture<'a, usize>;
}

/// Picker that always takes the newest snapshot.
pub struct NewestPicker;

impl SnapshotPicker for NewestPicker {
    fn pick<'a>(
        &'a self,
        _newest: &'a SnapshotDescriptor,
        _older: &'a [SnapshotDescriptor],
    ) -> BoxFuture<'a, usize> {
        Box::pin(async { 0 })
    }
}

/// What a restore run did.
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Assets downloaded this run.
    pub downloaded: usize,
    /// Assets already present locally.
    pub skipped: usize,
    /// References that resolved to no remote object under either naming
    /// scheme.
    pub not_found: usize,
    /// Diagnostics for the first [`UNRESOLVED_LOG_LIMIT`] unresolved names.
    pub unresolved: Vec<String>,
}

/// Outcome of an explicit restore.
#[derive(Debug)]
pub enum RestoreOutcome {
    /// The remote holds no document snapshots.
    NoSnapshots,
    /// The document was replaced; the application must fully restart so the
    /// freshly written document is the one everything else sees.
    RestartRequired(RestoreReport),
}

/// Outcome of a timestamp-gated sync check.
#[derive(Debug)]
pub enum SyncOutcome {
    /// No sync snapshot newer than the caller's watermark exists.
    NothingNew,
    /// A newer snapshot was applied; restart required. The caller should
    /// persist `timestamp` as its new watermark.
    RestartRequired {
        report: RestoreReport,
        timestamp: u64,
    },
}

/// Filter and rank remote snapshot candidates, newest first.
///
/// Names that do not parse as `<epoch-seconds><suffix>` are discarded.
pub fn rank_snapshots(
    objects: &[RemoteObject],
    suffix: &str,
    newer_than: Option<u64>,
) -> Vec<SnapshotDescriptor> {
    let mut candidates: Vec<SnapshotDescriptor> = objects
        .iter()
        .filter(|o| o.name.ends_with(suffix))
        .filter_map(|o| {
            let timestamp = snapshot_timestamp(&o.name)?;
            Some(SnapshotDescriptor {
                remote_id: o.id.clone(),
                name: o.name.clone(),
                timestamp,
            })
        })
        .filter(|d| newer_than.is_none_or(|floor| d.timestamp > floor))
        .collect();
    candidates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    candidates
}

/// Restore the document and missing assets from an explicit remote backup.
///
/// The newest snapshot is offered together with a bounded menu of older
/// ones; the decoded document's asset references are downloaded with
/// bounded concurrency, trying the current naming scheme before the legacy
/// one. Unresolvable references never abort the restore; they are counted
/// and the first few are kept for diagnostics.
pub async fn restore_from_remote<D: Document>(
    ctx: &StorageContext<D>,
    remote: Arc<dyn RemoteStore>,
    picker: &dyn SnapshotPicker,
    parallel_transfers: usize,
) -> Result<RestoreOutcome, DriveError> {
    ctx.sink.waiting("Loading backup... (fetching file list)");
    let objects = remote.list_objects().await?;
    log::info!("remote restore: {} objects listed", objects.len());

    let candidates = rank_snapshots(&objects, SNAPSHOT_SUFFIX, None);
    let Some(newest) = candidates.first() else {
        return Ok(RestoreOutcome::NoSnapshots);
    };

    let chosen = if candidates.len() > 1 {
        let older_end = (1 + SNAPSHOT_MENU_LIMIT).min(candidates.len());
        let index = picker.pick(newest, &candidates[1..older_end]).await;
        &candidates[index.min(candidates.len() - 1)]
    } else {
        newest
    };
    log::info!("remote restore: restoring snapshot {}", chosen.name);

    let report = apply_snapshot(ctx, remote, &objects, chosen, parallel_transfers, "Loading backup").await?;
    Ok(RestoreOutcome::RestartRequired(report))
}

/// Timestamp-gated continuous sync: apply the newest sync snapshot strictly
/// newer than `newer_than`, or report that nothing qualifies so the caller
/// can skip the reconciliation flow entirely.
pub async fn sync_from_remote<D: Document>(
    ctx: &StorageContext<D>,
    remote: Arc<dyn RemoteStore>,
    newer_than: Option<u64>,
    parallel_transfers: usize,
) -> Result<SyncOutcome, DriveError> {
    let objects = remote.list_objects().await?;
    let candidates = rank_snapshots(&objects, SYNC_SUFFIX, newer_than);
    let Some(newest) = candidates.first() else {
        return Ok(SyncOutcome::NothingNew);
    };
    let newest = newest.clone();

    ctx.sink.waiting("Syncing data...");
    let report =
        apply_snapshot(ctx, remote, &objects, &newest, parallel_transfers, "Syncing files").await?;
    Ok(SyncOutcome::RestartRequired {
        report,
        timestamp: newest.timestamp,
    })
}

/// Download and persist one snapshot plus its missing assets.
async fn apply_snapshot<D: Document>(
    ctx: &StorageContext<D>,
    remote: Arc<dyn RemoteStore>,
    objects: &[RemoteObject],
    chosen: &SnapshotDescriptor,
    parallel_transfers: usize,
    progress_label: &str,
) -> Result<RestoreReport, DriveError> {
    ctx.sink
        .waiting(&format!("{progress_label}... (downloading database)"));
    let raw = remote.download_object(&chosen.remote_id).await?;
    let mut doc: D = ctx.codec.decode(&raw)?;

    let by_name: HashMap<&str, &str> = objects
        .iter()
        .map(|o| (o.name.as_str(), o.id.as_str()))
        .collect();

    let local: HashSet<String> = ctx
        .assets
        .list(ASSET_DIR)
        .await?
        .into_iter()
        .chain(match &ctx.legacy {
            Some(legacy) => legacy.list(ASSET_DIR).await?,
            None => vec![],
        })
        .collect();

    let mut to_download: Vec<(String, String)> = Vec::new();
    let mut report = RestoreReport::default();
    for reference in doc.asset_refs() {
        let base = basename(&reference).to_string();
        if local.contains(&base) {
            report.skipped += 1;
            continue;
        }
        let current = current_object_name(&base);
        let legacy = legacy_object_name(&base);
        match by_name.get(current.as_str()).or_else(|| by_name.get(legacy.as_str())) {
            Some(id) => to_download.push((base, id.to_string())),
            None => {
                report.not_found += 1;
                if report.unresolved.len() < UNRESOLVED_LOG_LIMIT {
                    report.unresolved.push(format!(
                        "asset not found: \"{base}\" (searched as \"{current}\" and \"{legacy}\")"
                    ));
                }
            }
        }
    }
    let total = to_download.len();
    log::info!(
        "remote restore: {total} to download, {} already local, {} not found",
        report.skipped,
        report.not_found
    );

    let downloaded = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));
    {
        let assets = ctx.assets.clone();
        let sink = ctx.sink.clone();
        let remote = remote.clone();
        let (downloaded, processed) = (downloaded.clone(), processed.clone());
        let label = progress_label.to_string();

        run_bounded(parallel_transfers, to_download, move |(base, id)| {
            let assets = assets.clone();
            let sink = sink.clone();
            let remote = remote.clone();
            let (downloaded, processed) = (downloaded.clone(), processed.clone());
            let label = label.clone();
            async move {
                match remote.download_object(&id).await {
                    Ok(data) if !data.is_empty() => {
                        match assets.set(&format!("{ASSET_DIR}/{base}"), data).await {
                            Ok(()) => {
                                downloaded.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(e) => log::warn!("failed to store downloaded asset {base}: {e}"),
                        }
                    }
                    Ok(_) => log::warn!("remote object for {base} was empty, skipping"),
                    Err(e) => log::warn!("failed to download {base}: {e}"),
                }
                let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                sink.waiting(&format!("{label}... ({done} / {total})"));
            }
        })
        .await;
    }
    report.downloaded = downloaded.load(Ordering::SeqCst);

    for line in &report.unresolved {
        log::warn!("{line}");
    }

    // The restored document has by definition been through setup before.
    doc.complete_first_run();
    let data = ctx.codec.encode(&doc, EncodeOptions { compression: true })?;
    ctx.docs.set(DATABASE_KEY, data).await?;
    ctx.request_encoder_reload();
    ctx.sink.waiting("Success, restarting the application.");
    Ok(report)
}
