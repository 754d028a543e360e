//! Remote backup (upload) protocol.

use crate::client::{DriveError, RemoteStore};
use crate::names::{current_object_name, snapshot_name};
use crate::pool::run_bounded;
use satchel_core::codec::EncodeOptions;
use satchel_core::context::StorageContext;
use satchel_core::document::Document;
use satchel_core::storage::{epoch_millis, ASSET_DIR};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Default number of concurrent transfers.
pub const DEFAULT_PARALLEL_TRANSFERS: usize = 20;

/// What a backup run did.
#[derive(Debug, Default)]
pub struct BackupReport {
    /// Assets uploaded this run.
    pub uploaded: usize,
    /// Assets skipped because the remote already had them.
    pub skipped: usize,
    /// Asset keys that could not be read locally.
    pub missing: Vec<String>,
    /// Asset keys whose upload failed.
    pub failed: Vec<String>,
    /// Name of the document snapshot created at the end.
    pub snapshot_name: String,
}

/// Upload every local asset the remote is missing, then a fresh document
/// snapshot.
///
/// Idempotent and resumable: an asset whose remote name already exists is
/// skipped, so an interrupted backup picks up where it left off. Unreadable
/// or failing assets are recorded and do not abort the run.
pub async fn backup_to_remote<D: Document>(
    ctx: &StorageContext<D>,
    remote: Arc<dyn RemoteStore>,
    doc: &D,
    parallel_transfers: usize,
) -> Result<BackupReport, DriveError> {
    ctx.sink.waiting("Uploading backup... (fetching file list)");
    let existing: HashSet<String> = remote
        .list_objects()
        .await?
        .into_iter()
        .map(|o| o.name)
        .collect();
    log::info!("remote backup: {} existing objects", existing.len());

    let mut to_upload: Vec<(String, String)> = Vec::new();
    let mut skipped = 0;
    for key in ctx.assets.keys().await? {
        if !key.starts_with(&format!("{ASSET_DIR}/")) {
            continue;
        }
        let name = current_object_name(&key);
        if existing.contains(&name) {
            skipped += 1;
        } else {
            to_upload.push((key, name));
        }
    }
    let total = to_upload.len();
    log::info!("remote backup: {total} to upload, {skipped} already present");

    let uploaded = Arc::new(AtomicUsize::new(0));
    let missing = Arc::new(Mutex::new(Vec::new()));
    let failed = Arc::new(Mutex::new(Vec::new()));

    {
        let assets = ctx.assets.clone();
        let sink = ctx.sink.clone();
        let remote = remote.clone();
        let (uploaded, missing, failed) = (uploaded.clone(), missing.clone(), failed.clone());

        run_bounded(parallel_transfers, to_upload, move |(key, name)| {
            let assets = assets.clone();
            let sink = sink.clone();
            let remote = remote.clone();
            let (uploaded, missing, failed) = (uploaded.clone(), missing.clone(), failed.clone());
            async move {
                let data = match assets.get(&key).await {
                    Ok(Some(data)) if !data.is_empty() => data,
                    Ok(_) => {
                        log::warn!("asset missing locally, skipping upload: {key}");
                        missing.lock().unwrap_or_else(|e| e.into_inner()).push(key);
                        return;
                    }
                    Err(e) => {
                        log::warn!("failed to read asset {key}: {e}");
                        missing.lock().unwrap_or_else(|e| e.into_inner()).push(key);
                        return;
                    }
                };
                match remote.upload_object(&name, data).await {
                    Ok(()) => {
                        let done = uploaded.fetch_add(1, Ordering::SeqCst) + 1;
                        sink.waiting(&format!("Uploading backup... ({done} / {total})"));
                    }
                    Err(e) => {
                        log::warn!("failed to upload {name}: {e}");
                        failed.lock().unwrap_or_else(|e| e.into_inner()).push(key);
                    }
                }
            }
        })
        .await;
    }

    ctx.sink.waiting("Uploading backup... (saving database)");
    let data = ctx.codec.encode(doc, EncodeOptions { compression: true })?;
    let snapshot = snapshot_name(epoch_millis() / 1000);
    remote.upload_object(&snapshot, data).await?;
    log::info!("remote backup: database snapshot saved as {snapshot}");

    let report = BackupReport {
        uploaded: uploaded.load(Ordering::SeqCst),
        skipped,
        missing: take_vec(&missing),
        failed: take_vec(&failed),
        snapshot_name: snapshot,
    };

    if report.missing.is_empty() && report.failed.is_empty() {
        ctx.sink.done("Success");
    } else {
        let mut summary =
            String::from("Backup finished, but some assets could not be uploaded:\n\n");
        for key in report.missing.iter() {
            summary.push_str(&format!("* **missing locally**: `{key}`\n"));
        }
        for key in report.failed.iter() {
            summary.push_str(&format!("* **upload failed**: `{key}`\n"));
        }
        ctx.sink.markdown(&summary);
    }
    Ok(report)
}

fn take_vec(shared: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    std::mem::take(&mut *shared.lock().unwrap_or_else(|e| e.into_inner()))
}
