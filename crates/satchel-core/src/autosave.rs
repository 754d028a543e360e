//! The document save loop.
//!
//! A single long-lived task debounces document mutations, encodes the
//! document and writes it to the document backend, taking a timestamped
//! backup copy when the backup interval has elapsed. The loop never returns
//! under normal operation; failures are counted and surfaced through the
//! sink once they exceed the retry budget.

use crate::codec::{ChangeManifest, EncodeOptions, IncrementalEncoder};
use crate::context::StorageContext;
use crate::document::{Document, DocumentSource};
use crate::retention::{prune_backups, DEFAULT_MAX_BACKUPS};
use crate::storage::{backup_key, epoch_millis, StorageResult, DATABASE_KEY};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

/// Save loop tuning.
#[derive(Debug, Clone)]
pub struct SaveLoopConfig {
    /// How often the loop polls the dirty flag.
    pub poll_interval: Duration,
    /// Grace period before the first tick at startup.
    pub startup_delay: Duration,
    /// Delay after a successful save.
    pub post_save_delay: Duration,
    /// Delay after a successful save on account-backed storage, which is
    /// rate limited.
    pub rate_limited_delay: Duration,
    /// Minimum spacing between timestamped backups.
    pub backup_interval: Duration,
    /// Backups retained by pruning.
    pub max_backups: usize,
    /// Consecutive failures tolerated before a blocking error is surfaced.
    pub max_failures: u32,
    /// Whether storage is backed by a remote account (skips local backups,
    /// uses the rate-limited delay and compressed encodes).
    pub account_backed: bool,
}

impl Default for SaveLoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            startup_delay: Duration::from_secs(1),
            post_save_delay: Duration::from_millis(500),
            rate_limited_delay: Duration::from_secs(3),
            backup_interval: Duration::from_secs(10 * 60),
            max_backups: DEFAULT_MAX_BACKUPS,
            max_failures: 4,
            account_backed: false,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    records: Vec<String>,
    dirty_at: Option<Instant>,
}

/// Records mutations and debounces them into save ticks.
///
/// Touched record ids are kept most-recent-first for encoders capable of
/// partial re-encoding; draining keeps the head entry so the most recent
/// record is re-included in the next incremental save.
pub struct ChangeTracker {
    state: Mutex<TrackerState>,
    debounce: Duration,
}

impl ChangeTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            debounce,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Note a mutation without a record id.
    pub fn mark(&self) {
        self.lock().dirty_at = Some(Instant::now());
    }

    /// Note a mutation of a specific record.
    pub fn mark_record(&self, id: &str) {
        let mut state = self.lock();
        if state.records.first().map(String::as_str) != Some(id) {
            state.records.insert(0, id.to_string());
        }
        state.dirty_at = Some(Instant::now());
    }

    /// Whether a mutation is waiting to be saved.
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty_at.is_some()
    }

    /// Take the pending manifest if the debounce window has settled.
    pub fn take_if_settled(&self) -> Option<ChangeManifest> {
        let mut state = self.lock();
        let dirty_at = state.dirty_at?;
        if dirty_at.elapsed() < self.debounce {
            return None;
        }
        state.dirty_at = None;
        let manifest = ChangeManifest {
            records: state.records.clone(),
        };
        state.records.truncate(1);
        Some(manifest)
    }
}

/// Cross-instance write-ownership guard.
///
/// Every instance broadcasts a random session id before writing. Seeing a
/// foreign id means another instance has taken over this store; once seen,
/// the condition latches and this instance must stop writing.
pub struct WriteOwnership {
    session_id: Uuid,
    tx: broadcast::Sender<Uuid>,
    rx: Mutex<broadcast::Receiver<Uuid>>,
    foreign_seen: AtomicBool,
}

impl WriteOwnership {
    /// Create a guard on a fresh channel (single-instance setup).
    pub fn new() -> Self {
        let (tx, rx) = broadcast::channel(16);
        Self {
            session_id: Uuid::new_v4(),
            tx,
            rx: Mutex::new(rx),
            foreign_seen: AtomicBool::new(false),
        }
    }

    /// Create a guard for another instance sharing this one's channel.
    pub fn peer(&self) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
            foreign_seen: AtomicBool::new(false),
        }
    }

    /// Announce this session as the writer.
    pub fn announce(&self) {
        let _ = self.tx.send(self.session_id);
    }

    /// Whether a foreign writer has ever been observed.
    pub fn foreign_writer_seen(&self) -> bool {
        if self.foreign_seen.load(Ordering::SeqCst) {
            return true;
        }
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match rx.try_recv() {
                Ok(id) if id != self.session_id => {
                    self.foreign_seen.store(true, Ordering::SeqCst);
                    return true;
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return false,
            }
        }
    }
}

impl Default for WriteOwnership {
    fn default() -> Self {
        Self::new()
    }
}

/// The save loop itself. Construct once at boot and spawn [`run`](Self::run).
pub struct SaveLoop<D: Document> {
    ctx: Arc<StorageContext<D>>,
    source: Arc<dyn DocumentSource<D>>,
    encoder: Box<dyn IncrementalEncoder<D>>,
    tracker: Arc<ChangeTracker>,
    ownership: Arc<WriteOwnership>,
    config: SaveLoopConfig,
    last_backup: Option<Instant>,
    last_stamp: u64,
}

impl<D: Document> SaveLoop<D> {
    pub fn new(
        ctx: Arc<StorageContext<D>>,
        source: Arc<dyn DocumentSource<D>>,
        encoder: Box<dyn IncrementalEncoder<D>>,
        tracker: Arc<ChangeTracker>,
        ownership: Arc<WriteOwnership>,
        config: SaveLoopConfig,
    ) -> Self {
        Self {
            ctx,
            source,
            encoder,
            tracker,
            ownership,
            config,
            last_backup: None,
            last_stamp: 0,
        }
    }

    /// Run forever. Spawn this on the runtime; it only ends with the process.
    pub async fn run(mut self) {
        let options = EncodeOptions {
            compression: self.config.account_backed,
        };
        if let Err(e) = self.encoder.init(&self.source.snapshot(), options) {
            log::error!("failed to initialize save encoder: {e}");
            self.ctx.request_encoder_reload();
        }

        sleep(self.config.startup_delay).await;

        let mut failures: u32 = 0;
        let mut takeover_reported = false;

        loop {
            let Some(manifest) = self.tracker.take_if_settled() else {
                sleep(self.config.poll_interval).await;
                continue;
            };

            if self.ownership.foreign_writer_seen() {
                // Another instance owns this store now; writing from here
                // would interleave two encoders over one key.
                if !takeover_reported {
                    takeover_reported = true;
                    log::warn!("another instance took over saving, writes disabled");
                    self.ctx.sink.error(
                        "Another window has taken over saving. Reload this window to continue.",
                    );
                }
                sleep(Duration::from_secs(1)).await;
                continue;
            }

            self.ctx.set_saving(true);
            let result = self.save_tick(manifest, options).await;
            self.ctx.set_saving(false);

            match result {
                Ok(()) => {
                    failures = 0;
                    let delay = if self.config.account_backed {
                        self.config.rate_limited_delay
                    } else {
                        self.config.post_save_delay
                    };
                    sleep(delay).await;
                }
                Err(e) => {
                    failures += 1;
                    log::error!("database save failed ({failures}): {e}");
                    if failures > self.config.max_failures {
                        self.ctx.sink.error(&format!(
                            "Database save keeps failing: {e}. Manual intervention required."
                        ));
                    }
                }
            }
        }
    }

    async fn save_tick(
        &mut self,
        manifest: ChangeManifest,
        options: EncodeOptions,
    ) -> StorageResult<()> {
        self.ownership.announce();

        let doc = self.source.snapshot();
        if self.ctx.take_encoder_reload() {
            self.encoder.init(&doc, options)?;
        }
        self.encoder.apply(&doc, &manifest)?;
        let data = self.encoder.encode()?;
        if data.is_empty() {
            log::warn!("encoder produced no data, skipping save tick");
            return Ok(());
        }

        let should_backup = !self.config.account_backed
            && self
                .last_backup
                .is_none_or(|t| t.elapsed() >= self.config.backup_interval);
        // The save payload's ownership moves into the backend, so the backup
        // copy has to be taken first.
        let backup_copy = should_backup.then(|| data.clone());

        self.ctx.docs.set(DATABASE_KEY, data).await?;

        if let Some(copy) = backup_copy {
            let stamp = (epoch_millis() / 100).max(self.last_stamp + 1);
            self.last_stamp = stamp;
            self.ctx.docs.set(&backup_key(stamp), copy).await?;
            self.last_backup = Some(Instant::now());
        }

        if !self.config.account_backed {
            prune_backups(self.ctx.docs.as_ref(), self.config.max_backups).await?;
        }
        Ok(())
    }
}
