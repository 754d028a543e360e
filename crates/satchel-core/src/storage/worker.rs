//! Worker-mediated storage channel.
//!
//! Physically synchronous file I/O runs on a dedicated worker thread so the
//! async side never blocks. The two sides speak tagged messages; responses
//! are matched to callers through a correlation table keyed by a
//! monotonically increasing request id, so any number of operations on the
//! same key may be in flight at once.
//!
//! The worker performs its setup on startup and reports `Ready`. If the
//! handshake fails or times out, the channel is unavailable and
//! [`WorkerBackend`] degrades to its fallback backend instead of failing.

use super::{
    ensure_payload, key_components, Backend, BoxFuture, StorageError, StorageResult, ASSET_DIR,
    DATABASE_DIR,
};
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// How long to wait for the worker's ready handshake.
pub const WORKER_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Request id reserved for the ready handshake.
const READY_ID: u64 = 0;

#[derive(Debug)]
enum WorkerOp {
    Save { key: String, data: Vec<u8> },
    Load { key: String },
    List { dir: String },
    Delete { key: String },
}

#[derive(Debug)]
struct WorkerRequest {
    id: u64,
    op: WorkerOp,
}

#[derive(Debug)]
enum WorkerReply {
    Ready,
    InitFailed(String),
    Saved,
    SaveFailed(String),
    Loaded(Vec<u8>),
    LoadFailed(String),
    Listed(Vec<String>),
    ListFailed(String),
    Deleted,
    DeleteFailed(String),
}

#[derive(Debug)]
struct WorkerResponse {
    id: u64,
    reply: WorkerReply,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<WorkerReply>>>>;

/// Async handle to the storage worker thread.
pub struct WorkerChannel {
    tx: std::sync::mpsc::Sender<WorkerRequest>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl WorkerChannel {
    /// Spawn a worker rooted at `root` and wait for its ready handshake.
    pub async fn connect(root: PathBuf) -> StorageResult<Self> {
        Self::connect_with_timeout(root, WORKER_READY_TIMEOUT).await
    }

    /// Like [`connect`](Self::connect), with a custom handshake timeout.
    pub async fn connect_with_timeout(
        root: PathBuf,
        ready_timeout: Duration,
    ) -> StorageResult<Self> {
        let (req_tx, req_rx) = std::sync::mpsc::channel::<WorkerRequest>();
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<WorkerResponse>();
        let pending: PendingMap = Arc::default();

        // Dispatcher: demultiplex the single response stream back to callers.
        let dispatch = pending.clone();
        tokio::spawn(async move {
            while let Some(WorkerResponse { id, reply }) = resp_rx.recv().await {
                let waiter = lock_pending(&dispatch).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => log::warn!("storage worker response for unknown request {id}"),
                }
            }
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        lock_pending(&pending).insert(READY_ID, ready_tx);

        thread::Builder::new()
            .name("satchel-storage-worker".into())
            .spawn(move || worker_main(root, req_rx, resp_tx))
            .map_err(|e| {
                StorageError::Unavailable(format!("failed to spawn worker thread: {}", e))
            })?;

        let channel = Self {
            tx: req_tx,
            pending,
            next_id: AtomicU64::new(READY_ID + 1),
        };

        match timeout(ready_timeout, ready_rx).await {
            Ok(Ok(WorkerReply::Ready)) => {
                log::info!("storage worker initialized");
                Ok(channel)
            }
            Ok(Ok(WorkerReply::InitFailed(e))) => Err(StorageError::Unavailable(e)),
            Ok(Ok(reply)) => Err(StorageError::Unavailable(format!(
                "unexpected handshake reply: {:?}",
                reply
            ))),
            Ok(Err(_)) => Err(StorageError::Unavailable(
                "worker exited before ready".to_string(),
            )),
            Err(_) => {
                lock_pending(&channel.pending).remove(&READY_ID);
                Err(StorageError::Unavailable(
                    "worker initialization timed out".to_string(),
                ))
            }
        }
    }

    async fn call(&self, op: WorkerOp) -> StorageResult<WorkerReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        if self.tx.send(WorkerRequest { id, op }).is_err() {
            lock_pending(&self.pending).remove(&id);
            return Err(StorageError::Unavailable(
                "worker channel closed".to_string(),
            ));
        }

        rx.await
            .map_err(|_| StorageError::Unavailable("worker dropped request".to_string()))
    }

    /// Write `data` under `key`. Ownership of the payload moves into the
    /// channel; no copy is made.
    pub async fn save(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        ensure_payload(key, &data)?;
        let op = WorkerOp::Save {
            key: key.to_string(),
            data,
        };
        match self.call(op).await? {
            WorkerReply::Saved => Ok(()),
            WorkerReply::SaveFailed(e) => Err(StorageError::Worker(e)),
            reply => Err(StorageError::Worker(format!("unexpected reply: {:?}", reply))),
        }
    }

    /// Read the blob under `key`. A missing key resolves to `None`.
    pub async fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let op = WorkerOp::Load {
            key: key.to_string(),
        };
        match self.call(op).await? {
            WorkerReply::Loaded(data) => Ok(Some(data)),
            WorkerReply::LoadFailed(_) => Ok(None),
            reply => Err(StorageError::Worker(format!("unexpected reply: {:?}", reply))),
        }
    }

    /// List file names directly under `dir`. A missing or unreadable
    /// directory resolves to an empty list.
    pub async fn list(&self, dir: &str) -> StorageResult<Vec<String>> {
        let op = WorkerOp::List {
            dir: dir.to_string(),
        };
        match self.call(op).await? {
            WorkerReply::Listed(names) => Ok(names),
            WorkerReply::ListFailed(e) => {
                log::warn!("storage worker list failed for {dir}: {e}");
                Ok(vec![])
            }
            reply => Err(StorageError::Worker(format!("unexpected reply: {:?}", reply))),
        }
    }

    /// Remove the blob under `key`. Deleting a missing key is a no-op.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let op = WorkerOp::Delete {
            key: key.to_string(),
        };
        match self.call(op).await? {
            WorkerReply::Deleted => Ok(()),
            WorkerReply::DeleteFailed(e) => Err(StorageError::Worker(e)),
            reply => Err(StorageError::Worker(format!("unexpected reply: {:?}", reply))),
        }
    }
}

fn lock_pending(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<WorkerReply>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Worker thread
// ============================================================================

fn worker_main(
    root: PathBuf,
    rx: std::sync::mpsc::Receiver<WorkerRequest>,
    tx: mpsc::UnboundedSender<WorkerResponse>,
) {
    if let Err(e) = std::fs::create_dir_all(&root) {
        let _ = tx.send(WorkerResponse {
            id: READY_ID,
            reply: WorkerReply::InitFailed(format!(
                "failed to open private store {}: {}",
                root.display(),
                e
            )),
        });
        return;
    }
    let _ = tx.send(WorkerResponse {
        id: READY_ID,
        reply: WorkerReply::Ready,
    });

    while let Ok(WorkerRequest { id, op }) = rx.recv() {
        let reply = match op {
            WorkerOp::Save { key, data } => match worker_save(&root, &key, &data) {
                Ok(()) => WorkerReply::Saved,
                Err(e) => WorkerReply::SaveFailed(e.to_string()),
            },
            WorkerOp::Load { key } => match worker_load(&root, &key) {
                Ok(data) => WorkerReply::Loaded(data),
                Err(e) => WorkerReply::LoadFailed(e.to_string()),
            },
            WorkerOp::List { dir } => match worker_list(&root, &dir) {
                Ok(names) => WorkerReply::Listed(names),
                Err(e) => WorkerReply::ListFailed(e.to_string()),
            },
            WorkerOp::Delete { key } => match worker_delete(&root, &key) {
                Ok(()) => WorkerReply::Deleted,
                Err(e) => WorkerReply::DeleteFailed(e.to_string()),
            },
        };
        if tx.send(WorkerResponse { id, reply }).is_err() {
            break;
        }
    }
}

fn resolve(root: &Path, key: &str) -> StorageResult<PathBuf> {
    let mut path = root.to_path_buf();
    if !key.is_empty() {
        for part in key_components(key)? {
            path.push(part);
        }
    }
    Ok(path)
}

fn worker_save(root: &Path, key: &str, data: &[u8]) -> StorageResult<()> {
    let path = resolve(root, key)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StorageError::Io(format!("create {}: {}", parent.display(), e)))?;
    }
    let mut file = std::fs::File::create(&path)
        .map_err(|e| StorageError::Io(format!("create {}: {}", path.display(), e)))?;
    file.write_all(data)
        .map_err(|e| StorageError::Io(format!("write {}: {}", path.display(), e)))?;
    file.sync_all()
        .map_err(|e| StorageError::Io(format!("flush {}: {}", path.display(), e)))?;
    Ok(())
}

fn worker_load(root: &Path, key: &str) -> StorageResult<Vec<u8>> {
    let path = resolve(root, key)?;
    std::fs::read(&path).map_err(|e| StorageError::Io(format!("read {}: {}", path.display(), e)))
}

fn worker_list(root: &Path, dir: &str) -> StorageResult<Vec<String>> {
    let path = resolve(root, dir)?;
    let entries = match std::fs::read_dir(&path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(StorageError::Io(format!("list {}: {}", path.display(), e))),
    };
    let mut names = Vec::new();
    for entry in entries.flatten() {
        if entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn worker_delete(root: &Path, key: &str) -> StorageResult<()> {
    let path = resolve(root, key)?;
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io(format!("delete {}: {}", path.display(), e))),
    }
}

// ============================================================================
// Backend wrapper with fallback
// ============================================================================

enum ChannelState {
    Untried,
    Up(Arc<WorkerChannel>),
    Down,
}

/// [`Backend`] over the worker channel, degrading to a fallback backend when
/// the worker cannot be brought up.
///
/// Initialization is lazy: the first operation connects the worker. If a
/// previously working channel dies mid-operation, the operation re-attempts
/// initialization once before switching to the fallback for good.
pub struct WorkerBackend {
    root: PathBuf,
    fallback: Arc<dyn Backend>,
    state: tokio::sync::Mutex<ChannelState>,
}

impl WorkerBackend {
    /// Create a worker backend rooted at `root` with `fallback` taking over
    /// when the worker is unavailable.
    pub fn new(root: PathBuf, fallback: Arc<dyn Backend>) -> Self {
        Self {
            root,
            fallback,
            state: tokio::sync::Mutex::new(ChannelState::Untried),
        }
    }

    async fn channel(&self) -> Option<Arc<WorkerChannel>> {
        let mut state = self.state.lock().await;
        match &*state {
            ChannelState::Up(ch) => Some(ch.clone()),
            ChannelState::Down => None,
            ChannelState::Untried => match WorkerChannel::connect(self.root.clone()).await {
                Ok(ch) => {
                    let ch = Arc::new(ch);
                    *state = ChannelState::Up(ch.clone());
                    Some(ch)
                }
                Err(e) => {
                    log::warn!("storage worker unavailable, using fallback backend: {e}");
                    *state = ChannelState::Down;
                    None
                }
            },
        }
    }

    /// Allow one reconnect attempt after a transport failure.
    async fn mark_lost(&self) {
        let mut state = self.state.lock().await;
        if matches!(&*state, ChannelState::Up(_)) {
            *state = ChannelState::Untried;
        }
    }

    async fn with_channel<T, F, Fut>(&self, op: F, fallback: Fut) -> StorageResult<T>
    where
        F: Fn(Arc<WorkerChannel>) -> BoxFuture<'static, StorageResult<T>>,
        Fut: std::future::Future<Output = StorageResult<T>>,
    {
        for _ in 0..2 {
            let Some(ch) = self.channel().await else { break };
            match op(ch).await {
                Err(StorageError::Unavailable(e)) => {
                    log::warn!("storage worker lost, reinitializing: {e}");
                    self.mark_lost().await;
                }
                result => return result,
            }
        }
        fallback.await
    }
}

impl Backend for WorkerBackend {
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Option<Vec<u8>>>> {
        let key = key.to_string();
        Box::pin(async move {
            let k = key.clone();
            self.with_channel(
                move |ch| {
                    let key = k.clone();
                    Box::pin(async move { ch.load(&key).await })
                },
                self.fallback.get(&key),
            )
            .await
        })
    }

    fn set(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            ensure_payload(&key, &data)?;
            // The payload may be consumed by a first attempt that dies in
            // transit, so each attempt gets its own copy up front.
            let k = key.clone();
            let payload = data.clone();
            self.with_channel(
                move |ch| {
                    let key = k.clone();
                    let data = payload.clone();
                    Box::pin(async move { ch.save(&key, data).await })
                },
                self.fallback.set(&key, data),
            )
            .await
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let k = key.clone();
            self.with_channel(
                move |ch| {
                    let key = k.clone();
                    Box::pin(async move { ch.delete(&key).await })
                },
                self.fallback.delete(&key),
            )
            .await
        })
    }

    fn list(&self, dir: &str) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let dir = dir.to_string();
        Box::pin(async move {
            let d = dir.clone();
            self.with_channel(
                move |ch| {
                    let dir = d.clone();
                    Box::pin(async move { ch.list(&dir).await })
                },
                self.fallback.list(&dir),
            )
            .await
        })
    }

    fn keys(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        // The private store's key space is flat: top-level sentinel keys plus
        // the database/ and assets/ directories. The worker protocol lists one
        // directory at a time, so stitch the three listings together.
        Box::pin(async move {
            let mut keys = self.list("").await?;
            for dir in [DATABASE_DIR, ASSET_DIR] {
                for name in self.list(dir).await? {
                    keys.push(format!("{dir}/{name}"));
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}
