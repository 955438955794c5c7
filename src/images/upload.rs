use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::storage::{ObjectStore, UploadedPart};

/// Progress of one upload session as seen by the form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadSnapshot {
    /// Percentage in `0.0..=100.0`. Reaches 100 only once the URL is known.
    pub progress: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub uploading: bool,
    pub url: Option<String>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl UploadSnapshot {
    fn started(total_bytes: u64) -> Self {
        Self {
            progress: 0.0,
            bytes_transferred: 0,
            total_bytes,
            uploading: true,
            url: None,
            error: None,
            cancelled: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.url.is_some()
    }
}

type ProgressFn = Box<dyn Fn(&UploadSnapshot) + Send + Sync>;

/// A chunked upload that can be resumed after a failed part.
pub struct ResumableUpload {
    objects: Arc<dyn ObjectStore>,
    key: String,
    content_type: String,
    /// Released once the upload is committed or cancelled.
    body: Option<Bytes>,
    chunk_size: usize,
    upload_id: Option<String>,
    parts: Vec<UploadedPart>,
    bytes_done: u64,
    progress: watch::Sender<UploadSnapshot>,
    on_progress: Option<ProgressFn>,
}

impl ResumableUpload {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        key: String,
        content_type: String,
        body: Bytes,
        chunk_size: usize,
    ) -> Self {
        let (progress, _rx) = watch::channel(UploadSnapshot::started(body.len() as u64));
        Self {
            objects,
            key,
            content_type,
            body: Some(body),
            chunk_size: chunk_size.max(1),
            upload_id: None,
            parts: Vec::new(),
            bytes_done: 0,
            progress,
            on_progress: None,
        }
    }

    /// Call `f` with every snapshot this session publishes.
    pub fn on_progress(mut self, f: impl Fn(&UploadSnapshot) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadSnapshot> {
        self.progress.subscribe()
    }

    /// Completed or cancelled; running again would be a no-op.
    fn is_settled(&self) -> bool {
        let s = self.progress.borrow();
        s.is_complete() || s.cancelled
    }

    /// Upload the remaining parts, commit, and resolve the download URL.
    ///
    /// On error the committed parts are kept, so calling `run` again resumes
    /// with the next part. A cancelled run aborts the multipart upload.
    #[instrument(skip(self, cancel), fields(key = %self.key))]
    pub async fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<String> {
        self.publish(|s| {
            s.uploading = true;
            s.error = None;
        });

        match self.drive(cancel).await {
            Ok(Some(url)) => {
                self.body = None;
                let transferred = self.bytes_done;
                self.publish(|s| {
                    s.bytes_transferred = transferred;
                    s.progress = 100.0;
                    s.uploading = false;
                    s.url = Some(url.clone());
                });
                info!(url = %url, "image uploaded");
                Ok(url)
            }
            Ok(None) => {
                self.abort().await;
                self.body = None;
                self.publish(|s| {
                    s.uploading = false;
                    s.cancelled = true;
                });
                warn!("image upload cancelled");
                anyhow::bail!("upload of {} cancelled", self.key)
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.publish(|s| {
                    s.uploading = false;
                    s.error = Some(message);
                });
                error!(error = %e, "image upload failed");
                Err(e)
            }
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> anyhow::Result<Option<String>> {
        let body = self
            .body
            .clone()
            .with_context(|| format!("upload {} has already settled", self.key))?;
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .objects
                    .begin_upload(&self.key, &self.content_type)
                    .await
                    .with_context(|| format!("begin upload {}", self.key))?;
                self.upload_id = Some(id.clone());
                id
            }
        };

        let total = body.len();
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let start = self.parts.len() * self.chunk_size;
            if start >= total && !(total == 0 && self.parts.is_empty()) {
                break;
            }
            let end = (start + self.chunk_size).min(total);
            let part_number = self.parts.len() as i32 + 1;
            let chunk = body.slice(start..end);

            let part = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                part = self.objects.upload_part(&self.key, &upload_id, part_number, chunk) => part,
            }
            .with_context(|| format!("upload part {part_number} of {}", self.key))?;

            self.parts.push(part);
            self.bytes_done = end as u64;
            debug!(part_number, bytes = self.bytes_done, total, "part uploaded");

            // The last part's progress is only published once the upload is committed.
            if end < total {
                let done = self.bytes_done;
                self.publish(|s| {
                    s.bytes_transferred = done;
                    s.progress = percent(done, total as u64);
                });
            } else {
                break;
            }
        }

        if cancel.is_cancelled() {
            return Ok(None);
        }
        self.objects
            .complete_upload(&self.key, &upload_id, &self.parts)
            .await
            .with_context(|| format!("complete upload {}", self.key))?;
        let url = self
            .objects
            .download_url(&self.key)
            .await
            .with_context(|| format!("download url for {}", self.key))?;
        Ok(Some(url))
    }

    async fn abort(&mut self) {
        if let Some(upload_id) = self.upload_id.take() {
            if let Err(e) = self.objects.abort_upload(&self.key, &upload_id).await {
                warn!(error = %e, key = %self.key, "abort upload failed");
            }
        }
        self.parts.clear();
        self.bytes_done = 0;
    }

    fn publish(&self, update: impl FnOnce(&mut UploadSnapshot)) {
        self.progress.send_modify(update);
        if let Some(f) = &self.on_progress {
            f(&self.progress.borrow());
        }
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64) * 100.0
}

/// How long a session that is no longer uploading stays reachable.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

struct UploadEntry {
    session: Arc<Mutex<ResumableUpload>>,
    progress: watch::Receiver<UploadSnapshot>,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Upload sessions started from the dish form, keyed by upload id.
#[derive(Clone)]
pub struct UploadRegistry {
    entries: Arc<RwLock<HashMap<Uuid, UploadEntry>>>,
    objects: Arc<dyn ObjectStore>,
    chunk_size: usize,
    ttl: Duration,
    shutdown: CancellationToken,
}

impl UploadRegistry {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        chunk_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            objects,
            chunk_size,
            ttl: SESSION_TTL,
            shutdown,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sweep idle sessions every `every` until shutdown.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    biased;
                    _ = registry.shutdown.cancelled() => return,
                    _ = tick.tick() => {
                        registry.sweep().await;
                    }
                }
            }
        })
    }

    /// Forget sessions that stopped uploading and are older than the TTL.
    /// Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|id, entry| {
            let idle = !entry.progress.borrow().uploading;
            let expired = entry.started_at.elapsed() >= self.ttl;
            if idle && expired {
                entry.cancel.cancel();
                debug!(upload_id = %id, "upload session expired");
                false
            } else {
                true
            }
        });
        let dropped = before - entries.len();
        if dropped > 0 {
            info!(dropped, live = entries.len(), "upload sessions swept");
        }
        dropped
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Register a new session and start uploading it in the background.
    pub async fn start(&self, file_name: &str, content_type: &str, body: Bytes) -> Uuid {
        self.sweep().await;
        let id = Uuid::new_v4();
        let key = object_key(file_name, content_type);
        let session = ResumableUpload::new(
            self.objects.clone(),
            key.clone(),
            content_type.to_string(),
            body,
            self.chunk_size,
        )
        .on_progress(move |s| debug!(upload_id = %id, progress = s.progress, "upload progress"));
        let progress = session.subscribe();
        let entry = UploadEntry {
            session: Arc::new(Mutex::new(session)),
            progress,
            cancel: self.shutdown.child_token(),
            started_at: Instant::now(),
        };
        let (session, cancel) = (entry.session.clone(), entry.cancel.clone());
        self.entries.write().await.insert(id, entry);

        info!(upload_id = %id, key = %key, "image upload started");
        spawn_run(session, cancel);
        id
    }

    pub async fn snapshot(&self, id: Uuid) -> Option<UploadSnapshot> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|e| e.progress.borrow().clone())
    }

    pub async fn subscribe(&self, id: Uuid) -> Option<watch::Receiver<UploadSnapshot>> {
        self.entries.read().await.get(&id).map(|e| e.progress.clone())
    }

    /// Resume a failed session. Returns `false` for unknown ids; sessions that
    /// are running, finished or cancelled are left as they are.
    pub async fn resume(&self, id: Uuid) -> bool {
        let guard = self.entries.read().await;
        let Some(entry) = guard.get(&id) else {
            return false;
        };
        let snap = entry.progress.borrow().clone();
        if snap.error.is_some() && !snap.uploading && !snap.cancelled {
            info!(upload_id = %id, "image upload resumed");
            spawn_run(entry.session.clone(), entry.cancel.clone());
        }
        true
    }

    /// Cancel a session and forget it. Results that arrive later are ignored.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.entries.write().await.remove(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(upload_id = %id, "image upload cancelled");
                true
            }
            None => false,
        }
    }
}

fn spawn_run(session: Arc<Mutex<ResumableUpload>>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut upload = session.lock().await;
        if upload.is_settled() {
            return;
        }
        // Failures are recorded in the snapshot and logged by `run`.
        let _ = upload.run(&cancel).await;
    });
}

lazy_static! {
    static ref UNSAFE_KEY_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._-]").expect("static regex");
}

/// Object key for an uploaded dish image.
pub fn object_key(file_name: &str, content_type: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned = UNSAFE_KEY_CHARS.replace_all(base, "_");
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        let ext = ext_from_mime(content_type).unwrap_or("bin");
        format!("dishes/{}.{}", Uuid::new_v4(), ext)
    } else {
        format!("dishes/{cleaned}")
    }
}

pub fn is_image(content_type: &str) -> bool {
    content_type.starts_with("image/")
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/heic" => Some("heic"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}
