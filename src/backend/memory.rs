//! In-process document and object stores.
//!
//! Used for `BACKEND=memory` local runs and by the test suite. Both stores can
//! be told to fail upcoming calls so error paths are reachable without a
//! network.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::documents::{new_document_id, Document, DocumentStore, Fields};
use crate::storage::{public_object_url, ObjectStore, UploadedPart};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    fail_creates: AtomicBool,
    fail_lists: AtomicBool,
    failing_updates: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn fail_creates(&self, yes: bool) {
        self.fail_creates.store(yes, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn fail_lists(&self, yes: bool) {
        self.fail_lists.store(yes, Ordering::SeqCst);
    }

    /// The next `n` field updates fail.
    #[cfg(test)]
    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    fn take_update_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create_document(&self, collection: &str, fields: Fields) -> anyhow::Result<String> {
        anyhow::ensure!(
            !self.fail_creates.load(Ordering::SeqCst),
            "memory store: create in {collection} refused"
        );
        let id = new_document_id();
        let mut guard = lock(&self.collections);
        guard.entry(collection.to_string()).or_default().push(Document {
            id: id.clone(),
            fields,
        });
        Ok(id)
    }

    async fn list_documents(&self, collection: &str) -> anyhow::Result<Vec<Document>> {
        anyhow::ensure!(
            !self.fail_lists.load(Ordering::SeqCst),
            "memory store: list of {collection} refused"
        );
        let guard = lock(&self.collections);
        Ok(guard.get(collection).cloned().unwrap_or_default())
    }

    async fn get_document(&self, collection: &str, id: &str) -> anyhow::Result<Option<Document>> {
        let guard = lock(&self.collections);
        Ok(guard
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id))
            .cloned())
    }

    async fn update_document_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.take_update_failure(),
            "memory store: update of {collection}/{id} refused"
        );
        let mut guard = lock(&self.collections);
        let doc = guard
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
            .ok_or_else(|| anyhow::anyhow!("document {collection}/{id} not found"))?;
        doc.fields.insert(field.to_string(), value);
        Ok(())
    }
}

struct PendingUpload {
    key: String,
    content_type: String,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: String,
    pub body: Bytes,
}

pub struct MemoryObjectStore {
    base_url: String,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    objects: Mutex<HashMap<String, StoredObject>>,
    failing_parts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            uploads: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            failing_parts: AtomicUsize::new(0),
        }
    }

    /// The next `n` part uploads fail.
    #[cfg(test)]
    pub fn fail_next_parts(&self, n: usize) {
        self.failing_parts.store(n, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        lock(&self.objects).get(key).cloned()
    }

    #[cfg(test)]
    pub fn pending_uploads(&self) -> usize {
        lock(&self.uploads).len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn begin_upload(&self, key: &str, content_type: &str) -> anyhow::Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        lock(&self.uploads).insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                content_type: content_type.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> anyhow::Result<UploadedPart> {
        let failing = self
            .failing_parts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        anyhow::ensure!(!failing, "memory store: part {part_number} of {key} refused");

        let mut guard = lock(&self.uploads);
        let pending = guard
            .get_mut(upload_id)
            .filter(|p| p.key == key)
            .ok_or_else(|| anyhow::anyhow!("unknown upload {upload_id} for {key}"))?;
        pending.parts.insert(part_number, body);
        Ok(UploadedPart {
            part_number,
            etag: format!("{upload_id}-{part_number}"),
        })
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> anyhow::Result<()> {
        let pending = lock(&self.uploads)
            .remove(upload_id)
            .filter(|p| p.key == key)
            .ok_or_else(|| anyhow::anyhow!("unknown upload {upload_id} for {key}"))?;

        let mut body = BytesMut::new();
        for part in parts {
            let chunk = pending
                .parts
                .get(&part.part_number)
                .ok_or_else(|| anyhow::anyhow!("part {} was never uploaded", part.part_number))?;
            body.extend_from_slice(chunk);
        }

        let object = StoredObject {
            content_type: pending.content_type,
            body: body.freeze(),
        };
        debug!(
            key,
            content_type = %object.content_type,
            bytes = object.body.len(),
            "object stored"
        );
        lock(&self.objects).insert(key.to_string(), object);
        Ok(())
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> anyhow::Result<()> {
        lock(&self.uploads).remove(upload_id);
        Ok(())
    }

    async fn download_url(&self, key: &str) -> anyhow::Result<String> {
        let exists = lock(&self.objects).contains_key(key);
        anyhow::ensure!(exists, "object {key} not found");
        Ok(public_object_url(&self.base_url, key))
    }
}
