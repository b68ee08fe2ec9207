//! Attachment object storage.
//!
//! Attachments are uploaded out of band and referenced by URL. The relay
//! only ever needs two operations: fetching bytes so PDFs can be inlined
//! for the upstream model, and deleting objects when their chat goes away.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

/// Refuse to inline attachments larger than this.
const MAX_FETCH_BYTES: usize = 16 * 1024 * 1024;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the raw bytes behind an attachment URL.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    /// Delete the object behind an attachment URL.
    ///
    /// Deleting an already-missing object succeeds.
    async fn delete(&self, url: &str) -> Result<()>;
}

pub type SharedObjects = Arc<dyn ObjectStore>;

/// Object store client for attachments hosted over HTTP.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    http: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(connect_timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .build()
            .context("failed to build object store HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch attachment: {url}"))?;
        if !response.status().is_success() {
            anyhow::bail!("attachment fetch failed ({}): {url}", response.status());
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read attachment body: {url}"))?;
        if bytes.len() > MAX_FETCH_BYTES {
            anyhow::bail!(
                "attachment too large: {} bytes (max {MAX_FETCH_BYTES})",
                bytes.len()
            );
        }

        debug!(url, size = bytes.len(), "fetched attachment");
        Ok(bytes.to_vec())
    }

    async fn delete(&self, url: &str) -> Result<()> {
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .with_context(|| format!("failed to delete attachment: {url}"))?;
        let status = response.status();
        // 404 means someone beat us to it.
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("attachment delete failed ({status}): {url}");
        }

        debug!(url, "deleted attachment");
        Ok(())
    }
}

/// In-memory object store for tests and development.
#[derive(Debug, Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    deleted: Arc<RwLock<HashSet<String>>>,
}

impl MemoryObjectStore {
    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.objects.write().insert(url.into(), bytes);
    }

    /// URLs removed via [`ObjectStore::delete`], in no particular order.
    pub fn deleted_urls(&self) -> Vec<String> {
        self.deleted.read().iter().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("object not found: {url}"))
    }

    async fn delete(&self, url: &str) -> Result<()> {
        self.objects.write().remove(url);
        self.deleted.write().insert(url.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryObjectStore::default();
        store.insert("https://files.example/a.pdf", vec![1, 2, 3]);

        let bytes = store.fetch("https://files.example/a.pdf").await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        store.delete("https://files.example/a.pdf").await.unwrap();
        assert!(store.fetch("https://files.example/a.pdf").await.is_err());
        assert_eq!(
            store.deleted_urls(),
            vec!["https://files.example/a.pdf".to_string()]
        );
    }

    #[tokio::test]
    async fn deleting_missing_object_succeeds() {
        let store = MemoryObjectStore::default();
        store.delete("https://files.example/gone.png").await.unwrap();
    }
}
