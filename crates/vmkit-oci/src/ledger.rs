//! Refcounted ledger over the shared, content-addressed blob cache (spec
//! §4.B layer dedup). The cache directory itself is the dedup mechanism —
//! a blob's filename is its digest, so two repos that share a base layer
//! write the same path — the ledger exists so a later image delete can
//! tell whether a blob is still referenced by anything else before
//! removing it from disk.

use std::collections::BTreeMap;
use std::path::PathBuf;

use vmkit_core::error::Result;
use vmkit_core::image::{LayerLedger, LayerRecord};
use vmkit_core::paths::{atomic_write, Paths};

const LEDGER_FILE: &str = "layers.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Layer,
    Config,
}

impl BlobKind {
    fn extension(self) -> &'static str {
        match self {
            BlobKind::Layer => "tar",
            BlobKind::Config => "json",
        }
    }
}

/// Content-addressed cache paths plus the persisted refcount ledger.
pub struct CacheLedger {
    cache_dir: PathBuf,
    entries: BTreeMap<String, LayerRecord>,
}

impl CacheLedger {
    pub async fn load(paths: &Paths) -> Result<Self> {
        let cache_dir = paths.oci_cache_dir();
        let ledger_path = cache_dir.join(LEDGER_FILE);
        let entries: LayerLedger = match tokio::fs::read(&ledger_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { cache_dir, entries })
    }

    async fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        atomic_write(&self.cache_dir.join(LEDGER_FILE), &bytes).await
    }

    fn sanitize(digest: &str) -> String {
        digest.replace(':', "-")
    }

    pub fn blob_path(&self, kind: BlobKind, digest: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", Self::sanitize(digest), kind.extension()))
    }

    pub fn staging_path(&self, kind: BlobKind, digest: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.{}.tmp", Self::sanitize(digest), kind.extension()))
    }

    pub fn has_blob(&self, kind: BlobKind, digest: &str) -> bool {
        self.blob_path(kind, digest).exists()
    }

    /// Record one more reference to `digest`, creating the entry on first
    /// sight. Called once per layer per successful pull, even on a cache
    /// hit, so the refcount reflects how many images reference the blob.
    pub async fn record_reference(&mut self, digest: &str, size_bytes: u64) -> Result<()> {
        self.entries
            .entry(digest.to_string())
            .and_modify(|r| r.refcount += 1)
            .or_insert_with(|| LayerRecord { digest: digest.to_string(), size_bytes, refcount: 1 });
        self.persist().await
    }

    /// Drop one reference; returns `true` once the refcount reaches zero,
    /// meaning the caller may delete the blob from disk.
    pub async fn release(&mut self, digest: &str) -> Result<bool> {
        let drained = match self.entries.get_mut(digest) {
            Some(record) => {
                record.refcount = record.refcount.saturating_sub(1);
                record.refcount == 0
            }
            None => return Ok(true),
        };
        if drained {
            self.entries.remove(digest);
        }
        self.persist().await?;
        Ok(drained)
    }
}
