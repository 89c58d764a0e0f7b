//! Per-instance disk artifacts: the writable overlay and the read-only
//! config disk injected at boot (spec §4.F.3 steps 7-8).

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use vmkit_core::error::Result;
use vmkit_core::instance::VolumeAttachment;
use vmkit_core::paths::atomic_write;

/// Create a sparse, writable overlay file sized to `size_bytes`. Sparse
/// allocation means the hypervisor only consumes disk as the guest writes,
/// not at creation time.
pub async fn create_overlay_file(path: &Path, size_bytes: u64) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let file = tokio::fs::File::create(path).await?;
    file.set_len(size_bytes).await?;
    Ok(())
}

/// Contents of the read-only config disk: injected at boot, zero
/// modification to the image (spec §4.F.3 step 8).
#[derive(Debug, Clone, Serialize)]
pub struct ConfigDiskPayload {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// `BTreeMap` so key order in the serialized JSON is deterministic.
    pub env: BTreeMap<String, String>,
    pub workdir: String,
    pub volumes: Vec<VolumeAttachment>,
}

pub async fn write_config_disk(path: &Path, payload: &ConfigDiskPayload) -> Result<()> {
    let json = serde_json::to_vec_pretty(payload)?;
    atomic_write(path, &json).await
}

pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
