//! The static parameters a VM was created with, persisted alongside an
//! instance's metadata so standby/restore can resubmit an identical VM
//! configuration without the caller repeating itself (spec §4.F.7).

use std::path::Path;

use serde::{Deserialize, Serialize};

use vmkit_core::error::Result;
use vmkit_core::paths::atomic_write;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub kernel_path: String,
    pub initrd_path: String,
    pub image_rootfs_path: String,
    pub cmdline: String,
}

pub async fn write(path: &Path, spec: &LaunchSpec) -> Result<()> {
    atomic_write(path, &serde_json::to_vec_pretty(spec)?).await
}

pub async fn read(path: &Path) -> Result<LaunchSpec> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
