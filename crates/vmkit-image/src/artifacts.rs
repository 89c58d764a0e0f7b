//! System artifact manager (spec §4.D): the kernel and init-ramdisk every
//! instance boots with. Both are pinned by a single version string derived
//! from a SHA-256 over `(version, base image digest, embedded init
//! script)`, so changing either the base image or the init script forces a
//! new version rather than silently mutating what's on disk under an old
//! name.

use std::os::unix::fs::PermissionsExt;

use sha2::{Digest, Sha256};
use tokio::process::Command;

use vmkit_core::config::arch_to_uname;
use vmkit_core::error::{Error, Result};
use vmkit_core::paths::{atomic_write, Paths};

const SUBSYSTEM: &str = "system_artifacts";

/// Bump whenever `BASE_IMAGE_DIGEST` or `INIT_SCRIPT` changes.
const VERSION: &str = "v1";
const BASE_IMAGE_DIGEST: &str = "sha256:f745fb83a37ede39353024ebd39e97e54488cd5b0320be1113551ccc37e393a7";
const PINNED_DIGEST: &str = "56f2a1d02d9a73640229ff063a8c67c053632a9f11a13c7cc38979e97855ae8e";

const INIT_SCRIPT: &str = "#!/bin/sh
set -e
mount -t proc proc /proc
mount -t sysfs sysfs /sys
mount -t devtmpfs devtmpfs /dev
mkdir -p /mnt/lower /mnt/overlay/upper /mnt/overlay/work /mnt/root
mount -t squashfs -o ro /dev/vda /mnt/lower
mount -t overlay overlay -o lowerdir=/mnt/lower,upperdir=/mnt/overlay/upper,workdir=/mnt/overlay/work /mnt/root
exec switch_root /mnt/root /sbin/init
";

fn pin_digest() -> String {
    let mut hasher = Sha256::new();
    hasher.update(VERSION.as_bytes());
    hasher.update(b":");
    hasher.update(BASE_IMAGE_DIGEST.as_bytes());
    hasher.update(b":");
    hasher.update(INIT_SCRIPT.as_bytes());
    hex::encode(hasher.finalize())
}

/// Kernel and init-ramdisk materialization for one host architecture.
pub struct SystemArtifacts {
    paths: Paths,
    arch: String,
}

impl SystemArtifacts {
    pub fn new(paths: Paths, arch: String) -> Self {
        Self { paths, arch }
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn kernel_path(&self) -> std::path::PathBuf {
        self.paths.kernel_path(VERSION, &self.arch)
    }

    pub fn initrd_path(&self) -> std::path::PathBuf {
        self.paths.initrd_path(VERSION, &self.arch)
    }

    /// Materialize the init-ramdisk if it isn't already on disk for this
    /// version/arch. The kernel binary itself is expected to already be
    /// staged under the data root; fetching one over the network is out of
    /// scope, so a missing kernel is reported rather than silently
    /// substituted.
    pub async fn ensure_system_files(&self) -> Result<()> {
        if !self.kernel_path().exists() {
            return Err(Error::dependency_unavailable(
                SUBSYSTEM,
                format!(
                    "no kernel staged at {} for {}; place a vmlinux there before starting",
                    self.kernel_path().display(),
                    arch_to_uname(&self.arch)
                ),
            ));
        }
        if !self.initrd_path().exists() {
            let initrd = build_initrd().await?;
            atomic_write(&self.initrd_path(), &initrd).await?;
        }
        Ok(())
    }
}

/// Build a gzip-compressed `newc` cpio archive containing just `/init`, by
/// staging it on disk and shelling out to `cpio`/`gzip` — the same
/// shell-out-to-a-well-known-tool pattern used for squashfs conversion,
/// rather than hand-rolling the cpio format.
async fn build_initrd() -> Result<Vec<u8>> {
    let staging = tempfile::tempdir().map_err(Error::from)?;
    let init_path = staging.path().join("init");
    tokio::fs::write(&init_path, INIT_SCRIPT).await?;
    let mut perms = tokio::fs::metadata(&init_path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(&init_path, perms).await?;

    let output = Command::new("sh")
        .arg("-c")
        .arg("find . | cpio -o -H newc 2>/dev/null | gzip -9")
        .current_dir(staging.path())
        .output()
        .await
        .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, format!("failed to spawn cpio/gzip: {e}")))?;
    if !output.status.success() {
        return Err(Error::internal(
            SUBSYSTEM,
            format!("failed to build init-ramdisk: {}", String::from_utf8_lossy(&output.stderr)),
        ));
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_digest_matches_the_recorded_constant() {
        assert_eq!(pin_digest(), PINNED_DIGEST);
    }

    #[tokio::test]
    async fn ensure_system_files_reports_missing_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = SystemArtifacts::new(Paths::new(dir.path()), "amd64".into());
        let err = artifacts.ensure_system_files().await.unwrap_err();
        assert_eq!(err.code(), "dependency_unavailable");
    }

    #[tokio::test]
    async fn kernel_and_initrd_paths_are_distinct_and_versioned() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = SystemArtifacts::new(Paths::new(dir.path()), "arm64".into());
        assert_ne!(artifacts.kernel_path(), artifacts.initrd_path());
        assert!(artifacts.kernel_path().to_string_lossy().contains("arm64"));
    }
}
