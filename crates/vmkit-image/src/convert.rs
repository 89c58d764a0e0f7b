//! Rootfs-to-image conversion (spec §4.C "Converting" phase): turn a merged
//! OCI rootfs directory into a single compressed, read-only filesystem file
//! an instance can boot directly off of, via `mksquashfs`.

use std::path::Path;

use tokio::process::Command;

use vmkit_core::error::{Error, Result};

const SUBSYSTEM: &str = "image_convert";

async fn run(program: &str, args: &[&std::ffi::OsStr]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, format!("failed to spawn {program}: {e}")))?;
    if !output.status.success() {
        return Err(Error::internal(
            SUBSYSTEM,
            format!("{program} failed: {}", String::from_utf8_lossy(&output.stderr)),
        ));
    }
    Ok(())
}

/// Convert `rootfs_dir` into `output_path`, a zstd-compressed squashfs
/// image, and return its size in bytes. Any stale file at `output_path` is
/// replaced rather than appended to.
pub async fn convert_rootfs_to_image(rootfs_dir: &Path, output_path: &Path) -> Result<u64> {
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let _ = tokio::fs::remove_file(output_path).await;

    run(
        "mksquashfs",
        &[
            rootfs_dir.as_os_str(),
            output_path.as_os_str(),
            std::ffi::OsStr::new("-comp"),
            std::ffi::OsStr::new("zstd"),
            std::ffi::OsStr::new("-noappend"),
            std::ffi::OsStr::new("-no-progress"),
        ],
    )
    .await?;

    let metadata = tokio::fs::metadata(output_path).await?;
    Ok(metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_mksquashfs_reports_dependency_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = run("mksquashfs-definitely-not-on-path", &[]).await.unwrap_err();
        assert_eq!(err.code(), "dependency_unavailable");
        let _ = dir;
    }
}
