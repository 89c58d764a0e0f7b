//! Deterministic filesystem layout for all durable state (spec §3, §4.A).
//!
//! `Paths` is a pure function from a data-root to named accessors; it never
//! touches the filesystem itself. Deleting an entity's directory is always a
//! complete cleanup because nothing outside that directory stores state for
//! the entity.

use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self { root: data_root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ---- images ------------------------------------------------------

    pub fn image_repo_dir(&self, repo: &str) -> PathBuf {
        self.root.join("images").join(sanitize_repo(repo))
    }

    pub fn image_digest_dir(&self, repo: &str, digest_hex: &str) -> PathBuf {
        self.image_repo_dir(repo).join("digest").join(digest_hex)
    }

    pub fn image_rootfs_file(&self, repo: &str, digest_hex: &str) -> PathBuf {
        self.image_digest_dir(repo, digest_hex).join("rootfs.img")
    }

    pub fn image_metadata_file(&self, repo: &str, digest_hex: &str) -> PathBuf {
        self.image_digest_dir(repo, digest_hex).join("metadata")
    }

    pub fn image_tag_link(&self, repo: &str, tag: &str) -> PathBuf {
        self.image_repo_dir(repo).join("tag").join(tag)
    }

    pub fn oci_cache_dir(&self) -> PathBuf {
        self.root.join("system").join("oci-cache")
    }

    // ---- system artifacts ---------------------------------------------

    pub fn system_artifacts_dir(&self) -> PathBuf {
        self.root.join("system").join("artifacts")
    }

    pub fn kernel_path(&self, version: &str, arch: &str) -> PathBuf {
        self.system_artifacts_dir().join(format!("vmlinux-{version}-{arch}"))
    }

    pub fn initrd_path(&self, version: &str, arch: &str) -> PathBuf {
        self.system_artifacts_dir().join(format!("initrd-{version}-{arch}"))
    }

    // ---- guests (instances) --------------------------------------------

    pub fn guest_dir(&self, instance_id: &str) -> PathBuf {
        self.root.join("guests").join(instance_id)
    }

    pub fn guest_metadata_file(&self, instance_id: &str) -> PathBuf {
        self.guest_dir(instance_id).join("metadata")
    }

    pub fn guest_overlay_file(&self, instance_id: &str) -> PathBuf {
        self.guest_dir(instance_id).join("overlay.raw")
    }

    pub fn guest_config_disk_file(&self, instance_id: &str) -> PathBuf {
        self.guest_dir(instance_id).join("config.img")
    }

    /// UDS backing the guest vsock device (host-guest exec channel, spec
    /// §3 Instance "socket path", §4.G).
    pub fn guest_socket_path(&self, instance_id: &str) -> PathBuf {
        self.guest_dir(instance_id).join("sock")
    }

    /// UDS the hypervisor's local HTTP control API listens on, distinct from
    /// the guest vsock socket above.
    pub fn guest_api_socket_path(&self, instance_id: &str) -> PathBuf {
        self.guest_dir(instance_id).join("api.sock")
    }

    pub fn guest_launch_spec_file(&self, instance_id: &str) -> PathBuf {
        self.guest_dir(instance_id).join("launch-spec.json")
    }

    pub fn guest_stdout_log(&self, instance_id: &str) -> PathBuf {
        self.guest_dir(instance_id).join("stdout.log")
    }

    pub fn guest_console_log(&self, instance_id: &str) -> PathBuf {
        self.guest_dir(instance_id).join("logs").join("console.log")
    }

    pub fn guest_console_log_rotated(&self, instance_id: &str, index: u32) -> PathBuf {
        self.guest_dir(instance_id).join("logs").join(format!("console.log.{index}"))
    }

    pub fn guest_snapshot_dir(&self, instance_id: &str) -> PathBuf {
        self.guest_dir(instance_id).join("snapshots").join("latest")
    }

    pub fn guest_snapshot_vm_config(&self, instance_id: &str) -> PathBuf {
        self.guest_snapshot_dir(instance_id).join("vm-config")
    }

    pub fn guest_snapshot_memory_raw(&self, instance_id: &str) -> PathBuf {
        self.guest_snapshot_dir(instance_id).join("memory-ranges")
    }

    pub fn guest_snapshot_memory_lz4(&self, instance_id: &str) -> PathBuf {
        self.guest_snapshot_dir(instance_id).join("memory-ranges.lz4")
    }

    // ---- builds ---------------------------------------------------------

    pub fn build_dir(&self, build_id: &str) -> PathBuf {
        self.root.join("builds").join(build_id)
    }

    pub fn build_metadata_file(&self, build_id: &str) -> PathBuf {
        self.build_dir(build_id).join("metadata")
    }

    pub fn build_config_file(&self, build_id: &str) -> PathBuf {
        self.build_dir(build_id).join("config")
    }

    pub fn build_source_tarball(&self, build_id: &str) -> PathBuf {
        self.build_dir(build_id).join("source").join("source.tar.gz")
    }

    pub fn build_log_file(&self, build_id: &str) -> PathBuf {
        self.build_dir(build_id).join("logs").join("build.log")
    }

    // ---- network ----------------------------------------------------------

    pub fn network_dir(&self) -> PathBuf {
        self.root.join("network")
    }

    pub fn network_dns_conf(&self) -> PathBuf {
        self.network_dir().join("dns.conf")
    }

    pub fn network_dns_hosts(&self) -> PathBuf {
        self.network_dir().join("dns.hosts")
    }

    pub fn network_dns_pid(&self) -> PathBuf {
        self.network_dir().join("dns.pid")
    }

    pub fn network_definition_file(&self, name: &str) -> PathBuf {
        self.network_dir().join("definitions").join(format!("{name}.json"))
    }

    pub fn network_definitions_dir(&self) -> PathBuf {
        self.network_dir().join("definitions")
    }

    // ---- audit --------------------------------------------------------------

    pub fn audit_log_file(&self) -> PathBuf {
        self.root.join("system").join("audit.log")
    }

    // ---- volumes ----------------------------------------------------------

    /// Volume content storage is out of scope (spec §1 non-goals); this is
    /// just the backing file an instance's volume device is pointed at.
    pub fn volume_file(&self, volume_id: &str) -> PathBuf {
        self.root.join("volumes").join(format!("{volume_id}.img"))
    }
}

/// Repos may contain `/`; flatten to a filesystem-safe single segment so a
/// pushed ref like `library/alpine` cannot escape the images directory or
/// collide across a path separator.
fn sanitize_repo(repo: &str) -> String {
    repo.replace('/', "_")
}

/// Write `contents` to `path` durably: write to a sibling temp file in the
/// same directory, fsync it, then rename over the destination. Readers that
/// race a delete see a brief `NotFound` rather than a half-written file.
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        crate::Error::invalid_input("paths", format!("path has no parent: {}", path.display()))
    })?;
    tokio::fs::create_dir_all(dir).await?;

    let tmp_name = format!(
        ".tmp-{}-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("write"),
        uuid::Uuid::new_v4()
    );
    let tmp_path = dir.join(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    use tokio::io::AsyncWriteExt;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Append `line` plus a trailing newline to `path`, creating it (and its
/// parent directory) if necessary. Used for append-only logs like the audit
/// trail, where atomic replace-the-whole-file semantics would be wasteful.
pub async fn atomic_append(path: &Path, line: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line).await?;
    file.write_all(b"\n").await?;
    Ok(())
}
