//! Image pipeline public contract (spec §4.C): `listImages`, `createImage`,
//! `getImage`, `deleteImage`, `subscribeProgress`, `recoverInterruptedBuilds`,
//! plus the system artifact accessors from §4.D.

use std::path::PathBuf;
use std::sync::Arc;

use vmkit_core::error::{Error, Result};
use vmkit_core::image::{ContainerMetadata, Image, ImageStatus};
use vmkit_core::paths::{atomic_write, Paths};
use vmkit_core::progress::ProgressEvent;
use vmkit_oci::OciClient;

use crate::artifacts::SystemArtifacts;
use crate::convert;
use crate::progress::ProgressHub;
use crate::queue::BuildQueue;

const SUBSYSTEM: &str = "image_pipeline";

fn image_key(repo: &str, digest: &str) -> String {
    format!("{repo}@{digest}")
}

fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// What the caller asked for: pull `source_ref`, publish the result under
/// `repo`, optionally pointing `tag` at it once ready.
pub struct CreateImageRequest {
    pub repo: String,
    pub tag: Option<String>,
    pub source_ref: String,
}

pub struct ImagePipeline {
    paths: Paths,
    oci: Arc<OciClient>,
    queue: Arc<BuildQueue>,
    progress: ProgressHub,
    artifacts: SystemArtifacts,
}

impl ImagePipeline {
    pub fn new(paths: Paths, oci: Arc<OciClient>, arch: String, max_concurrent: usize) -> Self {
        let artifacts = SystemArtifacts::new(paths.clone(), arch);
        Self { paths, oci, queue: Arc::new(BuildQueue::new(max_concurrent)), progress: ProgressHub::new(), artifacts }
    }

    pub fn kernel_path(&self) -> PathBuf {
        self.artifacts.kernel_path()
    }

    pub fn initrd_path(&self) -> PathBuf {
        self.artifacts.initrd_path()
    }

    pub async fn ensure_system_files(&self) -> Result<()> {
        self.artifacts.ensure_system_files().await
    }

    /// `createImage` (spec §4.C): resolves `source_ref` to a manifest digest
    /// and, unless that exact `(repo, digest)` pair is already `Ready`,
    /// enqueues a pull-and-convert job. Returns the (possibly still-pending)
    /// image record.
    pub async fn create_image(&self, request: CreateImageRequest) -> Result<Image> {
        let digest = self.oci.inspect_manifest(&request.source_ref).await?;

        if let Ok(existing) = self.load_image(&request.repo, &digest).await {
            if existing.status != ImageStatus::Failed {
                // Ready: already converted, nothing to do. Any other
                // non-terminal status: a job for this exact digest is
                // already queued or running — attach the tag and return
                // rather than scheduling a second, colliding conversion.
                if let Some(tag) = &request.tag {
                    self.write_tag(&request.repo, tag, &digest).await?;
                }
                return self.load_image(&request.repo, &digest).await;
            }
        }

        let arch = self.artifacts.arch().to_string();
        let now = vmkit_core::time::utc_now();
        let image = Image {
            repo: request.repo.clone(),
            digest: digest.clone(),
            tags: Vec::new(),
            arch,
            status: ImageStatus::Pending,
            size_bytes: 0,
            metadata: ContainerMetadata::default(),
            source_ref: request.source_ref.clone(),
            created_at: now,
            failure_reason: None,
        };
        self.persist_image(&image).await?;
        if let Some(tag) = &request.tag {
            self.write_tag(&request.repo, tag, &digest).await?;
        }

        self.enqueue_conversion(request.repo, digest.clone(), request.source_ref, request.tag).await;
        self.load_image(&image.repo, &digest).await
    }

    /// Publishes a rootfs a caller already produced locally (a finished
    /// builder task, not an OCI pull) as a new `Ready` image under `repo`,
    /// converting it with the same `mksquashfs` step `createImage` uses.
    /// There is no queueing here: the caller already ran its own build to
    /// completion, so there's no pull/unpack phase to schedule around.
    pub async fn publish_local_rootfs(
        &self,
        repo: &str,
        tag: Option<&str>,
        digest: &str,
        rootfs_dir: &std::path::Path,
        metadata: ContainerMetadata,
    ) -> Result<Image> {
        let key = image_key(repo, digest);
        self.progress
            .publish(&key, ProgressEvent { status: ImageStatus::Converting, percent: 90, queue_position: None, error: None })
            .await;

        let output = self.paths.image_rootfs_file(repo, digest_hex(digest));
        let size_bytes = convert::convert_rootfs_to_image(rootfs_dir, &output).await?;

        let image = Image {
            repo: repo.to_string(),
            digest: digest.to_string(),
            tags: Vec::new(),
            arch: self.artifacts.arch().to_string(),
            status: ImageStatus::Ready,
            size_bytes,
            metadata,
            source_ref: format!("local-build@{digest}"),
            created_at: vmkit_core::time::utc_now(),
            failure_reason: None,
        };
        self.persist_image(&image).await?;
        if let Some(tag) = tag {
            self.write_tag(repo, tag, digest).await?;
        }
        self.progress.publish(&key, ProgressEvent::ready()).await;
        self.load_image(repo, digest).await
    }

    /// Seeds the hub with a `Pending` snapshot *before* admitting the job,
    /// so a subscriber can never race the job's own first publish — an
    /// immediately-started job (position 0) would otherwise publish
    /// `Pulling` before this function returns.
    async fn enqueue_conversion(&self, repo: String, digest: String, source_ref: String, tag: Option<String>) {
        let key = image_key(&repo, &digest);
        self.progress.publish(&key, ProgressEvent::pending(None)).await;

        let oci = self.oci.clone();
        let paths = self.paths.clone();
        let progress = self.progress.clone();
        let queue = self.queue.clone();
        let job_key = key.clone();
        let job = async move {
            run_conversion(&paths, &oci, &progress, &repo, &digest, &source_ref, tag.as_deref()).await;
            queue.mark_complete(&job_key).await;
        };
        let position = self.queue.enqueue(key.clone(), job).await;
        if position > 0 {
            self.progress.publish(&key, ProgressEvent::pending(Some(position))).await;
        }
    }

    /// `getImage` (spec §4.C): `selector` is either `@<digest>` or a bare
    /// tag (defaulting to `latest`).
    pub async fn get_image(&self, repo: &str, selector: &str) -> Result<Image> {
        let digest = if let Some(digest) = selector.strip_prefix('@') {
            digest.to_string()
        } else {
            self.resolve_tag(repo, selector).await?
        };
        self.load_image(repo, &digest).await
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<String> {
        let link = self.paths.image_tag_link(repo, tag);
        tokio::fs::read_to_string(&link)
            .await
            .map(|s| s.trim().to_string())
            .map_err(|_| Error::not_found(SUBSYSTEM, format!("no tag {tag:?} in repo {repo:?}")))
    }

    async fn write_tag(&self, repo: &str, tag: &str, digest: &str) -> Result<()> {
        atomic_write(&self.paths.image_tag_link(repo, tag), digest.as_bytes()).await
    }

    async fn load_image(&self, repo: &str, digest: &str) -> Result<Image> {
        let path = self.paths.image_metadata_file(repo, digest_hex(digest));
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::not_found(SUBSYSTEM, format!("no image {}", image_key(repo, digest))))?;
        let mut image: Image = serde_json::from_slice(&bytes)?;
        image.tags = self.tags_pointing_at(repo, digest).await;
        Ok(image)
    }

    async fn tags_pointing_at(&self, repo: &str, digest: &str) -> Vec<String> {
        let dir = self.paths.image_repo_dir(repo).join("tag");
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { return Vec::new() };
        let mut tags = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(contents) = tokio::fs::read_to_string(entry.path()).await {
                if contents.trim() == digest {
                    if let Some(name) = entry.file_name().to_str() {
                        tags.push(name.to_string());
                    }
                }
            }
        }
        tags.sort();
        tags
    }

    async fn persist_image(&self, image: &Image) -> Result<()> {
        let path = self.paths.image_metadata_file(&image.repo, digest_hex(&image.digest));
        atomic_write(&path, &serde_json::to_vec_pretty(image)?).await
    }

    /// `listImages` (spec §4.C): every image record under `repo`, or every
    /// repo when `repo` is `None`.
    pub async fn list_images(&self, repo: Option<&str>) -> Result<Vec<Image>> {
        let images_root = self.paths.root().join("images");
        let Ok(mut repo_entries) = tokio::fs::read_dir(&images_root).await else { return Ok(Vec::new()) };

        let mut results = Vec::new();
        while let Ok(Some(repo_entry)) = repo_entries.next_entry().await {
            let Some(repo_dir_name) = repo_entry.file_name().to_str().map(String::from) else { continue };
            if let Some(wanted) = repo {
                if !sanitize_matches(&repo_dir_name, wanted) {
                    continue;
                }
            }
            let digest_dir = repo_entry.path().join("digest");
            let Ok(mut digest_entries) = tokio::fs::read_dir(&digest_dir).await else { continue };
            while let Ok(Some(digest_entry)) = digest_entries.next_entry().await {
                let metadata_path = digest_entry.path().join("metadata");
                if let Ok(bytes) = tokio::fs::read(&metadata_path).await {
                    if let Ok(mut image) = serde_json::from_slice::<Image>(&bytes) {
                        image.tags = self.tags_pointing_at(&image.repo, &image.digest).await;
                        results.push(image);
                    }
                }
            }
        }
        Ok(results)
    }

    /// `deleteImage` (spec §4.C): removes the digest directory and any tags
    /// that pointed at it. Missing image is *NotFound*.
    pub async fn delete_image(&self, repo: &str, digest: &str) -> Result<()> {
        let dir = self.paths.image_digest_dir(repo, digest_hex(digest));
        if tokio::fs::metadata(&dir).await.is_err() {
            return Err(Error::not_found(SUBSYSTEM, format!("no image {}", image_key(repo, digest))));
        }
        for tag in self.tags_pointing_at(repo, digest).await {
            let _ = tokio::fs::remove_file(self.paths.image_tag_link(repo, &tag)).await;
        }
        tokio::fs::remove_dir_all(&dir).await.map_err(Error::from)
    }

    /// `subscribeProgress` (spec §4.C): forwards progress for `(repo,
    /// digest)` into `tx` until a terminal event or the receiver is
    /// dropped.
    pub async fn subscribe_progress(&self, repo: &str, digest: &str, tx: tokio::sync::mpsc::Sender<ProgressEvent>) {
        self.progress.subscribe(&image_key(repo, digest), tx).await
    }

    /// `recoverInterruptedBuilds`: at startup, re-enqueue every image whose
    /// on-disk status is non-terminal. `Ready`/`Failed` are left untouched —
    /// a failed build isn't silently retried, it must be recreated.
    pub async fn recover_interrupted_builds(&self) -> Result<()> {
        for image in self.list_images(None).await? {
            if image.status.is_terminal() {
                continue;
            }
            let tag = self.tags_pointing_at(&image.repo, &image.digest).await.into_iter().next();
            self.enqueue_conversion(image.repo, image.digest, image.source_ref, tag).await;
        }
        Ok(())
    }
}

fn sanitize_matches(dir_name: &str, repo: &str) -> bool {
    dir_name == repo.replace('/', "_")
}

/// The actual pull/unpack/convert sequence a queued job runs. Tears down its
/// staging directory regardless of outcome and always leaves a terminal
/// `Image` record behind.
async fn run_conversion(
    paths: &Paths,
    oci: &OciClient,
    progress: &ProgressHub,
    repo: &str,
    digest: &str,
    source_ref: &str,
    tag: Option<&str>,
) {
    let key = image_key(repo, digest);
    let rootfs_dir = paths.image_digest_dir(repo, digest_hex(digest)).join("rootfs-stage");

    let result = run_conversion_inner(paths, oci, progress, repo, digest, source_ref, &rootfs_dir, &key).await;
    let _ = tokio::fs::remove_dir_all(&rootfs_dir).await;

    if let Err(err) = result {
        tracing::warn!(subsystem = SUBSYSTEM, image = %key, error = %err, "image conversion failed");
        let mut image = load_image_for_update(paths, repo, digest).await;
        image.status = ImageStatus::Failed;
        image.failure_reason = Some(err.to_string());
        let _ = atomic_write(
            &paths.image_metadata_file(repo, digest_hex(digest)),
            &serde_json::to_vec_pretty(&image).unwrap_or_default(),
        )
        .await;
        progress.publish(&key, ProgressEvent::failed(err.to_string())).await;
        return;
    }

    if let Some(tag) = tag {
        let _ = atomic_write(&paths.image_tag_link(repo, tag), digest.as_bytes()).await;
    }
    progress.publish(&key, ProgressEvent::ready()).await;
}

async fn load_image_for_update(paths: &Paths, repo: &str, digest: &str) -> Image {
    let path = paths.image_metadata_file(repo, digest_hex(digest));
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| placeholder_image(repo, digest)),
        Err(_) => placeholder_image(repo, digest),
    }
}

fn placeholder_image(repo: &str, digest: &str) -> Image {
    Image {
        repo: repo.to_string(),
        digest: digest.to_string(),
        tags: Vec::new(),
        arch: "amd64".into(),
        status: ImageStatus::Pending,
        size_bytes: 0,
        metadata: ContainerMetadata::default(),
        source_ref: String::new(),
        created_at: vmkit_core::time::utc_now(),
        failure_reason: None,
    }
}

async fn run_conversion_inner(
    paths: &Paths,
    oci: &OciClient,
    progress: &ProgressHub,
    repo: &str,
    digest: &str,
    source_ref: &str,
    rootfs_dir: &std::path::Path,
    key: &str,
) -> Result<()> {
    progress
        .publish(key, ProgressEvent { status: ImageStatus::Pulling, percent: 10, queue_position: None, error: None })
        .await;
    update_status(paths, repo, digest, ImageStatus::Pulling).await?;

    let metadata = oci.pull_and_unpack(source_ref, digest, rootfs_dir).await?;

    progress
        .publish(key, ProgressEvent { status: ImageStatus::Unpacking, percent: 60, queue_position: None, error: None })
        .await;
    update_status(paths, repo, digest, ImageStatus::Unpacking).await?;

    progress
        .publish(key, ProgressEvent { status: ImageStatus::Converting, percent: 90, queue_position: None, error: None })
        .await;
    update_status(paths, repo, digest, ImageStatus::Converting).await?;

    let output = paths.image_rootfs_file(repo, digest_hex(digest));
    let size_bytes = convert::convert_rootfs_to_image(rootfs_dir, &output).await?;

    let mut image = load_image_for_update(paths, repo, digest).await;
    image.status = ImageStatus::Ready;
    image.size_bytes = size_bytes;
    image.metadata = metadata;
    atomic_write(&paths.image_metadata_file(repo, digest_hex(digest)), &serde_json::to_vec_pretty(&image)?).await?;
    Ok(())
}

async fn update_status(paths: &Paths, repo: &str, digest: &str, status: ImageStatus) -> Result<()> {
    let mut image = load_image_for_update(paths, repo, digest).await;
    image.status = status;
    atomic_write(&paths.image_metadata_file(repo, digest_hex(digest)), &serde_json::to_vec_pretty(&image)?).await
}
