//! Builder task body (spec §4.H, "Builder task" steps): a single-use
//! writable source volume, a builder instance with it mounted read-only, a
//! poll loop for the instance shutting itself down, and unconditional
//! teardown of whatever the task allocated. Grounded on the same
//! create-then-reverse-teardown shape as
//! `vmkit-runtime::vm::instance::lifecycle::create_instance`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use vmkit_core::build::{Build, BuildNetworkPolicy, BuildStatus};
use vmkit_core::error::{Error, Result};
use vmkit_core::image::ContainerMetadata;
use vmkit_core::instance::{InstanceStatus, ResourceShape, VolumeAttachment};
use vmkit_core::naming;
use vmkit_core::paths::{atomic_write, Paths};
use vmkit_core::time::utc_now;

use vmkit_image::ImagePipeline;
use vmkit_network::{CreateNetworkRequest, NetworkManager};
use vmkit_runtime::vm::instance::lifecycle::CreateInstanceRequest;
use vmkit_runtime::InstanceEngine;

const SUBSYSTEM: &str = "build_task";
const ISOLATED_NETWORK: &str = "builder-isolated";
const ISOLATED_SUBNET: &str = "192.168.250.0/24";
const SOURCE_MOUNT: &str = "/mnt/source";
const OUTPUT_MOUNT: &str = "/mnt/output";
const OVERLAY_BYTES: u64 = 512 * 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The pinned builder base image every builder instance boots from,
/// resolved once at startup the same way `vmkit-image`'s system artifacts
/// are, rather than re-resolved per build.
#[derive(Clone)]
pub struct BuilderImage {
    pub rootfs_path: String,
    pub kernel_path: String,
    pub initrd_path: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub workdir: String,
}

/// Drives one build from `Building` through to a terminal status, then
/// returns. Never panics the caller: every failure path is captured into
/// the persisted `Build` record instead of propagated.
pub async fn run(
    paths: Paths,
    engine: Arc<InstanceEngine>,
    network: Arc<NetworkManager>,
    images: Arc<ImagePipeline>,
    builder_image: BuilderImage,
    build: Build,
    mut cancel: oneshot::Receiver<()>,
) {
    let id = build.id.clone();
    if let Err(err) = run_inner(&paths, &engine, &network, &images, &builder_image, &build, &mut cancel).await {
        tracing::warn!(subsystem = SUBSYSTEM, build = %id, error = %err, "build failed");
        let _ = update_build(&paths, &id, |b| {
            b.error = Some(err.to_string());
            b.finished_at = Some(utc_now());
            b.status = BuildStatus::Failed;
        })
        .await;
    }
}

/// Re-reads the persisted record, applies `f` unless it's already terminal
/// (a `cancelBuild` call may have written `Cancelled` concurrently), and
/// writes it back. Every status update in this module goes through here so
/// a cancellation can never be clobbered by a late in-flight update.
async fn update_build(paths: &Paths, id: &str, f: impl FnOnce(&mut Build)) -> Result<bool> {
    let bytes = tokio::fs::read(paths.build_metadata_file(id)).await?;
    let mut build: Build = serde_json::from_slice(&bytes)?;
    if build.status.is_terminal() {
        return Ok(false);
    }
    f(&mut build);
    atomic_write(&paths.build_metadata_file(id), &serde_json::to_vec_pretty(&build)?).await?;
    Ok(true)
}

async fn run_inner(
    paths: &Paths,
    engine: &InstanceEngine,
    network: &NetworkManager,
    images: &ImagePipeline,
    builder_image: &BuilderImage,
    build: &Build,
    cancel: &mut oneshot::Receiver<()>,
) -> Result<()> {
    let entered = update_build(paths, &build.id, |b| {
        b.apply_status(BuildStatus::Building);
    })
    .await?;
    if !entered {
        // Already terminal — cancelled (or otherwise finished) before this
        // task got a turn to run. Nothing was allocated yet, so there's
        // nothing to tear down.
        return Ok(());
    }

    let source_bytes = tokio::fs::read(paths.build_source_tarball(&build.id)).await?;
    let source_volume = format!("vol-{}", naming::generate_instance_id());
    let output_volume = format!("vol-{}", naming::generate_instance_id());
    atomic_write(&paths.volume_file(&source_volume), &source_bytes).await?;
    atomic_write(&paths.volume_file(&output_volume), &[]).await?;

    let network_name = match build.policy.network {
        BuildNetworkPolicy::Egress => Some("default".to_string()),
        BuildNetworkPolicy::Isolated => {
            ensure_isolated_network(network).await?;
            Some(ISOLATED_NETWORK.to_string())
        }
    };

    let create_req = CreateInstanceRequest {
        name: format!("builder-{}", build.id),
        image_ref: "builder".to_string(),
        image_rootfs_path: builder_image.rootfs_path.clone(),
        kernel_path: builder_image.kernel_path.clone(),
        initrd_path: builder_image.initrd_path.clone(),
        entrypoint: builder_image.entrypoint.clone(),
        cmd: builder_image.cmd.clone(),
        env: BTreeMap::new(),
        workdir: builder_image.workdir.clone(),
        resources: ResourceShape {
            vcpus: build.policy.vcpus,
            memory_bytes: build.policy.memory_bytes,
            hotplug_memory_bytes: 0,
            overlay_bytes: OVERLAY_BYTES,
        },
        network: network_name,
        volumes: vec![
            VolumeAttachment { volume_id: source_volume.clone(), mount_path: SOURCE_MOUNT.to_string(), readonly: true },
            VolumeAttachment { volume_id: output_volume.clone(), mount_path: OUTPUT_MOUNT.to_string(), readonly: false },
        ],
        want_stopped: false,
    };

    let instance = match engine.create_instance(create_req, None).await {
        Ok(instance) => instance,
        Err(err) => {
            let _ = tokio::fs::remove_file(paths.volume_file(&source_volume)).await;
            let _ = tokio::fs::remove_file(paths.volume_file(&output_volume)).await;
            return Err(err);
        }
    };

    update_build(paths, &build.id, |b| {
        b.builder_instance_id = Some(instance.id.clone());
    })
    .await?;

    let wait_result = wait_for_completion(engine, &instance.id, build.policy.timeout_secs, cancel).await;
    let _ = engine.delete_instance(&instance.id, None).await;
    let _ = tokio::fs::remove_file(paths.volume_file(&source_volume)).await;
    wait_result?;

    update_build(paths, &build.id, |b| {
        b.apply_status(BuildStatus::Pushing);
    })
    .await?;

    let output_bytes = tokio::fs::read(paths.volume_file(&output_volume)).await?;
    let _ = tokio::fs::remove_file(paths.volume_file(&output_volume)).await;
    if output_bytes.is_empty() {
        return Err(Error::internal(SUBSYSTEM, "builder instance produced no output artifact"));
    }

    let digest = format!("sha256:{:x}", Sha256::digest(&output_bytes));
    let rootfs_dir = unpack_output(&output_bytes).await?;

    let image = images
        .publish_local_rootfs(
            &build.request.image_repo,
            build.request.image_tag.as_deref(),
            &digest,
            rootfs_dir.path(),
            ContainerMetadata::default(),
        )
        .await?;

    let finished_at = utc_now();
    update_build(paths, &build.id, |b| {
        b.image_digest = Some(image.digest.clone());
        b.finished_at = Some(finished_at.clone());
        b.apply_status(BuildStatus::Ready);
    })
    .await?;
    Ok(())
}

/// Unpacks a tarball held entirely in memory into a fresh temp directory,
/// on a blocking thread since tar extraction is syscall-heavy — the same
/// split `vmkit-oci` uses for OCI layer extraction.
async fn unpack_output(bytes: &[u8]) -> Result<tempfile::TempDir> {
    let dir = tempfile::tempdir().map_err(Error::from)?;
    let target = dir.path().to_path_buf();
    let owned = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut archive = tar::Archive::new(owned.as_slice());
        archive.unpack(&target).map_err(Error::from)
    })
    .await
    .map_err(|e| Error::internal(SUBSYSTEM, format!("unpack task panicked: {e}")))??;
    Ok(dir)
}

async fn ensure_isolated_network(network: &NetworkManager) -> Result<()> {
    match network
        .create_network(CreateNetworkRequest {
            name: ISOLATED_NETWORK.to_string(),
            subnet: ISOLATED_SUBNET.to_string(),
            isolated: true,
        })
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if err.code() == "already_exists" => Ok(()),
        Err(err) => Err(err),
    }
}

/// Polls `instance_id` until it reaches `Shutdown` (the builder's init
/// finished and powered itself off), the policy timeout elapses, or
/// cancellation fires (spec §4.H: wait "via the host-guest channel or by
/// polling the instance state" — this task takes the polling option).
async fn wait_for_completion(
    engine: &InstanceEngine,
    instance_id: &str,
    timeout_secs: u64,
    cancel: &mut oneshot::Receiver<()>,
) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs.max(1));
    loop {
        if Instant::now() >= deadline {
            return Err(Error::timeout(SUBSYSTEM, "builder instance did not finish within the build's policy timeout"));
        }
        if cancel.try_recv().is_ok() {
            return Err(Error::cancelled(SUBSYSTEM, "build cancelled"));
        }

        let instance = engine.get_instance(instance_id).await?;
        match instance.status {
            InstanceStatus::Shutdown => return Ok(()),
            InstanceStatus::Running | InstanceStatus::Created | InstanceStatus::Paused => {}
            other => {
                return Err(Error::internal(SUBSYSTEM, format!("builder instance entered unexpected state {other}")));
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
