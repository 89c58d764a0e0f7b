//! Instance create/delete/standby/restore/reboot/attach/detach orchestration
//! (spec §4.F.3-§4.F.9). Free functions rather than a struct's methods,
//! called by `InstanceEngine` once it holds the per-instance writer lock.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::instrument;

use vmkit_core::error::{Error, Result};
use vmkit_core::instance::{Instance, InstanceStatus, ResourceShape, VolumeAttachment, validate_transition};
use vmkit_core::naming;
use vmkit_core::paths::{atomic_write, Paths};
use vmkit_core::time::utc_now;

use vmkit_network::NetworkManager;

use crate::channel_id::derive_channel_id;
use crate::topology::{select_topology, HostTopology};
use crate::vm::hypervisor::{self, DiskConfig, HypervisorClient, NetConfig, VmConfig, VsockConfig};
use crate::vm::instance::disk;
use crate::vm::instance::launch_spec::{self, LaunchSpec};

const SUBSYSTEM: &str = "instance";
const MAX_VOLUMES: usize = 23;
const MOUNT_BLOCKLIST: [&str; 10] = ["/", "/etc", "/usr", "/bin", "/sbin", "/lib", "/var", "/proc", "/sys", "/dev"];
const MAX_OVERLAY_BYTES: u64 = 64 * 1024 * 1024 * 1024;
const DEFAULT_VOLUME_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_CMDLINE: &str = "console=hvc0 reboot=k panic=1 rw";
const READY_POLL_ATTEMPTS: u32 = 20;
const READY_POLL_BASE_DELAY: Duration = Duration::from_millis(100);

/// Dependencies threaded through every orchestration function. Borrowed, not
/// owned, so `InstanceEngine` stays the single owner of the long-lived state.
pub struct Deps<'a> {
    pub paths: &'a Paths,
    pub network: &'a NetworkManager,
    pub host_topology: Option<HostTopology>,
}

/// Everything `createInstance` needs that isn't derivable internally: the
/// image has already been resolved to a rootfs path by the caller (the root
/// facade composes `vmkit-image` before handing this down), so this crate
/// never needs an `ImageNotReady` check of its own.
pub struct CreateInstanceRequest {
    pub name: String,
    pub image_ref: String,
    pub image_rootfs_path: String,
    pub kernel_path: String,
    pub initrd_path: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: String,
    pub resources: ResourceShape,
    pub network: Option<String>,
    pub volumes: Vec<VolumeAttachment>,
    pub want_stopped: bool,
}

/// §4.F.4: at most 23 volumes, absolute and non-system mount paths,
/// pairwise-distinct. Applied on create and on attach.
pub fn validate_volumes(volumes: &[VolumeAttachment]) -> Result<()> {
    if volumes.len() > MAX_VOLUMES {
        return Err(Error::invalid_input(SUBSYSTEM, format!("at most {MAX_VOLUMES} volumes per instance")));
    }
    let mut seen = std::collections::HashSet::new();
    for volume in volumes {
        if !volume.mount_path.starts_with('/') {
            return Err(Error::invalid_input(
                SUBSYSTEM,
                format!("mount path {:?} must be absolute", volume.mount_path),
            ));
        }
        if MOUNT_BLOCKLIST.contains(&volume.mount_path.as_str()) {
            return Err(Error::invalid_input(
                SUBSYSTEM,
                format!("mount path {:?} is a reserved system mount point", volume.mount_path),
            ));
        }
        if !seen.insert(volume.mount_path.as_str()) {
            return Err(Error::invalid_input(
                SUBSYSTEM,
                format!("mount path {:?} is attached more than once", volume.mount_path),
            ));
        }
    }
    Ok(())
}

/// Create orchestration (spec §4.F.3). Ends Running unless `req.want_stopped`,
/// in which case it ends Created (hypervisor process exists, VM configured
/// but not booted). Any failure after the overlay file is created triggers
/// reverse-order teardown; failures before that clean up whatever they just
/// allocated.
#[instrument(skip_all, fields(name = %req.name))]
pub async fn create_instance(req: CreateInstanceRequest, deps: &Deps<'_>) -> Result<Instance> {
    naming::validate_instance_name(&req.name)?;
    validate_volumes(&req.volumes)?;
    if req.resources.overlay_bytes > MAX_OVERLAY_BYTES {
        return Err(Error::invalid_input(
            SUBSYSTEM,
            format!("overlay size {} exceeds the {MAX_OVERLAY_BYTES} byte maximum", req.resources.overlay_bytes),
        ));
    }

    let instance_id = naming::generate_instance_id();
    let topology = select_topology(req.resources.vcpus, deps.host_topology);

    let net = deps.network.allocate_network(req.network.as_deref(), &instance_id, &req.name).await?;

    let now = utc_now();
    let volumes: BTreeMap<String, VolumeAttachment> =
        req.volumes.iter().cloned().map(|v| (v.volume_id.clone(), v)).collect();
    let mut instance = Instance {
        id: instance_id.clone(),
        name: req.name.clone(),
        image_ref: req.image_ref.clone(),
        resources: req.resources.clone(),
        net,
        status: InstanceStatus::Stopped,
        vsock_cid: derive_channel_id(&instance_id),
        socket_path: deps.paths.guest_socket_path(&instance_id).display().to_string(),
        volumes,
        devices: vec![],
        created_at: now.clone(),
        updated_at: now,
    };

    if let Err(e) = persist(deps.paths, &instance).await {
        release_network_best_effort(deps, &instance).await;
        return Err(e);
    }

    let launch = LaunchSpec {
        kernel_path: req.kernel_path.clone(),
        initrd_path: req.initrd_path.clone(),
        image_rootfs_path: req.image_rootfs_path.clone(),
        cmdline: DEFAULT_CMDLINE.to_string(),
    };

    match bring_up(&req, &mut instance, &launch, topology, deps).await {
        Ok(()) => {
            persist(deps.paths, &instance).await?;
            Ok(instance)
        }
        Err(e) => {
            teardown_after_partial_create(deps, &instance).await;
            Err(e)
        }
    }
}

/// Steps 7-12 of §4.F.3, mutating `instance.status` as each boundary is
/// crossed so the caller's teardown path sees accurate state.
async fn bring_up(
    req: &CreateInstanceRequest,
    instance: &mut Instance,
    launch: &LaunchSpec,
    topology: Option<crate::topology::CpuTopology>,
    deps: &Deps<'_>,
) -> Result<()> {
    let overlay_path = deps.paths.guest_overlay_file(&instance.id);
    disk::create_overlay_file(&overlay_path, instance.resources.overlay_bytes).await?;

    let config_payload = disk::ConfigDiskPayload {
        entrypoint: req.entrypoint.clone(),
        cmd: req.cmd.clone(),
        env: req.env.clone(),
        workdir: req.workdir.clone(),
        volumes: req.volumes.clone(),
    };
    disk::write_config_disk(&deps.paths.guest_config_disk_file(&instance.id), &config_payload).await?;

    launch_spec::write(&deps.paths.guest_launch_spec_file(&instance.id), launch).await?;

    let api_socket = deps.paths.guest_api_socket_path(&instance.id);
    let console_log = deps.paths.guest_console_log(&instance.id);
    hypervisor::spawn_process(&api_socket, &console_log).await?;

    let client = HypervisorClient::new(&api_socket);
    client.wait_responsive(READY_POLL_ATTEMPTS, READY_POLL_BASE_DELAY).await?;

    let vm_config = build_vm_config(instance, launch, topology, deps);
    client.create_vm(&vm_config).await?;
    instance.status = InstanceStatus::Created;

    if !req.want_stopped {
        validate_transition(InstanceStatus::Created, InstanceStatus::Running)?;
        client.boot_vm().await?;
        if instance.resources.hotplug_memory_bytes > 0 {
            client
                .resize_memory(instance.resources.memory_bytes + instance.resources.hotplug_memory_bytes)
                .await?;
        }
        instance.status = InstanceStatus::Running;
    }

    Ok(())
}

fn build_vm_config(
    instance: &Instance,
    launch: &LaunchSpec,
    topology: Option<crate::topology::CpuTopology>,
    deps: &Deps<'_>,
) -> VmConfig {
    let mut disks = vec![
        DiskConfig { path: launch.image_rootfs_path.clone(), readonly: true },
        DiskConfig { path: deps.paths.guest_overlay_file(&instance.id).display().to_string(), readonly: false },
        DiskConfig { path: deps.paths.guest_config_disk_file(&instance.id).display().to_string(), readonly: true },
    ];
    for volume in instance.volumes.values() {
        disks.push(DiskConfig {
            path: deps.paths.volume_file(&volume.volume_id).display().to_string(),
            readonly: volume.readonly,
        });
    }

    let net = instance.net.as_ref().map(|n| NetConfig { tap: n.tap_device.clone(), mac: n.mac.clone() });

    VmConfig {
        kernel_path: launch.kernel_path.clone(),
        initrd_path: launch.initrd_path.clone(),
        cmdline: launch.cmdline.clone(),
        vcpus: instance.resources.vcpus,
        topology,
        memory_bytes: instance.resources.memory_bytes,
        disks,
        net,
        vsock: VsockConfig { cid: instance.vsock_cid, socket: instance.socket_path.clone() },
    }
}

/// Reverse-order teardown for a partial create: hypervisor process, network,
/// instance directory (spec §4.F.3 failure policy).
async fn teardown_after_partial_create(deps: &Deps<'_>, instance: &Instance) {
    let client = HypervisorClient::new(deps.paths.guest_api_socket_path(&instance.id));
    let _ = client.shutdown_vmm().await;
    release_network_best_effort(deps, instance).await;
    let _ = tokio::fs::remove_dir_all(deps.paths.guest_dir(&instance.id)).await;
}

async fn release_network_best_effort(deps: &Deps<'_>, instance: &Instance) {
    if let Some(net) = &instance.net {
        let _ = deps.network.release_network(net).await;
    }
}

/// Idempotent on repeated delete of an id that no longer exists *after* the
/// first success; fails *NotFound* on an id that was never created.
#[instrument(skip_all, fields(instance_id))]
pub async fn delete_instance(instance_id: &str, deps: &Deps<'_>) -> Result<()> {
    let instance = load(deps.paths, instance_id).await?;

    let client = HypervisorClient::new(deps.paths.guest_api_socket_path(instance_id));
    let _ = client.shutdown_vmm().await;
    release_network_best_effort(deps, &instance).await;
    tokio::fs::remove_dir_all(deps.paths.guest_dir(instance_id)).await?;
    Ok(())
}

/// Standby (Running → Standby), spec §4.F.7.
#[instrument(skip_all, fields(instance_id))]
pub async fn standby_instance(instance_id: &str, deps: &Deps<'_>) -> Result<Instance> {
    let mut instance = load(deps.paths, instance_id).await?;
    validate_transition(instance.status, InstanceStatus::Paused)?;

    let client = HypervisorClient::new(deps.paths.guest_api_socket_path(instance_id));

    if instance.resources.hotplug_memory_bytes > 0 {
        client.resize_memory(instance.resources.memory_bytes).await?;
    }
    client.pause_vm().await?;
    instance.status = InstanceStatus::Paused;
    persist(deps.paths, &instance).await?;

    let snapshot_dir = deps.paths.guest_snapshot_dir(instance_id);
    tokio::fs::create_dir_all(&snapshot_dir).await?;
    client.snapshot(&snapshot_dir).await?;

    let launch = launch_spec::read(&deps.paths.guest_launch_spec_file(instance_id)).await?;
    let topology = select_topology(instance.resources.vcpus, deps.host_topology);
    let vm_config = build_vm_config(&instance, &launch, topology, deps);
    atomic_write(&deps.paths.guest_snapshot_vm_config(instance_id), &serde_json::to_vec_pretty(&vm_config)?).await?;

    compress_memory_ranges(deps.paths, instance_id).await?;

    validate_transition(InstanceStatus::Paused, InstanceStatus::Standby)?;
    client.shutdown_vmm().await?;
    release_network_best_effort(deps, &instance).await;

    instance.status = InstanceStatus::Standby;
    instance.updated_at = utc_now();
    persist(deps.paths, &instance).await?;
    Ok(instance)
}

/// Replace the raw memory-ranges snapshot file with an lz4-compressed copy,
/// atomically, keeping the original until the compressed file is durable
/// (spec §4.F.7 standby step 4).
async fn compress_memory_ranges(paths: &Paths, instance_id: &str) -> Result<()> {
    let raw_path = paths.guest_snapshot_memory_raw(instance_id);
    let raw = match tokio::fs::read(&raw_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let compressed = lz4_flex::compress_prepend_size(&raw);
    atomic_write(&paths.guest_snapshot_memory_lz4(instance_id), &compressed).await?;
    tokio::fs::remove_file(&raw_path).await?;
    Ok(())
}

/// Restore (Standby → Running), spec §4.F.7. A failed restore leaves the
/// instance in Standby with the transient hypervisor torn down; the snapshot
/// is untouched.
#[instrument(skip_all, fields(instance_id))]
pub async fn restore_instance(instance_id: &str, deps: &Deps<'_>) -> Result<Instance> {
    let mut instance = load(deps.paths, instance_id).await?;
    validate_transition(instance.status, InstanceStatus::Paused)?;

    match do_restore(&mut instance, deps).await {
        Ok(()) => {
            validate_transition(InstanceStatus::Paused, InstanceStatus::Running)?;
            instance.status = InstanceStatus::Running;
            instance.updated_at = utc_now();
            persist(deps.paths, &instance).await?;
            Ok(instance)
        }
        Err(e) => {
            let client = HypervisorClient::new(deps.paths.guest_api_socket_path(instance_id));
            let _ = client.shutdown_vmm().await;
            instance.status = InstanceStatus::Standby;
            let _ = persist(deps.paths, &instance).await;
            Err(e)
        }
    }
}

async fn do_restore(instance: &mut Instance, deps: &Deps<'_>) -> Result<()> {
    let decompressed_tmp = decompress_memory_ranges_if_needed(deps.paths, &instance.id).await?;

    if let Some(net) = &instance.net {
        deps.network.recreate_tap(net).await?;
    }

    let api_socket = deps.paths.guest_api_socket_path(&instance.id);
    let console_log = deps.paths.guest_console_log(&instance.id);
    hypervisor::spawn_process(&api_socket, &console_log).await?;

    let client = HypervisorClient::new(&api_socket);
    client.wait_responsive(READY_POLL_ATTEMPTS, READY_POLL_BASE_DELAY).await?;

    let snapshot_dir = deps.paths.guest_snapshot_dir(&instance.id);
    client.restore(&snapshot_dir).await?;
    client.resume_vm().await?;

    instance.status = InstanceStatus::Paused;

    if let Some(tmp) = decompressed_tmp {
        let _ = tokio::fs::remove_file(tmp).await;
    }
    Ok(())
}

/// If the snapshot's memory-ranges file is compressed, decompress it next to
/// the snapshot so Cloud Hypervisor can restore from a plain raw file,
/// returning the temp path to clean up on success (spec §4.F.7 restore step
/// 1). Leaves the compressed original in place either way.
async fn decompress_memory_ranges_if_needed(paths: &Paths, instance_id: &str) -> Result<Option<std::path::PathBuf>> {
    let lz4_path = paths.guest_snapshot_memory_lz4(instance_id);
    let compressed = match tokio::fs::read(&lz4_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let raw = lz4_flex::decompress_size_prepended(&compressed)
        .map_err(|e| Error::internal(SUBSYSTEM, format!("corrupt memory-ranges snapshot: {e}")))?;
    let raw_path = paths.guest_snapshot_memory_raw(instance_id);
    atomic_write(&raw_path, &raw).await?;
    Ok(Some(raw_path))
}

/// `reboot(id)`: Running → Running via the hypervisor's reboot operation, no
/// status change recorded, duration measured (spec §4.F.8).
#[instrument(skip_all, fields(instance_id))]
pub async fn reboot_instance(instance_id: &str, deps: &Deps<'_>) -> Result<Duration> {
    let instance = load(deps.paths, instance_id).await?;
    if instance.status != InstanceStatus::Running {
        return Err(Error::invalid_state(SUBSYSTEM, format!("instance {instance_id} is not running")));
    }
    let client = HypervisorClient::new(deps.paths.guest_api_socket_path(instance_id));
    let start = Instant::now();
    client.reboot_vm().await?;
    Ok(start.elapsed())
}

/// Attach a volume to a stopped or running instance (spec §4.F.1/§4.F.4).
/// Content storage is out of scope; a fresh backing file is provisioned if
/// the volume id hasn't been seen before.
#[instrument(skip_all, fields(instance_id, volume_id = %attachment.volume_id))]
pub async fn attach_volume(instance_id: &str, attachment: VolumeAttachment, deps: &Deps<'_>) -> Result<Instance> {
    let mut instance = load(deps.paths, instance_id).await?;

    let mut candidate: Vec<VolumeAttachment> = instance.volumes.values().cloned().collect();
    candidate.push(attachment.clone());
    validate_volumes(&candidate)?;

    let backing = deps.paths.volume_file(&attachment.volume_id);
    if tokio::fs::metadata(&backing).await.is_err() {
        disk::create_overlay_file(&backing, DEFAULT_VOLUME_BYTES).await?;
    }

    instance.volumes.insert(attachment.volume_id.clone(), attachment);
    instance.updated_at = utc_now();
    persist(deps.paths, &instance).await?;
    Ok(instance)
}

pub async fn detach_volume(instance_id: &str, volume_id: &str, deps: &Deps<'_>) -> Result<Instance> {
    let mut instance = load(deps.paths, instance_id).await?;
    if instance.volumes.remove(volume_id).is_none() {
        return Err(Error::not_found(SUBSYSTEM, format!("volume {volume_id} is not attached to {instance_id}")));
    }
    instance.updated_at = utc_now();
    persist(deps.paths, &instance).await?;
    Ok(instance)
}

pub async fn persist(paths: &Paths, instance: &Instance) -> Result<()> {
    atomic_write(&paths.guest_metadata_file(&instance.id), &serde_json::to_vec_pretty(instance)?).await
}

pub async fn load(paths: &Paths, instance_id: &str) -> Result<Instance> {
    let bytes = tokio::fs::read(paths.guest_metadata_file(instance_id))
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(SUBSYSTEM, format!("instance {instance_id} not found"))
            } else {
                Error::from(e)
            }
        })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Best-effort, eventually-consistent listing (spec §4.F.1): every instance
/// directory under `guests/` whose metadata parses.
pub async fn list_instances(paths: &Paths) -> Result<Vec<Instance>> {
    let guests_dir = paths.root().join("guests");
    let mut entries = match tokio::fs::read_dir(&guests_dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };
    let mut out = vec![];
    while let Some(entry) = entries.next_entry().await? {
        let Some(instance_id) = entry.file_name().into_string().ok() else { continue };
        if let Ok(instance) = load_with_live_status(paths, &instance_id).await {
            out.push(instance);
        }
    }
    Ok(out)
}

/// Map a Cloud Hypervisor `vm.info` state string onto our status enum. An
/// unrecognized state is treated as "can't tell", not an error.
fn map_hypervisor_state(state: &str) -> Option<InstanceStatus> {
    match state {
        "Running" => Some(InstanceStatus::Running),
        "Paused" => Some(InstanceStatus::Paused),
        "Created" => Some(InstanceStatus::Created),
        "Shutdown" => Some(InstanceStatus::Shutdown),
        _ => None,
    }
}

/// `getInstance`/`listInstances` re-derive `state` from the hypervisor
/// before returning (spec §4.F.1). Standby instances have no hypervisor
/// process, so their on-disk status is authoritative; an unreachable socket
/// falls back to on-disk metadata rather than failing the read (spec:
/// "stale on startup: fall back to on-disk metadata if the hypervisor
/// socket is unreachable").
pub async fn load_with_live_status(paths: &Paths, instance_id: &str) -> Result<Instance> {
    let mut instance = load(paths, instance_id).await?;
    if instance.status == InstanceStatus::Standby {
        return Ok(instance);
    }
    let client = HypervisorClient::new(paths.guest_api_socket_path(instance_id));
    if let Ok(info) = client.info().await {
        if let Some(live) = map_hypervisor_state(&info.state) {
            instance.status = live;
        }
    }
    Ok(instance)
}

/// Resolve an id-or-name lookup (spec §4.F.1 `getInstance`): try as a
/// literal instance id first, then fall back to a name search. Multiple
/// instances sharing a name (legal across distinct networks) report
/// *AmbiguousName*.
pub async fn find_by_id_or_name(paths: &Paths, id_or_name: &str) -> Result<Instance> {
    if let Ok(instance) = load_with_live_status(paths, id_or_name).await {
        return Ok(instance);
    }
    let matches: Vec<Instance> =
        list_instances(paths).await?.into_iter().filter(|i| i.name == id_or_name).collect();
    match matches.len() {
        0 => Err(Error::not_found(SUBSYSTEM, format!("no instance named {id_or_name:?}"))),
        1 => Ok(matches.into_iter().next().unwrap()),
        _ => Err(Error::ambiguous_name(
            SUBSYSTEM,
            format!("{} instances are named {id_or_name:?}; use the instance id", matches.len()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(mount_path: &str) -> VolumeAttachment {
        VolumeAttachment { volume_id: format!("vol-{mount_path}"), mount_path: mount_path.to_string(), readonly: false }
    }

    #[test]
    fn rejects_more_than_max_volumes() {
        let volumes: Vec<VolumeAttachment> = (0..24).map(|i| volume(&format!("/data/{i}"))).collect();
        assert!(validate_volumes(&volumes).is_err());
    }

    #[test]
    fn rejects_relative_mount_path() {
        let volumes = vec![VolumeAttachment { volume_id: "v1".into(), mount_path: "data".into(), readonly: false }];
        assert!(validate_volumes(&volumes).is_err());
    }

    #[test]
    fn rejects_blocklisted_mount_paths() {
        for path in MOUNT_BLOCKLIST {
            assert!(validate_volumes(&[volume(path)]).is_err(), "{path} should be rejected");
        }
    }

    #[test]
    fn rejects_duplicate_mount_paths() {
        let volumes = vec![
            VolumeAttachment { volume_id: "v1".into(), mount_path: "/data".into(), readonly: false },
            VolumeAttachment { volume_id: "v2".into(), mount_path: "/data".into(), readonly: true },
        ];
        assert!(validate_volumes(&volumes).is_err());
    }

    #[test]
    fn accepts_distinct_absolute_non_system_paths() {
        let volumes = vec![volume("/data"), volume("/mnt/cache")];
        assert!(validate_volumes(&volumes).is_ok());
    }

    #[tokio::test]
    async fn persist_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let now = utc_now();
        let instance = Instance {
            id: "abc123".into(),
            name: "web-1".into(),
            image_ref: "library/alpine@sha256:x".into(),
            resources: ResourceShape { vcpus: 1, memory_bytes: 1, hotplug_memory_bytes: 0, overlay_bytes: 0 },
            net: None,
            status: InstanceStatus::Stopped,
            vsock_cid: 3,
            socket_path: "/x/sock".into(),
            volumes: BTreeMap::new(),
            devices: vec![],
            created_at: now.clone(),
            updated_at: now,
        };
        persist(&paths, &instance).await.unwrap();
        let loaded = load(&paths, "abc123").await.unwrap();
        assert_eq!(loaded.name, "web-1");
    }

    #[tokio::test]
    async fn load_missing_instance_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let err = load(&paths, "nonexistent").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_instances_is_empty_before_any_create() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        assert!(list_instances(&paths).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn detach_missing_volume_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let now = utc_now();
        let instance = Instance {
            id: "abc123".into(),
            name: "web-1".into(),
            image_ref: "r".into(),
            resources: ResourceShape { vcpus: 1, memory_bytes: 1, hotplug_memory_bytes: 0, overlay_bytes: 0 },
            net: None,
            status: InstanceStatus::Running,
            vsock_cid: 3,
            socket_path: "/x/sock".into(),
            volumes: BTreeMap::new(),
            devices: vec![],
            created_at: now.clone(),
            updated_at: now,
        };
        persist(&paths, &instance).await.unwrap();

        let network_config = vmkit_core::config::NetworkConfig {
            default_bridge: "vmbr0".into(),
            default_subnet: "192.168.100.0/24".into(),
            default_gateway: "192.168.100.1".into(),
            dns_domain: "vm.internal".into(),
            dns_upstream: "1.1.1.1".into(),
        };
        let network = NetworkManager::new(paths.clone(), network_config);
        let deps = Deps { paths: &paths, network: &network, host_topology: None };

        let err = detach_volume("abc123", "nonexistent", &deps).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
