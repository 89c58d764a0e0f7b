//! `InstanceEngine`: the public contract of the instance lifecycle engine
//! (spec §4.F.1). Owns the persistence root, the network manager, the
//! resource ledger, and the per-instance lock registry; every mutating
//! method below acquires the instance's writer lock before calling into
//! `vm::instance::lifecycle`, then appends an audit entry on success.

use std::sync::Arc;

use tokio::sync::Mutex;

use vmkit_core::audit::{AuditAction, AuditEntry};
use vmkit_core::config::Config;
use vmkit_core::error::Result;
use vmkit_core::instance::{Instance, VolumeAttachment};
use vmkit_core::paths::{atomic_append, Paths};

use vmkit_network::NetworkManager;

use crate::lock::InstanceLocks;
use crate::resources::{HostCapacity, InstanceFootprint, ResourceLedger};
use crate::topology::HostTopology;
use crate::vm::instance::lifecycle::{self, CreateInstanceRequest, Deps};
use crate::vm::instance::logs;

pub struct InstanceEngine {
    paths: Paths,
    network: Arc<NetworkManager>,
    locks: InstanceLocks,
    resources: Mutex<ResourceLedger>,
    host_topology: Option<HostTopology>,
}

impl InstanceEngine {
    /// `network` is shared rather than owned outright: a build orchestrator
    /// allocating networks for builder instances needs to see the same
    /// in-memory network cache this engine allocates TAPs against.
    pub fn new(paths: Paths, config: &Config, network: Arc<NetworkManager>, host_topology: Option<HostTopology>) -> Self {
        let capacity = HostCapacity::discover();
        Self {
            paths,
            network,
            locks: InstanceLocks::new(),
            resources: Mutex::new(ResourceLedger::new(capacity, config.resources.clone())),
            host_topology,
        }
    }

    fn deps(&self) -> Deps<'_> {
        Deps { paths: &self.paths, network: &*self.network, host_topology: self.host_topology }
    }

    fn footprint(resources: &vmkit_core::instance::ResourceShape) -> InstanceFootprint {
        InstanceFootprint {
            vcpus: resources.vcpus,
            memory_bytes: resources.memory_bytes,
            disk_bytes: resources.overlay_bytes,
            network_bytes_per_sec: 0,
        }
    }

    /// `createInstance` (spec §4.F.1/§4.F.3): admits against the resource
    /// ledger before the writer lock is even taken, since the instance id
    /// doesn't exist yet to lock on.
    pub async fn create_instance(&self, req: CreateInstanceRequest, subject: Option<String>) -> Result<Instance> {
        let footprint = Self::footprint(&req.resources);
        {
            let ledger = self.resources.lock().await;
            ledger.check_availability(footprint.vcpus, footprint.memory_bytes)?;
        }

        let name = req.name.clone();
        let result = lifecycle::create_instance(req, &self.deps()).await;

        match &result {
            Ok(instance) => {
                self.resources.lock().await.add(footprint);
                self.audit(subject, &instance.id, AuditAction::InstanceCreated, Some(format!("name={name}")))
                    .await;
            }
            Err(_) => {}
        }
        result
    }

    /// Non-committing preflight check: does the host have room for a shape
    /// this large without actually reserving it. Used by callers (the build
    /// orchestrator's `createBuild`) that need to reject a request before
    /// doing any other work, well before an instance id exists to commit
    /// against.
    pub async fn check_resource_availability(&self, vcpus: u32, memory_bytes: u64) -> Result<()> {
        self.resources.lock().await.check_availability(vcpus, memory_bytes)
    }

    /// Looks up by instance id first, then falls back to a name search
    /// (spec §4.F.1 `getInstance`) — *AmbiguousName* if more than one
    /// instance shares that name across networks. State is re-derived from
    /// the hypervisor before returning.
    pub async fn get_instance(&self, id_or_name: &str) -> Result<Instance> {
        let lock = self.locks.get(id_or_name).await;
        let _guard = lock.read().await;
        lifecycle::find_by_id_or_name(&self.paths, id_or_name).await
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        lifecycle::list_instances(&self.paths).await
    }

    /// `streamInstanceLogs` (spec §4.F.1): emits the last `tail` lines of an
    /// instance's console log, then keeps polling for new output if
    /// `follow` is set, until the receiving end is dropped.
    pub async fn stream_instance_logs(
        &self,
        instance_id: &str,
        tail: usize,
        follow: bool,
        tx: tokio::sync::mpsc::Sender<String>,
    ) -> Result<()> {
        logs::stream_lines(&self.paths.guest_console_log(instance_id), tail, follow, tx).await
    }

    /// `rotateLogs` (spec §4.F.9): rotates every instance's console log past
    /// `max_bytes`, keeping up to `max_files` historical copies.
    pub async fn rotate_logs(&self, max_bytes: u64, max_files: u32) -> Result<()> {
        logs::rotate_all(&self.paths, max_bytes, max_files).await
    }

    pub async fn delete_instance(&self, instance_id: &str, subject: Option<String>) -> Result<()> {
        let lock = self.locks.get(instance_id).await;
        let _guard = lock.write().await;

        let instance = lifecycle::load(&self.paths, instance_id).await?;
        lifecycle::delete_instance(instance_id, &self.deps()).await?;

        self.resources.lock().await.remove(Self::footprint(&instance.resources));
        drop(_guard);
        self.locks.remove(instance_id).await;

        self.audit(subject, instance_id, AuditAction::InstanceDeleted, None).await;
        Ok(())
    }

    pub async fn standby_instance(&self, instance_id: &str, subject: Option<String>) -> Result<Instance> {
        let lock = self.locks.get(instance_id).await;
        let _guard = lock.write().await;

        let instance = lifecycle::standby_instance(instance_id, &self.deps()).await?;
        self.audit(subject, instance_id, AuditAction::InstanceStandby, None).await;
        Ok(instance)
    }

    pub async fn restore_instance(&self, instance_id: &str, subject: Option<String>) -> Result<Instance> {
        let lock = self.locks.get(instance_id).await;
        let _guard = lock.write().await;

        let instance = lifecycle::restore_instance(instance_id, &self.deps()).await?;
        self.audit(subject, instance_id, AuditAction::InstanceRestored, None).await;
        Ok(instance)
    }

    pub async fn reboot_instance(&self, instance_id: &str, subject: Option<String>) -> Result<std::time::Duration> {
        let lock = self.locks.get(instance_id).await;
        let _guard = lock.write().await;

        let duration = lifecycle::reboot_instance(instance_id, &self.deps()).await?;
        self.audit(subject, instance_id, AuditAction::InstanceRebooted, Some(format!("duration_ms={}", duration.as_millis())))
            .await;
        Ok(duration)
    }

    pub async fn attach_volume(
        &self,
        instance_id: &str,
        attachment: VolumeAttachment,
        subject: Option<String>,
    ) -> Result<Instance> {
        let lock = self.locks.get(instance_id).await;
        let _guard = lock.write().await;

        let volume_id = attachment.volume_id.clone();
        let instance = lifecycle::attach_volume(instance_id, attachment, &self.deps()).await?;
        self.audit(subject, instance_id, AuditAction::VolumeAttached, Some(format!("volume={volume_id}"))).await;
        Ok(instance)
    }

    pub async fn detach_volume(
        &self,
        instance_id: &str,
        volume_id: &str,
        subject: Option<String>,
    ) -> Result<Instance> {
        let lock = self.locks.get(instance_id).await;
        let _guard = lock.write().await;

        let instance = lifecycle::detach_volume(instance_id, volume_id, &self.deps()).await?;
        self.audit(subject, instance_id, AuditAction::VolumeDetached, Some(format!("volume={volume_id}"))).await;
        Ok(instance)
    }

    /// Best-effort: a failed audit append never fails the caller's request.
    async fn audit(&self, subject: Option<String>, resource_id: &str, action: AuditAction, detail: Option<String>) {
        let mut entry = AuditEntry::new(subject, resource_id, action);
        if let Some(detail) = detail {
            entry = entry.with_detail(detail);
        }
        if let Ok(line) = serde_json::to_vec(&entry) {
            let _ = atomic_append(&self.paths.audit_log_file(), &line).await;
        }
    }
}
