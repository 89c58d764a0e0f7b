//! Build orchestrator public contract (spec §4.H): `createBuild`,
//! `listBuilds`, `getBuild`, `cancelBuild`, `getBuildLogs`, and
//! `recoverPendingBuilds`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use vmkit_core::build::{Build, BuildPolicy, BuildRequest, BuildStatus};
use vmkit_core::error::{Error, Result};
use vmkit_core::naming;
use vmkit_core::paths::{atomic_write, Paths};
use vmkit_core::time::utc_now;

use vmkit_image::ImagePipeline;
use vmkit_network::NetworkManager;
use vmkit_runtime::InstanceEngine;

use crate::queue::BuildQueue;
use crate::task::{self, BuilderImage};

const SUBSYSTEM: &str = "build_orchestrator";

pub struct BuildOrchestrator {
    paths: Paths,
    engine: Arc<InstanceEngine>,
    network: Arc<NetworkManager>,
    images: Arc<ImagePipeline>,
    builder_image: BuilderImage,
    queue: Arc<BuildQueue>,
    cancels: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl BuildOrchestrator {
    pub fn new(
        paths: Paths,
        engine: Arc<InstanceEngine>,
        network: Arc<NetworkManager>,
        images: Arc<ImagePipeline>,
        builder_image: BuilderImage,
        max_concurrent: usize,
    ) -> Self {
        Self {
            paths,
            engine,
            network,
            images,
            builder_image,
            queue: Arc::new(BuildQueue::new(max_concurrent)),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `createBuild` (spec §4.H): preflights resource availability
    /// synchronously so a request that can never fit never creates a
    /// record at all, then persists a `Queued` build and hands it to the
    /// builder task.
    pub async fn create_build(&self, request: BuildRequest, policy: BuildPolicy, source_bytes: Vec<u8>) -> Result<Build> {
        self.engine.check_resource_availability(policy.vcpus, policy.memory_bytes).await?;

        let id = naming::generate_build_id();
        atomic_write(&self.paths.build_source_tarball(&id), &source_bytes).await?;
        atomic_write(&self.paths.build_config_file(&id), &serde_json::to_vec_pretty(&policy)?).await?;

        let build = Build {
            id: id.clone(),
            runtime: "cloud-hypervisor".to_string(),
            request,
            policy,
            status: BuildStatus::Queued,
            image_digest: None,
            error: None,
            provenance: None,
            builder_instance_id: None,
            duration_secs: None,
            queued_at: utc_now(),
            started_at: None,
            finished_at: None,
        };
        self.persist(&build).await?;
        self.spawn_builder_task(build.clone()).await;
        Ok(build)
    }

    async fn spawn_builder_task(&self, build: Build) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let id = build.id.clone();
        self.cancels.lock().await.insert(id.clone(), cancel_tx);

        let paths = self.paths.clone();
        let engine = self.engine.clone();
        let network = self.network.clone();
        let images = self.images.clone();
        let builder_image = self.builder_image.clone();
        let cancels = self.cancels.clone();
        let queue = self.queue.clone();
        let job_id = id.clone();
        let job = async move {
            task::run(paths, engine, network, images, builder_image, build, cancel_rx).await;
            cancels.lock().await.remove(&job_id);
            queue.mark_complete(&job_id).await;
        };
        self.queue.enqueue(id, job).await;
    }

    pub async fn get_build(&self, id: &str) -> Result<Build> {
        self.load(id).await
    }

    pub async fn list_builds(&self) -> Result<Vec<Build>> {
        let dir = self.paths.root().join("builds");
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { return Ok(Vec::new()) };

        let mut out = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(id) = entry.file_name().to_str().map(String::from) else { continue };
            if let Ok(build) = self.load(&id).await {
                out.push(build);
            }
        }
        out.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        Ok(out)
    }

    /// `cancelBuild` (spec §4.H cancellation race): writes `Cancelled`
    /// atomically first on the record as it stands right now, then signals
    /// the builder task on its own channel. If the record was already
    /// terminal this is a no-op that just returns the existing record — a
    /// finished build can't be un-finished by cancelling it.
    pub async fn cancel_build(&self, id: &str) -> Result<Build> {
        let mut build = self.load(id).await?;
        if build.apply_status(BuildStatus::Cancelled) {
            build.finished_at = Some(utc_now());
            self.persist(&build).await?;
        }

        if let Some(cancel_tx) = self.cancels.lock().await.remove(id) {
            let _ = cancel_tx.send(());
        }
        Ok(build)
    }

    pub async fn get_build_logs(&self, id: &str) -> Result<String> {
        tokio::fs::read_to_string(self.paths.build_log_file(id)).await.map_err(Error::from)
    }

    /// `recoverPendingBuilds`: at startup, re-enters the builder task for
    /// every on-disk build that never reached a terminal status, using its
    /// stored request/policy. Any builder instance or volumes a crashed
    /// prior run left behind are torn down as a side effect of the task
    /// running its normal wait-then-teardown sequence again.
    pub async fn recover_pending_builds(&self) -> Result<()> {
        for build in self.list_builds().await? {
            if build.status.is_terminal() {
                continue;
            }
            self.spawn_builder_task(build).await;
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Build> {
        let bytes = tokio::fs::read(self.paths.build_metadata_file(id))
            .await
            .map_err(|_| Error::not_found(SUBSYSTEM, format!("no build {id:?}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn persist(&self, build: &Build) -> Result<()> {
        atomic_write(&self.paths.build_metadata_file(&build.id), &serde_json::to_vec_pretty(build)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmkit_core::build::BuildNetworkPolicy;
    use vmkit_core::config::{BuildConfig, Config, NetworkConfig, ResourceConfig};

    fn test_config() -> Config {
        Config {
            data_root: "/tmp/vmkit-build-test".into(),
            arch: "amd64".into(),
            network: NetworkConfig {
                default_bridge: "vmbr0".into(),
                default_subnet: "192.168.100.0/24".into(),
                default_gateway: "192.168.100.1".into(),
                dns_domain: "vm.internal".into(),
                dns_upstream: "1.1.1.1".into(),
            },
            resources: ResourceConfig::default(),
            build: BuildConfig::default(),
        }
    }

    fn test_policy(vcpus: u32, memory_bytes: u64) -> BuildPolicy {
        BuildPolicy { network: BuildNetworkPolicy::Egress, vcpus, memory_bytes, timeout_secs: 60 }
    }

    #[tokio::test]
    async fn create_build_rejects_a_shape_the_host_cannot_fit() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let cfg = test_config();
        let network = Arc::new(NetworkManager::new(paths.clone(), cfg.network.clone()));
        let engine = Arc::new(InstanceEngine::new(paths.clone(), &cfg, network.clone(), None));
        let oci = vmkit_oci::OciClient::new(&paths).await.unwrap();
        let images = Arc::new(ImagePipeline::new(paths.clone(), Arc::new(oci), "amd64".into(), 1));
        let builder_image = BuilderImage {
            rootfs_path: "/nonexistent/rootfs.img".into(),
            kernel_path: "/nonexistent/vmlinux".into(),
            initrd_path: "/nonexistent/initrd".into(),
            entrypoint: vec!["/bin/sh".into()],
            cmd: vec!["-c".into(), "true".into()],
            workdir: "/".into(),
        };
        let orchestrator = BuildOrchestrator::new(paths, engine, network, images, builder_image, 2);

        let request = BuildRequest { image_repo: "library/demo".into(), image_tag: None };
        let err = orchestrator.create_build(request, test_policy(u32::MAX, u64::MAX), Vec::new()).await.unwrap_err();
        assert_eq!(err.code(), "resources_exhausted");
    }

    #[tokio::test]
    async fn cancel_build_is_a_noop_on_an_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let cfg = test_config();
        let network = Arc::new(NetworkManager::new(paths.clone(), cfg.network.clone()));
        let engine = Arc::new(InstanceEngine::new(paths.clone(), &cfg, network.clone(), None));
        let oci = vmkit_oci::OciClient::new(&paths).await.unwrap();
        let images = Arc::new(ImagePipeline::new(paths.clone(), Arc::new(oci), "amd64".into(), 1));
        let builder_image = BuilderImage {
            rootfs_path: "/nonexistent/rootfs.img".into(),
            kernel_path: "/nonexistent/vmlinux".into(),
            initrd_path: "/nonexistent/initrd".into(),
            entrypoint: vec![],
            cmd: vec![],
            workdir: "/".into(),
        };
        let orchestrator = BuildOrchestrator::new(paths, engine, network, images, builder_image, 2);

        let err = orchestrator.cancel_build("build-nonexistent").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
