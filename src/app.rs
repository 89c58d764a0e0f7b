use std::sync::Arc;

use vmkit_core::config::Config;
use vmkit_core::error::{Error, Result};
use vmkit_core::image::Image;
use vmkit_core::paths::Paths;

use vmkit_build::{BuilderImage, BuildOrchestrator};
use vmkit_image::{CreateImageRequest, ImagePipeline};
use vmkit_network::NetworkManager;
use vmkit_oci::OciClient;
use vmkit_runtime::InstanceEngine;

const SUBSYSTEM: &str = "vmkitd";

/// The running control plane. An HTTP layer (out of scope here) would hold
/// one of these and dispatch requests onto its accessors; everything it
/// needs — the image pipeline, instance engine, network manager, and
/// (if configured) build orchestrator — is already wired together and
/// recovered from disk by the time [`Vmkitd::bootstrap`] returns.
pub struct Vmkitd {
    pub images: Arc<ImagePipeline>,
    pub instances: Arc<InstanceEngine>,
    pub networks: Arc<NetworkManager>,
    builds: Option<Arc<BuildOrchestrator>>,
}

impl Vmkitd {
    /// Construct every component against `config`, sharing one
    /// `Arc<NetworkManager>` between the instance engine and the build
    /// orchestrator (they must see the same in-memory network cache), then
    /// run each component's own startup recovery. Order matters: networks
    /// load before anything allocates a TAP against them; images recover
    /// before builds, since a recovered build publishes through the image
    /// pipeline on completion.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let paths = Paths::new(config.data_root.clone());

        let networks = Arc::new(NetworkManager::new(paths.clone(), config.network.clone()));
        networks.load().await?;

        let instances = Arc::new(InstanceEngine::new(paths.clone(), &config, networks.clone(), None));

        let oci = Arc::new(OciClient::new(&paths).await?);
        let images = Arc::new(ImagePipeline::new(paths.clone(), oci, config.arch.clone(), config.build.max_concurrent));
        images.ensure_system_files().await?;
        images.recover_interrupted_builds().await?;

        let builds = match &config.build.builder_image {
            Some(builder_cfg) => {
                let builder_image = BuilderImage {
                    rootfs_path: builder_cfg.rootfs_path.clone(),
                    kernel_path: builder_cfg.kernel_path.clone(),
                    initrd_path: builder_cfg.initrd_path.clone(),
                    entrypoint: builder_cfg.entrypoint.clone(),
                    cmd: builder_cfg.cmd.clone(),
                    workdir: builder_cfg.workdir.clone(),
                };
                let orchestrator = Arc::new(BuildOrchestrator::new(
                    paths.clone(),
                    instances.clone(),
                    networks.clone(),
                    images.clone(),
                    builder_image,
                    config.build.max_concurrent,
                ));
                orchestrator.recover_pending_builds().await?;
                Some(orchestrator)
            }
            None => {
                tracing::info!(subsystem = SUBSYSTEM, "no builder image configured, builds unavailable");
                None
            }
        };

        Ok(Self { images, instances, networks, builds })
    }

    /// Component J, "registry receiver (trigger only)": the call a registry
    /// push intercept forwards into once it has resolved a pushed ref to a
    /// repo/tag/source. The intercept itself rides on the HTTP surface this
    /// crate doesn't implement; this is the trigger it fires.
    pub async fn on_registry_push(&self, repo: &str, tag: Option<&str>, source_ref: &str) -> Result<Image> {
        self.images
            .create_image(CreateImageRequest {
                repo: repo.to_string(),
                tag: tag.map(str::to_string),
                source_ref: source_ref.to_string(),
            })
            .await
    }

    pub fn builds(&self) -> Result<&Arc<BuildOrchestrator>> {
        self.builds
            .as_ref()
            .ok_or_else(|| Error::dependency_unavailable(SUBSYSTEM, "no builder image configured"))
    }
}
