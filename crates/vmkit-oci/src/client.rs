use std::path::PathBuf;

use oci_client::client::ClientConfig;
use oci_client::secrets::RegistryAuth;
use oci_client::Reference;
use tokio::sync::Mutex;

use vmkit_core::error::{Error, Result};
use vmkit_core::image::ContainerMetadata;
use vmkit_core::paths::Paths;

use crate::ledger::{BlobKind, CacheLedger};
use crate::unpack::{self, LayerFile};

const SUBSYSTEM: &str = "oci_client";

/// OCI registry client bound to one data root's shared blob cache. Every
/// repo that pulls a shared base layer writes and reads the same
/// content-addressed file (spec §4.B layer dedup).
pub struct OciClient {
    inner: oci_client::Client,
    auth: RegistryAuth,
    ledger: Mutex<CacheLedger>,
}

impl OciClient {
    pub async fn new(paths: &Paths) -> Result<Self> {
        Ok(Self {
            inner: oci_client::Client::new(ClientConfig::default()),
            auth: RegistryAuth::Anonymous,
            ledger: Mutex::new(CacheLedger::load(paths).await?),
        })
    }

    fn parse_ref(image_ref: &str) -> Result<Reference> {
        image_ref.parse().map_err(|e: oci_client::ParseError| {
            Error::invalid_input(SUBSYSTEM, format!("invalid image reference {image_ref:?}: {e}"))
        })
    }

    /// `inspectManifest` (spec §4.B): resolves the canonical manifest digest
    /// without downloading any layer.
    pub async fn inspect_manifest(&self, image_ref: &str) -> Result<String> {
        let reference = Self::parse_ref(image_ref)?;
        self.inner
            .fetch_manifest_digest(&reference, &self.auth)
            .await
            .map_err(|e| classify_registry_error(e.to_string()))
    }

    /// `pullAndUnpack` (spec §4.B): ensures `digest` is present in the
    /// shared blob cache, then materializes the merged rootfs into
    /// `target_dir`. A failed pull leaves no partial blob behind — only
    /// fully-verified layers are committed into the cache.
    pub async fn pull_and_unpack(
        &self,
        image_ref: &str,
        digest: &str,
        target_dir: &std::path::Path,
    ) -> Result<ContainerMetadata> {
        let reference = Self::parse_ref(image_ref)?;
        let (manifest, observed_digest, config_json) = self
            .inner
            .pull_manifest_and_config(&reference, &self.auth)
            .await
            .map_err(|e| classify_registry_error(e.to_string()))?;

        if observed_digest != digest {
            return Err(Error::conflict(
                SUBSYSTEM,
                format!("registry now serves {observed_digest} for {image_ref:?}, expected {digest}"),
            ));
        }

        let mut layer_files = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            let path = self.ensure_layer_cached(&reference, layer).await?;
            layer_files.push(LayerFile { path, media_type: layer.media_type.clone() });
        }

        let target = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || unpack::apply_layers_blocking(&layer_files, &target))
            .await
            .map_err(|e| Error::internal(SUBSYSTEM, format!("unpack task panicked: {e}")))??;

        Ok(parse_container_metadata(&config_json))
    }

    async fn ensure_layer_cached(
        &self,
        reference: &Reference,
        layer: &oci_client::manifest::OciDescriptor,
    ) -> Result<PathBuf> {
        let mut ledger = self.ledger.lock().await;
        let size = u64::try_from(layer.size).unwrap_or(0);
        if ledger.has_blob(BlobKind::Layer, &layer.digest) {
            ledger.record_reference(&layer.digest, size).await?;
            return Ok(ledger.blob_path(BlobKind::Layer, &layer.digest));
        }

        let staging = ledger.staging_path(BlobKind::Layer, &layer.digest);
        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&staging).await?;
        let pull_result = self.inner.pull_blob(reference, layer, &mut file).await;
        drop(file);

        if let Err(e) = pull_result {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(classify_registry_error(e.to_string()));
        }

        let final_path = ledger.blob_path(BlobKind::Layer, &layer.digest);
        tokio::fs::rename(&staging, &final_path).await?;
        ledger.record_reference(&layer.digest, size).await?;
        Ok(final_path)
    }
}

/// `oci-client` reports transport, auth, and malformed-response failures as
/// opaque `anyhow::Error`s; classify by message shape into our closed
/// taxonomy since the crate doesn't expose a structured error enum here.
fn classify_registry_error(message: String) -> Error {
    let lower = message.to_ascii_lowercase();
    if lower.contains("404") || lower.contains("not found") {
        Error::not_found(SUBSYSTEM, message)
    } else if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") || lower.contains("denied")
    {
        Error::invalid_input(SUBSYSTEM, format!("registry rejected credentials: {message}"))
    } else if lower.contains("digest") || (lower.contains("manifest") && lower.contains("parse")) {
        Error::invalid_input(SUBSYSTEM, message)
    } else {
        Error::dependency_unavailable(SUBSYSTEM, message)
    }
}

#[derive(serde::Deserialize)]
struct RawContainerConfig {
    #[serde(default, alias = "Entrypoint")]
    entrypoint: Vec<String>,
    #[serde(default, alias = "Cmd")]
    cmd: Vec<String>,
    #[serde(default, alias = "Env")]
    env: Vec<String>,
    #[serde(default, alias = "WorkingDir")]
    working_dir: Option<String>,
    #[serde(default, alias = "User")]
    user: Option<String>,
}

#[derive(serde::Deserialize)]
struct RawConfigBlob {
    config: Option<RawContainerConfig>,
}

/// The OCI image config blob wraps the fields we care about under a
/// top-level `"config"` key; a missing or malformed section just yields
/// defaults rather than failing the whole pull.
fn parse_container_metadata(config_json: &str) -> ContainerMetadata {
    let raw = serde_json::from_str::<RawConfigBlob>(config_json).ok().and_then(|c| c.config);
    match raw {
        Some(c) => ContainerMetadata {
            entrypoint: c.entrypoint,
            cmd: c.cmd,
            env: c.env,
            workdir: c.working_dir,
            user: c.user,
        },
        None => ContainerMetadata::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_container_metadata_reads_docker_style_config() {
        let json = r#"{"config":{"Entrypoint":["/bin/sh"],"Cmd":["-c","echo hi"],"Env":["PATH=/usr/bin"],"WorkingDir":"/app","User":"1000"}}"#;
        let meta = parse_container_metadata(json);
        assert_eq!(meta.entrypoint, vec!["/bin/sh"]);
        assert_eq!(meta.cmd, vec!["-c", "echo hi"]);
        assert_eq!(meta.env, vec!["PATH=/usr/bin"]);
        assert_eq!(meta.workdir.as_deref(), Some("/app"));
        assert_eq!(meta.user.as_deref(), Some("1000"));
    }

    #[test]
    fn parse_container_metadata_defaults_on_missing_config() {
        let meta = parse_container_metadata("{}");
        assert!(meta.entrypoint.is_empty());
        assert!(meta.workdir.is_none());
    }

    #[test]
    fn classify_registry_error_maps_404_to_not_found() {
        assert!(classify_registry_error("GET manifest: 404 Not Found".into()).is_not_found());
    }

    #[test]
    fn classify_registry_error_maps_unknown_to_dependency_unavailable() {
        let err = classify_registry_error("connection reset by peer".into());
        assert_eq!(err.code(), "dependency_unavailable");
    }
}
