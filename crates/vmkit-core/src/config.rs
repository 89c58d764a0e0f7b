//! Host configuration, loaded once at startup from a TOML file with env
//! overrides for the handful of values operators commonly override in place
//! (container entrypoints, CI). Everything else lives in the file.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Map a Go/OCI-style architecture string to the uname machine string the
/// kernel/init-ramdisk artifacts are named after (spec §4.D).
pub fn arch_to_uname(arch: &str) -> &'static str {
    match arch {
        "amd64" => "x86_64",
        "arm64" => "aarch64",
        _ => "x86_64",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the persistence layout (spec §3/§4.A).
    pub data_root: String,
    /// Host architecture, in OCI form ("amd64"/"arm64").
    #[serde(default = "default_arch")]
    pub arch: String,
    pub network: NetworkConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub build: BuildConfig,
}

fn default_arch() -> String {
    if cfg!(target_arch = "aarch64") { "arm64".into() } else { "amd64".into() }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub default_bridge: String,
    pub default_subnet: String,
    pub default_gateway: String,
    pub dns_domain: String,
    pub dns_upstream: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_cpu_ratio")]
    pub cpu_oversubscription: f64,
    #[serde(default = "default_memory_ratio")]
    pub memory_oversubscription: f64,
    #[serde(default = "default_network_ratio")]
    pub network_oversubscription: f64,
}

fn default_cpu_ratio() -> f64 {
    4.0
}
fn default_memory_ratio() -> f64 {
    1.0
}
fn default_network_ratio() -> f64 {
    1.0
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_oversubscription: default_cpu_ratio(),
            memory_oversubscription: default_memory_ratio(),
            network_oversubscription: default_network_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent: usize,
    #[serde(default = "default_build_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Pinned builder base image every builder instance boots from. Builds
    /// are unavailable (but every other component still starts) when this
    /// is absent, the same way a node with no kernel/initrd artifact staged
    /// still serves everything except instance creation.
    #[serde(default)]
    pub builder_image: Option<BuilderImageConfig>,
}

fn default_max_concurrent_builds() -> usize {
    2
}
fn default_build_timeout_secs() -> u64 {
    1800
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent_builds(),
            default_timeout_secs: default_build_timeout_secs(),
            builder_image: None,
        }
    }
}

/// Operator-staged builder base image (spec §4.H). Resolved once at startup,
/// the same way system kernel/initrd artifacts are pinned rather than
/// re-resolved per build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderImageConfig {
    pub rootfs_path: String,
    pub kernel_path: String,
    pub initrd_path: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default = "default_builder_workdir")]
    pub workdir: String,
}

fn default_builder_workdir() -> String {
    "/".to_string()
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::invalid_input("config", e.to_string()))
    }

    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&contents)
    }

    pub fn uname_arch(&self) -> &'static str {
        arch_to_uname(&self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        data_root = "/var/lib/vmkit"
        arch = "arm64"

        [network]
        default_bridge = "vmbr0"
        default_subnet = "192.168.100.0/24"
        default_gateway = "192.168.100.1"
        dns_domain = "vm.internal"
        dns_upstream = "1.1.1.1"
    "#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.data_root, "/var/lib/vmkit");
        assert_eq!(cfg.uname_arch(), "aarch64");
        assert_eq!(cfg.resources.cpu_oversubscription, 4.0);
        assert_eq!(cfg.build.max_concurrent, 2);
    }

    #[test]
    fn arch_mapping_matches_spec() {
        assert_eq!(arch_to_uname("amd64"), "x86_64");
        assert_eq!(arch_to_uname("arm64"), "aarch64");
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(Config::from_toml_str("not valid = [").is_err());
    }

    #[test]
    fn resource_overrides_apply() {
        let toml = format!(
            "{SAMPLE}\n[resources]\ncpu_oversubscription = 8.0\n"
        );
        let cfg = Config::from_toml_str(&toml).unwrap();
        assert_eq!(cfg.resources.cpu_oversubscription, 8.0);
        assert_eq!(cfg.resources.memory_oversubscription, 1.0);
    }
}
