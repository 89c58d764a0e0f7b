//! Cloud Hypervisor driver: talks to its local HTTP API over the
//! per-instance Unix domain socket (spec §4.F.3 steps 9-11, §4.F.7/8).

use std::path::{Path, PathBuf};
use std::time::Duration;

use http::{Method, Request, StatusCode};
use hyper::{Body, Client};
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use vmkit_core::error::{Error, Result};
use vmkit_core::retry::retry;

use crate::topology::CpuTopology;

const SUBSYSTEM: &str = "hypervisor";
const API_BASE: &str = "/api/v1";
const BINARY: &str = "cloud-hypervisor";

/// Start a `cloud-hypervisor` process bound to `socket_path`, with console
/// output redirected to `console_log_path` (spec §4.F.3 step 9).
pub async fn spawn_process(socket_path: &Path, console_log_path: &Path) -> Result<Child> {
    if let Some(dir) = socket_path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    if let Some(dir) = console_log_path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let _ = tokio::fs::remove_file(socket_path).await;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(console_log_path)
        .map_err(|e| Error::internal(SUBSYSTEM, format!("failed to open console log: {e}")))?;
    let stderr_file = log_file
        .try_clone()
        .map_err(|e| Error::internal(SUBSYSTEM, format!("failed to duplicate console log handle: {e}")))?;

    Command::new(BINARY)
        .args(["--api-socket", &socket_path.display().to_string()])
        .stdout(log_file)
        .stderr(stderr_file)
        .spawn()
        .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, format!("failed to spawn {BINARY}: {e}")))
}

/// A device attached to the VM at creation time.
#[derive(Debug, Clone, Serialize)]
pub struct DiskConfig {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetConfig {
    pub tap: String,
    pub mac: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VsockConfig {
    pub cid: u32,
    pub socket: String,
}

/// The VM configuration submitted on create (spec §4.F.3 step 10).
#[derive(Debug, Clone, Serialize)]
pub struct VmConfig {
    pub kernel_path: String,
    pub initrd_path: String,
    pub cmdline: String,
    pub vcpus: u32,
    pub topology: Option<CpuTopology>,
    pub memory_bytes: u64,
    pub disks: Vec<DiskConfig>,
    pub net: Option<NetConfig>,
    pub vsock: VsockConfig,
}

#[derive(Debug, Clone, Serialize)]
struct ResizeRequest {
    desired_ram: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmInfo {
    pub state: String,
}

/// Thin client bound to one instance's Cloud Hypervisor API socket.
pub struct HypervisorClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl HypervisorClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into(), client: Client::unix() }
    }

    fn uri(&self, path: &str) -> hyper::Uri {
        UnixUri::new(&self.socket_path, path).into()
    }

    async fn call(&self, method: Method, path: &str, body: Body) -> Result<Vec<u8>> {
        let req = Request::builder()
            .method(method)
            .uri(self.uri(path))
            .header("content-type", "application/json")
            .body(body)
            .map_err(|e| Error::internal(SUBSYSTEM, e.to_string()))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, format!("cloud-hypervisor unreachable: {e}")))?;

        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body())
            .await
            .map_err(|e| Error::internal(SUBSYSTEM, e.to_string()))?;

        if !status.is_success() {
            return Err(Error::internal(
                SUBSYSTEM,
                format!("cloud-hypervisor returned {status}: {}", String::from_utf8_lossy(&bytes)),
            ));
        }
        Ok(bytes.to_vec())
    }

    /// Wait for the API socket to accept requests, polling `vm.info` with
    /// backoff (spec §4.F.3 step 9).
    pub async fn wait_responsive(&self, max_attempts: u32, base_delay: Duration) -> Result<()> {
        retry(max_attempts, base_delay, "cloud-hypervisor readiness poll", || async {
            self.call(Method::GET, &format!("{API_BASE}/vm.info"), Body::empty()).await
        })
        .await?;
        Ok(())
    }

    /// Submit the VM configuration (spec §4.F.3 step 10).
    pub async fn create_vm(&self, config: &VmConfig) -> Result<()> {
        let body = serde_json::to_vec(config)?;
        self.call(Method::PUT, &format!("{API_BASE}/vm.create"), Body::from(body)).await?;
        Ok(())
    }

    /// Boot the configured VM (spec §4.F.3 step 11).
    pub async fn boot_vm(&self) -> Result<()> {
        self.call(Method::PUT, &format!("{API_BASE}/vm.boot"), Body::empty()).await?;
        Ok(())
    }

    pub async fn pause_vm(&self) -> Result<()> {
        self.call(Method::PUT, &format!("{API_BASE}/vm.pause"), Body::empty()).await?;
        Ok(())
    }

    pub async fn resume_vm(&self) -> Result<()> {
        self.call(Method::PUT, &format!("{API_BASE}/vm.resume"), Body::empty()).await?;
        Ok(())
    }

    pub async fn shutdown_vm(&self) -> Result<()> {
        self.call(Method::PUT, &format!("{API_BASE}/vm.shutdown"), Body::empty()).await?;
        Ok(())
    }

    /// Terminate the whole hypervisor process, not just the guest VM (spec
    /// §4.F.3/§4.F.7 teardown: "delete hypervisor process" / "terminate the
    /// hypervisor process"). Treats an already-gone socket as success.
    pub async fn shutdown_vmm(&self) -> Result<()> {
        match self.call(Method::PUT, &format!("{API_BASE}/vmm.shutdown"), Body::empty()).await {
            Ok(_) => Ok(()),
            Err(Error::DependencyUnavailable { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn reboot_vm(&self) -> Result<()> {
        self.call(Method::PUT, &format!("{API_BASE}/vm.reboot"), Body::empty()).await?;
        Ok(())
    }

    /// Expand memory after Running via the hypervisor's resize operation
    /// (spec §4.F.3 step 11).
    pub async fn resize_memory(&self, desired_bytes: u64) -> Result<()> {
        let body = serde_json::to_vec(&ResizeRequest { desired_ram: desired_bytes })?;
        self.call(Method::PUT, &format!("{API_BASE}/vm.resize"), Body::from(body)).await?;
        Ok(())
    }

    /// Write a snapshot to `snapshot_dir` (spec §4.F.7 step 3).
    pub async fn snapshot(&self, snapshot_dir: &Path) -> Result<()> {
        let body = serde_json::json!({ "destination_url": format!("file://{}", snapshot_dir.display()) });
        self.call(Method::PUT, &format!("{API_BASE}/vm.snapshot"), Body::from(body.to_string())).await?;
        Ok(())
    }

    /// Restore from `snapshot_dir` (spec §4.F.7 restore step 4).
    pub async fn restore(&self, snapshot_dir: &Path) -> Result<()> {
        let body = serde_json::json!({ "source_url": format!("file://{}", snapshot_dir.display()) });
        self.call(Method::PUT, &format!("{API_BASE}/vm.restore"), Body::from(body.to_string())).await?;
        Ok(())
    }

    pub async fn info(&self) -> Result<VmInfo> {
        let bytes = self.call(Method::GET, &format!("{API_BASE}/vm.info"), Body::empty()).await?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }
}

/// True if the response status maps to a state the caller should treat as
/// "hypervisor not ready yet" rather than a hard failure.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_config_serializes_with_optional_fields_omitted_sensibly() {
        let config = VmConfig {
            kernel_path: "/data/system/artifacts/vmlinux-1-x86_64".into(),
            initrd_path: "/data/system/artifacts/initrd-1-x86_64".into(),
            cmdline: "console=ttyS0".into(),
            vcpus: 2,
            topology: None,
            memory_bytes: 512 * 1024 * 1024,
            disks: vec![DiskConfig { path: "/data/guests/abc/overlay.raw".into(), readonly: false }],
            net: None,
            vsock: VsockConfig { cid: 42, socket: "/data/guests/abc/sock".into() },
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"vcpus\":2"));
        assert!(json.contains("\"cid\":42"));
    }

    #[test]
    fn transient_status_classification() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
