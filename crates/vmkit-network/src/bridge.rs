//! Bridge and TAP device management via direct `ip`/`iptables` invocations.
//!
//! vmkit runs as the host daemon itself, so these commands execute directly
//! against the host network namespace rather than being shelled into a
//! nested dev VM.

use tokio::process::Command;

use vmkit_core::error::{Error, Result};

const SUBSYSTEM: &str = "network_bridge";

async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, format!("failed to spawn {program}: {e}")))?;
    if !output.status.success() {
        return Err(Error::internal(
            SUBSYSTEM,
            format!("{program} {args:?} failed: {}", String::from_utf8_lossy(&output.stderr)),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn bridge_exists(name: &str) -> bool {
    Command::new("ip").args(["link", "show", name]).output().await.map(|o| o.status.success()).unwrap_or(false)
}

/// Ensure a bridge exists with `gateway/prefix_len` assigned, idempotent.
pub async fn ensure_bridge(name: &str, gateway: &str, prefix_len: u32) -> Result<()> {
    if bridge_exists(name).await {
        return Ok(());
    }
    run("ip", &["link", "add", name, "type", "bridge"]).await?;
    run("ip", &["addr", "add", &format!("{gateway}/{prefix_len}"), "dev", name]).await?;
    run("ip", &["link", "set", name, "up"]).await?;
    Ok(())
}

/// Tear down a bridge. Missing bridge is not an error.
pub async fn delete_bridge(name: &str) -> Result<()> {
    let _ = run("ip", &["link", "set", name, "down"]).await;
    let _ = run("ip", &["link", "del", name]).await;
    Ok(())
}

/// Create a TAP device and attach it to `bridge`.
pub async fn create_tap(tap: &str, bridge: &str) -> Result<()> {
    run("ip", &["tuntap", "add", "dev", tap, "mode", "tap"]).await?;
    run("ip", &["link", "set", tap, "master", bridge]).await?;
    run("ip", &["link", "set", tap, "up"]).await?;
    Ok(())
}

/// Delete a TAP device. Missing TAP is not an error (spec §4.E
/// `releaseNetwork`).
pub async fn delete_tap(tap: &str) -> Result<()> {
    let _ = run("ip", &["link", "del", tap]).await;
    Ok(())
}

/// Block all forwarding out of `bridge` except between its own TAPs, so
/// instances on an isolated network can reach each other but nothing else.
pub async fn apply_isolation(bridge: &str) -> Result<()> {
    run("iptables", &["-I", "FORWARD", "-i", bridge, "!", "-o", bridge, "-j", "DROP"]).await?;
    Ok(())
}

/// NAT a non-isolated network's traffic out through the host's default
/// route.
pub async fn ensure_masquerade(bridge: &str, subnet: &str) -> Result<()> {
    let check = Command::new("iptables")
        .args(["-t", "nat", "-C", "POSTROUTING", "-s", subnet, "!", "-o", bridge, "-j", "MASQUERADE"])
        .status()
        .await
        .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, e.to_string()))?;
    if check.success() {
        return Ok(());
    }
    run("iptables", &["-t", "nat", "-A", "POSTROUTING", "-s", subnet, "!", "-o", bridge, "-j", "MASQUERADE"]).await?;
    Ok(())
}
