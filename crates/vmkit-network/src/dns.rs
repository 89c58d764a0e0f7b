//! DNS forwarder: one `dnsmasq` instance serving every network from a flat
//! hosts file, reloaded by rewriting the file and sending `SIGHUP` (spec
//! §4.E `initialize`, `allocateNetwork`/`releaseNetwork` reload step).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tokio::process::Command;

use vmkit_core::error::{Error, Result};
use vmkit_core::paths::{atomic_write, Paths};

const SUBSYSTEM: &str = "network_dns";

/// Both the instance-name and instance-id forms resolve to the same address
/// (spec §4.E DNS policy).
pub fn hostnames_for(instance_name: &str, instance_id: &str, network: &str, domain: &str) -> [String; 2] {
    [format!("{instance_name}.{network}.{domain}"), format!("{instance_id}.{network}.{domain}")]
}

/// Start `dnsmasq` bound to every bridge gateway IP, forwarding unresolved
/// queries upstream. Writes the config and an empty hosts file first so the
/// process has something to load.
pub async fn start(paths: &Paths, gateway_ips: &[Ipv4Addr], upstream: &str) -> Result<()> {
    let hosts_path = paths.network_dns_hosts();
    if tokio::fs::metadata(&hosts_path).await.is_err() {
        atomic_write(&hosts_path, b"").await?;
    }

    let listen_addrs = gateway_ips.iter().map(|ip| format!("listen-address={ip}\n")).collect::<String>();
    let conf = format!(
        "no-resolv\nserver={upstream}\naddn-hosts={}\n{listen_addrs}",
        hosts_path.display(),
    );
    atomic_write(&paths.network_dns_conf(), conf.as_bytes()).await?;

    let pid_path = paths.network_dns_pid();
    let child = Command::new("dnsmasq")
        .args(["--keep-in-foreground".into(), format!("--conf-file={}", paths.network_dns_conf().display())])
        .spawn()
        .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, format!("failed to spawn dnsmasq: {e}")))?;
    if let Some(pid) = child.id() {
        atomic_write(&pid_path, pid.to_string().as_bytes()).await?;
    }
    Ok(())
}

/// Rewrite the hosts file atomically and signal the running forwarder to
/// reload it. If reload fails, the caller must roll back whatever change
/// prompted it (spec §4.E DNS policy).
pub async fn reload(paths: &Paths, entries: &BTreeMap<String, Ipv4Addr>) -> Result<()> {
    let mut contents = String::new();
    for (fqdn, ip) in entries {
        contents.push_str(&format!("{ip} {fqdn}\n"));
    }
    atomic_write(&paths.network_dns_hosts(), contents.as_bytes()).await?;
    signal_reload(paths).await
}

async fn signal_reload(paths: &Paths) -> Result<()> {
    let pid_path = paths.network_dns_pid();
    let pid = match tokio::fs::read_to_string(&pid_path).await {
        Ok(s) => s.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let status = Command::new("kill")
        .args(["-HUP", &pid])
        .status()
        .await
        .map_err(|e| Error::dependency_unavailable(SUBSYSTEM, format!("failed to signal dnsmasq: {e}")))?;
    if !status.success() {
        return Err(Error::internal(SUBSYSTEM, format!("dnsmasq (pid {pid}) did not accept SIGHUP")));
    }
    Ok(())
}
