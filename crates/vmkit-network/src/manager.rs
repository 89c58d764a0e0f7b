//! The network manager's public contract (spec §4.E): networks, TAP/IP
//! allocation, and DNS registration, backed by persisted `Network`
//! definitions and allocations derived by scanning instance metadata.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tokio::sync::RwLock;

use vmkit_core::config::NetworkConfig;
use vmkit_core::error::{Error, Result};
use vmkit_core::instance::{Instance, InstanceNet};
use vmkit_core::naming;
use vmkit_core::network::{Network, NetworkAllocation};
use vmkit_core::paths::{atomic_write, Paths};
use vmkit_core::time::utc_now;

use crate::allocation::{generate_mac, next_bridge_name};
use crate::subnet::Subnet;
use crate::{bridge, dns};

const SUBSYSTEM: &str = "network_manager";
const DEFAULT_NETWORK: &str = "default";

pub struct CreateNetworkRequest {
    pub name: String,
    pub subnet: String,
    pub isolated: bool,
}

pub struct NetworkManager {
    paths: Paths,
    config: NetworkConfig,
    networks: RwLock<BTreeMap<String, Network>>,
}

impl NetworkManager {
    pub fn new(paths: Paths, config: NetworkConfig) -> Self {
        Self { paths, config, networks: RwLock::new(BTreeMap::new()) }
    }

    /// Load every persisted network definition into the in-memory cache.
    pub async fn load(&self) -> Result<()> {
        let dir = self.paths.network_definitions_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut loaded = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let bytes = tokio::fs::read(entry.path()).await?;
            let net: Network = serde_json::from_slice(&bytes)?;
            loaded.insert(net.name.clone(), net);
        }
        *self.networks.write().await = loaded;
        Ok(())
    }

    /// Ensure the default bridge network exists and start the DNS forwarder
    /// (spec §4.E `initialize`).
    pub async fn initialize(&self) -> Result<()> {
        self.load().await?;
        let has_default = self.networks.read().await.contains_key(DEFAULT_NETWORK);
        if !has_default {
            self.create_network(CreateNetworkRequest {
                name: DEFAULT_NETWORK.to_string(),
                subnet: self.config.default_subnet.clone(),
                isolated: false,
            })
            .await?;
        } else {
            let net = self.networks.read().await.get(DEFAULT_NETWORK).cloned().unwrap();
            let subnet = Subnet::parse(&net.subnet)?;
            bridge::ensure_bridge(&net.bridge, &net.gateway, subnet.prefix_len()).await?;
        }

        let gateways = self.gateway_ips().await;
        dns::start(&self.paths, &gateways, &self.config.dns_upstream).await
    }

    async fn gateway_ips(&self) -> Vec<Ipv4Addr> {
        self.networks.read().await.values().filter_map(|n| n.gateway.parse().ok()).collect()
    }

    /// `createNetwork` (spec §4.E): rejects on name collision, invalid name,
    /// invalid subnet, or subnet overlap with any existing network.
    pub async fn create_network(&self, req: CreateNetworkRequest) -> Result<Network> {
        naming::validate_network_name(&req.name)?;
        let subnet = Subnet::parse(&req.subnet)?;

        let mut networks = self.networks.write().await;
        if networks.contains_key(&req.name) {
            return Err(Error::already_exists(SUBSYSTEM, format!("network {} already exists", req.name)));
        }
        for existing in networks.values() {
            let existing_subnet = Subnet::parse(&existing.subnet)?;
            if subnet.overlaps(&existing_subnet) {
                return Err(Error::conflict(
                    SUBSYSTEM,
                    format!("subnet {} overlaps existing network {}", req.subnet, existing.name),
                ));
            }
        }

        let bridge_name = if req.name == DEFAULT_NETWORK {
            self.config.default_bridge.clone()
        } else {
            let existing_bridges: Vec<String> = networks.values().map(|n| n.bridge.clone()).collect();
            next_bridge_name(&existing_bridges)
        };
        let gateway = Ipv4Addr::from(u32::from(subnet.network_addr()) + 1);

        bridge::ensure_bridge(&bridge_name, &gateway.to_string(), subnet.prefix_len()).await?;
        if req.isolated {
            bridge::apply_isolation(&bridge_name).await?;
        } else {
            bridge::ensure_masquerade(&bridge_name, &req.subnet).await?;
        }

        let network = Network {
            name: req.name.clone(),
            bridge: bridge_name,
            subnet: subnet.to_cidr_string(),
            gateway: gateway.to_string(),
            dns_domain: Some(self.config.dns_domain.clone()),
            created_at: utc_now(),
        };
        atomic_write(&self.paths.network_definition_file(&network.name), &serde_json::to_vec_pretty(&network)?)
            .await?;
        networks.insert(network.name.clone(), network.clone());
        Ok(network)
    }

    pub async fn get_network(&self, name: &str) -> Result<Network> {
        self.networks
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(SUBSYSTEM, format!("network {name} not found")))
    }

    pub async fn list_networks(&self) -> Result<Vec<Network>> {
        Ok(self.networks.read().await.values().cloned().collect())
    }

    /// Rejects deletion of "default" and of any network with a live
    /// allocation (spec §4.E).
    pub async fn delete_network(&self, name: &str) -> Result<()> {
        if name == DEFAULT_NETWORK {
            return Err(Error::invalid_input(SUBSYSTEM, "the default network cannot be deleted"));
        }
        let allocations = self.list_allocations().await?;
        if allocations.iter().any(|a| a.network == name) {
            return Err(Error::conflict(SUBSYSTEM, format!("network {name} has live allocations")));
        }

        let mut networks = self.networks.write().await;
        let network =
            networks.remove(name).ok_or_else(|| Error::not_found(SUBSYSTEM, format!("network {name} not found")))?;
        bridge::delete_bridge(&network.bridge).await?;
        let _ = tokio::fs::remove_file(self.paths.network_definition_file(name)).await;
        Ok(())
    }

    /// `allocateNetwork` (spec §4.E): empty name means no network device.
    pub async fn allocate_network(
        &self,
        network_name: Option<&str>,
        instance_id: &str,
        instance_name: &str,
    ) -> Result<Option<InstanceNet>> {
        let Some(network_name) = network_name.filter(|n| !n.is_empty()) else { return Ok(None) };

        if self.name_exists_in_network(instance_name, network_name).await? {
            return Err(Error::already_exists(
                SUBSYSTEM,
                format!("instance name {instance_name} already used in network {network_name}"),
            ));
        }

        let network = self.get_network(network_name).await?;
        let subnet = Subnet::parse(&network.subnet)?;
        let gateway: Ipv4Addr = network
            .gateway
            .parse()
            .map_err(|_| Error::internal(SUBSYSTEM, "stored gateway is not a valid address"))?;

        let allocated_ips = self.allocated_ips_in(network_name).await?;
        let ip = subnet.next_free_ip(gateway, &allocated_ips)?;
        let mac = generate_mac(instance_id);
        let tap = naming::tap_name(instance_id);

        bridge::create_tap(&tap, &network.bridge).await?;

        let alloc = InstanceNet { network: network.name, ip: ip.to_string(), mac, tap_device: tap };
        if let Err(e) = self.reload_dns().await {
            let _ = bridge::delete_tap(&alloc.tap_device).await;
            return Err(e);
        }
        Ok(Some(alloc))
    }

    /// `releaseNetwork`: missing TAP is not an error.
    pub async fn release_network(&self, alloc: &InstanceNet) -> Result<()> {
        bridge::delete_tap(&alloc.tap_device).await?;
        self.reload_dns().await
    }

    /// `recreateNetwork`: re-creates the TAP with the same name; DNS
    /// registration is unchanged because it is name-based.
    pub async fn recreate_tap(&self, alloc: &InstanceNet) -> Result<()> {
        let network = self.get_network(&alloc.network).await?;
        bridge::create_tap(&alloc.tap_device, &network.bridge).await
    }

    pub async fn name_exists_in_network(&self, name: &str, network: &str) -> Result<bool> {
        let instances = self.scan_instances().await?;
        Ok(instances
            .iter()
            .any(|i| i.net.as_ref().map(|n| n.network.as_str()) == Some(network) && i.name == name))
    }

    pub async fn list_allocations(&self) -> Result<Vec<NetworkAllocation>> {
        let instances = self.scan_instances().await?;
        Ok(instances
            .into_iter()
            .filter_map(|i| {
                let net = i.net?;
                Some(NetworkAllocation {
                    network: net.network,
                    instance_id: i.id,
                    ip: net.ip,
                    mac: net.mac,
                    tap_device: net.tap_device,
                    allocated_at: i.created_at,
                })
            })
            .collect())
    }

    pub async fn get_allocation(&self, instance_id: &str) -> Result<NetworkAllocation> {
        self.list_allocations()
            .await?
            .into_iter()
            .find(|a| a.instance_id == instance_id)
            .ok_or_else(|| Error::not_found(SUBSYSTEM, format!("no allocation for instance {instance_id}")))
    }

    async fn allocated_ips_in(&self, network: &str) -> Result<Vec<Ipv4Addr>> {
        let instances = self.scan_instances().await?;
        Ok(instances
            .iter()
            .filter_map(|i| {
                let net = i.net.as_ref()?;
                if net.network != network {
                    return None;
                }
                net.ip.parse().ok()
            })
            .collect())
    }

    /// Allocations are derived state (spec §3 NetworkAllocation): rebuild by
    /// scanning `guests/*/metadata` rather than keeping a second primary
    /// record that could drift from instance state.
    async fn scan_instances(&self) -> Result<Vec<Instance>> {
        let guests_dir = self.paths.root().join("guests");
        let mut entries = match tokio::fs::read_dir(&guests_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut out = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let metadata_path = entry.path().join("metadata");
            if let Ok(bytes) = tokio::fs::read(&metadata_path).await {
                if let Ok(instance) = serde_json::from_slice::<Instance>(&bytes) {
                    out.push(instance);
                }
            }
        }
        Ok(out)
    }

    async fn reload_dns(&self) -> Result<()> {
        let allocations = self.list_allocations().await?;
        let instances = self.scan_instances().await?;
        let by_id: BTreeMap<String, Instance> = instances.into_iter().map(|i| (i.id.clone(), i)).collect();

        let mut entries = BTreeMap::new();
        for alloc in &allocations {
            let Some(instance) = by_id.get(&alloc.instance_id) else { continue };
            let network = self.networks.read().await.get(&alloc.network).cloned();
            let Some(network) = network else { continue };
            let Some(domain) = &network.dns_domain else { continue };
            let Ok(ip) = alloc.ip.parse::<Ipv4Addr>() else { continue };
            for fqdn in dns::hostnames_for(&instance.name, &instance.id, &alloc.network, domain) {
                entries.insert(fqdn, ip);
            }
        }
        dns::reload(&self.paths, &entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmkit_core::instance::{InstanceStatus, ResourceShape};

    fn sample_instance(id: &str, name: &str, network: &str, ip: &str) -> Instance {
        Instance {
            id: id.to_string(),
            name: name.to_string(),
            image_ref: "library/alpine@sha256:abc".into(),
            resources: ResourceShape { vcpus: 1, memory_bytes: 1, hotplug_memory_bytes: 0, overlay_bytes: 0 },
            net: Some(InstanceNet {
                network: network.to_string(),
                ip: ip.to_string(),
                mac: "02:fc:00:00:00:01".into(),
                tap_device: format!("tap-{id}"),
            }),
            status: InstanceStatus::Running,
            vsock_cid: 3,
            socket_path: "/x/sock".into(),
            volumes: Default::default(),
            devices: vec![],
            created_at: "2026-07-30T00:00:00Z".into(),
            updated_at: "2026-07-30T00:00:00Z".into(),
        }
    }

    async fn write_guest(paths: &Paths, instance: &Instance) {
        let path = paths.guest_metadata_file(&instance.id);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, serde_json::to_vec(instance).unwrap()).await.unwrap();
    }

    fn manager(dir: &std::path::Path) -> NetworkManager {
        NetworkManager::new(
            Paths::new(dir),
            NetworkConfig {
                default_bridge: "vmbr0".into(),
                default_subnet: "192.168.100.0/24".into(),
                default_gateway: "192.168.100.1".into(),
                dns_domain: "vm.internal".into(),
                dns_upstream: "1.1.1.1".into(),
            },
        )
    }

    #[tokio::test]
    async fn list_allocations_reflects_scanned_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        write_guest(&mgr.paths, &sample_instance("i1", "web-1", "default", "192.168.100.10")).await;
        write_guest(&mgr.paths, &sample_instance("i2", "web-2", "default", "192.168.100.11")).await;

        let allocations = mgr.list_allocations().await.unwrap();
        assert_eq!(allocations.len(), 2);
        assert!(allocations.iter().any(|a| a.instance_id == "i1" && a.ip == "192.168.100.10"));
    }

    #[tokio::test]
    async fn name_exists_in_network_checks_only_that_network() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        write_guest(&mgr.paths, &sample_instance("i1", "web-1", "default", "192.168.100.10")).await;

        assert!(mgr.name_exists_in_network("web-1", "default").await.unwrap());
        assert!(!mgr.name_exists_in_network("web-1", "other").await.unwrap());
        assert!(!mgr.name_exists_in_network("web-2", "default").await.unwrap());
    }

    #[tokio::test]
    async fn get_allocation_reports_not_found_for_unknown_instance() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let err = mgr.get_allocation("nonexistent").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn allocate_network_with_empty_name_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let alloc = mgr.allocate_network(Some(""), "i1", "web-1").await.unwrap();
        assert!(alloc.is_none());
        let alloc = mgr.allocate_network(None, "i1", "web-1").await.unwrap();
        assert!(alloc.is_none());
    }

    #[tokio::test]
    async fn delete_network_rejects_default() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let err = mgr.delete_network(DEFAULT_NETWORK).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }
}
