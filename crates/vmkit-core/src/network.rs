use serde::{Deserialize, Serialize};

/// A managed bridge network (spec §3 Network, §4.E). One bridge, one subnet,
/// one optional DNS forwarder zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub bridge: String,
    pub subnet: String,
    pub gateway: String,
    pub dns_domain: Option<String>,
    pub created_at: String,
}

/// A single IP/MAC/TAP lease within a network, keyed by the instance it was
/// allocated to (spec §3 NetworkAllocation, §4.E.3). Allocations are derived
/// state: the network manager can always rebuild the in-memory table by
/// scanning `guests/*/metadata` at startup, this struct is the on-the-wire
/// shape returned by `listAllocations`/`getAllocation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAllocation {
    pub network: String,
    pub instance_id: String,
    pub ip: String,
    pub mac: String,
    pub tap_device: String,
    pub allocated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_json_roundtrips() {
        let net = Network {
            name: "default".into(),
            bridge: "vmbr0".into(),
            subnet: "192.168.100.0/24".into(),
            gateway: "192.168.100.1".into(),
            dns_domain: Some("vm.internal".into()),
            created_at: "2026-07-30T00:00:00Z".into(),
        };
        let json = serde_json::to_string(&net).unwrap();
        let parsed: Network = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.bridge, "vmbr0");
    }

    #[test]
    fn allocation_json_roundtrips() {
        let alloc = NetworkAllocation {
            network: "default".into(),
            instance_id: "3f9a2c1e4b7d0a55c2e1".into(),
            ip: "192.168.100.5".into(),
            mac: "02:fc:3f:9a:2c:1e".into(),
            tap_device: "tap-3f9a2c1e".into(),
            allocated_at: "2026-07-30T00:00:00Z".into(),
        };
        let json = serde_json::to_string(&alloc).unwrap();
        let parsed: NetworkAllocation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.ip, "192.168.100.5");
    }
}
