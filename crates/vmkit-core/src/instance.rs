use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SUBSYSTEM: &str = "instance";

/// Instance lifecycle state (spec §3 Instance lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// No hypervisor process, no snapshot.
    Stopped,
    /// Hypervisor process exists, VM configured but not booted.
    Created,
    /// VM executing.
    Running,
    /// VM paused in memory (hypervisor process alive).
    Paused,
    /// VM stopped but hypervisor process alive.
    Shutdown,
    /// Hypervisor process gone, snapshot on disk.
    Standby,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::Standby => "standby",
        };
        write!(f, "{s}")
    }
}

/// Validate that a state transition is one of the legal single-hop
/// transitions (spec §3): `Stopped→Created→Running↔Paused;
/// Running/Paused→Shutdown; Paused→Standby; Standby→Paused; any→Stopped`.
///
/// `restoreInstance` ends in `Running` but gets there via two persisted
/// hops, `Standby→Paused` then `Paused→Running` — callers drive both.
pub fn validate_transition(from: InstanceStatus, to: InstanceStatus) -> Result<()> {
    use InstanceStatus::*;

    // Stopped is the absorbing sink for teardown/delete, reachable from anywhere.
    if to == Stopped {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        (Stopped, Created)
            | (Created, Running)
            | (Running, Paused)
            | (Paused, Running)
            | (Running, Shutdown)
            | (Paused, Shutdown)
            | (Paused, Standby)
            | (Standby, Paused)
    );

    if valid {
        Ok(())
    } else {
        Err(Error::invalid_state(
            SUBSYSTEM,
            format!("illegal transition: {from} -> {to}"),
        ))
    }
}

/// Per-instance network allocation, cached onto the persisted instance
/// record so `listInstances` can render it without re-deriving from the
/// network manager (spec §3 NetworkAllocation is the source of truth; this
/// is a read-side cache, not a second primary record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceNet {
    pub network: String,
    pub ip: String,
    pub mac: String,
    pub tap_device: String,
}

/// Resource shape requested at creation (spec §3 Instance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceShape {
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub hotplug_memory_bytes: u64,
    pub overlay_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub mount_path: String,
    pub readonly: bool,
}

/// Full instance record, persisted at `guests/<id>/metadata` (spec §3/§4.A).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub resources: ResourceShape,
    pub net: Option<InstanceNet>,
    pub status: InstanceStatus,
    pub vsock_cid: u32,
    pub socket_path: String,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeAttachment>,
    #[serde(default)]
    pub devices: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    #[test]
    fn create_start_pause_resume_is_legal() {
        assert!(validate_transition(Stopped, Created).is_ok());
        assert!(validate_transition(Created, Running).is_ok());
        assert!(validate_transition(Running, Paused).is_ok());
        assert!(validate_transition(Paused, Running).is_ok());
    }

    #[test]
    fn standby_round_trip_is_legal() {
        assert!(validate_transition(Paused, Standby).is_ok());
        assert!(validate_transition(Standby, Paused).is_ok());
    }

    #[test]
    fn shutdown_reachable_from_running_and_paused() {
        assert!(validate_transition(Running, Shutdown).is_ok());
        assert!(validate_transition(Paused, Shutdown).is_ok());
    }

    #[test]
    fn stopped_reachable_from_any_state() {
        for s in [Stopped, Created, Running, Paused, Shutdown, Standby] {
            assert!(validate_transition(s, Stopped).is_ok(), "{s} -> Stopped should be legal");
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(validate_transition(Created, Paused).is_err());
        assert!(validate_transition(Standby, Running).is_err());
        assert!(validate_transition(Shutdown, Running).is_err());
        assert!(validate_transition(Stopped, Running).is_err());
    }

    #[test]
    fn no_transition_outside_the_diagram_is_ever_valid() {
        let states = [Stopped, Created, Running, Paused, Shutdown, Standby];
        let legal: Vec<(InstanceStatus, InstanceStatus)> = vec![
            (Stopped, Created),
            (Created, Running),
            (Running, Paused),
            (Paused, Running),
            (Running, Shutdown),
            (Paused, Shutdown),
            (Paused, Standby),
            (Standby, Paused),
        ];
        for &from in &states {
            for &to in &states {
                let should_be_ok = to == Stopped || legal.contains(&(from, to));
                assert_eq!(validate_transition(from, to).is_ok(), should_be_ok, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn instance_json_roundtrips() {
        let inst = Instance {
            id: "3f9a2c1e4b7d0a55c2e1".into(),
            name: "web-1".into(),
            image_ref: "library/alpine@sha256:abc".into(),
            resources: ResourceShape {
                vcpus: 2,
                memory_bytes: 512 * 1024 * 1024,
                hotplug_memory_bytes: 0,
                overlay_bytes: 1024 * 1024 * 1024,
            },
            net: Some(InstanceNet {
                network: "default".into(),
                ip: "192.168.100.5".into(),
                mac: "02:fc:3f:9a:2c:1e".into(),
                tap_device: "tap-3f9a2c1e".into(),
            }),
            status: InstanceStatus::Running,
            vsock_cid: 42,
            socket_path: "/var/lib/vmkit/guests/3f9a2c1e4b7d0a55c2e1/sock".into(),
            volumes: BTreeMap::new(),
            devices: vec![],
            created_at: "2026-07-30T00:00:00Z".into(),
            updated_at: "2026-07-30T00:00:00Z".into(),
        };
        let json = serde_json::to_string(&inst).unwrap();
        let parsed: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, inst.id);
        assert_eq!(parsed.status, InstanceStatus::Running);
        assert_eq!(parsed.net.unwrap().ip, "192.168.100.5");
    }

    #[test]
    fn instance_without_net_or_volumes_deserializes() {
        let json = r#"{
            "id": "abc", "name": "n", "image_ref": "r",
            "resources": {"vcpus":1,"memory_bytes":1,"hotplug_memory_bytes":0,"overlay_bytes":0},
            "net": null, "status": "stopped", "vsock_cid": 3,
            "socket_path": "/x", "created_at": "t", "updated_at": "t"
        }"#;
        let inst: Instance = serde_json::from_str(json).unwrap();
        assert!(inst.net.is_none());
        assert!(inst.volumes.is_empty());
        assert!(inst.devices.is_empty());
    }
}
