//! Resource accounting (spec §4.I): host capacity discovery plus
//! oversubscription-ratio admission checks.

use sysinfo::System;

use vmkit_core::config::ResourceConfig;
use vmkit_core::error::{Error, Result};

const SUBSYSTEM: &str = "resources";

/// Host capacity, discovered once at startup.
#[derive(Debug, Clone, Copy)]
pub struct HostCapacity {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    /// Uplink bitrate in bytes/sec; `None` if it could not be determined.
    pub network_bytes_per_sec: Option<u64>,
}

impl HostCapacity {
    /// Discover host capacity via `sysinfo`. Disk and network figures are
    /// best-effort: a host with no attached disks or no NIC still returns a
    /// capacity (zero) rather than failing image/instance admission checks.
    pub fn discover() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let cpus = sys.cpus().len().max(1) as u32;
        let memory_bytes = sys.total_memory();
        let disk_bytes = 0;

        Self { cpus, memory_bytes, disk_bytes, network_bytes_per_sec: None }
    }
}

/// A single instance's contribution to the oversubscription ledger.
#[derive(Debug, Clone, Copy)]
pub struct InstanceFootprint {
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub network_bytes_per_sec: u64,
}

/// Tracks committed usage against effective (capacity × ratio) limits for
/// every Running/Paused/Created/Shutdown instance. Standby instances hold no
/// hypervisor process and contribute nothing.
pub struct ResourceLedger {
    capacity: HostCapacity,
    config: ResourceConfig,
    used_cpus: u32,
    used_memory_bytes: u64,
    used_disk_bytes: u64,
    used_network_bytes_per_sec: u64,
}

impl ResourceLedger {
    pub fn new(capacity: HostCapacity, config: ResourceConfig) -> Self {
        Self {
            capacity,
            config,
            used_cpus: 0,
            used_memory_bytes: 0,
            used_disk_bytes: 0,
            used_network_bytes_per_sec: 0,
        }
    }

    fn effective_cpu_limit(&self) -> f64 {
        self.capacity.cpus as f64 * self.config.cpu_oversubscription
    }

    fn effective_memory_limit(&self) -> f64 {
        self.capacity.memory_bytes as f64 * self.config.memory_oversubscription
    }

    /// `checkResourceAvailability`: fails with *ResourcesExhausted* if adding
    /// `cpus`/`memory_bytes` would push committed usage past either
    /// effective limit.
    pub fn check_availability(&self, cpus: u32, memory_bytes: u64) -> Result<()> {
        let projected_cpus = self.used_cpus as f64 + cpus as f64;
        if projected_cpus > self.effective_cpu_limit() {
            return Err(Error::resources_exhausted(
                SUBSYSTEM,
                format!("cpu request would exceed effective limit of {:.1}", self.effective_cpu_limit()),
            ));
        }

        let projected_memory = self.used_memory_bytes as f64 + memory_bytes as f64;
        if projected_memory > self.effective_memory_limit() {
            return Err(Error::resources_exhausted(
                SUBSYSTEM,
                format!("memory request would exceed effective limit of {:.0} bytes", self.effective_memory_limit()),
            ));
        }

        Ok(())
    }

    /// Commit one instance's footprint after admission succeeds. Network
    /// accounting takes the max of download/upload since both directions
    /// share the physical uplink.
    pub fn add(&mut self, footprint: InstanceFootprint) {
        self.used_cpus += footprint.vcpus;
        self.used_memory_bytes += footprint.memory_bytes;
        self.used_disk_bytes += footprint.disk_bytes;
        self.used_network_bytes_per_sec =
            self.used_network_bytes_per_sec.max(footprint.network_bytes_per_sec);
    }

    pub fn remove(&mut self, footprint: InstanceFootprint) {
        self.used_cpus = self.used_cpus.saturating_sub(footprint.vcpus);
        self.used_memory_bytes = self.used_memory_bytes.saturating_sub(footprint.memory_bytes);
        self.used_disk_bytes = self.used_disk_bytes.saturating_sub(footprint.disk_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity() -> HostCapacity {
        HostCapacity { cpus: 4, memory_bytes: 8 * 1024 * 1024 * 1024, disk_bytes: 0, network_bytes_per_sec: None }
    }

    fn config() -> ResourceConfig {
        ResourceConfig { cpu_oversubscription: 2.0, memory_oversubscription: 1.0, network_oversubscription: 1.0 }
    }

    #[test]
    fn allows_requests_within_oversubscribed_limit() {
        let ledger = ResourceLedger::new(capacity(), config());
        assert!(ledger.check_availability(6, 1024).is_ok());
    }

    #[test]
    fn rejects_cpu_request_beyond_effective_limit() {
        let ledger = ResourceLedger::new(capacity(), config());
        assert!(ledger.check_availability(9, 1024).is_err());
    }

    #[test]
    fn memory_is_not_oversubscribed_by_default() {
        let ledger = ResourceLedger::new(capacity(), config());
        let too_much = capacity().memory_bytes + 1;
        assert!(ledger.check_availability(1, too_much).is_err());
    }

    #[test]
    fn committed_usage_reduces_remaining_headroom() {
        let mut ledger = ResourceLedger::new(capacity(), config());
        ledger.add(InstanceFootprint { vcpus: 6, memory_bytes: 1024, disk_bytes: 0, network_bytes_per_sec: 0 });
        assert!(ledger.check_availability(2, 1).is_ok());
        assert!(ledger.check_availability(3, 1).is_err());
    }

    #[test]
    fn remove_gives_back_headroom() {
        let mut ledger = ResourceLedger::new(capacity(), config());
        let footprint = InstanceFootprint { vcpus: 8, memory_bytes: 1024, disk_bytes: 0, network_bytes_per_sec: 0 };
        ledger.add(footprint);
        assert!(ledger.check_availability(1, 1).is_err());
        ledger.remove(footprint);
        assert!(ledger.check_availability(1, 1).is_ok());
    }
}
