//! CPU topology selection (spec §4.F.5): map a requested vCPU count onto a
//! `threads × cores × dies × packages` shape that fits the host.

use serde::{Deserialize, Serialize};

/// Host topology discovered once at startup.
#[derive(Debug, Clone, Copy)]
pub struct HostTopology {
    pub threads_per_core: u32,
    pub cores_per_socket: u32,
    pub sockets: u32,
}

/// CPU topology submitted to the hypervisor. All factors fit in 8 bits and
/// their product always equals the requested vCPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub threads_per_core: u8,
    pub cores_per_die: u8,
    pub dies_per_package: u8,
    pub packages: u8,
}

/// Select a topology for `vcpus`, or `None` to leave it unspecified and let
/// the hypervisor pick its own default shape.
pub fn select_topology(vcpus: u32, host: Option<HostTopology>) -> Option<CpuTopology> {
    if vcpus <= 2 {
        return None;
    }
    let host = host?;
    if host.threads_per_core == 0 {
        return None;
    }

    let threads_per_core = if vcpus % host.threads_per_core == 0 { host.threads_per_core } else { 1 };

    let cores_total = vcpus / threads_per_core;
    if cores_total * threads_per_core != vcpus {
        return None;
    }

    // Fill one socket fully before spilling into the next, mimicking the host.
    let cores_per_socket_cap = if threads_per_core == host.threads_per_core && host.cores_per_socket > 0 {
        host.cores_per_socket
    } else {
        cores_total
    };
    let packages = cores_total.div_ceil(cores_per_socket_cap).max(1);
    let cores_per_die = cores_total.div_ceil(packages);

    if cores_per_die * packages != cores_total {
        return None;
    }

    let fits_u8 = |v: u32| v <= u8::MAX as u32;
    if !(fits_u8(threads_per_core) && fits_u8(cores_per_die) && fits_u8(packages)) {
        return None;
    }

    Some(CpuTopology {
        threads_per_core: threads_per_core as u8,
        cores_per_die: cores_per_die as u8,
        dies_per_package: 1,
        packages: packages as u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_vcpu_counts_are_unspecified() {
        let host = HostTopology { threads_per_core: 2, cores_per_socket: 8, sockets: 1 };
        assert!(select_topology(1, Some(host)).is_none());
        assert!(select_topology(2, Some(host)).is_none());
    }

    #[test]
    fn unknown_host_is_unspecified() {
        assert!(select_topology(8, None).is_none());
    }

    #[test]
    fn topology_product_always_equals_vcpus() {
        let host = HostTopology { threads_per_core: 2, cores_per_socket: 8, sockets: 2 };
        for vcpus in [3, 4, 7, 8, 16, 17, 32] {
            if let Some(t) = select_topology(vcpus, Some(host)) {
                let product = t.threads_per_core as u32
                    * t.cores_per_die as u32
                    * t.dies_per_package as u32
                    * t.packages as u32;
                assert_eq!(product, vcpus, "mismatch for {vcpus} vcpus: {t:?}");
            }
        }
    }

    #[test]
    fn divisible_by_host_threads_prefers_host_threads_per_core() {
        let host = HostTopology { threads_per_core: 2, cores_per_socket: 8, sockets: 2 };
        let t = select_topology(8, Some(host)).unwrap();
        assert_eq!(t.threads_per_core, 2);
    }

    #[test]
    fn not_divisible_falls_back_to_single_thread() {
        let host = HostTopology { threads_per_core: 2, cores_per_socket: 8, sockets: 2 };
        let t = select_topology(7, Some(host)).unwrap();
        assert_eq!(t.threads_per_core, 1);
    }
}
