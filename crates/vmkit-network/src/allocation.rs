//! MAC address generation and bridge-name selection (spec §4.E).

use sha2::{Digest, Sha256};

/// Deterministic, locally-administered unicast MAC (first byte `0x02`)
/// derived from the instance id, so replaying the same instance id always
/// yields the same address.
pub fn generate_mac(instance_id: &str) -> String {
    let digest = Sha256::digest(instance_id.as_bytes());
    format!("02:fc:{:02x}:{:02x}:{:02x}:{:02x}", digest[0], digest[1], digest[2], digest[3])
}

/// Smallest unused `vmbr<N>`, N ≥ 0, given the bridge names already in use.
pub fn next_bridge_name(existing: &[String]) -> String {
    for n in 0.. {
        let candidate = format!("vmbr{n}");
        if !existing.iter().any(|b| b == &candidate) {
            return candidate;
        }
    }
    unreachable!("u32 bridge index space exhausted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_locally_administered_and_deterministic() {
        let a = generate_mac("3f9a2c1e4b7d0a55c2e1");
        let b = generate_mac("3f9a2c1e4b7d0a55c2e1");
        assert_eq!(a, b);
        assert!(a.starts_with("02:fc:"));
        assert_eq!(a.len(), 17);
    }

    #[test]
    fn distinct_ids_usually_produce_distinct_macs() {
        assert_ne!(generate_mac("aaaaaaaa"), generate_mac("bbbbbbbb"));
    }

    #[test]
    fn bridge_name_picks_smallest_unused() {
        assert_eq!(next_bridge_name(&[]), "vmbr0");
        let existing = vec!["vmbr0".to_string(), "vmbr1".to_string()];
        assert_eq!(next_bridge_name(&existing), "vmbr2");
    }

    #[test]
    fn bridge_name_fills_a_gap() {
        let existing = vec!["vmbr0".to_string(), "vmbr2".to_string()];
        assert_eq!(next_bridge_name(&existing), "vmbr1");
    }
}
