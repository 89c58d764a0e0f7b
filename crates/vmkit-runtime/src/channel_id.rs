//! Host-guest channel identity (spec §4.F.6): a deterministic vsock CID
//! derived from the instance id, stable across standby/restore of the same
//! instance.

/// Values 0-2 are reserved by the vsock address family (hypervisor, host,
/// any-cid); channel ids start at 3.
const RESERVED_CIDS: u32 = 3;
const MODULUS: u32 = u32::MAX - 3;

/// `sum = sum*37 + ord(c)` over the first 8 characters of `instance_id`,
/// modulo `2^32 - 4`, then offset past the reserved range.
pub fn derive_channel_id(instance_id: &str) -> u32 {
    let mut sum: u32 = 0;
    for c in instance_id.chars().take(8) {
        sum = sum.wrapping_mul(37).wrapping_add(c as u32);
    }
    (sum % MODULUS) + RESERVED_CIDS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_is_deterministic() {
        let id = "3f9a2c1e4b7d0a55c2e1";
        assert_eq!(derive_channel_id(id), derive_channel_id(id));
    }

    #[test]
    fn channel_id_is_never_reserved() {
        for id in ["00000000", "ffffffff", "abc", ""] {
            assert!(derive_channel_id(id) >= RESERVED_CIDS);
        }
    }

    #[test]
    fn different_prefixes_usually_differ() {
        assert_ne!(derive_channel_id("aaaaaaaa"), derive_channel_id("bbbbbbbb"));
    }

    #[test]
    fn only_first_eight_characters_matter() {
        assert_eq!(
            derive_channel_id("3f9a2c1eXXXXXXXX"),
            derive_channel_id("3f9a2c1eYYYYYYYY")
        );
    }
}
