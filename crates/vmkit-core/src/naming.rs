use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::error::{Error, Result};

const SUBSYSTEM: &str = "naming";

fn network_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap())
}

/// Validate a network name: `[a-z0-9]([a-z0-9-]*[a-z0-9])?`, length <= 63
/// (spec §3 Network).
pub fn validate_network_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(Error::invalid_input(
            SUBSYSTEM,
            format!("network name must be 1-63 characters, got {}", name.len()),
        ));
    }
    if !network_name_re().is_match(name) {
        return Err(Error::invalid_input(
            SUBSYSTEM,
            format!("network name {name:?} must match [a-z0-9]([a-z0-9-]*[a-z0-9])?"),
        ));
    }
    Ok(())
}

/// Validate an instance name: non-empty, reasonable length. Uniqueness is
/// enforced per-network by the caller, not here (spec §3 Instance).
pub fn validate_instance_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 253 {
        return Err(Error::invalid_input(
            SUBSYSTEM,
            format!("instance name must be 1-253 characters, got {}", name.len()),
        ));
    }
    Ok(())
}

/// Generate a time-ordered, globally-unique instance id: 12 hex chars of
/// millisecond epoch timestamp followed by 8 hex chars of randomness. Purely
/// lowercase hex so the first 8 characters are always a legal TAP-name
/// fragment (spec §4.F.6/§3 NetworkAllocation).
pub fn generate_instance_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let ts_hex = format!("{millis:012x}");
    let rand = uuid::Uuid::new_v4();
    let rand_hex = hex::encode(&rand.as_bytes()[..4]);
    format!("{ts_hex}{rand_hex}")
}

/// TAP device name derived deterministically from an instance id:
/// `tap-<first 8 chars>`, always <= 15 bytes (Linux IFNAMSIZ - 1).
pub fn tap_name(instance_id: &str) -> String {
    let prefix: String = instance_id.chars().take(8).collect::<String>().to_lowercase();
    format!("tap-{prefix}")
}

/// Generate a random build id with the same shape as an instance id.
pub fn generate_build_id() -> String {
    format!("build-{}", generate_instance_id())
}

/// Generate a random image id with the same shape as an instance id.
pub fn generate_image_id() -> String {
    format!("img-{}", generate_instance_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_name_accepts_valid_names() {
        assert!(validate_network_name("default").is_ok());
        assert!(validate_network_name("my-net-1").is_ok());
        assert!(validate_network_name("a").is_ok());
    }

    #[test]
    fn network_name_rejects_invalid_names() {
        assert!(validate_network_name("").is_err());
        assert!(validate_network_name("UPPER").is_err());
        assert!(validate_network_name("-leading").is_err());
        assert!(validate_network_name("trailing-").is_err());
        assert!(validate_network_name("has space").is_err());
        assert!(validate_network_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn instance_id_is_lowercase_hex_20_chars() {
        let id = generate_instance_id();
        assert_eq!(id.len(), 20);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn instance_ids_are_time_ordered_across_calls() {
        let a = generate_instance_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate_instance_id();
        assert!(a < b || a[..12] <= b[..12]);
    }

    #[test]
    fn tap_name_fits_linux_limit() {
        let id = generate_instance_id();
        let name = tap_name(&id);
        assert!(name.len() <= 15, "TAP name too long: {name}");
        assert!(name.starts_with("tap-"));
    }

    #[test]
    fn tap_name_is_deterministic() {
        let id = "3f9a2c1e4b7d0a55c2e1";
        assert_eq!(tap_name(id), "tap-3f9a2c1e");
    }
}
