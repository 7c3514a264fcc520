//! Bluetooth short UUID handling.
//!
//! Assigned numbers are often carried as 16 or 32 bit strings ("180F",
//! "0000FE9F"); they map onto the Bluetooth base UUID.

use serde::de::Error;
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805F9B34FB";

/// Expands a short or full UUID string into a full `Uuid`.
pub fn expand(uuid: &str) -> Option<Uuid> {
    let uuid = uuid.trim();
    if uuid.len() <= 8 {
        if uuid.is_empty() || !uuid.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        return Uuid::parse_str(&format!("{:0>8}{}", uuid, BASE_UUID_SUFFIX))
            .ok();
    }

    Uuid::parse_str(uuid).ok()
}

/// Builds the full UUID for a 16 bit assigned number.
pub const fn from_u16(short: u16) -> Uuid {
    Uuid::from_u128(
        ((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB,
    )
}

/// Deserializes a list of short or full UUID strings.
pub fn deserialize_uuids<'de, D>(deserializer: D) -> Result<Vec<Uuid>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|raw| {
            expand(raw).ok_or_else(|| D::Error::custom(format!("invalid uuid {}", raw)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_short() {
        let battery =
            Uuid::parse_str("0000180f-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(expand("180F"), Some(battery));
        assert_eq!(expand("0000180F"), Some(battery));
        assert_eq!(from_u16(0x180F), battery);
    }

    #[test]
    fn test_expand_full_and_invalid() {
        let full = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
        assert_eq!(expand(full), Uuid::parse_str(full).ok());
        assert_eq!(expand(""), None);
        assert_eq!(expand("18ZZ"), None);
        assert_eq!(expand("not-a-uuid-at-all"), None);
    }
}
