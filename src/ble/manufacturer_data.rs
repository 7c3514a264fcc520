//! Manufacturer specific advertisement data: a 2 byte little-endian company
//! code followed by an opaque payload.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ManufacturerData {
    pub code: u16,
    pub data: Vec<u8>,
}

impl ManufacturerData {
    /// Decodes the company code and trailing payload.
    ///
    /// Returns `None` when `raw` is shorter than the 2 byte company code.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        match raw {
            [lo, hi, rest @ ..] => Some(Self {
                code: u16::from_le_bytes([*lo, *hi]),
                data: rest.to_vec(),
            }),
            _ => None,
        }
    }
}

pub(crate) fn hex_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for ManufacturerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ManufacturerData(Code=0x{:04X}, Data=[{}])",
            self.code,
            hex_bytes(&self.data)
        )
    }
}

/// Borrowed view used to log per-service advertisement data.
pub struct ServiceDataView<'a>(pub &'a BTreeMap<Uuid, Vec<u8>>);

impl fmt::Display for ServiceDataView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .0
            .iter()
            .map(|(uuid, data)| {
                format!(
                    "ServiceData(UUID={}, Data=[{}])",
                    uuid.hyphenated().to_string().to_uppercase(),
                    hex_bytes(data)
                )
            })
            .collect::<Vec<_>>();

        write!(f, "[{}]", entries.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_buffers_decode_to_nothing() {
        assert_eq!(ManufacturerData::from_raw(&[]), None);
        assert_eq!(ManufacturerData::from_raw(&[0x4C]), None);
    }

    #[test]
    fn test_code_is_little_endian() {
        let decoded = ManufacturerData::from_raw(&[0x4C, 0x00]).unwrap();
        assert_eq!(decoded.code, 0x004C);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_trailing_bytes_are_kept_verbatim() {
        for (code, payload) in [
            (0x0000u16, vec![]),
            (0x004C, vec![0x02, 0x15]),
            (0xFFFF, vec![0x00; 27]),
            (0x0590, (0u8..=255).collect::<Vec<_>>()),
        ] {
            let mut raw = code.to_le_bytes().to_vec();
            raw.extend_from_slice(&payload);

            let decoded = ManufacturerData::from_raw(&raw).unwrap();
            assert_eq!(decoded.code, code);
            assert_eq!(decoded.data, payload);
        }
    }

    #[test]
    fn test_display() {
        let decoded =
            ManufacturerData::from_raw(&[0x4C, 0x00, 0x02, 0x15, 0xaa])
                .unwrap();
        assert_eq!(
            decoded.to_string(),
            "ManufacturerData(Code=0x004C, Data=[02 15 AA])"
        );
    }

    #[test]
    fn test_service_data_display() {
        let mut map = BTreeMap::new();
        map.insert(
            Uuid::parse_str("0000180f-0000-1000-8000-00805f9b34fb").unwrap(),
            vec![0x64],
        );
        assert_eq!(
            ServiceDataView(&map).to_string(),
            "[ServiceData(UUID=0000180F-0000-1000-8000-00805F9B34FB, Data=[64])]"
        );
    }
}
