//! Structural decoding of advertisement payloads.
//!
//! The radio stack hands over an opaque key/value map per scan callback. It is
//! decoded once into `AdvertisementData`; entries that are missing or carry an
//! unexpected value type decode to absent/empty instead of failing.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use uuid::Uuid;

use super::manufacturer_data::ManufacturerData;

pub const KEY_IS_CONNECTABLE: &str = "kCBAdvDataIsConnectable";
pub const KEY_LOCAL_NAME: &str = "kCBAdvDataLocalName";
pub const KEY_MANUFACTURER_DATA: &str = "kCBAdvDataManufacturerData";
pub const KEY_OVERFLOW_SERVICE_UUIDS: &str = "kCBAdvDataOverflowServiceUUIDs";
pub const KEY_SERVICE_DATA: &str = "kCBAdvDataServiceData";
pub const KEY_SERVICE_UUIDS: &str = "kCBAdvDataServiceUUIDs";
pub const KEY_SOLICITED_SERVICE_UUIDS: &str = "kCBAdvDataSolicitedServiceUUIDs";
pub const KEY_TX_POWER_LEVEL: &str = "kCBAdvDataTxPowerLevel";

/// A single untyped value of the advertisement payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvertisementValue {
    Bool(bool),
    Number(i64),
    Text(String),
    Bytes(Vec<u8>),
    Uuids(Vec<Uuid>),
    ServiceData(BTreeMap<Uuid, Vec<u8>>),
}

/// Raw advertisement payload as delivered by the radio stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvertisementPayload(HashMap<String, AdvertisementValue>);

impl AdvertisementPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: AdvertisementValue) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&AdvertisementValue> {
        self.0.get(key)
    }

    pub fn with(mut self, key: &str, value: AdvertisementValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_local_name(self, name: &str) -> Self {
        self.with(KEY_LOCAL_NAME, AdvertisementValue::Text(name.to_string()))
    }

    pub fn with_connectable(self, connectable: bool) -> Self {
        self.with(KEY_IS_CONNECTABLE, AdvertisementValue::Bool(connectable))
    }

    pub fn with_manufacturer_data(self, raw: Vec<u8>) -> Self {
        self.with(KEY_MANUFACTURER_DATA, AdvertisementValue::Bytes(raw))
    }

    pub fn with_service_uuids(self, uuids: Vec<Uuid>) -> Self {
        self.with(KEY_SERVICE_UUIDS, AdvertisementValue::Uuids(uuids))
    }

    pub fn with_tx_power_level(self, level: i64) -> Self {
        self.with(KEY_TX_POWER_LEVEL, AdvertisementValue::Number(level))
    }

    pub fn with_service_data(self, uuid: Uuid, data: Vec<u8>) -> Self {
        let mut this = self;
        let mut entries = match this.0.remove(KEY_SERVICE_DATA) {
            Some(AdvertisementValue::ServiceData(entries)) => entries,
            _ => BTreeMap::new(),
        };
        entries.insert(uuid, data);
        this.with(KEY_SERVICE_DATA, AdvertisementValue::ServiceData(entries))
    }

    fn flag(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            AdvertisementValue::Bool(value) => Some(*value),
            AdvertisementValue::Number(value) => Some(*value != 0),
            _ => None,
        }
    }

    fn number(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            AdvertisementValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    fn text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            AdvertisementValue::Text(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn uuids(&self, key: &str) -> Vec<Uuid> {
        match self.get(key) {
            Some(AdvertisementValue::Uuids(uuids)) => uuids.clone(),
            _ => Vec::new(),
        }
    }
}

/// Decoded advertisement fields. Compared structurally, field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdvertisementData {
    pub is_connectable: Option<bool>,
    pub local_name: Option<String>,
    manufacturer_data: Option<ManufacturerData>,
    pub overflow_service_uuids: Vec<Uuid>,
    pub service_uuids: Vec<Uuid>,
    pub solicited_service_uuids: Vec<Uuid>,
    pub tx_power_level: Option<i32>,
    service_data: BTreeMap<Uuid, Vec<u8>>,
}

impl AdvertisementData {
    pub fn decode(payload: &AdvertisementPayload) -> Self {
        let manufacturer_data = match payload.get(KEY_MANUFACTURER_DATA) {
            Some(AdvertisementValue::Bytes(raw)) => {
                ManufacturerData::from_raw(raw)
            }
            _ => None,
        };

        let service_data = match payload.get(KEY_SERVICE_DATA) {
            Some(AdvertisementValue::ServiceData(entries)) => entries.clone(),
            _ => BTreeMap::new(),
        };

        Self {
            is_connectable: payload.flag(KEY_IS_CONNECTABLE),
            local_name: payload.text(KEY_LOCAL_NAME),
            manufacturer_data,
            overflow_service_uuids: payload.uuids(KEY_OVERFLOW_SERVICE_UUIDS),
            service_uuids: payload.uuids(KEY_SERVICE_UUIDS),
            solicited_service_uuids: payload
                .uuids(KEY_SOLICITED_SERVICE_UUIDS),
            tx_power_level: payload
                .number(KEY_TX_POWER_LEVEL)
                .and_then(|level| i32::try_from(level).ok()),
            service_data,
        }
    }

    /// Manufacturer data, optionally only when it carries company `code`.
    pub fn manufacturer_data(
        &self, code: Option<u16>,
    ) -> Option<&ManufacturerData> {
        self.manufacturer_data
            .as_ref()
            .filter(|data| code.map_or(true, |code| data.code == code))
    }

    pub fn service_data_for(&self, uuid: &Uuid) -> Option<&[u8]> {
        self.service_data.get(uuid).map(Vec::as_slice)
    }

    pub fn service_data(&self) -> &BTreeMap<Uuid, Vec<u8>> {
        &self.service_data
    }
}

/// One scan callback: who advertised, how loud, and what.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Advertisement {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub rssi: i32,
    pub data: AdvertisementData,
}

impl Advertisement {
    pub fn new(
        uuid: Uuid, name: Option<String>, rssi: i32,
        payload: &AdvertisementPayload,
    ) -> Self {
        Self { uuid, name, rssi, data: AdvertisementData::decode(payload) }
    }
}
