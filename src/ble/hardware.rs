//! Boundary to the radio stack.
//!
//! A `CentralStack` opens one `CentralSession` at a time and reports back
//! through the single `Delegate` it was handed. The delegate turns every
//! callback into a `DelegateEvent` and forwards it to the coordinator.

use std::fmt;

use log::trace;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use super::advertisement::{Advertisement, AdvertisementPayload};
use super::manufacturer_data::ServiceDataView;
use super::peripheral::PeripheralHandle;
use crate::error::{HardwareError, Result};

/// Power state of the local radio.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum RadioState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RadioState::Unknown => "unknown",
            RadioState::Resetting => "resetting",
            RadioState::Unsupported => "unsupported",
            RadioState::Unauthorized => "unauthorized",
            RadioState::PoweredOff => "powered off",
            RadioState::PoweredOn => "powered on",
        };
        f.write_str(name)
    }
}

/// Scan request parameters. An empty service list scans for everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanFilter {
    /// Accepts short assigned numbers ("180F") as well as full UUIDs.
    #[serde(deserialize_with = "super::bt_uuid::deserialize_uuids")]
    pub services: Vec<Uuid>,
    pub allow_duplicates: bool,
}

/// Options applied when a hardware session is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionOptions {
    /// Let the platform prompt the user when the radio is powered off.
    pub show_power_alert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Everything the radio stack reports, in callback order.
#[derive(Debug, Clone)]
pub enum DelegateEvent {
    RadioStateChanged(RadioState),
    AdvertisementSeen(PeripheralHandle, Advertisement),
    Connected(PeripheralHandle),
    Disconnected(PeripheralHandle, Option<HardwareError>),
    ServicesDiscovered(PeripheralHandle, Option<HardwareError>),
    CharacteristicsDiscovered(PeripheralHandle, Uuid, Option<HardwareError>),
    CharacteristicUpdated(
        PeripheralHandle,
        CharacteristicId,
        Vec<u8>,
        Option<HardwareError>,
    ),
    /// A scan request was accepted but the radio could not start it.
    ScanFailed(HardwareError),
}

impl DelegateEvent {
    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        match self {
            DelegateEvent::RadioStateChanged(_)
            | DelegateEvent::ScanFailed(_) => None,
            DelegateEvent::AdvertisementSeen(peripheral, _)
            | DelegateEvent::Connected(peripheral)
            | DelegateEvent::Disconnected(peripheral, _)
            | DelegateEvent::ServicesDiscovered(peripheral, _)
            | DelegateEvent::CharacteristicsDiscovered(peripheral, _, _)
            | DelegateEvent::CharacteristicUpdated(peripheral, _, _, _) => {
                Some(peripheral)
            }
        }
    }

    pub fn peripheral_id(&self) -> Option<Uuid> {
        self.peripheral().map(PeripheralHandle::identifier)
    }

    /// False only for events scoped to a peripheral other than `target`.
    pub fn concerns(&self, target: Option<Uuid>) -> bool {
        match (target, self.peripheral_id()) {
            (Some(target), Some(id)) => target == id,
            _ => true,
        }
    }
}

pub(crate) type SessionId = u64;

#[derive(Debug)]
pub(crate) struct SessionEvent {
    pub session: SessionId,
    pub event: DelegateEvent,
}

/// Callback sink registered with exactly one hardware session.
#[derive(Clone)]
pub struct Delegate {
    session: SessionId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl fmt::Debug for Delegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delegate").field("session", &self.session).finish()
    }
}

impl Delegate {
    pub(crate) fn new(
        session: SessionId, tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self { session, tx }
    }

    pub(crate) fn session(&self) -> SessionId {
        self.session
    }

    fn emit(&self, event: DelegateEvent) {
        trace!("Delegate {} callback: {:?}", self.session, event);
        //the coordinator is gone, nobody is listening anymore
        let _ = self.tx.send(SessionEvent { session: self.session, event });
    }

    pub fn did_update_state(&self, state: RadioState) {
        self.emit(DelegateEvent::RadioStateChanged(state));
    }

    pub fn did_discover(
        &self, peripheral: PeripheralHandle, payload: &AdvertisementPayload,
        rssi: i32,
    ) {
        let advertisement = Advertisement::new(
            peripheral.identifier(),
            peripheral.name(),
            rssi,
            payload,
        );
        let service_data = advertisement.data.service_data();
        if !service_data.is_empty() {
            trace!(
                "{} advertised {}",
                advertisement.uuid,
                ServiceDataView(service_data)
            );
        }
        self.emit(DelegateEvent::AdvertisementSeen(peripheral, advertisement));
    }

    pub fn did_fail_scan(&self, error: anyhow::Error) {
        self.emit(DelegateEvent::ScanFailed(error.into()));
    }

    pub fn did_connect(&self, peripheral: PeripheralHandle) {
        self.emit(DelegateEvent::Connected(peripheral));
    }

    pub fn did_disconnect(
        &self, peripheral: PeripheralHandle, error: Option<anyhow::Error>,
    ) {
        self.emit(DelegateEvent::Disconnected(
            peripheral,
            error.map(HardwareError::from),
        ));
    }

    pub fn did_discover_services(
        &self, peripheral: PeripheralHandle, error: Option<anyhow::Error>,
    ) {
        self.emit(DelegateEvent::ServicesDiscovered(
            peripheral,
            error.map(HardwareError::from),
        ));
    }

    pub fn did_discover_characteristics(
        &self, peripheral: PeripheralHandle, service: Uuid,
        error: Option<anyhow::Error>,
    ) {
        self.emit(DelegateEvent::CharacteristicsDiscovered(
            peripheral,
            service,
            error.map(HardwareError::from),
        ));
    }

    pub fn did_update_value(
        &self, peripheral: PeripheralHandle, characteristic: CharacteristicId,
        data: Vec<u8>, error: Option<anyhow::Error>,
    ) {
        self.emit(DelegateEvent::CharacteristicUpdated(
            peripheral,
            characteristic,
            data,
            error.map(HardwareError::from),
        ));
    }
}

/// Factory for hardware sessions.
#[cfg_attr(test, automock)]
pub trait CentralStack: Send + 'static {
    /// Creates a session reporting to `delegate`. Only one session is alive
    /// at a time; the previous one is closed before this is called.
    fn open_session(
        &mut self, delegate: Delegate, options: &SessionOptions,
    ) -> Result<Box<dyn CentralSession>>;
}

/// Requests against a live hardware session. Requests are fire-and-forget:
/// their outcome arrives later on the session delegate.
#[cfg_attr(test, automock)]
pub trait CentralSession: Send {
    fn radio_state(&self) -> RadioState;

    /// Starts scanning. A stack that only learns later that the scan could
    /// not start reports it with `Delegate::did_fail_scan`.
    fn scan(&mut self, filter: &ScanFilter) -> Result<()>;

    fn stop_scan(&mut self);

    fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<()>;

    fn cancel_connection(&mut self, peripheral: &PeripheralHandle)
        -> Result<()>;

    fn discover_services(
        &mut self, peripheral: &PeripheralHandle, services: Option<Vec<Uuid>>,
    ) -> Result<()>;

    fn discover_characteristics(
        &mut self, peripheral: &PeripheralHandle, service: Uuid,
        characteristics: Option<Vec<Uuid>>,
    ) -> Result<()>;

    fn read_value(
        &mut self, peripheral: &PeripheralHandle,
        characteristic: CharacteristicId,
    ) -> Result<()>;

    /// Unregisters the delegate and stops any scan. No callback may be
    /// delivered for this session afterwards.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::peripheral::FakePeripheral;
    use std::sync::Arc;

    #[test]
    fn test_events_concern_their_peripheral() {
        let id = Uuid::new_v4();
        let peripheral: PeripheralHandle =
            Arc::new(FakePeripheral::new(id)).into();

        let connected = DelegateEvent::Connected(peripheral);
        assert!(connected.concerns(Some(id)));
        assert!(connected.concerns(None));
        assert!(!connected.concerns(Some(Uuid::new_v4())));

        let radio = DelegateEvent::RadioStateChanged(RadioState::PoweredOn);
        assert_eq!(radio.peripheral_id(), None);
        assert!(radio.concerns(Some(id)));
    }

    #[test]
    fn test_delegate_tags_events_with_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let delegate = Delegate::new(7, tx);
        let peripheral: PeripheralHandle =
            Arc::new(FakePeripheral::named(Uuid::nil(), "Thermo")).into();

        delegate.did_discover(
            peripheral,
            &AdvertisementPayload::new()
                .with_tx_power_level(-4)
                .with_service_data(crate::ble::bt_uuid::from_u16(0x180F), vec![0x57]),
            -70,
        );

        let SessionEvent { session, event } = rx.try_recv().unwrap();
        assert_eq!(session, 7);
        match event {
            DelegateEvent::AdvertisementSeen(_, advertisement) => {
                assert_eq!(advertisement.name.as_deref(), Some("Thermo"));
                assert_eq!(advertisement.rssi, -70);
                assert_eq!(advertisement.data.tx_power_level, Some(-4));
                assert_eq!(
                    ServiceDataView(advertisement.data.service_data()).to_string(),
                    "[ServiceData(UUID=0000180F-0000-1000-8000-00805F9B34FB, Data=[57])]"
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_scan_filter_from_json() {
        let filter: ScanFilter = serde_json::from_str(
            r#"{"services": ["0000180f-0000-1000-8000-00805f9b34fb"]}"#,
        )
        .unwrap();
        assert_eq!(filter.services.len(), 1);
        assert!(!filter.allow_duplicates);
    }

    #[test]
    fn test_scan_filter_short_uuids() {
        let filter: ScanFilter =
            serde_json::from_str(r#"{"services": ["180F"], "allowDuplicates": true}"#)
                .unwrap();
        assert_eq!(filter.services, vec![crate::ble::bt_uuid::from_u16(0x180F)]);
        assert!(filter.allow_duplicates);

        assert!(serde_json::from_str::<ScanFilter>(r#"{"services": ["18ZZ"]}"#).is_err());
    }
}
