//! In-memory radio stack.
//!
//! `SimulatedCentral` implements `CentralStack` without any hardware. Its
//! `SimController` half plays the radio: it observes the requests the
//! coordinator issues and emits the callbacks a real stack would. With
//! `auto_respond` enabled the simulated stack answers requests by itself,
//! which is what the demo binary runs on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::advertisement::{AdvertisementData, AdvertisementPayload};
use super::hardware::{
    CentralSession, CentralStack, CharacteristicId, Delegate, RadioState,
    ScanFilter, SessionOptions,
};
use super::peripheral::{ConnectionState, Peripheral, PeripheralHandle};
use crate::error::Result;

/// A request the coordinator issued to the simulated stack.
#[derive(Debug, Clone, PartialEq)]
pub enum SimRequest {
    OpenSession(SessionOptions),
    Scan(ScanFilter),
    StopScan,
    Connect(Uuid),
    CancelConnection(Uuid),
    DiscoverServices(Uuid, Option<Vec<Uuid>>),
    DiscoverCharacteristics(Uuid, Uuid, Option<Vec<Uuid>>),
    ReadValue(Uuid, CharacteristicId),
    Close,
}

/// Device living in the simulated radio range.
#[derive(Debug)]
pub struct SimPeripheral {
    identifier: Uuid,
    name: Option<String>,
    state: Mutex<ConnectionState>,
    delegate: Mutex<Option<Delegate>>,
    values: Mutex<HashMap<CharacteristicId, Vec<u8>>>,
}

impl SimPeripheral {
    fn new(identifier: Uuid, name: Option<String>) -> Self {
        Self {
            identifier,
            name,
            state: Mutex::new(ConnectionState::Disconnected),
            delegate: Mutex::new(None),
            values: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_delegate(&self) -> bool {
        self.delegate().is_some()
    }

    /// Value returned when `characteristic` is read in auto respond mode.
    pub fn set_value(&self, characteristic: CharacteristicId, value: Vec<u8>) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(characteristic, value);
        }
    }

    fn value(&self, characteristic: &CharacteristicId) -> Vec<u8> {
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(characteristic).cloned())
            .unwrap_or_default()
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn delegate(&self) -> Option<Delegate> {
        self.delegate.lock().ok().and_then(|delegate| delegate.clone())
    }
}

impl Peripheral for SimPeripheral {
    fn identifier(&self) -> Uuid {
        self.identifier
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().map(|s| *s).unwrap_or(ConnectionState::Unknown)
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn set_delegate(&self, delegate: Option<Delegate>) {
        if let Ok(mut current) = self.delegate.lock() {
            *current = delegate;
        }
    }
}

#[derive(Default)]
struct SimState {
    radio_state: RadioState,
    delegate: Option<Delegate>,
    scanning: Option<ScanFilter>,
    devices: HashMap<Uuid, Arc<SimPeripheral>>,
    auto_respond: bool,
}

type Shared = Arc<Mutex<SimState>>;

fn lock(shared: &Shared) -> MutexGuard<'_, SimState> {
    //a panicking test thread must not take the simulated radio down with it
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn handle(peripheral: &Arc<SimPeripheral>) -> PeripheralHandle {
    peripheral.clone().into()
}

pub struct SimulatedCentral {
    shared: Shared,
    requests: mpsc::UnboundedSender<SimRequest>,
}

impl SimulatedCentral {
    pub fn new() -> (Self, SimController) {
        let shared = Arc::new(Mutex::new(SimState {
            radio_state: RadioState::PoweredOff,
            ..Default::default()
        }));
        let (tx, rx) = mpsc::unbounded_channel();

        let central = Self { shared: shared.clone(), requests: tx };
        (central, SimController { shared, requests: rx })
    }

    /// Simulated stack answering every request on its own, with a powered
    /// on radio.
    pub fn auto_respond() -> (Self, SimController) {
        let (central, controller) = Self::new();
        {
            let mut state = lock(&central.shared);
            state.auto_respond = true;
            state.radio_state = RadioState::PoweredOn;
        }
        (central, controller)
    }
}

impl CentralStack for SimulatedCentral {
    fn open_session(
        &mut self, delegate: Delegate, options: &SessionOptions,
    ) -> Result<Box<dyn CentralSession>> {
        let _ = self.requests.send(SimRequest::OpenSession(options.clone()));

        let radio_state = {
            let mut state = lock(&self.shared);
            if let Some(previous) = state.delegate.replace(delegate.clone()) {
                warn!("Simulated session {} was never closed", previous.session());
            }
            state.radio_state
        };

        if radio_state == RadioState::PoweredOff && options.show_power_alert {
            info!("Bluetooth is powered off, turn it on to discover devices");
        }
        if radio_state != RadioState::Unknown {
            delegate.did_update_state(radio_state);
        }

        Ok(Box::new(SimSession {
            session: delegate.session(),
            shared: self.shared.clone(),
            requests: self.requests.clone(),
        }))
    }
}

struct SimSession {
    session: u64,
    shared: Shared,
    requests: mpsc::UnboundedSender<SimRequest>,
}

impl SimSession {
    fn record(&self, request: SimRequest) {
        debug!("Simulated session {} got {:?}", self.session, request);
        //nobody observing the simulated radio is fine
        let _ = self.requests.send(request);
    }

    fn device(&self, peripheral: &PeripheralHandle) -> Result<Arc<SimPeripheral>> {
        lock(&self.shared)
            .devices
            .get(&peripheral.identifier())
            .cloned()
            .ok_or_else(|| {
                anyhow!("Device {} is out of range", peripheral.identifier())
            })
    }

    fn auto_respond(&self) -> Option<Delegate> {
        let state = lock(&self.shared);
        state.delegate.clone().filter(|_| state.auto_respond)
    }
}

impl CentralSession for SimSession {
    fn radio_state(&self) -> RadioState {
        lock(&self.shared).radio_state
    }

    fn scan(&mut self, filter: &ScanFilter) -> Result<()> {
        {
            let mut state = lock(&self.shared);
            if state.radio_state != RadioState::PoweredOn {
                return Err(anyhow!("Cannot scan, radio is {}", state.radio_state));
            }
            state.scanning = Some(filter.clone());
        }
        self.record(SimRequest::Scan(filter.clone()));
        Ok(())
    }

    fn stop_scan(&mut self) {
        if lock(&self.shared).scanning.take().is_some() {
            self.record(SimRequest::StopScan);
        }
    }

    fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<()> {
        let device = self.device(peripheral)?;
        self.record(SimRequest::Connect(device.identifier));

        device.set_state(ConnectionState::Connecting);
        if let Some(delegate) = self.auto_respond() {
            device.set_state(ConnectionState::Connected);
            delegate.did_connect(handle(&device));
        }
        Ok(())
    }

    fn cancel_connection(&mut self, peripheral: &PeripheralHandle) -> Result<()> {
        let device = self.device(peripheral)?;
        self.record(SimRequest::CancelConnection(device.identifier));

        device.set_state(ConnectionState::Disconnecting);
        if let Some(delegate) = self.auto_respond() {
            device.set_state(ConnectionState::Disconnected);
            delegate.did_disconnect(handle(&device), None);
        }
        Ok(())
    }

    fn discover_services(
        &mut self, peripheral: &PeripheralHandle, services: Option<Vec<Uuid>>,
    ) -> Result<()> {
        let device = self.device(peripheral)?;
        self.record(SimRequest::DiscoverServices(device.identifier, services));

        if self.auto_respond().is_some() {
            if let Some(delegate) = device.delegate() {
                delegate.did_discover_services(handle(&device), None);
            }
        }
        Ok(())
    }

    fn discover_characteristics(
        &mut self, peripheral: &PeripheralHandle, service: Uuid,
        characteristics: Option<Vec<Uuid>>,
    ) -> Result<()> {
        let device = self.device(peripheral)?;
        self.record(SimRequest::DiscoverCharacteristics(
            device.identifier,
            service,
            characteristics,
        ));

        if self.auto_respond().is_some() {
            if let Some(delegate) = device.delegate() {
                delegate.did_discover_characteristics(handle(&device), service, None);
            }
        }
        Ok(())
    }

    fn read_value(
        &mut self, peripheral: &PeripheralHandle,
        characteristic: CharacteristicId,
    ) -> Result<()> {
        let device = self.device(peripheral)?;
        self.record(SimRequest::ReadValue(device.identifier, characteristic));

        if self.auto_respond().is_some() {
            if let Some(delegate) = device.delegate() {
                let value = device.value(&characteristic);
                delegate.did_update_value(handle(&device), characteristic, value, None);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        {
            let mut state = lock(&self.shared);
            let owned = state
                .delegate
                .as_ref()
                .is_some_and(|delegate| delegate.session() == self.session);
            if owned {
                state.delegate = None;
                state.scanning = None;
            }
        }
        self.record(SimRequest::Close);
    }
}

/// The radio side of a `SimulatedCentral`.
pub struct SimController {
    shared: Shared,
    requests: mpsc::UnboundedReceiver<SimRequest>,
}

impl SimController {
    /// Next request issued by the coordinator, in issue order.
    pub async fn next_request(&mut self) -> Option<SimRequest> {
        self.requests.recv().await
    }

    /// Awaits the next request and checks it is `expected`.
    pub async fn expect_request(&mut self, expected: SimRequest) {
        let request = self.next_request().await;
        assert_eq!(request, Some(expected));
    }

    /// Skips requests until `expected` is issued.
    pub async fn wait_for_request(&mut self, expected: SimRequest) {
        while let Some(request) = self.next_request().await {
            if request == expected {
                return;
            }
        }
        panic!("simulated radio closed before {:?}", expected);
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.shared).scanning.is_some()
    }

    pub fn set_radio_state(&self, radio_state: RadioState) {
        let delegate = {
            let mut state = lock(&self.shared);
            state.radio_state = radio_state;
            if radio_state != RadioState::PoweredOn {
                state.scanning = None;
            }
            state.delegate.clone()
        };
        if let Some(delegate) = delegate {
            delegate.did_update_state(radio_state);
        }
    }

    /// Brings a device into range.
    pub fn add_device(&self, id: Uuid, name: &str) -> Arc<SimPeripheral> {
        let device = Arc::new(SimPeripheral::new(id, Some(name.to_string())));
        lock(&self.shared).devices.insert(id, device.clone());
        device
    }

    /// Swaps the object behind `id` for a fresh one, as a radio stack does
    /// after a reset.
    pub fn replace_device(&self, id: Uuid) -> Arc<SimPeripheral> {
        let mut state = lock(&self.shared);
        let name = state.devices.get(&id).and_then(|device| device.name.clone());
        let device = Arc::new(SimPeripheral::new(id, name));
        state.devices.insert(id, device.clone());
        device
    }

    pub fn device(&self, id: &Uuid) -> Option<Arc<SimPeripheral>> {
        lock(&self.shared).devices.get(id).cloned()
    }

    /// Emits an advertisement for `id` when a matching scan is running.
    /// Returns whether it was delivered.
    pub fn advertise(
        &self, id: Uuid, payload: &AdvertisementPayload, rssi: i32,
    ) -> bool {
        let (delegate, device) = {
            let state = lock(&self.shared);
            let Some(filter) = state.scanning.as_ref() else {
                return false;
            };
            if !filter.services.is_empty() {
                let advertised = AdvertisementData::decode(payload).service_uuids;
                if !advertised.iter().any(|uuid| filter.services.contains(uuid)) {
                    return false;
                }
            }
            match (state.delegate.clone(), state.devices.get(&id).cloned()) {
                (Some(delegate), Some(device)) => (delegate, device),
                _ => return false,
            }
        };

        delegate.did_discover(handle(&device), payload, rssi);
        true
    }

    /// Drops the running scan as a radio does when discovery cannot start
    /// after it was requested.
    pub fn fail_scan(&self, error: anyhow::Error) {
        let delegate = {
            let mut state = lock(&self.shared);
            state.scanning = None;
            state.delegate.clone()
        };
        if let Some(delegate) = delegate {
            delegate.did_fail_scan(error);
        }
    }

    fn session_delegate(&self) -> Option<Delegate> {
        lock(&self.shared).delegate.clone()
    }

    pub fn connected(&self, id: Uuid) {
        let Some(device) = self.device(&id) else { return };
        device.set_state(ConnectionState::Connected);
        if let Some(delegate) = self.session_delegate() {
            delegate.did_connect(handle(&device));
        }
    }

    pub fn disconnected(&self, id: Uuid, error: Option<anyhow::Error>) {
        let Some(device) = self.device(&id) else { return };
        device.set_state(ConnectionState::Disconnected);
        if let Some(delegate) = self.session_delegate() {
            delegate.did_disconnect(handle(&device), error);
        }
    }

    pub fn services_discovered(&self, id: Uuid, error: Option<anyhow::Error>) {
        let Some(device) = self.device(&id) else { return };
        if let Some(delegate) = device.delegate() {
            delegate.did_discover_services(handle(&device), error);
        }
    }

    pub fn characteristics_discovered(
        &self, id: Uuid, service: Uuid, error: Option<anyhow::Error>,
    ) {
        let Some(device) = self.device(&id) else { return };
        if let Some(delegate) = device.delegate() {
            delegate.did_discover_characteristics(handle(&device), service, error);
        }
    }

    pub fn value_updated(
        &self, id: Uuid, characteristic: CharacteristicId, value: Vec<u8>,
        error: Option<anyhow::Error>,
    ) {
        let Some(device) = self.device(&id) else { return };
        if let Some(delegate) = device.delegate() {
            delegate.did_update_value(handle(&device), characteristic, value, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::hardware::{DelegateEvent, SessionEvent};

    fn open(
        central: &mut SimulatedCentral, session: u64,
    ) -> (Box<dyn CentralSession>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let delegate = Delegate::new(session, tx);
        let central_session = central
            .open_session(delegate, &SessionOptions::default())
            .unwrap();
        (central_session, rx)
    }

    #[test]
    fn test_open_session_reports_radio_state() {
        let (mut central, _controller) = SimulatedCentral::auto_respond();
        let (session, mut rx) = open(&mut central, 1);

        assert_eq!(session.radio_state(), RadioState::PoweredOn);
        let SessionEvent { session, event } = rx.try_recv().unwrap();
        assert_eq!(session, 1);
        assert!(matches!(
            event,
            DelegateEvent::RadioStateChanged(RadioState::PoweredOn)
        ));
    }

    #[test]
    fn test_scan_needs_powered_radio() {
        let (mut central, controller) = SimulatedCentral::new();
        let (mut session, _rx) = open(&mut central, 1);

        assert!(session.scan(&ScanFilter::default()).is_err());
        controller.set_radio_state(RadioState::PoweredOn);
        assert!(session.scan(&ScanFilter::default()).is_ok());
        assert!(controller.is_scanning());
    }

    #[test]
    fn test_advertise_honours_service_filter() {
        let (mut central, controller) = SimulatedCentral::auto_respond();
        let (mut session, _rx) = open(&mut central, 1);
        let id = Uuid::new_v4();
        controller.add_device(id, "Thermo");
        let battery = crate::ble::bt_uuid::from_u16(0x180F);

        session
            .scan(&ScanFilter { services: vec![battery], allow_duplicates: false })
            .unwrap();

        assert!(!controller.advertise(id, &AdvertisementPayload::new(), -40));
        let payload = AdvertisementPayload::new().with_service_uuids(vec![battery]);
        assert!(controller.advertise(id, &payload, -40));
    }

    #[test]
    fn test_closing_stale_session_keeps_current_delegate() {
        let (mut central, controller) = SimulatedCentral::auto_respond();
        let (mut first, _first_rx) = open(&mut central, 1);
        let (_second, mut second_rx) = open(&mut central, 2);
        second_rx.try_recv().unwrap();

        first.close();
        controller.set_radio_state(RadioState::PoweredOff);

        let SessionEvent { session, .. } = second_rx.try_recv().unwrap();
        assert_eq!(session, 2);
    }

    #[test]
    fn test_auto_respond_connects() {
        let (mut central, controller) = SimulatedCentral::auto_respond();
        let (mut session, mut rx) = open(&mut central, 1);
        rx.try_recv().unwrap();
        let device = controller.add_device(Uuid::new_v4(), "Thermo");

        session.connect(&handle(&device)).unwrap();

        assert_eq!(device.connection_state(), ConnectionState::Connected);
        let SessionEvent { event, .. } = rx.try_recv().unwrap();
        assert!(matches!(event, DelegateEvent::Connected(_)));
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        let (mut central, _controller) = SimulatedCentral::auto_respond();
        let (mut session, _rx) = open(&mut central, 1);
        let stranger = handle(&Arc::new(SimPeripheral::new(Uuid::new_v4(), None)));

        assert!(session.connect(&stranger).is_err());
    }
}
