//! Radio stack backed by BlueZ over D-Bus.
//!
//! Every session runs its own task holding the adapter. Session requests are
//! queued to that task and answered through the session delegate, or
//! through the peripheral's own delegate for per-peripheral callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent,
    DeviceProperty, DiscoveryFilter, DiscoveryTransport,
};
use futures::{stream::BoxStream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::advertisement::AdvertisementPayload;
use super::hardware::{
    CentralSession, CentralStack, CharacteristicId, Delegate, RadioState,
    ScanFilter, SessionOptions,
};
use super::peripheral::{ConnectionState, Peripheral, PeripheralHandle};
use crate::error::Result;

/// Identifier of the device at `addr`: the address in the last six bytes.
pub fn address_uuid(addr: Address) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[10..].copy_from_slice(&addr.0);
    Uuid::from_bytes(bytes)
}

pub struct BluezPeripheral {
    identifier: Uuid,
    device: Device,
    name: Mutex<Option<String>>,
    state: Mutex<ConnectionState>,
    delegate: Mutex<Option<Delegate>>,
}

impl BluezPeripheral {
    fn new(device: Device) -> Self {
        Self {
            identifier: address_uuid(device.address()),
            device,
            name: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            delegate: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// Moves the peripheral to `Disconnected`. Only the caller that makes
    /// the transition gets `true` and reports it.
    fn settle_disconnected(&self) -> bool {
        settle_disconnected(&self.state)
    }

    fn delegate(&self) -> Option<Delegate> {
        self.delegate.lock().ok().and_then(|delegate| delegate.clone())
    }
}

impl Peripheral for BluezPeripheral {
    fn identifier(&self) -> Uuid {
        self.identifier
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().map(|s| *s).unwrap_or(ConnectionState::Unknown)
    }

    fn name(&self) -> Option<String> {
        self.name.lock().ok().and_then(|name| name.clone())
    }

    fn set_delegate(&self, delegate: Option<Delegate>) {
        if let Ok(mut current) = self.delegate.lock() {
            *current = delegate;
        }
    }
}

#[derive(Debug)]
enum BluezCmd {
    Scan(ScanFilter),
    StopScan,
    Connect(Uuid),
    CancelConnection(Uuid),
    DiscoverServices(Uuid),
    DiscoverCharacteristics(Uuid, Uuid),
    ReadValue(Uuid, CharacteristicId),
}

#[derive(Default)]
pub struct BluezCentral;

impl BluezCentral {
    pub fn new() -> Self {
        Self
    }
}

impl CentralStack for BluezCentral {
    fn open_session(
        &mut self, delegate: Delegate, options: &SessionOptions,
    ) -> Result<Box<dyn CentralSession>> {
        let runtime = tokio::runtime::Handle::try_current()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (drop_tx, drop_rx) = oneshot::channel();
        let radio_state = Arc::new(Mutex::new(RadioState::Unknown));

        runtime.spawn(run_session(
            delegate,
            options.clone(),
            radio_state.clone(),
            cmd_rx,
            drop_rx,
        ));

        Ok(Box::new(BluezSession { cmd_tx, radio_state, drop_tx: Some(drop_tx) }))
    }
}

struct BluezSession {
    cmd_tx: mpsc::UnboundedSender<BluezCmd>,
    radio_state: Arc<Mutex<RadioState>>,
    drop_tx: Option<oneshot::Sender<()>>,
}

impl BluezSession {
    fn send(&self, cmd: BluezCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|e| anyhow!("BlueZ session is closed: {:?}", e.0))
    }
}

impl CentralSession for BluezSession {
    fn radio_state(&self) -> RadioState {
        self.radio_state.lock().map(|s| *s).unwrap_or_default()
    }

    fn scan(&mut self, filter: &ScanFilter) -> Result<()> {
        self.send(BluezCmd::Scan(filter.clone()))
    }

    fn stop_scan(&mut self) {
        let _ = self.send(BluezCmd::StopScan);
    }

    fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<()> {
        self.send(BluezCmd::Connect(peripheral.identifier()))
    }

    fn cancel_connection(&mut self, peripheral: &PeripheralHandle) -> Result<()> {
        self.send(BluezCmd::CancelConnection(peripheral.identifier()))
    }

    //BlueZ resolves every service on connection, the filters only matter
    //to stacks that discover lazily
    fn discover_services(
        &mut self, peripheral: &PeripheralHandle, _services: Option<Vec<Uuid>>,
    ) -> Result<()> {
        self.send(BluezCmd::DiscoverServices(peripheral.identifier()))
    }

    fn discover_characteristics(
        &mut self, peripheral: &PeripheralHandle, service: Uuid,
        _characteristics: Option<Vec<Uuid>>,
    ) -> Result<()> {
        self.send(BluezCmd::DiscoverCharacteristics(
            peripheral.identifier(),
            service,
        ))
    }

    fn read_value(
        &mut self, peripheral: &PeripheralHandle,
        characteristic: CharacteristicId,
    ) -> Result<()> {
        self.send(BluezCmd::ReadValue(peripheral.identifier(), characteristic))
    }

    fn close(&mut self) {
        self.drop_tx.take();
    }
}

enum Step {
    Stop,
    Cmd(BluezCmd),
    Discovered(Option<AdapterEvent>),
    Adapter(AdapterEvent),
}

struct BluezTask {
    adapter: Adapter,
    delegate: Delegate,
    radio_state: Arc<Mutex<RadioState>>,
    peripherals: HashMap<Uuid, Arc<BluezPeripheral>>,
    discovery: Option<BoxStream<'static, AdapterEvent>>,
}

async fn run_session(
    delegate: Delegate, options: SessionOptions,
    radio_state: Arc<Mutex<RadioState>>,
    mut cmd_rx: mpsc::UnboundedReceiver<BluezCmd>,
    mut drop_rx: oneshot::Receiver<()>,
) {
    let adapter = match open_adapter().await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("No usable Bluetooth adapter: {:?}", e);
            if let Ok(mut state) = radio_state.lock() {
                *state = RadioState::Unsupported;
            }
            delegate.did_update_state(RadioState::Unsupported);
            return;
        }
    };

    let mut adapter_events = match adapter.events().await {
        Ok(events) => events.boxed(),
        Err(e) => {
            error!("Error subscribing to adapter events: {:?}", e);
            futures::stream::pending().boxed()
        }
    };

    let mut task = BluezTask {
        adapter,
        delegate,
        radio_state,
        peripherals: HashMap::new(),
        discovery: None,
    };

    let powered = task.adapter.is_powered().await.unwrap_or(false);
    if !powered && options.show_power_alert {
        info!("Bluetooth adapter {} is powered off", task.adapter.name());
    }
    task.set_powered(powered);

    loop {
        let discovery = async {
            match task.discovery.as_mut() {
                Some(events) => events.next().await,
                None => std::future::pending().await,
            }
        };

        let step = tokio::select! {
            _ = &mut drop_rx => Step::Stop,
            cmd = cmd_rx.recv() => cmd.map_or(Step::Stop, Step::Cmd),
            event = discovery => Step::Discovered(event),
            Some(event) = adapter_events.next() => Step::Adapter(event),
        };

        match step {
            Step::Stop => break,
            Step::Cmd(cmd) => task.handle_cmd(cmd).await,
            Step::Discovered(Some(event)) => task.handle_discovery(event).await,
            Step::Discovered(None) => {
                task.discovery = None;
                task.delegate.did_fail_scan(anyhow!("BlueZ discovery ended"));
            }
            Step::Adapter(AdapterEvent::PropertyChanged(
                AdapterProperty::Powered(powered),
            )) => task.set_powered(powered),
            Step::Adapter(_) => {}
        }
    }

    info!("BlueZ session stopped");
}

fn settle_disconnected(state: &Mutex<ConnectionState>) -> bool {
    match state.lock() {
        Ok(mut current) if *current != ConnectionState::Disconnected => {
            *current = ConnectionState::Disconnected;
            true
        }
        _ => false,
    }
}

async fn open_adapter() -> Result<Adapter> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    info!("Using Bluetooth adapter {}", adapter.name());
    Ok(adapter)
}

async fn advertisement_payload(device: &Device) -> bluer::Result<AdvertisementPayload> {
    let mut payload = AdvertisementPayload::new();

    if let Some(name) = device.name().await? {
        payload = payload.with_local_name(&name);
    }
    if let Some(data) = device.manufacturer_data().await? {
        if let Some((code, data)) = data.into_iter().min_by_key(|(code, _)| *code) {
            let mut raw = code.to_le_bytes().to_vec();
            raw.extend(data);
            payload = payload.with_manufacturer_data(raw);
        }
    }
    if let Some(uuids) = device.uuids().await? {
        payload = payload.with_service_uuids(uuids.into_iter().collect());
    }
    if let Some(service_data) = device.service_data().await? {
        for (uuid, data) in service_data {
            payload = payload.with_service_data(uuid, data);
        }
    }
    if let Some(level) = device.tx_power().await? {
        payload = payload.with_tx_power_level(i64::from(level));
    }

    Ok(payload)
}

impl BluezTask {
    fn set_powered(&self, powered: bool) {
        let state = if powered {
            RadioState::PoweredOn
        } else {
            RadioState::PoweredOff
        };
        if let Ok(mut current) = self.radio_state.lock() {
            *current = state;
        }
        self.delegate.did_update_state(state);
    }

    fn peripheral(&self, id: &Uuid) -> Result<Arc<BluezPeripheral>> {
        self.peripherals
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("Peripheral {} was never discovered", id))
    }

    async fn handle_discovery(&mut self, event: AdapterEvent) {
        let AdapterEvent::DeviceAdded(addr) = event else {
            return;
        };

        let device = match self.adapter.device(addr) {
            Ok(device) => device,
            Err(e) => {
                warn!("Device {} vanished: {:?}", addr, e);
                return;
            }
        };

        //BlueZ keeps one object per address, so a known address always maps
        //to the same peripheral and the coordinator never sees a replacement
        let peripheral = self
            .peripherals
            .entry(address_uuid(addr))
            .or_insert_with(|| Arc::new(BluezPeripheral::new(device.clone())))
            .clone();

        let payload = match advertisement_payload(&device).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Error reading advertisement of {}: {:?}", addr, e);
                return;
            }
        };
        if let Ok(mut name) = peripheral.name.lock() {
            *name = device.name().await.ok().flatten();
        }
        let rssi = device.rssi().await.ok().flatten().unwrap_or(0);

        self.delegate.did_discover(peripheral.into(), &payload, i32::from(rssi));
    }

    async fn handle_cmd(&mut self, cmd: BluezCmd) {
        debug!("BlueZ request {:?}", cmd);
        let outcome = match cmd {
            BluezCmd::Scan(filter) => {
                if let Err(e) = self.scan(filter).await {
                    error!("Error starting discovery: {:?}", e);
                    self.delegate.did_fail_scan(e);
                }
                Ok(())
            }
            BluezCmd::StopScan => {
                self.discovery = None;
                Ok(())
            }
            BluezCmd::Connect(id) => self.connect(id),
            BluezCmd::CancelConnection(id) => self.disconnect(id),
            BluezCmd::DiscoverServices(id) => self.discover_services(id),
            BluezCmd::DiscoverCharacteristics(id, service) => {
                self.discover_characteristics(id, service)
            }
            BluezCmd::ReadValue(id, characteristic) => {
                self.read_value(id, characteristic)
            }
        };

        if let Err(e) = outcome {
            error!("BlueZ request failed: {:?}", e);
        }
    }

    async fn scan(&mut self, filter: ScanFilter) -> Result<()> {
        self.discovery = None;
        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                uuids: filter.services.into_iter().collect(),
                transport: DiscoveryTransport::Le,
                duplicate_data: filter.allow_duplicates,
                ..Default::default()
            })
            .await?;
        self.discovery = Some(self.adapter.discover_devices().await?.boxed());
        Ok(())
    }

    fn connect(&self, id: Uuid) -> Result<()> {
        let peripheral = self.peripheral(&id)?;
        let delegate = self.delegate.clone();
        peripheral.set_state(ConnectionState::Connecting);

        tokio::spawn(async move {
            if let Err(e) = peripheral.device.connect().await {
                peripheral.set_state(ConnectionState::Disconnected);
                delegate.did_disconnect(peripheral.into(), Some(e.into()));
                return;
            }

            peripheral.set_state(ConnectionState::Connected);
            delegate.did_connect(peripheral.clone().into());

            //report the link going down, whoever drops it
            let events = match peripheral.device.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Error watching {}: {:?}", id, e);
                    return;
                }
            };
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(
                    false,
                )) = event
                {
                    if peripheral.settle_disconnected() {
                        delegate.did_disconnect(peripheral.clone().into(), None);
                    }
                    break;
                }
            }
        });
        Ok(())
    }

    fn disconnect(&self, id: Uuid) -> Result<()> {
        let peripheral = self.peripheral(&id)?;
        let delegate = self.delegate.clone();
        peripheral.set_state(ConnectionState::Disconnecting);

        tokio::spawn(async move {
            //the link watcher may have reported it already
            let outcome = peripheral.device.disconnect().await;
            if !peripheral.settle_disconnected() {
                return;
            }
            match outcome {
                Ok(()) => {
                    info!("Disconnected from {}", id);
                    delegate.did_disconnect(peripheral.into(), None);
                }
                Err(e) => delegate.did_disconnect(peripheral.into(), Some(e.into())),
            }
        });
        Ok(())
    }

    fn discover_services(&self, id: Uuid) -> Result<()> {
        let peripheral = self.peripheral(&id)?;

        tokio::spawn(async move {
            let Some(delegate) = peripheral.delegate() else { return };
            let error = peripheral.device.services().await.err();
            delegate.did_discover_services(peripheral.into(), error.map(Into::into));
        });
        Ok(())
    }

    fn discover_characteristics(&self, id: Uuid, service: Uuid) -> Result<()> {
        let peripheral = self.peripheral(&id)?;

        tokio::spawn(async move {
            let Some(delegate) = peripheral.delegate() else { return };
            let error = match find_service(&peripheral.device, service).await {
                Ok(service) => service.characteristics().await.err().map(Into::into),
                Err(e) => Some(e),
            };
            delegate.did_discover_characteristics(peripheral.into(), service, error);
        });
        Ok(())
    }

    fn read_value(&self, id: Uuid, characteristic: CharacteristicId) -> Result<()> {
        let peripheral = self.peripheral(&id)?;

        tokio::spawn(async move {
            let Some(delegate) = peripheral.delegate() else { return };
            let (value, error) =
                match read_characteristic(&peripheral.device, characteristic).await {
                    Ok(value) => (value, None),
                    Err(e) => (Vec::new(), Some(e)),
                };
            delegate.did_update_value(peripheral.into(), characteristic, value, error);
        });
        Ok(())
    }
}

async fn find_service(device: &Device, uuid: Uuid) -> Result<bluer::gatt::remote::Service> {
    for service in device.services().await? {
        if service.uuid().await? == uuid {
            return Ok(service);
        }
    }
    Err(anyhow!("Service {} not found", uuid))
}

async fn read_characteristic(
    device: &Device, characteristic: CharacteristicId,
) -> Result<Vec<u8>> {
    let service = find_service(device, characteristic.service).await?;
    for candidate in service.characteristics().await? {
        if candidate.uuid().await? == characteristic.uuid {
            return Ok(candidate.read().await?);
        }
    }
    Err(anyhow!("Characteristic {} not found", characteristic.uuid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_is_settled_once() {
        let state = Mutex::new(ConnectionState::Disconnecting);
        assert!(settle_disconnected(&state));
        //watcher and disconnect request racing for the same transition
        assert!(!settle_disconnected(&state));

        let state = Mutex::new(ConnectionState::Connected);
        assert!(settle_disconnected(&state));
        assert_eq!(*state.lock().unwrap(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_address_uuid_keeps_address_bytes() {
        let addr = Address([0x40, 0xCA, 0x63, 0x45, 0xB9, 0x4A]);
        assert_eq!(
            address_uuid(addr).to_string(),
            "00000000-0000-0000-0000-40ca6345b94a"
        );
    }
}
