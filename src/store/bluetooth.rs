//! Bluetooth feature: radio state, discovered advertisements and the devices
//! picked by the page.

use std::sync::Arc;

use futures::StreamExt;
use log::{info, warn};
use serde::Serialize;
use uuid::Uuid;

use super::identified::IdentifiedVec;
use super::{Effect, Reducer};
use crate::ble::{Advertisement, RadioState, ScanFilter};
use crate::bridge::{JsBridge, JsBridgeAction};
use crate::central_client::{BluetoothDevice, CentralManagerClient};
use crate::error::BleError;

const RADIO_STATE: &str = "ble-state";
const SCAN: &str = "scan";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub radio_state: RadioState,
    pub devices: IdentifiedVec<BluetoothDevice>,
    pub advertisements: IdentifiedVec<Advertisement>,
}

#[derive(Debug)]
pub enum Action {
    // radio callbacks
    ManagerStateChanged(RadioState),
    AdvertisementReceived(Advertisement),
    DeviceConnected(BluetoothDevice),
    DeviceDisconnected(BluetoothDevice),
    ConnectionFailed(Uuid, BleError),
    DeviceSelected(BluetoothDevice),

    // requests from the page
    RequestDevice(ScanFilter),
    SelectDevice(Advertisement),
    CancelDeviceRequest,
    ClearAdvertisements,

    ConnectDevice(Uuid),

    StartBluetooth,
    StopBluetooth,
}

pub struct Bluetooth {
    client: Arc<dyn CentralManagerClient>,
    bridge: Arc<dyn JsBridge>,
}

impl Bluetooth {
    pub fn new(
        client: Arc<dyn CentralManagerClient>, bridge: Arc<dyn JsBridge>,
    ) -> Self {
        Self { client, bridge }
    }
}

impl Reducer for Bluetooth {
    type State = State;
    type Action = Action;

    fn reduce(&self, state: &mut State, action: Action) -> Effect<Action> {
        match action {
            Action::ManagerStateChanged(radio_state) => {
                state.radio_state = radio_state;
                Effect::none()
            }
            Action::AdvertisementReceived(advertisement) => {
                state.advertisements.update_or_append(advertisement);
                Effect::none()
            }
            Action::DeviceConnected(device) | Action::DeviceDisconnected(device) => {
                state.devices.update_or_append(device);
                Effect::none()
            }
            Action::ConnectionFailed(id, err) => {
                warn!("Connection to {} failed: {}", id, err);
                Effect::none()
            }
            Action::DeviceSelected(device) => {
                state.devices.update_or_append(device.clone());
                let bridge = self.bridge.clone();
                Effect::run(move |_| async move {
                    bridge.send(JsBridgeAction::DidSelectDevice(device));
                })
            }
            Action::ClearAdvertisements => {
                state.advertisements.remove_all();
                Effect::none()
            }

            Action::RequestDevice(filter) => {
                let client = self.client.clone();
                Effect::run(move |send| async move {
                    let mut advertisements = client.start_scanning(filter).await;
                    while let Some(advertisement) = advertisements.next().await {
                        send.send(Action::AdvertisementReceived(advertisement));
                    }
                    send.send(Action::ClearAdvertisements);
                })
                .cancellable(SCAN)
            }
            Action::SelectDevice(advertisement) => {
                let client = self.client.clone();
                Effect::run(move |send| async move {
                    match client.stop_scanning(Some(advertisement)).await {
                        Some(device) => {
                            send.send(Action::DeviceSelected(device));
                        }
                        None => warn!("Selected device is no longer available"),
                    }
                })
            }
            Action::CancelDeviceRequest => {
                let client = self.client.clone();
                Effect::run(move |_| async move {
                    client.stop_scanning(None).await;
                })
            }

            Action::ConnectDevice(id) => {
                let Some(device) = state.devices.get(&id).cloned() else {
                    warn!("Cannot connect to {}, it was never selected", id);
                    return Effect::none();
                };
                let client = self.client.clone();
                Effect::run(move |send| async move {
                    match client.connect_device(device).await {
                        Ok(device) => send.send(Action::DeviceConnected(device)),
                        Err(err) => send.send(Action::ConnectionFailed(id, err)),
                    };
                })
            }

            Action::StartBluetooth => {
                let client = self.client.clone();
                Effect::run(move |send| async move {
                    let initial = client.enable().await;
                    info!("Bluetooth started, radio is {}", initial);
                    send.send(Action::ManagerStateChanged(initial));

                    let mut states = client.get_state().await;
                    while let Some(radio_state) = states.next().await {
                        send.send(Action::ManagerStateChanged(radio_state));
                    }
                })
                .cancellable(RADIO_STATE)
            }
            Action::StopBluetooth => {
                let client = self.client.clone();
                Effect::merge(vec![
                    Effect::cancel(RADIO_STATE),
                    Effect::run(move |send| async move {
                        client.disable().await;
                        send.send(Action::ManagerStateChanged(RadioState::Unknown));
                    }),
                ])
            }
        }
    }
}
