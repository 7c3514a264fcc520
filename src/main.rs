use std::sync::Arc;
use std::time::Duration;

use ble_event_bridge::ble::RadioState;
use ble_event_bridge::bridge::WebViewBridge;
use ble_event_bridge::central_client::LiveCentralClient;
use ble_event_bridge::config::{AppConfig, CONFIG_FILE};
use ble_event_bridge::error::Result;
use ble_event_bridge::store::bluetooth::{Action, Bluetooth, State};
use ble_event_bridge::store::Store;
use log::info;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tokio::time::timeout;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(not(feature = "bluez"))]
fn central_client(config: &AppConfig) -> LiveCentralClient {
    use ble_event_bridge::ble::sim_central::SimulatedCentral;

    let (central, controller) = SimulatedCentral::auto_respond();
    tokio::spawn(demo::simulate_devices(controller));

    LiveCentralClient::new(
        central,
        config.session.clone(),
        config.request_buffer_size,
    )
}

#[cfg(feature = "bluez")]
fn central_client(config: &AppConfig) -> LiveCentralClient {
    use ble_event_bridge::ble::bluez::BluezCentral;

    LiveCentralClient::new(
        BluezCentral::new(),
        config.session.clone(),
        config.request_buffer_size,
    )
}

#[cfg(not(feature = "bluez"))]
mod demo {
    use std::time::Duration;

    use ble_event_bridge::ble::advertisement::AdvertisementPayload;
    use ble_event_bridge::ble::bt_uuid;
    use ble_event_bridge::ble::sim_central::SimController;
    use ble_event_bridge::ble::CharacteristicId;
    use log::debug;
    use uuid::Uuid;

    /// Two battery powered sensors advertising every half second.
    pub async fn simulate_devices(mut controller: SimController) {
        let battery = bt_uuid::from_u16(0x180F);
        let level = CharacteristicId {
            service: battery,
            uuid: bt_uuid::from_u16(0x2A19),
        };

        let sensors = [("Thermo", Uuid::new_v4(), -48), ("Hygro", Uuid::new_v4(), -71)];
        for (name, id, _) in sensors {
            controller.add_device(id, name).set_value(level, vec![87]);
        }

        let mut ticks = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    for (name, id, rssi) in sensors {
                        let payload = AdvertisementPayload::new()
                            .with_local_name(name)
                            .with_connectable(true)
                            .with_service_uuids(vec![battery])
                            .with_manufacturer_data(vec![0x4C, 0x00, 0x02, 0x15]);
                        controller.advertise(id, &payload, rssi);
                    }
                }
                Some(request) = controller.next_request() => {
                    debug!("Radio got {:?}", request);
                }
            }
        }
    }
}

async fn wait_for(
    states: &mut watch::Receiver<State>, what: &str,
    done: impl FnMut(&State) -> bool,
) -> Result<State> {
    info!("Waiting for {}", what);
    let state = timeout(STEP_TIMEOUT, states.wait_for(done)).await??.clone();
    Ok(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    info!("Starting ble event bridge");

    let config = AppConfig::load(CONFIG_FILE).await?;

    let client = Arc::new(central_client(&config));
    let bridge = Arc::new(WebViewBridge::with_handler(
        |handler: &str, data: Value| -> Result<()> {
            info!("bridge.call({}, {})", handler, data);
            Ok(())
        },
        &config.bridge.device_selected_handler,
    ));

    let store = Store::new(Bluetooth::new(client, bridge), State::default());
    let mut states = store.subscribe();

    store.send(Action::StartBluetooth);
    wait_for(&mut states, "radio", |s| s.radio_state == RadioState::PoweredOn)
        .await?;

    store.send(Action::RequestDevice(config.scan.clone()));
    let state = wait_for(&mut states, "advertisements", |s| {
        !s.advertisements.is_empty()
    })
    .await?;

    if let Some(closest) = state.advertisements.iter().max_by_key(|a| a.rssi) {
        info!("Selecting {}", closest.uuid);
        let id = closest.uuid;
        store.send(Action::SelectDevice(closest.clone()));
        wait_for(&mut states, "selection", |s| s.devices.get(&id).is_some())
            .await?;

        store.send(Action::ConnectDevice(id));
        wait_for(&mut states, "connection", |s| {
            s.devices
                .get(&id)
                .is_some_and(|d| d.peripheral.connection_state().is_connected())
        })
        .await?;
        info!("Connected to {}", id);
    }

    info!("Service ready. Press enter to quit.");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let _ = lines.next_line().await;

    store.send(Action::StopBluetooth);
    wait_for(&mut states, "shutdown", |s| s.radio_state == RadioState::Unknown)
        .await?;

    info!("ble event bridge stopped");

    Ok(())
}
