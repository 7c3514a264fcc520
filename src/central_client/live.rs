use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use log::{error, info};

use super::{BluetoothDevice, CentralManagerClient};
use crate::ble::{
    Advertisement, BleCoordinator, CentralStack, RadioState, ScanFilter,
    SessionOptions,
};
use crate::error::BleError;

/// Façade over a running `BleCoordinator`.
pub struct LiveCentralClient {
    coordinator: BleCoordinator,
}

impl LiveCentralClient {
    pub fn new(
        stack: impl CentralStack, options: SessionOptions,
        req_buffer_size: usize,
    ) -> Self {
        Self { coordinator: BleCoordinator::new(stack, options, req_buffer_size) }
    }
}

#[async_trait]
impl CentralManagerClient for LiveCentralClient {
    async fn enable(&self) -> RadioState {
        match self.coordinator.enable().await {
            Ok(state) => state,
            Err(e) => {
                error!("Error enabling bluetooth: {:?}", e);
                RadioState::Unsupported
            }
        }
    }

    async fn disable(&self) {
        self.coordinator.disable().await;
    }

    async fn get_state(&self) -> BoxStream<'static, RadioState> {
        self.coordinator.radio_states().await
    }

    async fn start_scanning(
        &self, filter: ScanFilter,
    ) -> BoxStream<'static, Advertisement> {
        self.coordinator
            .scan(filter)
            .await
            .map(|(_, advertisement)| advertisement)
            .boxed()
    }

    async fn stop_scanning(
        &self, selected: Option<Advertisement>,
    ) -> Option<BluetoothDevice> {
        //resolve before stopping, the selection must come from this scan
        let device = match selected {
            Some(advertisement) => self
                .coordinator
                .discovered_peripheral(advertisement.uuid)
                .await
                .map(BluetoothDevice::new),
            None => None,
        };
        self.coordinator.stop_scanning().await;
        device
    }

    async fn connect_device(
        &self, device: BluetoothDevice,
    ) -> Result<BluetoothDevice, BleError> {
        let id = device.peripheral.identifier();
        info!("Connecting to {}", id);
        self.coordinator.connect(id).await.map(BluetoothDevice::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertisement::AdvertisementPayload;
    use crate::ble::sim_central::SimulatedCentral;
    use crate::ble::ConnectionState;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    const WAIT: Duration = Duration::from_secs(2);

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[tokio::test]
    async fn test_select_then_connect() {
        init_logger();
        let (central, controller) = SimulatedCentral::auto_respond();
        let client = LiveCentralClient::new(central, SessionOptions::default(), 8);
        assert_eq!(client.enable().await, RadioState::PoweredOn);

        let id = Uuid::new_v4();
        controller.add_device(id, "Thermo");
        let mut adverts = client.start_scanning(ScanFilter::default()).await;
        controller.advertise(id, &AdvertisementPayload::new(), -55);
        let advertisement = timeout(WAIT, adverts.next()).await.unwrap().unwrap();

        let device = client.stop_scanning(Some(advertisement)).await.unwrap();
        assert_eq!(device.peripheral.identifier(), id);
        assert!(timeout(WAIT, adverts.next()).await.unwrap().is_none());

        let connected = client.connect_device(device).await.unwrap();
        assert_eq!(
            connected.peripheral.connection_state(),
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_stop_scanning_without_selection() {
        init_logger();
        let (central, _controller) = SimulatedCentral::auto_respond();
        let client = LiveCentralClient::new(central, SessionOptions::default(), 8);
        client.enable().await;

        let adverts = client.start_scanning(ScanFilter::default()).await;
        assert!(client.stop_scanning(None).await.is_none());
        assert!(timeout(WAIT, adverts.collect::<Vec<_>>()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disable_finishes_state_stream() {
        init_logger();
        let (central, controller) = SimulatedCentral::auto_respond();
        let client = LiveCentralClient::new(central, SessionOptions::default(), 8);
        client.enable().await;

        let states = client.get_state().await;
        controller.set_radio_state(RadioState::PoweredOff);
        client.disable().await;

        let states = timeout(WAIT, states.collect::<Vec<_>>()).await.unwrap();
        assert_eq!(states, vec![RadioState::PoweredOff]);
    }
}
